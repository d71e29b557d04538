//! Conflict-resolution policies and the field-merge algorithm.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::domain::Origin;

/// How the reconciler resolves a concurrent edit. Selected by the caller
/// per service instance; every conflict is reported regardless of policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Discard the client change; server state wins.
    #[default]
    ServerWins,
    /// Force the client payload over the server state.
    ClientWins,
    /// Merge at field granularity; see [`field_merge`].
    FieldMerge,
}

/// One side of a merge: who wrote it and when.
#[derive(Debug, Clone)]
pub struct MergeSide<'a> {
    pub payload: &'a Value,
    pub touched_at: DateTime<Utc>,
    pub origin: &'a Origin,
}

/// Deterministic field-level three-way merge.
///
/// Fields touched only by the client take the client value; fields touched
/// only by the server take the server value; fields touched by both resolve
/// by most-recent timestamp, ties by lexicographic origin-id ordering
/// (smaller id wins). The result is stable under replay and never drops a
/// field touched by only one side.
///
/// Non-object payloads cannot be merged per field and fall back to the
/// both-touched tiebreak for the whole value.
pub fn field_merge(base: &Value, server: MergeSide<'_>, client: MergeSide<'_>) -> Value {
    let (Value::Object(base_map), Value::Object(server_map), Value::Object(client_map)) =
        (base, server.payload, client.payload)
    else {
        return tiebreak(&server, &client).clone();
    };

    let mut merged = Map::new();
    let mut keys: Vec<&String> = base_map
        .keys()
        .chain(server_map.keys())
        .chain(client_map.keys())
        .collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        let b = base_map.get(key);
        let s = server_map.get(key);
        let c = client_map.get(key);

        let server_touched = s != b;
        let client_touched = c != b;

        let winner = match (server_touched, client_touched) {
            (false, false) => b,
            (true, false) => s,
            (false, true) => c,
            (true, true) => {
                if tiebreak_prefers_client(&server, &client) {
                    c
                } else {
                    s
                }
            }
        };

        // A winner of None means the winning side removed the field.
        if let Some(value) = winner {
            merged.insert(key.clone(), value.clone());
        }
    }

    Value::Object(merged)
}

fn tiebreak_prefers_client(server: &MergeSide<'_>, client: &MergeSide<'_>) -> bool {
    match client.touched_at.cmp(&server.touched_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => client.origin < server.origin,
    }
}

fn tiebreak<'a>(server: &MergeSide<'a>, client: &MergeSide<'a>) -> &'a Value {
    if tiebreak_prefers_client(server, client) {
        client.payload
    } else {
        server.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceId;
    use serde_json::json;

    fn side<'a>(payload: &'a Value, at: DateTime<Utc>, origin: &'a Origin) -> MergeSide<'a> {
        MergeSide {
            payload,
            touched_at: at,
            origin,
        }
    }

    #[test]
    fn one_side_touched_fields_always_survive() {
        let base = json!({"name": "Boutique A", "sector": "S1", "active": true});
        let server_payload = json!({"name": "Boutique A", "sector": "S2", "active": true});
        let client_payload = json!({"name": "Boutique A+", "sector": "S1", "active": true});

        let now = Utc::now();
        let server_origin = Origin::server();
        let client_origin = Origin::device(&DeviceId::new("device-a"));

        let merged = field_merge(
            &base,
            side(&server_payload, now, &server_origin),
            side(&client_payload, now, &client_origin),
        );
        assert_eq!(merged["sector"], "S2");
        assert_eq!(merged["name"], "Boutique A+");
        assert_eq!(merged["active"], true);
    }

    #[test]
    fn both_touched_resolves_by_timestamp() {
        let base = json!({"radius": 300.0});
        let server_payload = json!({"radius": 250.0});
        let client_payload = json!({"radius": 400.0});

        let earlier = Utc::now();
        let later = earlier + chrono::Duration::seconds(5);
        let server_origin = Origin::server();
        let client_origin = Origin::device(&DeviceId::new("device-a"));

        let client_newer = field_merge(
            &base,
            side(&server_payload, earlier, &server_origin),
            side(&client_payload, later, &client_origin),
        );
        assert_eq!(client_newer["radius"], 400.0);

        let server_newer = field_merge(
            &base,
            side(&server_payload, later, &server_origin),
            side(&client_payload, earlier, &client_origin),
        );
        assert_eq!(server_newer["radius"], 250.0);
    }

    #[test]
    fn equal_timestamps_break_by_origin_id() {
        let base = json!({"zone": "Z1"});
        let server_payload = json!({"zone": "Z2"});
        let client_payload = json!({"zone": "Z3"});

        let now = Utc::now();
        let server_origin = Origin::server();
        let client_origin = Origin::device(&DeviceId::new("device-a"));

        // "device-a" < "server", so the client wins the tie. Replaying the
        // same inputs yields the same result.
        let merged = field_merge(
            &base,
            side(&server_payload, now, &server_origin),
            side(&client_payload, now, &client_origin),
        );
        assert_eq!(merged["zone"], "Z3");

        let replay = field_merge(
            &base,
            side(&server_payload, now, &server_origin),
            side(&client_payload, now, &client_origin),
        );
        assert_eq!(merged, replay);
    }

    #[test]
    fn field_removed_by_one_side_stays_removed() {
        let base = json!({"name": "A", "note": "temp"});
        let server_payload = json!({"name": "A", "note": "temp"});
        let client_payload = json!({"name": "A"});

        let now = Utc::now();
        let server_origin = Origin::server();
        let client_origin = Origin::device(&DeviceId::new("device-a"));

        let merged = field_merge(
            &base,
            side(&server_payload, now, &server_origin),
            side(&client_payload, now, &client_origin),
        );
        assert!(merged.get("note").is_none());
    }

    #[test]
    fn fields_added_by_each_side_both_survive() {
        let base = json!({"name": "A"});
        let server_payload = json!({"name": "A", "channel": "General trade"});
        let client_payload = json!({"name": "A", "zone": "Z9"});

        let now = Utc::now();
        let server_origin = Origin::server();
        let client_origin = Origin::device(&DeviceId::new("device-b"));

        let merged = field_merge(
            &base,
            side(&server_payload, now, &server_origin),
            side(&client_payload, now, &client_origin),
        );
        assert_eq!(merged["channel"], "General trade");
        assert_eq!(merged["zone"], "Z9");
    }
}
