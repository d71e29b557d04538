//! Field agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FieldError;

/// A field agent (merchandiser) assigned to a set of sectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    /// Sectors this agent covers; PDV assignment is resolved through these.
    pub sectors: Vec<String>,
    pub active: bool,

    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.id.is_nil() {
            errors.push(FieldError::new("id", "must not be nil"));
        }
        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "must not be empty"));
        }
        errors
    }
}
