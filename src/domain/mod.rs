//! Domain models for the sync core.
//!
//! Canonical entities (`PointOfSale`, `Visit`, `Agent`), the change-record
//! envelope that carries them between devices and the server, and the
//! per-device sync cursor.

mod agent;
mod change;
mod pdv;
mod visit;

pub use agent::*;
pub use change::*;
pub use pdv::*;
pub use visit::*;
