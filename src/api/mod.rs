//! API layer for the PDV sync service.
//!
//! Thin REST surface over the sync session operations; everything of
//! consequence happens in [`crate::session`] and [`crate::reconcile`].

mod error;
mod rest;
mod types;

pub use error::{ApiError, ErrorCode};
pub use rest::router;
pub use types::*;
