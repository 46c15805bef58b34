//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those models.
//!
//! External modules should import from `bulk_courier::db` — we re-export the
//! repository API and the view models used by callers.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{
    BatchForDispatch, BatchRow, FailureRow, NewBatch, NewRecipient, RecipientForDispatch,
    RecipientRow, TemplateRow, UserWithLease,
};
