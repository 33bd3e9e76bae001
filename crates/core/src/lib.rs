//! `conductor-core`: identifiers and validation errors.
//!
//! This crate has no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ProcessId, TenantId, WorkerId};
