//! kill-hogs common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the workspace:
//! - Process and account identity types
//! - The unified error type with stable codes and categories

pub mod error;
pub mod id;

pub use error::{Error, ErrorCategory, Result, StructuredError};
pub use id::{Account, ProcessId, SUPERUSER_UID};
