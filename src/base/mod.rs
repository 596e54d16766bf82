//! Base types and error handling.
//!
//! - [`error`]: catalog, resolver and identity error types
//! - [`context`]: extension traits attaching context to failures

pub mod context;
pub mod error;
