//! Tracking of in-flight async work.
//!
//! Every model call, tool call, message write and human wait is started as an
//! operation in an [`OperationRegistry`]. Operations nest under a parent,
//! inherit its context, and are cancelled together with it.

pub mod errors;
pub mod registry;
pub mod types;

pub use errors::*;
pub use registry::*;
pub use types::*;
