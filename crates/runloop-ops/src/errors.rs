use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("operation not found: {0}")]
    NotFound(String),
}
