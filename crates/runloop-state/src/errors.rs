use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}
