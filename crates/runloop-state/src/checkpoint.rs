use crate::{AgentRunState, Instruction, StateError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub schema_version: u32,
    pub session_id: String,
    pub saved_at: String,
}

/// A resumable snapshot: the run state plus the instructions still queued
/// when it was taken.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub metadata: CheckpointMetadata,
    pub state: AgentRunState,
    #[serde(default)]
    pub pending_instructions: Vec<Instruction>,
}

impl RunCheckpoint {
    pub fn new(state: AgentRunState, pending_instructions: Vec<Instruction>) -> Self {
        Self {
            metadata: CheckpointMetadata {
                schema_version: CHECKPOINT_SCHEMA_VERSION,
                session_id: state.session_id.clone(),
                saved_at: state.last_modified.clone(),
            },
            state,
            pending_instructions,
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| {
                StateError::Checkpoint(format!(
                    "failed to create checkpoint parent directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            StateError::Checkpoint(format!("failed to serialize checkpoint: {error}"))
        })?;

        fs::write(path, bytes).map_err(|error| {
            StateError::Checkpoint(format!(
                "failed writing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, StateError> {
        let bytes = fs::read(path).map_err(|error| {
            StateError::Checkpoint(format!(
                "failed reading checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })?;
        let checkpoint: Self = serde_json::from_slice(&bytes).map_err(|error| {
            StateError::Checkpoint(format!(
                "failed deserializing checkpoint file '{}': {}",
                path.display(),
                error
            ))
        })?;
        if checkpoint.metadata.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(StateError::Checkpoint(format!(
                "unsupported checkpoint schema version {}",
                checkpoint.metadata.schema_version
            )));
        }
        Ok(checkpoint)
    }
}
