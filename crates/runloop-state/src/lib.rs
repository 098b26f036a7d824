//! Serializable data model for agent runs.
//!
//! Everything an agent run needs to be persisted and resumed lives here: the run
//! state, the transcript messages, usage and cost counters, the instruction and
//! event vocabularies, checkpoints, and the clock used to stamp revisions.

pub mod checkpoint;
pub mod clock;
pub mod errors;
pub mod event;
pub mod instruction;
pub mod message;
pub mod state;
pub mod usage;

pub use checkpoint::*;
pub use clock::*;
pub use errors::*;
pub use event::*;
pub use instruction::*;
pub use message::*;
pub use state::*;
pub use usage::*;
