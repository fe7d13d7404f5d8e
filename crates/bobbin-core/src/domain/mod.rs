//! Domain model (ids, task states, wire message).

pub mod ids;
pub mod message;
pub mod state;

pub use ids::{FileId, Id, IdMarker, MessageId, ParseIdError, TaskId};
pub use message::{CANCELLED, TaskMessage};
pub use state::State;
