pub mod state;
pub mod store;

pub use state::{
    Attachment, Checkpoint, CheckpointType, Metrics, Phase, ResumePoint, TaskState, TaskStatus,
    WorkflowState, WorkflowStatus,
};
pub use store::{FileStateManager, StateManager, WorkflowLock};
