//! 单轮执行：事件日志与执行协调器

pub mod coordinator;
pub mod event_log;

pub use coordinator::{
    running_marker_key, ConversationStatus, CoordinatorSettings, ExecutionCoordinator, ResumeRequest,
};
pub use event_log::{event_log_key, EventLog, Sequencer, TurnEvent};
