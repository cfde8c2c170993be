//! Conversation runtime for pacer.
//!
//! Inbound fragments are debounced by [`buffer::MessageBuffer`] into one
//! batch per pause; [`orchestrator::ConversationOrchestrator`] answers each
//! batch through a [`llm::Responder`] and delivers it with human-like timing
//! over a [`transport::MessageTransport`]. Deferred work (follow-ups, meeting
//! reminders) lives in the action store and is driven by
//! [`scheduler::PollingScheduler`], which hands due actions back to the
//! orchestrator.

pub mod buffer;
pub mod llm;
pub mod orchestrator;
pub mod scheduler;
pub mod transport;

pub use buffer::{BufferError, MessageBuffer};
pub use llm::{
    responder_from_config, ConversationContext, EchoResponder, HttpResponder, Responder,
    ResponderError,
};
pub use orchestrator::{BatchOutcome, ConversationOrchestrator, OrchestratorError};
pub use scheduler::{
    ActionExecutor, BackoffPolicy, ExecutionFailure, PollReport, PollingScheduler,
    SchedulerSettings,
};
pub use transport::{DeliveryTiming, LoggingTransport, MessageTransport, SendReceipt, TransportError};
