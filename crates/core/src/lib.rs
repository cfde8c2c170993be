pub mod config;
pub mod domain;
pub mod errors;
pub mod pause;
pub mod scheduling;
pub mod timing;

pub use domain::action::{
    ActionPayload, ActionStatus, ActionType, ScheduledAction, ScheduledActionId,
};
pub use domain::message::{MessageBatch, MessageFragment};
pub use domain::prospect::{ConversationId, Prospect, ProspectStatus};
pub use errors::{ApplicationError, DomainError, InterfaceError, ValidationError};
pub use pause::{PauseDetector, PauseVerdict};
pub use scheduling::{NewScheduledAction, ValidatedAction};
pub use timing::{DelayMode, NaturalTiming, TimingProfile};
