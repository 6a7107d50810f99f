pub mod notifier;
pub mod workflow;

pub use notifier::{LogNotifier, NotifyError, UserNotifier, WebhookNotifier};
pub use workflow::{
    StepError, TransferSettings, TransferWorkflow, WorkflowOutcome, WorkflowStep,
    NOTIFICATION_SUBJECT,
};
