//! Event-bus protocol shared by the pipeline and its consumers.
//!
//! Every pipeline event carries the identity of the run that produced it.
//! Consumers track the latest `RunStarted` identity and drop anything else.

use crate::classifier_adapter::{IdentificationError, Subject};
use crate::color_analyzer::ThemeColors;
use crate::knowledge_client::KnowledgeError;

/// Monotonically increasing identity of one pipeline invocation.
pub type RunId = u64;

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Pipeline(PipelineMessage),
}

/// Pipeline notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineMessage {
    /// Sent by the trigger path before any stage work begins.
    RunStarted { run_id: RunId },
    Event(PipelineEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEvent {
    pub run_id: RunId,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Title(TitleUpdate),
    Summary(SummaryUpdate),
    Theme(ThemeColors),
    /// Terminal outcome; at most one per run.
    Finished(RunOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TitleUpdate {
    Subject(Subject),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SummaryUpdate {
    /// Article extract; an empty string is a valid extract.
    Extract(String),
    Error(String),
}

/// States a run moves through, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    Idle,
    Classifying,
    Resolving,
    FetchingThumbnail,
    Theming,
    Done,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("identification failed: {0}")]
    IdentificationFailed(IdentificationError),
    #[error("lookup failed: {0}")]
    LookupFailed(KnowledgeError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Reached `Done`; `themed` is false when no theme could be derived.
    Done { themed: bool },
    Failed(FailureReason),
    /// A newer run became active; nothing further was emitted after `stage`.
    Superseded { stage: PipelineStage },
}
