//! Bus consumer that keeps the presentation state for the active run.

use log::{debug, info, warn};
use tokio::sync::broadcast::{error::RecvError, Receiver};

use crate::color_analyzer::ThemeColors;
use crate::protocol::{
    EventPayload, Message, PipelineMessage, RunId, RunOutcome, SummaryUpdate, TitleUpdate,
};

/// What a front end should currently show.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresentationState {
    pub active_run: Option<RunId>,
    pub title: Option<String>,
    pub title_is_error: bool,
    pub summary: Option<String>,
    pub summary_is_error: bool,
    pub theme: Option<ThemeColors>,
    pub outcome: Option<RunOutcome>,
}

impl PresentationState {
    /// Applies one pipeline message. Returns false when the message belongs
    /// to a run other than the latest started one and was ignored.
    pub fn apply(&mut self, message: &PipelineMessage) -> bool {
        match message {
            PipelineMessage::RunStarted { run_id } => {
                *self = Self {
                    active_run: Some(*run_id),
                    ..Self::default()
                };
                true
            }
            PipelineMessage::Event(event) => {
                if self.active_run != Some(event.run_id) {
                    debug!(
                        "Presentation: dropping event from run {} (active: {:?})",
                        event.run_id, self.active_run
                    );
                    return false;
                }
                match &event.payload {
                    EventPayload::Title(TitleUpdate::Subject(subject)) => {
                        self.title = Some(subject.to_string());
                        self.title_is_error = false;
                    }
                    EventPayload::Title(TitleUpdate::Error(message)) => {
                        self.title = Some(message.clone());
                        self.title_is_error = true;
                    }
                    EventPayload::Summary(SummaryUpdate::Extract(extract)) => {
                        self.summary = Some(extract.clone());
                        self.summary_is_error = false;
                    }
                    EventPayload::Summary(SummaryUpdate::Error(message)) => {
                        self.summary = Some(message.clone());
                        self.summary_is_error = true;
                    }
                    EventPayload::Theme(theme) => self.theme = Some(*theme),
                    EventPayload::Finished(outcome) => self.outcome = Some(outcome.clone()),
                }
                true
            }
        }
    }
}

pub struct PresentationManager {
    bus_receiver: Receiver<Message>,
    state: PresentationState,
}

impl PresentationManager {
    pub fn new(bus_receiver: Receiver<Message>) -> Self {
        Self {
            bus_receiver,
            state: PresentationState::default(),
        }
    }

    /// Consumes the bus until every sender is gone, then returns the final state.
    pub fn run(mut self) -> PresentationState {
        loop {
            match self.bus_receiver.blocking_recv() {
                Ok(Message::Pipeline(message)) => {
                    if self.state.apply(&message) {
                        log_applied(&message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Presentation: lagged behind bus, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.state
    }
}

fn log_applied(message: &PipelineMessage) {
    match message {
        PipelineMessage::RunStarted { run_id } => info!("Presentation: tracking run {}", run_id),
        PipelineMessage::Event(event) => match &event.payload {
            EventPayload::Title(TitleUpdate::Subject(subject)) => {
                info!("Presentation: title '{}'", subject)
            }
            EventPayload::Theme(theme) => info!(
                "Presentation: theme {} on {}",
                theme.foreground.to_hex(),
                theme.background.to_hex()
            ),
            other => debug!("Presentation: applied {:?}", other),
        },
    }
}
