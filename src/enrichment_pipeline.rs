//! Orchestrates classification, knowledge lookup, thumbnail fetch, and theming.
//!
//! Each trigger starts a new run with a fresh identity and makes it the active
//! one. Stage work runs on the blocking pool; the run task awaits each stage
//! and, before acting on its result, checks that it is still the active run.
//! A superseded run is never aborted. It stops at its next stage boundary
//! without emitting anything further.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::broadcast::Sender;
use tokio::task::JoinHandle;

use crate::classifier_adapter::{ClassifierAdapter, IdentificationError};
use crate::color_analyzer::{average_color, Color, ThemeColors};
use crate::config::ThemeConfig;
use crate::image_pipeline::{FetchError, ThumbnailFetcher};
use crate::knowledge_client::{KnowledgeError, KnowledgeSource};
use crate::protocol::{
    EventPayload, FailureReason, Message, PipelineEvent, PipelineMessage, PipelineStage, RunId,
    RunOutcome, SummaryUpdate, TitleUpdate,
};

/// External capabilities the pipeline drives.
pub struct PipelineCollaborators {
    pub classifier: ClassifierAdapter,
    pub knowledge: Box<dyn KnowledgeSource>,
    pub thumbnails: Box<dyn ThumbnailFetcher>,
}

struct PipelineShared {
    collaborators: PipelineCollaborators,
    theme: ThemeConfig,
    active_run: AtomicU64,
    bus_producer: Sender<Message>,
}

impl PipelineShared {
    fn is_active(&self, run_id: RunId) -> bool {
        self.active_run.load(Ordering::SeqCst) == run_id
    }

    fn emit(&self, run_id: RunId, payload: EventPayload) {
        let _ = self
            .bus_producer
            .send(Message::Pipeline(PipelineMessage::Event(PipelineEvent {
                run_id,
                payload,
            })));
    }
}

/// Per-run bookkeeping owned by the run task.
struct PipelineRun {
    id: RunId,
    stage: PipelineStage,
}

impl PipelineRun {
    fn new(id: RunId) -> Self {
        Self {
            id,
            stage: PipelineStage::Idle,
        }
    }

    fn advance(&mut self, next: PipelineStage) {
        debug!("Run {}: {:?} -> {:?}", self.id, self.stage, next);
        self.stage = next;
    }

    fn superseded(self) -> RunOutcome {
        debug!(
            "Run {}: superseded during {:?}, discarding result",
            self.id, self.stage
        );
        RunOutcome::Superseded { stage: self.stage }
    }

    fn fail(mut self, shared: &PipelineShared, reason: FailureReason) -> RunOutcome {
        warn!("Run {}: {}", self.id, reason);
        self.advance(PipelineStage::Failed(reason.clone()));
        let outcome = RunOutcome::Failed(reason);
        shared.emit(self.id, EventPayload::Finished(outcome.clone()));
        outcome
    }

    fn finish(mut self, shared: &PipelineShared, themed: bool) -> RunOutcome {
        self.advance(PipelineStage::Done);
        info!("Run {}: done (themed: {})", self.id, themed);
        let outcome = RunOutcome::Done { themed };
        shared.emit(self.id, EventPayload::Finished(outcome.clone()));
        outcome
    }
}

/// Handle to one triggered run.
pub struct PipelineRunHandle {
    pub run_id: RunId,
    join: JoinHandle<RunOutcome>,
}

impl PipelineRunHandle {
    /// Waits for the run to end; `None` if its task panicked or was cancelled.
    pub async fn outcome(self) -> Option<RunOutcome> {
        match self.join.await {
            Ok(outcome) => Some(outcome),
            Err(error) => {
                warn!("Run {}: task ended abnormally: {}", self.run_id, error);
                None
            }
        }
    }
}

/// Single-writer owner of the active run identity.
pub struct EnrichmentPipeline {
    shared: Arc<PipelineShared>,
    runtime: Handle,
    last_run_id: RunId,
}

impl EnrichmentPipeline {
    pub fn new(
        collaborators: PipelineCollaborators,
        theme: ThemeConfig,
        bus_producer: Sender<Message>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                collaborators,
                theme,
                active_run: AtomicU64::new(0),
                bus_producer,
            }),
            runtime,
            last_run_id: 0,
        }
    }

    /// Identity of the run whose events currently apply; 0 before the first trigger.
    pub fn active_run(&self) -> RunId {
        self.shared.active_run.load(Ordering::SeqCst)
    }

    /// Starts a run for `image`, superseding any run still in flight.
    pub fn trigger(&mut self, image: DynamicImage) -> PipelineRunHandle {
        self.last_run_id += 1;
        let run_id = self.last_run_id;
        self.shared.active_run.store(run_id, Ordering::SeqCst);
        info!("Run {}: started", run_id);
        let _ = self
            .shared
            .bus_producer
            .send(Message::Pipeline(PipelineMessage::RunStarted { run_id }));

        let shared = Arc::clone(&self.shared);
        let join = self
            .runtime
            .spawn(async move { execute_run(shared, run_id, image).await });
        PipelineRunHandle { run_id, join }
    }
}

async fn execute_run(shared: Arc<PipelineShared>, run_id: RunId, image: DynamicImage) -> RunOutcome {
    let mut run = PipelineRun::new(run_id);

    run.advance(PipelineStage::Classifying);
    let stage_shared = Arc::clone(&shared);
    let identification = tokio::task::spawn_blocking(move || {
        stage_shared.collaborators.classifier.identify(&image)
    })
    .await
    .unwrap_or_else(|error| {
        Err(IdentificationError::InferenceFailed(format!(
            "classification task failed: {error}"
        )))
    });
    if !shared.is_active(run_id) {
        return run.superseded();
    }
    let subject = match identification {
        Ok(subject) => subject,
        Err(error) => {
            shared.emit(run_id, EventPayload::Title(TitleUpdate::Error(error.to_string())));
            return run.fail(&shared, FailureReason::IdentificationFailed(error));
        }
    };
    info!("Run {}: identified '{}'", run_id, subject);
    shared.emit(run_id, EventPayload::Title(TitleUpdate::Subject(subject.clone())));

    run.advance(PipelineStage::Resolving);
    let stage_shared = Arc::clone(&shared);
    let lookup = tokio::task::spawn_blocking(move || {
        stage_shared.collaborators.knowledge.lookup(&subject)
    })
    .await
    .unwrap_or_else(|error| {
        Err(KnowledgeError::NetworkError(format!(
            "lookup task failed: {error}"
        )))
    });
    if !shared.is_active(run_id) {
        return run.superseded();
    }
    let summary = match lookup {
        Ok(summary) => summary,
        Err(error) => {
            shared.emit(
                run_id,
                EventPayload::Summary(SummaryUpdate::Error(error.to_string())),
            );
            return run.fail(&shared, FailureReason::LookupFailed(error));
        }
    };
    shared.emit(
        run_id,
        EventPayload::Summary(SummaryUpdate::Extract(summary.extract)),
    );

    let Some(thumbnail_url) = summary.thumbnail_url else {
        debug!("Run {}: article has no thumbnail, skipping theme", run_id);
        return run.finish(&shared, false);
    };

    run.advance(PipelineStage::FetchingThumbnail);
    let stage_shared = Arc::clone(&shared);
    let fetched = tokio::task::spawn_blocking(move || {
        stage_shared.collaborators.thumbnails.fetch_image(&thumbnail_url)
    })
    .await
    .unwrap_or(Err(FetchError::Decode));
    if !shared.is_active(run_id) {
        return run.superseded();
    }
    let thumbnail = match fetched {
        Ok(thumbnail) => thumbnail,
        Err(error) => {
            warn!("Run {}: no theme applied: {}", run_id, error);
            return run.finish(&shared, false);
        }
    };

    run.advance(PipelineStage::Theming);
    let background: Option<Color> =
        tokio::task::spawn_blocking(move || average_color(&thumbnail))
            .await
            .ok();
    if !shared.is_active(run_id) {
        return run.superseded();
    }
    let Some(background) = background else {
        warn!("Run {}: no theme applied: color analysis failed", run_id);
        return run.finish(&shared, false);
    };
    let theme = ThemeColors::from_background(
        background,
        shared.theme.lighten_fraction,
        shared.theme.prefer_flat,
    );
    debug!(
        "Run {}: theme background {} foreground {} light {}",
        run_id,
        theme.background.to_hex(),
        theme.foreground.to_hex(),
        theme.background_light.to_hex()
    );
    shared.emit(run_id, EventPayload::Theme(theme));
    run.finish(&shared, true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};

    use image::{DynamicImage, Rgba, RgbaImage};
    use serde_json::{json, Value};
    use tokio::sync::broadcast;

    use super::{EnrichmentPipeline, PipelineCollaborators};
    use crate::classifier_adapter::{
        ClassificationModel, ClassifierAdapter, IdentificationError, ModelError, Subject,
    };
    use crate::color_analyzer::{Color, ThemeColors};
    use crate::config::{KnowledgeConfig, ThemeConfig};
    use crate::http_transport::{JsonTransport, TransportError};
    use crate::image_pipeline::{FetchError, ThumbnailFetcher};
    use crate::knowledge_client::{
        ArticleSummary, KnowledgeClient, KnowledgeError, KnowledgeSource,
    };
    use crate::presentation::PresentationState;
    use crate::protocol::{
        EventPayload, FailureReason, Message, PipelineMessage, PipelineStage, RunId, RunOutcome,
        SummaryUpdate, TitleUpdate,
    };

    /// Reads the label to report from the image's top-left red channel.
    struct PixelKeyedModel {
        labels: HashMap<u8, Result<Vec<(String, f32)>, ModelError>>,
    }

    impl ClassificationModel for PixelKeyedModel {
        fn infer(&self, image: &DynamicImage) -> Result<Vec<(String, f32)>, ModelError> {
            let key = image.to_rgba8().get_pixel(0, 0).0[0];
            self.labels
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct Gate {
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    struct ScriptedKnowledge {
        articles: HashMap<String, Result<ArticleSummary, KnowledgeError>>,
        gates: HashMap<String, Gate>,
        calls: Arc<AtomicUsize>,
    }

    impl KnowledgeSource for ScriptedKnowledge {
        fn lookup(&self, subject: &Subject) -> Result<ArticleSummary, KnowledgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gates.get(subject.as_str()) {
                let _ = gate.entered.send(());
                let _ = gate.release.lock().expect("gate lock").recv();
            }
            self.articles
                .get(subject.as_str())
                .cloned()
                .unwrap_or(Err(KnowledgeError::NoArticle))
        }
    }

    struct ScriptedThumbnails {
        result: Result<DynamicImage, FetchError>,
        gate: Option<Gate>,
    }

    impl ThumbnailFetcher for ScriptedThumbnails {
        fn fetch_image(&self, _url: &str) -> Result<DynamicImage, FetchError> {
            if let Some(gate) = self.gate.as_ref() {
                let _ = gate.entered.send(());
                let _ = gate.release.lock().expect("gate lock").recv();
            }
            self.result.clone()
        }
    }

    /// Answers every knowledge request with the same JSON document.
    struct CannedJson(Value);

    impl JsonTransport for CannedJson {
        fn get_json(&self, _url: &str) -> Result<Value, TransportError> {
            Ok(self.0.clone())
        }
    }

    fn photo(key: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([key, 0, 0, 255])))
    }

    fn labels(values: &[(&str, f32)]) -> Result<Vec<(String, f32)>, ModelError> {
        Ok(values
            .iter()
            .map(|(label, confidence)| (label.to_string(), *confidence))
            .collect())
    }

    fn article(extract: &str, thumbnail_url: Option<&str>) -> Result<ArticleSummary, KnowledgeError> {
        Ok(ArticleSummary {
            page_id: "736".to_string(),
            extract: extract.to_string(),
            thumbnail_url: thumbnail_url.map(str::to_string),
        })
    }

    struct Harness {
        pipeline: EnrichmentPipeline,
        bus: broadcast::Receiver<Message>,
        knowledge_calls: Arc<AtomicUsize>,
    }

    fn harness(
        model_labels: Vec<(u8, Result<Vec<(String, f32)>, ModelError>)>,
        articles: Vec<(&str, Result<ArticleSummary, KnowledgeError>)>,
        gates: Vec<(&str, Gate)>,
        thumbnail: Result<DynamicImage, FetchError>,
    ) -> Harness {
        let thumbnails = ScriptedThumbnails {
            result: thumbnail,
            gate: None,
        };
        harness_with_thumbnails(model_labels, articles, gates, thumbnails)
    }

    fn harness_with_thumbnails(
        model_labels: Vec<(u8, Result<Vec<(String, f32)>, ModelError>)>,
        articles: Vec<(&str, Result<ArticleSummary, KnowledgeError>)>,
        gates: Vec<(&str, Gate)>,
        thumbnails: ScriptedThumbnails,
    ) -> Harness {
        let (bus_sender, bus) = broadcast::channel(64);
        let knowledge_calls = Arc::new(AtomicUsize::new(0));
        let collaborators = PipelineCollaborators {
            classifier: ClassifierAdapter::new(
                Box::new(PixelKeyedModel {
                    labels: model_labels.into_iter().collect(),
                }),
                0.0,
            ),
            knowledge: Box::new(ScriptedKnowledge {
                articles: articles
                    .into_iter()
                    .map(|(title, result)| (title.to_string(), result))
                    .collect(),
                gates: gates
                    .into_iter()
                    .map(|(title, gate)| (title.to_string(), gate))
                    .collect(),
                calls: Arc::clone(&knowledge_calls),
            }),
            thumbnails: Box::new(thumbnails),
        };
        let pipeline = EnrichmentPipeline::new(
            collaborators,
            ThemeConfig::default(),
            bus_sender,
            tokio::runtime::Handle::current(),
        );
        Harness {
            pipeline,
            bus,
            knowledge_calls,
        }
    }

    /// Pipeline whose lookups go through a real `KnowledgeClient`.
    fn pipeline_over_json(response: Value) -> (EnrichmentPipeline, broadcast::Receiver<Message>) {
        let (bus_sender, bus) = broadcast::channel(64);
        let knowledge_config = KnowledgeConfig {
            min_request_interval_ms: 0,
            ..KnowledgeConfig::default()
        };
        let collaborators = PipelineCollaborators {
            classifier: ClassifierAdapter::new(
                Box::new(PixelKeyedModel {
                    labels: [(1, labels(&[("sunflower", 0.95)]))].into_iter().collect(),
                }),
                0.0,
            ),
            knowledge: Box::new(KnowledgeClient::new(
                Box::new(CannedJson(response)),
                &knowledge_config,
            )),
            thumbnails: Box::new(ScriptedThumbnails {
                result: Err(FetchError::Decode),
                gate: None,
            }),
        };
        let pipeline = EnrichmentPipeline::new(
            collaborators,
            ThemeConfig::default(),
            bus_sender,
            tokio::runtime::Handle::current(),
        );
        (pipeline, bus)
    }

    fn drain(bus: &mut broadcast::Receiver<Message>) -> Vec<PipelineMessage> {
        let mut messages = Vec::new();
        while let Ok(Message::Pipeline(message)) = bus.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn payloads_for(messages: &[PipelineMessage], run_id: RunId) -> Vec<EventPayload> {
        messages
            .iter()
            .filter_map(|message| match message {
                PipelineMessage::Event(event) if event.run_id == run_id => {
                    Some(event.payload.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn sunflower() -> Subject {
        Subject::from_label("sunflower").expect("subject")
    }

    #[tokio::test]
    async fn test_empty_classification_fails_without_lookup() {
        let mut h = harness(
            vec![(1, labels(&[]))],
            Vec::new(),
            Vec::new(),
            Err(FetchError::Decode),
        );
        let handle = h.pipeline.trigger(photo(1));
        let run_id = handle.run_id;
        let outcome = handle.outcome().await;

        let reason = FailureReason::IdentificationFailed(IdentificationError::NotIdentified);
        assert_eq!(outcome, Some(RunOutcome::Failed(reason.clone())));
        assert_eq!(h.knowledge_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            payloads_for(&drain(&mut h.bus), run_id),
            vec![
                EventPayload::Title(TitleUpdate::Error("Could not identify image.".to_string())),
                EventPayload::Finished(RunOutcome::Failed(reason)),
            ]
        );
    }

    #[tokio::test]
    async fn test_model_error_surfaces_as_title_error() {
        let mut h = harness(
            vec![(1, Err(ModelError::Unavailable("weights missing".to_string())))],
            Vec::new(),
            Vec::new(),
            Err(FetchError::Decode),
        );
        let outcome = h.pipeline.trigger(photo(1)).outcome().await;
        assert!(matches!(
            outcome,
            Some(RunOutcome::Failed(FailureReason::IdentificationFailed(
                IdentificationError::ModelUnavailable(_)
            )))
        ));
        assert_eq!(h.knowledge_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extract_without_thumbnail_finishes_unthemed() {
        let mut h = harness(
            vec![(1, labels(&[("sunflower", 0.95), ("daisy", 0.02)]))],
            vec![("Sunflower", article("A sunflower is...", None))],
            Vec::new(),
            Err(FetchError::Decode),
        );
        let handle = h.pipeline.trigger(photo(1));
        let run_id = handle.run_id;
        assert_eq!(
            handle.outcome().await,
            Some(RunOutcome::Done { themed: false })
        );
        assert_eq!(
            payloads_for(&drain(&mut h.bus), run_id),
            vec![
                EventPayload::Title(TitleUpdate::Subject(sunflower())),
                EventPayload::Summary(SummaryUpdate::Extract("A sunflower is...".to_string())),
                EventPayload::Finished(RunOutcome::Done { themed: false }),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_article_fails_lookup_with_summary_error() {
        let mut h = harness(
            vec![(1, labels(&[("sunflower", 0.95)]))],
            vec![("Sunflower", Err(KnowledgeError::NoArticle))],
            Vec::new(),
            Err(FetchError::Decode),
        );
        let handle = h.pipeline.trigger(photo(1));
        let run_id = handle.run_id;
        let reason = FailureReason::LookupFailed(KnowledgeError::NoArticle);
        assert_eq!(handle.outcome().await, Some(RunOutcome::Failed(reason.clone())));
        assert_eq!(
            payloads_for(&drain(&mut h.bus), run_id),
            vec![
                EventPayload::Title(TitleUpdate::Subject(sunflower())),
                EventPayload::Summary(SummaryUpdate::Error("No matching article found.".to_string())),
                EventPayload::Finished(RunOutcome::Failed(reason)),
            ]
        );
    }

    #[tokio::test]
    async fn test_thumbnail_success_emits_theme_in_stage_order() {
        let thumbnail = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([250, 210, 40, 255])));
        let mut h = harness(
            vec![(1, labels(&[("sunflower", 0.95)]))],
            vec![(
                "Sunflower",
                article("A sunflower is...", Some("https://upload.example/sunflower.jpg")),
            )],
            Vec::new(),
            Ok(thumbnail),
        );
        let handle = h.pipeline.trigger(photo(1));
        let run_id = handle.run_id;
        assert_eq!(handle.outcome().await, Some(RunOutcome::Done { themed: true }));

        let background = Color::from_rgb_u8(250, 210, 40);
        let expected_theme = ThemeColors::from_background(background, 0.2, true);
        let payloads = payloads_for(&drain(&mut h.bus), run_id);
        assert_eq!(payloads.len(), 4);
        assert_eq!(payloads[0], EventPayload::Title(TitleUpdate::Subject(sunflower())));
        assert_eq!(
            payloads[1],
            EventPayload::Summary(SummaryUpdate::Extract("A sunflower is...".to_string()))
        );
        let EventPayload::Theme(theme) = &payloads[2] else {
            panic!("expected theme event, got {:?}", payloads[2]);
        };
        assert_eq!(theme.background.to_hex(), expected_theme.background.to_hex());
        assert_eq!(theme.foreground, Color::FLAT_BLACK);
        assert_eq!(
            theme.background_light.to_hex(),
            expected_theme.background_light.to_hex()
        );
        assert_eq!(payloads[3], EventPayload::Finished(RunOutcome::Done { themed: true }));
    }

    #[tokio::test]
    async fn test_thumbnail_failure_finishes_without_theme() {
        let mut h = harness(
            vec![(1, labels(&[("sunflower", 0.95)]))],
            vec![(
                "Sunflower",
                article("A sunflower is...", Some("https://upload.example/sunflower.jpg")),
            )],
            Vec::new(),
            Err(FetchError::UnsupportedFormat),
        );
        let handle = h.pipeline.trigger(photo(1));
        let run_id = handle.run_id;
        assert_eq!(handle.outcome().await, Some(RunOutcome::Done { themed: false }));
        let payloads = payloads_for(&drain(&mut h.bus), run_id);
        assert!(!payloads
            .iter()
            .any(|payload| matches!(payload, EventPayload::Theme(_))));
        assert_eq!(
            payloads.last(),
            Some(&EventPayload::Finished(RunOutcome::Done { themed: false }))
        );
    }

    #[tokio::test]
    async fn test_new_trigger_supersedes_run_awaiting_lookup() {
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut h = harness(
            vec![
                (1, labels(&[("sunflower", 0.95)])),
                (2, labels(&[("rose", 0.9)])),
            ],
            vec![
                ("Sunflower", article("A sunflower is...", None)),
                ("Rose", article("A rose is...", None)),
            ],
            vec![(
                "Sunflower",
                Gate {
                    entered: entered_tx,
                    release: Mutex::new(release_rx),
                },
            )],
            Err(FetchError::Decode),
        );

        let run_a = h.pipeline.trigger(photo(1));
        let run_a_id = run_a.run_id;
        entered_rx.recv().await.expect("run A should reach the lookup");

        let run_b = h.pipeline.trigger(photo(2));
        let run_b_id = run_b.run_id;
        assert!(run_b_id > run_a_id);
        assert_eq!(h.pipeline.active_run(), run_b_id);
        assert_eq!(run_b.outcome().await, Some(RunOutcome::Done { themed: false }));

        release_tx.send(()).expect("release run A");
        assert_eq!(
            run_a.outcome().await,
            Some(RunOutcome::Superseded {
                stage: PipelineStage::Resolving
            })
        );

        let messages = drain(&mut h.bus);
        let run_b_start = messages
            .iter()
            .position(|message| *message == PipelineMessage::RunStarted { run_id: run_b_id })
            .expect("run B start should be on the bus");
        assert!(!messages[run_b_start..].iter().any(|message| matches!(
            message,
            PipelineMessage::Event(event) if event.run_id == run_a_id
        )));
        assert_eq!(
            payloads_for(&messages, run_b_id),
            vec![
                EventPayload::Title(TitleUpdate::Subject(
                    Subject::from_label("rose").expect("subject")
                )),
                EventPayload::Summary(SummaryUpdate::Extract("A rose is...".to_string())),
                EventPayload::Finished(RunOutcome::Done { themed: false }),
            ]
        );

        let mut presentation = PresentationState::default();
        for message in &messages {
            presentation.apply(message);
        }
        assert_eq!(presentation.active_run, Some(run_b_id));
        assert_eq!(presentation.title.as_deref(), Some("Rose"));
        assert_eq!(presentation.summary.as_deref(), Some("A rose is..."));
    }

    #[tokio::test]
    async fn test_wire_response_with_extract_finishes_unthemed() {
        let (mut pipeline, mut bus) = pipeline_over_json(json!({
            "batchcomplete": "",
            "query": {
                "pageids": ["736"],
                "pages": { "736": { "pageid": 736, "title": "Sunflower", "extract": "A sunflower is..." } }
            }
        }));
        let handle = pipeline.trigger(photo(1));
        let run_id = handle.run_id;
        assert_eq!(handle.outcome().await, Some(RunOutcome::Done { themed: false }));
        assert_eq!(
            payloads_for(&drain(&mut bus), run_id),
            vec![
                EventPayload::Title(TitleUpdate::Subject(sunflower())),
                EventPayload::Summary(SummaryUpdate::Extract("A sunflower is...".to_string())),
                EventPayload::Finished(RunOutcome::Done { themed: false }),
            ]
        );
    }

    #[tokio::test]
    async fn test_wire_response_without_pages_fails_lookup() {
        let (mut pipeline, mut bus) = pipeline_over_json(json!({
            "query": { "pageids": [], "pages": {} }
        }));
        let handle = pipeline.trigger(photo(1));
        let run_id = handle.run_id;
        let reason = FailureReason::LookupFailed(KnowledgeError::NoArticle);
        assert_eq!(handle.outcome().await, Some(RunOutcome::Failed(reason.clone())));
        assert_eq!(
            payloads_for(&drain(&mut bus), run_id),
            vec![
                EventPayload::Title(TitleUpdate::Subject(sunflower())),
                EventPayload::Summary(SummaryUpdate::Error("No matching article found.".to_string())),
                EventPayload::Finished(RunOutcome::Failed(reason)),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_superseded_while_fetching_thumbnail_emits_no_theme() {
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = mpsc::channel();
        let thumbnail = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([250, 210, 40, 255])));
        let mut h = harness_with_thumbnails(
            vec![
                (1, labels(&[("sunflower", 0.95)])),
                (2, labels(&[("rose", 0.9)])),
            ],
            vec![
                (
                    "Sunflower",
                    article("A sunflower is...", Some("https://upload.example/sunflower.jpg")),
                ),
                ("Rose", article("A rose is...", None)),
            ],
            Vec::new(),
            ScriptedThumbnails {
                result: Ok(thumbnail),
                gate: Some(Gate {
                    entered: entered_tx,
                    release: Mutex::new(release_rx),
                }),
            },
        );

        let run_a = h.pipeline.trigger(photo(1));
        let run_a_id = run_a.run_id;
        entered_rx.recv().await.expect("run A should reach the thumbnail fetch");

        let run_b = h.pipeline.trigger(photo(2));
        assert_eq!(run_b.outcome().await, Some(RunOutcome::Done { themed: false }));

        release_tx.send(()).expect("release run A");
        assert_eq!(
            run_a.outcome().await,
            Some(RunOutcome::Superseded {
                stage: PipelineStage::FetchingThumbnail
            })
        );

        let run_a_payloads = payloads_for(&drain(&mut h.bus), run_a_id);
        assert!(!run_a_payloads
            .iter()
            .any(|payload| matches!(payload, EventPayload::Theme(_) | EventPayload::Finished(_))));
        assert_eq!(
            run_a_payloads,
            vec![
                EventPayload::Title(TitleUpdate::Subject(sunflower())),
                EventPayload::Summary(SummaryUpdate::Extract("A sunflower is...".to_string())),
            ]
        );
    }
}
