//! Application runtime bootstrap and top-level orchestration.

use std::{path::PathBuf, thread, time::Duration};

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::{
    classifier_adapter::{ClassificationModel, ClassifierAdapter},
    config::Config,
    enrichment_pipeline::{EnrichmentPipeline, PipelineCollaborators},
    http_transport::UreqTransport,
    image_pipeline::{
        load_image_from_path, thumbnail_cache_dir, CachedThumbnailFetcher, ThumbnailCache,
    },
    knowledge_client::KnowledgeClient,
    presentation::{PresentationManager, PresentationState},
    protocol::Message,
};

const BUS_CAPACITY: usize = 256;

/// One identification request from the command line.
pub(crate) struct IdentifyRequest {
    pub image_path: PathBuf,
    pub model: Box<dyn ClassificationModel>,
}

/// Owns the async runtime and the configuration for a session.
pub(crate) struct AppRuntime {
    config: Config,
    runtime: tokio::runtime::Runtime,
}

impl AppRuntime {
    pub(crate) fn build(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("whatflower-pipeline")
            .build()?;
        Ok(Self { config, runtime })
    }

    fn collaborators(&self, model: Box<dyn ClassificationModel>) -> PipelineCollaborators {
        let knowledge = &self.config.knowledge;
        let thumbnails = &self.config.thumbnails;
        let knowledge_transport = UreqTransport::new(
            &knowledge.user_agent,
            Duration::from_millis(knowledge.connect_timeout_ms),
            Duration::from_millis(knowledge.read_timeout_ms),
        );
        let thumbnail_transport = UreqTransport::new(
            &knowledge.user_agent,
            Duration::from_millis(knowledge.connect_timeout_ms),
            Duration::from_millis(thumbnails.request_timeout_ms),
        );
        let cache = if thumbnails.cache_enabled {
            let cache = thumbnail_cache_dir()
                .map(|root| ThumbnailCache::new(root, thumbnails.cache_max_size_mb));
            if cache.is_none() {
                warn!("No cache directory available, thumbnail cache disabled");
            }
            cache
        } else {
            None
        };

        PipelineCollaborators {
            classifier: ClassifierAdapter::new(model, self.config.classifier.min_confidence),
            knowledge: Box::new(KnowledgeClient::new(Box::new(knowledge_transport), knowledge)),
            thumbnails: Box::new(CachedThumbnailFetcher::new(Box::new(thumbnail_transport), cache)),
        }
    }

    /// Runs one identification to completion and returns what was presented.
    pub(crate) fn run(
        self,
        request: IdentifyRequest,
    ) -> Result<PresentationState, Box<dyn std::error::Error>> {
        let image = load_image_from_path(&request.image_path)?;
        info!(
            "Loaded {} ({}x{})",
            request.image_path.display(),
            image.width(),
            image.height()
        );

        let (bus_sender, _) = broadcast::channel::<Message>(BUS_CAPACITY);
        let presentation_bus_receiver = bus_sender.subscribe();
        let presentation_thread = thread::Builder::new()
            .name("presentation".to_string())
            .spawn(move || PresentationManager::new(presentation_bus_receiver).run())?;

        let mut pipeline = EnrichmentPipeline::new(
            self.collaborators(request.model),
            self.config.theme.clone(),
            bus_sender,
            self.runtime.handle().clone(),
        );
        let handle = pipeline.trigger(image);
        let run_id = handle.run_id;
        debug!("Run {} triggered, active run is {}", run_id, pipeline.active_run());
        match self.runtime.block_on(handle.outcome()) {
            Some(outcome) => info!("Run {} finished: {:?}", run_id, outcome),
            None => warn!("Run {} did not report an outcome", run_id),
        }
        drop(pipeline);

        presentation_thread
            .join()
            .map_err(|_| "presentation thread panicked".into())
    }
}
