use std::sync::Arc;

use crate::config::{Config, StreamsConfig};
use crate::pipeline::{PipelineFactory, PipelineStore};
use crate::ssrc_index::SsrcIndex;

/// Process-wide collaborators, constructed once at startup and passed down.
/// Nothing in here is discovered through implicit globals, so tests build
/// isolated environments from scratch.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub streams: Arc<StreamsConfig>,
    pub ssrc_index: Arc<SsrcIndex>,
    pub pipeline_factory: Arc<dyn PipelineFactory>,
    pub pipeline_store: Arc<PipelineStore>,
}

impl AppContext {
    pub fn new(config: Config, pipeline_factory: Arc<dyn PipelineFactory>) -> Self {
        AppContext {
            config: Arc::new(config),
            streams: Arc::new(StreamsConfig::default()),
            ssrc_index: Arc::new(SsrcIndex::new()),
            pipeline_factory,
            pipeline_store: Arc::new(PipelineStore::new()),
        }
    }
}
