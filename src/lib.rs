//! Aetherwave: voice-driven music generation client core.
//! Scenario cache with LRU eviction and a durable snapshot, plus the
//! orchestration that turns a voice prompt into a playable song.

pub mod cache;
pub mod config;
pub mod generate;
pub mod metrics;
pub mod orchestrator;
pub mod scenario;
pub mod storage;
pub mod usage;

use std::sync::Arc;

use tracing::{info, warn};

use cache::persist::{KeyValueStore, PersistError, SqliteKvStore};
use cache::ScenarioCache;
use config::AppConfig;
use generate::kie::KieClient;
use generate::MusicGenerator;
use metrics::MetricsRegistry;
use orchestrator::GenerationOrchestrator;
use storage::{ArtifactStore, FsArtifactStore};
use usage::UsageTracker;

/// Composition root: owns the wired service graph. Callers hold this by
/// reference; there are no process-wide singletons.
pub struct AppContext {
    pub cache: Arc<ScenarioCache>,
    pub orchestrator: Arc<GenerationOrchestrator>,
    pub usage: Arc<UsageTracker>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: AppConfig,
}

impl AppContext {
    /// Wire the full service graph from configuration: SQLite persistence,
    /// filesystem artifact store and the Kie generation client.
    pub fn new(config: AppConfig) -> Result<Self, PersistError> {
        let config = config.validated();

        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| PersistError::Database(format!("data dir: {e}")))?;

        let store: Arc<dyn KeyValueStore> =
            Arc::new(SqliteKvStore::open(&config.data_dir.join("aetherwave.db"))?);
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(FsArtifactStore::new(config.audio_dir.clone()));

        let generator: Arc<dyn MusicGenerator> = match KieClient::new(&config) {
            Ok(client) => {
                info!("generation API client initialized");
                Arc::new(client)
            }
            Err(e) => {
                warn!(error = %e, "generation client init failed (API key missing?), using stub");
                Arc::new(generate::StubGenerator)
            }
        };

        Ok(Self::with_collaborators(config, store, artifacts, generator))
    }

    /// Wire the service graph around caller-supplied collaborators. Used by
    /// tests and by hosts that bring their own storage or backend.
    pub fn with_collaborators(
        config: AppConfig,
        store: Arc<dyn KeyValueStore>,
        artifacts: Arc<dyn ArtifactStore>,
        generator: Arc<dyn MusicGenerator>,
    ) -> Self {
        let config = config.validated();
        let metrics = Arc::new(MetricsRegistry::new());
        let cache = Arc::new(ScenarioCache::new(
            Arc::clone(&store),
            Arc::clone(&artifacts),
            config.cache_size,
        ));
        let usage = Arc::new(UsageTracker::new(
            store,
            config.free_tier_generations_per_day,
        ));
        let orchestrator = Arc::new(GenerationOrchestrator::new(
            Arc::clone(&cache),
            generator,
            artifacts,
            Arc::clone(&usage),
            Arc::clone(&metrics),
            config.generate_timeout,
        ));

        Self {
            cache,
            orchestrator,
            usage,
            metrics,
            config,
        }
    }

    /// Warm the cache from durable storage. Optional: every service also
    /// lazily initializes on first use.
    pub async fn initialize(&self) {
        self.cache.initialize().await;
        let stats = self.cache.stats().await;
        info!(entries = stats.entry_count, "aetherwave core ready");
    }
}

/// Initialize tracing from `RUST_LOG`, defaulting to debug for this crate.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aetherwave=debug".parse().expect("static filter is valid")),
        )
        .with_target(true)
        .init();
}
