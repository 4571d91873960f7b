//! Generation orchestration: resolves a voice prompt to a playable song,
//! using the scenario cache as a read-through/write-through layer in front
//! of the generation backend. Concurrent requests for the same uncached
//! scenario are collapsed into a single generation call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, ScenarioCache};
use crate::generate::{GenerateError, GenerateRequest, MusicGenerator, Song};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::scenario;
use crate::storage::ArtifactStore;
use crate::usage::UsageTracker;

#[derive(Debug)]
pub enum ResolveError {
    Generation(GenerateError),
    Cache(CacheError),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Generation(e) => write!(f, "generation failed: {e}"),
            ResolveError::Cache(e) => write!(f, "cache error: {e}"),
        }
    }
}

/// Number of variations requested per generation.
const VARIATIONS_PER_REQUEST: u32 = 2;

/// Resolves scenario prompts to songs. One instance per app; collaborators
/// are injected by the composition root.
pub struct GenerationOrchestrator {
    cache: Arc<ScenarioCache>,
    generator: Arc<dyn MusicGenerator>,
    artifacts: Arc<dyn ArtifactStore>,
    usage: Arc<UsageTracker>,
    metrics: Arc<MetricsRegistry>,
    /// Upper bound on one generation round trip.
    timeout: Duration,
    /// Per-scenario gates: at most one generation in flight per key. Later
    /// callers await the gate, then re-check the cache.
    in_flight: SyncMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GenerationOrchestrator {
    pub fn new(
        cache: Arc<ScenarioCache>,
        generator: Arc<dyn MusicGenerator>,
        artifacts: Arc<dyn ArtifactStore>,
        usage: Arc<UsageTracker>,
        metrics: Arc<MetricsRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            generator,
            artifacts,
            usage,
            metrics,
            timeout,
            in_flight: SyncMutex::new(HashMap::new()),
        }
    }

    /// Resolve a free-form prompt to a playable song. Cache hits return
    /// without any network I/O; misses run generate → download → cache.
    pub async fn resolve(&self, prompt: &str, requester_id: &str) -> Result<Song, ResolveError> {
        let key = scenario::scenario_key(prompt);
        let resolve_span = self.metrics.span(metric_names::RESOLVE_DONE);

        let lookup_span = self.metrics.span(metric_names::CACHE_LOOKUP);
        if let Some(song) = self.cache.lookup(&key).await {
            lookup_span.finish();
            self.metrics.count_cache_hit();
            resolve_span.finish();
            return Ok(song);
        }
        lookup_span.finish();
        self.metrics.count_cache_miss();

        // The guard releases the in-flight slot on every exit path,
        // including this future being dropped mid-generation.
        let guard = GateGuard {
            owner: self,
            key: key.clone(),
            gate: self.gate_for(&key),
        };
        let _held = guard.gate.lock().await;

        // Another caller may have finished this scenario while we waited.
        if let Some(song) = self.cache.lookup(&key).await {
            debug!(scenario = %key, "resolved by concurrent generation");
            resolve_span.finish();
            return Ok(song);
        }

        let result = self.generate_and_cache(&key, requester_id).await;

        if result.is_ok() {
            resolve_span.finish();
        }
        result
    }

    async fn generate_and_cache(
        &self,
        key: &str,
        requester_id: &str,
    ) -> Result<Song, ResolveError> {
        info!(scenario = %key, "cache miss, generating");

        let request = GenerateRequest {
            prompt: key.to_string(),
            requester_id: requester_id.to_string(),
            count: VARIATIONS_PER_REQUEST,
        };

        let cancel_token = CancellationToken::new();
        let generate_span = self.metrics.span(metric_names::GENERATE_DONE);
        let response = match tokio::time::timeout(
            self.timeout,
            self.generator.generate(request, &cancel_token),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ResolveError::Generation(e)),
            Err(_) => {
                cancel_token.cancel();
                return Err(ResolveError::Generation(GenerateError::Timeout));
            }
        };
        generate_span.finish();

        let mut songs = response.songs;
        if songs.is_empty() {
            return Err(ResolveError::Generation(GenerateError::EmptyResult));
        }

        self.usage.record_generation().await;

        // Download the primary for instant replay; on failure the song keeps
        // its remote URL and playback falls back to streaming.
        let filename = format!("{}.mp3", songs[0].id);
        let download_span = self.metrics.span(metric_names::DOWNLOAD_DONE);
        match self.artifacts.download(&songs[0].audio_url, &filename).await {
            Ok(path) => {
                songs[0].local_path = Some(path);
                download_span.finish();
            }
            Err(e) => {
                warn!(error = %e, song = %songs[0].id, "download failed, keeping remote URL only");
            }
        }

        self.cache
            .insert(key, &songs)
            .await
            .map_err(ResolveError::Cache)?;

        Ok(songs.into_iter().next().expect("non-empty checked above"))
    }

    fn gate_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.in_flight.lock();
        Arc::clone(map.entry(key.to_string()).or_default())
    }

    fn release_gate(&self, key: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut map = self.in_flight.lock();
        // Keep the slot while other callers still hold clones of this gate,
        // otherwise a third caller could race a fresh generation.
        if Arc::strong_count(gate) <= 2 {
            map.remove(key);
        }
    }
}

/// Holds one caller's clone of a scenario gate and gives it back on drop.
struct GateGuard<'a> {
    owner: &'a GenerationOrchestrator,
    key: String,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.owner.release_gate(&self.key, &self.gate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::persist::MemoryKvStore;
    use crate::generate::{GenerateResponse, SongMetadata};
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingGenerator {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn test_song(id: &str) -> Song {
        Song {
            id: id.to_string(),
            audio_url: format!("https://example.invalid/{id}.mp3"),
            local_path: None,
            duration_ms: 30_000,
            metadata: SongMetadata {
                suno_id: id.to_string(),
                generated_at: "2026-01-01T00:00:00Z".to_string(),
                play_count: 0,
                user_rating: None,
            },
        }
    }

    #[async_trait]
    impl MusicGenerator for CountingGenerator {
        async fn generate(
            &self,
            request: GenerateRequest,
            _cancel_token: &CancellationToken,
        ) -> Result<GenerateResponse, GenerateError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(GenerateResponse {
                songs: vec![test_song(&format!("{}#{}", request.prompt, n))],
                generated_at: "2026-01-01T00:00:00Z".to_string(),
            })
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl MusicGenerator for FailingGenerator {
        async fn generate(
            &self,
            _request: GenerateRequest,
            _cancel_token: &CancellationToken,
        ) -> Result<GenerateResponse, GenerateError> {
            Err(GenerateError::ApiError("backend down".into()))
        }
    }

    /// Download succeeds with a synthetic path; deletes are no-ops.
    struct NullArtifactStore {
        fail_downloads: bool,
    }

    #[async_trait]
    impl ArtifactStore for NullArtifactStore {
        async fn download(&self, _url: &str, filename: &str) -> Result<PathBuf, StorageError> {
            if self.fail_downloads {
                Err(StorageError::Download("offline".into()))
            } else {
                Ok(PathBuf::from(format!("/tmp/audio/{filename}")))
            }
        }

        async fn delete(&self, _local_path: &Path) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn orchestrator_with(
        generator: Arc<dyn MusicGenerator>,
        fail_downloads: bool,
        timeout: Duration,
    ) -> (GenerationOrchestrator, Arc<ScenarioCache>, Arc<UsageTracker>) {
        let store = Arc::new(MemoryKvStore::new());
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(NullArtifactStore { fail_downloads });
        let cache = Arc::new(ScenarioCache::new(
            Arc::clone(&store) as Arc<dyn crate::cache::persist::KeyValueStore>,
            Arc::clone(&artifacts),
            4,
        ));
        let usage = Arc::new(UsageTracker::new(store, 3));
        let orchestrator = GenerationOrchestrator::new(
            Arc::clone(&cache),
            generator,
            artifacts,
            Arc::clone(&usage),
            Arc::new(MetricsRegistry::new()),
            timeout,
        );
        (orchestrator, cache, usage)
    }

    #[tokio::test]
    async fn miss_generates_then_serves_from_cache() {
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let (orchestrator, _, usage) =
            orchestrator_with(Arc::clone(&generator) as Arc<dyn MusicGenerator>, false, Duration::from_secs(1));

        let first = orchestrator.resolve("morning workout", "user-1").await.unwrap();
        let second = orchestrator.resolve("morning workout", "user-1").await.unwrap();

        assert_eq!(generator.call_count(), 1);
        assert_eq!(first.id, second.id);
        // Only the generated resolve counts against the quota.
        assert_eq!(usage.remaining().await, 2);
    }

    #[tokio::test]
    async fn prompts_differing_only_in_case_share_one_generation() {
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let (orchestrator, _, _) =
            orchestrator_with(Arc::clone(&generator) as Arc<dyn MusicGenerator>, false, Duration::from_secs(1));

        orchestrator.resolve("Morning WORKOUT", "user-1").await.unwrap();
        orchestrator.resolve("morning workout", "user-1").await.unwrap();

        assert_eq!(generator.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_trigger_one_generation() {
        let generator = Arc::new(CountingGenerator::new(Duration::from_millis(50)));
        let (orchestrator, _, _) =
            orchestrator_with(Arc::clone(&generator) as Arc<dyn MusicGenerator>, false, Duration::from_secs(5));
        let orchestrator = Arc::new(orchestrator);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let orch = Arc::clone(&orchestrator);
            handles.push(tokio::spawn(async move {
                orch.resolve("party energy", "user-1").await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }

        assert_eq!(generator.call_count(), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn aborted_resolve_releases_its_gate() {
        let generator = Arc::new(CountingGenerator::new(Duration::from_millis(200)));
        let (orchestrator, _, _) = orchestrator_with(
            Arc::clone(&generator) as Arc<dyn MusicGenerator>,
            false,
            Duration::from_secs(5),
        );
        let orchestrator = Arc::new(orchestrator);

        let orch = Arc::clone(&orchestrator);
        let handle = tokio::spawn(async move { orch.resolve("party energy", "user-1").await });
        // Let the task get past the cache miss and into generation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        assert!(orchestrator.in_flight.lock().is_empty());

        // A later resolve of the same scenario runs a fresh generation
        // instead of waiting on an orphaned gate.
        let song = orchestrator.resolve("party energy", "user-1").await.unwrap();
        assert!(!song.audio_url.is_empty());
        assert_eq!(generator.call_count(), 2);
    }

    #[tokio::test]
    async fn generation_failure_leaves_cache_untouched() {
        let (orchestrator, cache, usage) =
            orchestrator_with(Arc::new(FailingGenerator), false, Duration::from_secs(1));

        let result = orchestrator.resolve("morning workout", "user-1").await;
        assert!(matches!(
            result,
            Err(ResolveError::Generation(GenerateError::ApiError(_)))
        ));
        assert_eq!(cache.stats().await.entry_count, 0);
        assert_eq!(usage.remaining().await, 3);
    }

    #[tokio::test]
    async fn slow_generation_times_out_without_cache_mutation() {
        let generator = Arc::new(CountingGenerator::new(Duration::from_millis(500)));
        let (orchestrator, cache, _) = orchestrator_with(
            Arc::clone(&generator) as Arc<dyn MusicGenerator>,
            false,
            Duration::from_millis(50),
        );

        let result = orchestrator.resolve("morning workout", "user-1").await;
        assert!(matches!(
            result,
            Err(ResolveError::Generation(GenerateError::Timeout))
        ));
        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn download_failure_degrades_to_remote_url() {
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let (orchestrator, cache, _) =
            orchestrator_with(Arc::clone(&generator) as Arc<dyn MusicGenerator>, true, Duration::from_secs(1));

        let song = orchestrator.resolve("morning workout", "user-1").await.unwrap();
        assert!(song.local_path.is_none());
        assert!(!song.audio_url.is_empty());
        // Still cached for the next request.
        assert_eq!(cache.stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn successful_download_records_local_path() {
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let (orchestrator, _, _) =
            orchestrator_with(Arc::clone(&generator) as Arc<dyn MusicGenerator>, false, Duration::from_secs(1));

        let song = orchestrator.resolve("morning workout", "user-1").await.unwrap();
        let path = song.local_path.expect("download should have succeeded");
        assert!(path.to_string_lossy().ends_with(".mp3"));
    }
}
