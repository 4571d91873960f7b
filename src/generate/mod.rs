//! Music generation types and the generator trait (adapter for backends).
//! The HTTP implementation lives in `kie.rs`; `StubGenerator` serves tests
//! and offline runs.

pub mod kie;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// One generated audio track with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub audio_url: String,
    /// Set once the track has been downloaded; playback falls back to
    /// streaming from `audio_url` when absent.
    pub local_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub metadata: SongMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongMetadata {
    /// Upstream generation task id.
    pub suno_id: String,
    /// RFC 3339 timestamp from the generation API.
    pub generated_at: String,
    pub play_count: u32,
    pub user_rating: Option<u8>,
}

/// Generation request as issued by the orchestrator.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub requester_id: String,
    /// Number of variations wanted. Backends may return fewer.
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub songs: Vec<Song>,
    pub generated_at: String,
}

#[derive(Debug)]
pub enum GenerateError {
    ApiError(String),
    RateLimited { retry_after_ms: u64 },
    Timeout,
    Cancelled,
    InvalidInput(String),
    /// The backend answered but produced no songs.
    EmptyResult,
}

impl std::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateError::ApiError(msg) => write!(f, "API error: {msg}"),
            GenerateError::RateLimited { retry_after_ms } => {
                write!(f, "rate limited, retry after {retry_after_ms}ms")
            }
            GenerateError::Timeout => write!(f, "generation timeout"),
            GenerateError::Cancelled => write!(f, "generation cancelled"),
            GenerateError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            GenerateError::EmptyResult => write!(f, "no songs were generated"),
        }
    }
}

/// Generator trait (adapter for different backends).
#[async_trait]
pub trait MusicGenerator: Send + Sync {
    /// Generate songs for the prompt. Implementations honor the token for
    /// early cancellation; overall deadline enforcement lives in the caller.
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel_token: &CancellationToken,
    ) -> Result<GenerateResponse, GenerateError>;
}

/// Stub generator: answers instantly with a deterministic song per prompt.
pub struct StubGenerator;

#[async_trait]
impl MusicGenerator for StubGenerator {
    async fn generate(
        &self,
        request: GenerateRequest,
        _cancel_token: &CancellationToken,
    ) -> Result<GenerateResponse, GenerateError> {
        let id = format!("stub_{}", uuid::Uuid::new_v4());
        let song = Song {
            id: id.clone(),
            audio_url: format!("https://example.invalid/stub/{}.mp3", request.prompt.replace(' ', "-")),
            local_path: None,
            duration_ms: 30_000,
            metadata: SongMetadata {
                suno_id: id,
                generated_at: chrono::Utc::now().to_rfc3339(),
                play_count: 0,
                user_rating: None,
            },
        };
        Ok(GenerateResponse {
            songs: vec![song],
            generated_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}
