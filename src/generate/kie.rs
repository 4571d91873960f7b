//! Kie.ai music generation client.
//! Connection pooling via reqwest, retry with backoff on 429/5xx, single
//! immediate retry on timeout. Slow generations are resolved by polling the
//! task status endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{GenerateError, GenerateRequest, GenerateResponse, MusicGenerator, Song, SongMetadata};
use crate::config::{AppConfig, API_KEY_ENV};

/// Poll interval and attempt cap for pending generation tasks.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Kie.ai generation client.
pub struct KieClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct KieGenerateRequest<'a> {
    prompt: &'a str,
    model: &'a str,
    /// Clip length in seconds.
    duration: u32,
    make_instrumental: bool,
}

#[derive(Debug, Deserialize)]
struct KieGenerateResponse {
    id: String,
    status: String,
    audio_url: Option<String>,
    /// Seconds.
    duration: Option<u32>,
    created_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub remaining: u32,
    pub reset_at: String,
}

impl KieClient {
    /// Create a new client from configuration. The request timeout bounds a
    /// full cache-miss generation round trip.
    pub fn new(config: &AppConfig) -> Result<Self, GenerateError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| {
                GenerateError::InvalidInput(format!("{API_KEY_ENV} environment variable not set"))
            })?;

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.generate_timeout)
            .build()
            .map_err(|e| GenerateError::ApiError(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.api_base_url.clone(),
        })
    }

    /// Map a Kie task payload to a `Song`. Upstream reports seconds; the
    /// client stores milliseconds.
    fn song_from_response(data: KieGenerateResponse) -> Song {
        Song {
            id: data.id.clone(),
            audio_url: data.audio_url.unwrap_or_default(),
            local_path: None,
            duration_ms: u64::from(data.duration.unwrap_or(30)) * 1000,
            metadata: SongMetadata {
                suno_id: data.id,
                generated_at: data
                    .created_at
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                play_count: 0,
                user_rating: None,
            },
        }
    }

    /// Poll the status endpoint until the task completes or the attempt cap
    /// is hit. A 404 means the task is not yet visible; keep polling.
    pub async fn poll_for_completion(
        &self,
        task_id: &str,
        cancel_token: &CancellationToken,
    ) -> Result<Song, GenerateError> {
        for _ in 0..MAX_POLL_ATTEMPTS {
            if cancel_token.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }

            let response = self
                .http
                .get(format!("{}/status/{}", self.base_url, task_id))
                .bearer_auth(&self.api_key)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().as_u16() == 404 => {}
                Ok(resp) if resp.status().is_success() => {
                    let data: KieGenerateResponse = resp
                        .json()
                        .await
                        .map_err(|e| GenerateError::ApiError(e.to_string()))?;
                    match data.status.as_str() {
                        "completed" if data.audio_url.is_some() => {
                            return Ok(Self::song_from_response(data));
                        }
                        "failed" => {
                            return Err(GenerateError::ApiError(
                                "music generation failed".to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
                Ok(resp) => {
                    return Err(GenerateError::ApiError(format!(
                        "status poll: unexpected status {}",
                        resp.status()
                    )));
                }
                Err(e) => return Err(GenerateError::ApiError(e.to_string())),
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel_token.cancelled() => return Err(GenerateError::Cancelled),
            }
        }

        Err(GenerateError::Timeout)
    }

    /// Remaining free-tier quota for the user. Falls back to the local
    /// default when the endpoint is unavailable.
    pub async fn check_usage(&self, user_id: &str, fallback_remaining: u32) -> UsageInfo {
        let result = self
            .http
            .get(format!("{}/usage/{}", self.base_url, user_id))
            .bearer_auth(&self.api_key)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<UsageInfo>().await {
                Ok(info) => return info,
                Err(e) => warn!(error = %e, "usage response parse failed"),
            },
            Ok(resp) => warn!(status = resp.status().as_u16(), "usage endpoint error"),
            Err(e) => warn!(error = %e, "usage endpoint unreachable"),
        }

        UsageInfo {
            remaining: fallback_remaining,
            reset_at: (chrono::Utc::now() + chrono::Duration::days(1)).to_rfc3339(),
        }
    }

    /// Liveness probe against the API.
    pub async fn health_check(&self) -> bool {
        self.http
            .get(format!("{}/health", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    /// Send the generation request with retry logic.
    /// 429: Retry-After or 1s/2s/4s (max 3).
    /// 5xx: exponential backoff (max 2).
    /// Timeout: immediate retry once.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
        cancel_token: &CancellationToken,
    ) -> Result<reqwest::Response, GenerateError> {
        let mut attempt: u32 = 0;
        let max_429_retries: u32 = 3;
        let max_5xx_retries: u32 = 2;
        let mut timeout_retried = false;

        loop {
            let result = self
                .http
                .post(format!("{}/generate", self.base_url))
                .bearer_auth(&self.api_key)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp);
                }
                Ok(resp) if resp.status().as_u16() == 429 => {
                    if attempt >= max_429_retries {
                        return Err(GenerateError::RateLimited { retry_after_ms: 0 });
                    }
                    let wait = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Duration::from_secs(1 << attempt));
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel_token.cancelled() => return Err(GenerateError::Cancelled),
                    }
                    attempt += 1;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if attempt >= max_5xx_retries {
                        return Err(GenerateError::ApiError(format!(
                            "server error: {}",
                            resp.status()
                        )));
                    }
                    let wait = Duration::from_millis(500 * (1 << attempt));
                    warn!(
                        attempt,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel_token.cancelled() => return Err(GenerateError::Cancelled),
                    }
                    attempt += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(GenerateError::ApiError(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(GenerateError::Timeout);
                    }
                    warn!("request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => {
                    return Err(GenerateError::ApiError(e.to_string()));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl MusicGenerator for KieClient {
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel_token: &CancellationToken,
    ) -> Result<GenerateResponse, GenerateError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerateError::InvalidInput("empty prompt".into()));
        }
        if cancel_token.is_cancelled() {
            return Err(GenerateError::Cancelled);
        }

        let kie_request = KieGenerateRequest {
            prompt: &request.prompt,
            model: "chirp-v3",
            duration: 30,
            make_instrumental: false,
        };
        let body = serde_json::to_value(&kie_request)
            .map_err(|e| GenerateError::InvalidInput(e.to_string()))?;

        let response = self.send_with_retry(&body, cancel_token).await?;
        let data: KieGenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::ApiError(e.to_string()))?;

        // A task still pending at accept time is resolved by polling.
        let song = if data.audio_url.is_none() && data.status != "completed" {
            let task_id = data.id.clone();
            self.poll_for_completion(&task_id, cancel_token).await?
        } else {
            Self::song_from_response(data)
        };

        if song.audio_url.is_empty() {
            return Err(GenerateError::EmptyResult);
        }

        Ok(GenerateResponse {
            songs: vec![song],
            generated_at: chrono::Utc::now().to_rfc3339(),
        })
    }
}
