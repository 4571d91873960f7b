//! Application configuration: API endpoint, cache sizing, timeouts.
//! Defaults mirror the shipped client; the API key is read from the
//! environment so it never lands in source control.

use std::path::PathBuf;
use std::time::Duration;

/// Canonical cache snapshot format version. Bumping this invalidates every
/// stored snapshot on next load (full wipe, no entry-by-entry migration).
pub const CACHE_VERSION: &str = "1.0.0";

/// Key under which the cache snapshot blob is stored.
pub const CACHE_STORAGE_KEY: &str = "music_cache";

/// Key under which daily usage counters are stored.
pub const USAGE_STORAGE_KEY: &str = "aetherwave_usage";

/// Environment variable holding the generation API key.
pub const API_KEY_ENV: &str = "AETHERWAVE_API_KEY";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Generation API base URL.
    pub api_base_url: String,
    /// Bearer token for the generation API. None disables the HTTP client.
    pub api_key: Option<String>,
    /// Maximum number of cached scenarios. Must be >= 1.
    pub cache_size: usize,
    /// Upper bound on a full cache-miss generation round trip.
    pub generate_timeout: Duration,
    /// Directory holding the SQLite database.
    pub data_dir: PathBuf,
    /// Directory owned by the artifact store for downloaded audio.
    pub audio_dir: PathBuf,
    /// Free tier: generations allowed per calendar day.
    pub free_tier_generations_per_day: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.kie.ai/api/v1".to_string(),
            api_key: None,
            cache_size: 4,
            generate_timeout: Duration::from_secs(15),
            data_dir: PathBuf::from("data"),
            audio_dir: PathBuf::from("data/audio"),
            free_tier_generations_per_day: 3,
        }
    }
}

impl AppConfig {
    /// Default configuration with the API key pulled from the environment.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var(API_KEY_ENV).ok(),
            ..Self::default()
        }
    }

    /// Clamp invalid values to their minimums.
    pub fn validated(mut self) -> Self {
        if self.cache_size == 0 {
            tracing::warn!("cache_size 0 is invalid, clamping to 1");
            self.cache_size = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_cache_size_clamps_to_one() {
        let config = AppConfig {
            cache_size: 0,
            ..AppConfig::default()
        }
        .validated();
        assert_eq!(config.cache_size, 1);
    }

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.cache_size, 4);
        assert_eq!(config.generate_timeout, Duration::from_secs(15));
    }
}
