//! Free-tier usage tracking: generations per calendar day, persisted so the
//! counter survives restarts and resets on day rollover.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::cache::persist::KeyValueStore;
use crate::config::USAGE_STORAGE_KEY;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageData {
    generations_today: u32,
    /// "YYYY-MM-DD" in UTC.
    last_reset_date: String,
}

impl UsageData {
    fn fresh(today: String) -> Self {
        Self {
            generations_today: 0,
            last_reset_date: today,
        }
    }
}

/// Daily generation counter. Best-effort: persistence failures are logged
/// and the in-memory counter keeps working.
pub struct UsageTracker {
    store: Arc<dyn KeyValueStore>,
    daily_limit: u32,
    state: Mutex<Option<UsageData>>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, daily_limit: u32) -> Self {
        Self {
            store,
            daily_limit,
            state: Mutex::new(None),
        }
    }

    /// Generations left today.
    pub async fn remaining(&self) -> u32 {
        let mut slot = self.state.lock().await;
        let data = self.ensure_loaded(&mut slot).await;
        self.daily_limit.saturating_sub(data.generations_today)
    }

    pub async fn can_generate(&self) -> bool {
        self.remaining().await > 0
    }

    /// Count one generation against today's quota.
    pub async fn record_generation(&self) {
        let mut slot = self.state.lock().await;
        let data = self.ensure_loaded(&mut slot).await;

        let today = today_string();
        if data.last_reset_date != today {
            *data = UsageData::fresh(today);
        }
        data.generations_today += 1;

        self.persist(data).await;
    }

    /// Reset the counter (e.g. after an upgrade to a paid tier).
    pub async fn reset(&self) {
        let mut slot = self.state.lock().await;
        *slot = Some(UsageData::fresh(today_string()));
        if let Some(data) = slot.as_ref() {
            self.persist(data).await;
        }
    }

    async fn ensure_loaded<'a>(&self, slot: &'a mut Option<UsageData>) -> &'a mut UsageData {
        if slot.is_none() {
            *slot = Some(self.load().await);
        }

        // Roll over to a fresh day bucket when the stored date is stale.
        let data = slot.as_mut().expect("usage loaded above");
        let today = today_string();
        if data.last_reset_date != today {
            *data = UsageData::fresh(today);
        }
        data
    }

    async fn load(&self) -> UsageData {
        match self.store.get(USAGE_STORAGE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<UsageData>(&raw) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "usage data unreadable, resetting");
                    UsageData::fresh(today_string())
                }
            },
            Ok(None) => UsageData::fresh(today_string()),
            Err(e) => {
                warn!(error = %e, "usage load failed, resetting");
                UsageData::fresh(today_string())
            }
        }
    }

    async fn persist(&self, data: &UsageData) {
        let raw = match serde_json::to_string(data) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "usage serialize failed");
                return;
            }
        };
        if let Err(e) = self.store.set(USAGE_STORAGE_KEY, &raw).await {
            warn!(error = %e, "usage persist failed");
        }
    }
}

/// Current UTC day as "YYYY-MM-DD".
fn today_string() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::persist::MemoryKvStore;

    #[tokio::test]
    async fn counts_down_from_daily_limit() {
        let tracker = UsageTracker::new(Arc::new(MemoryKvStore::new()), 3);

        assert_eq!(tracker.remaining().await, 3);
        tracker.record_generation().await;
        tracker.record_generation().await;
        assert_eq!(tracker.remaining().await, 1);
        assert!(tracker.can_generate().await);

        tracker.record_generation().await;
        assert_eq!(tracker.remaining().await, 0);
        assert!(!tracker.can_generate().await);
    }

    #[tokio::test]
    async fn counter_survives_restart() {
        let store = Arc::new(MemoryKvStore::new());

        let tracker = UsageTracker::new(Arc::clone(&store) as Arc<dyn KeyValueStore>, 3);
        tracker.record_generation().await;

        let tracker2 = UsageTracker::new(store, 3);
        assert_eq!(tracker2.remaining().await, 2);
    }

    #[tokio::test]
    async fn stale_day_bucket_resets() {
        let store = Arc::new(MemoryKvStore::new());
        let stale = UsageData {
            generations_today: 3,
            last_reset_date: "2020-01-01".to_string(),
        };
        store
            .set(USAGE_STORAGE_KEY, &serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();

        let tracker = UsageTracker::new(store, 3);
        assert_eq!(tracker.remaining().await, 3);
    }

    #[tokio::test]
    async fn reset_restores_full_quota() {
        let tracker = UsageTracker::new(Arc::new(MemoryKvStore::new()), 3);
        tracker.record_generation().await;
        tracker.reset().await;
        assert_eq!(tracker.remaining().await, 3);
    }
}
