use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};

/// Minimum spacing between calls to each named external API.
///
/// Callers of the same API queue on that API's slot; different APIs never
/// wait on each other.
pub struct RateLimiter {
    default_interval: Duration,
    intervals: RwLock<HashMap<String, Duration>>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Option<Instant>>>>>,
}

impl RateLimiter {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            intervals: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_interval(self, api: &str, interval: Duration) -> Self {
        self.set_interval(api, interval);
        self
    }

    pub fn set_interval(&self, api: &str, interval: Duration) {
        self.intervals.write().insert(api.to_string(), interval);
    }

    pub fn interval_for(&self, api: &str) -> Duration {
        self.intervals
            .read()
            .get(api)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Wait until `api` may be called again, then claim the slot.
    pub async fn acquire(&self, api: &str) {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(api.to_string()).or_default())
        };
        let interval = self.interval_for(api);

        let mut last_call = slot.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                debug!("Rate limiting {} for {:?}", api, wait);
                sleep(wait).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}
