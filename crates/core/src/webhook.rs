use crate::job::ResultRecord;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EventPayload {
    Progress,
    Completed {
        #[serde(flatten)]
        result: ResultRecord,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub job_id: String,
    pub post_id: u64,
    pub progress: f64,
    pub stage: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.payload, EventPayload::Progress)
    }
}

struct ThrottleEntry {
    last_percent: f64,
    last_sent_at: Instant,
}

/// Per-job progress throttler. Suppresses webhook sends that would otherwise
/// fire on every transcoder progress tick.
#[derive(Default)]
pub struct Throttler {
    entries: std::sync::Mutex<HashMap<String, ThrottleEntry>>,
}

impl Throttler {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Decides whether `event` should be sent right now. Terminal events
    /// always send and clear the entry; progress events send only when the
    /// percent has advanced by >= 5, >= 3s elapsed since the last send, the
    /// percent is exactly 100, or it's 0 following a prior 0 (initial start).
    pub fn should_send(&self, event: &Event) -> bool {
        let mut entries = self.entries.lock().unwrap();

        if event.is_terminal() {
            entries.remove(&event.job_id);
            return true;
        }

        let now = Instant::now();
        let send = match entries.get(&event.job_id) {
            None => true,
            Some(prev) => {
                let delta = event.progress - prev.last_percent;
                delta >= 5.0
                    || now.duration_since(prev.last_sent_at) >= Duration::from_secs(3)
                    || event.progress >= 100.0
                    || (event.progress == 0.0 && prev.last_percent == 0.0)
            }
        };

        if send {
            entries.insert(
                event.job_id.clone(),
                ThrottleEntry {
                    last_percent: event.progress,
                    last_sent_at: now,
                },
            );
        }

        send
    }
}

/// HTTP POST dispatcher with linear retry backoff, matching the teacher's
/// bounded-attempt-then-log-and-continue posture transplanted from process
/// retries onto HTTP calls.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: String,
    throttler: Throttler,
}

impl WebhookDispatcher {
    pub fn new(endpoint: Option<String>, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client should always build with default settings");

        Self {
            client,
            endpoint,
            api_key,
            throttler: Throttler::new(),
        }
    }

    /// Sends `event` if the throttler allows it. A missing endpoint is a
    /// no-op success, matching the spec's "no-op when unconfigured" rule.
    pub async fn send(&self, event: Event) -> Result<()> {
        let endpoint = match &self.endpoint {
            Some(e) => e,
            None => return Ok(()),
        };

        if !self.throttler.should_send(&event) {
            debug!(job_id = %event.job_id, progress = event.progress, "webhook suppressed by throttler");
            return Ok(());
        }

        const MAX_ATTEMPTS: u32 = 3;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .client
                .post(endpoint)
                .header("X-API-Key", &self.api_key)
                .json(&event)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = Some(format!("webhook responded {}", resp.status()));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                }
            }

            warn!(
                job_id = %event.job_id,
                attempt,
                error = last_err.as_deref().unwrap_or("unknown"),
                "webhook delivery attempt failed"
            );

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
            }
        }

        Err(anyhow::anyhow!(
            "webhook delivery failed after {} attempts: {}",
            MAX_ATTEMPTS,
            last_err.unwrap_or_default()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn progress_event(job_id: &str, progress: f64) -> Event {
        Event {
            job_id: job_id.to_string(),
            post_id: 1,
            progress,
            stage: "compressing_480p",
            timestamp: Utc::now(),
            payload: EventPayload::Progress,
        }
    }

    #[test]
    fn first_event_always_sends() {
        let throttler = Throttler::new();
        assert!(throttler.should_send(&progress_event("j1", 10.0)));
    }

    #[test]
    fn small_delta_is_suppressed_immediately_after_send() {
        let throttler = Throttler::new();
        assert!(throttler.should_send(&progress_event("j1", 10.0)));
        assert!(!throttler.should_send(&progress_event("j1", 11.0)));
    }

    #[test]
    fn large_delta_is_sent() {
        let throttler = Throttler::new();
        assert!(throttler.should_send(&progress_event("j1", 10.0)));
        assert!(throttler.should_send(&progress_event("j1", 16.0)));
    }

    #[test]
    fn hundred_percent_progress_always_sends() {
        let throttler = Throttler::new();
        assert!(throttler.should_send(&progress_event("j1", 10.0)));
        assert!(throttler.should_send(&progress_event("j1", 100.0)));
    }

    #[test]
    fn terminal_event_always_sends_and_clears_entry() {
        let throttler = Throttler::new();
        assert!(throttler.should_send(&progress_event("j1", 10.0)));

        let completed = Event {
            job_id: "j1".to_string(),
            post_id: 1,
            progress: 100.0,
            stage: "complete",
            timestamp: Utc::now(),
            payload: EventPayload::Failed { error: "boom".to_string() },
        };
        assert!(throttler.should_send(&completed));

        // entry cleared: a fresh progress event behaves like the first one again
        assert!(throttler.should_send(&progress_event("j1", 1.0)));
    }
}
