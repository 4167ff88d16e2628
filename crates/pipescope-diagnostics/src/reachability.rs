//! Periodic connectivity probe with an edge-triggered callback.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

pub type ReachabilityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Reachability as seen by the poller. Starts offline with no probe seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityState {
    reachable: bool,
    first_probe: bool,
}

impl Default for ReachabilityState {
    fn default() -> Self {
        Self {
            reachable: false,
            first_probe: true,
        }
    }
}

impl ReachabilityState {
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Record one probe outcome and return the value the callback should
    /// receive, if any. Only transitions report, plus the very first failure.
    pub fn observe(&mut self, success: bool) -> Option<bool> {
        let first = std::mem::replace(&mut self.first_probe, false);
        if success {
            if self.reachable {
                return None;
            }
            self.reachable = true;
            Some(true)
        } else {
            let report = first || self.reachable;
            self.reachable = false;
            report.then_some(false)
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// GET probe that only cares whether a response came back at all.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                debug!(
                    event = "reachability_probe",
                    url = %self.url,
                    status = %response.status(),
                    "probe answered"
                );
                true
            }
            Err(err) => {
                debug!(
                    event = "reachability_probe",
                    url = %self.url,
                    error = %err,
                    "probe failed"
                );
                false
            }
        }
    }
}

/// Owns the reachability state shared by every probe loop it starts.
#[derive(Default, Clone)]
pub struct ReachabilityPoller {
    state: Arc<Mutex<ReachabilityState>>,
}

impl ReachabilityPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reachable(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.is_reachable())
            .unwrap_or(false)
    }

    /// Probe every `interval_secs` seconds, first probe after one period.
    /// A zero interval is treated as one second and anything past a year as
    /// a year. Must be called inside a tokio runtime.
    pub fn observe_reachability(
        &self,
        callback: ReachabilityCallback,
        probe: Arc<dyn Probe>,
        interval_secs: u64,
    ) -> ReachabilityHandle {
        let period = probe_period(interval_secs);
        let state = Arc::clone(&self.state);
        info!(
            event = "reachability_started",
            interval_ms = period.as_millis() as u64
        );
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let success = probe.probe().await;
                let report = match state.lock() {
                    Ok(mut state) => state.observe(success),
                    Err(poisoned) => poisoned.into_inner().observe(success),
                };
                if let Some(reachable) = report {
                    info!(event = "reachability_changed", reachable);
                    callback(reachable);
                }
            }
        });
        ReachabilityHandle { task }
    }
}

fn probe_period(interval_secs: u64) -> Duration {
    Duration::from_secs(interval_secs.clamp(1, MAX_INTERVAL_SECS))
}

/// Keeps a probe loop alive; dropping it stops the loop.
pub struct ReachabilityHandle {
    task: JoinHandle<()>,
}

impl ReachabilityHandle {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ReachabilityHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
