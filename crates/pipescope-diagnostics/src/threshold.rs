//! RAM and graphics-memory threshold monitors.
//!
//! Each monitor samples its metric on a tokio interval and calls back with
//! `true` on every sample at or above the trigger point. With no interval
//! (or zero) it samples every second and stops after the first hit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

pub const MAX_TRIGGER_POINT: i64 = 250;
pub const MAX_INTERVAL_SECS: i64 = 65_535;
const ONE_SHOT_PERIOD: Duration = Duration::from_secs(1);

pub type ThresholdCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Source of the sampled metrics. Percentages above 100 are possible when a
/// per-process limit is configured.
pub trait DiagnosticsSource: Send + Sync {
    fn used_ram_percent(&self) -> f64;
    fn used_gfx_percent(&self) -> f64;
    /// RAM in use, in MB.
    fn used_ram_mb(&self) -> f64;
    /// Graphics memory in use, in MB.
    fn used_gfx_mb(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Ram,
    Graphics,
}

impl MetricKind {
    pub fn sample(self, source: &dyn DiagnosticsSource) -> f64 {
        match self {
            MetricKind::Ram => source.used_ram_percent(),
            MetricKind::Graphics => source.used_gfx_percent(),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Ram => f.write_str("ram"),
            MetricKind::Graphics => f.write_str("gfx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThresholdError {
    #[error("trigger point {0} is outside 0..=250")]
    TriggerOutOfRange(i64),
    #[error("interval {0}s is outside 0..=65535")]
    IntervalOutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdConfig {
    pub trigger_point: u8,
    pub interval_secs: u16,
    pub one_shot: bool,
}

impl ThresholdConfig {
    pub fn new(trigger_point: i64, interval_secs: Option<i64>) -> Result<Self, ThresholdError> {
        let trigger_point = u8::try_from(trigger_point)
            .ok()
            .filter(|value| i64::from(*value) <= MAX_TRIGGER_POINT)
            .ok_or(ThresholdError::TriggerOutOfRange(trigger_point))?;
        let raw_interval = interval_secs.unwrap_or(0);
        let interval_secs = u16::try_from(raw_interval)
            .map_err(|_| ThresholdError::IntervalOutOfRange(raw_interval))?;
        Ok(Self {
            trigger_point,
            interval_secs,
            one_shot: interval_secs == 0,
        })
    }

    pub fn period(&self) -> Duration {
        if self.one_shot {
            ONE_SHOT_PERIOD
        } else {
            Duration::from_secs(u64::from(self.interval_secs))
        }
    }
}

struct ActiveMonitor {
    config: ThresholdConfig,
    task: JoinHandle<()>,
}

/// At most one registration per monitor; registering again replaces it.
pub struct ThresholdMonitor {
    kind: MetricKind,
    source: Arc<dyn DiagnosticsSource>,
    active: Option<ActiveMonitor>,
}

impl ThresholdMonitor {
    pub fn new(kind: MetricKind, source: Arc<dyn DiagnosticsSource>) -> Self {
        Self {
            kind,
            source,
            active: None,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Replace any current registration. Invalid arguments are logged and
    /// leave the monitor unregistered. Must be called inside a tokio runtime.
    pub fn register_callback(
        &mut self,
        callback: ThresholdCallback,
        trigger_point: i64,
        interval_secs: Option<i64>,
    ) {
        self.unregister_callback();
        let config = match ThresholdConfig::new(trigger_point, interval_secs) {
            Ok(config) => config,
            Err(err) => {
                error!(
                    event = "threshold_register_rejected",
                    kind = %self.kind,
                    trigger_point,
                    interval_secs = ?interval_secs,
                    error = %err
                );
                return;
            }
        };
        info!(
            event = "threshold_registered",
            kind = %self.kind,
            trigger_point = config.trigger_point,
            interval_secs = config.interval_secs,
            one_shot = config.one_shot
        );
        let task = tokio::spawn(run_monitor(
            self.kind,
            Arc::clone(&self.source),
            config,
            callback,
        ));
        self.active = Some(ActiveMonitor { config, task });
    }

    pub fn unregister_callback(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
            debug!(event = "threshold_unregistered", kind = %self.kind);
        }
    }

    /// True while a registration is polling. A one-shot monitor goes
    /// inactive on its own after firing.
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map(|active| !active.task.is_finished())
            .unwrap_or(false)
    }

    pub fn config(&self) -> Option<ThresholdConfig> {
        self.active.as_ref().map(|active| active.config)
    }
}

impl Drop for ThresholdMonitor {
    fn drop(&mut self) {
        self.unregister_callback();
    }
}

async fn run_monitor(
    kind: MetricKind,
    source: Arc<dyn DiagnosticsSource>,
    config: ThresholdConfig,
    callback: ThresholdCallback,
) {
    let period = config.period();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let value = kind.sample(source.as_ref());
        debug!(
            event = "threshold_sample",
            kind = %kind,
            value,
            trigger_point = config.trigger_point
        );
        if value >= f64::from(config.trigger_point) {
            callback(true);
            if config.one_shot {
                info!(event = "threshold_one_shot_fired", kind = %kind, value);
                break;
            }
        }
    }
}

/// The RAM and graphics monitors of one page.
pub struct MemoryMonitors {
    pub ram: ThresholdMonitor,
    pub gfx: ThresholdMonitor,
}

impl MemoryMonitors {
    pub fn new(source: Arc<dyn DiagnosticsSource>) -> Self {
        Self {
            ram: ThresholdMonitor::new(MetricKind::Ram, Arc::clone(&source)),
            gfx: ThresholdMonitor::new(MetricKind::Graphics, source),
        }
    }

    pub fn monitor_mut(&mut self, kind: MetricKind) -> &mut ThresholdMonitor {
        match kind {
            MetricKind::Ram => &mut self.ram,
            MetricKind::Graphics => &mut self.gfx,
        }
    }
}
