//! Resource watchdog for a running command.
//!
//! Runs on its own thread next to the runner's wait loop. Both hold the same
//! [`ProcessGroup`], so whichever side fires first tears the tree down and the
//! other side's kill is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use warden_sandbox::tree::TreeSampler;
use warden_sandbox::ProcessGroup;

use crate::config::ResourceConfig;

const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f64,
    pub cpu_consecutive_samples: u32,
    pub poll_interval: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&ResourceConfig::default())
    }
}

impl From<&ResourceConfig> for ResourceLimits {
    fn from(config: &ResourceConfig) -> Self {
        Self {
            max_memory_bytes: config.max_memory_bytes,
            max_cpu_percent: config.max_cpu_percent,
            cpu_consecutive_samples: config.cpu_consecutive_samples.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub rss_bytes: u64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
}

/// Why a command was stopped before it exited on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    Timeout { timeout_secs: u64 },
    Cancelled,
    ResourceExceeded {
        resource: ResourceKind,
        observed: f64,
        limit: f64,
    },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Timeout { timeout_secs } => {
                write!(f, "Command timed out after {} seconds", timeout_secs)
            }
            TerminationReason::Cancelled => write!(f, "Command was cancelled"),
            TerminationReason::ResourceExceeded {
                resource: ResourceKind::Memory,
                observed,
                limit,
            } => write!(
                f,
                "Process terminated: memory usage {} bytes exceeded limit of {} bytes",
                *observed as u64, *limit as u64
            ),
            TerminationReason::ResourceExceeded {
                resource: ResourceKind::Cpu,
                observed,
                limit,
            } => write!(
                f,
                "Process terminated: CPU usage {:.1}% exceeded limit of {:.1}%",
                observed, limit
            ),
        }
    }
}

/// Decides on a stream of samples. Kept separate from the thread so the
/// thresholds can be exercised without real processes.
#[derive(Debug)]
struct LimitTracker {
    limits: ResourceLimits,
    cpu_streak: u32,
}

impl LimitTracker {
    fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            cpu_streak: 0,
        }
    }

    fn observe(&mut self, sample: &ResourceSample) -> Option<TerminationReason> {
        if sample.rss_bytes > self.limits.max_memory_bytes {
            return Some(TerminationReason::ResourceExceeded {
                resource: ResourceKind::Memory,
                observed: sample.rss_bytes as f64,
                limit: self.limits.max_memory_bytes as f64,
            });
        }

        if sample.cpu_percent > self.limits.max_cpu_percent {
            self.cpu_streak += 1;
            if self.cpu_streak >= self.limits.cpu_consecutive_samples {
                return Some(TerminationReason::ResourceExceeded {
                    resource: ResourceKind::Cpu,
                    observed: sample.cpu_percent,
                    limit: self.limits.max_cpu_percent,
                });
            }
        } else {
            self.cpu_streak = 0;
        }
        None
    }
}

pub struct ResourceMonitor {
    limits: ResourceLimits,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    /// Sample the tree led by `group` until it exits, `cancel` is set, or a
    /// limit is breached. On breach the group is killed and the reason returned.
    pub fn watch(
        &self,
        group: &Arc<dyn ProcessGroup>,
        cancel: &CancelToken,
    ) -> Option<TerminationReason> {
        let mut sampler = TreeSampler::new(group.leader());
        let mut tracker = LimitTracker::new(self.limits.clone());

        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let usage = sampler.sample()?;
            let sample = ResourceSample {
                timestamp: Utc::now(),
                rss_bytes: usage.rss_bytes,
                cpu_percent: usage.cpu_percent,
            };
            debug!(
                "resource sample | pid={} rss_bytes={} cpu_percent={:.1} members={}",
                group.leader(),
                sample.rss_bytes,
                sample.cpu_percent,
                usage.pids.len()
            );

            if let Some(reason) = tracker.observe(&sample) {
                warn!(target: "warden", "resource limit exceeded | pid={} reason={}", group.leader(), reason);
                if let Err(err) = group.kill() {
                    warn!("failed to kill process group {}: {}", group.leader(), err);
                }
                return Some(reason);
            }

            let wake = Instant::now() + self.limits.poll_interval;
            while Instant::now() < wake {
                if cancel.is_cancelled() {
                    return None;
                }
                thread::sleep(CANCEL_CHECK_SLICE.min(self.limits.poll_interval));
            }
        }
    }

    /// Run [`watch`](Self::watch) on a dedicated thread.
    pub fn spawn(self, group: Arc<dyn ProcessGroup>, cancel: CancelToken) -> MonitorHandle {
        let handle = thread::Builder::new()
            .name("warden-monitor".into())
            .spawn(move || self.watch(&group, &cancel));
        match handle {
            Ok(handle) => MonitorHandle(Some(handle)),
            Err(err) => {
                warn!("failed to start resource monitor: {}", err);
                MonitorHandle(None)
            }
        }
    }
}

pub struct MonitorHandle(Option<JoinHandle<Option<TerminationReason>>>);

impl MonitorHandle {
    /// Wait for the monitor thread. The caller sets its cancel token first.
    pub fn join(self) -> Option<TerminationReason> {
        self.0.and_then(|handle| handle.join().ok().flatten())
    }
}
