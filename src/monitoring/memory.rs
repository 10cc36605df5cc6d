//! Memory Watermark Monitor
//!
//! Samples process memory on a fixed interval and sheds cache layers when
//! usage crosses the critical watermark.
//!
//! | Usage               | Action                                   |
//! |---------------------|------------------------------------------|
//! | below warning       | debug log                                |
//! | warning..critical   | warn log                                 |
//! | at/above critical   | clear L3, recheck, L2, recheck, L1       |
//!
//! Cleanup stops as soon as a recheck reads below critical. After a
//! successful cleanup the next `post_cleanup_grace_samples` samples never
//! trigger another one; after a failed cleanup the next critical sample
//! does.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheMetrics, CacheTier, LayerControl, LayerCounts};
use crate::domain::{CacheEvent, EventPublisher, MemoryProbe, MemoryReading};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Memory monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMonitorConfig {
    pub check_interval: Duration,
    /// Usage percentage logged at warn level
    pub warning_percent: f64,
    /// Usage percentage that triggers layered cleanup
    pub critical_percent: f64,
    /// Samples skipped after a cleanup that got below critical
    pub post_cleanup_grace_samples: u32,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            warning_percent: 70.0,
            critical_percent: 80.0,
            post_cleanup_grace_samples: 1,
        }
    }
}

impl MemoryMonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(Error::Config("memory check interval must be positive".into()));
        }
        if !(self.warning_percent > 0.0
            && self.warning_percent < self.critical_percent
            && self.critical_percent <= 100.0)
        {
            return Err(Error::Config(format!(
                "memory thresholds must satisfy 0 < warning < critical <= 100 (got {} / {})",
                self.warning_percent, self.critical_percent
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Samples and Reports
// =============================================================================

/// Watermark band of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
    /// No successful sample yet, or the last one failed
    Unknown,
}

/// Point-in-time memory reading plus layer sizes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySample {
    pub reading: MemoryReading,
    pub usage_percent: f64,
    pub counts: LayerCounts,
    pub taken_at: DateTime<Utc>,
}

/// One layer cleared during cleanup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupStep {
    pub tier: CacheTier,
    pub entries_cleared: usize,
    pub elapsed: Duration,
    pub usage_after_percent: f64,
}

/// Outcome of one layered cleanup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub usage_before_percent: f64,
    pub usage_after_percent: f64,
    pub steps: Vec<CleanupStep>,
    /// Usage ended below critical
    pub succeeded: bool,
}

impl CleanupReport {
    pub fn cleared_tiers(&self) -> Vec<CacheTier> {
        self.steps.iter().map(|s| s.tier).collect()
    }

    pub fn entries_cleared(&self) -> usize {
        self.steps.iter().map(|s| s.entries_cleared).sum()
    }
}

/// What one monitor tick did
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    Normal(f64),
    Warning(f64),
    Cleaned(CleanupReport),
    /// Critical, but inside the post-cleanup grace window
    Grace(f64),
    ProbeFailed(String),
}

// =============================================================================
// Monitor
// =============================================================================

/// Memory watermark monitor
pub struct MemoryWatermarkMonitor {
    probe: Arc<dyn MemoryProbe>,
    layers: Arc<dyn LayerControl>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<CacheMetrics>,
    config: MemoryMonitorConfig,
    grace_remaining: AtomicU32,
    last_sample: RwLock<Option<MemorySample>>,
    level: RwLock<MemoryLevel>,
}

impl MemoryWatermarkMonitor {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        layers: Arc<dyn LayerControl>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<CacheMetrics>,
        config: MemoryMonitorConfig,
    ) -> Self {
        Self {
            probe,
            layers,
            publisher,
            metrics,
            config,
            grace_remaining: AtomicU32::new(0),
            last_sample: RwLock::new(None),
            level: RwLock::new(MemoryLevel::Unknown),
        }
    }

    pub fn config(&self) -> &MemoryMonitorConfig {
        &self.config
    }

    pub fn level(&self) -> MemoryLevel {
        *self.level.read()
    }

    pub fn last_sample(&self) -> Option<MemorySample> {
        self.last_sample.read().clone()
    }

    fn classify(&self, usage: f64) -> MemoryLevel {
        if usage >= self.config.critical_percent {
            MemoryLevel::Critical
        } else if usage >= self.config.warning_percent {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    /// Take one sample and act on it
    pub async fn check_once(&self) -> MonitorOutcome {
        let reading = match self.probe.sample() {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Memory sample failed");
                *self.level.write() = MemoryLevel::Unknown;
                return MonitorOutcome::ProbeFailed(e.to_string());
            }
        };

        let usage = reading.usage_percent();
        let counts = self.layers.entry_counts();
        *self.last_sample.write() = Some(MemorySample {
            reading,
            usage_percent: usage,
            counts,
            taken_at: Utc::now(),
        });
        let level = self.classify(usage);
        *self.level.write() = level;

        let in_grace = self
            .grace_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();

        match level {
            MemoryLevel::Critical if in_grace => {
                info!(usage_percent = usage, "Memory critical inside post-cleanup grace window");
                MonitorOutcome::Grace(usage)
            }
            MemoryLevel::Critical => {
                warn!(
                    usage_percent = usage,
                    critical_percent = self.config.critical_percent,
                    l1 = counts.l1,
                    l2 = counts.l2,
                    l3 = counts.l3,
                    "Memory critical, starting layered cleanup"
                );
                let report = self.cleanup(usage).await;
                let grace = if report.succeeded {
                    self.config.post_cleanup_grace_samples
                } else {
                    0
                };
                self.grace_remaining.store(grace, Ordering::Release);
                MonitorOutcome::Cleaned(report)
            }
            MemoryLevel::Warning => {
                warn!(
                    usage_percent = usage,
                    warning_percent = self.config.warning_percent,
                    "Memory above warning watermark"
                );
                MonitorOutcome::Warning(usage)
            }
            _ => {
                debug!(usage_percent = usage, "Memory sample");
                MonitorOutcome::Normal(usage)
            }
        }
    }

    /// Clear layers in cleanup order until usage reads below critical
    async fn cleanup(&self, usage_before: f64) -> CleanupReport {
        let mut steps = Vec::new();
        let mut usage = usage_before;

        for tier in CacheTier::CLEANUP_ORDER {
            let started = Instant::now();
            let cleared = self.layers.clear_layer(tier);
            let elapsed = started.elapsed();

            usage = match self.probe.sample() {
                Ok(reading) => reading.usage_percent(),
                Err(e) => {
                    warn!(error = %e, layer = %tier, "Memory recheck failed, continuing cleanup");
                    usage
                }
            };

            info!(
                layer = %tier,
                entries_cleared = cleared,
                elapsed_us = elapsed.as_micros() as u64,
                usage_after_percent = usage,
                "Cleared cache layer"
            );
            self.publish(CacheEvent::layer_cleared(tier, cleared, elapsed, usage))
                .await;
            steps.push(CleanupStep {
                tier,
                entries_cleared: cleared,
                elapsed,
                usage_after_percent: usage,
            });

            if usage < self.config.critical_percent {
                break;
            }
        }

        let succeeded = usage < self.config.critical_percent;
        let report = CleanupReport {
            usage_before_percent: usage_before,
            usage_after_percent: usage,
            steps,
            succeeded,
        };
        self.metrics.record_cleanup(report.entries_cleared(), succeeded);
        *self.level.write() = self.classify(usage);

        if !succeeded {
            let failure = Error::MemoryPressureCleanupFailure {
                usage_percent: usage,
                critical_percent: self.config.critical_percent,
            };
            error!(error = %failure, "Layered cleanup could not relieve memory pressure");
            self.publish(CacheEvent::cleanup_failed(usage, self.config.critical_percent))
                .await;
        }

        report
    }

    async fn publish(&self, event: CacheEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish memory event");
        }
    }

    /// Run until `cancel` fires
    #[instrument(skip_all, name = "memory_monitor")]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.check_interval.as_secs_f64(),
            warning_percent = self.config.warning_percent,
            critical_percent = self.config.critical_percent,
            "Memory monitor starting"
        );

        let mut tick = tokio::time::interval(self.config.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.check_once().await;
                }
            }
        }

        info!("Memory monitor stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
