//! Runtime configuration.
//!
//! Every knob has a default; `from_env` overlays `SCENE_SYNC_*` variables
//! (loading `.env` first when present) and `from_json_file` reads a JSON
//! document with the same shape as [`SyncConfig`]'s serde form.

use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Duration;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::clock::millis;
use crate::context::PerformanceSnapshot;

/// Top-level configuration for the coordinator and render-sync service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub breaker: BreakerConfig,
    pub security: SecurityConfig,
    pub audit: AuditConfig,
    pub render_sync: RenderSyncConfig,
}

/// Circuit breaker thresholds, shared by every guarded operation class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// How often performance ceilings are re-evaluated.
    pub monitoring_period_ms: u64,
    pub max_cpu_percent: f64,
    pub max_memory_mb: f64,
    pub min_fps: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 5_000,
            monitoring_period_ms: 1_000,
            max_cpu_percent: 10.0,
            max_memory_mb: 256.0,
            min_fps: 45.0,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        millis(self.reset_timeout_ms)
    }

    pub fn monitoring_period(&self) -> Duration {
        millis(self.monitoring_period_ms)
    }

    /// True when a snapshot violates any performance ceiling.
    pub fn is_degraded(&self, snapshot: &PerformanceSnapshot) -> bool {
        snapshot.fps < self.min_fps
            || snapshot.cpu_percent > self.max_cpu_percent
            || snapshot.memory_mb > self.max_memory_mb
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Detection confidence at or above which a threat is reported.
    pub threat_threshold: f64,
    /// Consecutive detections that escalate NORMAL to WARNING.
    pub sustained_detections: u32,
    pub transition_duration_ms: u64,
    /// Performance samples kept by the threat detector.
    pub detector_window: usize,
    /// Context changes per second that count as rapid reconfiguration.
    pub rapid_change_limit: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            threat_threshold: 0.7,
            sustained_detections: 3,
            transition_duration_ms: 800,
            detector_window: 32,
            rapid_change_limit: 12,
        }
    }
}

impl SecurityConfig {
    pub fn transition_duration(&self) -> Duration {
        millis(self.transition_duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    /// Ring buffer size. Fixed for the lifetime of the logger.
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderSyncConfig {
    pub reconciliation_window_ms: u64,
    pub checkpoint_interval_ms: u64,
    pub retained_checkpoints: usize,
    /// Tick period of [`RenderSync::run`](crate::sync::RenderSync::run).
    pub poll_interval_ms: u64,
    /// Load and diff the latest valid checkpoint on start.
    pub recover_on_start: bool,
}

impl Default for RenderSyncConfig {
    fn default() -> Self {
        Self {
            reconciliation_window_ms: 100,
            checkpoint_interval_ms: 30_000,
            retained_checkpoints: 5,
            poll_interval_ms: 50,
            recover_on_start: true,
        }
    }
}

impl RenderSyncConfig {
    pub fn reconciliation_window(&self) -> Duration {
        millis(self.reconciliation_window_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        millis(self.checkpoint_interval_ms)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl SyncConfig {
    /// Defaults overlaid with `SCENE_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut config = Self::default();
        let breaker = &mut config.breaker;
        env_override("SCENE_SYNC_FAILURE_THRESHOLD", &mut breaker.failure_threshold)?;
        env_override("SCENE_SYNC_RESET_TIMEOUT_MS", &mut breaker.reset_timeout_ms)?;
        env_override("SCENE_SYNC_MONITORING_PERIOD_MS", &mut breaker.monitoring_period_ms)?;
        env_override("SCENE_SYNC_MAX_CPU_PERCENT", &mut breaker.max_cpu_percent)?;
        env_override("SCENE_SYNC_MAX_MEMORY_MB", &mut breaker.max_memory_mb)?;
        env_override("SCENE_SYNC_MIN_FPS", &mut breaker.min_fps)?;

        let security = &mut config.security;
        env_override("SCENE_SYNC_THREAT_THRESHOLD", &mut security.threat_threshold)?;
        env_override("SCENE_SYNC_SUSTAINED_DETECTIONS", &mut security.sustained_detections)?;
        env_override("SCENE_SYNC_TRANSITION_MS", &mut security.transition_duration_ms)?;

        env_override("SCENE_SYNC_AUDIT_CAPACITY", &mut config.audit.capacity)?;

        let sync = &mut config.render_sync;
        env_override("SCENE_SYNC_WINDOW_MS", &mut sync.reconciliation_window_ms)?;
        env_override("SCENE_SYNC_CHECKPOINT_INTERVAL_MS", &mut sync.checkpoint_interval_ms)?;
        env_override("SCENE_SYNC_RETAINED_CHECKPOINTS", &mut sync.retained_checkpoints)?;
        env_override("SCENE_SYNC_POLL_INTERVAL_MS", &mut sync.poll_interval_ms)?;

        Ok(config)
    }

    /// Read a JSON document; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("config file {} is not valid JSON", path.display()))
    }
}

fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = env::var(name) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid value"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.reset_timeout_ms, 5_000);
        assert_eq!(config.breaker.min_fps, 45.0);
        assert_eq!(config.security.threat_threshold, 0.7);
        assert_eq!(config.security.transition_duration_ms, 800);
        assert_eq!(config.audit.capacity, 256);
        assert_eq!(config.render_sync.reconciliation_window_ms, 100);
        assert_eq!(config.render_sync.retained_checkpoints, 5);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{ "breaker": { "failureThreshold": 5 }, "audit": { "capacity": 16 } }"#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.reset_timeout_ms, 5_000);
        assert_eq!(config.audit.capacity, 16);
        assert_eq!(config.security, SecurityConfig::default());
    }

    #[test]
    fn degraded_when_any_ceiling_is_crossed() {
        let config = BreakerConfig::default();
        let mut snapshot = PerformanceSnapshot::new(chrono::Utc::now());
        assert!(!config.is_degraded(&snapshot));

        snapshot.fps = 30.0;
        assert!(config.is_degraded(&snapshot));

        snapshot.fps = 60.0;
        snapshot.memory_mb = 300.0;
        assert!(config.is_degraded(&snapshot));
    }

    #[test]
    fn poll_interval_is_never_zero() {
        let config = RenderSyncConfig {
            poll_interval_ms: 0,
            ..RenderSyncConfig::default()
        };
        assert_eq!(config.poll_interval(), std::time::Duration::from_millis(1));
    }
}
