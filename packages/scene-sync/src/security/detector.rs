//! Threat detector actor.
//!
//! A bounded pattern heuristic over recent performance samples and context
//! changes. Each matched pattern contributes a fixed weight; the sum (capped
//! at 1.0) is the detection confidence.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::actor::Actor;
use super::ThreatMetrics;
use crate::config::{BreakerConfig, SecurityConfig};
use crate::context::PerformanceSnapshot;
use crate::core::RegionId;

/// Samples inspected for sustained degradation.
const SUSTAINED_LOOKBACK: usize = 5;
/// Degraded samples within the lookback that count as sustained.
const SUSTAINED_MIN: usize = 3;
/// Memory use above this share of the ceiling counts as pressure.
const MEMORY_PRESSURE_RATIO: f64 = 0.9;
/// Frame time above this multiple of the minimum-fps budget counts as a spike.
const FRAME_SPIKE_RATIO: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThreatPattern {
    FrameDrop,
    FrameTimeSpike,
    MemoryPressure,
    CpuSaturation,
    RapidReconfiguration,
    SustainedDegradation,
}

impl ThreatPattern {
    pub fn weight(self) -> f64 {
        match self {
            ThreatPattern::FrameDrop => 0.35,
            ThreatPattern::FrameTimeSpike => 0.25,
            ThreatPattern::MemoryPressure => 0.25,
            ThreatPattern::CpuSaturation => 0.2,
            ThreatPattern::RapidReconfiguration => 0.3,
            ThreatPattern::SustainedDegradation => 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DetectorMessage {
    Sample(PerformanceSnapshot),
    ContextChanged { region: RegionId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutput {
    Metrics(ThreatMetrics),
    Threat {
        confidence: f64,
        pattern: ThreatPattern,
        degraded: bool,
    },
}

pub struct ThreatDetector {
    ceilings: BreakerConfig,
    threshold: f64,
    window: usize,
    rapid_change_limit: usize,
    samples: VecDeque<PerformanceSnapshot>,
    changes: VecDeque<DateTime<Utc>>,
}

impl ThreatDetector {
    pub fn new(security: &SecurityConfig, ceilings: &BreakerConfig) -> Self {
        Self {
            ceilings: ceilings.clone(),
            threshold: security.threat_threshold,
            window: security.detector_window.max(SUSTAINED_LOOKBACK),
            rapid_change_limit: security.rapid_change_limit,
            samples: VecDeque::new(),
            changes: VecDeque::new(),
        }
    }

    fn prune_changes(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::seconds(1);
        while self.changes.front().is_some_and(|at| *at < horizon) {
            self.changes.pop_front();
        }
    }

    fn matched_patterns(&self, latest: &PerformanceSnapshot) -> Vec<ThreatPattern> {
        let mut matched = Vec::new();
        let ceilings = &self.ceilings;

        if latest.fps < ceilings.min_fps {
            matched.push(ThreatPattern::FrameDrop);
        }
        if ceilings.min_fps > 0.0 && latest.frame_time_ms > 1000.0 / ceilings.min_fps * FRAME_SPIKE_RATIO {
            matched.push(ThreatPattern::FrameTimeSpike);
        }
        if latest.memory_mb > ceilings.max_memory_mb * MEMORY_PRESSURE_RATIO {
            matched.push(ThreatPattern::MemoryPressure);
        }
        if latest.cpu_percent > ceilings.max_cpu_percent {
            matched.push(ThreatPattern::CpuSaturation);
        }
        if self.changes.len() > self.rapid_change_limit {
            matched.push(ThreatPattern::RapidReconfiguration);
        }

        let degraded_recently = self
            .samples
            .iter()
            .rev()
            .take(SUSTAINED_LOOKBACK)
            .filter(|sample| ceilings.is_degraded(sample))
            .count();
        if degraded_recently >= SUSTAINED_MIN {
            matched.push(ThreatPattern::SustainedDegradation);
        }
        matched
    }

    fn evaluate(&mut self, sample: PerformanceSnapshot, now: DateTime<Utc>) -> Vec<DetectorOutput> {
        self.samples.push_back(sample);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
        self.prune_changes(now);

        let Some(latest) = self.samples.back() else {
            return Vec::new();
        };
        let degraded = self.ceilings.is_degraded(latest);
        let matched = self.matched_patterns(latest);

        let confidence = matched.iter().map(|p| p.weight()).sum::<f64>().min(1.0);
        let dominant = matched
            .iter()
            .copied()
            .max_by(|a, b| a.weight().total_cmp(&b.weight()));

        let metrics = ThreatMetrics {
            detection_confidence: confidence,
            pattern_match_count: matched.len() as u32,
            dominant_pattern: dominant,
            degraded,
            last_updated: Some(now),
        };

        let mut outputs = vec![DetectorOutput::Metrics(metrics)];
        if let Some(pattern) = dominant.filter(|_| confidence >= self.threshold) {
            debug!(confidence, ?pattern, degraded, "threat detected");
            outputs.push(DetectorOutput::Threat {
                confidence,
                pattern,
                degraded,
            });
        }
        outputs
    }
}

impl Actor for ThreatDetector {
    type Message = DetectorMessage;
    type Output = DetectorOutput;

    fn name(&self) -> &'static str {
        "threat-detector"
    }

    fn handle(&mut self, message: DetectorMessage, now: DateTime<Utc>) -> Vec<DetectorOutput> {
        match message {
            DetectorMessage::Sample(sample) => self.evaluate(sample, now),
            DetectorMessage::ContextChanged { region } => {
                self.changes.push_back(now);
                self.prune_changes(now);
                debug!(%region, recent = self.changes.len(), "context change observed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ThreatDetector {
        ThreatDetector::new(&SecurityConfig::default(), &BreakerConfig::default())
    }

    fn sample(fps: f64, frame_time_ms: f64, memory_mb: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            fps,
            frame_time_ms,
            memory_mb,
            cpu_percent: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn threats(outputs: &[DetectorOutput]) -> Vec<&DetectorOutput> {
        outputs
            .iter()
            .filter(|o| matches!(o, DetectorOutput::Threat { .. }))
            .collect()
    }

    #[test]
    fn healthy_samples_produce_metrics_only() {
        let mut detector = detector();
        let outputs = detector.handle(DetectorMessage::Sample(sample(60.0, 16.0, 100.0)), Utc::now());

        assert_eq!(outputs.len(), 1);
        let DetectorOutput::Metrics(metrics) = &outputs[0] else {
            panic!("expected metrics");
        };
        assert_eq!(metrics.detection_confidence, 0.0);
        assert!(!metrics.degraded);
    }

    #[test]
    fn combined_patterns_cross_threshold() {
        let mut detector = detector();
        // frame drop + frame spike + memory pressure = 0.85
        let outputs = detector.handle(DetectorMessage::Sample(sample(20.0, 50.0, 250.0)), Utc::now());

        let found = threats(&outputs);
        assert_eq!(found.len(), 1);
        assert!(matches!(
            found[0],
            DetectorOutput::Threat {
                pattern: ThreatPattern::FrameDrop,
                degraded: true,
                ..
            }
        ));
    }

    #[test]
    fn sustained_degradation_builds_up() {
        let mut detector = detector();
        let now = Utc::now();

        // frame drop + spike = 0.6, below threshold on its own
        for _ in 0..2 {
            let outputs = detector.handle(DetectorMessage::Sample(sample(20.0, 50.0, 10.0)), now);
            assert!(threats(&outputs).is_empty());
        }

        let outputs = detector.handle(DetectorMessage::Sample(sample(20.0, 50.0, 10.0)), now);
        assert_eq!(threats(&outputs).len(), 1);
    }

    #[test]
    fn rapid_reconfiguration_counts_recent_changes_only() {
        let mut detector = detector();
        let start = Utc::now();
        for _ in 0..13 {
            detector.handle(DetectorMessage::ContextChanged { region: RegionId::Bloom }, start);
        }

        let outputs = detector.handle(DetectorMessage::Sample(sample(60.0, 16.0, 10.0)), start);
        let DetectorOutput::Metrics(metrics) = &outputs[0] else {
            panic!("expected metrics");
        };
        assert_eq!(metrics.dominant_pattern, Some(ThreatPattern::RapidReconfiguration));

        let later = start + Duration::seconds(2);
        let outputs = detector.handle(DetectorMessage::Sample(sample(60.0, 16.0, 10.0)), later);
        let DetectorOutput::Metrics(metrics) = &outputs[0] else {
            panic!("expected metrics");
        };
        assert_eq!(metrics.pattern_match_count, 0);
    }

    #[test]
    fn window_is_bounded() {
        let mut detector = detector();
        for _ in 0..100 {
            detector.handle(DetectorMessage::Sample(sample(60.0, 16.0, 10.0)), Utc::now());
        }
        assert_eq!(detector.samples.len(), SecurityConfig::default().detector_window);
    }
}
