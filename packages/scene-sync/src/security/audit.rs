//! Security audit trail.
//!
//! A fixed-capacity ring buffer: once full, the oldest entry is evicted for
//! each new one. Queries are lazy, finite and restartable (clone the
//! iterator to run it again). Capacity is set at construction and never
//! changes.
//!
//! # Usage
//!
//! ```ignore
//! let warnings: Vec<_> = coordinator
//!     .audit_log()
//!     .query(AuditFilter::default().min_level(SecurityLevel::Warning).limit(20))
//!     .collect();
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actor::Actor;
use super::SecurityLevel;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditEventType {
    LevelChange,
    ThreatDetection,
    Override,
    Preset,
    Rejection,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Monotonic across evictions.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Level in force when the entry was recorded (or the new level, for
    /// level changes).
    pub level: SecurityLevel,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub enum AuditMessage {
    Record {
        event_type: AuditEventType,
        /// `None` records under the logger's current level.
        level: Option<SecurityLevel>,
        detail: String,
    },
}

impl AuditMessage {
    pub fn record(event_type: AuditEventType, level: Option<SecurityLevel>, detail: impl Into<String>) -> Self {
        AuditMessage::Record {
            event_type,
            level,
            detail: detail.into(),
        }
    }
}

/// Every populated field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub min_level: Option<SecurityLevel>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn min_level(mut self, level: SecurityLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        self.event_type.map_or(true, |t| t == entry.event_type)
            && self.min_level.map_or(true, |l| entry.level.rank() >= l.rank())
            && self.since.map_or(true, |since| entry.timestamp >= since)
    }
}

/// Lazy query over the audit buffer, oldest first.
#[derive(Debug, Clone)]
pub struct AuditQuery<'a> {
    entries: std::collections::vec_deque::Iter<'a, AuditEntry>,
    filter: AuditFilter,
    remaining: Option<usize>,
}

impl<'a> Iterator for AuditQuery<'a> {
    type Item = &'a AuditEntry;

    fn next(&mut self) -> Option<&'a AuditEntry> {
        if self.remaining == Some(0) {
            return None;
        }
        let entry = self.entries.by_ref().find(|entry| self.filter.matches(entry))?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(entry)
    }
}

/// Serialized form produced by [`AuditLogger::export`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditExport {
    pub capacity: usize,
    /// Entries dropped to make room since the logger started.
    pub evicted: u64,
    pub entries: Vec<AuditEntry>,
}

pub struct AuditLogger {
    capacity: usize,
    entries: VecDeque<AuditEntry>,
    next_seq: u64,
    evicted: u64,
    current_level: SecurityLevel,
}

impl AuditLogger {
    pub fn new(capacity: usize, level: SecurityLevel) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            next_seq: 0,
            evicted: 0,
            current_level: level,
        }
    }

    pub fn append(
        &mut self,
        event_type: AuditEventType,
        level: Option<SecurityLevel>,
        detail: String,
        now: DateTime<Utc>,
    ) -> u64 {
        let level = level.unwrap_or(self.current_level);
        if event_type == AuditEventType::LevelChange {
            self.current_level = level;
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(AuditEntry {
            seq,
            timestamp: now,
            event_type,
            level,
            detail,
        });
        seq
    }

    pub fn query(&self, filter: AuditFilter) -> AuditQuery<'_> {
        AuditQuery {
            entries: self.entries.iter(),
            remaining: filter.limit,
            filter,
        }
    }

    pub fn export(&self) -> Result<Vec<u8>, SyncError> {
        let export = AuditExport {
            capacity: self.capacity,
            evicted: self.evicted,
            entries: self.entries.iter().cloned().collect(),
        };
        serde_json::to_vec(&export).map_err(|source| SyncError::Serialization {
            what: "audit export",
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Actor for AuditLogger {
    type Message = AuditMessage;
    type Output = u64;

    fn name(&self) -> &'static str {
        "audit-logger"
    }

    fn handle(&mut self, message: AuditMessage, now: DateTime<Utc>) -> Vec<u64> {
        match message {
            AuditMessage::Record {
                event_type,
                level,
                detail,
            } => vec![self.append(event_type, level, detail, now)],
        }
    }
}
