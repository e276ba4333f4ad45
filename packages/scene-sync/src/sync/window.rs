//! Per-field reconciliation windows.
//!
//! A window opens with the first observed change to a field and stays open
//! for a fixed length. If both sides report differing values before it
//! closes, the field is in conflict. A conflict is reported once per window,
//! however many further writes land in it.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use super::Side;
use crate::core::Parameter;

/// Values closer than this are the same write.
const VALUE_EPSILON: f32 = 1e-6;

pub(crate) fn same_value(a: f32, b: f32) -> bool {
    (a - b).abs() <= VALUE_EPSILON
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Observation {
    value: f32,
    confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    opened_at: DateTime<Utc>,
    store: Option<Observation>,
    coordinator: Option<Observation>,
    conflicted: bool,
}

impl Entry {
    fn side_mut(&mut self, side: Side) -> &mut Option<Observation> {
        match side {
            Side::Store => &mut self.store,
            Side::Coordinator => &mut self.coordinator,
        }
    }

    /// Latest confirmation wins; a tie goes to the store.
    fn resolve(&self) -> Option<(Side, f32)> {
        match (self.store, self.coordinator) {
            (Some(store), Some(coordinator)) if coordinator.confirmed_at > store.confirmed_at => {
                Some((Side::Coordinator, coordinator.value))
            }
            (Some(store), _) => Some((Side::Store, store.value)),
            (None, Some(coordinator)) => Some((Side::Coordinator, coordinator.value)),
            (None, None) => None,
        }
    }
}

/// Both sides wrote different values to the same field in one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conflict {
    pub parameter: Parameter,
    pub store_value: f32,
    pub coordinator_value: f32,
}

/// Outcome of a closed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub parameter: Parameter,
    pub value: f32,
    pub winner: Side,
    /// A conflict was reported while the window was open.
    pub conflicted: bool,
}

#[derive(Debug, Clone)]
pub struct ReconciliationWindow {
    length: Duration,
    entries: BTreeMap<Parameter, Entry>,
}

impl ReconciliationWindow {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            entries: BTreeMap::new(),
        }
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    /// Record a confirmed write from one side.
    ///
    /// Returns a conflict the first time the two sides disagree within this
    /// window. A later write from the same side replaces the earlier one.
    pub fn observe(
        &mut self,
        side: Side,
        parameter: Parameter,
        value: f32,
        confirmed_at: DateTime<Utc>,
    ) -> Option<Conflict> {
        let entry = self.entries.entry(parameter).or_insert_with(|| Entry {
            opened_at: confirmed_at,
            store: None,
            coordinator: None,
            conflicted: false,
        });
        // Changes can be drained out of order; the window dates from the oldest.
        entry.opened_at = entry.opened_at.min(confirmed_at);
        *entry.side_mut(side) = Some(Observation { value, confirmed_at });
        trace!(%parameter, ?side, value, "window observation");

        if entry.conflicted {
            return None;
        }
        let (Some(store), Some(coordinator)) = (entry.store, entry.coordinator) else {
            return None;
        };
        if same_value(store.value, coordinator.value) {
            return None;
        }

        entry.conflicted = true;
        debug!(
            %parameter,
            store_value = store.value,
            coordinator_value = coordinator.value,
            "conflicting writes in one window"
        );
        Some(Conflict {
            parameter,
            store_value: store.value,
            coordinator_value: coordinator.value,
        })
    }

    /// Close every window that has been open for its full length.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Resolution> {
        let length = self.length;
        let due: Vec<Parameter> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.opened_at >= length)
            .map(|(parameter, _)| *parameter)
            .collect();
        self.close(due)
    }

    /// Close every open window regardless of age.
    pub fn flush(&mut self) -> Vec<Resolution> {
        let all: Vec<Parameter> = self.entries.keys().copied().collect();
        self.close(all)
    }

    pub fn is_open(&self, parameter: Parameter) -> bool {
        self.entries.contains_key(&parameter)
    }

    pub fn open_fields(&self) -> usize {
        self.entries.len()
    }

    /// When the oldest open window is due.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.values().map(|entry| entry.opened_at + self.length).min()
    }

    fn close(&mut self, parameters: Vec<Parameter>) -> Vec<Resolution> {
        parameters
            .into_iter()
            .filter_map(|parameter| {
                let entry = self.entries.remove(&parameter)?;
                let (winner, value) = entry.resolve()?;
                Some(Resolution {
                    parameter,
                    value,
                    winner,
                    conflicted: entry.conflicted,
                })
            })
            .collect()
    }
}
