// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured progress events from the pipeline.

use {
    log::info,
    std::{fmt, sync::Mutex},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Extract,
    Inventory,
    Authenticate,
    Reconcile,
    Portal,
    Rewrite,
    Sign,
    Package,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Extract => "extract",
            Self::Inventory => "inventory",
            Self::Authenticate => "authenticate",
            Self::Reconcile => "reconcile",
            Self::Portal => "portal",
            Self::Rewrite => "rewrite",
            Self::Sign => "sign",
            Self::Package => "package",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub current: usize,
    pub total: usize,
    pub detail: String,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: &ProgressEvent);
}

/// Default sink: renders through the logger.
#[derive(Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: &ProgressEvent) {
        if event.total > 1 {
            info!(
                "[{}] ({}/{}) {}",
                event.phase, event.current, event.total, event.detail
            );
        } else {
            info!("[{}] {}", event.phase, event.detail);
        }
    }
}

/// Test sink: records every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("sink mutex").clone()
    }

    pub fn details_for(&self, phase: Phase) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.phase == phase)
            .map(|e| e.detail)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: &ProgressEvent) {
        self.events.lock().expect("sink mutex").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_filters_by_phase() {
        let sink = RecordingSink::new();
        sink.event(&ProgressEvent {
            phase: Phase::Sign,
            current: 1,
            total: 2,
            detail: "child".into(),
        });
        sink.event(&ProgressEvent {
            phase: Phase::Package,
            current: 1,
            total: 1,
            detail: "out.ipa".into(),
        });

        assert_eq!(sink.details_for(Phase::Sign), vec!["child".to_string()]);
        assert_eq!(sink.events().len(), 2);
    }
}
