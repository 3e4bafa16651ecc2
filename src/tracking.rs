//! Experiment tracking events
//!
//! The core never talks to a tracking back end. It emits structured events
//! into a caller-supplied [`EventSink`]; forwarding them anywhere is the
//! caller's business.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ml::artifact::{ArtifactKind, ModelVersion};

/// Structured event for experiment tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackingEvent {
    /// Hyperparameters of a training run
    ParametersLogged { params: BTreeMap<String, String> },
    /// One artifact finished training
    TrainingCompleted {
        kind: ArtifactKind,
        version: ModelVersion,
        checksum: String,
        metrics: BTreeMap<String, f64>,
    },
    /// An artifact was attached to a scoring engine
    ArtifactLoaded { kind: ArtifactKind, version: ModelVersion },
    /// A series was scored
    ScoresProduced {
        ticker: String,
        verdicts: usize,
        flagged: usize,
        partial: usize,
    },
}

impl TrackingEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Receiver for tracking events
pub trait EventSink: Send + Sync {
    fn record(&self, event: TrackingEvent);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: TrackingEvent) {}
}

/// Keeps events in memory, for tests and small batch jobs
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TrackingEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn events(&self) -> Vec<TrackingEvent> {
        self.events.lock().clone()
    }

    /// Take everything recorded so far
    pub fn drain(&self) -> Vec<TrackingEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: TrackingEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.record(TrackingEvent::ArtifactLoaded {
            kind: ArtifactKind::Sequence,
            version: ModelVersion::new(1, 0, 0),
        });
        sink.record(TrackingEvent::ScoresProduced {
            ticker: "ACME".to_string(),
            verdicts: 60,
            flagged: 1,
            partial: 0,
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TrackingEvent::ArtifactLoaded { .. }));

        assert_eq!(sink.drain().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_sink_shared_across_threads() {
        let sink = Arc::new(MemorySink::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    sink.record(TrackingEvent::ScoresProduced {
                        ticker: format!("T{i}"),
                        verdicts: i,
                        flagged: 0,
                        partial: 0,
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let mut params = BTreeMap::new();
        params.insert("seed".to_string(), "42".to_string());
        let json = TrackingEvent::ParametersLogged { params }.to_json().unwrap();
        assert_eq!(json, r#"{"event":"parameters_logged","params":{"seed":"42"}}"#);
    }

    #[test]
    fn test_noop_sink() {
        NoopSink.record(TrackingEvent::ParametersLogged {
            params: BTreeMap::new(),
        });
    }
}
