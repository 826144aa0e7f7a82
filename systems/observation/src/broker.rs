//! Message broker between agent workers and the admin's observation manager.

use belief_nest_core::Event;
use tokio::sync::{broadcast, mpsc};

use crate::AgentVitals;

const SIGNAL_CAPACITY: usize = 16;
const BATCH_CAPACITY: usize = 256;

/// Fanout signal telling workers whether to report events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingSignal {
    /// Start batching events.
    Start,
    /// Stop batching events.
    Stop,
}

/// Events an agent worker collected since its previous batch.
#[derive(Clone, Debug, PartialEq)]
pub struct EventBatch {
    /// Reporting agent.
    pub agent_name: String,
    /// Events in world-absolute coordinates.
    pub events: Vec<Event>,
    /// Own status, present only when it changed since the previous batch.
    pub vitals: Option<AgentVitals>,
}

/// Broker of one belief world's agent group.
#[derive(Clone, Debug)]
pub struct AgentBroker {
    signals: broadcast::Sender<SamplingSignal>,
    batches: mpsc::Sender<EventBatch>,
}

impl AgentBroker {
    pub(crate) fn new() -> (Self, mpsc::Receiver<EventBatch>) {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (batches, inbox) = mpsc::channel(BATCH_CAPACITY);
        (Self { signals, batches }, inbox)
    }

    /// Receiver of sampling signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SamplingSignal> {
        self.signals.subscribe()
    }

    /// Work queue workers report their batches to.
    #[must_use]
    pub fn batch_sender(&self) -> mpsc::Sender<EventBatch> {
        self.batches.clone()
    }

    pub(crate) fn publish(&self, signal: SamplingSignal) {
        let listeners = self.signals.send(signal).unwrap_or(0);
        tracing::debug!(?signal, listeners, "published sampling signal");
    }
}
