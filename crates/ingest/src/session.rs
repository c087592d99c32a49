//! Processor session: subscription lifecycle state and health counters.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use pullbridge_core::{ProcessorId, QueueName};

use crate::handler::{ErrorEvent, ErrorSource};

/// Lifecycle of one subscription.
///
/// ```text
/// initialized ──start──► processing ──stop──► stopped
///      │                     │                   ▲
///      └──start failed──► faulted ──stop─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initialized,
    Processing,
    Stopped,
    Faulted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initialized => "initialized",
            SessionState::Processing => "processing",
            SessionState::Stopped => "stopped",
            SessionState::Faulted => "faulted",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initialized, Processing)
                | (Initialized, Faulted)
                | (Initialized, Stopped)
                | (Processing, Stopped)
                | (Processing, Faulted)
                | (Faulted, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }
}

impl core::fmt::Display for SessionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent fault observed by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    pub source: ErrorSource,
    pub message: String,
    pub transient: bool,
    pub at: DateTime<Utc>,
}

/// Point-in-time health of a processor session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHealth {
    pub processor_id: ProcessorId,
    pub queue: QueueName,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub deliveries_received: u64,
    pub deliveries_completed: u64,
    pub deliveries_abandoned: u64,
    /// Deliveries dropped after reaching `max_delivery_count`.
    pub deliveries_discarded: u64,
    pub faults: u64,
    pub last_fault: Option<FaultRecord>,
}

#[derive(Debug, Default)]
struct Counters {
    started_at: Option<DateTime<Utc>>,
    received: u64,
    completed: u64,
    abandoned: u64,
    discarded: u64,
    faults: u64,
    last_fault: Option<FaultRecord>,
}

/// Shared between the processor, its pump, and health queries.
#[derive(Debug)]
pub(crate) struct SessionTracker {
    processor_id: ProcessorId,
    queue: QueueName,
    state: watch::Sender<SessionState>,
    counters: Mutex<Counters>,
}

impl SessionTracker {
    pub(crate) fn new(processor_id: ProcessorId, queue: QueueName) -> Self {
        let (state, _) = watch::channel(SessionState::Initialized);
        Self {
            processor_id,
            queue,
            state,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Apply a transition if the state machine allows it. Returns whether it happened.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut from = next;
        let changed = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            if next == SessionState::Processing {
                self.counters().started_at = Some(Utc::now());
            }
            if next == SessionState::Faulted {
                warn!(processor_id = %self.processor_id, queue = %self.queue, from = %from, "processor session faulted");
            } else {
                info!(processor_id = %self.processor_id, queue = %self.queue, from = %from, to = %next, "processor session transition");
            }
        }
        changed
    }

    pub(crate) fn record_received(&self) {
        self.counters().received += 1;
    }

    pub(crate) fn record_completed(&self) {
        self.counters().completed += 1;
    }

    pub(crate) fn record_abandoned(&self) {
        self.counters().abandoned += 1;
    }

    pub(crate) fn record_discarded(&self) {
        self.counters().discarded += 1;
    }

    pub(crate) fn record_fault(&self, event: &ErrorEvent) {
        let mut counters = self.counters();
        counters.faults += 1;
        counters.last_fault = Some(FaultRecord {
            source: event.source,
            message: event.fault.to_string(),
            transient: event.fault.is_transient(),
            at: Utc::now(),
        });
    }

    /// Record a fault that has no [`ErrorEvent`] (e.g. a start-up timeout).
    pub(crate) fn record_lifecycle_fault(&self, source: ErrorSource, message: impl Into<String>) {
        let mut counters = self.counters();
        counters.faults += 1;
        counters.last_fault = Some(FaultRecord {
            source,
            message: message.into(),
            transient: false,
            at: Utc::now(),
        });
    }

    pub(crate) fn health(&self) -> SessionHealth {
        let state = self.state();
        let counters = self.counters();
        SessionHealth {
            processor_id: self.processor_id,
            queue: self.queue.clone(),
            state,
            started_at: counters.started_at,
            deliveries_received: counters.received,
            deliveries_completed: counters.completed,
            deliveries_abandoned: counters.abandoned,
            deliveries_discarded: counters.discarded,
            faults: counters.faults,
            last_fault: counters.last_fault.clone(),
        }
    }
}
