// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::events::AgentEvent;

/// Bounded fan-out capacity.  A consumer that falls further behind than
/// this loses the oldest events and receives a `lag_warning` instead;
/// producers never block on slow consumers.
const BUS_CAPACITY: usize = 1024;

/// An event plus its session id and a per-session monotonic sequence
/// number, as rendered on the RPC stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: AgentEvent,
    pub session_id: String,
    pub seq: u64,
}

/// Broadcast bus for one agent session.  Single producer per session;
/// subscribers observe events in emission order.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    seq: Arc<AtomicU64>,
    session_id: Arc<Mutex<String>>,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            session_id: Arc::new(Mutex::new(session_id.into())),
        }
    }

    /// Point the bus at a different session (after `switch_session`); the
    /// sequence restarts so each session's stream is independently ordered.
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        *self.session_id.lock().unwrap() = session_id.into();
        self.seq.store(0, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    pub fn emit(&self, event: AgentEvent) {
        let envelope = EventEnvelope {
            event,
            session_id: self.session_id(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        // No receivers is fine; events are fire-and-forget.
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            session_id: Arc::clone(&self.session_id),
        }
    }
}

pub struct EventSubscriber {
    rx: broadcast::Receiver<EventEnvelope>,
    session_id: Arc<Mutex<String>>,
}

impl EventSubscriber {
    /// Next event, or `None` when the bus is gone.  Falling behind yields a
    /// synthesized `lag_warning` in place of the dropped events.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        match self.rx.recv().await {
            Ok(envelope) => Some(envelope),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(EventEnvelope {
                event: AgentEvent::LagWarning { skipped },
                session_id: self.session_id.lock().unwrap().clone(),
                seq: 0,
            }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
