//! Event bus - typed publish/subscribe with a dedicated dispatch loop
//!
//! `publish` assigns the sequence number and pushes onto an unbounded FIFO;
//! it never blocks on handlers. A single dispatcher on a blocking thread
//! delivers each event to the subscribers of its kind, in subscription order.
//!
//! Each subscriber carries a reentrant gate held for the duration of its
//! delivery. `unsubscribe` takes the gate after removing the subscriber, so it
//! waits for an in-progress delivery and nothing is delivered afterwards. The
//! gate is reentrant so a handler can unsubscribe itself.

use crate::domain::event::{Event, EventKind, EventPayload};
use crate::domain::types::epoch_ms;
use crate::infra::metrics::Metrics;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum BusError {
    #[error("event bus is shut down")]
    ShutDown,
}

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
    /// true while subscribed
    gate: Arc<ReentrantMutex<Cell<bool>>>,
}

struct SenderState {
    tx: Option<mpsc::UnboundedSender<Event>>,
    next_seq: u64,
}

struct Shared {
    sender: Mutex<SenderState>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription: Mutex<u64>,
    metrics: Arc<Metrics>,
}

/// Cloneable publishing and subscription handle
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

/// Consumer side of the bus queue
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Event>,
    shared: Arc<Shared>,
}

impl EventBus {
    pub fn new(metrics: Arc<Metrics>) -> (Self, Dispatcher) {
        Self::with_start_seq(1, metrics)
    }

    /// Bus whose first event gets `start_seq`
    pub fn with_start_seq(start_seq: u64, metrics: Arc<Metrics>) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            sender: Mutex::new(SenderState { tx: Some(tx), next_seq: start_seq }),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: Mutex::new(1),
            metrics,
        });
        (Self { shared: shared.clone() }, Dispatcher { rx, shared })
    }

    /// Queue an event for delivery; returns its sequence number
    pub fn publish(&self, payload: EventPayload) -> Result<u64, BusError> {
        let kind = payload.kind();
        let mut sender = self.shared.sender.lock();
        let Some(tx) = sender.tx.as_ref() else {
            drop(sender);
            warn!(kind = %kind, "publish_after_shutdown");
            return Err(BusError::ShutDown);
        };

        let seq = sender.next_seq;
        if tx.send(Event::new(seq, epoch_ms(), payload)).is_err() {
            drop(sender);
            warn!(kind = %kind, "publish_dispatcher_gone");
            return Err(BusError::ShutDown);
        }
        sender.next_seq += 1;
        drop(sender);

        self.shared.metrics.record_event_published();
        debug!(seq = %seq, kind = %kind, "event_published");
        Ok(seq)
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.shared.next_subscription.lock();
            let id = SubscriptionId(*next);
            *next += 1;
            id
        };
        self.shared.subscribers.write().push(Subscriber {
            id,
            kind,
            handler: Arc::new(handler),
            gate: Arc::new(ReentrantMutex::new(Cell::new(true))),
        });
        debug!(id = %id, kind = %kind, "subscribed");
        id
    }

    /// Remove a subscription, waiting for any delivery to it in progress
    ///
    /// Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscribers = self.shared.subscribers.write();
            let pos = subscribers.iter().position(|s| s.id == id);
            pos.map(|p| subscribers.remove(p))
        };
        let Some(subscriber) = removed else {
            return false;
        };
        let gate = subscriber.gate.lock();
        gate.set(false);
        debug!(id = %id, kind = %subscriber.kind, "unsubscribed");
        true
    }

    /// Seq the next published event will get
    pub fn next_seq(&self) -> u64 {
        self.shared.sender.lock().next_seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }

    /// Close the queue; the dispatcher drains what was queued and exits
    pub fn shutdown(&self) {
        let mut sender = self.shared.sender.lock();
        if sender.tx.take().is_some() {
            info!(next_seq = %sender.next_seq, "event_bus_shutdown");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.sender.lock().tx.is_none()
    }
}

impl Dispatcher {
    /// Run the dispatch loop on the blocking pool
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Deliver events until the bus is shut down and the queue is empty
    pub fn run(mut self) {
        info!("event_dispatcher_started");
        let mut delivered = 0u64;
        while let Some(event) = self.rx.blocking_recv() {
            self.deliver(&event);
            delivered += 1;
        }
        info!(events = %delivered, "event_dispatcher_stopped");
    }

    fn deliver(&self, event: &Event) {
        let kind = event.kind();
        let targets: Vec<Subscriber> = self
            .shared
            .subscribers
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect();

        for subscriber in targets {
            let gate = subscriber.gate.lock();
            if !gate.get() {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event)));
            drop(gate);

            match result {
                Ok(Ok(())) => self.shared.metrics.record_delivery(true),
                Ok(Err(e)) => {
                    self.shared.metrics.record_delivery(false);
                    warn!(id = %subscriber.id, seq = %event.seq, kind = %kind, error = %e, "handler_failed");
                }
                Err(panic) => {
                    self.shared.metrics.record_delivery(false);
                    warn!(
                        id = %subscriber.id,
                        seq = %event.seq,
                        kind = %kind,
                        panic = %panic_message(&panic),
                        "handler_panicked"
                    );
                }
            }
        }
    }
}

#[cold]
fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
