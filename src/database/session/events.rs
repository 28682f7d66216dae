//! Flush notifications
//!
//! Sessions publish a [`FlushEvent`] right before and right after they write
//! pending changes. Delivery is synchronous and happens on the thread that
//! flushed, so observers see the session in exactly the state it is in at
//! that boundary.

use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use super::unit_of_work::Session;

/// Which side of a flush an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushEventKind {
    BeforeFlush,
    AfterFlush,
}

impl std::fmt::Display for FlushEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushEventKind::BeforeFlush => write!(f, "before-flush"),
            FlushEventKind::AfterFlush => write!(f, "after-flush"),
        }
    }
}

/// Notification carrying the session that is flushing
#[derive(Debug, Clone, Copy)]
pub enum FlushEvent<'a> {
    /// Published before any pending change is written
    BeforeSessionFlush { session: &'a Session },
    /// Published after all pending changes were written
    SessionFlushed { session: &'a Session },
}

impl<'a> FlushEvent<'a> {
    pub fn session(&self) -> &'a Session {
        match self {
            FlushEvent::BeforeSessionFlush { session } | FlushEvent::SessionFlushed { session } => {
                *session
            }
        }
    }

    pub fn kind(&self) -> FlushEventKind {
        match self {
            FlushEvent::BeforeSessionFlush { .. } => FlushEventKind::BeforeFlush,
            FlushEvent::SessionFlushed { .. } => FlushEventKind::AfterFlush,
        }
    }
}

/// Receiver of flush notifications
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: &FlushEvent<'_>);
}

impl<F> NotificationSink for F
where
    F: Fn(&FlushEvent<'_>) + Send + Sync,
{
    fn publish(&self, event: &FlushEvent<'_>) {
        self(event)
    }
}

/// Sink that records flush events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn publish(&self, event: &FlushEvent<'_>) {
        let session = event.session();
        debug!(
            session = session.id(),
            engine = session.engine().id(),
            pending = session.pending_count(),
            "{}",
            event.kind()
        );
    }
}

/// Ordered list of sinks notified on every flush
#[derive(Default)]
pub struct FlushObservers {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl FlushObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Subscribe a closure
    pub fn subscribe_fn<F>(&self, sink: F)
    where
        F: Fn(&FlushEvent<'_>) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `event` to every sink in subscription order
    pub fn publish(&self, event: &FlushEvent<'_>) {
        // Snapshot so sinks may subscribe further sinks while being notified
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in sinks {
            sink.publish(event);
        }
    }
}

impl std::fmt::Debug for FlushObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushObservers")
            .field("sinks", &self.len())
            .finish()
    }
}
