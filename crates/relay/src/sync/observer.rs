// Session lifecycle hooks.
//
// Observers see connects, disconnects, session creation/teardown and every
// fetch/store. Hooks run inline on the calling task and must not block.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    auth::authenticator::AuthContext,
    sync::{
        coordinator::{FetchOutcome, PersistenceError, StoreOutcome},
        session::ConnectionId,
    },
};

const LIFECYCLE_EVENT_CAPACITY: usize = 256;

pub trait SessionObserver: Send + Sync {
    fn on_connect(&self, _ctx: &AuthContext, _connection_id: ConnectionId) {}

    fn on_disconnect(&self, _ctx: &AuthContext, _connection_id: ConnectionId) {}

    fn on_session_created(&self, _document_id: &str) {}

    fn on_session_idle(&self, _document_id: &str) {}

    fn on_fetch(&self, _document_id: &str, _outcome: &FetchOutcome) {}

    fn on_store(&self, _document_id: &str, _result: Result<&StoreOutcome, &PersistenceError>) {}
}

/// Fans every hook out to the registered observers in order.
#[derive(Clone, Default)]
pub struct ObserverChain {
    observers: Arc<Vec<Arc<dyn SessionObserver>>>,
}

impl ObserverChain {
    pub fn new(observers: Vec<Arc<dyn SessionObserver>>) -> Self {
        Self { observers: Arc::new(observers) }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn on_connect(&self, ctx: &AuthContext, connection_id: ConnectionId) {
        self.observers.iter().for_each(|observer| observer.on_connect(ctx, connection_id));
    }

    pub fn on_disconnect(&self, ctx: &AuthContext, connection_id: ConnectionId) {
        self.observers.iter().for_each(|observer| observer.on_disconnect(ctx, connection_id));
    }

    pub fn on_session_created(&self, document_id: &str) {
        self.observers.iter().for_each(|observer| observer.on_session_created(document_id));
    }

    pub fn on_session_idle(&self, document_id: &str) {
        self.observers.iter().for_each(|observer| observer.on_session_idle(document_id));
    }

    pub fn on_fetch(&self, document_id: &str, outcome: &FetchOutcome) {
        self.observers.iter().for_each(|observer| observer.on_fetch(document_id, outcome));
    }

    pub fn on_store(&self, document_id: &str, result: Result<&StoreOutcome, &PersistenceError>) {
        self.observers.iter().for_each(|observer| observer.on_store(document_id, result));
    }
}

/// Writes connection and session lifecycle to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn on_connect(&self, ctx: &AuthContext, connection_id: ConnectionId) {
        info!(
            connection_id = %connection_id,
            document_id = %ctx.document.id,
            user_id = ctx.user.id,
            "connection joined session"
        );
    }

    fn on_disconnect(&self, ctx: &AuthContext, connection_id: ConnectionId) {
        info!(
            connection_id = %connection_id,
            document_id = %ctx.document.id,
            user_id = ctx.user.id,
            "connection left session"
        );
    }

    fn on_session_created(&self, document_id: &str) {
        info!(document_id = %document_id, "session created");
    }

    fn on_session_idle(&self, document_id: &str) {
        info!(document_id = %document_id, "session torn down");
    }

    fn on_fetch(&self, document_id: &str, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Loaded { storage_key, bytes } => {
                debug!(
                    document_id = %document_id,
                    storage_key = %storage_key,
                    bytes,
                    "loaded state"
                );
            }
            FetchOutcome::NoPriorState => {
                debug!(document_id = %document_id, "no prior state");
            }
            FetchOutcome::Failed { reason } => {
                warn!(
                    document_id = %document_id,
                    reason = %reason,
                    "fetch failed; session starts empty"
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { document_id: String },
    Idle { document_id: String },
}

/// Publishes session creation and teardown on a broadcast channel.
/// Lagging subscribers miss events rather than slowing sessions down.
#[derive(Debug, Clone)]
pub struct LifecycleEvents {
    sender: broadcast::Sender<SessionEvent>,
}

impl LifecycleEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LIFECYCLE_EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for LifecycleEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver for LifecycleEvents {
    fn on_session_created(&self, document_id: &str) {
        let _ = self.sender.send(SessionEvent::Created { document_id: document_id.to_owned() });
    }

    fn on_session_idle(&self, document_id: &str) {
        let _ = self.sender.send(SessionEvent::Idle { document_id: document_id.to_owned() });
    }
}
