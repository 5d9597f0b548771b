// Live editing sessions, one per open document.
//
// A session moves Loading -> Active -> Draining and is then retired.
// Loading fetches persisted state while buffering incoming updates; Active
// merges and fans updates out; Draining persists the final state after the
// last connection leaves. A connection arriving while the session drains
// puts it back into Active instead of racing a fresh session against the
// pending store.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    auth::authenticator::AuthContext,
    sync::{
        coordinator::{PersistenceCoordinator, PersistenceError, StateSnapshot},
        merge::{DocumentReplica, MalformedUpdate},
        observer::ObserverChain,
    },
};

pub type ConnectionId = Uuid;

pub const DEFAULT_STORE_DEBOUNCE: Duration = Duration::from_secs(2);
pub const DEFAULT_STORE_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Dirty sessions are flushed at most once per interval.
    pub store_debounce: Duration,
    /// Wait between attempts when the final store of a draining session fails.
    pub store_retry: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { store_debounce: DEFAULT_STORE_DEBOUNCE, store_retry: DEFAULT_STORE_RETRY }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Loading,
    Active,
    Draining,
}

/// Outbound traffic for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFrame {
    /// Full merged state, sent once when the connection joins.
    Snapshot(Arc<[u8]>),
    /// An update another connection contributed.
    Update(Arc<[u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Held until the session finishes loading.
    Buffered,
    Merged { changed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub document_id: String,
    pub phase: SessionPhase,
    pub connections: usize,
}

struct BufferedUpdate {
    origin: ConnectionId,
    payload: Vec<u8>,
}

struct SessionState {
    phase: SessionPhase,
    replica: DocumentReplica,
    members: HashMap<ConnectionId, mpsc::UnboundedSender<SessionFrame>>,
    buffered: Vec<BufferedUpdate>,
    /// Bumped on every merge that changed the replica.
    version: u64,
    /// Highest version known to be persisted.
    stored_version: u64,
    /// Set once the session has left the registry; it accepts nobody after.
    retired: bool,
}

pub struct DocumentSession {
    document_id: String,
    state: Mutex<SessionState>,
    /// Serializes snapshot-and-store so captures reach the coordinator in
    /// the order they were taken.
    flush_lock: Mutex<()>,
}

impl DocumentSession {
    fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_owned(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Loading,
                replica: DocumentReplica::new(),
                members: HashMap::new(),
                buffered: Vec::new(),
                version: 0,
                stored_version: 0,
                retired: false,
            }),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    async fn is_retired(&self) -> bool {
        self.state.lock().await.retired
    }
}

enum Teardown {
    Retired,
    Rejoined,
    Dirty,
}

/// Owns the process-wide map of live sessions. At most one session exists
/// per document id.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<DocumentSession>>>,
    coordinator: Arc<PersistenceCoordinator>,
    observers: ObserverChain,
    config: SessionConfig,
    versions: AtomicU64,
}

/// Result of admitting a connection: its membership plus the channel that
/// carries its outbound frames.
pub struct Admission {
    pub membership: Membership,
    pub frames: mpsc::UnboundedReceiver<SessionFrame>,
}

/// A connection's seat in a session. Dropping it without calling
/// [`Membership::leave`] detaches in the background.
pub struct Membership {
    connection_id: ConnectionId,
    ctx: Arc<AuthContext>,
    session: Arc<DocumentSession>,
    manager: Arc<SessionManager>,
    attached: bool,
}

impl Membership {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn context(&self) -> &AuthContext {
        &self.ctx
    }

    pub async fn apply_update(&self, payload: Vec<u8>) -> Result<ApplyOutcome, MalformedUpdate> {
        self.manager.apply_update(&self.session, self.connection_id, payload).await
    }

    pub async fn leave(mut self) {
        self.attached = false;
        self.manager.detach(&self.session, self.connection_id, &self.ctx).await;
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let manager = Arc::clone(&self.manager);
        let session = Arc::clone(&self.session);
        let ctx = Arc::clone(&self.ctx);
        let connection_id = self.connection_id;
        runtime.spawn(async move {
            manager.detach(&session, connection_id, &ctx).await;
        });
    }
}

impl SessionManager {
    pub fn new(
        coordinator: Arc<PersistenceCoordinator>,
        observers: ObserverChain,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            coordinator,
            observers,
            config,
            versions: AtomicU64::new(0),
        }
    }

    /// Joins an authenticated connection to its document's session,
    /// creating and loading the session if none is live. The connection
    /// receives the merged state as its first frame once the session is
    /// active.
    pub async fn admit(self: &Arc<Self>, ctx: AuthContext) -> Admission {
        let ctx = Arc::new(ctx);
        let document_id = ctx.document_id().to_owned();
        let connection_id = Uuid::new_v4();
        let (sender, frames) = mpsc::unbounded_channel();

        let session = loop {
            let (session, created) = self.session_for(&document_id).await;
            if created {
                self.observers.on_session_created(&document_id);
                self.spawn_load(Arc::clone(&session));
                self.spawn_flush_loop(Arc::clone(&session));
            }

            let mut state = session.state.lock().await;
            if state.retired {
                continue;
            }

            match state.phase {
                SessionPhase::Loading => {}
                SessionPhase::Draining => {
                    info!(document_id = %document_id, "connection rejoined draining session");
                    state.phase = SessionPhase::Active;
                    send_baseline(&sender, &state.replica);
                }
                SessionPhase::Active => send_baseline(&sender, &state.replica),
            }
            state.members.insert(connection_id, sender.clone());
            drop(state);
            break session;
        };

        self.observers.on_connect(&ctx, connection_id);

        Admission {
            membership: Membership {
                connection_id,
                ctx,
                session,
                manager: Arc::clone(self),
                attached: true,
            },
            frames,
        }
    }

    async fn session_for(&self, document_id: &str) -> (Arc<DocumentSession>, bool) {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(document_id) {
            return (Arc::clone(existing), false);
        }

        let session = Arc::new(DocumentSession::new(document_id));
        sessions.insert(document_id.to_owned(), Arc::clone(&session));
        (session, true)
    }

    async fn apply_update(
        &self,
        session: &DocumentSession,
        origin: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<ApplyOutcome, MalformedUpdate> {
        let mut state = session.state.lock().await;

        if state.phase == SessionPhase::Loading {
            DocumentReplica::validate(&payload)?;
            state.buffered.push(BufferedUpdate { origin, payload });
            return Ok(ApplyOutcome::Buffered);
        }

        let outcome = state.replica.apply(&payload)?;
        if outcome.changed {
            state.version = self.next_version();
        }

        let frame: Arc<[u8]> = payload.into();
        for (connection_id, sender) in &state.members {
            if *connection_id != origin {
                let _ = sender.send(SessionFrame::Update(Arc::clone(&frame)));
            }
        }

        Ok(ApplyOutcome::Merged { changed: outcome.changed })
    }

    async fn detach(
        self: &Arc<Self>,
        session: &Arc<DocumentSession>,
        connection_id: ConnectionId,
        ctx: &AuthContext,
    ) {
        let idle = {
            let mut state = session.state.lock().await;
            let removed = state.members.remove(&connection_id).is_some();
            let idle =
                removed && state.members.is_empty() && state.phase == SessionPhase::Active;
            if idle {
                state.phase = SessionPhase::Draining;
            }
            idle
        };

        self.observers.on_disconnect(ctx, connection_id);

        if idle {
            debug!(document_id = %session.document_id, "last connection left; draining");
            self.spawn_drain(Arc::clone(session));
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn spawn_load(self: &Arc<Self>, session: Arc<DocumentSession>) {
        let span = info_span!("relay.session.load", document_id = %session.document_id);
        tokio::spawn(Arc::clone(self).load(session).instrument(span));
    }

    fn spawn_drain(self: &Arc<Self>, session: Arc<DocumentSession>) {
        let span = info_span!("relay.session.drain", document_id = %session.document_id);
        tokio::spawn(Arc::clone(self).drain(session).instrument(span));
    }

    fn spawn_flush_loop(self: &Arc<Self>, session: Arc<DocumentSession>) {
        let span = info_span!("relay.session.flush_loop", document_id = %session.document_id);
        tokio::spawn(Arc::clone(self).flush_periodically(session).instrument(span));
    }

    async fn load(self: Arc<Self>, session: Arc<DocumentSession>) {
        let replica = match self.coordinator.fetch(&session.document_id).await {
            Some(state) => DocumentReplica::from_state(&state).unwrap_or_else(|error| {
                error!(error = %error, "persisted state does not decode; starting empty");
                DocumentReplica::new()
            }),
            None => DocumentReplica::new(),
        };

        let idle = {
            let mut state = session.state.lock().await;
            state.replica = replica;

            let buffered = std::mem::take(&mut state.buffered);
            let replayed = buffered.len();
            for update in buffered {
                let result = state.replica.apply(&update.payload);
                match result {
                    Ok(outcome) if outcome.changed => state.version = self.next_version(),
                    Ok(_) => {}
                    Err(error) => warn!(
                        connection_id = %update.origin,
                        error = %error,
                        "dropping buffered update"
                    ),
                }
            }

            state.phase = SessionPhase::Active;
            let baseline: Arc<[u8]> = state.replica.encode_state().into();
            for sender in state.members.values() {
                let _ = sender.send(SessionFrame::Snapshot(Arc::clone(&baseline)));
            }
            debug!(replayed, connections = state.members.len(), "session active");

            let idle = state.members.is_empty();
            if idle {
                state.phase = SessionPhase::Draining;
            }
            idle
        };

        if idle {
            self.drain(session).await;
        }
    }

    async fn flush_periodically(self: Arc<Self>, session: Arc<DocumentSession>) {
        let mut ticker = tokio::time::interval(self.config.store_debounce);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if session.is_retired().await {
                return;
            }
            // Failures are logged by the coordinator; the session stays
            // dirty and the next tick retries.
            let _ = self.flush(&session).await;
        }
    }

    /// Persists the session's state if anything changed since the last
    /// successful store. Returns whether a store was issued.
    async fn flush(&self, session: &DocumentSession) -> Result<bool, PersistenceError> {
        let _permit = session.flush_lock.lock().await;

        let snapshot = {
            let state = session.state.lock().await;
            if state.phase == SessionPhase::Loading || state.version <= state.stored_version {
                return Ok(false);
            }
            StateSnapshot { version: state.version, state: state.replica.encode_state() }
        };

        let version = snapshot.version;
        self.coordinator.store(&session.document_id, snapshot).await?;

        let mut state = session.state.lock().await;
        state.stored_version = state.stored_version.max(version);
        Ok(true)
    }

    async fn drain(self: Arc<Self>, session: Arc<DocumentSession>) {
        loop {
            match self.flush(&session).await {
                Ok(_) => match self.try_retire(&session).await {
                    Teardown::Retired | Teardown::Rejoined => return,
                    Teardown::Dirty => continue,
                },
                Err(_) => {
                    warn!(
                        retry_in_ms = self.config.store_retry.as_millis() as u64,
                        "final store failed; keeping session resident"
                    );
                    tokio::time::sleep(self.config.store_retry).await;
                    let state = session.state.lock().await;
                    if state.retired || state.phase != SessionPhase::Draining {
                        return;
                    }
                }
            }
        }
    }

    async fn try_retire(&self, session: &Arc<DocumentSession>) -> Teardown {
        let mut sessions = self.sessions.lock().await;
        let mut state = session.state.lock().await;

        if state.retired {
            return Teardown::Retired;
        }
        if state.phase != SessionPhase::Draining || !state.members.is_empty() {
            return Teardown::Rejoined;
        }
        if state.version > state.stored_version {
            return Teardown::Dirty;
        }

        state.retired = true;
        let registered = sessions
            .get(&session.document_id)
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            sessions.remove(&session.document_id);
        }
        drop(state);
        drop(sessions);

        self.observers.on_session_idle(&session.document_id);
        Teardown::Retired
    }

    /// Stores every dirty session now. Used on shutdown.
    pub async fn flush_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.lock().await.values().cloned().collect();

        let mut flushed = 0;
        for session in sessions {
            match self.flush(&session).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(error) => warn!(
                    document_id = %session.document_id,
                    error = %error.detail(),
                    "failed to flush session on shutdown"
                ),
            }
        }
        flushed
    }

    pub async fn session_info(&self, document_id: &str) -> Option<SessionInfo> {
        let session = self.sessions.lock().await.get(document_id).cloned()?;
        let state = session.state.lock().await;
        Some(SessionInfo {
            document_id: session.document_id.clone(),
            phase: state.phase,
            connections: state.members.len(),
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn send_baseline(sender: &mpsc::UnboundedSender<SessionFrame>, replica: &DocumentReplica) {
    let _ = sender.send(SessionFrame::Snapshot(replica.encode_state().into()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::{BlobFuture, MemoryBlobStore, StateBlobStore},
        records::{DocumentRecord, MemoryRecordStore, UserRecord},
        sync::merge::test_edits::Author,
    };
    use std::sync::atomic::AtomicBool;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    fn ctx(document_id: &str) -> AuthContext {
        AuthContext {
            user: UserRecord { id: 3, name: "Owner".into(), email: None },
            document: DocumentRecord::new(document_id, 3),
        }
    }

    async fn harness_with(
        blobs: Arc<dyn StateBlobStore>,
        config: SessionConfig,
    ) -> Arc<SessionManager> {
        let records = MemoryRecordStore::new();
        records.insert_document(DocumentRecord::new("doc1", 3)).await;
        let coordinator = Arc::new(PersistenceCoordinator::new(
            Arc::new(records),
            blobs,
            ObserverChain::default(),
        ));
        Arc::new(SessionManager::new(coordinator, ObserverChain::default(), config))
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            store_debounce: Duration::from_secs(3600),
            store_retry: Duration::from_millis(20),
        }
    }

    async fn next_frame(frames: &mut mpsc::UnboundedReceiver<SessionFrame>) -> SessionFrame {
        timeout(WAIT, frames.recv()).await.expect("frame in time").expect("channel open")
    }

    async fn baseline_text(frames: &mut mpsc::UnboundedReceiver<SessionFrame>) -> String {
        match next_frame(frames).await {
            SessionFrame::Snapshot(state) => {
                DocumentReplica::from_state(&state).expect("baseline decodes").text("content")
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    async fn wait_until_idle(manager: &SessionManager, document_id: &str) {
        timeout(WAIT, async {
            while manager.session_info(document_id).await.is_some() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should retire");
    }

    #[tokio::test]
    async fn first_frame_is_the_merged_state() {
        let manager = harness_with(Arc::new(MemoryBlobStore::new()), quiet_config()).await;
        let author = Author::new(1);

        let Admission { membership: a, frames: mut a_frames } = manager.admit(ctx("doc1")).await;
        assert_eq!(baseline_text(&mut a_frames).await, "");
        a.apply_update(author.insert(0, "hello")).await.expect("apply");

        let Admission { membership: b, frames: mut b_frames } = manager.admit(ctx("doc1")).await;
        assert_eq!(baseline_text(&mut b_frames).await, "hello");

        a.leave().await;
        b.leave().await;
    }

    #[tokio::test]
    async fn updates_reach_everyone_but_the_sender() {
        let manager = harness_with(Arc::new(MemoryBlobStore::new()), quiet_config()).await;
        let author = Author::new(1);

        let Admission { membership: a, frames: mut a_frames } = manager.admit(ctx("doc1")).await;
        let Admission { membership: b, frames: mut b_frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut a_frames).await;
        baseline_text(&mut b_frames).await;

        let update = author.insert(0, "x");
        let outcome = a.apply_update(update.clone()).await.expect("apply");
        assert_eq!(outcome, ApplyOutcome::Merged { changed: true });

        assert_eq!(next_frame(&mut b_frames).await, SessionFrame::Update(update.into()));
        assert!(a_frames.try_recv().is_err());

        a.leave().await;
        b.leave().await;
    }

    #[tokio::test]
    async fn malformed_update_is_rejected_without_side_effects() {
        let manager = harness_with(Arc::new(MemoryBlobStore::new()), quiet_config()).await;
        let Admission { membership: a, frames: mut a_frames } = manager.admit(ctx("doc1")).await;
        let Admission { membership: b, frames: mut b_frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut a_frames).await;
        baseline_text(&mut b_frames).await;

        assert!(a.apply_update(vec![0xde, 0xad, 0xbe, 0xef]).await.is_err());
        assert!(b_frames.try_recv().is_err());

        a.leave().await;
        b.leave().await;
    }

    #[tokio::test]
    async fn concurrent_admissions_share_one_session() {
        let manager = harness_with(Arc::new(MemoryBlobStore::new()), quiet_config()).await;

        let admissions = futures_util::future::join_all(
            (0..16).map(|_| {
                let manager = Arc::clone(&manager);
                async move { manager.admit(ctx("doc1")).await }
            }),
        )
        .await;

        assert_eq!(manager.session_count().await, 1);
        let info = manager.session_info("doc1").await.expect("session");
        assert_eq!(info.connections, 16);

        for admission in admissions {
            admission.membership.leave().await;
        }
        wait_until_idle(&manager, "doc1").await;
    }

    #[tokio::test]
    async fn last_leave_stores_once_and_retires() {
        let blobs = MemoryBlobStore::new();
        let manager = harness_with(Arc::new(blobs.clone()), quiet_config()).await;
        let author = Author::new(1);

        let Admission { membership: a, frames: mut a_frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut a_frames).await;
        a.apply_update(author.insert(0, "hello")).await.expect("apply");
        let Admission { membership: b, frames: mut b_frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut b_frames).await;
        b.apply_update(author.insert(5, " world")).await.expect("apply");

        a.leave().await;
        b.leave().await;
        wait_until_idle(&manager, "doc1").await;

        assert_eq!(blobs.put_count(), 1);
        let Admission { membership: c, frames: mut c_frames } = manager.admit(ctx("doc1")).await;
        assert_eq!(baseline_text(&mut c_frames).await, "hello world");
        c.leave().await;
    }

    #[tokio::test]
    async fn untouched_session_retires_without_storing() {
        let blobs = MemoryBlobStore::new();
        let manager = harness_with(Arc::new(blobs.clone()), quiet_config()).await;

        let Admission { membership, mut frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut frames).await;
        membership.leave().await;
        wait_until_idle(&manager, "doc1").await;

        assert_eq!(blobs.put_count(), 0);
    }

    #[tokio::test]
    async fn dropped_membership_detaches_in_background() {
        let manager = harness_with(Arc::new(MemoryBlobStore::new()), quiet_config()).await;
        let admission = manager.admit(ctx("doc1")).await;
        drop(admission);
        wait_until_idle(&manager, "doc1").await;
    }

    #[tokio::test]
    async fn rejoin_during_teardown_never_loses_edits() {
        for round in 0..20 {
            let manager = harness_with(Arc::new(MemoryBlobStore::new()), quiet_config()).await;
            let first = Author::new(1);
            let second = Author::new(2);

            let Admission { membership: a, frames: mut a_frames } =
                manager.admit(ctx("doc1")).await;
            baseline_text(&mut a_frames).await;
            a.apply_update(first.insert(0, "one ")).await.expect("apply");

            let rejoin = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    if round % 2 == 0 {
                        tokio::task::yield_now().await;
                    }
                    manager.admit(ctx("doc1")).await
                })
            };
            a.leave().await;

            let Admission { membership: b, frames: mut b_frames } =
                rejoin.await.expect("rejoin task");
            assert_eq!(baseline_text(&mut b_frames).await, "one ", "round {round}");
            b.apply_update(second.insert(0, "two ")).await.expect("apply");
            b.leave().await;
            wait_until_idle(&manager, "doc1").await;

            let Admission { membership: c, frames: mut c_frames } =
                manager.admit(ctx("doc1")).await;
            let text = baseline_text(&mut c_frames).await;
            assert!(text.contains("one ") && text.contains("two "), "round {round}: {text}");
            c.leave().await;
        }
    }

    /// Blob store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyBlobs {
        inner: MemoryBlobStore,
        failing: AtomicBool,
    }

    impl StateBlobStore for FlakyBlobs {
        fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BlobFuture<'a, ()> {
            if self.failing.load(Ordering::SeqCst) {
                return Box::pin(async { Err(anyhow::anyhow!("store offline")) });
            }
            self.inner.put(key, bytes)
        }
    }

    /// Blob store whose reads wait until the test lets them through.
    #[derive(Default)]
    struct GatedBlobs {
        inner: MemoryBlobStore,
        open: tokio::sync::Notify,
    }

    impl StateBlobStore for GatedBlobs {
        fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Option<Vec<u8>>> {
            Box::pin(async move {
                self.open.notified().await;
                self.inner.get(key).await
            })
        }

        fn put<'a>(&'a self, key: &'a str, bytes: &'a [u8]) -> BlobFuture<'a, ()> {
            self.inner.put(key, bytes)
        }
    }

    #[tokio::test]
    async fn updates_during_load_are_replayed_onto_prior_state() {
        let prior = Author::new(1);
        prior.insert(0, "base ");
        let blobs = Arc::new(GatedBlobs::default());
        blobs.inner.put("state/doc1", &prior.state()).await.expect("seed state");

        let records = MemoryRecordStore::new();
        let mut document = DocumentRecord::new("doc1", 3);
        document.storage_key = Some("state/doc1".into());
        records.insert_document(document).await;
        let coordinator = Arc::new(PersistenceCoordinator::new(
            Arc::new(records),
            blobs.clone(),
            ObserverChain::default(),
        ));
        let manager =
            Arc::new(SessionManager::new(coordinator, ObserverChain::default(), quiet_config()));
        let editor = Author::new(2);

        let Admission { membership: a, frames: mut a_frames } = manager.admit(ctx("doc1")).await;
        let outcome = a.apply_update(editor.insert(0, "edit")).await.expect("valid update");
        assert_eq!(outcome, ApplyOutcome::Buffered);
        let malformed = a.apply_update(vec![0xde, 0xad, 0xbe, 0xef]).await;
        assert!(malformed.is_err(), "updates are validated while loading");

        let Admission { membership: b, frames: mut b_frames } = manager.admit(ctx("doc1")).await;
        let info = manager.session_info("doc1").await.expect("session");
        assert_eq!(info.phase, SessionPhase::Loading);
        assert_eq!(info.connections, 2);
        assert!(a_frames.try_recv().is_err(), "no baseline before the load finishes");

        blobs.open.notify_one();
        let a_text = baseline_text(&mut a_frames).await;
        let b_text = baseline_text(&mut b_frames).await;
        assert_eq!(a_text, b_text);
        assert!(a_text.contains("base ") && a_text.contains("edit"), "merged: {a_text}");
        assert!(b_frames.try_recv().is_err(), "the buffered edit is not re-sent");

        a.leave().await;
        b.leave().await;
        wait_until_idle(&manager, "doc1").await;

        assert_eq!(blobs.inner.put_count(), 2, "seed plus one final store");
        let stored = blobs.inner.get("state/doc1").await.expect("read").expect("stored state");
        assert_eq!(DocumentReplica::from_state(&stored).expect("decodes").text("content"), a_text);
    }

    #[tokio::test]
    async fn failed_final_store_keeps_session_until_retry_succeeds() {
        let blobs = Arc::new(FlakyBlobs::default());
        blobs.failing.store(true, Ordering::SeqCst);
        let manager = harness_with(blobs.clone(), quiet_config()).await;
        let author = Author::new(1);

        let Admission { membership, mut frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut frames).await;
        membership.apply_update(author.insert(0, "keep me")).await.expect("apply");
        membership.leave().await;

        sleep(Duration::from_millis(100)).await;
        let info = manager.session_info("doc1").await.expect("session stays resident");
        assert_eq!(info.phase, SessionPhase::Draining);

        blobs.failing.store(false, Ordering::SeqCst);
        wait_until_idle(&manager, "doc1").await;
        assert_eq!(blobs.inner.put_count(), 1);
    }

    #[tokio::test]
    async fn periodic_flush_persists_while_connections_stay() {
        let blobs = MemoryBlobStore::new();
        let config = SessionConfig {
            store_debounce: Duration::from_millis(20),
            store_retry: Duration::from_millis(20),
        };
        let manager = harness_with(Arc::new(blobs.clone()), config).await;
        let author = Author::new(1);

        let Admission { membership, mut frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut frames).await;
        membership.apply_update(author.insert(0, "autosave")).await.expect("apply");

        timeout(WAIT, async {
            while blobs.put_count() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("debounced store should happen");

        sleep(Duration::from_millis(100)).await;
        assert_eq!(blobs.put_count(), 1, "clean sessions are not re-stored");
        membership.leave().await;
    }

    #[tokio::test]
    async fn flush_all_stores_dirty_sessions() {
        let blobs = MemoryBlobStore::new();
        let manager = harness_with(Arc::new(blobs.clone()), quiet_config()).await;
        let author = Author::new(1);

        let Admission { membership, mut frames } = manager.admit(ctx("doc1")).await;
        baseline_text(&mut frames).await;
        membership.apply_update(author.insert(0, "shutdown")).await.expect("apply");

        assert_eq!(manager.flush_all().await, 1);
        assert_eq!(manager.flush_all().await, 0);
        assert_eq!(blobs.put_count(), 1);
        membership.leave().await;
    }
}
