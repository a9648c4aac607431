// auth-broker/src/registry.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use rsa::RsaPublicKey;
use serde_json::Value;
use tokio::task::AbortHandle;
use uuid::Uuid;

use common::error::BrokerError;
use common::messages::BrokerReply;

/// Delivery handle for one live connection. The WebSocket actor registers an
/// address-backed implementation; tests register channel-backed fakes.
/// Both calls are queue-and-forget: a frame aimed at a connection that is
/// already gone is dropped silently.
pub trait SessionSink: Send + Sync {
    /// Queue a frame on the connection.
    fn deliver(&self, frame: String);
    /// Send an optional final frame, then close the connection.
    fn hangup(&self, last: Option<String>);
}

/// Where a session stands in the pairing flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    /// Freshly accepted, role unknown.
    New,
    /// Authenticator: AUTH_INIT answered, token issued.
    Inited,
    /// Widget: CHECK accepted, client session id minted.
    Activated,
    /// Cross-linked with the peer session.
    Paired,
    /// Authenticator: challenge issued, AUTH pending.
    Challenged,
    /// Terminal; nothing further may complete on this session.
    Done,
}

/// Broker-side state for one live connection.
pub struct SessionRecord {
    pub client_id: Uuid,
    pub session_id: Uuid,
    pub client_session_id: Option<Uuid>,
    pub alias: Option<String>,
    pub user_id: Option<String>,
    /// Peer's `client_id`, dereferenced through the registry on use.
    pub peer: Option<Uuid>,
    pub secret: Option<Vec<u8>>,
    pub public_key_sign: Option<RsaPublicKey>,
    pub current_user_token: Option<Value>,
    pub stage: SessionStage,
    pub created_at: Instant,
    pub sink: Arc<dyn SessionSink>,
    reaper: AbortHandle,
}

/// Everything the CHECK commit produced.
pub struct Activation {
    pub client_session_id: Uuid,
    /// Sink of the authenticator session that gets the ACTIVATED push.
    pub authenticator: Arc<dyn SessionSink>,
}

impl std::fmt::Debug for Activation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("client_session_id", &self.client_session_id)
            .finish()
    }
}

/// Everything the AUTH handler needs once the attempt is admitted. Gathered
/// under the lock so the verification and the success callback can run
/// without holding it.
pub struct AuthAttempt {
    pub secret: Vec<u8>,
    pub public_key_sign: RsaPublicKey,
    pub peer_id: Uuid,
    pub peer_sink: Arc<dyn SessionSink>,
    pub current_user_token: Option<Value>,
    pub user_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, SessionRecord>,
    by_session_id: HashMap<Uuid, Uuid>,
    by_client_session_id: HashMap<Uuid, Uuid>,
}

/// Process-wide session map plus its two lookup indices. One lock guards all
/// of it: CHECK writes both sides of a pair and must see them atomically, and
/// the expected session count is small.
pub struct SessionRegistry {
    auth_window: Duration,
    /// Handle back to ourselves for the reaper tasks.
    weak: Weak<SessionRegistry>,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(auth_window: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            auth_window,
            weak: weak.clone(),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a record for a freshly accepted connection and schedule its
    /// single-shot reaper at the authorization window. Returns the assigned
    /// `session_id`.
    pub fn create(&self, client_id: Uuid, sink: Arc<dyn SessionSink>) -> Uuid {
        let session_id = Uuid::new_v4();

        let registry = self.weak.clone();
        let window = self.auth_window;
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(registry) = registry.upgrade() {
                registry.reap_expired(client_id);
            }
        })
        .abort_handle();

        let record = SessionRecord {
            client_id,
            session_id,
            client_session_id: None,
            alias: None,
            user_id: None,
            peer: None,
            secret: None,
            public_key_sign: None,
            current_user_token: None,
            stage: SessionStage::New,
            created_at: Instant::now(),
            sink,
            reaper,
        };

        let mut inner = self.locked();
        inner.by_session_id.insert(session_id, client_id);
        inner.sessions.insert(client_id, record);

        tracing::info!("session created: client {} session {}", client_id, session_id);
        session_id
    }

    /// Drop a record and cancel its reaper. Idempotent.
    pub fn remove(&self, client_id: Uuid) -> bool {
        remove_locked(&mut self.locked(), client_id).is_some()
    }

    /// AUTH_INIT admission: New becomes Inited, once.
    pub fn begin_init(&self, client_id: Uuid) -> Result<Uuid, BrokerError> {
        let mut inner = self.locked();
        let record = inner
            .sessions
            .get_mut(&client_id)
            .ok_or_else(not_found)?;

        match record.stage {
            SessionStage::New => {
                record.stage = SessionStage::Inited;
                Ok(record.session_id)
            }
            _ => Err(BrokerError::StateViolation(
                "session is already initialized".into(),
            )),
        }
    }

    /// Keep the latest CURRENT_USER_TOKEN payload on the session it arrived
    /// on; AUTH reads it back from the same record.
    pub fn store_user_token(&self, client_id: Uuid, payload: Value) -> Result<(), BrokerError> {
        let mut inner = self.locked();
        let record = inner
            .sessions
            .get_mut(&client_id)
            .ok_or_else(not_found)?;
        record.current_user_token = Some(payload);
        Ok(())
    }

    /// CHECK guards without mutation, run before the user-validate callback.
    pub fn peek_activation(&self, widget_id: Uuid, session_id: Uuid) -> Result<(), BrokerError> {
        let inner = self.locked();
        check_activation(&inner, widget_id, session_id).map(|_| ())
    }

    /// CHECK commit: the only cross-record write in the protocol. Links both
    /// records as peers under the shared alias, mints the widget's client
    /// session id, and reports the authenticator sink for the ACTIVATED push.
    pub fn activate(
        &self,
        widget_id: Uuid,
        session_id: Uuid,
        alias: &str,
        user_id: Option<String>,
    ) -> Result<Activation, BrokerError> {
        let mut inner = self.locked();
        let auth_id = check_activation(&inner, widget_id, session_id)?;

        let client_session_id = Uuid::new_v4();
        inner.by_client_session_id.insert(client_session_id, widget_id);

        if let Some(widget) = inner.sessions.get_mut(&widget_id) {
            widget.alias = Some(alias.to_string());
            widget.user_id = user_id;
            widget.client_session_id = Some(client_session_id);
            widget.peer = Some(auth_id);
            widget.stage = SessionStage::Activated;
        }

        let authenticator = match inner.sessions.get_mut(&auth_id) {
            Some(auth) => {
                auth.alias = Some(alias.to_string());
                auth.peer = Some(widget_id);
                auth.stage = SessionStage::Paired;
                auth.sink.clone()
            }
            // check_activation just saw it; unreachable in practice.
            None => return Err(not_found()),
        };

        tracing::info!(
            "session {} activated for alias {} (client session {})",
            session_id,
            alias,
            client_session_id
        );

        Ok(Activation {
            client_session_id,
            authenticator,
        })
    }

    /// HELLO guards without mutation, run before the registry fetch.
    pub fn peek_hello(
        &self,
        auth_id: Uuid,
        client_session_id: Uuid,
        alias: &str,
    ) -> Result<(), BrokerError> {
        let inner = self.locked();
        check_hello(&inner, auth_id, client_session_id, alias).map(|_| ())
    }

    /// HELLO commit: bind the challenge material to the authenticator and
    /// move the widget to Paired.
    pub fn arm_challenge(
        &self,
        auth_id: Uuid,
        client_session_id: Uuid,
        alias: &str,
        secret: Vec<u8>,
        public_key_sign: RsaPublicKey,
    ) -> Result<(), BrokerError> {
        let mut inner = self.locked();
        let widget_id = check_hello(&inner, auth_id, client_session_id, alias)?;

        if let Some(auth) = inner.sessions.get_mut(&auth_id) {
            auth.secret = Some(secret);
            auth.public_key_sign = Some(public_key_sign);
            auth.stage = SessionStage::Challenged;
        }
        if let Some(widget) = inner.sessions.get_mut(&widget_id) {
            widget.stage = SessionStage::Paired;
        }
        Ok(())
    }

    /// AUTH admission: checks the alias against the peer, takes the secret,
    /// and marks the session Done so a second AUTH can never complete. The
    /// caller runs verification and the success callback lock-free on the
    /// returned data.
    pub fn begin_auth(&self, auth_id: Uuid, alias: &str) -> Result<AuthAttempt, BrokerError> {
        let mut inner = self.locked();

        let auth = inner.sessions.get(&auth_id).ok_or_else(not_found)?;
        if auth.stage != SessionStage::Challenged {
            return Err(BrokerError::StateViolation("unexpected command".into()));
        }
        let peer_id = auth.peer.ok_or_else(not_found)?;

        let peer = inner.sessions.get(&peer_id).ok_or_else(not_found)?;
        if peer.alias.as_deref() != Some(alias) {
            return Err(BrokerError::PeerMismatch);
        }
        let peer_sink = peer.sink.clone();
        let user_id = peer.user_id.clone();

        let Some(auth) = inner.sessions.get_mut(&auth_id) else {
            return Err(not_found());
        };
        let secret = auth
            .secret
            .take()
            .ok_or_else(|| BrokerError::StateViolation("unexpected command".into()))?;
        let public_key_sign = auth
            .public_key_sign
            .take()
            .ok_or_else(|| BrokerError::StateViolation("unexpected command".into()))?;
        let current_user_token = auth.current_user_token.take();
        auth.stage = SessionStage::Done;

        Ok(AuthAttempt {
            secret,
            public_key_sign,
            peer_id,
            peer_sink,
            current_user_token,
            user_id,
        })
    }

    /// Terminal fanout for failures that take the pair down together: remove
    /// both records and push the frame to the peer. The caller delivers its
    /// own copy on the triggering connection.
    pub fn close_pair(&self, client_id: Uuid, frame: &BrokerReply) {
        let peer_sink = {
            let mut inner = self.locked();
            let Some(record) = remove_locked(&mut inner, client_id) else {
                return;
            };
            record
                .peer
                .and_then(|peer_id| remove_locked(&mut inner, peer_id))
                .map(|peer| peer.sink)
        };

        if let Some(sink) = peer_sink {
            sink.hangup(Some(frame.to_frame()));
        }
    }

    /// Transport-level close. A session that still exists fans
    /// CONNECTION_FAILED out to its peer and both go away; a session already
    /// Done is removed quietly because the AUTH finalizer still owes the
    /// widget its result.
    pub fn connection_closed(&self, client_id: Uuid) {
        let peer_sink = {
            let mut inner = self.locked();
            let Some(record) = remove_locked(&mut inner, client_id) else {
                return;
            };
            if record.stage == SessionStage::Done {
                return;
            }
            tracing::info!("connection dropped mid-flow: {}", client_id);
            record
                .peer
                .and_then(|peer_id| remove_locked(&mut inner, peer_id))
                .map(|peer| peer.sink)
        };

        if let Some(sink) = peer_sink {
            sink.hangup(Some(BrokerReply::ConnectionFailed.to_frame()));
        }
    }

    /// Authorization window expiry: the session closes, its peer (if any)
    /// learns about it.
    pub fn reap_expired(&self, client_id: Uuid) {
        let sinks = {
            let mut inner = self.locked();
            let Some(record) = remove_locked(&mut inner, client_id) else {
                return;
            };
            if record.stage == SessionStage::Done {
                return;
            }
            tracing::info!(
                "authorization window elapsed after {:?}: {}",
                record.created_at.elapsed(),
                client_id
            );
            let peer = record
                .peer
                .and_then(|peer_id| remove_locked(&mut inner, peer_id))
                .map(|p| p.sink);
            (record.sink, peer)
        };

        let (own, peer) = sinks;
        if let Some(peer) = peer {
            peer.hangup(Some(BrokerReply::ConnectionFailed.to_frame()));
        }
        own.hangup(None);
    }

    pub fn contains(&self, client_id: Uuid) -> bool {
        self.locked().sessions.contains_key(&client_id)
    }

    pub fn stage(&self, client_id: Uuid) -> Option<SessionStage> {
        self.locked().sessions.get(&client_id).map(|r| r.stage)
    }

    pub fn peer(&self, client_id: Uuid) -> Option<Uuid> {
        self.locked().sessions.get(&client_id).and_then(|r| r.peer)
    }

    pub fn alias(&self, client_id: Uuid) -> Option<String> {
        self.locked()
            .sessions
            .get(&client_id)
            .and_then(|r| r.alias.clone())
    }

    pub fn session_count(&self) -> usize {
        self.locked().sessions.len()
    }
}

fn not_found() -> BrokerError {
    BrokerError::StateViolation("session not found".into())
}

fn remove_locked(inner: &mut Inner, client_id: Uuid) -> Option<SessionRecord> {
    let record = inner.sessions.remove(&client_id)?;
    inner.by_session_id.remove(&record.session_id);
    if let Some(client_session_id) = record.client_session_id {
        inner.by_client_session_id.remove(&client_session_id);
    }
    record.reaper.abort();
    Some(record)
}

/// Shared CHECK guards; returns the authenticator's client id.
fn check_activation(inner: &Inner, widget_id: Uuid, session_id: Uuid) -> Result<Uuid, BrokerError> {
    let widget = inner.sessions.get(&widget_id).ok_or_else(not_found)?;
    if widget.stage != SessionStage::New || widget.alias.is_some() {
        return Err(BrokerError::StateViolation("unexpected command".into()));
    }

    let auth_id = *inner.by_session_id.get(&session_id).ok_or_else(not_found)?;
    if auth_id == widget_id {
        return Err(BrokerError::StateViolation(
            "cannot pair a session with itself".into(),
        ));
    }

    let auth = inner.sessions.get(&auth_id).ok_or_else(not_found)?;
    match auth.stage {
        SessionStage::Inited => Ok(auth_id),
        SessionStage::New => Err(BrokerError::StateViolation(
            "session is not initialized".into(),
        )),
        _ => Err(BrokerError::StateViolation(
            "session is already activated".into(),
        )),
    }
}

/// Shared HELLO guards; returns the widget's client id.
fn check_hello(
    inner: &Inner,
    auth_id: Uuid,
    client_session_id: Uuid,
    alias: &str,
) -> Result<Uuid, BrokerError> {
    let auth = inner.sessions.get(&auth_id).ok_or_else(not_found)?;
    match auth.stage {
        SessionStage::Paired => {}
        SessionStage::New | SessionStage::Inited => {
            return Err(BrokerError::StateViolation(
                "session is not activated".into(),
            ));
        }
        _ => return Err(BrokerError::StateViolation("unexpected command".into())),
    }

    let widget_id = *inner
        .by_client_session_id
        .get(&client_session_id)
        .ok_or_else(not_found)?;
    if auth.peer != Some(widget_id) {
        return Err(not_found());
    }

    let widget = inner.sessions.get(&widget_id).ok_or_else(not_found)?;
    if widget.stage != SessionStage::Activated {
        return Err(BrokerError::StateViolation("unexpected command".into()));
    }

    if auth.alias.as_deref() != Some(alias) {
        return Err(BrokerError::PeerMismatch);
    }

    Ok(widget_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct TestSink {
        frames: Mutex<Vec<String>>,
        closed: Mutex<Vec<Option<String>>>,
    }

    impl SessionSink for TestSink {
        fn deliver(&self, frame: String) {
            self.frames.lock().unwrap().push(frame);
        }

        fn hangup(&self, last: Option<String>) {
            self.closed.lock().unwrap().push(last);
        }
    }

    fn registry(window_ms: u64) -> Arc<SessionRegistry> {
        SessionRegistry::new(Duration::from_millis(window_ms))
    }

    fn connect(registry: &Arc<SessionRegistry>) -> (Uuid, Uuid, Arc<TestSink>) {
        let sink = Arc::new(TestSink::default());
        let client_id = Uuid::new_v4();
        let session_id = registry.create(client_id, sink.clone());
        (client_id, session_id, sink)
    }

    #[tokio::test]
    async fn created_sessions_get_unique_ids() {
        let registry = registry(60_000);
        let mut session_ids = HashSet::new();
        for _ in 0..16 {
            let (client_id, session_id, _sink) = connect(&registry);
            assert!(registry.contains(client_id));
            assert!(session_ids.insert(session_id));
        }
        assert_eq!(registry.session_count(), 16);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = registry(60_000);
        let (client_id, _, _sink) = connect(&registry);

        assert!(registry.remove(client_id));
        assert!(!registry.remove(client_id));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn activation_links_peers_symmetrically() {
        let registry = registry(60_000);
        let (auth_id, session_id, auth_sink) = connect(&registry);
        let (widget_id, _, _widget_sink) = connect(&registry);

        registry.begin_init(auth_id).unwrap();
        let activation = registry
            .activate(widget_id, session_id, "alice", Some("user-7".into()))
            .unwrap();
        activation
            .authenticator
            .deliver(BrokerReply::Activated.to_frame());

        assert_eq!(registry.peer(auth_id), Some(widget_id));
        assert_eq!(registry.peer(widget_id), Some(auth_id));
        assert_eq!(registry.alias(auth_id), registry.alias(widget_id));
        assert_eq!(registry.stage(auth_id), Some(SessionStage::Paired));
        assert_eq!(registry.stage(widget_id), Some(SessionStage::Activated));
        assert_eq!(auth_sink.frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_activation_of_a_session_is_rejected() {
        let registry = registry(60_000);
        let (auth_id, session_id, _auth_sink) = connect(&registry);
        let (widget_id, _, _w) = connect(&registry);
        let (other_widget, _, _o) = connect(&registry);

        registry.begin_init(auth_id).unwrap();
        registry
            .activate(widget_id, session_id, "alice", None)
            .unwrap();

        let err = registry
            .activate(other_widget, session_id, "alice", None)
            .unwrap_err();
        assert_eq!(err.to_string(), "session is already activated");
    }

    #[tokio::test]
    async fn init_happens_at_most_once() {
        let registry = registry(60_000);
        let (client_id, session_id, _sink) = connect(&registry);

        assert_eq!(registry.begin_init(client_id).unwrap(), session_id);
        let err = registry.begin_init(client_id).unwrap_err();
        assert_eq!(err.to_string(), "session is already initialized");
    }

    #[tokio::test]
    async fn reaping_fans_failure_out_to_the_peer() {
        let registry = registry(60_000);
        let (auth_id, session_id, auth_sink) = connect(&registry);
        let (widget_id, _, widget_sink) = connect(&registry);

        registry.begin_init(auth_id).unwrap();
        registry
            .activate(widget_id, session_id, "alice", None)
            .unwrap();

        registry.reap_expired(auth_id);

        assert_eq!(registry.session_count(), 0);
        let closed = widget_sink.closed.lock().unwrap();
        let frame = closed[0].as_deref().unwrap();
        assert!(frame.contains("CONNECTION_FAILED"));
        // The expiring side just closes.
        assert_eq!(auth_sink.closed.lock().unwrap()[0], None);
    }

    #[tokio::test]
    async fn unpaired_session_is_gone_after_the_window() {
        let registry = registry(40);
        let (client_id, _, sink) = connect(&registry);

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(!registry.contains(client_id));
        assert_eq!(*sink.closed.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn removing_a_session_cancels_its_reaper() {
        let registry = registry(40);
        let (client_id, _, sink) = connect(&registry);

        assert!(registry.remove(client_id));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(sink.closed.lock().unwrap().is_empty());
        assert!(sink.frames.lock().unwrap().is_empty());
    }
}
