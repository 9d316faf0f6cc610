use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::manifest::FileDescriptor;
use crate::server::hub::ConnectionHub;
use crate::wsproto::ServerMessage;

pub const SESSION_ID_LEN: usize = 6;
const ID_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Disconnected,
}

/// Rejections surfaced to registry callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session with this id.
    NotFound,
    /// The session exists but its owner is away.
    NotActive,
    /// Resume token did not match.
    TokenMismatch,
    /// Caller is not the session's current owner.
    NotOwner,
    /// The named watcher has not joined this session.
    NotWatcher,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound => write!(f, "broadcast does not exist or has ended"),
            RegistryError::NotActive => write!(f, "broadcast owner is reconnecting"),
            RegistryError::TokenMismatch => write!(f, "resume token mismatch"),
            RegistryError::NotOwner => write!(f, "caller does not own this broadcast"),
            RegistryError::NotWatcher => write!(f, "watcher is not part of this broadcast"),
        }
    }
}

impl std::error::Error for RegistryError {}

struct BroadcastSession {
    owner: String,
    resume_token: String,
    manifest: Vec<FileDescriptor>,
    status: SessionStatus,
    watchers: BTreeSet<String>,
    deletion: Option<DeletionTimer>,
}

struct DeletionTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl DeletionTimer {
    fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, BroadcastSession>,
    next_epoch: u64,
}

type Notices = Vec<(String, ServerMessage)>;

/// Owns every active broadcast. The session table is only mutated through
/// these methods; notices are queued after the table lock is released.
#[derive(Clone)]
pub struct SessionRegistry {
    state: Arc<Mutex<RegistryState>>,
    hub: ConnectionHub,
    grace: Duration,
}

impl SessionRegistry {
    pub fn new(hub: ConnectionHub, grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            hub,
            grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                crate::logging::error("session registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Creates an `active` session owned by `owner` and returns
    /// `(session_id, resume_token)`.
    pub async fn start_broadcast(
        &self,
        owner: &str,
        manifest: Vec<FileDescriptor>,
    ) -> (String, String) {
        let (session_id, resume_token) = {
            let mut state = self.lock();
            let mut session_id = new_session_id();
            while state.sessions.contains_key(&session_id) {
                session_id = new_session_id();
            }
            let resume_token = Uuid::new_v4().as_simple().to_string();
            state.sessions.insert(
                session_id.clone(),
                BroadcastSession {
                    owner: owner.to_string(),
                    resume_token: resume_token.clone(),
                    manifest,
                    status: SessionStatus::Active,
                    watchers: BTreeSet::new(),
                    deletion: None,
                },
            );
            (session_id, resume_token)
        };
        crate::logging::info_kv(
            "broadcast started",
            &[("session", &session_id), ("owner", owner)],
        );
        self.deliver(vec![(
            owner.to_string(),
            ServerMessage::BroadcastStarted {
                session_id: session_id.clone(),
                resume_token: resume_token.clone(),
            },
        )]);
        (session_id, resume_token)
    }

    /// Registers a watcher and hands it the manifest. Rejected unless the
    /// session exists and is `active`.
    pub async fn join_watcher(
        &self,
        session_id: &str,
        watcher_id: &str,
    ) -> Result<Vec<FileDescriptor>, RegistryError> {
        let outcome = {
            let mut state = self.lock();
            match state.sessions.get_mut(session_id) {
                None => Err(RegistryError::NotFound),
                Some(s) if s.status != SessionStatus::Active => Err(RegistryError::NotActive),
                Some(s) => {
                    s.watchers.insert(watcher_id.to_string());
                    Ok((s.manifest.clone(), s.owner.clone()))
                }
            }
        };
        match outcome {
            Ok((manifest, owner)) => {
                crate::logging::info_kv(
                    "watcher joined",
                    &[("session", session_id), ("watcher", watcher_id)],
                );
                // The manifest is queued before the owner learns about the
                // watcher, so it always precedes the owner's offer.
                self.deliver(vec![
                    (
                        watcher_id.to_string(),
                        ServerMessage::ManifestReady {
                            session_id: session_id.to_string(),
                            manifest: manifest.clone(),
                        },
                    ),
                    (
                        owner,
                        ServerMessage::WatcherReady {
                            watcher_id: watcher_id.to_string(),
                        },
                    ),
                ]);
                Ok(manifest)
            }
            Err(err) => {
                crate::logging::info_kv(
                    "join rejected",
                    &[
                        ("session", session_id),
                        ("watcher", watcher_id),
                        ("reason", &err.to_string()),
                    ],
                );
                self.deliver(vec![
                    (
                        watcher_id.to_string(),
                        ServerMessage::JoinRejected {
                            reason: err.to_string(),
                        },
                    ),
                    (
                        watcher_id.to_string(),
                        ServerMessage::ErrorMessage {
                            message: err.to_string(),
                        },
                    ),
                ]);
                Err(err)
            }
        }
    }

    /// Marks the session `disconnected`, warns its watchers and arms the
    /// deletion deadline. A second call while already disconnected is a no-op.
    pub async fn owner_disconnected(&self, session_id: &str) {
        let notices = {
            let mut state = self.lock();
            let epoch = state.next_epoch;
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            if session.status == SessionStatus::Disconnected {
                return;
            }
            session.status = SessionStatus::Disconnected;
            let registry = self.clone();
            let id = session_id.to_string();
            let grace = self.grace;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                registry.expire(&id, epoch).await;
            });
            if let Some(old) = session.deletion.replace(DeletionTimer { epoch, handle }) {
                old.cancel();
            }
            let notices = watcher_notices(session, ServerMessage::OwnerUnstable);
            state.next_epoch += 1;
            notices
        };
        crate::logging::warn_kv(
            "broadcast owner disconnected",
            &[
                ("session", session_id),
                ("grace_secs", &self.grace.as_secs().to_string()),
            ],
        );
        self.deliver(notices);
    }

    /// Rebinds a session to a reconnected owner. Succeeds only when the session
    /// exists and the token matches; the deletion deadline is cancelled under
    /// the same lock that flips the status back to `active`.
    pub async fn reclaim(
        &self,
        session_id: &str,
        resume_token: &str,
        new_owner: &str,
    ) -> Result<(), RegistryError> {
        let outcome = {
            let mut state = self.lock();
            match state.sessions.get_mut(session_id) {
                None => Err(RegistryError::NotFound),
                Some(s) if s.resume_token != resume_token => Err(RegistryError::TokenMismatch),
                Some(s) => {
                    if let Some(timer) = s.deletion.take() {
                        timer.cancel();
                    }
                    let was_disconnected = s.status == SessionStatus::Disconnected;
                    s.status = SessionStatus::Active;
                    s.owner = new_owner.to_string();
                    let mut notices = Vec::new();
                    if was_disconnected {
                        notices = watcher_notices(s, ServerMessage::OwnerRecovered);
                    }
                    Ok((notices, s.watchers.iter().cloned().collect()))
                }
            }
        };
        match outcome {
            Ok((mut notices, watchers)) => {
                crate::logging::info_kv(
                    "broadcast reclaimed",
                    &[("session", session_id), ("owner", new_owner)],
                );
                notices.insert(
                    0,
                    (
                        new_owner.to_string(),
                        ServerMessage::ReclaimAccepted {
                            session_id: session_id.to_string(),
                            watchers,
                        },
                    ),
                );
                self.deliver(notices);
                Ok(())
            }
            Err(err) => {
                crate::logging::warn_kv(
                    "reclaim rejected",
                    &[("session", session_id), ("reason", &err.to_string())],
                );
                self.deliver(vec![(
                    new_owner.to_string(),
                    ServerMessage::ReclaimRejected {
                        reason: err.to_string(),
                    },
                )]);
                Err(err)
            }
        }
    }

    /// Ends a broadcast immediately. Only the current owner may stop it.
    pub async fn stop_broadcast(&self, session_id: &str, owner: &str) -> Result<(), RegistryError> {
        let notices = {
            let mut state = self.lock();
            match state.sessions.get(session_id) {
                None => return Err(RegistryError::NotFound),
                Some(s) if s.owner != owner => return Err(RegistryError::NotOwner),
                Some(_) => {}
            }
            match state.sessions.remove(session_id) {
                Some(session) => end_session(session),
                None => Vec::new(),
            }
        };
        crate::logging::info_kv("broadcast stopped", &[("session", session_id)]);
        self.deliver(notices);
        Ok(())
    }

    /// Tells a watcher to stop trusting its direct channel and take input
    /// from the relay.
    pub async fn request_relay_fallback(
        &self,
        session_id: &str,
        owner: &str,
        watcher_id: &str,
    ) -> Result<(), RegistryError> {
        {
            let state = self.lock();
            match state.sessions.get(session_id) {
                None => return Err(RegistryError::NotFound),
                Some(s) if s.owner != owner => return Err(RegistryError::NotOwner),
                Some(s) if !s.watchers.contains(watcher_id) => {
                    return Err(RegistryError::NotWatcher)
                }
                Some(_) => {}
            }
        }
        crate::logging::info_kv(
            "relay fallback requested",
            &[("session", session_id), ("watcher", watcher_id)],
        );
        self.deliver(vec![(
            watcher_id.to_string(),
            ServerMessage::InitiateRelayFallback,
        )]);
        Ok(())
    }

    /// Cleans up after a closed connection: owned active sessions enter their
    /// grace period and the connection leaves every watcher set.
    pub async fn connection_closed(&self, conn_id: &str) {
        let (owned, notices) = {
            let mut state = self.lock();
            let mut owned = Vec::new();
            let mut notices = Vec::new();
            for (id, session) in state.sessions.iter_mut() {
                if session.owner == conn_id && session.status == SessionStatus::Active {
                    owned.push(id.clone());
                }
                if session.watchers.remove(conn_id) {
                    notices.push((
                        session.owner.clone(),
                        ServerMessage::WatcherLeft {
                            watcher_id: conn_id.to_string(),
                        },
                    ));
                }
            }
            (owned, notices)
        };
        self.deliver(notices);
        for session_id in owned {
            self.owner_disconnected(&session_id).await;
        }
    }

    async fn expire(&self, session_id: &str, epoch: u64) {
        let notices = {
            let mut state = self.lock();
            let due = matches!(
                state.sessions.get(session_id),
                Some(s) if s.status == SessionStatus::Disconnected
                    && s.deletion.as_ref().map(|t| t.epoch) == Some(epoch)
            );
            if !due {
                return;
            }
            match state.sessions.remove(session_id) {
                Some(mut session) => {
                    // This task is the timer; dropping its handle must not abort it.
                    session.deletion = None;
                    end_session(session)
                }
                None => return,
            }
        };
        crate::logging::warn_kv(
            "broadcast expired after owner grace period",
            &[("session", session_id)],
        );
        self.deliver(notices);
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.lock().sessions.get(session_id).map(|s| s.status)
    }

    pub fn owner_of(&self, session_id: &str) -> Option<String> {
        self.lock().sessions.get(session_id).map(|s| s.owner.clone())
    }

    /// Whether `a` and `b` are the current owner and a joined watcher of one
    /// session, in either order. Relay traffic is only passed between such a
    /// pair.
    pub fn shares_session(&self, a: &str, b: &str) -> bool {
        self.lock().sessions.values().any(|s| {
            (s.owner == a && s.watchers.contains(b)) || (s.owner == b && s.watchers.contains(a))
        })
    }

    pub fn watchers_of(&self, session_id: &str) -> Vec<String> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.watchers.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn deliver(&self, notices: Notices) {
        for (to, msg) in notices {
            let kind = msg.kind();
            if !self.hub.send(&to, msg) {
                crate::logging::debug_kv("notice target gone", &[("to", &to), ("kind", kind)]);
            }
        }
    }
}

fn watcher_notices(session: &BroadcastSession, msg: ServerMessage) -> Notices {
    session
        .watchers
        .iter()
        .map(|w| (w.clone(), msg.clone()))
        .collect()
}

fn end_session(mut session: BroadcastSession) -> Notices {
    if let Some(timer) = session.deletion.take() {
        timer.cancel();
    }
    watcher_notices(&session, ServerMessage::BroadcastEnded)
}

fn new_session_id() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    bytes
        .iter()
        .take(SESSION_ID_LEN)
        .map(|b| ID_ALPHABET[(*b as usize) % ID_ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::hub::Outbound;
    use tokio::sync::mpsc::Receiver;

    const GRACE: Duration = Duration::from_secs(45);

    fn manifest() -> Vec<FileDescriptor> {
        vec![FileDescriptor {
            name: "a.bin".into(),
            byte_size: 10,
            mime_type: "application/octet-stream".into(),
            relative_path: "a.bin".into(),
        }]
    }

    async fn next_text(rx: &mut Receiver<Outbound>) -> ServerMessage {
        match rx.recv().await {
            Some(Outbound::Text(msg)) => msg,
            other => panic!("expected text notice, got {other:?}"),
        }
    }

    fn drain(rx: &mut Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(msg)) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn setup() -> (SessionRegistry, ConnectionHub, String, String, Receiver<Outbound>, Receiver<Outbound>) {
        let hub = ConnectionHub::new();
        let registry = SessionRegistry::new(hub.clone(), GRACE);
        let mut owner_rx = hub.register("owner");
        let mut watcher_rx = hub.register("w1");
        let (id, token) = registry.start_broadcast("owner", manifest()).await;
        assert!(matches!(next_text(&mut owner_rx).await, ServerMessage::BroadcastStarted { .. }));
        registry.join_watcher(&id, "w1").await.unwrap();
        assert!(matches!(next_text(&mut watcher_rx).await, ServerMessage::ManifestReady { .. }));
        assert_eq!(
            next_text(&mut owner_rx).await,
            ServerMessage::WatcherReady { watcher_id: "w1".into() }
        );
        (registry, hub, id, token, owner_rx, watcher_rx)
    }

    #[tokio::test]
    async fn start_allocates_distinct_ids_and_tokens() {
        let hub = ConnectionHub::new();
        let registry = SessionRegistry::new(hub.clone(), GRACE);
        let _rx = hub.register("owner");
        let (a, ta) = registry.start_broadcast("owner", manifest()).await;
        let (b, tb) = registry.start_broadcast("owner", manifest()).await;
        assert_ne!(a, b);
        assert_ne!(ta, tb);
        assert_eq!(a.len(), SESSION_ID_LEN);
        assert_eq!(ta.len(), 32);
        crate::config::validate_session_id(&a).unwrap();
        assert_eq!(registry.status(&a), Some(SessionStatus::Active));
        assert_eq!(registry.owner_of(&b).as_deref(), Some("owner"));
    }

    #[tokio::test]
    async fn join_unknown_session_is_rejected_without_manifest() {
        let hub = ConnectionHub::new();
        let registry = SessionRegistry::new(hub.clone(), GRACE);
        let mut rx = hub.register("w1");
        let err = registry.join_watcher("nope00", "w1").await.unwrap_err();
        assert_eq!(err, RegistryError::NotFound);
        let notices = drain(&mut rx);
        assert!(matches!(notices[0], ServerMessage::JoinRejected { .. }));
        assert!(matches!(notices[1], ServerMessage::ErrorMessage { .. }));
        assert!(!notices
            .iter()
            .any(|m| matches!(m, ServerMessage::ManifestReady { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn join_disconnected_session_is_rejected() {
        let (registry, hub, id, _token, _owner_rx, _watcher_rx) = setup().await;
        registry.owner_disconnected(&id).await;
        let mut late_rx = hub.register("w2");
        let err = registry.join_watcher(&id, "w2").await.unwrap_err();
        assert_eq!(err, RegistryError::NotActive);
        assert!(!drain(&mut late_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::ManifestReady { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_within_grace_resumes_without_ending() {
        let (registry, hub, id, token, mut owner_rx, mut watcher_rx) = setup().await;
        registry.connection_closed("owner").await;
        assert_eq!(registry.status(&id), Some(SessionStatus::Disconnected));
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::OwnerUnstable);

        tokio::time::advance(Duration::from_secs(30)).await;
        let mut owner2_rx = hub.register("owner-2");
        registry.reclaim(&id, &token, "owner-2").await.unwrap();
        assert_eq!(
            next_text(&mut owner2_rx).await,
            ServerMessage::ReclaimAccepted {
                session_id: id.clone(),
                watchers: vec!["w1".into()]
            }
        );
        assert_eq!(registry.status(&id), Some(SessionStatus::Active));
        assert_eq!(registry.owner_of(&id).as_deref(), Some("owner-2"));
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::OwnerRecovered);

        // Well past the original deadline: the cancelled timer never fires.
        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.status(&id), Some(SessionStatus::Active));
        assert!(!drain(&mut watcher_rx)
            .iter()
            .any(|m| *m == ServerMessage::BroadcastEnded));
        // The old owner connection never receives the ack.
        assert!(drain(&mut owner_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_with_wrong_token_is_rejected() {
        let (registry, hub, id, _token, _owner_rx, _watcher_rx) = setup().await;
        registry.owner_disconnected(&id).await;
        let mut thief = hub.register("thief");
        let err = registry.reclaim(&id, "guessed", "thief").await.unwrap_err();
        assert_eq!(err, RegistryError::TokenMismatch);
        assert!(matches!(next_text(&mut thief).await, ServerMessage::ReclaimRejected { .. }));
        assert_eq!(registry.status(&id), Some(SessionStatus::Disconnected));
        assert_eq!(registry.owner_of(&id).as_deref(), Some("owner"));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_ends_broadcast_and_rejects_reclaim() {
        let (registry, hub, id, token, _owner_rx, mut watcher_rx) = setup().await;
        registry.owner_disconnected(&id).await;
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::OwnerUnstable);

        // Paused clock auto-advances to the 45 s deadline.
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::BroadcastEnded);
        assert_eq!(registry.status(&id), None);

        let _late = hub.register("owner-2");
        let err = registry.reclaim(&id, &token, "owner-2").await.unwrap_err();
        assert_eq!(err, RegistryError::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_disconnect_keeps_original_deadline() {
        let (registry, _hub, id, _token, _owner_rx, mut watcher_rx) = setup().await;
        let started = tokio::time::Instant::now();
        registry.owner_disconnected(&id).await;
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::OwnerUnstable);
        tokio::time::advance(Duration::from_secs(40)).await;
        registry.owner_disconnected(&id).await;
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::BroadcastEnded);
        assert!(started.elapsed() < Duration::from_secs(46));
        assert_eq!(registry.status(&id), None);
    }

    #[tokio::test]
    async fn only_owner_can_stop() {
        let (registry, _hub, id, _token, _owner_rx, mut watcher_rx) = setup().await;
        assert_eq!(
            registry.stop_broadcast(&id, "w1").await.unwrap_err(),
            RegistryError::NotOwner
        );
        assert_eq!(registry.status(&id), Some(SessionStatus::Active));
        registry.stop_broadcast(&id, "owner").await.unwrap();
        assert_eq!(registry.status(&id), None);
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::BroadcastEnded);
        assert_eq!(
            registry.stop_broadcast(&id, "owner").await.unwrap_err(),
            RegistryError::NotFound
        );
    }

    #[tokio::test]
    async fn watcher_close_notifies_owner_and_leaves_set() {
        let (registry, _hub, id, _token, mut owner_rx, _watcher_rx) = setup().await;
        registry.connection_closed("w1").await;
        assert_eq!(
            next_text(&mut owner_rx).await,
            ServerMessage::WatcherLeft { watcher_id: "w1".into() }
        );
        assert!(registry.watchers_of(&id).is_empty());
        assert_eq!(registry.status(&id), Some(SessionStatus::Active));
    }

    #[tokio::test]
    async fn fallback_request_requires_owner_and_joined_watcher() {
        let (registry, hub, id, _token, _owner_rx, mut watcher_rx) = setup().await;
        assert_eq!(
            registry.request_relay_fallback(&id, "w1", "w1").await.unwrap_err(),
            RegistryError::NotOwner
        );
        // A live connection that never joined this session.
        let mut bystander = hub.register("bystander");
        assert_eq!(
            registry
                .request_relay_fallback(&id, "owner", "bystander")
                .await
                .unwrap_err(),
            RegistryError::NotWatcher
        );
        assert!(drain(&mut bystander).is_empty());
        registry.request_relay_fallback(&id, "owner", "w1").await.unwrap();
        assert_eq!(next_text(&mut watcher_rx).await, ServerMessage::InitiateRelayFallback);
    }

    #[tokio::test(start_paused = true)]
    async fn only_current_owner_and_its_watchers_share_a_session() {
        let (registry, hub, id, token, _owner_rx, _watcher_rx) = setup().await;
        let _other = hub.register("w9");
        assert!(registry.shares_session("owner", "w1"));
        assert!(registry.shares_session("w1", "owner"));
        assert!(!registry.shares_session("owner", "w9"));
        assert!(!registry.shares_session("w1", "w9"));

        registry.connection_closed("owner").await;
        let _owner2 = hub.register("owner-2");
        registry.reclaim(&id, &token, "owner-2").await.unwrap();
        assert!(registry.shares_session("owner-2", "w1"));
        assert!(!registry.shares_session("owner", "w1"));
    }
}
