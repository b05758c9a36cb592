//! Per-tenant chat broadcast hubs.
//!
//! Each tenant gets exactly one [`ChatHub`]: a spawned task that owns the
//! session map and drains a command channel. Every `join`, `leave`, and
//! `publish` is processed one at a time in arrival order, so delivery order
//! within a tenant matches submission order and the membership set needs no
//! external locking. Hubs of different tenants share nothing and run
//! concurrently.
//!
//! Messages are ephemeral. Nothing is stored, and late joiners see nothing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::tenant::TenantId;

/// Identifier of one chat connection. Joining again under the same id
/// replaces the previous membership entry instead of duplicating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat message as it crosses the wire. `user` and `time` are stamped by
/// the hub from session identity, never taken from the client.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub user: String,
    pub text: String,
    pub time: DateTime<Utc>,
}

/// Frames delivered to a connected client: broadcast messages, plus error
/// notices addressed to a single sender (e.g. a muted publish attempt).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Message(ChatMessage),
    Error { error: String },
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("you are muted and cannot send messages")]
    Muted,

    #[error("chat session is no longer registered")]
    SessionClosed,

    #[error("chat hub is unavailable")]
    HubClosed,
}

struct Session {
    username: String,
    muted: bool,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

enum HubCommand {
    Join {
        conn: ConnId,
        username: String,
        muted: bool,
        tx: mpsc::UnboundedSender<OutboundFrame>,
    },
    Leave {
        conn: ConnId,
    },
    Publish {
        conn: ConnId,
        text: String,
        respond: oneshot::Sender<Result<(), ChatError>>,
    },
    MemberCount {
        respond: oneshot::Sender<usize>,
    },
}

/// Handle to one tenant's hub actor. Cheap to clone; all clones talk to the
/// same spawned task.
#[derive(Clone)]
pub struct ChatHub {
    cmd_tx: mpsc::UnboundedSender<HubCommand>,
    tenant: TenantId,
}

impl ChatHub {
    fn spawn(tenant: TenantId) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut sessions: HashMap<ConnId, Session> = HashMap::new();
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HubCommand::Join {
                        conn,
                        username,
                        muted,
                        tx,
                    } => {
                        let replaced = sessions
                            .insert(
                                conn,
                                Session {
                                    username: username.clone(),
                                    muted,
                                    tx,
                                },
                            )
                            .is_some();
                        tracing::debug!(%tenant, %conn, user = %username, replaced, "chat session joined");
                    }
                    HubCommand::Leave { conn } => {
                        if sessions.remove(&conn).is_some() {
                            tracing::debug!(%tenant, %conn, "chat session left");
                        }
                    }
                    HubCommand::Publish { conn, text, respond } => {
                        let _ = respond.send(fan_out(&mut sessions, tenant, conn, text));
                    }
                    HubCommand::MemberCount { respond } => {
                        let _ = respond.send(sessions.len());
                    }
                }
            }
            tracing::debug!(%tenant, "chat hub stopped");
        });
        Self { cmd_tx, tenant }
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Register a session. Safe to call again with the same `conn` after a
    /// reconnect; the old entry is replaced, never duplicated.
    pub fn join(
        &self,
        conn: ConnId,
        username: String,
        muted: bool,
        tx: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Result<(), ChatError> {
        self.cmd_tx
            .send(HubCommand::Join {
                conn,
                username,
                muted,
                tx,
            })
            .map_err(|_| ChatError::HubClosed)
    }

    /// Remove a session. Idempotent; unknown ids are ignored.
    pub fn leave(&self, conn: ConnId) {
        let _ = self.cmd_tx.send(HubCommand::Leave { conn });
    }

    /// Broadcast `text` from `conn` to every other session in this hub.
    pub async fn publish(&self, conn: ConnId, text: String) -> Result<(), ChatError> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(HubCommand::Publish { conn, text, respond })
            .map_err(|_| ChatError::HubClosed)?;
        rx.await.map_err(|_| ChatError::HubClosed)?
    }

    /// Current number of registered sessions.
    pub async fn member_count(&self) -> usize {
        let (respond, rx) = oneshot::channel();
        if self.cmd_tx.send(HubCommand::MemberCount { respond }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    #[cfg(test)]
    fn same_hub(&self, other: &ChatHub) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }
}

/// One serialized fan-out pass. Best-effort: a recipient whose channel is
/// gone is dropped from the membership set, and delivery continues to the
/// rest. The sender never receives its own message back.
fn fan_out(
    sessions: &mut HashMap<ConnId, Session>,
    tenant: TenantId,
    sender: ConnId,
    text: String,
) -> Result<(), ChatError> {
    let (author, muted) = match sessions.get(&sender) {
        Some(s) => (s.username.clone(), s.muted),
        None => return Err(ChatError::SessionClosed),
    };
    if muted {
        return Err(ChatError::Muted);
    }
    let msg = ChatMessage {
        user: author,
        text,
        time: Utc::now(),
    };
    let mut departed = Vec::new();
    for (id, session) in sessions.iter() {
        if *id == sender {
            continue;
        }
        if session.tx.send(OutboundFrame::Message(msg.clone())).is_err() {
            departed.push(*id);
        }
    }
    for id in departed {
        sessions.remove(&id);
        tracing::debug!(%tenant, conn = %id, "dropped unreachable chat session");
    }
    Ok(())
}

/// Lazily creates and memoizes exactly one hub per tenant for the lifetime
/// of the process, so every connection of a tenant lands in the same hub.
pub struct HubRegistry {
    hubs: RwLock<HashMap<TenantId, ChatHub>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the hub for `tenant`, spawning it on first access. The
    /// entry-or-insert under the write lock guarantees at most one hub per
    /// tenant even under concurrent first joins.
    pub async fn hub_for(&self, tenant: TenantId) -> ChatHub {
        if let Some(hub) = self.hubs.read().await.get(&tenant) {
            return hub.clone();
        }
        let mut hubs = self.hubs.write().await;
        hubs.entry(tenant)
            .or_insert_with(|| {
                tracing::info!(%tenant, "starting chat hub");
                ChatHub::spawn(tenant)
            })
            .clone()
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Rx = mpsc::UnboundedReceiver<OutboundFrame>;

    fn channel() -> (mpsc::UnboundedSender<OutboundFrame>, Rx) {
        mpsc::unbounded_channel()
    }

    fn expect_message(rx: &mut Rx) -> ChatMessage {
        match rx.try_recv().expect("expected a frame") {
            OutboundFrame::Message(m) => m,
            OutboundFrame::Error { error } => panic!("unexpected error frame: {error}"),
        }
    }

    fn expect_silence(rx: &mut Rx) {
        assert!(rx.try_recv().is_err(), "expected no frame");
    }

    #[tokio::test]
    async fn publish_reaches_everyone_but_the_sender() {
        let registry = HubRegistry::new();
        let hub = registry.hub_for(TenantId(1)).await;

        let (u1_tx, mut u1_rx) = channel();
        let (u2_tx, mut u2_rx) = channel();
        let (u3_tx, mut u3_rx) = channel();
        let u1 = ConnId::new();
        hub.join(u1, "u1".into(), false, u1_tx).unwrap();
        hub.join(ConnId::new(), "u2".into(), false, u2_tx).unwrap();
        hub.join(ConnId::new(), "u3".into(), false, u3_tx).unwrap();

        hub.publish(u1, "hi".into()).await.unwrap();

        for rx in [&mut u2_rx, &mut u3_rx] {
            let msg = expect_message(rx);
            assert_eq!(msg.user, "u1");
            assert_eq!(msg.text, "hi");
            expect_silence(rx);
        }
        expect_silence(&mut u1_rx);
    }

    #[tokio::test]
    async fn delivery_order_matches_submission_order() {
        let registry = HubRegistry::new();
        let hub = registry.hub_for(TenantId(1)).await;

        let (a_tx, _a_rx) = channel();
        let (b_tx, _b_rx) = channel();
        let (observer_tx, mut observer_rx) = channel();
        let a = ConnId::new();
        let b = ConnId::new();
        hub.join(a, "a".into(), false, a_tx).unwrap();
        hub.join(b, "b".into(), false, b_tx).unwrap();
        hub.join(ConnId::new(), "observer".into(), false, observer_tx)
            .unwrap();

        // Two senders interleaved; the hub's command queue is the single
        // point of serialization, so the observer sees submission order.
        let submissions = [(a, "one"), (b, "two"), (a, "three"), (b, "four"), (a, "five")];
        for (sender, text) in submissions {
            hub.publish(sender, text.into()).await.unwrap();
        }

        for (sender, text) in submissions {
            let msg = expect_message(&mut observer_rx);
            let author = if sender == a { "a" } else { "b" };
            assert_eq!(msg.user, author);
            assert_eq!(msg.text, text);
        }
        expect_silence(&mut observer_rx);
    }

    #[tokio::test]
    async fn muted_session_cannot_publish() {
        let registry = HubRegistry::new();
        let hub = registry.hub_for(TenantId(1)).await;

        let (u1_tx, mut u1_rx) = channel();
        let (u2_tx, mut u2_rx) = channel();
        let u1 = ConnId::new();
        let u2 = ConnId::new();
        hub.join(u1, "u1".into(), false, u1_tx).unwrap();
        hub.join(u2, "u2".into(), true, u2_tx).unwrap();

        let err = hub.publish(u2, "psst".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::Muted));
        expect_silence(&mut u1_rx);

        // Muted means cannot send; receiving still works.
        hub.publish(u1, "announcement".into()).await.unwrap();
        let msg = expect_message(&mut u2_rx);
        assert_eq!(msg.user, "u1");
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let registry = HubRegistry::new();
        let acme = registry.hub_for(TenantId(1)).await;
        let globex = registry.hub_for(TenantId(2)).await;
        assert!(!acme.same_hub(&globex));

        let (a_tx, _a_rx) = channel();
        let (g_tx, mut g_rx) = channel();
        let a = ConnId::new();
        acme.join(a, "a".into(), false, a_tx).unwrap();
        globex.join(ConnId::new(), "g".into(), false, g_tx).unwrap();

        acme.publish(a, "internal memo".into()).await.unwrap();
        expect_silence(&mut g_rx);
    }

    #[tokio::test]
    async fn registry_memoizes_one_hub_per_tenant() {
        let registry = HubRegistry::new();
        let first = registry.hub_for(TenantId(7)).await;
        let second = registry.hub_for(TenantId(7)).await;
        assert!(first.same_hub(&second));
    }

    #[tokio::test]
    async fn rejoin_replaces_instead_of_duplicating() {
        let registry = HubRegistry::new();
        let hub = registry.hub_for(TenantId(1)).await;

        let conn = ConnId::new();
        let (old_tx, mut old_rx) = channel();
        let (new_tx, mut new_rx) = channel();
        hub.join(conn, "flaky".into(), false, old_tx).unwrap();
        hub.join(conn, "flaky".into(), false, new_tx).unwrap();

        let (peer_tx, _peer_rx) = channel();
        let peer = ConnId::new();
        hub.join(peer, "peer".into(), false, peer_tx).unwrap();
        assert_eq!(hub.member_count().await, 2);

        hub.publish(peer, "hello again".into()).await.unwrap();
        expect_message(&mut new_rx);
        expect_silence(&mut new_rx);
        expect_silence(&mut old_rx);
    }

    #[tokio::test]
    async fn unreachable_recipient_is_dropped_mid_fanout() {
        let registry = HubRegistry::new();
        let hub = registry.hub_for(TenantId(1)).await;

        let (a_tx, _a_rx) = channel();
        let (b_tx, b_rx) = channel();
        let (c_tx, mut c_rx) = channel();
        let a = ConnId::new();
        hub.join(a, "a".into(), false, a_tx).unwrap();
        hub.join(ConnId::new(), "b".into(), false, b_tx).unwrap();
        hub.join(ConnId::new(), "c".into(), false, c_tx).unwrap();

        // b's receiving half goes away; the next fan-out self-heals.
        drop(b_rx);
        hub.publish(a, "still here?".into()).await.unwrap();

        expect_message(&mut c_rx);
        assert_eq!(hub.member_count().await, 2);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let registry = HubRegistry::new();
        let hub = registry.hub_for(TenantId(1)).await;

        let conn = ConnId::new();
        let (tx, _rx) = channel();
        hub.join(conn, "u".into(), false, tx).unwrap();
        hub.leave(conn);
        hub.leave(conn);
        assert_eq!(hub.member_count().await, 0);

        // A departed session can no longer publish.
        let err = hub.publish(conn, "ghost".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionClosed));
    }
}
