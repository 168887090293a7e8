//! Shared support for integration tests: a single-node network driven
//! through the same consensus seam the HTTP layer uses.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use robustircd::ircserver::SessionId;
use robustircd::outputstream::OutputStream;
use robustircd::raft::{Consensus, LocalNode, RedbLogStore, RobustFsm, SnapshotData};
use robustircd::types::{RobustId, RobustMessage, RobustType};

/// A fixed, readable base timestamp (nanoseconds).
pub const NOW: i64 = 1_700_000_000_000_000_000;

const APPLY_WAIT: Duration = Duration::from_secs(5);

pub struct TestNode {
    pub dir: tempfile::TempDir,
    pub output: Arc<OutputStream>,
    pub fsm: Arc<RobustFsm>,
    pub store: Arc<RedbLogStore>,
    pub node: Arc<LocalNode>,
}

impl TestNode {
    pub fn new() -> TestNode {
        TestNode::build(None)
    }

    /// A fresh node whose state starts from a snapshot, as after a restore.
    pub fn restored_from(snapshot: SnapshotData) -> TestNode {
        TestNode::build(Some(snapshot))
    }

    fn build(snapshot: Option<SnapshotData>) -> TestNode {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = Arc::new(OutputStream::open(dir.path()).expect("open output"));
        let fsm = Arc::new(RobustFsm::new("robustirc.net", Arc::clone(&output)));
        if let Some(snapshot) = snapshot {
            fsm.restore_snapshot(snapshot).expect("restore snapshot");
        }
        let store = Arc::new(RedbLogStore::open(dir.path()).expect("open store"));
        let node = Arc::new(
            LocalNode::new(
                Arc::clone(&fsm),
                Arc::clone(&store),
                dir.path(),
                "127.0.0.1:60667".to_string(),
            )
            .expect("local node"),
        );
        TestNode {
            dir,
            output,
            fsm,
            store,
            node,
        }
    }

    pub async fn create_session(&self, now: i64) -> SessionId {
        let msg = RobustMessage::new(RobustType::CreateSession, 0, "10.0.0.1:1234".into(), now);
        let id = self
            .node
            .apply(msg.encode(), APPLY_WAIT)
            .await
            .expect("create session");
        SessionId(id.id)
    }

    pub async fn send(&self, session: SessionId, line: &str, now: i64) -> RobustId {
        let msg = RobustMessage::new(RobustType::IrcFromClient, session.0, line.into(), now);
        self.node.apply(msg.encode(), APPLY_WAIT).await.expect("send")
    }

    pub async fn delete_session(&self, session: SessionId, reason: &str, now: i64) -> RobustId {
        let msg = RobustMessage::new(RobustType::DeleteSession, session.0, reason.into(), now);
        self.node
            .apply(msg.encode(), APPLY_WAIT)
            .await
            .expect("delete session")
    }

    /// Create a session and complete its registration.
    pub async fn register(&self, nick: &str, now: i64) -> SessionId {
        let session = self.create_session(now).await;
        self.send(session, &format!("NICK {}", nick), now).await;
        self.send(session, &format!("USER {} 0 * :{}", nick, nick), now)
            .await;
        session
    }

    /// The current high-water mark of the output stream, for use as a
    /// `lines_after` cursor.
    pub fn mark(&self) -> RobustId {
        self.output.last_id().unwrap_or_default()
    }

    /// Everything visible to `session` after `mark`, without blocking.
    pub async fn lines_after(&self, session: SessionId, mark: RobustId) -> Vec<String> {
        let cancel = CancellationToken::new();
        let mut last = mark;
        let mut lines = Vec::new();
        loop {
            let deadline = Instant::now() + Duration::from_millis(20);
            match self.output.get_next(session, last, deadline, &cancel).await {
                Ok((id, batch)) => {
                    assert!(id > last, "get_next ids must strictly increase");
                    lines.extend(batch);
                    last = id;
                }
                Err(_) => break,
            }
        }
        lines
    }
}
