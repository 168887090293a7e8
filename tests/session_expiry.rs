//! Session expiry: idle sessions receive a DeleteSession through the
//! ordinary apply path once the leader's tick finds them.

mod common;

use common::{TestNode, NOW};

use std::time::Duration;

use robustircd::raft::Consensus;
use robustircd::types::RobustType;

const MINUTE: i64 = 60_000_000_000;

/// One leader tick: propose a DeleteSession for every idle session, exactly
/// as the expiry loop does.
async fn tick(node: &TestNode, now: i64) -> usize {
    let proposals = node.fsm.expire_sessions(now);
    let count = proposals.len();
    for msg in proposals {
        node.node
            .apply(msg.encode(), Duration::from_secs(5))
            .await
            .expect("expiry proposal");
    }
    count
}

#[tokio::test]
async fn test_idle_session_is_deleted() {
    let node = TestNode::new();
    let idle = node.register("idler", NOW).await;
    let busy = node.register("busy", NOW).await;
    node.send(idle, "JOIN #x", NOW).await;
    node.send(busy, "JOIN #x", NOW).await;

    // TTL defaults to 10 minutes; `busy` stays active, `idle` does not.
    let later = NOW + 11 * MINUTE;
    node.send(busy, "PING :keepalive", later).await;

    let mark = node.mark();
    assert_eq!(tick(&node, later).await, 1);

    let server = node.fsm.server();
    assert!(server.session_by_id(idle).is_none());
    assert!(server.session_by_id(busy).is_some());
    drop(server);

    // The survivor sees the expiry as an ordinary QUIT.
    let busy_lines = node.lines_after(busy, mark).await;
    assert_eq!(
        busy_lines,
        vec![format!(":idler!~idler@robust/{} QUIT :Ping timeout", idle)]
    );
}

#[tokio::test]
async fn test_fresh_sessions_are_left_alone() {
    let node = TestNode::new();
    node.register("fresh", NOW).await;
    assert_eq!(tick(&node, NOW + MINUTE).await, 0);
    assert_eq!(node.fsm.server().num_sessions(), 1);
}

#[tokio::test]
async fn test_expiry_is_idempotent_across_ticks() {
    let node = TestNode::new();
    let idle = node.register("idler", NOW).await;
    let later = NOW + 11 * MINUTE;

    assert_eq!(tick(&node, later).await, 1);
    // A second tick finds nothing; the session is already gone.
    assert_eq!(tick(&node, later).await, 0);
    assert!(node.fsm.server().session_by_id(idle).is_none());
}

#[tokio::test]
async fn test_expiry_honors_replicated_ttl() {
    let node = TestNode::new();
    let msg = robustircd::types::RobustMessage::new(
        RobustType::Config,
        0,
        "session_expiration_secs = 60".to_string(),
        NOW,
    );
    node.node
        .apply(msg.encode(), Duration::from_secs(5))
        .await
        .expect("config record");

    node.register("idler", NOW).await;
    assert_eq!(tick(&node, NOW + 30_000_000_000).await, 0);
    assert_eq!(tick(&node, NOW + 2 * MINUTE).await, 1);
}
