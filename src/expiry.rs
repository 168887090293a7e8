//! Leader-only session expiry.
//!
//! Every node ticks; only the current leader proposes. A node becoming or
//! ceasing to be the leader around a tick is harmless, because the tick
//! fires often enough that it eventually runs on whoever leads, so sessions
//! idle beyond the TTL always receive their DeleteSession.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::raft::{Consensus, NodeState};
use crate::Core;

/// How often to look for expired sessions.
pub const EXPIRE_SESSIONS_INTERVAL: Duration = Duration::from_secs(10);

/// Wait window for each proposed DeleteSession.
const APPLY_WAIT: Duration = Duration::from_secs(10);

/// Wall clock in nanoseconds since the epoch. Only ever used on the propose
/// side; the value enters the log as the record timestamp and every node
/// interprets that, never its own clock.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_nanos() as i64
}

/// Run the expiry loop forever.
pub async fn run(core: Arc<Core>) {
    let mut ticker = tokio::time::interval(EXPIRE_SESSIONS_INTERVAL);
    loop {
        ticker.tick().await;
        if core.consensus.state() != NodeState::Leader {
            continue;
        }
        for msg in core.fsm.expire_sessions(now_nanos()) {
            let session = msg.session;
            if let Err(e) = core.consensus.apply(msg.encode(), APPLY_WAIT).await {
                tracing::warn!(session, error = %e, "could not propose session expiry");
            } else {
                tracing::info!(session, "expired idle session");
            }
        }
    }
}
