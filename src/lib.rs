//! robustircd - a fault-tolerant IRC network node.
//!
//! A cluster of these nodes replicates a totally-ordered log of IRC commands
//! through raft; every node applies the committed log to a deterministic
//! in-memory IRC state machine and fans the produced replies out to
//! long-polling bridges. A client keeps its session as long as any node is
//! reachable.

pub mod api;
pub mod config;
pub mod error;
pub mod expiry;
pub mod ircserver;
pub mod metrics;
pub mod outputstream;
pub mod raft;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

pub use error::{Error, Result};

use config::Config;
use outputstream::OutputStream;
use raft::{Consensus, RedbLogStore, RobustFsm};

/// Everything a request handler needs, constructed once at startup and
/// passed explicitly instead of living in process-wide globals.
pub struct Core {
    pub config: Config,
    /// Effective network password (config or environment).
    pub password: String,
    pub fsm: Arc<RobustFsm>,
    pub output: Arc<OutputStream>,
    pub store: Arc<RedbLogStore>,
    pub consensus: Arc<dyn Consensus>,
}
