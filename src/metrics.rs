//! Prometheus metrics for robustircd.
//!
//! Exposed on `GET /metrics`. Gauges describing the IRC state are updated by
//! the FSM driver after every apply, which keeps the scrape path free of any
//! locking against the state machine.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Registry holding all robustircd metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Raft records applied, partitioned by record type.
    pub static ref APPLIED_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("applied_messages", "Applied raft records by type"),
        &["type"]
    ).expect("APPLIED_MESSAGES metric creation failed");

    /// Seconds spent in each raft state.
    pub static ref SECONDS_IN_STATE: IntCounterVec = IntCounterVec::new(
        Opts::new("seconds_in_state", "Seconds the node spent in each raft state"),
        &["state"]
    ).expect("SECONDS_IN_STATE metric creation failed");

    /// 1 if this node currently is the raft leader, 0 otherwise.
    pub static ref IS_LEADER: IntGauge = IntGauge::new(
        "raft_isleader",
        "Whether this node is the raft leader"
    ).expect("IS_LEADER metric creation failed");

    /// Number of live IRC sessions.
    pub static ref SESSIONS: IntGauge = IntGauge::new(
        "irc_sessions",
        "Number of IRC sessions"
    ).expect("SESSIONS metric creation failed");

    /// Maximum number of IRC sessions.
    pub static ref SESSION_LIMIT: IntGauge = IntGauge::new(
        "irc_session_limit",
        "Maximum number of IRC sessions"
    ).expect("SESSION_LIMIT metric creation failed");

    /// Number of IRC channels.
    pub static ref CHANNELS: IntGauge = IntGauge::new(
        "irc_channels",
        "Number of IRC channels"
    ).expect("CHANNELS metric creation failed");

    /// Maximum number of IRC channels.
    pub static ref CHANNEL_LIMIT: IntGauge = IntGauge::new(
        "irc_channel_limit",
        "Maximum number of IRC channels"
    ).expect("CHANNEL_LIMIT metric creation failed");
}

/// Register all metrics. Call once at startup.
pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(APPLIED_MESSAGES.clone()),
        Box::new(SECONDS_IN_STATE.clone()),
        Box::new(IS_LEADER.clone()),
        Box::new(SESSIONS.clone()),
        Box::new(SESSION_LIMIT.clone()),
        Box::new(CHANNELS.clone()),
        Box::new(CHANNEL_LIMIT.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::warn!(error = %e, "failed to register metric");
        }
    }
}

/// Gather all metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
