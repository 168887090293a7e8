//! robustircd - a fault-tolerant IRC network node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use robustircd::config::Config;
use robustircd::outputstream::OutputStream;
use robustircd::raft::{
    Consensus, FileSnapshotStore, LocalNode, NodeState, RedbLogStore, RobustFsm,
};
use robustircd::{api, expiry, metrics, Core};

/// Largest tolerated difference between this node's clock and the network's
/// at bootstrap. Joining with a skewed clock would poison every record
/// timestamp this node proposes.
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "robustircd.toml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;
    let password = config.network_password()?;
    let raft_dir = config.raft.dir.clone();

    info!(
        network = %config.network.name,
        listen = %config.listen.address,
        dir = %raft_dir.display(),
        "starting robustircd"
    );

    // The deletestate sentinel wipes everything before init; an operator
    // drops it in place to reset a node that fell too far behind.
    if raft_dir.join("deletestate").exists() {
        std::fs::remove_dir_all(&raft_dir)
            .with_context(|| format!("wiping {}", raft_dir.display()))?;
        warn!(dir = %raft_dir.display(), "deleted data directory because deletestate existed");
    }
    std::fs::create_dir_all(&raft_dir)?;
    remove_stale_tempfiles(&raft_dir)?;

    metrics::init();

    let output = Arc::new(OutputStream::open(&raft_dir)?);
    let fsm = Arc::new(RobustFsm::new(&config.network.name, Arc::clone(&output)));
    let store = Arc::new(RedbLogStore::open(&raft_dir)?);
    let snapshots = FileSnapshotStore::open(&raft_dir)?;

    if let Some((index, snapshot)) = snapshots.latest()? {
        info!(index, "restoring latest snapshot");
        fsm.restore_snapshot(snapshot)?;
    }
    // Replay the log tail; entries at or below the snapshot are skipped by
    // the FSM's idempotence guard.
    for entry in store.entries()? {
        fsm.apply(&entry)?;
    }
    info!(last_applied = fsm.last_applied(), "log replay complete");

    let node = Arc::new(LocalNode::new(
        Arc::clone(&fsm),
        Arc::clone(&store),
        &raft_dir,
        config.peer_addr(),
    )?);

    if !config.raft.single_node && config.raft.join.is_none() && node.peers().len() <= 1 {
        anyhow::bail!(
            "no peers known and raft.join not set; set raft.single_node = true if and only if \
             this is the first node of a new network"
        );
    }

    let core = Arc::new(Core {
        config: config.clone(),
        password: password.clone(),
        fsm: Arc::clone(&fsm),
        output,
        store: Arc::clone(&store),
        consensus: node.clone(),
    });

    let app = api::router(Arc::clone(&core))
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(config.listen.address)
        .await
        .with_context(|| format!("binding {}", config.listen.address))?;
    info!(addr = %config.listen.address, "HTTP API listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    if let Some(master) = config.raft.join.clone() {
        join_master(&master, &config.peer_addr(), &password).await?;
    }

    tokio::spawn(expiry::run(Arc::clone(&core)));
    tokio::spawn(snapshot_loop(Arc::clone(&core), snapshots));

    // Main watch loop, mirroring the raft state into metrics and
    // terminating once the node is removed from the network.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let state = core.consensus.state();
        let label = state.to_string();
        metrics::SECONDS_IN_STATE
            .with_label_values(&[label.as_str()])
            .inc();
        metrics::IS_LEADER.set((state == NodeState::Leader) as i64);
        if state == NodeState::Shutdown {
            anyhow::bail!("node removed from the network (raft state shutdown), terminating");
        }
    }
}

/// Periodically persist a snapshot and fold the log behind it.
///
/// Storage failures here are fatal: a node that cannot write snapshots will
/// never catch up again after a restart, so it terminates and lets the
/// supervisor resolve the situation.
async fn snapshot_loop(core: Arc<Core>, snapshots: FileSnapshotStore) {
    let mut ticker = tokio::time::interval(Duration::from_secs(300));
    // The first tick of an interval fires immediately; a snapshot of a
    // freshly replayed node is useless, so skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let index = core.fsm.last_applied();
        if index == 0 {
            continue;
        }
        let data = core.fsm.snapshot();
        match snapshots.save(index, &data) {
            Ok(path) => info!(index, path = %path.display(), "snapshot written"),
            Err(e) => {
                error!(error = %e, "snapshot write failed, terminating");
                std::process::exit(1);
            }
        }
        let retention = core.fsm.server().config.output_retention_nanos();
        let now = core
            .config
            .compaction
            .canary_start
            .unwrap_or_else(expiry::now_nanos);
        if let Err(e) =
            robustircd::raft::compaction::compact(&core.store, &core.output, retention, now)
        {
            error!(error = %e, "compaction failed, terminating");
            std::process::exit(1);
        }
    }
}

/// Remove leftovers of interrupted snapshot writes.
fn remove_stale_tempfiles(raft_dir: &std::path::Path) -> anyhow::Result<()> {
    let snapshots = raft_dir.join("snapshots");
    if !snapshots.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&snapshots)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            warn!(path = %path.display(), "removing stale snapshot tempfile");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Ask an existing node to add us as a peer, following redirects to the
/// current leader, and abort when our clock disagrees with the network's.
async fn join_master(master: &str, peer_addr: &str, password: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let mut addr = master.to_string();
    for _ in 0..10 {
        info!(master = %addr, "sending join request");
        let response = client
            .post(format!("https://{}/join", addr))
            .basic_auth("robustirc", Some(password))
            .json(&serde_json::json!({ "Addr": peer_addr }))
            .send()
            .await
            .with_context(|| format!("join request to {}", addr))?;

        check_clock_skew(&response)?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .context("redirect without Location header")?;
            let url = reqwest::Url::parse(location)?;
            let host = url.host_str().context("redirect without host")?;
            addr = format!("{}:{}", host, url.port().unwrap_or(443));
            continue;
        }
        if status.is_success() {
            info!(master = %addr, "joined the network");
            return Ok(());
        }
        anyhow::bail!("join request to {} failed: {}", addr, status);
    }
    anyhow::bail!("too many redirects while joining via {}", master)
}

/// Compare the peer's Date header against the local clock.
///
/// This is the bootstrap time safeguard: record timestamps are leader-local,
/// so a node whose clock is off must not join at all.
fn check_clock_skew(response: &reqwest::Response) -> anyhow::Result<()> {
    let date = match response
        .headers()
        .get(reqwest::header::DATE)
        .and_then(|v| v.to_str().ok())
    {
        Some(date) => date,
        None => return Ok(()),
    };
    let remote = chrono::DateTime::parse_from_rfc2822(date)
        .with_context(|| format!("unparsable Date header {:?}", date))?;
    let skew = (chrono::Utc::now() - remote.with_timezone(&chrono::Utc)).abs();
    if skew.num_seconds() as u64 > MAX_CLOCK_SKEW.as_secs() {
        return Err(robustircd::Error::TimeSkew(format!(
            "local clock differs from the network by {}s, refusing to join",
            skew.num_seconds()
        ))
        .into());
    }
    Ok(())
}
