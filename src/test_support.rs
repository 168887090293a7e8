//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::config::Config;
use crate::outputstream::OutputStream;
use crate::raft::{LocalNode, RedbLogStore, RobustFsm};
use crate::Core;

/// A single-node Core over a throwaway data directory.
pub fn single_node_core(password: &str) -> Arc<Core> {
    let dir = tempfile::tempdir().expect("tempdir");
    let raft_dir = dir.path().to_path_buf();
    let config: Config = toml::from_str(&format!(
        r#"
        [network]
        name = "robustirc.net"
        password = "{}"

        [listen]
        address = "127.0.0.1:0"

        [raft]
        dir = "{}"
        single_node = true
        "#,
        password,
        raft_dir.display()
    ))
    .expect("test config");

    let output = Arc::new(OutputStream::open(&raft_dir).expect("open output"));
    let fsm = Arc::new(RobustFsm::new("robustirc.net", Arc::clone(&output)));
    let store = Arc::new(RedbLogStore::open(&raft_dir).expect("open store"));
    let node = Arc::new(
        LocalNode::new(
            Arc::clone(&fsm),
            Arc::clone(&store),
            &raft_dir,
            "127.0.0.1:0".to_string(),
        )
        .expect("local node"),
    );

    // The directory must outlive the Core; tests never reuse it.
    std::mem::forget(dir);

    Arc::new(Core {
        config,
        password: password.to_string(),
        fsm,
        output,
        store,
        consensus: node,
    })
}
