// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

#![allow(dead_code)]

use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use rivulet_shutdown::ShutdownSignal;
use rivulet_sync::{
    config::FolderParams,
    folder::{FolderConfig, FolderGroup},
    meta::{ChunkRef, CtHash, Meta, MetaKind, PathHash, SignedMeta},
    peer::{PeerMessage, PeerSessionDriver},
    secret::{Secret, SecretKind},
    state_collector::StateCollector,
    storage::{ChunkStorage, MetaStorage},
    transfer::TransferConfig,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Opt-in log output while debugging a test run: `RUST_LOG=debug cargo test`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 16 KiB blocks keep test payloads small.
pub const TEST_BLOCK_SIZE: u32 = 16 * 1024;

pub fn test_config() -> FolderConfig {
    FolderConfig {
        transfer: TransferConfig {
            block_size: TEST_BLOCK_SIZE,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct TestFolder {
    pub group: FolderGroup,
    pub collector: StateCollector,
    pub secret: Secret,
    _root: tempfile::TempDir,
}

/// A folder group over fresh storage in a temp directory.
pub fn make_folder(secret: Secret, config: FolderConfig) -> TestFolder {
    let root = tempfile::tempdir().expect("tempdir");
    let collector = StateCollector::new();
    let params = FolderParams::new(root.path().join("folder"), secret.clone());
    let group = FolderGroup::new(params, config, collector.clone(), ShutdownSignal::never())
        .expect("folder starts");
    TestFolder {
        group,
        collector,
        secret,
        _root: root,
    }
}

/// A folder group over pre-populated storage, as after a daemon restart.
pub fn make_folder_with_storage(
    secret: Secret,
    config: FolderConfig,
    meta_storage: Arc<MetaStorage>,
    chunk_storage: Arc<ChunkStorage>,
) -> TestFolder {
    let root = tempfile::tempdir().expect("tempdir");
    let collector = StateCollector::new();
    let params = FolderParams::new(root.path().join("folder"), secret.clone());
    let group = FolderGroup::with_storage(
        params,
        config,
        meta_storage,
        chunk_storage,
        collector.clone(),
        ShutdownSignal::never(),
    )
    .expect("folder starts");
    TestFolder {
        group,
        collector,
        secret,
        _root: root,
    }
}

/// A signed one-chunk meta over `data`.
pub fn single_chunk_meta(secret: &Secret, path_fill: u8, data: &[u8]) -> (SignedMeta, CtHash) {
    let ct_hash = CtHash::compute(data);
    let meta = Meta::new(
        PathHash::from_bytes([path_fill; 32]),
        1,
        MetaKind::File,
        vec![ChunkRef {
            ct_hash,
            size: data.len() as u32,
        }],
    );
    (
        SignedMeta::sign(meta, secret).expect("owner secret signs"),
        ct_hash,
    )
}

pub fn owner_secret() -> Secret {
    Secret::generate(SecretKind::Owner)
}

/// Next outbound message of a session, within the timeout.
pub async fn recv_message(driver: &mut PeerSessionDriver) -> PeerMessage {
    tokio::time::timeout(RECV_TIMEOUT, driver.outbound_rx.recv())
        .await
        .expect("timed out waiting for a peer message")
        .expect("session closed")
}

/// Outbound messages until the session stays quiet for `idle`.
pub async fn drain_messages(driver: &mut PeerSessionDriver, idle: Duration) -> Vec<PeerMessage> {
    let mut messages = Vec::new();
    loop {
        match tokio::time::timeout(idle, driver.outbound_rx.recv()).await {
            Ok(Some(message)) => messages.push(message),
            Ok(None) | Err(_) => break,
        }
    }
    messages
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    loop {
        if cond().await {
            return;
        }
        if start.elapsed() > RECV_TIMEOUT {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
