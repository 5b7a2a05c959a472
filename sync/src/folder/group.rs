// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::HashMap,
    fs,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use log::*;
use rivulet_shutdown::ShutdownSignal;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use super::{
    config::FolderConfig,
    error::FolderError,
    handle::{FolderEvent, FolderEventTx, FolderGroupHandle, FolderRequest},
    registry::{PeerRegistry, SubscriptionBundle},
};
use crate::{
    config::FolderParams,
    meta::{CtHash, SignedMeta},
    path::{IgnoreList, PathNormalizer},
    peer::{PeerEvent, PeerKey, PeerMessage, RemoteFolder},
    secret::FolderId,
    state_collector::StateCollector,
    storage::{ChunkStorage, MetaStorage},
    traffic::TrafficCounters,
    transfer::{
        Downloader, HaveMetaOutcome, MetaDownloader, MetaUploader, PutBlockOutcome,
        RecordedBitfield, TransferError, Uploader,
    },
};

const LOG_TARGET: &str = "sync::folder";

const REQUEST_BUFFER_SIZE: usize = 64;
const FOLDER_EVENT_CHANNEL_SIZE: usize = 256;

/// One folder's synchronization core.
///
/// Construction prepares the folder directories, creates storage and the
/// transfer engines, wires their event streams and spawns the folder actor.
/// The group owns its components for the folder's whole lifetime; dropping it
/// (together with any cloned handles) stops the actor, which purges the
/// folder's state from the collector on the way out.
pub struct FolderGroup {
    folder_id: FolderId,
    handle: FolderGroupHandle,
    meta_storage: Arc<MetaStorage>,
    chunk_storage: Arc<ChunkStorage>,
    path_normalizer: PathNormalizer,
    ignore_list: IgnoreList,
    #[allow(dead_code)] // detaches on drop; the actor exits with the handles
    task: JoinHandle<()>,
}

impl FolderGroup {
    /// Bring up a folder with fresh, empty storage. Must be called within a
    /// tokio runtime.
    pub fn new(
        params: FolderParams,
        config: FolderConfig,
        state_collector: StateCollector,
        shutdown_signal: ShutdownSignal,
    ) -> Result<Self, FolderError> {
        Self::with_storage(
            params,
            config,
            Arc::new(MetaStorage::new()),
            Arc::new(ChunkStorage::new()),
            state_collector,
            shutdown_signal,
        )
    }

    /// Bring up a folder over existing storage, e.g. an index reloaded after
    /// a restart. Every meta already present is replayed through the
    /// indexed-meta path exactly once, as the actor's first task.
    pub fn with_storage(
        params: FolderParams,
        config: FolderConfig,
        meta_storage: Arc<MetaStorage>,
        chunk_storage: Arc<ChunkStorage>,
        state_collector: StateCollector,
        shutdown_signal: ShutdownSignal,
    ) -> Result<Self, FolderError> {
        for path in [&params.root, &params.system_path] {
            fs::create_dir_all(path).map_err(|source| FolderError::Startup {
                path: path.clone(),
                source,
            })?;
        }

        let folder_id = params.folder_id();
        debug!(
            target: LOG_TARGET,
            "New folder {}: kind={:?} root={}",
            folder_id,
            params.secret.kind(),
            params.root.display()
        );

        let path_normalizer = PathNormalizer::new(&params);
        let ignore_list = IgnoreList::new(&params.ignore_patterns)
            .map_err(|err| FolderError::InvalidIgnorePattern(err.to_string()))?;

        let traffic = Arc::new(TrafficCounters::new());

        // Subscriptions are wired before the actor runs, so nothing the
        // indexer commits from here on can be missed.
        let meta_added_rx = meta_storage.subscribe();
        let chunk_added_rx = chunk_storage.subscribe();

        state_collector.folder_state_set(
            folder_id,
            "secret",
            Value::String(params.secret.to_string()),
        );

        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER_SIZE);
        let (event_tx, _) = broadcast::channel(FOLDER_EVENT_CHANNEL_SIZE);
        let (peer_event_tx, peer_event_rx) = mpsc::channel(config.peer_event_buffer);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let uploader = Uploader::new(config.transfer.clone(), chunk_storage.clone(), traffic.clone());
        let downloader = Downloader::new(config.transfer.clone(), traffic.clone());
        let meta_uploader = MetaUploader::new(meta_storage.clone(), chunk_storage.clone());
        let meta_downloader = MetaDownloader::new(
            config.transfer.clone(),
            params.secret.clone(),
            meta_storage.clone(),
        );

        // Replay of the existing index is the actor's first posted task, so
        // it happens strictly after construction.
        internal_tx
            .send(DeferredTask::ReplayIndex)
            .expect("internal channel open");

        let actor = FolderGroupActor {
            folder_id,
            config,
            registry: PeerRegistry::new(),
            strikes: HashMap::new(),
            meta_storage: meta_storage.clone(),
            chunk_storage: chunk_storage.clone(),
            uploader,
            downloader,
            meta_uploader,
            meta_downloader,
            traffic,
            state_collector,
            request_rx,
            event_tx: event_tx.clone(),
            peer_event_tx,
            peer_event_rx,
            internal_tx,
            internal_rx,
            meta_added_rx,
            chunk_added_rx,
            shutdown_signal,
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            folder_id,
            handle: FolderGroupHandle::new(folder_id, request_tx, event_tx),
            meta_storage,
            chunk_storage,
            path_normalizer,
            ignore_list,
            task,
        })
    }

    pub fn folder_id(&self) -> FolderId {
        self.folder_id
    }

    /// Cloneable handle for the transport and daemon layers.
    pub fn handle(&self) -> FolderGroupHandle {
        self.handle.clone()
    }

    /// The folder's metadata index, shared with the indexer.
    pub fn meta_storage(&self) -> Arc<MetaStorage> {
        self.meta_storage.clone()
    }

    /// The folder's chunk store, shared with the indexer and assembler.
    pub fn chunk_storage(&self) -> Arc<ChunkStorage> {
        self.chunk_storage.clone()
    }

    pub fn path_normalizer(&self) -> &PathNormalizer {
        &self.path_normalizer
    }

    pub fn ignore_list(&self) -> &IgnoreList {
        &self.ignore_list
    }

    /// Offer a peer session. See [`FolderGroupHandle::attach`].
    pub async fn attach(&self, remote: RemoteFolder) -> Result<bool, FolderError> {
        self.handle.attach(remote).await
    }

    /// Remove a peer session. See [`FolderGroupHandle::detach`].
    pub async fn detach(&self, remote: &RemoteFolder) -> Result<bool, FolderError> {
        self.handle.detach(remote).await
    }

    pub async fn remotes(&self) -> Result<Vec<RemoteFolder>, FolderError> {
        self.handle.remotes().await
    }
}

/// Events funneled from per-peer forwarder tasks into the folder loop.
#[derive(Debug)]
enum SessionEvent {
    Event(PeerKey, PeerEvent),
    /// The transport dropped the session's event stream.
    Closed(PeerKey),
}

/// Work the actor posts to itself to run on a later loop turn.
#[derive(Debug)]
enum DeferredTask {
    /// Feed every already-indexed meta through the indexed-meta path.
    ReplayIndex,
    /// Send the initial meta advertisements to a freshly handshaken peer.
    InitialAdvertise(PeerKey),
}

struct FolderGroupActor {
    folder_id: FolderId,
    config: FolderConfig,
    registry: PeerRegistry,
    strikes: HashMap<PeerKey, u32>,

    meta_storage: Arc<MetaStorage>,
    chunk_storage: Arc<ChunkStorage>,
    uploader: Uploader,
    downloader: Downloader,
    meta_uploader: MetaUploader,
    meta_downloader: MetaDownloader,
    traffic: Arc<TrafficCounters>,
    state_collector: StateCollector,

    request_rx: mpsc::Receiver<FolderRequest>,
    event_tx: FolderEventTx,
    peer_event_tx: mpsc::Sender<SessionEvent>,
    peer_event_rx: mpsc::Receiver<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<DeferredTask>,
    internal_rx: mpsc::UnboundedReceiver<DeferredTask>,
    meta_added_rx: broadcast::Receiver<SignedMeta>,
    chunk_added_rx: broadcast::Receiver<CtHash>,
    shutdown_signal: ShutdownSignal,
}

impl FolderGroupActor {
    async fn run(mut self) {
        debug!(target: LOG_TARGET, "Folder group {} started", self.folder_id);

        let state_interval = self.config.state_push_interval;
        let mut state_tick = time::interval_at(
            (Instant::now() + state_interval).into(),
            state_interval,
        );
        state_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let sweep_interval = self.config.sweep_interval;
        let mut sweep_tick = time::interval_at(
            (Instant::now() + sweep_interval).into(),
            sweep_interval,
        );
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_request = self.request_rx.recv() => match maybe_request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!(
                            target: LOG_TARGET,
                            "Folder group {} lost every handle; shutting down", self.folder_id
                        );
                        break;
                    },
                },

                Some(event) = self.peer_event_rx.recv() => {
                    self.handle_session_event(event);
                },

                Some(task) = self.internal_rx.recv() => {
                    self.handle_deferred(task);
                },

                result = self.meta_added_rx.recv() => match result {
                    Ok(smeta) => self.handle_indexed_meta(&smeta),
                    Err(err) => {
                        // Losing index events silently desynchronizes the
                        // folder; stop it instead.
                        error!(
                            target: LOG_TARGET,
                            "Folder group {} index event stream failed ({}); stopping",
                            self.folder_id,
                            err
                        );
                        break;
                    },
                },

                result = self.chunk_added_rx.recv() => match result {
                    Ok(ct_hash) => self.handle_chunk_added(ct_hash),
                    Err(err) => {
                        error!(
                            target: LOG_TARGET,
                            "Folder group {} chunk event stream failed ({}); stopping",
                            self.folder_id,
                            err
                        );
                        break;
                    },
                },

                _ = state_tick.tick() => self.push_state(),

                _ = sweep_tick.tick() => {
                    let now = Instant::now();
                    self.downloader.sweep(now);
                    self.meta_downloader.sweep(now);
                },

                _ = self.shutdown_signal.wait() => {
                    debug!(
                        target: LOG_TARGET,
                        "Folder group {} received the shutdown signal", self.folder_id
                    );
                    break;
                },
            }
        }

        self.state_collector.folder_state_purge(self.folder_id);
        debug!(target: LOG_TARGET, "Folder group {} stopped", self.folder_id);
    }

    fn handle_request(&mut self, request: FolderRequest) {
        use FolderRequest::*;
        match request {
            Attach(remote, reply) => {
                let admitted = self.attach(remote);
                let _ = reply.send(admitted);
            },
            Detach(key, reply) => {
                let _ = reply.send(self.detach(key));
            },
            Remotes(reply) => {
                let _ = reply.send(self.registry.remotes());
            },
            RegistryCounts(reply) => {
                let _ = reply.send(self.registry.counts());
            },
        }
    }

    /// Admit a peer session: index it, subscribe to it, announce it.
    fn attach(&mut self, remote: RemoteFolder) -> bool {
        if !self.registry.can_attach(&remote) {
            debug!(
                target: LOG_TARGET,
                "Rejecting duplicate attach of {} ({})",
                remote.display_name(),
                remote.endpoint()
            );
            return false;
        }

        let key = remote.key();
        let mut events = remote.subscribe();
        let event_tx = self.peer_event_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event_tx.send(SessionEvent::Event(key, event)).await.is_err() {
                            break;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            target: LOG_TARGET,
                            "Dropped {} event(s) from lagging peer session {}", n, key
                        );
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = event_tx.send(SessionEvent::Closed(key)).await;
                        break;
                    },
                }
            }
        });

        let inserted = self
            .registry
            .insert(remote.clone(), SubscriptionBundle::new(forwarder));
        debug_assert!(inserted, "can_attach was checked");

        debug!(target: LOG_TARGET, "Attached remote {}", remote.display_name());
        self.publish_event(FolderEvent::Attached(remote));
        true
    }

    /// Remove a peer session and every trace of it. Total: after this, no
    /// event from the session reaches any engine and no request to it stays
    /// outstanding.
    fn detach(&mut self, key: PeerKey) -> bool {
        let Some(remote) = self.registry.get(key).cloned() else {
            return false;
        };

        // Announced before any state changes, so observers see the registry
        // as it was.
        self.publish_event(FolderEvent::Detached(remote.clone()));

        self.downloader.untrack_remote(key);
        self.uploader.untrack_remote(key);
        self.meta_downloader.untrack_remote(key);

        // Dropping the registry entry aborts the forwarder task.
        let _attached = self.registry.remove(key);
        self.strikes.remove(&key);

        debug!(target: LOG_TARGET, "Detached remote {}", remote.display_name());
        true
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Closed(key) => {
                if self.registry.is_attached(key) {
                    debug!(
                        target: LOG_TARGET,
                        "Peer session {} closed by transport; detaching", key
                    );
                    self.detach(key);
                }
            },
            SessionEvent::Event(key, event) => {
                if !self.registry.is_attached(key) {
                    // Raced with a detach; the contract says nothing is
                    // delivered outside attach..detach.
                    trace!(target: LOG_TARGET, "Dropping event from detached peer {}", key);
                    return;
                }
                match event {
                    PeerEvent::HandshakeSuccess => self.handle_handshake(key),
                    PeerEvent::Message(message) => self.handle_peer_message(key, message),
                }
            },
        }
    }

    fn handle_handshake(&mut self, key: PeerKey) {
        if !self.registry.mark_ready(key) {
            debug!(target: LOG_TARGET, "Duplicate handshake from {}", key);
            return;
        }
        let remote = self.registry.get(key).cloned().expect("peer is attached");

        self.downloader.track_remote(remote.clone());
        self.uploader.track_remote(remote.clone());
        self.meta_downloader.track_remote(remote.clone());

        debug!(
            target: LOG_TARGET,
            "Peer {} completed handshake", remote.display_name()
        );

        // The initial advertisements go out one loop turn later, after the
        // handshake notification has returned to the transport.
        let _ = self.internal_tx.send(DeferredTask::InitialAdvertise(key));
    }

    fn handle_peer_message(&mut self, key: PeerKey, message: PeerMessage) {
        if !self.registry.is_ready(key) {
            self.strike(key, &format!("{} before handshake", message.name()));
            return;
        }

        if let Err(err) = self.route_message(key, message) {
            match err {
                TransferError::ProtocolViolation { details, .. } => {
                    self.strike(key, &details);
                },
                TransferError::PeerNotTracked(_) => {
                    trace!(target: LOG_TARGET, "Message for untracked peer {}", key);
                },
                TransferError::Storage(err) => {
                    // Per-operation failure; the folder stays live.
                    error!(
                        target: LOG_TARGET,
                        "Storage error while handling message from {}: {}", key, err
                    );
                },
            }
        }
    }

    fn route_message(&mut self, key: PeerKey, message: PeerMessage) -> Result<(), TransferError> {
        use PeerMessage::*;
        match message {
            Choke => self.downloader.handle_choke(key),
            Unchoke => self.downloader.handle_unchoke(key),
            Interested => self.uploader.handle_interested(key),
            NotInterested => self.uploader.handle_not_interested(key),
            HaveMeta { revision, bitfield } => {
                match self.meta_downloader.handle_have_meta(key, revision, bitfield)? {
                    HaveMetaOutcome::Known(recorded) => self.record_bitfield(recorded),
                    _ => Ok(()),
                }
            },
            HaveChunk { ct_hash } => self.downloader.notify_remote_chunk(key, ct_hash),
            MetaRequest { revision } => {
                let remote = self.registry.get(key).expect("peer is attached");
                self.meta_uploader.handle_meta_request(remote, revision);
                Ok(())
            },
            MetaReply { smeta, bitfield } => {
                match self.meta_downloader.handle_meta_reply(key, smeta, bitfield)? {
                    Some(recorded) => self.record_bitfield(recorded),
                    None => Ok(()),
                }
            },
            BlockRequest { ct_hash, offset, size } => {
                self.uploader.handle_block_request(key, ct_hash, offset, size)
            },
            BlockReply { ct_hash, offset, data } => {
                match self.downloader.put_block(key, ct_hash, offset, data)? {
                    PutBlockOutcome::Completed { ct_hash, data } => {
                        self.commit_chunk(ct_hash, data);
                    },
                    PutBlockOutcome::HashMismatch { ct_hash } => {
                        debug!(
                            target: LOG_TARGET,
                            "Chunk {} discarded after failed verification", ct_hash
                        );
                    },
                    PutBlockOutcome::Incomplete => {},
                }
                Ok(())
            },
        }
    }

    /// Feed a peer's per-meta availability bitfield into the downloader.
    fn record_bitfield(&mut self, recorded: RecordedBitfield) -> Result<(), TransferError> {
        let chunks = recorded.smeta.meta().chunks();
        for index in recorded.bitfield.ones() {
            self.downloader
                .notify_remote_chunk(recorded.peer, chunks[index].ct_hash)?;
        }
        Ok(())
    }

    /// Hand a downloaded, verified chunk to storage. `chunkAdded` then fans
    /// out to the engines through the normal event path.
    fn commit_chunk(&mut self, ct_hash: CtHash, data: Bytes) {
        let size = data.len() as u32;
        if let Err(err) = self.chunk_storage.put_chunk(ct_hash, data) {
            error!(
                target: LOG_TARGET,
                "Failed to store downloaded chunk {}: {}", ct_hash, err
            );
            self.downloader.requeue_chunk(ct_hash, size);
        }
    }

    /// Local index gained (or replayed) a meta: update what the downloader
    /// wants and advertise to every handshaken peer.
    fn handle_indexed_meta(&mut self, smeta: &SignedMeta) {
        let bitfield = self.chunk_storage.make_bitfield(smeta.meta());
        self.downloader.notify_local_meta(smeta, &bitfield);
        self.meta_uploader.broadcast_meta(
            &self.registry.ready_remotes(),
            smeta.path_revision(),
            &bitfield,
        );
    }

    /// A chunk reached local storage: stop downloading it, start serving it.
    fn handle_chunk_added(&mut self, ct_hash: CtHash) {
        self.downloader.notify_local_chunk(ct_hash);
        self.uploader.broadcast_chunk(ct_hash);
    }

    fn handle_deferred(&mut self, task: DeferredTask) {
        match task {
            DeferredTask::ReplayIndex => {
                let metas = self.meta_storage.get_meta();
                debug!(
                    target: LOG_TARGET,
                    "Replaying {} indexed meta(s) for folder {}",
                    metas.len(),
                    self.folder_id
                );
                for smeta in metas {
                    self.handle_indexed_meta(&smeta);
                }
            },
            DeferredTask::InitialAdvertise(key) => {
                if !self.registry.is_ready(key) {
                    return;
                }
                if let Some(remote) = self.registry.get(key).cloned() {
                    self.meta_uploader.handle_handshake(&remote);
                }
            },
        }
    }

    /// Push the per-peer state blobs and traffic stats to the collector.
    fn push_state(&mut self) {
        let peers = self
            .registry
            .remotes()
            .iter()
            .map(|remote| remote.collect_state())
            .collect::<Vec<_>>();
        self.state_collector
            .folder_state_set(self.folder_id, "peers", Value::Array(peers));

        match serde_json::to_value(self.traffic.heartbeat()) {
            Ok(stats) => {
                self.state_collector
                    .folder_state_set(self.folder_id, "traffic_stats", stats);
            },
            Err(err) => {
                error!(target: LOG_TARGET, "Failed to serialize traffic stats: {}", err);
            },
        }
    }

    fn strike(&mut self, key: PeerKey, details: &str) {
        let strikes = self.strikes.entry(key).or_insert(0);
        *strikes += 1;
        warn!(
            target: LOG_TARGET,
            "Protocol violation from {}: {} ({} strike(s))", key, details, strikes
        );
        if *strikes >= self.config.strike_threshold {
            warn!(
                target: LOG_TARGET,
                "Peer {} exceeded the strike threshold; detaching", key
            );
            self.detach(key);
        }
    }

    fn publish_event(&mut self, event: FolderEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(Arc::new(event));
    }
}
