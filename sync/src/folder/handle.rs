// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use super::{error::FolderError, registry::RegistryCounts};
use crate::{
    peer::{PeerKey, RemoteFolder},
    secret::FolderId,
};

pub type FolderEventTx = broadcast::Sender<Arc<FolderEvent>>;
pub type FolderEventRx = broadcast::Receiver<Arc<FolderEvent>>;

/// Lifecycle events of the peer set, published by the folder group.
#[derive(Debug, Clone)]
pub enum FolderEvent {
    Attached(RemoteFolder),
    Detached(RemoteFolder),
}

#[derive(Debug)]
pub(crate) enum FolderRequest {
    Attach(RemoteFolder, oneshot::Sender<bool>),
    Detach(PeerKey, oneshot::Sender<bool>),
    Remotes(oneshot::Sender<Vec<RemoteFolder>>),
    RegistryCounts(oneshot::Sender<RegistryCounts>),
}

/// Cloneable API of a running folder group.
#[derive(Debug, Clone)]
pub struct FolderGroupHandle {
    folder_id: FolderId,
    request_tx: mpsc::Sender<FolderRequest>,
    event_tx: FolderEventTx,
}

impl FolderGroupHandle {
    pub(crate) fn new(
        folder_id: FolderId,
        request_tx: mpsc::Sender<FolderRequest>,
        event_tx: FolderEventTx,
    ) -> Self {
        Self {
            folder_id,
            request_tx,
            event_tx,
        }
    }

    pub fn folder_id(&self) -> FolderId {
        self.folder_id
    }

    pub fn subscribe_events(&self) -> FolderEventRx {
        self.event_tx.subscribe()
    }

    /// Offer a peer session to the folder. `true` if it was admitted.
    pub async fn attach(&self, remote: RemoteFolder) -> Result<bool, FolderError> {
        self.request(|reply| FolderRequest::Attach(remote, reply)).await
    }

    /// Detach a peer session. `true` if it was attached.
    pub async fn detach(&self, remote: &RemoteFolder) -> Result<bool, FolderError> {
        self.detach_key(remote.key()).await
    }

    pub async fn detach_key(&self, key: PeerKey) -> Result<bool, FolderError> {
        self.request(|reply| FolderRequest::Detach(key, reply)).await
    }

    /// Snapshot of the currently attached peers.
    pub async fn remotes(&self) -> Result<Vec<RemoteFolder>, FolderError> {
        self.request(FolderRequest::Remotes).await
    }

    /// Sizes of the registry indices.
    pub async fn registry_counts(&self) -> Result<RegistryCounts, FolderError> {
        self.request(FolderRequest::RegistryCounts).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> FolderRequest,
    ) -> Result<T, FolderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| FolderError::ActorDisconnected)?;
        reply_rx.await.map_err(|_| FolderError::ActorResponseCancelled)
    }
}
