// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! End-to-end convergence of two folder groups over an in-memory link.

mod support;

use std::sync::Arc;

use bytes::Bytes;
use rivulet_sync::{
    secret::SecretKind,
    storage::{ChunkStorage, MetaStorage},
    test_utils::SessionLink,
    Secret,
};
use support::*;

#[tokio::test]
async fn empty_group_converges_to_seeded_group() {
    // Group A holds one file of one chunk (four 16 KiB blocks); group B
    // starts empty. After attach + handshake, B must end up with the meta
    // and the verified chunk, block by block.
    init_logging();
    let secret = owner_secret();
    let data = vec![0x5A; (TEST_BLOCK_SIZE * 4) as usize];

    let seeded_meta = Arc::new(MetaStorage::new());
    let seeded_chunks = Arc::new(ChunkStorage::new());
    let (smeta, ct_hash) = single_chunk_meta(&secret, 1, &data);
    seeded_meta.put(smeta.clone());
    seeded_chunks
        .put_chunk(ct_hash, Bytes::from(data.clone()))
        .unwrap();

    let group_a = make_folder_with_storage(
        secret.clone(),
        test_config(),
        seeded_meta,
        seeded_chunks,
    );
    let group_b = make_folder(secret.clone(), test_config());

    let link = SessionLink::new(1, 2);
    assert!(group_a.group.attach(link.a_remote.clone()).await.unwrap());
    assert!(group_b.group.attach(link.b_remote.clone()).await.unwrap());
    link.handshake_both();

    let b_chunks = group_b.group.chunk_storage();
    wait_until("group B holds the chunk", || {
        let b_chunks = b_chunks.clone();
        async move { b_chunks.have_chunk(ct_hash) }
    })
    .await;

    // The chunk arrived verified and byte-identical.
    let block = b_chunks.read_block(ct_hash, 0, data.len() as u32).unwrap();
    assert_eq!(&block[..], &data[..]);

    // The meta round-tripped request -> reply -> store exactly once.
    let stored = group_b
        .group
        .meta_storage()
        .get_by_revision(smeta.path_revision())
        .expect("meta stored on B");
    assert_eq!(stored, smeta);
    assert_eq!(group_b.group.meta_storage().len(), 1);
}

#[tokio::test]
async fn convergence_works_with_read_only_member() {
    // A read-only member can verify and replicate, just not author.
    let owner = owner_secret();
    let data = vec![0x11; 1024];

    let seeded_meta = Arc::new(MetaStorage::new());
    let seeded_chunks = Arc::new(ChunkStorage::new());
    let (smeta, ct_hash) = single_chunk_meta(&owner, 1, &data);
    seeded_meta.put(smeta.clone());
    seeded_chunks.put_chunk(ct_hash, Bytes::from(data)).unwrap();

    let group_a = make_folder_with_storage(owner.clone(), test_config(), seeded_meta, seeded_chunks);

    let read_only: Secret = owner.to_string().replacen('A', "B", 1).parse().unwrap();
    assert_eq!(read_only.kind(), SecretKind::ReadOnly);
    assert_eq!(read_only.folder_id(), owner.folder_id());
    let group_b = make_folder(read_only, test_config());

    let link = SessionLink::new(3, 4);
    assert!(group_a.group.attach(link.a_remote.clone()).await.unwrap());
    assert!(group_b.group.attach(link.b_remote.clone()).await.unwrap());
    link.handshake_both();

    let b_chunks = group_b.group.chunk_storage();
    wait_until("read-only member holds the chunk", || {
        let b_chunks = b_chunks.clone();
        async move { b_chunks.have_chunk(ct_hash) }
    })
    .await;
}

#[tokio::test]
async fn bidirectional_convergence() {
    // Each side seeds one file; both end with both.
    let secret = owner_secret();
    let data_a = vec![0xA0; 4096];
    let data_b = vec![0xB0; 4096];

    let meta_a = Arc::new(MetaStorage::new());
    let chunks_a = Arc::new(ChunkStorage::new());
    let (smeta_a, ct_a) = single_chunk_meta(&secret, 1, &data_a);
    meta_a.put(smeta_a);
    chunks_a.put_chunk(ct_a, Bytes::from(data_a)).unwrap();

    let meta_b = Arc::new(MetaStorage::new());
    let chunks_b = Arc::new(ChunkStorage::new());
    let (smeta_b, ct_b) = single_chunk_meta(&secret, 2, &data_b);
    meta_b.put(smeta_b);
    chunks_b.put_chunk(ct_b, Bytes::from(data_b)).unwrap();

    let group_a = make_folder_with_storage(secret.clone(), test_config(), meta_a, chunks_a);
    let group_b = make_folder_with_storage(secret.clone(), test_config(), meta_b, chunks_b);

    let link = SessionLink::new(5, 6);
    assert!(group_a.group.attach(link.a_remote.clone()).await.unwrap());
    assert!(group_b.group.attach(link.b_remote.clone()).await.unwrap());
    link.handshake_both();

    let a_chunks = group_a.group.chunk_storage();
    let b_chunks = group_b.group.chunk_storage();
    wait_until("both groups hold both chunks", || {
        let a_chunks = a_chunks.clone();
        let b_chunks = b_chunks.clone();
        async move { a_chunks.have_chunk(ct_b) && b_chunks.have_chunk(ct_a) }
    })
    .await;

    assert_eq!(group_a.group.meta_storage().len(), 2);
    assert_eq!(group_b.group.meta_storage().len(), 2);
}
