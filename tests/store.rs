//! Resource-model scenarios against the in-memory store

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use objstore_fs::auth::{CatalogCache, StaticTokenProvider};
use objstore_fs::store::{Acl, ListingEntry, Object, ObjectStorage, StoreContext};
use objstore_fs::transport::MemoryTransport;
use objstore_fs::StoreError;

fn account() -> (Arc<MemoryTransport>, ObjectStorage) {
    let transport = Arc::new(MemoryTransport::new());
    let storage = ObjectStorage::new(StoreContext::new(
        transport.endpoint().to_string(),
        "tk",
        transport.clone(),
    ));
    (transport, storage)
}

#[tokio::test]
async fn save_fetch_and_delete_twice() -> Result<()> {
    let (_, storage) = account();
    storage.create_container("c", None, &BTreeMap::new()).await?;
    let container = storage.container("c").await?;

    container
        .save(&Object::with_content("foo.txt", "hello", "text/plain"))
        .await?;

    let mut remote = container.object("foo.txt").await?;
    assert_eq!(&remote.content().await?[..], b"hello");
    assert_eq!(remote.content_type(), "text/plain");

    assert!(container.delete("foo.txt").await?);
    assert!(!container.delete("foo.txt").await?);
    assert!(container.object("foo.txt").await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn prefix_listing_partitions_files_and_subdirs() -> Result<()> {
    let (_, storage) = account();
    storage.create_container("c", None, &BTreeMap::new()).await?;
    let container = storage.container("c").await?;

    for name in ["a/b.txt", "a/c/d.txt"] {
        container
            .save(&Object::with_content(name, "x", "text/plain"))
            .await?;
    }

    let entries = container
        .objects_with_prefix("a/", Some('/'), None, None)
        .await?;
    assert_eq!(entries.len(), 2);

    match &entries[0] {
        ListingEntry::Object(object) => assert_eq!(object.name(), "a/b.txt"),
        other => panic!("expected an object, got {:?}", other),
    }
    match &entries[1] {
        ListingEntry::Subdir(subdir) => assert_eq!(subdir.path(), "a/c/"),
        other => panic!("expected a subdir, got {:?}", other),
    }

    let by_path = container.objects_by_path("a", Some('/'), None, None).await?;
    let names: Vec<&str> = by_path.iter().map(|e| e.name()).collect();
    assert_eq!(names, entries.iter().map(|e| e.name()).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn dirty_tracking_is_idempotent() -> Result<()> {
    let (_, storage) = account();
    storage.create_container("c", None, &BTreeMap::new()).await?;
    let container = storage.container("c").await?;
    container
        .save(&Object::with_content("doc", "v1", "text/plain"))
        .await?;

    let mut remote = container.object("doc").await?;
    assert!(!remote.is_dirty());
    assert!(!remote.is_dirty());

    remote.set_content("v2");
    assert!(remote.is_dirty());
    assert!(remote.is_dirty());

    remote.set_content("v1");
    assert!(!remote.is_dirty());
    Ok(())
}

#[tokio::test]
async fn corrupted_body_fails_verification_unless_disabled() -> Result<()> {
    let (transport, storage) = account();
    storage.create_container("c", None, &BTreeMap::new()).await?;
    let container = storage.container("c").await?;
    container
        .save(&Object::with_content("doc", "original", "text/plain"))
        .await?;
    assert!(transport.corrupt("c", "doc", "tampered"));

    match container.object("doc").await {
        Err(StoreError::ContentVerification { name, .. }) => assert_eq!(name, "c/doc"),
        other => panic!("expected a verification failure, got {:?}", other.map(|_| ())),
    }

    let relaxed = storage.with_content_verification(false);
    let mut remote = relaxed.container("c").await?.object("doc").await?;
    assert_eq!(&remote.content().await?[..], b"tampered");
    Ok(())
}

#[tokio::test]
async fn acl_survives_a_container_round_trip() -> Result<()> {
    let (_, storage) = account();
    let mut acl = Acl::make_public();
    acl.add_account(objstore_fs::store::Permission::ReadWrite, "team", Some("bob"));
    storage.create_container("shared", Some(&acl), &BTreeMap::new()).await?;

    let container = storage.container("shared").await?;
    let loaded = container.acl().await?;
    assert!(loaded.is_public());
    assert_eq!(loaded.headers(), acl.headers());

    storage
        .change_container_acl("shared", &Acl::make_non_public())
        .await?;
    let container = storage.container("shared").await?;
    assert!(container.acl().await?.is_non_public());
    Ok(())
}

#[tokio::test]
async fn authenticate_through_the_catalog_cache() -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());
    let provider =
        Arc::new(StaticTokenProvider::new("tk", transport.endpoint()).with_region("region-a"));
    let cache = Arc::new(CatalogCache::new());

    let storage = ObjectStorage::authenticate(
        provider.clone(),
        cache.clone(),
        Some("region-a"),
        transport.clone(),
    )
    .await?;
    assert!(storage.create_container("c", None, &BTreeMap::new()).await?);

    let info = storage.account_info().await?;
    assert_eq!(info.containers, 1);
    assert_eq!(info.objects, 0);

    assert!(
        ObjectStorage::authenticate(provider, cache, Some("region-b"), transport)
            .await
            .is_err()
    );
    Ok(())
}
