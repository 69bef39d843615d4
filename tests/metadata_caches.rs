//! Behavioural tests for the image and network metadata caches.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tempfile::TempDir;

use triton_pssh::cache::file::{self, CacheLayout};
use triton_pssh::test_support::{FakeCloud, image_with_user, instance, network};
use triton_pssh::{CacheError, ImageCache, NetworkCache, default_user};

const TTL: Duration = Duration::from_secs(3600);

fn temp_layout(tmp: &TempDir) -> CacheLayout {
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    CacheLayout::new(root, "test-profile")
}

#[tokio::test]
async fn image_lookups_coalesce_and_persist() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let layout = temp_layout(&tmp);
    let cloud = Arc::new(FakeCloud::new().with_image(image_with_user("img-1", "ubuntu")));
    let images = ImageCache::new(Arc::clone(&cloud) as Arc<dyn triton_pssh::CloudClient>, layout.clone(), TTL, false);

    let image = images
        .get("img-1")
        .await
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(default_user(Some(&image), "root"), "ubuntu");

    // Second get is served from the store.
    let _ = images
        .get("img-1")
        .await
        .unwrap_or_else(|err| panic!("second get: {err}"));
    assert_eq!(cloud.image_calls(), 1);

    // The record was persisted for the next session.
    assert!(layout.image("img-1").exists());
}

#[tokio::test]
async fn image_loader_prefers_the_file_cache() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let layout = temp_layout(&tmp);
    file::write_json(&layout.image("img-1"), &image_with_user("img-1", "admin"))
        .unwrap_or_else(|err| panic!("seed: {err}"));

    let cloud = Arc::new(FakeCloud::new());
    let images = ImageCache::new(Arc::clone(&cloud) as Arc<dyn triton_pssh::CloudClient>, layout, TTL, false);

    let image = images
        .get("img-1")
        .await
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(image.tags.get("default_user"), Some(&String::from("admin")));
    assert_eq!(cloud.image_calls(), 0, "disk hit must not touch the provider");
}

#[tokio::test]
async fn missing_images_are_negatively_cached() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let cloud = Arc::new(FakeCloud::new());
    let images = ImageCache::new(Arc::clone(&cloud) as Arc<dyn triton_pssh::CloudClient>, temp_layout(&tmp), TTL, true);

    let first = images.get("absent").await;
    assert!(matches!(first, Err(CacheError::NotFound { .. })));
    let second = images.get("absent").await;
    assert_eq!(first, second);
    // One initial attempt plus one retry, then the failure is stored.
    assert_eq!(cloud.image_calls(), 2);
}

#[tokio::test]
async fn public_membership_follows_network_records() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let cloud = Arc::new(
        FakeCloud::new()
            .with_network(network("net-pub", true))
            .with_network(network("net-priv", false)),
    );
    let networks = NetworkCache::new(Arc::clone(&cloud) as Arc<dyn triton_pssh::CloudClient>, temp_layout(&tmp), TTL, true);

    assert!(networks.is_public("net-pub").await);
    assert!(!networks.is_public("net-priv").await);
    // Lookup failures count as not public.
    assert!(!networks.is_public("net-gone").await);

    let mixed = instance("i-1", "web-1", "img-1", &["net-priv", "net-pub"]);
    let private_only = instance("i-2", "db-1", "img-1", &["net-priv"]);
    assert!(networks.has_public(&mixed).await);
    assert!(!networks.has_public(&private_only).await);
}
