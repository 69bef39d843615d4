//! Behavioural tests for the SSH fan-out executor.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tempfile::TempDir;
use tokio::sync::oneshot;

use triton_pssh::cache::file::CacheLayout;
use triton_pssh::ssh::{ClientConfig, SshJob};
use triton_pssh::test_support::{FakeCloud, image_with_user, instance, network};
use triton_pssh::{ImageCache, NetworkCache, SshConfig, SshError, SshSession};

const TTL: Duration = Duration::from_secs(3600);

fn base_config() -> SshConfig {
    SshConfig {
        user: String::new(),
        server_port: 22,
        bastion_address: String::new(),
        bastion_user: String::from("root"),
        bastion_port: 22,
        force_bastion_on_public_host: false,
        timeout_secs: 1.0,
        deadline_secs: 5.0,
        inline_output: false,
        inline_stdout_only: false,
        out_directory: String::new(),
        err_directory: String::new(),
        parallelism: 2,
        default_user: String::from("root"),
        dry_run: false,
    }
}

fn temp_layout(tmp: &TempDir) -> CacheLayout {
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    CacheLayout::new(root, "test-profile")
}

fn fleet_caches(cloud: &Arc<FakeCloud>, tmp: &TempDir) -> (ImageCache, NetworkCache) {
    let layout = temp_layout(tmp);
    let cloud = Arc::clone(cloud) as Arc<dyn triton_pssh::CloudClient>;
    (
        ImageCache::new(Arc::clone(&cloud), layout.clone(), TTL, true),
        NetworkCache::new(Arc::clone(&cloud), layout, TTL, true),
    )
}

fn public_fleet() -> Arc<FakeCloud> {
    Arc::new(
        FakeCloud::new()
            .with_image(image_with_user("img-1", "ubuntu"))
            .with_network(network("net-pub", true))
            .with_network(network("net-priv", false)),
    )
}

#[tokio::test]
async fn pool_spawns_and_joins_the_requested_workers() {
    let session = SshSession::new(base_config(), 3);
    assert_eq!(session.worker_count(), 3);
    session.close().await;
    assert_eq!(session.worker_count(), 0);

    let session = SshSession::new(base_config(), 10);
    assert_eq!(session.worker_count(), 10);
    session.close().await;
    assert_eq!(session.worker_count(), 0);
}

#[tokio::test]
async fn closed_sessions_refuse_new_jobs() {
    let session = SshSession::new(base_config(), 1);
    session.close().await;

    let (result_tx, _result_rx) = oneshot::channel();
    let job = SshJob {
        server: String::from("192.0.2.10:22"),
        server_config: ClientConfig {
            user: String::from("root"),
            auth: Vec::new(),
        },
        bastion: None,
        bastion_config: None,
        instance_id: String::from("i-1"),
        instance_name: String::from("web-1"),
        command: vec![String::from("true")],
        pty: None,
        input: None,
        dry_run: true,
        result: result_tx,
    };
    assert!(matches!(session.run(job).await, Err(SshError::Closed)));
}

#[tokio::test]
async fn dry_run_jobs_deliver_exactly_one_success() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let cloud = public_fleet();
    let (images, networks) = fleet_caches(&cloud, &tmp);

    let config = SshConfig {
        dry_run: true,
        ..base_config()
    };
    let session = SshSession::new(config, 2);
    let target = instance("i-1", "web-1", "img-1", &["net-pub"]);

    let (job, result) = session
        .build_job(&target, &images, &networks, Vec::new(), vec![String::from("uptime")], None)
        .await
        .unwrap_or_else(|err| panic!("build job: {err}"));
    session
        .run(job)
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    let result = result.await.unwrap_or_else(|err| panic!("result: {err}"));
    assert_eq!(result.instance_id, "i-1");
    assert_eq!(result.instance_name, "web-1");
    assert_eq!(result.user, "ubuntu", "user must come from the image tag");
    assert!(result.status.is_ok());

    session.close().await;
}

#[tokio::test]
async fn private_instances_require_a_bastion() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let cloud = public_fleet();
    let (images, networks) = fleet_caches(&cloud, &tmp);

    let session = SshSession::new(base_config(), 1);
    let target = instance("i-2", "db-1", "img-1", &["net-priv"]);

    let result = session
        .build_job(&target, &images, &networks, Vec::new(), vec![String::from("uptime")], None)
        .await;
    let Err(SshError::MissingBastion { name }) = result else {
        panic!("expected MissingBastion, got {result:?}");
    };
    assert_eq!(name, "db-1");

    session.close().await;
}

#[tokio::test]
async fn public_instances_dial_directly_unless_forced() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let cloud = public_fleet();
    let (images, networks) = fleet_caches(&cloud, &tmp);
    let target = instance("i-1", "web-1", "img-1", &["net-priv", "net-pub"]);

    let session = SshSession::new(base_config(), 1);
    let (job, _result) = session
        .build_job(&target, &images, &networks, Vec::new(), vec![String::from("uptime")], None)
        .await
        .unwrap_or_else(|err| panic!("build job: {err}"));
    assert!(job.bastion.is_none());
    assert_eq!(job.server, "192.0.2.10:22");
    session.close().await;

    let forced = SshConfig {
        force_bastion_on_public_host: true,
        bastion_address: String::from("203.0.113.9"),
        bastion_port: 2222,
        ..base_config()
    };
    let session = SshSession::new(forced, 1);
    let (job, _result) = session
        .build_job(&target, &images, &networks, Vec::new(), vec![String::from("uptime")], None)
        .await
        .unwrap_or_else(|err| panic!("build forced job: {err}"));
    assert_eq!(job.bastion.as_deref(), Some("203.0.113.9:2222"));
    assert!(job.bastion_config.is_some());
    session.close().await;
}

#[tokio::test]
async fn configured_user_overrides_the_image_tag() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let cloud = public_fleet();
    let (images, networks) = fleet_caches(&cloud, &tmp);
    let target = instance("i-1", "web-1", "img-1", &["net-pub"]);

    let config = SshConfig {
        user: String::from("operator"),
        ..base_config()
    };
    let session = SshSession::new(config, 1);
    let (job, _result) = session
        .build_job(&target, &images, &networks, Vec::new(), vec![String::from("uptime")], None)
        .await
        .unwrap_or_else(|err| panic!("build job: {err}"));
    assert_eq!(job.server_config.user, "operator");
    session.close().await;
}

#[tokio::test]
async fn connection_failures_land_in_the_result_status() {
    // Bind a port, then drop the listener so the dial is refused.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let port = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("addr: {err}"))
        .port();
    drop(listener);

    let session = SshSession::new(base_config(), 1);
    let (result_tx, result_rx) = oneshot::channel();
    let job = SshJob {
        server: format!("127.0.0.1:{port}"),
        server_config: ClientConfig {
            user: String::from("root"),
            auth: Vec::new(),
        },
        bastion: None,
        bastion_config: None,
        instance_id: String::from("i-1"),
        instance_name: String::from("web-1"),
        command: vec![String::from("true")],
        pty: None,
        input: None,
        dry_run: false,
        result: result_tx,
    };
    session
        .run(job)
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    let result = result_rx
        .await
        .unwrap_or_else(|err| panic!("result: {err}"));
    assert_eq!(result.instance_id, "i-1");
    match result.status {
        Err(SshError::Connect { .. } | SshError::Deadline { .. }) => {}
        other => panic!("expected a connect failure, got {other:?}"),
    }

    session.close().await;
}
