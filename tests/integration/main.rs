//! Uses the single integration test approach.
//!
//! This improves parallelism when running the tests, and reduces the number of binaries that have to be built (and linked)

mod common;

use std::time::Duration;

use common::{FakeBoss, KillOnDrop, spawn_agent, terminate, wait_for_exit, write_config};

#[tokio::test]
async fn malformed_config_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[tmcc\nport = ");
    let mut guard = KillOnDrop(spawn_agent(&config));
    let status = wait_for_exit(&mut guard.0, Duration::from_secs(10)).await;
    assert!(!status.success(), "malformed config must be fatal, got {status:?}");
}

#[tokio::test]
async fn missing_config_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let mut guard = KillOnDrop(spawn_agent(&dir.path().join("absent.toml")));
    let status = wait_for_exit(&mut guard.0, Duration::from_secs(10)).await;
    assert!(!status.success(), "missing config must be fatal, got {status:?}");
}

#[tokio::test]
async fn reports_boot_ready_and_shutdown() {
    let boss = FakeBoss::start(&[("status", "FREE\n")]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            r#"
        [autouser]
        enable = false

        [automount]
        enable = false

        [autohost]
        enable = false

        [tmcc]
        boss = "127.0.0.1"
        port = {port}
        poll-interval = 3600
        report-shutdown = true

        [systemd]
        unit-dir = "units"
        "#,
            port = boss.addr.port()
        ),
    );
    let mut guard = KillOnDrop(spawn_agent(&config));

    assert!(
        boss.wait_for("state ISUP", Duration::from_secs(15)).await,
        "no ready notification: {:?}",
        boss.requests()
    );
    let requests = boss.requests();
    assert_eq!(requests.first().map(String::as_str), Some("state MFSSETUP"), "{requests:?}");
    let ready = requests.iter().position(|r| r == "state ISUP").unwrap();
    for fetch in ["accounts", "localization", "mounts", "status"] {
        assert!(requests[..ready].iter().any(|r| r == fetch), "{fetch} before ready: {requests:?}");
    }

    terminate(&guard.0);
    let status = wait_for_exit(&mut guard.0, Duration::from_secs(10)).await;
    assert!(status.success(), "clean shutdown expected, got {status:?}");
    assert!(
        boss.requests().iter().any(|r| r == "state SHUTDOWN"),
        "{:?}",
        boss.requests()
    );
}
