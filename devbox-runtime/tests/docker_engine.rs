//! Docker engine against a real daemon.
//!
//! Run:
//!   REAL_DOCKER=1 cargo test -p devbox-runtime --test docker_engine -- --test-threads=1
//!
//! Requires Docker and network access to pull `alpine:3`.

use std::time::Duration;

use devbox_runtime::engine::docker::{DockerEngine, DockerSettings};
use devbox_runtime::{ContainerEngine, ContainerStatus, EngineError};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

const IMAGE: &str = "alpine:3";

fn should_run() -> bool {
    std::env::var("REAL_DOCKER")
        .map(|v| v == "1")
        .unwrap_or(false)
}

macro_rules! skip_unless_real {
    () => {
        if !should_run() {
            eprintln!("Skipped (set REAL_DOCKER=1 to enable)");
            return;
        }
    };
}

async fn engine() -> DockerEngine {
    let host = std::env::var("DOCKER_HOST").ok();
    DockerEngine::connect(host.as_deref(), DockerSettings::default())
        .await
        .expect("docker daemon reachable")
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_exec_and_shell() {
    skip_unless_real!();
    let engine = engine().await;

    engine.pull_image(IMAGE).await.unwrap();
    let id = engine.create_container(IMAGE).await.unwrap();
    assert_eq!(
        engine.inspect_container(&id).await.unwrap(),
        Some(ContainerStatus::Created)
    );

    engine.start_container(&id).await.unwrap();
    assert!(matches!(
        engine.start_container(&id).await,
        Err(EngineError::NotModified(_))
    ));

    let out = engine
        .exec(&id, &["sh".into(), "-c".into(), "echo hi; exit 3".into()])
        .await
        .unwrap();
    assert!(out.output.contains("hi"));
    assert_eq!(out.exit_code, 3);

    let mut shell = engine.attach_shell(&id).await.unwrap();
    shell.input.write_all(b"echo marker-$((40+2))\n").await.unwrap();
    shell.input.flush().await.unwrap();
    let mut seen = String::new();
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(chunk) = shell.output.next().await {
            seen.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if seen.contains("marker-42") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "shell output: {seen:?}");
    drop(shell);

    engine.stop_container(&id).await.unwrap();
    assert_eq!(
        engine.inspect_container(&id).await.unwrap(),
        Some(ContainerStatus::Exited)
    );

    engine.remove_container(&id).await.unwrap();
    assert_eq!(engine.inspect_container(&id).await.unwrap(), None);
    assert!(matches!(
        engine.remove_container(&id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_image_is_classified() {
    skip_unless_real!();
    let engine = engine().await;
    let err = engine
        .pull_image("devbox-does-not-exist/nope:never")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ImageNotFound(_)), "{err:?}");
}
