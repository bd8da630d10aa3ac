//! Integration tests for checkpoint, pre-dump and restore.

mod common;

use common::{Harness, kill_all, wait_for_status};
use hutch::checkpoint::{CriuAction, CriuOptions, PageServer};
use hutch::exec::Process;
use hutch::runtime::procfs::ProcStat;
use hutch::runtime::{Container, RuntimeEvent};
use hutch_common::{ErrorKind, Operation};
use hutch_config::{ContainerConfig, ContainerStatus};

async fn running(harness: &Harness, id: &str) -> Container {
    let container = harness.create(id).await;
    container
        .run(Process::init(["sleep", "30"]))
        .await
        .unwrap();
    container
}

#[tokio::test]
async fn checkpoint_stops_and_restore_resumes() {
    let harness = Harness::new();
    let mut events = harness.runtime.events.subscribe();
    let container = running(&harness, "c1").await;
    let old_pid = container.state().await.unwrap().init_pid.unwrap();
    let images = harness.path("images");

    container
        .checkpoint(&CriuOptions::new(&images))
        .await
        .unwrap();
    assert_eq!(container.status().await.unwrap(), ContainerStatus::Stopped);
    assert!(images.join("cmdline").is_file());

    container.destroy().await.unwrap();

    let restored = Container::restore(
        "c1",
        ContainerConfig::default(),
        &CriuOptions::new(&images),
        harness.runtime(),
    )
    .await
    .unwrap();

    let state = restored.state().await.unwrap();
    assert_eq!(state.status, ContainerStatus::Running);
    let new_pid = state.init_pid.unwrap();
    assert_ne!(new_pid, old_pid);
    assert_eq!(restored.processes().await.unwrap(), vec![new_pid]);

    let request = harness.criu.requests().pop().unwrap();
    assert_eq!(request.action, CriuAction::Restore);
    assert_eq!(request.cgroup_root.as_deref(), Some("/hutch/c1"));
    assert_eq!(request.pidfile, Some(restored.root().join("restore.pid")));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(
        e,
        RuntimeEvent::ContainerCheckpointed { pre_dump: false, .. }
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        RuntimeEvent::ContainerRestored { pid, .. } if *pid == new_pid
    )));

    restored.signal(libc::SIGKILL, false).await.unwrap();
    wait_for_status(&restored, ContainerStatus::Stopped).await;
}

#[tokio::test]
async fn leave_running_keeps_the_container() {
    let harness = Harness::new();
    let container = running(&harness, "c1").await;

    let options = CriuOptions {
        leave_running: true,
        ..CriuOptions::new(harness.path("images"))
    };
    container.checkpoint(&options).await.unwrap();

    assert_eq!(container.status().await.unwrap(), ContainerStatus::Running);
    kill_all(&container).await;
}

#[tokio::test]
async fn pre_dump_never_changes_status() {
    let harness = Harness::new();
    let container = running(&harness, "c1").await;

    container
        .pre_dump(&CriuOptions::new(harness.path("pre1")))
        .await
        .unwrap();
    assert_eq!(container.status().await.unwrap(), ContainerStatus::Running);

    container.pause().await.unwrap();
    container
        .pre_dump(&CriuOptions::new(harness.path("pre2")))
        .await
        .unwrap();
    assert_eq!(container.status().await.unwrap(), ContainerStatus::Paused);

    let actions: Vec<_> = harness
        .criu
        .requests()
        .iter()
        .map(|request| request.action)
        .collect();
    assert_eq!(actions, [CriuAction::PreDump, CriuAction::PreDump]);

    container.resume().await.unwrap();
    kill_all(&container).await;
}

#[tokio::test]
async fn checkpoint_needs_a_live_container() {
    let harness = Harness::new();
    let container = harness.create("c1").await;

    let err = container
        .checkpoint(&CriuOptions::new(harness.path("images")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(err.operation(), Some(Operation::Checkpoint));
    assert!(harness.criu.requests().is_empty());

    kill_all(&container).await;
}

#[tokio::test]
async fn invalid_options_are_rejected_up_front() {
    let harness = Harness::new();
    let container = running(&harness, "c1").await;

    let options = CriuOptions {
        page_server: Some(PageServer {
            address: String::new(),
            port: 27,
        }),
        ..CriuOptions::new(harness.path("images"))
    };
    let err = container.checkpoint(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    let err = container
        .checkpoint(&CriuOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert!(harness.criu.requests().is_empty());

    kill_all(&container).await;
}

#[tokio::test]
async fn restore_into_a_taken_id_fails() {
    let harness = Harness::new();
    let container = harness.create("c1").await;
    let images = harness.path("images");
    std::fs::create_dir_all(&images).unwrap();

    let err = Container::restore(
        "c1",
        ContainerConfig::default(),
        &CriuOptions::new(&images),
        harness.runtime(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(container.status().await.unwrap(), ContainerStatus::Created);

    kill_all(&container).await;
}

#[tokio::test]
async fn failed_restore_leaves_nothing_behind() {
    let harness = Harness::new();

    // Missing images directory.
    let err = Container::restore(
        "c1",
        ContainerConfig::default(),
        &CriuOptions::new(harness.path("nowhere")),
        harness.runtime(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RestoreFailed);
    assert!(!harness.runtime.paths.container("c1").exists());
    assert!(harness.cgroups.was_destroyed("c1"));

    // Images present but empty: the service fails.
    let images = harness.path("empty");
    std::fs::create_dir_all(&images).unwrap();
    let err = Container::restore(
        "c1",
        ContainerConfig::default(),
        &CriuOptions::new(&images),
        harness.runtime(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RestoreFailed);
    assert_eq!(err.operation(), Some(Operation::Restore));
    assert!(!harness.runtime.paths.container("c1").exists());
}

#[tokio::test]
async fn failed_checkpoint_keeps_status() {
    let harness = Harness::new();
    let container = running(&harness, "c1").await;
    let images = harness.path("images");
    harness.criu.fail_dumps();

    let err = container
        .checkpoint(&CriuOptions::new(&images))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CheckpointFailed);
    assert_eq!(err.operation(), Some(Operation::Checkpoint));
    assert!(err.to_string().contains("Dumping FAILED"));

    assert_eq!(container.status().await.unwrap(), ContainerStatus::Running);
    assert!(images.join("pages-1.img").is_file());

    kill_all(&container).await;
}

#[tokio::test]
async fn restored_process_is_killed_when_adoption_fails() {
    let harness = Harness::new();
    let images = harness.path("images");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::write(images.join("cmdline"), b"sleep\030\0").unwrap();
    harness.cgroups.refuse_members();

    let err = Container::restore(
        "r1",
        ContainerConfig::default(),
        &CriuOptions::new(&images),
        harness.runtime(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RestoreFailed);
    assert!(err.to_string().contains("EACCES"));

    let restored = harness.criu.restored();
    assert_eq!(restored.len(), 1);
    assert!(ProcStat::read(restored[0]).is_none_or(|stat| !stat.is_alive()));
    assert!(!harness.runtime.paths.container("r1").exists());
    assert!(harness.cgroups.was_destroyed("r1"));
}
