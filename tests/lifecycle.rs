//! End-to-end lifecycle tests over a fake shared installation.
//!
//! The server binary is a small shell script, so spawn, exit classification,
//! stop signalling, and orphan adoption run against real processes.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use srcds_manager::{
    create_instance, delete_instance, list_instances, ConfigStore, ErrorKind, InstanceStatus,
    RuntimeEventReason, StateStore, Supervisor,
};

const GAMEINFO: &str = r#""GameInfo"
{
	game	"Counter-Strike: Global Offensive"
	FileSystem
	{
		SearchPaths
		{
			Game	csgo
			Game	csgo_lv
		}
	}
}
"#;

/// Build a minimal shared installation whose server binary runs `script`.
fn fake_core(root: &Path, script: &str) -> PathBuf {
    let core = root.join("core");
    std::fs::create_dir_all(core.join("bin")).unwrap();
    std::fs::create_dir_all(core.join("csgo").join("bin")).unwrap();
    std::fs::create_dir_all(core.join("csgo").join("cfg")).unwrap();
    std::fs::create_dir_all(core.join("csgo").join("maps")).unwrap();
    std::fs::create_dir_all(core.join("csgo").join("models")).unwrap();

    std::fs::write(core.join("bin").join("engine.so"), "engine").unwrap();
    std::fs::write(core.join("csgo").join("bin").join("server.so"), "server").unwrap();
    std::fs::write(core.join("csgo").join("cfg").join("game.cfg"), "// game\n").unwrap();
    std::fs::write(
        core.join("csgo").join("cfg").join("server.cfg"),
        "hostname core\n",
    )
    .unwrap();
    std::fs::write(core.join("csgo").join("maps").join("de_dust2.bsp"), "bsp").unwrap();
    std::fs::write(core.join("csgo").join("models").join("player.mdl"), "mdl").unwrap();
    std::fs::write(core.join("csgo").join("gameinfo.txt"), GAMEINFO).unwrap();

    let binary = core.join("srcds_linux");
    std::fs::write(&binary, script).unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    core
}

const LONG_RUNNING: &str = "#!/bin/sh\necho \"args: $@\"\nwhile true; do sleep 1; done\n";
const CRASHING: &str = "#!/bin/sh\necho boom\nexit 42\n";

/// Open a supervisor over a fresh data dir pointing at `core`.
fn open_supervisor(data_dir: &Path, core: &Path) -> Arc<Supervisor> {
    let store = ConfigStore::open(data_dir.join("config.toml")).unwrap();
    let core = core.to_path_buf();
    store
        .with_config_mut(move |config| {
            config.core_dir = core;
            Ok(())
        })
        .unwrap();
    drop(store);
    Supervisor::open_with_stop_grace(data_dir, Duration::from_secs(1)).unwrap()
}

async fn wait_for_status(supervisor: &Supervisor, id: &str, wanted: InstanceStatus) {
    let mut waited = Duration::ZERO;
    loop {
        if supervisor.instance_status(id) == wanted {
            return;
        }
        assert!(
            waited < Duration::from_secs(5),
            "instance never reached {:?}, currently {:?}",
            wanted,
            supervisor.instance_status(id)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
}

#[tokio::test]
async fn start_stop_is_offline_not_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);
    let mut events = supervisor.subscribe_runtime_events();

    let id = create_instance(&supervisor, "main", 0).unwrap();
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;

    assert!(supervisor.stop_instance(&id).unwrap());
    assert_eq!(supervisor.instance_status(&id), InstanceStatus::Offline);

    // The late OS exit event must not override the requested stop.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(supervisor.instance_status(&id), InstanceStatus::Offline);

    let mut seen = Vec::new();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        seen.push(event.reason);
    }
    assert!(seen.contains(&RuntimeEventReason::ProcessTracked));
    assert!(seen.contains(&RuntimeEventReason::Online));
    assert!(seen.contains(&RuntimeEventReason::Stopped));
    assert!(!seen.contains(&RuntimeEventReason::Crashed));
}

#[tokio::test]
async fn stopping_untracked_instance_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);

    let id = create_instance(&supervisor, "main", 0).unwrap();
    assert!(!supervisor.stop_instance(&id).unwrap());
}

#[tokio::test]
async fn second_start_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);

    let id = create_instance(&supervisor, "main", 0).unwrap();
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;

    // The start lease is held for the whole runtime window.
    let err = supervisor.start_instance(&id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    assert!(err.to_string().contains("holder=start"));

    supervisor.stop_instance(&id).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_spawn_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);
    let id = create_instance(&supervisor, "main", 0).unwrap();

    let first = {
        let supervisor = Arc::clone(&supervisor);
        let id = id.clone();
        tokio::spawn(async move { supervisor.start_instance(&id) })
    };
    let second = {
        let supervisor = Arc::clone(&supervisor);
        let id = id.clone();
        tokio::spawn(async move { supervisor.start_instance(&id) })
    };

    let results = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(|r| r.err()).unwrap();
    assert_eq!(err.kind(), ErrorKind::LockContention);

    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;
    supervisor.stop_instance(&id).unwrap();
}

#[tokio::test]
async fn abnormal_exit_is_classified_as_crash() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), CRASHING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);

    let id = create_instance(&supervisor, "main", 0).unwrap();
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Crashed).await;

    // The lease is released right after the status flips to crashed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Crashed).await;
}

#[tokio::test]
async fn provisioned_tree_layers_over_core() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let data_dir = dir.path().join("data");
    let supervisor = open_supervisor(&data_dir, &core);

    let id = create_instance(&supervisor, "main", 0).unwrap();
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;
    supervisor.stop_instance(&id).unwrap();

    let instance_dir = supervisor.layout().instance_dir(&id);

    // Shared content is linked, the private slice is real.
    let models = instance_dir.join("csgo").join("models");
    assert!(models.symlink_metadata().unwrap().file_type().is_symlink());
    let cfg = instance_dir.join("csgo").join("cfg");
    assert!(cfg.symlink_metadata().unwrap().file_type().is_dir());
    assert!(instance_dir.join("csgo").join("maps").join("workshop").is_dir());

    // server.cfg is a private copy, not the shared one.
    let server_cfg = cfg.join("server.cfg");
    assert!(server_cfg.symlink_metadata().unwrap().file_type().is_file());
    let content = std::fs::read_to_string(&server_cfg).unwrap();
    assert!(content.contains("hostname"));

    // gameinfo.txt carries the mod loader search path.
    let gameinfo = std::fs::read_to_string(instance_dir.join("csgo").join("gameinfo.txt")).unwrap();
    assert!(gameinfo.contains("addons/metamod"));
}

#[tokio::test]
async fn secrets_never_reach_the_log_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);

    let id = create_instance(&supervisor, "main", 0).unwrap();
    let key = id.clone();
    supervisor
        .config_store()
        .with_config_mut(move |config| {
            let instance = config.instances.get_mut(&key).unwrap();
            instance.sv_password = Some("hunter2".to_string());
            Ok(())
        })
        .unwrap();

    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;

    // The script echoes its own argv, so the password would be in the
    // console file; the buffer must only ever see the redacted form.
    let mut waited = Duration::ZERO;
    let lines = loop {
        let lines = supervisor.log_buffer(&id);
        if !lines.is_empty() {
            break lines;
        }
        assert!(waited < Duration::from_secs(5), "no console output seen");
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    };

    assert!(lines.iter().any(|l| l.contains("****")));
    assert!(!lines.iter().any(|l| l.contains("hunter2")));

    supervisor.stop_instance(&id).unwrap();
}

#[tokio::test]
async fn restart_replaces_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);

    let id = create_instance(&supervisor, "main", 0).unwrap();
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;
    let first_pid = list_instances(&supervisor)
        .into_iter()
        .find(|s| s.id == id)
        .and_then(|s| s.pid)
        .unwrap();

    supervisor.restart_instance(&id).await.unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;
    let second_pid = list_instances(&supervisor)
        .into_iter()
        .find(|s| s.id == id)
        .and_then(|s| s.pid)
        .unwrap();

    assert_ne!(first_pid, second_pid);
    supervisor.stop_instance(&id).unwrap();
}

#[tokio::test]
async fn live_orphan_is_adopted_after_controller_restart() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let data_dir = dir.path().join("data");

    // First controller lifetime: register the instance.
    let supervisor = open_supervisor(&data_dir, &core);
    let id = create_instance(&supervisor, "main", 0).unwrap();
    drop(supervisor);

    // A process from "before the restart", recorded in durable state.
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = child.id();
    {
        let state = StateStore::open(data_dir.join("state.toml")).unwrap();
        state.mark_started(&id, pid).unwrap();
    }
    std::fs::create_dir_all(data_dir.join("console")).unwrap();
    std::fs::write(data_dir.join("console").join(format!("{id}.log")), "").unwrap();

    // Second controller lifetime.
    let supervisor = Supervisor::open_with_stop_grace(&data_dir, Duration::from_secs(1)).unwrap();
    supervisor.reconcile_orphans();

    assert!(supervisor.is_running(&id));
    assert!(supervisor.is_adopted(&id));
    assert_eq!(supervisor.instance_status(&id), InstanceStatus::Online);
    // Tracking resumes against the original process, no duplicate spawn.
    let tracked_pid = list_instances(&supervisor)
        .into_iter()
        .find(|s| s.id == id)
        .and_then(|s| s.pid);
    assert_eq!(tracked_pid, Some(pid));
    assert!(supervisor
        .log_buffer(&id)
        .iter()
        .any(|l| l.contains("adopted")));

    // The adopted process can be stopped like any other.
    assert!(supervisor.stop_instance(&id).unwrap());
    let _ = child.wait();
    assert_eq!(supervisor.instance_status(&id), InstanceStatus::Offline);
}

#[tokio::test]
async fn dead_orphan_is_reconciled_to_offline() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let data_dir = dir.path().join("data");

    let supervisor = open_supervisor(&data_dir, &core);
    let id = create_instance(&supervisor, "main", 0).unwrap();
    drop(supervisor);

    {
        let state = StateStore::open(data_dir.join("state.toml")).unwrap();
        // Far above any real pid on Linux.
        state.mark_started(&id, 3_999_999).unwrap();
    }

    let supervisor = Supervisor::open(&data_dir).unwrap();
    supervisor.reconcile_orphans();

    assert!(!supervisor.is_running(&id));
    assert_eq!(supervisor.instance_status(&id), InstanceStatus::Offline);
    // The stale lease was cleared, so the instance can start again.
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;
    supervisor.stop_instance(&id).unwrap();
}

#[tokio::test]
async fn delete_refuses_running_then_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let core = fake_core(dir.path(), LONG_RUNNING);
    let supervisor = open_supervisor(&dir.path().join("data"), &core);

    let id = create_instance(&supervisor, "main", 0).unwrap();
    supervisor.start_instance(&id).unwrap();
    wait_for_status(&supervisor, &id, InstanceStatus::Online).await;

    let err = delete_instance(&supervisor, &id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceRunning);

    supervisor.stop_instance(&id).unwrap();
    delete_instance(&supervisor, &id).unwrap();

    assert!(!supervisor.layout().instance_dir(&id).exists());
    assert!(supervisor
        .config_store()
        .load()
        .instances
        .get(&id)
        .is_none());
    assert!(list_instances(&supervisor).is_empty());
}
