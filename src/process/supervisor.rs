//! Instance runtime supervision.
//!
//! The supervisor owns every runtime mutation of instance state: it spawns
//! processes from resolved launch specs, confirms liveness, classifies exits,
//! stops with a bounded grace period, and adopts orphaned processes after a
//! controller restart. All live tracking sits in one registry owned here;
//! the durable state store is the source of truth across restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::broadcast;

use crate::config::{ConfigStore, InstanceConfig};
use crate::error::{AppError, Result};
use crate::instance::{InstanceStatus, InstanceSummary, Provisioner};
use crate::layering::SymlinkLayering;
use crate::lock::LockCoordinator;
use crate::paths::Layout;
use crate::state::StateStore;
use crate::validation::validate_instance_id;

use super::control::{
    check_port_available, find_available_port, ProcessHandle as _, SignalKind, UnixProcessHandle,
};
use super::launch::{build_launch_spec, redact_line};
use super::tail::{spawn_tailer, LineCallback, LineSink, LogBuffer, LogTailer};
use super::{
    RuntimeEvent, RuntimeEventReason, LOG_RING_CAPACITY, ONLINE_CONFIRM_DELAY, STOP_GRACE_PERIOD,
};

/// Exit codes that count as "we asked it to stop": clean exit, Ctrl-C,
/// SIGKILL and SIGTERM shell-style codes.
const EXPECTED_EXIT_CODES: [i32; 4] = [0, 130, 137, 143];

/// Termination signals that count as expected: SIGINT, SIGKILL, SIGTERM.
const EXPECTED_SIGNALS: [i32; 3] = [2, 9, 15];

/// Live tracking entry for one running (or adopted) process.
struct TrackedProcess {
    handle: UnixProcessHandle,
    adopted: bool,
    buffer: Arc<LogBuffer>,
    _tailer: Option<LogTailer>,
}

pub struct Supervisor {
    layout: Layout,
    config: Arc<ConfigStore>,
    state: StateStore,
    locks: LockCoordinator,
    provisioner: Provisioner,
    processes: RwLock<HashMap<String, TrackedProcess>>,
    line_callbacks: Arc<RwLock<HashMap<String, LineCallback>>>,
    events: broadcast::Sender<RuntimeEvent>,
    stop_grace: Duration,
}

impl Supervisor {
    /// Open the supervisor over a data directory. The manager config inside
    /// it names the shared installation to layer over.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        Self::open_with_stop_grace(data_dir, STOP_GRACE_PERIOD)
    }

    pub fn open_with_stop_grace(
        data_dir: impl Into<PathBuf>,
        stop_grace: Duration,
    ) -> Result<Arc<Self>> {
        let data_dir = data_dir.into();
        let config = Arc::new(ConfigStore::open(data_dir.join("config.toml"))?);
        let manager = config.load();
        let layout = Layout::new(
            data_dir,
            &manager.core_dir,
            &manager.game_dir,
            &manager.server_binary,
        );
        layout.ensure_data_dirs()?;

        let state = StateStore::open(layout.state_path())?;
        let provisioner = Provisioner::new(layout.clone(), Arc::new(SymlinkLayering));
        let (events, _) = broadcast::channel(128);

        Ok(Arc::new(Self {
            layout,
            config,
            state,
            locks: LockCoordinator::new(),
            provisioner,
            processes: RwLock::new(HashMap::new()),
            line_callbacks: Arc::new(RwLock::new(HashMap::new())),
            events,
            stop_grace,
        }))
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn subscribe_runtime_events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, instance_id: &str, reason: RuntimeEventReason) {
        let _ = self.events.send(RuntimeEvent {
            instance_id: instance_id.to_string(),
            reason,
        });
    }

    /// Whether a live process is currently tracked for this instance.
    pub fn is_running(&self, instance_id: &str) -> bool {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs
            .get(instance_id)
            .map(|p| p.handle.is_alive())
            .unwrap_or(false)
    }

    fn pid_of(&self, instance_id: &str) -> Option<u32> {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs.get(instance_id).map(|p| p.handle.pid())
    }

    /// Provision (verify + repair) the instance tree and spawn its process.
    ///
    /// Holds the instance lease from acquisition until the process exits or
    /// is stopped; a concurrent operation fails fast with LockContention.
    ///
    /// Spawns the exit-watcher and confirmation tasks, so this must run
    /// inside the runtime.
    pub fn start_instance(self: &Arc<Self>, instance_id: &str) -> Result<()> {
        validate_instance_id(instance_id)?;

        let config = self
            .config
            .load()
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| AppError::instance_not_found(instance_id))?;

        // The lease is the serialization point: it is held from here until
        // the process exits or is stopped, so a second start anywhere in
        // that window contends instead of double-spawning.
        if !self.locks.acquire(instance_id, "start") {
            let holder = self.locks.holder(instance_id).unwrap_or_default();
            return Err(AppError::lock_contention(instance_id, &holder));
        }

        if self.is_running(instance_id) {
            self.locks.release(instance_id);
            return Err(AppError::instance_running());
        }

        match self.launch(instance_id, &config) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Failed start leaves the instance offline with no lease held.
                let _ = self.state.set_status(instance_id, InstanceStatus::Offline);
                self.locks.release(instance_id);
                Err(e)
            }
        }
    }

    fn launch(self: &Arc<Self>, instance_id: &str, config: &InstanceConfig) -> Result<()> {
        self.provisioner.ensure_ready(instance_id, config)?;

        let port = if config.port > 0 {
            check_port_available(config.port)?;
            config.port
        } else {
            find_available_port()?
        };

        let spec = build_launch_spec(&self.layout, instance_id, config, port)?;
        let secrets = config.secrets();
        log::info!(
            "Launching instance {}: {}",
            instance_id,
            spec.display_redacted(&secrets)
        );

        // Output goes to an append-only file, not a pipe, so it survives a
        // supervisor restart and an adopted orphan can still be tailed.
        let console_path = self.layout.console_log_path(instance_id);
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&console_path)?;
        let stdout = std::fs::OpenOptions::new()
            .append(true)
            .open(&console_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Own process group: the supervisor exiting must not take running
        // instances down with it.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::spawn(format!("Failed to start instance: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::spawn("Failed to get process ID"))?;

        self.state.mark_started(instance_id, pid)?;
        self.track(instance_id, pid, false, secrets);
        self.emit(instance_id, RuntimeEventReason::ProcessTracked);
        log::info!("Instance {} spawned (pid {})", instance_id, pid);

        let supervisor = Arc::clone(self);
        let id_for_wait = instance_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt as _;
                    supervisor.handle_exit(&id_for_wait, pid, status.code(), status.signal());
                }
                Err(e) => {
                    log::warn!("Failed to await instance {} exit: {}", id_for_wait, e);
                    supervisor.handle_exit(&id_for_wait, pid, None, None);
                }
            }
        });

        let supervisor = Arc::clone(self);
        let id_for_confirm = instance_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ONLINE_CONFIRM_DELAY).await;
            supervisor.confirm_online(&id_for_confirm, pid);
        });

        Ok(())
    }

    /// Starting → Online once the spawned pid is confirmed alive.
    fn confirm_online(&self, instance_id: &str, pid: u32) {
        let current = self.pid_of(instance_id);
        if current == Some(pid) && UnixProcessHandle::new(pid).is_alive() {
            if let Err(e) = self.state.set_status(instance_id, InstanceStatus::Online) {
                log::warn!("Failed to persist online status for {}: {}", instance_id, e);
            }
            self.emit(instance_id, RuntimeEventReason::Online);
        }
    }

    fn track(&self, instance_id: &str, pid: u32, adopted: bool, secrets: Vec<String>) {
        let buffer = Arc::new(LogBuffer::new(LOG_RING_CAPACITY));
        if adopted {
            buffer.push(format!("[manager] adopted running process (pid {pid})"));
        }
        let handle = UnixProcessHandle::new(pid);

        let sink: LineSink = {
            let buffer = Arc::clone(&buffer);
            let callbacks = Arc::clone(&self.line_callbacks);
            let id = instance_id.to_string();
            Arc::new(move |line: String| {
                let line = redact_line(&line, &secrets);
                buffer.push(line.clone());
                let callbacks = callbacks.read().unwrap_or_else(|e| e.into_inner());
                if let Some(callback) = callbacks.get(&id) {
                    callback(&line);
                }
            })
        };

        // Adoption resumes from the end of the existing file; a fresh spawn
        // starts from a truncated one.
        let tailer = match spawn_tailer(self.layout.console_log_path(instance_id), sink, adopted) {
            Ok(tailer) => Some(tailer),
            Err(e) => {
                log::warn!("Output tailing disabled for {}: {}", instance_id, e);
                None
            }
        };

        let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
        procs.insert(
            instance_id.to_string(),
            TrackedProcess {
                handle,
                adopted,
                buffer,
                _tailer: tailer,
            },
        );
    }

    /// Classify an OS-level exit event. Ignored when the entry was already
    /// removed (a stop request handled it first), so a stop can never be
    /// overridden by a spurious Crashed classification.
    fn handle_exit(&self, instance_id: &str, pid: u32, code: Option<i32>, signal: Option<i32>) {
        let removed = {
            let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
            match procs.get(instance_id) {
                Some(tracked) if tracked.handle.pid() == pid => procs.remove(instance_id),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }

        let status = classify_exit(code, signal);
        match status {
            InstanceStatus::Crashed => log::warn!(
                "Instance {} crashed (pid {}, code {:?}, signal {:?})",
                instance_id,
                pid,
                code,
                signal
            ),
            _ => log::info!("Instance {} exited cleanly (pid {})", instance_id, pid),
        }

        if let Err(e) = self.state.set_status(instance_id, status) {
            log::error!("Failed to persist exit status for {}: {}", instance_id, e);
        }
        self.emit(
            instance_id,
            if status == InstanceStatus::Crashed {
                RuntimeEventReason::Crashed
            } else {
                RuntimeEventReason::Stopped
            },
        );
        self.locks.release(instance_id);
    }

    /// Send a graceful termination signal, schedule a forced kill after the
    /// grace period, and mark the instance offline immediately.
    ///
    /// Returns `false` when no process was tracked.
    pub fn stop_instance(&self, instance_id: &str) -> Result<bool> {
        validate_instance_id(instance_id)?;

        let removed = {
            let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
            procs.remove(instance_id)
        };
        let Some(tracked) = removed else {
            return Ok(false);
        };

        let handle = tracked.handle;
        let pid = handle.pid();
        log::info!("Stopping instance {} (pid {})", instance_id, pid);

        if handle.is_alive() {
            if let Err(e) = handle.signal(SignalKind::Graceful) {
                log::warn!("Graceful signal failed for pid {}: {}, force killing", pid, e);
                if let Err(e) = handle.signal(SignalKind::Force) {
                    log::error!("Failed to force kill pid {}: {}", pid, e);
                }
            } else {
                let grace = self.stop_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if handle.is_alive() {
                        log::warn!(
                            "PID {} did not exit within {:?}, force killing",
                            pid,
                            grace
                        );
                        if let Err(e) = handle.signal(SignalKind::Force) {
                            log::error!("Failed to force kill pid {}: {}", pid, e);
                        }
                    }
                });
            }
        }

        self.state.set_status(instance_id, InstanceStatus::Offline)?;
        self.emit(instance_id, RuntimeEventReason::Stopped);
        self.locks.release(instance_id);
        Ok(true)
    }

    /// Stop (when running) and start again, waiting for the old process to
    /// release its port before relaunching.
    pub async fn restart_instance(self: &Arc<Self>, instance_id: &str) -> Result<()> {
        if let Some(pid) = self.pid_of(instance_id) {
            self.stop_instance(instance_id)?;
            let handle = UnixProcessHandle::new(pid);
            let deadline = tokio::time::Instant::now() + self.stop_grace + Duration::from_secs(2);
            while handle.is_alive() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        self.start_instance(instance_id)
    }

    /// Durable status, reconciled against actual process liveness: an entry
    /// recorded as running whose pid is dead resolves to Offline.
    pub fn instance_status(&self, instance_id: &str) -> InstanceStatus {
        let Some(record) = self.state.get(instance_id) else {
            return InstanceStatus::Offline;
        };
        if !record.status.is_running() {
            return record.status;
        }

        if let Some(pid) = record.pid {
            if UnixProcessHandle::new(pid).is_alive() {
                return record.status;
            }
        }

        log::warn!(
            "Instance {} recorded as {:?} but process is gone, reconciling to offline",
            instance_id,
            record.status
        );
        {
            let mut procs = self.processes.write().unwrap_or_else(|e| e.into_inner());
            procs.remove(instance_id);
        }
        let _ = self.state.set_status(instance_id, InstanceStatus::Offline);
        self.locks.release(instance_id);
        self.emit(instance_id, RuntimeEventReason::Stopped);
        InstanceStatus::Offline
    }

    /// Recent console lines for an instance, oldest first.
    pub fn log_buffer(&self, instance_id: &str) -> Vec<String> {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs
            .get(instance_id)
            .map(|p| p.buffer.snapshot())
            .unwrap_or_default()
    }

    /// Register the per-instance line callback consumed by log/chat parsers.
    pub fn set_line_callback(&self, instance_id: &str, callback: LineCallback) {
        let mut callbacks = self
            .line_callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner());
        callbacks.insert(instance_id.to_string(), callback);
    }

    pub fn clear_line_callback(&self, instance_id: &str) {
        let mut callbacks = self
            .line_callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner());
        callbacks.remove(instance_id);
    }

    /// Whether an instance was picked up from a previous controller lifetime.
    pub fn is_adopted(&self, instance_id: &str) -> bool {
        let procs = self.processes.read().unwrap_or_else(|e| e.into_inner());
        procs.get(instance_id).map(|p| p.adopted).unwrap_or(false)
    }

    /// Startup reconciliation: adopt instances whose process outlived the
    /// previous controller, mark the dead ones offline, and clear any lease
    /// left over from that lifetime.
    pub fn reconcile_orphans(self: &Arc<Self>) {
        for (instance_id, record) in self.state.running_entries() {
            let Some(pid) = record.pid else {
                log::warn!(
                    "Instance {} recorded as running without a pid, marking offline",
                    instance_id
                );
                let _ = self.state.set_status(&instance_id, InstanceStatus::Offline);
                self.locks.force_release(&instance_id);
                continue;
            };

            if UnixProcessHandle::new(pid).is_alive() {
                log::info!("Adopting running instance {} (pid {})", instance_id, pid);
                self.locks.force_release(&instance_id);
                let _ = self.locks.acquire(&instance_id, "adopted");

                let secrets = self
                    .config
                    .load()
                    .instances
                    .get(&instance_id)
                    .map(|c| c.secrets())
                    .unwrap_or_default();
                self.track(&instance_id, pid, true, secrets);

                if record.status == InstanceStatus::Starting {
                    let _ = self.state.set_status(&instance_id, InstanceStatus::Online);
                }
                self.emit(&instance_id, RuntimeEventReason::Adopted);
            } else {
                log::info!(
                    "Instance {} recorded as running but pid {} is dead, marking offline",
                    instance_id,
                    pid
                );
                let _ = self.state.set_status(&instance_id, InstanceStatus::Offline);
                self.locks.force_release(&instance_id);
            }
        }
    }

    /// Status summaries for every configured instance.
    pub fn summaries(&self) -> Vec<InstanceSummary> {
        let config = self.config.load();
        config
            .instances
            .iter()
            .map(|(id, instance)| {
                let record = self.state.get(id).unwrap_or_default();
                InstanceSummary {
                    id: id.clone(),
                    name: instance.name.clone(),
                    status: record.status,
                    pid: record.pid,
                    port: instance.port,
                    map: instance.map.clone(),
                }
            })
            .collect()
    }

    pub(crate) fn lock_coordinator(&self) -> &LockCoordinator {
        &self.locks
    }

    pub(crate) fn state_store(&self) -> &StateStore {
        &self.state
    }
}

/// Exit classification: a clean exit code, or a termination we asked for,
/// resolves to Offline; anything else is a crash.
fn classify_exit(code: Option<i32>, signal: Option<i32>) -> InstanceStatus {
    match (code, signal) {
        (Some(c), _) if EXPECTED_EXIT_CODES.contains(&c) => InstanceStatus::Offline,
        (Some(_), _) => InstanceStatus::Crashed,
        (None, Some(s)) if EXPECTED_SIGNALS.contains(&s) => InstanceStatus::Offline,
        (None, Some(_)) => InstanceStatus::Crashed,
        (None, None) => InstanceStatus::Offline,
    }
}
