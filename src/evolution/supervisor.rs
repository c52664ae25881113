//! Worker process supervision.
//!
//! Each worker runs in its own process group so that killing it also kills
//! everything it spawned. Workers are restarted whenever they exit or leave
//! a crash marker before the phase's stop condition holds, and all of them
//! are terminated the moment it does.

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use super::store::{PopulationStore, StoreError};

/// How long a process group gets to exit after SIGTERM before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How a worker process is launched. Relaunches reuse it unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub worker_id: usize,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl WorkerSpec {
    pub fn new<P: Into<PathBuf>>(worker_id: usize, program: P) -> Self {
        Self {
            worker_id,
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Observed state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Exited(ExitStatus),
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker {worker_id} ({program}): {source}")]
    Spawn {
        worker_id: usize,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to poll worker {worker_id}: {source}")]
    Poll {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("No worker with id {0} is tracked")]
    UnknownWorker(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Worker {
    spec: WorkerSpec,
    child: Child,
    launches: usize,
}

/// Spawns, watches, and restarts the worker processes of one node.
pub struct ProcessSupervisor {
    node_id: usize,
    store: PopulationStore,
    poll_interval: Duration,
    workers: Vec<Worker>,
}

impl ProcessSupervisor {
    /// Create a supervisor; crash markers are looked up in `store`.
    pub fn new(node_id: usize, store: PopulationStore, poll_interval: Duration) -> Self {
        Self {
            node_id,
            store,
            poll_interval,
            workers: Vec::new(),
        }
    }

    /// Number of tracked workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Start a worker in a new process group.
    pub fn spawn(&mut self, spec: WorkerSpec) -> Result<u32, SupervisorError> {
        if self.position(spec.worker_id).is_ok() {
            log::warn!(
                "Worker {} already tracked, relaunching instead",
                spec.worker_id
            );
            self.relaunch(spec.worker_id)?;
            return self.pid(spec.worker_id);
        }

        let child = launch(&spec)?;
        let pid = child.id();
        log::info!(
            "Node {} launched worker {} (pid {})",
            self.node_id,
            spec.worker_id,
            pid
        );
        self.workers.push(Worker {
            spec,
            child,
            launches: 1,
        });
        Ok(pid)
    }

    /// Current process id of a worker.
    pub fn pid(&self, worker_id: usize) -> Result<u32, SupervisorError> {
        Ok(self.workers[self.position(worker_id)?].child.id())
    }

    /// How many times a worker has been started.
    pub fn launches(&self, worker_id: usize) -> Result<usize, SupervisorError> {
        Ok(self.workers[self.position(worker_id)?].launches)
    }

    /// Non-blocking status check.
    pub fn poll(&mut self, worker_id: usize) -> Result<WorkerStatus, SupervisorError> {
        let index = self.position(worker_id)?;
        let status = self.workers[index]
            .child
            .try_wait()
            .map_err(|source| SupervisorError::Poll { worker_id, source })?;
        Ok(match status {
            Some(status) => WorkerStatus::Exited(status),
            None => WorkerStatus::Running,
        })
    }

    /// A worker has crashed if it left a crash marker or exited at all.
    ///
    /// Only meaningful before the stop condition holds: workers are never
    /// expected to finish on their own while the phase is still running.
    pub fn detect_crash(&mut self, worker_id: usize) -> Result<bool, SupervisorError> {
        let pid = self.pid(worker_id)?;
        if self.store.has_crash_marker(self.node_id, pid) {
            return Ok(true);
        }
        Ok(matches!(self.poll(worker_id)?, WorkerStatus::Exited(_)))
    }

    /// Kill a worker's process group and start it again with the same spec.
    pub fn relaunch(&mut self, worker_id: usize) -> Result<(), SupervisorError> {
        let index = self.position(worker_id)?;
        let old_pid = self.workers[index].child.id();

        terminate(&mut self.workers[index].child);
        self.store.clear_crash_marker(self.node_id, old_pid)?;

        log::warn!(
            "Node {} relaunching worker {} (previous pid {})",
            self.node_id,
            worker_id,
            old_pid
        );
        let child = launch(&self.workers[index].spec)?;
        let worker = &mut self.workers[index];
        worker.child = child;
        worker.launches += 1;
        Ok(())
    }

    /// Terminate every tracked worker, running or not.
    ///
    /// Every group is asked to stop first and they share one grace period
    /// before the stragglers are killed.
    pub fn shutdown_all(&mut self) {
        let mut workers: Vec<Worker> = self.workers.drain(..).collect();
        if workers.is_empty() {
            return;
        }

        for worker in &workers {
            log::debug!(
                "Stopping worker {} (pid {})",
                worker.spec.worker_id,
                worker.child.id()
            );
            request_stop(&worker.child);
        }

        let deadline = Instant::now() + TERM_GRACE;
        for worker in &mut workers {
            wait_until(&mut worker.child, deadline);
        }
        for worker in &mut workers {
            force_stop(&mut worker.child);
        }
    }

    /// Restart crashed workers until `stop` reports true, then shut down.
    ///
    /// `stop` is checked after every poll interval and again before any
    /// relaunch, so a worker that exits because it met the condition is not
    /// restarted. Workers are terminated as soon as it returns true, and
    /// also when it or a relaunch fails.
    pub fn supervise<F, E>(&mut self, mut stop: F) -> Result<(), E>
    where
        F: FnMut() -> Result<bool, E>,
        E: From<SupervisorError>,
    {
        let result = self.watch(&mut stop);
        self.shutdown_all();
        result
    }

    fn watch<F, E>(&mut self, stop: &mut F) -> Result<(), E>
    where
        F: FnMut() -> Result<bool, E>,
        E: From<SupervisorError>,
    {
        if stop()? {
            return Ok(());
        }
        loop {
            thread::sleep(self.poll_interval);
            // Workers exit on their own once the target is met.
            if stop()? {
                return Ok(());
            }

            let mut crashed = Vec::new();
            let ids: Vec<usize> = self.workers.iter().map(|w| w.spec.worker_id).collect();
            for worker_id in ids {
                if self.detect_crash(worker_id)? {
                    crashed.push(worker_id);
                }
            }
            if crashed.is_empty() {
                continue;
            }
            // An exit racing the last check may have been the one that met it.
            if stop()? {
                return Ok(());
            }
            for worker_id in crashed {
                self.relaunch(worker_id)?;
            }
        }
    }

    fn position(&self, worker_id: usize) -> Result<usize, SupervisorError> {
        self.workers
            .iter()
            .position(|w| w.spec.worker_id == worker_id)
            .ok_or(SupervisorError::UnknownWorker(worker_id))
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

fn launch(spec: &WorkerSpec) -> Result<Child, SupervisorError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command.spawn().map_err(|source| SupervisorError::Spawn {
        worker_id: spec.worker_id,
        program: spec.program.clone(),
        source,
    })
}

/// Kill a child's whole process group and reap the child.
fn terminate(child: &mut Child) {
    request_stop(child);
    wait_until(child, Instant::now() + TERM_GRACE);
    force_stop(child);
}

/// Send SIGTERM to the child's process group.
fn request_stop(child: &Child) {
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    let _ = child;
}

/// Poll until the child exits or `deadline` passes.
fn wait_until(child: &mut Child, deadline: Instant) {
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => thread::sleep(Duration::from_millis(20)),
        }
    }
}

/// SIGKILL whatever is left of the group, then reap the child.
fn force_stop(child: &mut Child) {
    // Descendants may outlive the leader; make sure the group is gone.
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
    #[cfg(not(unix))]
    let _ = child.kill();

    if let Err(e) = child.wait() {
        log::warn!("Failed to reap pid {}: {}", child.id(), e);
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
        Err(e) => log::warn!("Failed to send {} to group {}: {}", signal, group, e),
    }
}
