//! Worker supervision.
//!
//! The supervisor fans a fixed number of workers out over the shared
//! listening port and logs each one as it exits. Workers are never
//! restarted: once the last one is gone, the supervisor returns.
//!
//! In process mode every worker is a re-execution of this binary with a
//! hidden `--worker-id` flag; in thread mode workers are threads of the
//! supervisor process.

use crate::config::{Config, WorkerMode};
use crate::runtime;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use tracing::{error, info, warn};

/// Start `config.workers` workers and wait for all of them to exit.
pub fn run(config: &Config) -> io::Result<()> {
    info!(
        pid = std::process::id(),
        workers = config.workers,
        mode = ?config.mode,
        "Primary running"
    );

    match config.mode {
        WorkerMode::Process => run_processes(config),
        WorkerMode::Thread => run_threads(config),
    }
}

/// Entry point of a spawned worker process.
pub fn run_worker_process(worker_id: usize, config: &Config) -> io::Result<()> {
    exit_with_parent();
    runtime::run_worker(worker_id, config)
}

fn run_processes(config: &Config) -> io::Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    // pid -> worker id
    let mut workers: HashMap<u32, usize> = HashMap::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        let spawned = Command::new(&exe)
            .args(&args)
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .stdin(Stdio::null())
            .spawn();

        match spawned {
            Ok(child) => {
                workers.insert(child.id(), worker_id);
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Failed to spawn worker");
                terminate(workers.keys().copied());
                return Err(e);
            }
        }
    }

    while !workers.is_empty() {
        let (pid, status) = wait_any()?;
        if let Some(worker_id) = workers.remove(&pid) {
            log_exit(worker_id, pid, status);
        }
    }

    info!("All workers exited");
    Ok(())
}

fn run_threads(config: &Config) -> io::Result<()> {
    let (tx, rx) = mpsc::channel();

    for worker_id in 0..config.workers {
        let config = config.clone();
        let notice = ExitNotice {
            worker_id,
            tx: tx.clone(),
        };

        thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let _notice = notice;
                if let Err(e) = runtime::run_worker(worker_id, &config) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;
    }
    drop(tx);

    for (worker_id, panicked) in rx {
        if panicked {
            warn!(worker = worker_id, "Worker panicked");
        } else {
            info!(worker = worker_id, "Worker exited");
        }
    }

    info!("All workers exited");
    Ok(())
}

/// Reports a worker thread's exit, including by panic.
struct ExitNotice {
    worker_id: usize,
    tx: mpsc::Sender<(usize, bool)>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send((self.worker_id, thread::panicking()));
    }
}

/// Block until any child exits.
fn wait_any() -> io::Result<(u32, ExitStatus)> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid > 0 {
            return Ok((pid as u32, ExitStatus::from_raw(status)));
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn log_exit(worker_id: usize, pid: u32, status: ExitStatus) {
    match (status.code(), status.signal()) {
        (Some(0), _) => info!(worker = worker_id, pid, code = 0, "Worker exited"),
        (Some(code), _) => warn!(worker = worker_id, pid, code, "Worker exited"),
        (None, Some(signal)) => warn!(worker = worker_id, pid, signal, "Worker exited"),
        (None, None) => warn!(worker = worker_id, pid, "Worker exited"),
    }
}

fn terminate(pids: impl Iterator<Item = u32>) {
    for pid in pids {
        // SAFETY: kill has no memory-safety preconditions.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

/// Have the kernel terminate this worker if the supervisor dies.
#[cfg(target_os = "linux")]
fn exit_with_parent() {
    // SAFETY: PR_SET_PDEATHSIG takes a plain signal number.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong);
    }
}

#[cfg(not(target_os = "linux"))]
fn exit_with_parent() {}
