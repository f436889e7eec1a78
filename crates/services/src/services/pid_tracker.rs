//! Persistent record of child pids the core owns.
//!
//! The file survives abrupt termination of the host process: on the next
//! boot [`PidTracker::reap_orphans`] terminates any recorded pid that is
//! still alive and still runs an executable we recognize, then clears the
//! file. Records are newline-delimited `{pid}\t{label}` pairs; a record
//! is written with a single append so partial lines can only occur at the
//! file tail and are skipped on read.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info, warn};

/// Grace period between the polite and the forceful kill.
const REAP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PidTrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One owned-pid record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub label: String,
}

/// The PID tracker (C2). The file is touched by no other component.
pub struct PidTracker {
    path: PathBuf,
    /// Serializes rewrites against appends.
    lock: Mutex<()>,
}

impl PidTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Tracker over the per-installation pid file.
    pub fn for_installation() -> Self {
        Self::new(utils::assets::pid_file_path())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append a record. Duplicates are tolerated and merged on read.
    pub async fn record(&self, pid: u32, label: &str) -> Result<(), PidTrackerError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = format!("{}\t{}\n", pid, label.replace(['\t', '\n'], " "));
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(pid, label, "Recorded owned pid");
        Ok(())
    }

    /// Drop a pid from the set. Compacts by atomic rewrite (temp + rename).
    pub async fn forget(&self, pid: u32) -> Result<(), PidTrackerError> {
        let _guard = self.lock.lock().await;
        let records: Vec<PidRecord> = self
            .read_unlocked()
            .await?
            .into_iter()
            .filter(|r| r.pid != pid)
            .collect();
        self.rewrite_unlocked(&records).await?;
        debug!(pid, "Forgot owned pid");
        Ok(())
    }

    /// Current record set, duplicates merged (last label wins).
    pub async fn read_records(&self) -> Result<Vec<PidRecord>, PidTrackerError> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    /// Rewrite the file to exactly the live record set. Used by teardown
    /// to leave a clean file behind.
    pub async fn flush(&self) -> Result<(), PidTrackerError> {
        let _guard = self.lock.lock().await;
        let records = self.read_unlocked().await?;
        self.rewrite_unlocked(&records).await
    }

    /// Terminate stranded children from a previous run, then clear the set.
    ///
    /// A recorded pid is only touched when it is still alive *and* its
    /// process image matches the recorded label; pid reuse by unrelated
    /// processes must never get them killed.
    pub async fn reap_orphans(&self) -> Result<usize, PidTrackerError> {
        let records = self.read_records().await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let mut reaped = 0usize;
        for record in &records {
            let Some(process) = system.process(Pid::from_u32(record.pid)) else {
                debug!(pid = record.pid, "Recorded pid no longer alive");
                continue;
            };
            if !image_matches(process, &record.label) {
                warn!(
                    pid = record.pid,
                    label = %record.label,
                    "Recorded pid now belongs to an unrelated process; skipping"
                );
                continue;
            }

            info!(pid = record.pid, label = %record.label, "Reaping orphaned child");
            terminate(record.pid, false);
            tokio::time::sleep(REAP_GRACE).await;

            let mut check = System::new();
            check.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[Pid::from_u32(record.pid)]),
                true,
                ProcessRefreshKind::everything(),
            );
            if check.process(Pid::from_u32(record.pid)).is_some() {
                warn!(pid = record.pid, "Orphan survived SIGTERM; sending SIGKILL");
                terminate(record.pid, true);
            }
            reaped += 1;
        }

        // The set is now stale by construction: clear it.
        {
            let _guard = self.lock.lock().await;
            self.rewrite_unlocked(&[]).await?;
        }
        Ok(reaped)
    }

    async fn read_unlocked(&self) -> Result<Vec<PidRecord>, PidTrackerError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut merged: HashMap<u32, String> = HashMap::new();
        let mut order: Vec<u32> = Vec::new();
        for line in raw.lines() {
            let Some((pid_str, label)) = line.split_once('\t') else {
                // Torn tail record from an abrupt kill; ignore.
                continue;
            };
            let Ok(pid) = pid_str.trim().parse::<u32>() else {
                continue;
            };
            if merged.insert(pid, label.to_string()).is_none() {
                order.push(pid);
            }
        }

        Ok(order
            .into_iter()
            .map(|pid| PidRecord {
                pid,
                label: merged[&pid].clone(),
            })
            .collect())
    }

    async fn rewrite_unlocked(&self, records: &[PidRecord]) -> Result<(), PidTrackerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("pids.tmp");
        let mut body = String::new();
        for record in records {
            body.push_str(&format!("{}\t{}\n", record.pid, record.label));
        }
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Match a live process against a recorded label (executable name).
fn image_matches(process: &sysinfo::Process, label: &str) -> bool {
    let name = process.name().to_string_lossy();
    if name == label {
        return true;
    }
    process
        .cmd()
        .iter()
        .any(|arg| arg.to_string_lossy().contains(label))
}

#[cfg(unix)]
fn terminate(pid: u32, force: bool) {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid as NixPid,
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = kill(NixPid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, error = %e, "Signal delivery failed");
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32, _force: bool) {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::everything(),
    );
    if let Some(process) = system.process(Pid::from_u32(pid)) {
        process.kill();
    }
}
