//! Job registry
//!
//! Single owner of job state. Every status change goes through
//! [`JobRegistry::transition`], which enforces the state machine and removes
//! the job the moment it turns terminal; whichever caller wins that
//! transition is the only one allowed to announce it.

use super::{JobId, JobSnapshot, JobStatus, Operation, Protocol};
use crate::error::{OpsError, OpsResult};
use chrono::Utc;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Progress added per line of output, and its ceiling before exit
const PROGRESS_STEP: u8 = 10;
const PROGRESS_CEILING: u8 = 90;

/// Live process of a running job
#[derive(Debug)]
pub struct ProcessHandle {
    pub kill: CancellationToken,
    pub pid: Option<u32>,
    monitor: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ExecutionJob {
    snapshot: JobSnapshot,
    operation: Operation,
    process: Option<ProcessHandle>,
    truncated: bool,
}

#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, ExecutionJob>>,
    next_id: AtomicU64,
    max_output_bytes: usize,
}

impl JobRegistry {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_output_bytes,
        }
    }

    /// Allocate an id and register the job as awaiting a credential
    pub async fn register(&self, target: Ipv4Addr, protocol: Protocol, operation: Operation) -> JobId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = ExecutionJob {
            snapshot: JobSnapshot {
                id,
                kind: operation.kind(),
                target,
                protocol,
                status: JobStatus::AwaitingCredential,
                progress: 0,
                output: String::new(),
                created_at: Utc::now(),
            },
            operation,
            process: None,
            truncated: false,
        };
        self.jobs.lock().await.insert(id, job);
        id
    }

    pub async fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs.lock().await.get(&id).map(|job| job.snapshot.clone())
    }

    pub async fn operation(&self, id: JobId) -> Option<Operation> {
        self.jobs.lock().await.get(&id).map(|job| job.operation.clone())
    }

    /// Move a parked job to running and attach its kill switch
    pub async fn start(&self, id: JobId, kill: CancellationToken) -> OpsResult<JobSnapshot> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(OpsError::JobNotFound(id))?;
        check_transition(job, JobStatus::Running)?;
        job.snapshot.status = JobStatus::Running;
        job.process = Some(ProcessHandle {
            kill,
            pid: None,
            monitor: None,
        });
        Ok(job.snapshot.clone())
    }

    /// Store the monitor task; returns `false` if the job is already gone
    pub async fn attach_monitor(&self, id: JobId, monitor: JoinHandle<()>) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id).and_then(|job| job.process.as_mut()) {
            Some(process) => {
                process.monitor = Some(monitor);
                true
            }
            None => false,
        }
    }

    pub async fn take_monitor(&self, id: JobId) -> Option<JoinHandle<()>> {
        let mut jobs = self.jobs.lock().await;
        jobs.get_mut(&id)
            .and_then(|job| job.process.as_mut())
            .and_then(|process| process.monitor.take())
    }

    pub async fn set_pid(&self, id: JobId, pid: Option<u32>) {
        if let Some(process) = self
            .jobs
            .lock()
            .await
            .get_mut(&id)
            .and_then(|job| job.process.as_mut())
        {
            process.pid = pid;
        }
    }

    pub async fn kill_token(&self, id: JobId) -> Option<CancellationToken> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .and_then(|job| job.process.as_ref())
            .map(|process| process.kill.clone())
    }

    /// Append one output line and bump progress; returns the new progress
    pub async fn append_output(&self, id: JobId, line: &str) -> Option<u8> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id)?;

        let remaining = self.max_output_bytes.saturating_sub(job.snapshot.output.len());
        if line.len() < remaining {
            job.snapshot.output.push_str(line);
            job.snapshot.output.push('\n');
        } else if !job.truncated {
            job.truncated = true;
            log::warn!("Job {} output exceeds {} bytes, truncating", id, self.max_output_bytes);
        }

        job.snapshot.progress = job
            .snapshot
            .progress
            .saturating_add(PROGRESS_STEP)
            .min(PROGRESS_CEILING);
        Some(job.snapshot.progress)
    }

    /// Apply a status change; terminal states remove the job and return its
    /// final snapshot
    pub async fn transition(&self, id: JobId, next: JobStatus) -> OpsResult<JobSnapshot> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(OpsError::JobNotFound(id))?;
        check_transition(job, next)?;

        job.snapshot.status = next;
        if !next.is_terminal() {
            return Ok(job.snapshot.clone());
        }
        if next == JobStatus::Completed {
            job.snapshot.progress = 100;
        }
        let job = jobs.remove(&id).ok_or(OpsError::JobNotFound(id))?;
        // A finished job must not leave a process behind
        if let Some(process) = &job.process {
            process.kill.cancel();
        }
        Ok(job.snapshot)
    }

    /// Jobs not yet terminal, oldest first
    pub async fn active(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .await
            .values()
            .map(|job| job.snapshot.clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn check_transition(job: &ExecutionJob, next: JobStatus) -> OpsResult<()> {
    if job.snapshot.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(OpsError::InvalidJobState {
            job_id: job.snapshot.id,
            status: job.snapshot.status,
        })
    }
}
