//! Job dispatch and process supervision

use super::credentials::{Credential, CredentialProvider, Secret};
use super::protocol::{HostPlatform, InvocationRequest, ProcessSpec, Protocol};
use super::registry::JobRegistry;
use super::{ExecutionEvent, JobId, JobSnapshot, JobStatus, Operation};
use crate::audit::{AuditCategory, AuditEntry, AuditSink};
use crate::config::ExecutionConfig;
use crate::error::{OpsError, OpsResult};
use crate::events::EventBus;
use crate::utils::TargetParser;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Extra time a stopping job's monitor gets beyond the kill timeout
const STOP_GRACE: Duration = Duration::from_millis(500);

enum Outcome {
    Completed,
    Failed(String),
    Stopped,
}

impl Outcome {
    fn status(&self) -> JobStatus {
        match self {
            Outcome::Completed => JobStatus::Completed,
            Outcome::Failed(_) => JobStatus::Failed,
            Outcome::Stopped => JobStatus::Stopped,
        }
    }
}

/// Clamp the requested job budget to the platform process limit
fn process_budget(requested: usize) -> usize {
    let requested = requested.max(1);

    #[cfg(unix)]
    {
        use rlimit::Resource;

        match Resource::NPROC.get() {
            Ok((soft, _)) if soft != rlimit::INFINITY => {
                // Half the soft limit; the user runs other processes too
                let cap = usize::try_from(soft / 2).unwrap_or(usize::MAX).max(1);
                if cap < requested {
                    log::warn!(
                        "Process limit {} caps concurrent jobs at {} (requested {})",
                        soft,
                        cap,
                        requested
                    );
                }
                return requested.min(cap);
            }
            Ok(_) => {}
            Err(e) => log::debug!("Could not read process limit: {}", e),
        }
    }

    requested
}

struct ExecutorInner {
    credentials: Arc<dyn CredentialProvider>,
    audit: Arc<dyn AuditSink>,
    registry: JobRegistry,
    events: EventBus<ExecutionEvent>,
    budget: Arc<Semaphore>,
    budget_size: usize,
    parser: TargetParser,
    config: ExecutionConfig,
    platform: HostPlatform,
}

/// Runs remote operations as supervised child processes
#[derive(Clone)]
pub struct RemoteExecutor {
    inner: Arc<ExecutorInner>,
}

impl RemoteExecutor {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        config: ExecutionConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let budget_size = process_budget(config.max_concurrent_jobs);
        log::debug!("Execution pool sized for {} concurrent jobs", budget_size);

        Self {
            inner: Arc::new(ExecutorInner {
                credentials,
                audit,
                registry: JobRegistry::new(config.max_output_bytes),
                events: EventBus::new(config.event_capacity),
                budget: Arc::new(Semaphore::new(budget_size)),
                budget_size,
                parser: TargetParser::default(),
                config,
                platform: HostPlatform::current(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// Jobs allowed to hold a live child process at once
    pub fn concurrency_limit(&self) -> usize {
        self.inner.budget_size
    }

    /// Create one job per expanded target. Jobs with a resolvable credential
    /// start immediately; the rest park until [`supply_credential`] or
    /// [`stop`].
    ///
    /// [`supply_credential`]: RemoteExecutor::supply_credential
    /// [`stop`]: RemoteExecutor::stop
    pub async fn submit(
        &self,
        target_spec: &str,
        operation: Operation,
        protocol: Protocol,
    ) -> OpsResult<Vec<JobId>> {
        let kind = operation.kind();
        if !protocol.supports(kind) {
            return Err(OpsError::UnsupportedOperation { protocol, kind });
        }

        let targets = self.inner.parser.expand_async(target_spec).await;
        if targets.is_empty() {
            return Err(OpsError::InvalidTarget(format!(
                "No valid targets in '{}'",
                target_spec
            )));
        }

        log::info!(
            "Submitting {} to {} hosts via {}",
            operation.describe(),
            targets.len(),
            protocol
        );

        let mut ids = Vec::with_capacity(targets.len());
        for target in targets {
            let id = self
                .inner
                .registry
                .register(target, protocol, operation.clone())
                .await;
            ids.push(id);

            match self.inner.credentials.resolve(target, protocol) {
                Some(credential) => {
                    log::debug!("Job {}: using credential '{}'", id, credential.name);
                    if let Err(e) = self.inner.dispatch(id, credential).await {
                        log::warn!("Job {} could not start: {}", id, e);
                    }
                }
                None => {
                    log::info!("Job {} waiting for a {} credential for {}", id, protocol, target);
                    self.inner.audit.record(AuditEntry::new(
                        AuditCategory::Credential,
                        format!("credential required for job {}", id),
                        target.to_string(),
                        "awaiting",
                    ));
                    self.inner.events.publish(ExecutionEvent::CredentialRequired {
                        job_id: id,
                        host: target,
                        protocol,
                    });
                }
            }
        }

        Ok(ids)
    }

    /// Resume a parked job with an ad-hoc credential
    pub async fn supply_credential(&self, job_id: JobId, username: &str, secret: Secret) -> OpsResult<()> {
        let snapshot = self
            .inner
            .registry
            .snapshot(job_id)
            .await
            .ok_or(OpsError::JobNotFound(job_id))?;
        if snapshot.status != JobStatus::AwaitingCredential {
            return Err(OpsError::InvalidJobState {
                job_id,
                status: snapshot.status,
            });
        }

        self.inner.audit.record(AuditEntry::new(
            AuditCategory::Credential,
            format!("credential supplied for job {}", job_id),
            snapshot.target.to_string(),
            "supplied",
        ));
        self.inner
            .dispatch(job_id, Credential::ad_hoc(username, secret))
            .await
    }

    /// Kill a running job or cancel a parked one
    pub async fn stop(&self, job_id: JobId) -> OpsResult<()> {
        let registry = &self.inner.registry;
        if registry.snapshot(job_id).await.is_none() {
            return Err(OpsError::JobNotFound(job_id));
        }

        if let Some(kill) = registry.kill_token(job_id).await {
            kill.cancel();
            if let Some(monitor) = registry.take_monitor(job_id).await {
                let grace = self.inner.config.kill_timeout() + STOP_GRACE;
                if timeout(grace, monitor).await.is_err() {
                    log::warn!("Job {} did not stop within {:?}", job_id, grace);
                }
            }
        }

        // Parked jobs, and monitors that never reported back
        self.inner.finish(job_id, Outcome::Stopped).await;
        Ok(())
    }

    /// Snapshot of a job that has not finished yet
    pub async fn job(&self, job_id: JobId) -> Option<JobSnapshot> {
        self.inner.registry.snapshot(job_id).await
    }

    pub async fn active_jobs(&self) -> Vec<JobSnapshot> {
        self.inner.registry.active().await
    }
}

impl ExecutorInner {
    async fn dispatch(self: &Arc<Self>, id: JobId, credential: Credential) -> OpsResult<()> {
        let operation = self
            .registry
            .operation(id)
            .await
            .ok_or(OpsError::JobNotFound(id))?;
        let kill = CancellationToken::new();
        let job = self.registry.start(id, kill.clone()).await?;

        self.events.publish(ExecutionEvent::JobStarted {
            job_id: id,
            kind: job.kind,
            target: job.target,
            protocol: job.protocol,
        });
        self.audit.record(AuditEntry::new(
            AuditCategory::Execution,
            format!("job {}: {} via {}", id, operation.describe(), job.protocol),
            job.target.to_string(),
            "running",
        ));

        let inner = Arc::clone(self);
        let monitor = tokio::spawn(async move {
            inner.run_job(job, operation, credential, kill).await;
        });
        self.registry.attach_monitor(id, monitor).await;
        Ok(())
    }

    async fn run_job(
        self: Arc<Self>,
        job: JobSnapshot,
        operation: Operation,
        credential: Credential,
        kill: CancellationToken,
    ) {
        let id = job.id;

        let _permit = tokio::select! {
            biased;

            _ = kill.cancelled() => {
                self.finish(id, Outcome::Stopped).await;
                return;
            }
            permit = Arc::clone(&self.budget).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish(id, Outcome::Failed("Execution pool closed".to_string())).await;
                    return;
                }
            },
        };

        let request = InvocationRequest {
            job_id: id,
            target: job.target,
            operation: &operation,
            credential: &credential,
            platform: self.platform,
            ssh_connect_timeout_secs: self.config.ssh_connect_timeout_secs,
        };
        let outcome = match job.protocol.build_invocation(&request) {
            Ok(spec) => {
                log::debug!("Job {}: {}", id, spec.display());
                self.supervise(id, spec, &kill).await
            }
            Err(e) => Outcome::Failed(e.to_string()),
        };

        self.finish(id, outcome).await;
    }

    /// Run the child to exit or kill; the process spec (and any key file) lives until
    /// the child is gone
    async fn supervise(&self, id: JobId, spec: ProcessSpec, kill: &CancellationToken) -> Outcome {
        let mut child = match self.spawn(&spec).await {
            Ok(child) => child,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        self.registry.set_pid(id, child.id()).await;

        let limit = self.config.max_output_bytes;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, limit)));

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    biased;

                    _ = kill.cancelled() => {
                        self.kill_child(id, &mut child).await;
                        return Outcome::Stopped;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => self.record_line(id, line).await,
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("Job {}: error reading output: {}", id, e);
                            break;
                        }
                    },
                }
            }
        }

        let status = tokio::select! {
            biased;

            _ = kill.cancelled() => {
                self.kill_child(id, &mut child).await;
                return Outcome::Stopped;
            }
            status = child.wait() => status,
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match status {
            Ok(status) if status.success() => Outcome::Completed,
            Ok(status) => {
                log::debug!("Job {} exited with {}", id, status);
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    Outcome::Failed("Process failed".to_string())
                } else {
                    Outcome::Failed(stderr.to_string())
                }
            }
            Err(e) => Outcome::Failed(format!("Failed to wait for process: {}", e)),
        }
    }

    async fn spawn(&self, spec: &ProcessSpec) -> OpsResult<Child> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let program = spec.program.clone();
        let start_timeout = self.config.start_timeout();
        let spawn = tokio::task::spawn_blocking(move || command.spawn());

        match timeout(start_timeout, spawn).await {
            Ok(Ok(Ok(child))) => Ok(child),
            Ok(Ok(Err(e))) => Err(OpsError::SpawnError(format!("{}: {}", program, e))),
            Ok(Err(e)) => Err(OpsError::SpawnError(format!("{}: {}", program, e))),
            Err(_) => Err(OpsError::SpawnError(format!(
                "{} did not start within {:?}",
                program, start_timeout
            ))),
        }
    }

    async fn kill_child(&self, id: JobId, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            log::debug!("Job {}: kill failed: {}", id, e);
        }
        match timeout(self.config.kill_timeout(), child.wait()).await {
            Ok(_) => log::debug!("Job {} process terminated", id),
            Err(_) => log::warn!(
                "Job {} process still running {:?} after kill",
                id,
                self.config.kill_timeout()
            ),
        }
    }

    async fn record_line(&self, id: JobId, line: String) {
        if let Some(progress) = self.registry.append_output(id, &line).await {
            self.events.publish(ExecutionEvent::OutputChunk {
                job_id: id,
                chunk: line,
            });
            self.events.publish(ExecutionEvent::JobProgress {
                job_id: id,
                progress,
            });
        }
    }

    /// Apply the terminal transition and announce it; `false` when another
    /// path already finalized the job
    async fn finish(&self, id: JobId, outcome: Outcome) -> bool {
        let status = outcome.status();
        let job = match self.registry.transition(id, status).await {
            Ok(job) => job,
            Err(e) => {
                log::debug!("Job {} not finalized as {}: {}", id, status, e);
                return false;
            }
        };

        match outcome {
            Outcome::Completed => {
                log::info!("Job {} on {} completed", id, job.target);
                self.events.publish(ExecutionEvent::JobProgress {
                    job_id: id,
                    progress: 100,
                });
                self.events.publish(ExecutionEvent::JobCompleted {
                    job_id: id,
                    output: job.output,
                });
            }
            Outcome::Failed(error) => {
                log::warn!("Job {} on {} failed: {}", id, job.target, error);
                self.events.publish(ExecutionEvent::JobFailed { job_id: id, error });
            }
            Outcome::Stopped => {
                log::info!("Job {} on {} stopped", id, job.target);
                self.events.publish(ExecutionEvent::JobStopped { job_id: id });
            }
        }

        self.audit.record(AuditEntry::new(
            AuditCategory::Execution,
            format!("job {} {}", id, status),
            job.target.to_string(),
            status.to_string(),
        ));
        true
    }
}

/// Drain stderr to EOF, keeping at most `limit` bytes
async fn collect_stderr(mut stderr: ChildStderr, limit: usize) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let keep = n.min(limit.saturating_sub(buffer.len()));
                buffer.extend_from_slice(&chunk[..keep]);
            }
            Err(e) => {
                log::debug!("Error reading stderr: {}", e);
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
