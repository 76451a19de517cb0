//! Integration tests for the remote execution engine
//!
//! Jobs use the custom protocol, which runs the command through the local
//! shell, so no remote host or client tool is needed.

#![cfg(unix)]

use netsecops::{
    audit::NullAuditSink,
    config::ExecutionConfig,
    execution::{
        CredentialKind, CredentialStore, ExecutionEvent, JobId, JobStatus, Operation, Protocol,
        RemoteExecutor, Secret,
    },
    OpsError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn executor_with(store: CredentialStore) -> RemoteExecutor {
    let config = ExecutionConfig {
        kill_timeout_ms: 1000,
        ..ExecutionConfig::default()
    };
    RemoteExecutor::new(Arc::new(store), config, Arc::new(NullAuditSink))
}

fn executor() -> RemoteExecutor {
    let store = CredentialStore::new();
    store.add("local", "127.0.0.1", "tester", Secret::new("s3cret"), CredentialKind::Password);
    executor_with(store)
}

fn run(command: &str) -> Operation {
    Operation::RunCommand {
        command: command.to_string(),
    }
}

/// Collect events for `job_id` up to and including its terminal event
async fn events_until_terminal(
    rx: &mut broadcast::Receiver<ExecutionEvent>,
    job_id: JobId,
) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("job should reach a terminal state")
            .expect("event channel open");
        if event.job_id() != job_id {
            continue;
        }
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

async fn wait_for_start(rx: &mut broadcast::Receiver<ExecutionEvent>, job_id: JobId) {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        if matches!(event, ExecutionEvent::JobStarted { job_id: id, .. } if id == job_id) {
            return;
        }
    }
}

#[tokio::test]
async fn test_successful_command_streams_output() {
    let executor = executor();
    let mut rx = executor.subscribe();

    let ids = executor
        .submit("127.0.0.1", run("echo first; echo second"), Protocol::Custom)
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let events = events_until_terminal(&mut rx, ids[0]).await;
    assert!(matches!(events[0], ExecutionEvent::JobStarted { protocol: Protocol::Custom, .. }));

    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::OutputChunk { chunk, .. } => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["first", "second"]);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::JobProgress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![10, 20, 100]);

    match events.last().unwrap() {
        ExecutionEvent::JobCompleted { output, .. } => assert_eq!(output, "first\nsecond\n"),
        other => panic!("expected completion, got {:?}", other),
    }
    assert!(executor.job(ids[0]).await.is_none());
}

#[tokio::test]
async fn test_secret_reaches_custom_command_through_env() {
    let executor = executor();
    let mut rx = executor.subscribe();

    let ids = executor
        .submit(
            "127.0.0.1",
            run("echo \"$NETSECOPS_USERNAME:$NETSECOPS_SECRET\""),
            Protocol::Custom,
        )
        .await
        .unwrap();

    let events = events_until_terminal(&mut rx, ids[0]).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::OutputChunk { chunk, .. } if chunk == "tester:s3cret"
    )));
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_stderr() {
    let executor = executor();
    let mut rx = executor.subscribe();

    let ids = executor
        .submit("127.0.0.1", run("echo broken >&2; exit 3"), Protocol::Custom)
        .await
        .unwrap();
    let events = events_until_terminal(&mut rx, ids[0]).await;
    match events.last().unwrap() {
        ExecutionEvent::JobFailed { error, .. } => assert_eq!(error, "broken"),
        other => panic!("expected failure, got {:?}", other),
    }

    let ids = executor
        .submit("127.0.0.1", run("exit 1"), Protocol::Custom)
        .await
        .unwrap();
    let events = events_until_terminal(&mut rx, ids[0]).await;
    assert!(matches!(
        events.last().unwrap(),
        ExecutionEvent::JobFailed { error, .. } if error == "Process failed"
    ));
}

#[tokio::test]
async fn test_stop_kills_running_job() {
    let executor = executor();
    let mut rx = executor.subscribe();

    let ids = executor
        .submit("127.0.0.1", run("sleep 30"), Protocol::Custom)
        .await
        .unwrap();
    wait_for_start(&mut rx, ids[0]).await;
    assert_eq!(executor.job(ids[0]).await.unwrap().status, JobStatus::Running);

    timeout(Duration::from_secs(5), executor.stop(ids[0]))
        .await
        .expect("stop within kill timeout")
        .unwrap();

    let events = events_until_terminal(&mut rx, ids[0]).await;
    assert!(matches!(events.last().unwrap(), ExecutionEvent::JobStopped { .. }));
    assert!(executor.job(ids[0]).await.is_none());

    // Exactly one terminal event
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!(event.job_id() == ids[0] && event.is_terminal()), "{:?}", event);
    }
    assert!(matches!(executor.stop(ids[0]).await, Err(OpsError::JobNotFound(_))));
}

#[tokio::test]
async fn test_missing_credential_parks_until_supplied() {
    let executor = executor_with(CredentialStore::new());
    let mut rx = executor.subscribe();

    let ids = executor
        .submit("127.0.0.1", run("echo \"$NETSECOPS_USERNAME\""), Protocol::Custom)
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(
        first,
        ExecutionEvent::CredentialRequired {
            job_id: ids[0],
            host: "127.0.0.1".parse().unwrap(),
            protocol: Protocol::Custom,
        }
    );
    assert_eq!(
        executor.job(ids[0]).await.unwrap().status,
        JobStatus::AwaitingCredential
    );

    executor
        .supply_credential(ids[0], "operator", Secret::new("pw"))
        .await
        .unwrap();
    let events = events_until_terminal(&mut rx, ids[0]).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::OutputChunk { chunk, .. } if chunk == "operator"
    )));
    assert!(matches!(events.last().unwrap(), ExecutionEvent::JobCompleted { .. }));

    // Only parked jobs accept a credential
    assert!(executor
        .supply_credential(ids[0], "operator", Secret::new("pw"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_parked_job_can_be_stopped() {
    let executor = executor_with(CredentialStore::new());
    let mut rx = executor.subscribe();

    let ids = executor
        .submit("10.0.0.1,10.0.0.2", run("hostname"), Protocol::Ssh)
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(executor.active_jobs().await.len(), 2);

    executor.stop(ids[0]).await.unwrap();
    let events = events_until_terminal(&mut rx, ids[0]).await;
    assert!(matches!(events.last().unwrap(), ExecutionEvent::JobStopped { .. }));

    let remaining = executor.active_jobs().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, ids[1]);
    executor.stop(ids[1]).await.unwrap();
}

#[tokio::test]
async fn test_unsupported_operation_allocates_nothing() {
    let executor = executor();

    let err = executor
        .submit(
            "127.0.0.1",
            Operation::DeployFile {
                source: "a".into(),
                destination: "b".into(),
            },
            Protocol::Ssh,
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Protocol SSH does not support deploy-file");
    assert!(executor.active_jobs().await.is_empty());

    assert!(matches!(
        executor.submit("not-an-ip", run("true"), Protocol::Custom).await,
        Err(OpsError::InvalidTarget(_))
    ));
}

#[tokio::test]
async fn test_job_ids_increase() {
    let executor = executor_with(CredentialStore::new());
    let first = executor
        .submit("10.1.0.1-3", run("true"), Protocol::WinRm)
        .await
        .unwrap();
    let second = executor
        .submit("10.1.0.4", run("true"), Protocol::WinRm)
        .await
        .unwrap();

    let all: Vec<JobId> = first.iter().chain(second.iter()).copied().collect();
    assert!(all.windows(2).all(|w| w[0] < w[1]), "{:?}", all);
    for id in all {
        executor.stop(id).await.unwrap();
    }
}
