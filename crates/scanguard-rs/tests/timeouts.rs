#![cfg(unix)]

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use scanguard::{
    adapters::{ToolAdapter, ToolCommand},
    db::MemoryScanStore,
    engine::ScanEngine,
    executor::{ExecLimits, SystemExecutor},
    jobs::LocalQueue,
    lifecycle::ScanManager,
    models::{ScanRequest, ScanStatus},
    profiles::{ProfileKind, ScanProfile},
    security::{TargetPolicy, ValidatedTarget},
};

/// Ignores the target and sleeps well past the hard timeout.
struct SleepyTool;

impl ToolAdapter for SleepyTool {
    fn name(&self) -> &'static str {
        "sleepy"
    }

    fn build_command(&self, _target: &ValidatedTarget, _profile: &ScanProfile) -> ToolCommand {
        ToolCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "exec sleep 10".into()],
        }
    }

    fn version_command(&self) -> ToolCommand {
        ToolCommand {
            program: PathBuf::from("/bin/echo"),
            args: vec!["sleepy 1.0".into()],
        }
    }
}

#[tokio::test]
async fn hard_timeout_fails_the_scan() {
    let (queue, mut jobs) = LocalQueue::new(4);
    let engine = Arc::new(ScanEngine::new(
        TargetPolicy::default(),
        Arc::new(SleepyTool),
        Arc::new(SystemExecutor),
        ExecLimits {
            hard_timeout: Duration::from_secs(2),
            soft_timeout: Some(Duration::from_secs(1)),
            kill_grace: Duration::from_secs(1),
        },
    ));
    let manager = ScanManager::new(Arc::new(MemoryScanStore::new()), Arc::new(queue), engine);

    let submitted = manager
        .submit_scan("ops", ScanRequest::new("192.168.1.5", ProfileKind::Default))
        .await
        .unwrap();
    let started = Instant::now();
    manager.run_scan(jobs.next().await.unwrap()).await.unwrap();
    let took = started.elapsed();

    let record = manager.get_scan(submitted.id).await.unwrap();
    assert_eq!(record.status, ScanStatus::Failed);
    assert!(record.error_message.as_deref().unwrap().contains("timeout"));
    assert!(took >= Duration::from_secs(2) && took < Duration::from_secs(5), "{took:?}");
    assert!(record.completed_at.is_some());
}
