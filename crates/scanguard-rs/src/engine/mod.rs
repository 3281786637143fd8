use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    adapters::{ToolAdapter, ToolCommand},
    error::{ExecutionError, ParseError, ValidationError},
    executor::{probe_tool_version, ExecLimits, ExecOutput, ProcessExecutor},
    models::{ParsedResult, ScanRequest},
    parser::parse_nmap_xml,
    profiles::ScanProfile,
    security::{TargetPolicy, ValidatedTarget},
};

/// A request that passed every check, with its command fully built.
#[derive(Debug, Clone)]
pub struct PreparedScan {
    pub target: ValidatedTarget,
    pub profile: ScanProfile,
    pub command: ToolCommand,
}

/// The tool ran to a zero exit. Parsing may still have failed; the raw
/// output is kept either way.
#[derive(Debug)]
pub struct ScanOutcome {
    pub execution: ExecOutput,
    pub parsed: Result<ParsedResult, ParseError>,
}

impl ScanOutcome {
    pub fn raw_output(&self) -> String {
        String::from_utf8_lossy(&self.execution.stdout).into_owned()
    }
}

pub struct ScanEngine {
    policy: TargetPolicy,
    adapter: Arc<dyn ToolAdapter>,
    executor: Arc<dyn ProcessExecutor>,
    limits: ExecLimits,
}

impl ScanEngine {
    pub fn new(
        policy: TargetPolicy,
        adapter: Arc<dyn ToolAdapter>,
        executor: Arc<dyn ProcessExecutor>,
        limits: ExecLimits,
    ) -> Self {
        Self {
            policy,
            adapter,
            executor,
            limits,
        }
    }

    pub fn limits(&self) -> &ExecLimits {
        &self.limits
    }

    /// Target first, then profile and arguments. Nothing here touches a
    /// process.
    pub fn prepare(&self, request: &ScanRequest) -> Result<PreparedScan, ValidationError> {
        let target = self.policy.validate(&request.target)?;
        let profile = ScanProfile::resolve(request.profile, request.custom_arguments.as_deref())?;
        let command = self.adapter.build_command(&target, &profile);
        debug!(tool = self.adapter.name(), %target, profile = %profile.kind(), "scan prepared");
        Ok(PreparedScan {
            target,
            profile,
            command,
        })
    }

    pub async fn execute(
        &self,
        scan: &PreparedScan,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ExecutionError> {
        let execution = self
            .executor
            .execute(&scan.command, &self.limits, cancel)
            .await?;
        let parsed = parse_nmap_xml(&execution.stdout);
        if let Ok(result) = &parsed {
            info!(
                target = %scan.target,
                hosts_up = result.stats.hosts_up,
                total_ports = result.stats.total_ports,
                elapsed_ms = execution.elapsed.as_millis() as u64,
                "scan output parsed"
            );
        }
        Ok(ScanOutcome { execution, parsed })
    }

    pub async fn tool_version(&self) -> Result<String, ExecutionError> {
        probe_tool_version(self.executor.as_ref(), &self.adapter.version_command()).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use chrono::Utc;

    use super::*;
    use crate::{adapters::NmapAdapter, profiles::ProfileKind};

    struct CountingAdapter {
        built: AtomicUsize,
    }

    impl ToolAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn build_command(&self, target: &ValidatedTarget, profile: &ScanProfile) -> ToolCommand {
            self.built.fetch_add(1, Ordering::SeqCst);
            NmapAdapter::new("nmap").build_command(target, profile)
        }

        fn version_command(&self) -> ToolCommand {
            NmapAdapter::new("nmap").version_command()
        }
    }

    struct CannedExecutor {
        stdout: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProcessExecutor for CannedExecutor {
        async fn execute(
            &self,
            _command: &ToolCommand,
            _limits: &ExecLimits,
            _cancel: &CancellationToken,
        ) -> Result<ExecOutput, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutput {
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: vec![],
                started_at: Utc::now(),
                elapsed: Duration::from_millis(10),
            })
        }
    }

    fn engine(stdout: &'static str) -> (ScanEngine, Arc<CountingAdapter>, Arc<CannedExecutor>) {
        let adapter = Arc::new(CountingAdapter {
            built: AtomicUsize::new(0),
        });
        let executor = Arc::new(CannedExecutor {
            stdout,
            calls: AtomicUsize::new(0),
        });
        let engine = ScanEngine::new(
            TargetPolicy::default(),
            adapter.clone(),
            executor.clone(),
            ExecLimits::default(),
        );
        (engine, adapter, executor)
    }

    #[test]
    fn rejected_arguments_never_reach_the_adapter() {
        let (engine, adapter, _) = engine("");
        let request =
            ScanRequest::new("192.168.1.5", ProfileKind::Custom).with_custom_arguments("-T4; rm -rf /");
        let err = engine.prepare(&request).unwrap_err();
        assert!(matches!(err, ValidationError::ForbiddenPattern { .. }));
        assert_eq!(adapter.built.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn target_is_checked_before_arguments() {
        let (engine, _, _) = engine("");
        let request =
            ScanRequest::new("127.0.0.1", ProfileKind::Custom).with_custom_arguments("-sV | nc");
        assert!(matches!(
            engine.prepare(&request),
            Err(ValidationError::ForbiddenRange { .. })
        ));
    }

    #[test]
    fn prepare_builds_the_full_command() {
        let (engine, _, _) = engine("");
        let scan = engine
            .prepare(&ScanRequest::new("10.1.2.3", ProfileKind::Stealth))
            .unwrap();
        assert_eq!(
            scan.command.argv(),
            vec!["nmap", "-sS", "-T2", "-f", "-oX", "-", "10.1.2.3"]
        );
        assert_eq!(scan.command.program, PathBuf::from("nmap"));
    }

    #[tokio::test]
    async fn unparsable_output_is_kept_alongside_the_error() {
        let (engine, _, executor) = engine("Starting Nmap 7.94");
        let scan = engine
            .prepare(&ScanRequest::new("10.1.2.3", ProfileKind::Quick))
            .unwrap();
        let outcome = engine.execute(&scan, &CancellationToken::new()).await.unwrap();
        assert!(outcome.parsed.is_err());
        assert_eq!(outcome.raw_output(), "Starting Nmap 7.94");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
