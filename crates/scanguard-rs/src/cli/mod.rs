use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    error::LifecycleError,
    lifecycle::ScanManager,
    models::{ScanId, ScanRecord, ScanRequest, ScanStatus},
    profiles::ProfileKind,
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "scanguard", version, about = "Run validated nmap scans and track their lifecycle")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a scan, run it and print the final record.
    Scan {
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "default")]
        profile: ProfileKind,
        /// Extra tool arguments, only for the custom profile.
        #[arg(long = "args", allow_hyphen_values = true)]
        custom_arguments: Option<String>,
        #[arg(long, default_value_t = 5)]
        priority: i32,
        #[arg(long, default_value = "cli")]
        owner: String,
    },
    /// Print a stored scan record.
    Show { id: ScanId },
    /// Re-queue a failed scan and wait for the new attempt.
    Retry { id: ScanId },
    /// Re-queue every recent failed scan that has attempts left.
    RetryFailed,
    /// Print the scan tool's version banner.
    CheckTool,
}

pub async fn run(command: Command, manager: &ScanManager, config: &AppConfig) -> anyhow::Result<()> {
    match command {
        Command::Scan {
            target,
            profile,
            custom_arguments,
            priority,
            owner,
        } => {
            let request = ScanRequest {
                target,
                profile,
                custom_arguments,
                priority,
            };
            let record = manager.submit_scan(&owner, request).await?;
            let id = record.id;
            let record = tokio::select! {
                done = wait_for_terminal(manager, id) => done?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(scan_id = id, "interrupted, cancelling scan");
                    manager.cancel_scan(id).await?
                }
            };
            report(&record)
        }
        Command::Show { id } => print_record(&manager.get_scan(id).await?),
        Command::Retry { id } => {
            manager.retry_scan(id).await?;
            report(&wait_for_terminal(manager, id).await?)
        }
        Command::RetryFailed => {
            let ids = manager.retry_failed(config.retry_policy()).await?;
            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                records.push(wait_for_terminal(manager, id).await?);
            }
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::CheckTool => {
            let version = manager
                .check_tool()
                .await
                .context("scan tool is not usable")?;
            println!("{version}");
            Ok(())
        }
    }
}

async fn wait_for_terminal(manager: &ScanManager, id: ScanId) -> Result<ScanRecord, LifecycleError> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        let record = manager.get_scan(id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
    }
}

fn print_record(record: &ScanRecord) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

fn report(record: &ScanRecord) -> anyhow::Result<()> {
    print_record(record)?;
    info!(scan_id = record.id, status = %record.status, "scan done");
    if record.status == ScanStatus::Failed {
        bail!(
            "scan {} failed: {}",
            record.id,
            record.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scan_command() {
        let cli = Cli::try_parse_from([
            "scanguard",
            "scan",
            "--target",
            "192.168.1.0/28",
            "--profile",
            "custom",
            "--args",
            "-sV -p 22",
        ])
        .unwrap();
        match cli.command {
            Command::Scan {
                target,
                profile,
                custom_arguments,
                priority,
                owner,
            } => {
                assert_eq!(target, "192.168.1.0/28");
                assert_eq!(profile, ProfileKind::Custom);
                assert_eq!(custom_arguments.as_deref(), Some("-sV -p 22"));
                assert_eq!(priority, 5);
                assert_eq!(owner, "cli");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_profile_is_a_usage_error() {
        assert!(Cli::try_parse_from(["scanguard", "scan", "--target", "10.0.0.1", "--profile", "aggressive"]).is_err());
    }

    #[test]
    fn parses_maintenance_commands() {
        assert!(matches!(
            Cli::try_parse_from(["scanguard", "show", "42"]).unwrap().command,
            Command::Show { id: 42 }
        ));
        assert!(matches!(
            Cli::try_parse_from(["scanguard", "retry-failed"]).unwrap().command,
            Command::RetryFailed
        ));
        assert!(matches!(
            Cli::try_parse_from(["scanguard", "check-tool"]).unwrap().command,
            Command::CheckTool
        ));
    }
}
