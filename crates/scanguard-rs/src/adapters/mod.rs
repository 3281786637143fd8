use std::{fmt, path::PathBuf};

use crate::{profiles::ScanProfile, security::ValidatedTarget};

/// Structured XML output, written to stdout.
pub const OUTPUT_FLAG: &str = "-oX";
pub const OUTPUT_TO_STDOUT: &str = "-";

/// Discrete argument vector handed straight to process creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    /// `[program, ...args]`
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.argv())
    }
}

pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn build_command(&self, target: &ValidatedTarget, profile: &ScanProfile) -> ToolCommand;
    fn version_command(&self) -> ToolCommand;
}

pub struct NmapAdapter {
    tool_path: PathBuf,
}

impl NmapAdapter {
    pub fn new(tool_path: impl Into<PathBuf>) -> Self {
        Self {
            tool_path: tool_path.into(),
        }
    }
}

impl ToolAdapter for NmapAdapter {
    fn name(&self) -> &'static str {
        "nmap"
    }

    fn build_command(&self, target: &ValidatedTarget, profile: &ScanProfile) -> ToolCommand {
        let mut args = profile.arguments();
        args.push(OUTPUT_FLAG.to_string());
        args.push(OUTPUT_TO_STDOUT.to_string());
        args.push(target.to_string());
        ToolCommand {
            program: self.tool_path.clone(),
            args,
        }
    }

    fn version_command(&self) -> ToolCommand {
        ToolCommand {
            program: self.tool_path.clone(),
            args: vec!["--version".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        profiles::{ProfileKind, ScanProfile},
        security::TargetPolicy,
    };

    fn target(raw: &str) -> ValidatedTarget {
        TargetPolicy::default().validate(raw).unwrap()
    }

    #[test]
    fn command_has_profile_args_then_output_mode_then_target() {
        let adapter = NmapAdapter::new("/usr/bin/nmap");
        let profile = ScanProfile::resolve(ProfileKind::Quick, None).unwrap();
        let cmd = adapter.build_command(&target("192.168.1.5"), &profile);
        assert_eq!(
            cmd.argv(),
            vec!["/usr/bin/nmap", "-T4", "-F", "-oX", "-", "192.168.1.5"]
        );
    }

    #[test]
    fn custom_tokens_stay_discrete_and_target_is_last() {
        let adapter = NmapAdapter::new("nmap");
        let profile = ScanProfile::resolve(ProfileKind::Custom, Some("-sV -p 22,80")).unwrap();
        let cmd = adapter.build_command(&target("10.1.2.0/28"), &profile);
        assert_eq!(cmd.args, vec!["-sV", "-p", "22,80", "-oX", "-", "10.1.2.0/28"]);
        let n = cmd.args.len();
        assert_eq!(&cmd.args[n - 3..n - 1], [OUTPUT_FLAG, OUTPUT_TO_STDOUT]);
    }

    #[test]
    fn version_probe() {
        let cmd = NmapAdapter::new("/opt/nmap").version_command();
        assert_eq!(cmd.argv(), vec!["/opt/nmap", "--version"]);
    }
}
