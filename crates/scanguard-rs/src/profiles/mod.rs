use std::{fmt, str::FromStr};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Profile names accepted in a scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Default,
    Quick,
    Full,
    Stealth,
    Os,
    Vuln,
    Custom,
}

impl ProfileKind {
    pub const ALL: [ProfileKind; 7] = [
        ProfileKind::Default,
        ProfileKind::Quick,
        ProfileKind::Full,
        ProfileKind::Stealth,
        ProfileKind::Os,
        ProfileKind::Vuln,
        ProfileKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Default => "default",
            ProfileKind::Quick => "quick",
            ProfileKind::Full => "full",
            ProfileKind::Stealth => "stealth",
            ProfileKind::Os => "os",
            ProfileKind::Vuln => "vuln",
            ProfileKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProfileKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| ValidationError::UnknownProfile(s.to_string()))
    }
}

/// Custom argument tokens that passed the denylist. Only built by
/// [`sanitize_custom_args`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedArgs(Vec<String>);

impl SanitizedArgs {
    pub fn tokens(&self) -> &[String] {
        &self.0
    }
}

/// A resolved profile: a fixed argument table entry, or sanitized custom tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanProfile {
    Default,
    Quick,
    Full,
    Stealth,
    OsDetection,
    Vulnerability,
    Custom(SanitizedArgs),
}

impl ScanProfile {
    /// `custom_args` is only consulted for [`ProfileKind::Custom`].
    pub fn resolve(kind: ProfileKind, custom_args: Option<&str>) -> Result<Self, ValidationError> {
        let profile = match kind {
            ProfileKind::Default => ScanProfile::Default,
            ProfileKind::Quick => ScanProfile::Quick,
            ProfileKind::Full => ScanProfile::Full,
            ProfileKind::Stealth => ScanProfile::Stealth,
            ProfileKind::Os => ScanProfile::OsDetection,
            ProfileKind::Vuln => ScanProfile::Vulnerability,
            ProfileKind::Custom => {
                let raw = custom_args
                    .filter(|a| !a.trim().is_empty())
                    .ok_or(ValidationError::MissingArguments)?;
                ScanProfile::Custom(sanitize_custom_args(raw)?)
            }
        };
        Ok(profile)
    }

    pub fn kind(&self) -> ProfileKind {
        match self {
            ScanProfile::Default => ProfileKind::Default,
            ScanProfile::Quick => ProfileKind::Quick,
            ScanProfile::Full => ProfileKind::Full,
            ScanProfile::Stealth => ProfileKind::Stealth,
            ScanProfile::OsDetection => ProfileKind::Os,
            ScanProfile::Vulnerability => ProfileKind::Vuln,
            ScanProfile::Custom(_) => ProfileKind::Custom,
        }
    }

    pub fn arguments(&self) -> Vec<String> {
        let fixed: &[&str] = match self {
            ScanProfile::Quick => &["-T4", "-F"],
            ScanProfile::Default => &["-T4", "-Pn"],
            ScanProfile::Full => &["-sS", "-sV", "-T4", "-p-"],
            ScanProfile::Stealth => &["-sS", "-T2", "-f"],
            ScanProfile::OsDetection => &["-O", "--osscan-guess"],
            ScanProfile::Vulnerability => &["-sV", "--script=vuln", "-T4"],
            ScanProfile::Custom(args) => return args.tokens().to_vec(),
        };
        fixed.iter().map(|a| a.to_string()).collect()
    }
}

struct DenyRule {
    name: &'static str,
    pattern: &'static str,
    regex: Regex,
}

impl DenyRule {
    fn new(name: &'static str, pattern: &'static str) -> Self {
        Self {
            name,
            pattern,
            regex: Regex::new(pattern).unwrap_or_else(|e| panic!("bad deny pattern {pattern}: {e}")),
        }
    }
}

lazy_static::lazy_static! {
    static ref DENY_RULES: Vec<DenyRule> = vec![
        DenyRule::new("shell-metacharacter", r"[;&|<>$`]"),
        DenyRule::new("control-character", r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]"),
        DenyRule::new("script-path-traversal", r"--script.*\.\./"),
        DenyRule::new("local-script-file", r"--script[=\s]+\S*(?:/|\.nse\b)"),
        DenyRule::new("script-args-file", r"--script-args-file"),
        DenyRule::new("exclude-file", r"--excludefile"),
        DenyRule::new("absolute-output-path", r"-o[NXGSA]\s*/"),
        DenyRule::new("output-override", r"(?:^|\s)-o[NXGSA]"),
        DenyRule::new("data-directory", r"--datadir"),
        DenyRule::new("service-database", r"--servicedb"),
        DenyRule::new("version-database", r"--versiondb"),
        DenyRule::new("resume-from-file", r"--resume"),
        DenyRule::new("external-stylesheet", r"--stylesheet"),
        DenyRule::new("input-list-file", r"(?:^|\s)-iL"),
    ];
}

/// Checks free-form arguments against the denylist and splits them on
/// whitespace. No quoting or escaping is interpreted.
pub fn sanitize_custom_args(raw: &str) -> Result<SanitizedArgs, ValidationError> {
    if let Some(rule) = DENY_RULES.iter().find(|rule| rule.regex.is_match(raw)) {
        return Err(ValidationError::ForbiddenPattern {
            rule: rule.name,
            pattern: rule.pattern,
        });
    }

    let tokens: Vec<String> = raw.split_whitespace().map(ToString::to_string).collect();
    if tokens.is_empty() {
        return Err(ValidationError::MissingArguments);
    }
    Ok(SanitizedArgs(tokens))
}
