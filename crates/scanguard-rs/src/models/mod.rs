use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};

use crate::profiles::ProfileKind;

pub type ScanId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ScanStatus::Queued),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            "cancelled" => Ok(ScanStatus::Cancelled),
            other => Err(format!("unknown scan status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanRequest {
    pub target: String,
    pub profile: ProfileKind,
    #[serde(default)]
    pub custom_arguments: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    5
}

impl ScanRequest {
    pub fn new(target: impl Into<String>, profile: ProfileKind) -> Self {
        Self {
            target: target.into(),
            profile,
            custom_arguments: None,
            priority: default_priority(),
        }
    }

    pub fn with_custom_arguments(mut self, args: impl Into<String>) -> Self {
        self.custom_arguments = Some(args.into());
        self
    }
}

/// Persisted lifecycle object for one scan. Mutated only through the
/// transition methods below, which keep `completed_at` in step with the
/// terminal states.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub owner: String,
    pub job_handle: Option<String>,
    #[serde(flatten)]
    pub request: ScanRequest,
    pub status: ScanStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub raw_output: Option<String>,
    pub parsed_result: Option<ParsedResult>,
    pub error_message: Option<String>,
    pub hosts_up: u32,
    pub ports_found: u32,
    pub vulnerabilities_found: u32,
}

/// Rejected transition: the record was in `from` and could not reach `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRejected {
    pub from: ScanStatus,
    pub to: ScanStatus,
}

impl ScanRecord {
    pub fn new(id: ScanId, owner: &str, request: ScanRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner: owner.to_string(),
            job_handle: None,
            request,
            status: ScanStatus::Queued,
            attempts: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            raw_output: None,
            parsed_result: None,
            error_message: None,
            hosts_up: 0,
            ports_found: 0,
            vulnerabilities_found: 0,
        }
    }

    fn guard(&self, allowed: &[ScanStatus], to: ScanStatus) -> Result<(), TransitionRejected> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionRejected {
                from: self.status,
                to,
            })
        }
    }

    fn finish(&mut self, status: ScanStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
    }

    /// Queued → running, or running → running for a redelivered job.
    /// `started_at` is only set the first time.
    pub fn begin_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionRejected> {
        self.guard(&[ScanStatus::Queued, ScanStatus::Running], ScanStatus::Running)?;
        self.status = ScanStatus::Running;
        self.updated_at = now;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        raw_output: String,
        parsed: ParsedResult,
    ) -> Result<(), TransitionRejected> {
        self.guard(&[ScanStatus::Running], ScanStatus::Completed)?;
        self.hosts_up = parsed.stats.hosts_up;
        self.ports_found = parsed.stats.total_ports;
        // services reporting extra info on a vuln run
        self.vulnerabilities_found = if self.request.profile == ProfileKind::Vuln {
            parsed.extra_info_count()
        } else {
            0
        };
        self.raw_output = Some(raw_output);
        self.parsed_result = Some(parsed);
        self.error_message = None;
        self.finish(ScanStatus::Completed, now);
        Ok(())
    }

    /// Validation failures fail a record straight from `queued`.
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        message: String,
        raw_output: Option<String>,
    ) -> Result<(), TransitionRejected> {
        self.guard(&[ScanStatus::Queued, ScanStatus::Running], ScanStatus::Failed)?;
        self.error_message = Some(message);
        if raw_output.is_some() {
            self.raw_output = raw_output;
        }
        self.finish(ScanStatus::Failed, now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionRejected> {
        self.guard(&[ScanStatus::Queued, ScanStatus::Running], ScanStatus::Cancelled)?;
        self.finish(ScanStatus::Cancelled, now);
        Ok(())
    }

    /// Failed → queued for a new attempt. Results of the failed attempt are
    /// dropped; `started_at` survives.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), TransitionRejected> {
        self.guard(&[ScanStatus::Failed], ScanStatus::Queued)?;
        self.status = ScanStatus::Queued;
        self.updated_at = now;
        self.attempts += 1;
        self.completed_at = None;
        self.duration_seconds = None;
        self.raw_output = None;
        self.parsed_result = None;
        self.error_message = None;
        self.hosts_up = 0;
        self.ports_found = 0;
        self.vulnerabilities_found = 0;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParsedResult {
    pub scan_info: BTreeMap<String, String>,
    pub hosts: Vec<HostResult>,
    pub stats: ScanStats,
}

impl ParsedResult {
    pub fn extra_info_count(&self) -> u32 {
        self.hosts
            .iter()
            .flat_map(|h| h.ports.iter())
            .filter_map(|p| p.service.as_ref())
            .filter(|s| s.extra_info.as_deref().is_some_and(|e| !e.trim().is_empty()))
            .count() as u32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanStats {
    pub hosts_up: u32,
    pub hosts_down: u32,
    pub total_hosts: u32,
    pub total_ports: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    Mac,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Address {
    pub value: String,
    pub family: AddressFamily,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Hostname {
    pub name: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OsGuess {
    pub name: String,
    pub confidence_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HostResult {
    pub status: HostStatus,
    pub addresses: Vec<Address>,
    pub hostnames: Vec<Hostname>,
    pub ports: Vec<PortResult>,
    pub os_guess: Option<OsGuess>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PortState {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "filtered")]
    Filtered,
    #[serde(rename = "unfiltered")]
    Unfiltered,
    #[serde(rename = "open|filtered")]
    OpenFiltered,
    #[serde(rename = "closed|filtered")]
    ClosedFiltered,
    #[serde(rename = "unknown")]
    Unknown,
}

impl PortState {
    pub fn from_tool(state: &str) -> Self {
        match state {
            "open" => PortState::Open,
            "closed" => PortState::Closed,
            "filtered" => PortState::Filtered,
            "unfiltered" => PortState::Unfiltered,
            "open|filtered" => PortState::OpenFiltered,
            "closed|filtered" => PortState::ClosedFiltered,
            _ => PortState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceInfo {
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extra_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortResult {
    pub protocol: String,
    pub number: u16,
    pub state: PortState,
    pub service: Option<ServiceInfo>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(profile: ProfileKind) -> ScanRecord {
        ScanRecord::new(7, "operator", ScanRequest::new("192.168.1.5", profile), Utc::now())
    }

    fn assert_invariant(r: &ScanRecord) {
        assert_eq!(r.status.is_terminal(), r.completed_at.is_some(), "{r:?}");
        if r.duration_seconds.is_some() {
            assert!(r.started_at.is_some() && r.completed_at.is_some());
        }
    }

    fn parsed_with_extra_info() -> ParsedResult {
        let port = |number, extra: Option<&str>| PortResult {
            protocol: "tcp".into(),
            number,
            state: PortState::Open,
            service: Some(ServiceInfo {
                name: Some("http".into()),
                product: None,
                version: None,
                extra_info: extra.map(str::to_string),
            }),
        };
        ParsedResult {
            scan_info: BTreeMap::new(),
            hosts: vec![HostResult {
                status: HostStatus::Up,
                addresses: vec![],
                hostnames: vec![],
                ports: vec![port(80, Some("Ubuntu")), port(443, Some("")), port(22, None)],
                os_guess: None,
            }],
            stats: ScanStats {
                hosts_up: 1,
                hosts_down: 0,
                total_hosts: 1,
                total_ports: 3,
            },
        }
    }

    #[test]
    fn completion_sets_duration_and_counters() {
        let mut r = record(ProfileKind::Vuln);
        let t0 = Utc::now();
        r.begin_running(t0).unwrap();
        r.complete(t0 + Duration::milliseconds(2500), "<xml/>".into(), parsed_with_extra_info())
            .unwrap();
        assert_eq!(r.status, ScanStatus::Completed);
        assert_eq!(r.duration_seconds, Some(2.5));
        assert_eq!(r.hosts_up, 1);
        assert_eq!(r.ports_found, 3);
        assert_eq!(r.vulnerabilities_found, 1);
        assert_invariant(&r);
    }

    #[test]
    fn vulnerability_count_only_for_vuln_profile() {
        let mut r = record(ProfileKind::Quick);
        r.begin_running(Utc::now()).unwrap();
        r.complete(Utc::now(), String::new(), parsed_with_extra_info()).unwrap();
        assert_eq!(r.vulnerabilities_found, 0);
    }

    #[test]
    fn reentering_running_keeps_started_at() {
        let mut r = record(ProfileKind::Default);
        let first = Utc::now();
        r.begin_running(first).unwrap();
        r.begin_running(first + Duration::seconds(30)).unwrap();
        assert_eq!(r.started_at, Some(first));
    }

    #[test]
    fn terminal_states_are_final() {
        for finish in 0..3 {
            let mut r = record(ProfileKind::Default);
            r.begin_running(Utc::now()).unwrap();
            match finish {
                0 => r.complete(Utc::now(), String::new(), ParsedResult::default()).unwrap(),
                1 => r.fail(Utc::now(), "boom".into(), None).unwrap(),
                _ => r.cancel(Utc::now()).unwrap(),
            }
            assert_invariant(&r);
            let status = r.status;
            assert!(r.begin_running(Utc::now()).is_err());
            assert!(r.cancel(Utc::now()).is_err());
            assert!(r.fail(Utc::now(), "again".into(), None).is_err());
            assert!(r.complete(Utc::now(), String::new(), ParsedResult::default()).is_err());
            assert_eq!(r.status, status);
        }
    }

    #[test]
    fn failing_from_queued_has_no_duration() {
        let mut r = record(ProfileKind::Custom);
        r.fail(Utc::now(), "forbidden".into(), None).unwrap();
        assert_eq!(r.status, ScanStatus::Failed);
        assert!(r.duration_seconds.is_none());
        assert_invariant(&r);
    }

    #[test]
    fn requeue_only_from_failed_and_clears_outcome() {
        let mut r = record(ProfileKind::Default);
        assert_eq!(
            r.requeue(Utc::now()),
            Err(TransitionRejected {
                from: ScanStatus::Queued,
                to: ScanStatus::Queued
            })
        );
        r.begin_running(Utc::now()).unwrap();
        r.fail(Utc::now(), "timeout".into(), Some("partial".into())).unwrap();
        r.requeue(Utc::now()).unwrap();
        assert_eq!(r.status, ScanStatus::Queued);
        assert_eq!(r.attempts, 2);
        assert!(r.error_message.is_none() && r.raw_output.is_none());
        assert!(r.started_at.is_some());
        assert_invariant(&r);
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in ["queued", "running", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<ScanStatus>().unwrap().as_str(), s);
        }
        assert!("paused".parse::<ScanStatus>().is_err());
    }
}
