//! Hostscan - Host Reconnaissance and Vulnerability Assessment Engine
//!
//! Discovers open services on a target, runs vulnerability templates against
//! them and enriches the resulting findings with NVD, EPSS and CISA KEV
//! intelligence.
//!
//! # Warning
//! This tool is designed for authorized security assessment only. Users are
//! responsible for ensuring they have permission before scanning any host.

pub mod cache;
pub mod checks;
pub mod cli;
pub mod config;
pub mod cpe;
pub mod display;
pub mod epss;
pub mod error;
pub mod external;
pub mod intel;
pub mod kev;
pub mod nmap_output;
pub mod nvd;
pub mod orchestrator;
pub mod port_scan;
pub mod port_spec;
pub mod rate_limit;
pub mod reporting;
pub mod risk;
pub mod services;
pub mod utils;
pub mod vuln_scan;

pub use error::{Result, ScanError};

/// Common types shared by the scanners, the intelligence layer and collaborators
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::fmt;
    use std::net::IpAddr;
    use std::str::FromStr;
    use std::time::Duration;

    use crate::utils::time::duration_ms;

    /// A scan target. Immutable once resolved.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Target {
        /// The string the caller asked us to scan.
        pub input: String,
        pub ip: IpAddr,
        pub hostname: Option<String>,
    }

    impl Target {
        pub fn from_ip(ip: IpAddr) -> Self {
            Self {
                input: ip.to_string(),
                ip,
                hostname: None,
            }
        }

        /// Host component suitable for building URLs (brackets IPv6 literals).
        pub fn url_host(&self) -> String {
            match self.input.parse::<IpAddr>() {
                Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
                Ok(ip) => ip.to_string(),
                Err(_) => self.input.clone(),
            }
        }
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(rename_all = "lowercase")]
    pub enum Protocol {
        Tcp,
        Udp,
    }

    impl fmt::Display for Protocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Protocol::Tcp => write!(f, "tcp"),
                Protocol::Udp => write!(f, "udp"),
            }
        }
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum PortState {
        Open,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct OpenPort {
        pub port: u16,
        pub protocol: Protocol,
        pub state: PortState,
        pub service_name: String,
        pub version: Option<String>,
        pub banner: Option<String>,
    }

    impl OpenPort {
        pub fn tcp(port: u16, service_name: impl Into<String>) -> Self {
            Self {
                port,
                protocol: Protocol::Tcp,
                state: PortState::Open,
                service_name: service_name.into(),
                version: None,
                banner: None,
            }
        }
    }

    /// Which execution path produced a result.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub enum ScanMethod {
        ExternalTool,
        NativeFallback,
    }

    impl fmt::Display for ScanMethod {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ScanMethod::ExternalTool => write!(f, "external_tool"),
                ScanMethod::NativeFallback => write!(f, "native_fallback"),
            }
        }
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[serde(rename_all = "lowercase")]
    pub enum Severity {
        Info,
        Low,
        Medium,
        High,
        Critical,
    }

    impl Severity {
        pub const ALL: [Severity; 5] = [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
            Severity::Info,
        ];

        /// Lenient normalization used at ingestion: unknown labels become `Info`.
        pub fn normalize(raw: &str) -> Severity {
            raw.parse().unwrap_or(Severity::Info)
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                Severity::Critical => "critical",
                Severity::High => "high",
                Severity::Medium => "medium",
                Severity::Low => "low",
                Severity::Info => "info",
            }
        }
    }

    impl FromStr for Severity {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "critical" => Ok(Severity::Critical),
                "high" => Ok(Severity::High),
                "medium" | "moderate" => Ok(Severity::Medium),
                "low" => Ok(Severity::Low),
                "info" | "informational" | "none" => Ok(Severity::Info),
                other => Err(format!("unknown severity '{}'", other)),
            }
        }
    }

    impl fmt::Display for Severity {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Classification {
        pub cve: Option<String>,
        pub cwe: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Finding {
        pub template_id: String,
        pub name: String,
        pub severity: Severity,
        pub target: String,
        pub matched_location: String,
        pub description: String,
        pub references: Vec<String>,
        pub classification: Classification,
        pub extracted_data: Option<Vec<String>>,
        #[serde(default)]
        pub tags: Vec<String>,
        #[serde(default)]
        pub intelligence: Option<CveRecord>,
    }

    impl Finding {
        pub fn cve(&self) -> Option<&str> {
            self.classification.cve.as_deref()
        }
    }

    #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct SeverityCounts {
        pub critical: usize,
        pub high: usize,
        pub medium: usize,
        pub low: usize,
        pub info: usize,
    }

    impl SeverityCounts {
        pub fn from_findings(findings: &[Finding]) -> Self {
            let mut counts = Self::default();
            for finding in findings {
                counts.add(finding.severity);
            }
            counts
        }

        pub fn add(&mut self, severity: Severity) {
            match severity {
                Severity::Critical => self.critical += 1,
                Severity::High => self.high += 1,
                Severity::Medium => self.medium += 1,
                Severity::Low => self.low += 1,
                Severity::Info => self.info += 1,
            }
        }

        pub fn get(&self, severity: Severity) -> usize {
            match severity {
                Severity::Critical => self.critical,
                Severity::High => self.high,
                Severity::Medium => self.medium,
                Severity::Low => self.low,
                Severity::Info => self.info,
            }
        }

        pub fn total(&self) -> usize {
            self.critical + self.high + self.medium + self.low + self.info
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct OsGuess {
        pub name: String,
        pub accuracy: Option<u8>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct ServiceSummary {
        pub ports: Vec<u16>,
        pub version: Option<String>,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
    #[serde(rename_all = "lowercase")]
    pub enum RiskLevel {
        None,
        Low,
        Medium,
        High,
        Critical,
    }

    impl fmt::Display for RiskLevel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let label = match self {
                RiskLevel::None => "none",
                RiskLevel::Low => "low",
                RiskLevel::Medium => "medium",
                RiskLevel::High => "high",
                RiskLevel::Critical => "critical",
            };
            f.write_str(label)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ScanResult {
        pub scan_id: String,
        pub target: Target,
        pub open_ports: Vec<OpenPort>,
        pub services: BTreeMap<String, ServiceSummary>,
        pub os_guess: Option<OsGuess>,
        pub findings: Vec<Finding>,
        pub counts_by_severity: SeverityCounts,
        pub risk_score: u8,
        pub risk_level: RiskLevel,
        pub scan_method: ScanMethod,
        pub template_scan_method: Option<ScanMethod>,
        pub warnings: Vec<String>,
        #[serde(with = "duration_ms")]
        pub duration: Duration,
        pub started_at: DateTime<Utc>,
        pub completed_at: DateTime<Utc>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct CvssScore {
        pub base_score: f32,
        pub severity: Option<String>,
        pub vector: Option<String>,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
    pub struct EpssScore {
        /// Probability of exploitation activity in the next 30 days.
        pub score: f64,
        pub percentile: f64,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct KevStatus {
        pub is_known_exploited: bool,
        pub due_date: Option<String>,
        pub date_added: Option<String>,
        pub required_action: Option<String>,
        pub known_ransomware_use: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Reference {
        pub url: String,
        pub source: Option<String>,
        pub tags: Vec<String>,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub enum CpePart {
        Application,
        OperatingSystem,
        Hardware,
    }

    /// One platform from a CPE match; `None` means unspecified (`*` or `-`).
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct AffectedProduct {
        pub cpe: String,
        pub part: Option<CpePart>,
        pub vendor: Option<String>,
        pub product: Option<String>,
        pub version: Option<String>,
        pub update: Option<String>,
        pub version_start_including: Option<String>,
        pub version_start_excluding: Option<String>,
        pub version_end_including: Option<String>,
        pub version_end_excluding: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    pub struct Remediation {
        pub patch_available: bool,
        pub patch_url: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct CveRecord {
        pub id: String,
        pub description: String,
        pub published_at: Option<DateTime<Utc>>,
        pub modified_at: Option<DateTime<Utc>>,
        pub cvss_v3: Option<CvssScore>,
        pub cvss_v2: Option<CvssScore>,
        pub epss: Option<EpssScore>,
        pub kev: KevStatus,
        pub weaknesses: Vec<String>,
        pub affected_products: Vec<AffectedProduct>,
        pub references: Vec<Reference>,
        pub remediation: Remediation,
        pub categories: Vec<String>,
        pub risk_score: u8,
        pub fetched_at: DateTime<Utc>,
        pub expires_at: DateTime<Utc>,
    }

    impl CveRecord {
        /// An empty record for `id`, expiring immediately.
        pub fn new(id: &str) -> Self {
            let now = Utc::now();
            Self {
                id: id.to_string(),
                description: String::new(),
                published_at: None,
                modified_at: None,
                cvss_v3: None,
                cvss_v2: None,
                epss: None,
                kev: KevStatus::default(),
                weaknesses: Vec::new(),
                affected_products: Vec::new(),
                references: Vec::new(),
                remediation: Remediation::default(),
                categories: Vec::new(),
                risk_score: 0,
                fetched_at: now,
                expires_at: now,
            }
        }

        /// CVSS v3 base score, falling back to v2 when v3 is absent.
        pub fn base_score(&self) -> Option<f32> {
            self.cvss_v3
                .as_ref()
                .or(self.cvss_v2.as_ref())
                .map(|c| c.base_score)
        }

        pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
            now > self.expires_at
        }
    }
}
