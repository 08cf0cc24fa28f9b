use crate::config::OutputFormat as ReportFormat;
use crate::port_scan::{PortScanOptions, ScanProfile};
use crate::types::Severity;
use crate::vuln_scan::TemplateScanOptions;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hostscan")]
#[command(about = "Single-host port, vulnerability and CVE intelligence scanner")]
#[command(long_about = r#"
hostscan discovers open ports on one host, runs vulnerability templates
against the services it finds and enriches CVE findings with NVD, EPSS and
CISA KEV data.

External tools (nmap, nuclei) are used when installed; otherwise native TCP
probing and built-in checks are used instead.

WARNING: Only scan systems you own or have explicit permission to test.

Examples:
  hostscan port-scan 192.168.1.10 -p 22,80,443
  hostscan vuln-scan example.internal --severity critical,high
  hostscan full-scan 10.0.0.5 --deadline 300
  hostscan cve CVE-2021-44228 CVE-2021-36260
  hostscan cve-search "apache struts" --limit 5
"#)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover open ports and services
    PortScan {
        /// Host name, IP address or URL
        target: String,

        #[command(flatten)]
        ports: PortArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run vulnerability templates against a host
    VulnScan {
        target: String,

        #[command(flatten)]
        templates: TemplateArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Look up CVE records
    Cve {
        #[arg(required = true, value_name = "ID")]
        ids: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Search the NVD by keyword
    CveSearch {
        keyword: String,

        /// Maximum number of records
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Port scan, template scan and CVE enrichment in one run
    FullScan {
        target: String,

        #[command(flatten)]
        ports: PortArgs,

        #[command(flatten)]
        templates: TemplateArgs,

        /// Do not look up CVE intelligence for findings
        #[arg(long)]
        skip_enrichment: bool,

        /// Skip the template phase
        #[arg(long)]
        skip_templates: bool,

        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args, Clone, Debug)]
pub struct PortArgs {
    /// Ports to scan (e.g. 80,443 or 1-1000)
    #[arg(short, long, default_value = "1-1000")]
    pub ports: String,

    /// Timing profile
    #[arg(long, value_enum, default_value = "standard")]
    pub profile: ScanProfile,

    /// Concurrent probes per batch in native mode
    #[arg(long, default_value = "10")]
    pub concurrency: usize,

    /// Per-probe connect timeout in milliseconds
    #[arg(long, default_value = "2000")]
    pub timeout: u64,

    /// Ask the external tool for OS detection
    #[arg(long)]
    pub os: bool,

    /// Skip service version detection
    #[arg(long)]
    pub no_service_detection: bool,
}

impl PortArgs {
    pub fn to_options(&self) -> PortScanOptions {
        PortScanOptions {
            ports: self.ports.clone(),
            timeout_ms: self.timeout,
            concurrency: self.concurrency.max(1),
            scan_profile: self.profile,
            detect_os: self.os,
            detect_service: !self.no_service_detection,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct TemplateArgs {
    /// Severities to report
    #[arg(long, value_delimiter = ',', default_value = "critical,high,medium")]
    pub severity: Vec<Severity>,

    /// Only run templates carrying one of these tags
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Never run templates carrying these tags
    #[arg(long, value_delimiter = ',', default_value = "dos,fuzz")]
    pub exclude_tags: Vec<String>,

    /// Run only these template ids
    #[arg(long = "template", value_delimiter = ',')]
    pub templates: Vec<String>,
}

impl TemplateArgs {
    pub fn to_options(&self) -> TemplateScanOptions {
        TemplateScanOptions {
            severity_filter: self.severity.clone(),
            tags: self.tags.clone(),
            exclude_tags: self.exclude_tags.clone(),
            specific_templates: self.templates.clone(),
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Never run nmap or nuclei, even when installed
    #[arg(long)]
    pub no_external: bool,

    /// Abort the scan after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub deadline: Option<u64>,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl RunArgs {
    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline.map(|secs| secs.saturating_mul(1000))
    }
}

#[derive(Args, Clone, Debug)]
pub struct OutputArgs {
    /// Write reports into this directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Report formats
    #[arg(long, value_enum, value_delimiter = ',')]
    pub format: Vec<CliReportFormat>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliReportFormat {
    Json,
    Csv,
}

impl From<CliReportFormat> for ReportFormat {
    fn from(format: CliReportFormat) -> Self {
        match format {
            CliReportFormat::Json => ReportFormat::Json,
            CliReportFormat::Csv => ReportFormat::Csv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn full_scan_arguments() {
        let cli = Cli::parse_from([
            "hostscan",
            "-vv",
            "full-scan",
            "10.0.0.5",
            "-p",
            "22,80",
            "--profile",
            "quick",
            "--severity",
            "critical,high",
            "--deadline",
            "60",
            "--format",
            "json,csv",
        ]);
        assert_eq!(cli.verbose, 2);

        match cli.command {
            Commands::FullScan { target, ports, templates, run, .. } => {
                assert_eq!(target, "10.0.0.5");
                let options = ports.to_options();
                assert_eq!(options.ports, "22,80");
                assert_eq!(options.scan_profile, ScanProfile::Quick);
                assert!(options.detect_service);
                assert_eq!(templates.to_options().severity_filter, vec![Severity::Critical, Severity::High]);
                assert_eq!(templates.exclude_tags, vec!["dos", "fuzz"]);
                assert_eq!(run.deadline, Some(60));
                assert_eq!(run.deadline_ms(), Some(60_000));
                assert_eq!(run.output.format, vec![CliReportFormat::Json, CliReportFormat::Csv]);
            }
            _ => panic!("expected full-scan"),
        }
    }

    #[test]
    fn huge_deadline_saturates() {
        let cli = Cli::parse_from(["hostscan", "port-scan", "10.0.0.5", "--deadline", "18446744073709551615"]);
        match cli.command {
            Commands::PortScan { run, .. } => assert_eq!(run.deadline_ms(), Some(u64::MAX)),
            _ => panic!("expected port-scan"),
        }
    }

    #[test]
    fn cve_requires_an_id() {
        assert!(Cli::try_parse_from(["hostscan", "cve"]).is_err());
        let cli = Cli::try_parse_from(["hostscan", "cve", "CVE-2021-44228", "-q"]).unwrap();
        assert!(cli.quiet);
    }
}
