use crate::config::{Config, OutputFormat};
use crate::types::{CveRecord, Finding, ScanResult};
use crate::{Result, ScanError};
use log::{debug, info};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// One CSV row per finding.
#[derive(Debug, Serialize)]
struct FindingRow<'a> {
    target: &'a str,
    template_id: &'a str,
    name: &'a str,
    severity: &'a str,
    matched_location: &'a str,
    cve: &'a str,
    cwe: &'a str,
    cvss: Option<f32>,
    epss: Option<f64>,
    known_exploited: bool,
    risk_score: Option<u8>,
    references: String,
}

pub struct ReportGenerator {
    config: Config,
}

impl ReportGenerator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.reporting.output_dir
    }

    /// Write `scan_result` in every configured format, returning the paths written.
    pub async fn generate_report(&self, scan_result: &ScanResult) -> Result<Vec<PathBuf>> {
        self.ensure_output_dir().await?;

        let base_filename = format!(
            "hostscan_{}_{}",
            sanitize(&scan_result.target.input),
            scan_result.started_at.format("%Y%m%d_%H%M%S")
        );

        let mut generated_files = Vec::new();
        for format in &self.config.reporting.formats {
            let path = match format {
                OutputFormat::Json => {
                    let path = self.output_dir().join(format!("{}.json", base_filename));
                    self.generate_json_report(scan_result, &path).await?;
                    path
                }
                OutputFormat::Csv => {
                    let path = self.output_dir().join(format!("{}.csv", base_filename));
                    self.generate_csv_report(scan_result, &path).await?;
                    path
                }
            };
            generated_files.push(path);
        }

        info!("Generated {} report files", generated_files.len());
        Ok(generated_files)
    }

    /// Write looked-up CVE records as one JSON document.
    pub async fn generate_cve_report(&self, records: &[CveRecord]) -> Result<PathBuf> {
        self.ensure_output_dir().await?;
        let path = self.output_dir().join(format!(
            "hostscan_cves_{}.json",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        write_file(&path, serde_json::to_string_pretty(records)?.as_bytes()).await?;
        info!("Wrote {} CVE records to {}", records.len(), path.display());
        Ok(path)
    }

    async fn ensure_output_dir(&self) -> Result<()> {
        fs::create_dir_all(self.output_dir())
            .await
            .map_err(|e| ScanError::Reporting(format!("Failed to create output directory: {}", e)))
    }

    async fn generate_json_report(&self, scan_result: &ScanResult, path: &Path) -> Result<()> {
        debug!("Generating JSON report: {}", path.display());
        let json = serde_json::to_string_pretty(scan_result)?;
        write_file(path, json.as_bytes()).await
    }

    async fn generate_csv_report(&self, scan_result: &ScanResult, path: &Path) -> Result<()> {
        debug!("Generating CSV report: {}", path.display());
        let content = findings_csv(&scan_result.findings)?;
        write_file(path, &content).await
    }

    /// Write findings of a template-only scan in every configured format.
    pub async fn generate_findings_report(&self, target: &str, findings: &[Finding]) -> Result<Vec<PathBuf>> {
        self.ensure_output_dir().await?;
        let base_filename = format!(
            "hostscan_findings_{}_{}",
            sanitize(target),
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );

        let mut generated_files = Vec::new();
        for format in &self.config.reporting.formats {
            let (path, content) = match format {
                OutputFormat::Json => (
                    self.output_dir().join(format!("{}.json", base_filename)),
                    serde_json::to_vec_pretty(findings)?,
                ),
                OutputFormat::Csv => (
                    self.output_dir().join(format!("{}.csv", base_filename)),
                    findings_csv(findings)?,
                ),
            };
            write_file(&path, &content).await?;
            generated_files.push(path);
        }
        Ok(generated_files)
    }
}

pub fn findings_csv(findings: &[Finding]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for finding in findings {
        let intel = finding.intelligence.as_ref();
        writer.serialize(FindingRow {
            target: &finding.target,
            template_id: &finding.template_id,
            name: &finding.name,
            severity: finding.severity.as_str(),
            matched_location: &finding.matched_location,
            cve: finding.classification.cve.as_deref().unwrap_or(""),
            cwe: finding.classification.cwe.as_deref().unwrap_or(""),
            cvss: intel.and_then(|i| i.base_score()),
            epss: intel.and_then(|i| i.epss).map(|e| e.score),
            known_exploited: intel.map(|i| i.kev.is_known_exploited).unwrap_or(false),
            risk_score: intel.map(|i| i.risk_score),
            references: finding.references.join(" "),
        })?;
    }

    writer
        .into_inner()
        .map_err(|e| ScanError::Reporting(format!("Failed to flush CSV: {}", e)))
}

async fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    fs::write(path, content)
        .await
        .map_err(|e| ScanError::Reporting(format!("Failed to write {}: {}", path.display(), e)))
}

fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Classification, RiskLevel, ScanMethod, Severity, SeverityCounts, Target};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn scan_result() -> ScanResult {
        let finding = Finding {
            template_id: "CVE-2021-36260".into(),
            name: "Hikvision, Web Server, command injection".into(),
            severity: Severity::Critical,
            target: "http://192.0.2.10".into(),
            matched_location: "http://192.0.2.10/SDK/webLanguage".into(),
            description: String::new(),
            references: vec!["https://nvd.nist.gov/vuln/detail/CVE-2021-36260".into()],
            classification: Classification {
                cve: Some("CVE-2021-36260".into()),
                cwe: Some("CWE-78".into()),
            },
            extracted_data: None,
            tags: vec!["cve".into(), "rce".into()],
            intelligence: None,
        };
        let now = Utc::now();
        ScanResult {
            scan_id: "test".into(),
            target: Target::from_ip("192.0.2.10".parse().unwrap()),
            open_ports: Vec::new(),
            services: BTreeMap::new(),
            os_guess: None,
            counts_by_severity: SeverityCounts::from_findings(std::slice::from_ref(&finding)),
            findings: vec![finding],
            risk_score: 75,
            risk_level: RiskLevel::High,
            scan_method: ScanMethod::NativeFallback,
            template_scan_method: Some(ScanMethod::ExternalTool),
            warnings: Vec::new(),
            duration: Duration::from_millis(1500),
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn csv_has_header_and_row() {
        let csv = String::from_utf8(findings_csv(&scan_result().findings).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("target,template_id,name,severity"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"Hikvision, Web Server, command injection\""));
        assert!(row.contains(",critical,"));
        assert!(lines.next().is_none());
    }

    #[tokio::test]
    async fn writes_configured_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.reporting.output_dir = dir.path().join("reports");
        config.reporting.formats = vec![OutputFormat::Json, OutputFormat::Csv];

        let files = ReportGenerator::new(config)
            .generate_report(&scan_result())
            .await
            .unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.exists()));

        let json = std::fs::read_to_string(&files[0]).unwrap();
        let parsed: ScanResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.duration, Duration::from_millis(1500));
        assert_eq!(parsed.findings[0].severity, Severity::Critical);
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize("http://example.com:8080"), "http___example.com_8080");
    }
}
