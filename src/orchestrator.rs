//! End-to-end scan of one target: ports, templates, enrichment, risk.

use crate::config::Config;
use crate::intel::VulnerabilityIntelligence;
use crate::port_scan::{PortScanOptions, PortScanner};
use crate::port_spec::PortSpec;
use crate::risk::{aggregate_risk, risk_level};
use crate::types::{RiskLevel, ScanMethod, ScanResult, SeverityCounts, Target};
use crate::utils::network::resolve_target;
use crate::vuln_scan::{TemplateScanOptions, TemplateVulnerabilityScanner};
use crate::{Result, ScanError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub ports: PortScanOptions,
    pub templates: TemplateScanOptions,
    pub skip_templates: bool,
    pub skip_enrichment: bool,
    /// Wall-clock budget for the whole scan.
    pub deadline_ms: Option<u64>,
}

/// Cancels the scan token when the deadline passes; aborted on drop.
struct DeadlineTimer(Option<JoinHandle<()>>);

impl DeadlineTimer {
    fn start(deadline_ms: Option<u64>, token: &CancellationToken) -> Self {
        let handle = deadline_ms.map(|ms| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                info!("Scan deadline of {}ms reached", ms);
                token.cancel();
            })
        });
        Self(handle)
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

pub struct ScanOrchestrator {
    port_scanner: PortScanner,
    template_scanner: TemplateVulnerabilityScanner,
    intel: Arc<VulnerabilityIntelligence>,
}

impl ScanOrchestrator {
    pub fn new(config: Config) -> Result<Self> {
        let intel = Arc::new(VulnerabilityIntelligence::new(&config)?);
        let template_scanner = TemplateVulnerabilityScanner::new(config.clone())?;
        let port_scanner = PortScanner::new(config);
        Ok(Self::with_components(port_scanner, template_scanner, intel))
    }

    pub fn with_components(
        port_scanner: PortScanner,
        template_scanner: TemplateVulnerabilityScanner,
        intel: Arc<VulnerabilityIntelligence>,
    ) -> Self {
        Self {
            port_scanner,
            template_scanner,
            intel,
        }
    }

    pub fn intelligence(&self) -> &Arc<VulnerabilityIntelligence> {
        &self.intel
    }

    pub async fn run(&self, target: &str, options: &ScanOptions) -> Result<ScanResult> {
        self.run_with_cancel(target, options, CancellationToken::new())
            .await
    }

    /// Full scan that stops between phases once `cancel` fires or the
    /// deadline passes, returning what was gathered in `ScanError::Cancelled`.
    pub async fn run_with_cancel(
        &self,
        target: &str,
        options: &ScanOptions,
        cancel: CancellationToken,
    ) -> Result<ScanResult> {
        let clock = Instant::now();
        let started_at = Utc::now();
        PortSpec::parse(&options.ports.ports)?;

        let token = cancel.child_token();
        let _deadline = DeadlineTimer::start(options.deadline_ms, &token);
        let interruption = |result: ScanResult| -> ScanError {
            let reason = if cancel.is_cancelled() {
                "cancelled by caller"
            } else {
                "deadline exceeded"
            };
            warn!("Scan of {} stopped early: {}", result.target.input, reason);
            ScanError::Cancelled {
                reason: reason.to_string(),
                partial: Some(Box::new(result)),
            }
        };

        let target = resolve_target(target).await?;
        info!("Starting scan of {} ({})", target.input, target.ip);

        let method = self.port_scanner.select_method().await;
        let mut result = empty_result(target.clone(), method, started_at);

        match self
            .port_scanner
            .scan_target(&target, &options.ports, method, &token)
            .await
        {
            Ok(fragment) => {
                result.open_ports = fragment.open_ports;
                result.services = fragment.services;
                result.os_guess = fragment.os_guess;
                result.scan_method = fragment.scan_method;
                result.warnings.extend(fragment.warnings);
            }
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => push_warning(&mut result, format!("Port scan failed: {}", e)),
        }

        if token.is_cancelled() {
            return Err(interruption(finish(result, clock)));
        }

        if !options.skip_templates {
            let mode = self.template_scanner.select_mode().await;
            result.template_scan_method = Some(mode.method());
            match self
                .template_scanner
                .scan_with_context(&target, Some(&result.open_ports), &options.templates, &mode, &token)
                .await
            {
                Ok(report) => {
                    result.template_scan_method = Some(report.scan_method);
                    result.findings = report.findings;
                    result.warnings.extend(report.warnings);
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => push_warning(&mut result, format!("Template scan failed: {}", e)),
            }

            if token.is_cancelled() {
                return Err(interruption(finish(result, clock)));
            }
        }

        if !options.skip_enrichment && result.findings.iter().any(|f| f.cve().is_some()) {
            let mut findings = result.findings.clone();
            let intel = Arc::clone(&self.intel);
            let enrichment = async move {
                let warnings = intel.enrich(&mut findings).await;
                (findings, warnings)
            };

            tokio::select! {
                (findings, warnings) = enrichment => {
                    result.findings = findings;
                    result.warnings.extend(warnings);
                }
                _ = token.cancelled() => {
                    return Err(interruption(finish(result, clock)));
                }
            }
        }

        let result = finish(result, clock);
        info!(
            "Scan of {} finished: {} open ports, {} findings, risk {} ({})",
            result.target.input,
            result.open_ports.len(),
            result.findings.len(),
            result.risk_score,
            result.risk_level
        );
        Ok(result)
    }
}

fn empty_result(target: Target, method: ScanMethod, started_at: DateTime<Utc>) -> ScanResult {
    ScanResult {
        scan_id: uuid::Uuid::new_v4().to_string(),
        target,
        open_ports: Vec::new(),
        services: BTreeMap::new(),
        os_guess: None,
        findings: Vec::new(),
        counts_by_severity: SeverityCounts::default(),
        risk_score: 0,
        risk_level: RiskLevel::None,
        scan_method: method,
        template_scan_method: None,
        warnings: Vec::new(),
        duration: Duration::ZERO,
        started_at,
        completed_at: started_at,
    }
}

fn push_warning(result: &mut ScanResult, message: String) {
    warn!("{}", message);
    result.warnings.push(message);
}

/// Stamp counts, risk and timing.
fn finish(mut result: ScanResult, clock: Instant) -> ScanResult {
    result.counts_by_severity = SeverityCounts::from_findings(&result.findings);
    result.risk_score = aggregate_risk(&result.findings, &result.counts_by_severity);
    result.risk_level = risk_level(result.risk_score);
    result.duration = clock.elapsed();
    result.completed_at = Utc::now();
    result
}
