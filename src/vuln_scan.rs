use crate::checks::{self, BuiltinCheck, CheckContext, CheckHit, CheckKind};
use crate::config::Config;
use crate::external;
use crate::services;
use crate::types::{Classification, Finding, OpenPort, ScanMethod, Severity, SeverityCounts, Target};
use crate::utils::network::resolve_target;
use crate::{Result, ScanError};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateScanOptions {
    pub severity_filter: Vec<Severity>,
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub specific_templates: Vec<String>,
}

impl Default for TemplateScanOptions {
    fn default() -> Self {
        Self {
            severity_filter: vec![Severity::Critical, Severity::High, Severity::Medium],
            tags: Vec::new(),
            exclude_tags: vec!["dos".to_string(), "fuzz".to_string()],
            specific_templates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TemplateScanReport {
    pub findings: Vec<Finding>,
    pub counts_by_severity: SeverityCounts,
    pub scan_method: ScanMethod,
    pub warnings: Vec<String>,
    pub interrupted: bool,
    pub duration: Duration,
}

/// Execution path chosen once per scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateMode {
    ExternalEngine { templates: Option<PathBuf> },
    Builtin,
}

impl TemplateMode {
    pub fn method(&self) -> ScanMethod {
        match self {
            TemplateMode::ExternalEngine { .. } => ScanMethod::ExternalTool,
            TemplateMode::Builtin => ScanMethod::NativeFallback,
        }
    }
}

/// Findings parsed from the engine's JSONL stream.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub findings: Vec<Finding>,
    pub skipped_lines: usize,
}

/// String-or-list field in engine output.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Single(String),
    Multiple(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::Single(s) => vec![s],
            OneOrMany::Multiple(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EngineEvent {
    #[serde(rename = "template-id")]
    template_id: String,
    #[serde(default)]
    info: EngineInfo,
    #[serde(rename = "matched-at", default)]
    matched_at: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(rename = "extracted-results", default)]
    extracted_results: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    reference: Option<OneOrMany>,
    #[serde(default)]
    tags: Option<OneOrMany>,
    #[serde(default)]
    classification: Option<EngineClassification>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineClassification {
    #[serde(rename = "cve-id", default)]
    cve_id: Option<OneOrMany>,
    #[serde(rename = "cwe-id", default)]
    cwe_id: Option<OneOrMany>,
}

impl EngineEvent {
    fn into_finding(self) -> Finding {
        let info = self.info;
        let first_upper = |field: Option<OneOrMany>| {
            field
                .map(OneOrMany::into_vec)
                .and_then(|v| v.into_iter().map(|s| s.trim().to_ascii_uppercase()).find(|s| !s.is_empty()))
        };
        let classification = info
            .classification
            .map(|c| Classification {
                cve: first_upper(c.cve_id),
                cwe: first_upper(c.cwe_id),
            })
            .unwrap_or_default();

        let tags = info
            .tags
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .iter()
            .flat_map(|t| t.split(','))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let matched_location = self
            .matched_at
            .clone()
            .or_else(|| self.host.clone())
            .unwrap_or_default();

        Finding {
            name: info.name.unwrap_or_else(|| self.template_id.clone()),
            template_id: self.template_id,
            severity: Severity::normalize(info.severity.as_deref().unwrap_or("info")),
            target: self.host.unwrap_or_else(|| matched_location.clone()),
            matched_location,
            description: info.description.unwrap_or_default().trim().to_string(),
            references: info.reference.map(OneOrMany::into_vec).unwrap_or_default(),
            classification,
            extracted_data: self.extracted_results.filter(|v| !v.is_empty()),
            tags,
            intelligence: None,
        }
    }
}

/// Parse engine output, one JSON object per line; unparsable lines are skipped.
pub fn parse_engine_output(stdout: &str) -> EngineOutput {
    let mut output = EngineOutput::default();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<EngineEvent>(line) {
            Ok(event) => output.findings.push(event.into_finding()),
            Err(e) => {
                debug!("Skipping engine output line: {}", e);
                output.skipped_lines += 1;
            }
        }
    }

    output
}

/// Whether a built-in check passes the caller's filters.
pub fn check_selected(check: &BuiltinCheck, options: &TemplateScanOptions) -> bool {
    if !options.specific_templates.is_empty() {
        return options.specific_templates.iter().any(|id| id == check.id);
    }
    if !options.severity_filter.is_empty() && !options.severity_filter.contains(&check.severity) {
        return false;
    }
    if options.exclude_tags.iter().any(|t| check.has_tag(t)) {
        return false;
    }
    options.tags.is_empty() || options.tags.iter().any(|t| check.has_tag(t))
}

/// HTTP base URLs for a target given its open ports; `http://host` without context.
pub fn web_base_urls(target: &Target, open_ports: Option<&[OpenPort]>) -> Vec<String> {
    let host = target.url_host();
    let ports = match open_ports {
        Some(ports) => ports,
        None => return vec![format!("http://{}", host)],
    };

    ports
        .iter()
        .filter(|p| services::is_web_service(&p.service_name, p.port))
        .map(|p| {
            let tls = services::is_tls_service(&p.service_name, p.port);
            match (tls, p.port) {
                (false, 80) => format!("http://{}", host),
                (true, 443) => format!("https://{}", host),
                (false, port) => format!("http://{}:{}", host, port),
                (true, port) => format!("https://{}:{}", host, port),
            }
        })
        .collect()
}

pub struct TemplateVulnerabilityScanner {
    config: Config,
    client: reqwest::Client,
    checks: Vec<BuiltinCheck>,
}

impl TemplateVulnerabilityScanner {
    pub fn new(config: Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .danger_accept_invalid_certs(!config.scan.verify_ssl)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.scan.user_agent.clone())
            .build()?;

        Ok(Self {
            config,
            client,
            checks: checks::registry(),
        })
    }

    pub fn builtin_checks(&self) -> &[BuiltinCheck] {
        &self.checks
    }

    /// Local template library, if one exists.
    pub fn templates_path(&self) -> Option<PathBuf> {
        let configured = self.config.template_scan.templates_dir.clone();
        let home = std::env::var_os("HOME").map(|h| PathBuf::from(h).join("nuclei-templates"));
        configured.into_iter().chain(home).find(|p| p.is_dir())
    }

    pub async fn select_mode(&self) -> TemplateMode {
        let settings = &self.config.template_scan;
        if !settings.use_external {
            return TemplateMode::Builtin;
        }

        if external::is_available(&settings.engine_path, "-version", self.config.engine_detect_timeout()).await {
            let templates = self.templates_path();
            info!(
                "Using {} for template scanning (templates: {})",
                settings.engine_path,
                templates.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "engine default".into())
            );
            TemplateMode::ExternalEngine { templates }
        } else {
            info!("{} not available, using {} built-in checks", settings.engine_path, self.checks.len());
            TemplateMode::Builtin
        }
    }

    /// Scan a host without port context.
    pub async fn scan(&self, target: &str, options: &TemplateScanOptions) -> Result<TemplateScanReport> {
        let target = resolve_target(target).await?;
        let mode = self.select_mode().await;
        self.scan_with_context(&target, None, options, &mode, &CancellationToken::new())
            .await
    }

    /// Scan using the open ports found earlier to pick endpoints and gate checks.
    pub async fn scan_with_context(
        &self,
        target: &Target,
        open_ports: Option<&[OpenPort]>,
        options: &TemplateScanOptions,
        mode: &TemplateMode,
        cancel: &CancellationToken,
    ) -> Result<TemplateScanReport> {
        let started = Instant::now();
        let mut report = TemplateScanReport {
            findings: Vec::new(),
            counts_by_severity: SeverityCounts::default(),
            scan_method: mode.method(),
            warnings: Vec::new(),
            interrupted: false,
            duration: Duration::ZERO,
        };

        if cancel.is_cancelled() {
            report.interrupted = true;
            return Ok(report);
        }

        match mode {
            TemplateMode::ExternalEngine { templates } => {
                match self
                    .scan_external(target, open_ports, options, templates.as_deref(), &mut report, cancel)
                    .await
                {
                    Err(ScanError::ToolUnavailable(reason)) => {
                        info!("Template engine could not start ({}), using built-in checks", reason);
                        report.scan_method = ScanMethod::NativeFallback;
                        self.scan_builtin(target, open_ports, options, &mut report, cancel).await;
                    }
                    other => other?,
                }
            }
            TemplateMode::Builtin => {
                self.scan_builtin(target, open_ports, options, &mut report, cancel)
                    .await
            }
        }

        report
            .findings
            .sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.template_id.cmp(&b.template_id)));
        report.counts_by_severity = SeverityCounts::from_findings(&report.findings);
        report.duration = started.elapsed();
        Ok(report)
    }

    /// Argument list for the external engine.
    pub fn engine_args(
        targets: &[String],
        templates: Option<&Path>,
        options: &TemplateScanOptions,
        rate_limit: u32,
        bulk_size: u32,
    ) -> Vec<String> {
        let mut args = Vec::new();
        for target in targets {
            args.push("-target".to_string());
            args.push(target.clone());
        }
        args.extend(["-jsonl", "-silent", "-nc"].map(String::from));

        if !options.severity_filter.is_empty() {
            let severities: Vec<&str> = options.severity_filter.iter().map(|s| s.as_str()).collect();
            args.push("-severity".into());
            args.push(severities.join(","));
        }
        if !options.tags.is_empty() {
            args.push("-tags".into());
            args.push(options.tags.join(","));
        }
        if !options.exclude_tags.is_empty() {
            args.push("-etags".into());
            args.push(options.exclude_tags.join(","));
        }
        if !options.specific_templates.is_empty() {
            args.push("-id".into());
            args.push(options.specific_templates.join(","));
        }

        args.push("-rl".into());
        args.push(rate_limit.to_string());
        args.push("-bs".into());
        args.push(bulk_size.to_string());

        if let Some(path) = templates {
            args.push("-t".into());
            args.push(path.display().to_string());
        }
        args
    }

    fn engine_targets(target: &Target, open_ports: Option<&[OpenPort]>) -> Vec<String> {
        let ports = match open_ports {
            Some(ports) if !ports.is_empty() => ports,
            _ => return vec![target.input.clone()],
        };

        let mut targets = web_base_urls(target, Some(ports));
        targets.extend(
            ports
                .iter()
                .filter(|p| !services::is_web_service(&p.service_name, p.port))
                .map(|p| format!("{}:{}", target.url_host(), p.port)),
        );
        targets
    }

    async fn scan_external(
        &self,
        target: &Target,
        open_ports: Option<&[OpenPort]>,
        options: &TemplateScanOptions,
        templates: Option<&Path>,
        report: &mut TemplateScanReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let settings = &self.config.template_scan;
        let targets = Self::engine_targets(target, open_ports);
        let args = Self::engine_args(&targets, templates, options, settings.rate_limit, settings.bulk_size);

        let output = tokio::select! {
            result = external::run_tool(&settings.engine_path, &args, self.config.engine_exec_timeout()) => result?,
            _ = cancel.cancelled() => {
                report.interrupted = true;
                return Ok(());
            }
        };

        let parsed = parse_engine_output(&output.stdout);
        if parsed.skipped_lines > 0 {
            let message = format!("Skipped {} unparsable engine output lines", parsed.skipped_lines);
            warn!("{}", message);
            report.warnings.push(message);
        }

        if !output.success {
            if parsed.findings.is_empty() {
                return Err(ScanError::ToolFailed {
                    tool: settings.engine_path.clone(),
                    code: output.code,
                    message: output.stderr_summary(),
                });
            }
            let message = format!(
                "{} exited with status {:?}; keeping {} findings",
                settings.engine_path,
                output.code,
                parsed.findings.len()
            );
            warn!("{}", message);
            report.warnings.push(message);
        }

        report.findings = parsed.findings;
        Ok(())
    }

    async fn scan_builtin(
        &self,
        target: &Target,
        open_ports: Option<&[OpenPort]>,
        options: &TemplateScanOptions,
        report: &mut TemplateScanReport,
        cancel: &CancellationToken,
    ) {
        let base_urls = web_base_urls(target, open_ports);
        let probe_timeout = self.config.http_timeout();
        let mut tasks: Vec<(&BuiltinCheck, CheckContext)> = Vec::new();

        for check in self.checks.iter().filter(|c| check_selected(c, options)) {
            match check.kind {
                CheckKind::Web => {
                    for base in &base_urls {
                        tasks.push((check, self.context(target, base.clone(), None, probe_timeout)));
                    }
                }
                CheckKind::Service { ports } => {
                    let port = match open_ports {
                        Some(open) => ports.iter().copied().find(|p| open.iter().any(|o| o.port == *p)),
                        None => ports.first().copied(),
                    };
                    match port {
                        Some(port) => tasks.push((
                            check,
                            self.context(target, String::new(), Some(port), probe_timeout),
                        )),
                        None => debug!("Skipping {}: none of {:?} open", check.id, ports),
                    }
                }
            }
        }

        debug!("Running {} built-in probes against {}", tasks.len(), target.input);
        let label = target.input.clone();
        let concurrency = self.config.template_scan.check_concurrency.max(1);

        let hits: Vec<(&BuiltinCheck, Option<CheckHit>)> = futures::stream::iter(tasks)
            .map(|(check, ctx)| async move {
                let hit = (check.probe)(&ctx).await;
                (check, hit)
            })
            .buffer_unordered(concurrency)
            .take_until(cancel.cancelled())
            .collect()
            .await;

        if cancel.is_cancelled() {
            report.interrupted = true;
        }

        report.findings.extend(
            hits.into_iter()
                .filter_map(|(check, hit)| hit.map(|h| finding_from_check(check, &label, h))),
        );
    }

    fn context(&self, target: &Target, base_url: String, port: Option<u16>, timeout: Duration) -> CheckContext {
        CheckContext {
            client: self.client.clone(),
            base_url,
            host: target.url_host(),
            ip: target.ip,
            port,
            timeout,
        }
    }
}

fn finding_from_check(check: &BuiltinCheck, target: &str, hit: CheckHit) -> Finding {
    Finding {
        template_id: check.id.to_string(),
        name: check.name.to_string(),
        severity: check.severity,
        target: target.to_string(),
        matched_location: hit.location,
        description: check.description.to_string(),
        references: check.references.iter().map(|r| r.to_string()).collect(),
        classification: Classification {
            cve: None,
            cwe: check.cwe.map(String::from),
        },
        extracted_data: Some(hit.extracted).filter(|v| !v.is_empty()),
        tags: check.tags.iter().map(|t| t.to_string()).collect(),
        intelligence: None,
    }
}
