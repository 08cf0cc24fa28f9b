use crate::config::Config;
use crate::external;
use crate::nmap_output::{parse_nmap_xml, ParseTier};
use crate::port_spec::{PortSpec, DEFAULT_PORTS};
use crate::services;
use crate::types::{OpenPort, OsGuess, PortState, Protocol, ScanMethod, ServiceSummary, Target};
use crate::utils::network::resolve_target;
use crate::{Result, ScanError};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Timing profile handed to the external tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScanProfile {
    Quick,
    #[default]
    Standard,
    Deep,
    Stealth,
}

impl ScanProfile {
    fn tool_args(&self) -> &'static [&'static str] {
        match self {
            ScanProfile::Quick => &["-T4", "--max-retries", "1"],
            ScanProfile::Standard => &["-T3"],
            ScanProfile::Deep => &["-T4", "-sV", "--version-intensity", "9"],
            ScanProfile::Stealth => &["-T1", "--max-retries", "1"],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortScanOptions {
    pub ports: String,
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub scan_profile: ScanProfile,
    pub detect_os: bool,
    pub detect_service: bool,
}

impl Default for PortScanOptions {
    fn default() -> Self {
        Self {
            ports: DEFAULT_PORTS.to_string(),
            timeout_ms: 2000,
            concurrency: 10,
            scan_profile: ScanProfile::Standard,
            detect_os: false,
            detect_service: true,
        }
    }
}

/// What one port-scan invocation produced.
#[derive(Debug, Clone)]
pub struct PortScanFragment {
    pub target: Target,
    pub open_ports: Vec<OpenPort>,
    pub services: BTreeMap<String, ServiceSummary>,
    pub os_guess: Option<OsGuess>,
    pub scan_method: ScanMethod,
    pub warnings: Vec<String>,
    /// Set when cancellation stopped the scan early.
    pub interrupted: bool,
    pub duration: Duration,
}

impl PortScanFragment {
    fn new(target: Target, scan_method: ScanMethod) -> Self {
        Self {
            target,
            open_ports: Vec::new(),
            services: BTreeMap::new(),
            os_guess: None,
            scan_method,
            warnings: Vec::new(),
            interrupted: false,
            duration: Duration::ZERO,
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Open { banner: Option<String> },
    Closed,
}

/// Transport used by native probing.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn probe(&self, addr: SocketAddr, connect_timeout: Duration) -> ProbeOutcome;
}

/// Plain TCP connect probe with a short banner read.
pub struct TcpConnector {
    banner_bytes: usize,
    banner_timeout: Duration,
}

impl TcpConnector {
    pub fn new(banner_bytes: usize, banner_timeout: Duration) -> Self {
        Self {
            banner_bytes: banner_bytes.max(1),
            banner_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.port_scan.banner_bytes, config.banner_timeout())
    }

    async fn read_banner(&self, stream: &mut TcpStream, port: u16) -> Option<String> {
        let mut buffer = vec![0u8; self.banner_bytes];
        let mut n = self.read_once(stream, &mut buffer).await;

        // HTTP servers wait for a request before saying anything
        if n == 0 && services::is_web_service("", port) && !services::is_tls_service("", port) {
            if stream.write_all(b"HEAD / HTTP/1.0\r\n\r\n").await.is_ok() {
                n = self.read_once(stream, &mut buffer).await;
            }
        }

        let banner = String::from_utf8_lossy(&buffer[..n]).trim().to_string();
        if banner.is_empty() {
            None
        } else {
            Some(banner)
        }
    }

    async fn read_once(&self, stream: &mut TcpStream, buffer: &mut [u8]) -> usize {
        match timeout(self.banner_timeout, stream.read(buffer)).await {
            Ok(Ok(n)) => n,
            _ => 0,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn probe(&self, addr: SocketAddr, connect_timeout: Duration) -> ProbeOutcome {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                debug!("TCP port {} is open", addr);
                let banner = self.read_banner(&mut stream, addr.port()).await;
                ProbeOutcome::Open { banner }
            }
            _ => ProbeOutcome::Closed,
        }
    }
}

pub struct PortScanner {
    config: Config,
    connector: Arc<dyn Connector>,
}

impl PortScanner {
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(TcpConnector::from_config(&config));
        Self { config, connector }
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Probe for the external tool once; its absence selects native probing.
    pub async fn select_method(&self) -> ScanMethod {
        let settings = &self.config.port_scan;
        if !settings.use_external {
            return ScanMethod::NativeFallback;
        }

        if external::is_available(&settings.tool_path, "--version", self.config.tool_detect_timeout()).await {
            info!("Using {} for port discovery", settings.tool_path);
            ScanMethod::ExternalTool
        } else {
            info!("{} not available, using native TCP probing", settings.tool_path);
            ScanMethod::NativeFallback
        }
    }

    /// Resolve `target`, pick a mode and scan.
    pub async fn scan(&self, target: &str, options: &PortScanOptions) -> Result<PortScanFragment> {
        let target = resolve_target(target).await?;
        let method = self.select_method().await;
        self.scan_target(&target, options, method, &CancellationToken::new())
            .await
    }

    pub async fn scan_target(
        &self,
        target: &Target,
        options: &PortScanOptions,
        method: ScanMethod,
        cancel: &CancellationToken,
    ) -> Result<PortScanFragment> {
        let started = Instant::now();
        let spec = PortSpec::parse(&options.ports)?;
        let mut fragment = PortScanFragment::new(target.clone(), method);

        if spec.is_empty() {
            fragment.warn(format!("Port specification '{}' selects no ports", options.ports));
        } else if cancel.is_cancelled() {
            fragment.interrupted = true;
        } else {
            info!(
                "Scanning {} ports on {} ({})",
                spec.len(),
                target.ip,
                method
            );
            match method {
                ScanMethod::ExternalTool => {
                    match self.scan_external(&spec, options, &mut fragment, cancel).await {
                        Err(ScanError::ToolUnavailable(reason)) => {
                            info!("External tool could not start ({}), falling back", reason);
                            fragment.scan_method = ScanMethod::NativeFallback;
                            self.scan_native(&spec, options, &mut fragment, cancel).await;
                        }
                        other => other?,
                    }
                }
                ScanMethod::NativeFallback => {
                    self.scan_native(&spec, options, &mut fragment, cancel).await
                }
            }
        }

        fragment.services = group_services(&fragment.open_ports);
        fragment.duration = started.elapsed();
        debug!(
            "Port scan of {} found {} open ports in {:?}",
            target.ip,
            fragment.open_ports.len(),
            fragment.duration
        );
        Ok(fragment)
    }

    /// Argument list for the external tool.
    pub fn external_args(host: &str, spec: &PortSpec, options: &PortScanOptions) -> Vec<String> {
        let mut args: Vec<String> = vec!["-Pn".into()];
        args.extend(options.scan_profile.tool_args().iter().map(|a| a.to_string()));
        args.push("-p".into());
        args.push(spec.to_expression());

        if options.detect_service && options.scan_profile != ScanProfile::Deep {
            args.push("-sV".into());
        }
        if options.detect_os {
            args.push("-O".into());
        }

        args.extend(["-oX".to_string(), "-".to_string(), host.to_string()]);
        args
    }

    async fn scan_external(
        &self,
        spec: &PortSpec,
        options: &PortScanOptions,
        fragment: &mut PortScanFragment,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tool = &self.config.port_scan.tool_path;
        let args = Self::external_args(&fragment.target.input, spec, options);

        let output = tokio::select! {
            result = external::run_tool(tool, &args, self.config.tool_exec_timeout()) => result?,
            _ = cancel.cancelled() => {
                fragment.interrupted = true;
                return Ok(());
            }
        };

        let report = parse_nmap_xml(&output.stdout);
        if !output.success {
            if report.ports.is_empty() {
                return Err(ScanError::ToolFailed {
                    tool: tool.clone(),
                    code: output.code,
                    message: output.stderr_summary(),
                });
            }
            fragment.warn(format!(
                "{} exited with status {:?}; keeping {} parsed ports",
                tool,
                output.code,
                report.ports.len()
            ));
        }
        if report.tier == ParseTier::Secondary {
            fragment.warn(format!("{} output was malformed; parsed with the loose pattern", tool));
        }

        if fragment.target.hostname.is_none() {
            fragment.target.hostname = report.hostname.clone();
        }
        if let Some(address) = report.address {
            if address != fragment.target.ip {
                debug!("{} reported address {} for {}", tool, address, fragment.target.input);
            }
        }

        fragment.os_guess = report.os_guess;
        fragment.open_ports = report
            .ports
            .into_iter()
            .map(|p| {
                let service_name = p
                    .service
                    .or_else(|| services::service_for_port(p.port, p.protocol).map(String::from))
                    .unwrap_or_else(|| "unknown".to_string());
                OpenPort {
                    port: p.port,
                    protocol: p.protocol,
                    state: PortState::Open,
                    service_name,
                    version: p.version,
                    banner: None,
                }
            })
            .collect();

        Ok(())
    }

    async fn scan_native(
        &self,
        spec: &PortSpec,
        options: &PortScanOptions,
        fragment: &mut PortScanFragment,
        cancel: &CancellationToken,
    ) {
        let concurrency = options.concurrency.max(1);
        let connect_timeout = Duration::from_millis(options.timeout_ms.max(1));
        let connector = self.connector.as_ref();
        let ip = fragment.target.ip;

        for batch in spec.ports().chunks(concurrency) {
            if cancel.is_cancelled() {
                fragment.interrupted = true;
                fragment.warn(format!(
                    "Port scan interrupted after {} open ports",
                    fragment.open_ports.len()
                ));
                break;
            }

            let probes = batch.iter().map(|&port| async move {
                let outcome = connector.probe(SocketAddr::new(ip, port), connect_timeout).await;
                (port, outcome)
            });

            for (port, outcome) in join_all(probes).await {
                if let ProbeOutcome::Open { banner } = outcome {
                    fragment
                        .open_ports
                        .push(classify_port(port, banner, options.detect_service));
                }
            }
        }

        fragment.open_ports.sort_by_key(|p| p.port);
    }
}

fn classify_port(port: u16, banner: Option<String>, detect_service: bool) -> OpenPort {
    let service_name = banner
        .as_deref()
        .and_then(services::identify_from_banner)
        .or_else(|| services::service_for_port(port, Protocol::Tcp))
        .unwrap_or("unknown")
        .to_string();

    let version = if detect_service {
        banner
            .as_deref()
            .and_then(|b| services::extract_version(b, &service_name))
    } else {
        None
    };

    OpenPort {
        port,
        protocol: Protocol::Tcp,
        state: PortState::Open,
        service_name,
        version,
        banner,
    }
}

/// Group open ports by service name; the first known version wins.
pub fn group_services(ports: &[OpenPort]) -> BTreeMap<String, ServiceSummary> {
    let mut services: BTreeMap<String, ServiceSummary> = BTreeMap::new();
    for port in ports {
        let entry = services.entry(port.service_name.clone()).or_default();
        entry.ports.push(port.port);
        if entry.version.is_none() {
            entry.version = port.version.clone();
        }
    }
    services
}
