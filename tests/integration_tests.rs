use async_trait::async_trait;
use hostscan::{
    config::{Config, OutputFormat},
    intel::VulnerabilityIntelligence,
    orchestrator::{ScanOptions, ScanOrchestrator},
    port_scan::{Connector, PortScanOptions, PortScanner, ProbeOutcome},
    types::{RiskLevel, ScanMethod},
    vuln_scan::TemplateVulnerabilityScanner,
    ScanError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn offline_config() -> Config {
    let mut config = Config::default();
    config.port_scan.use_external = false;
    config.port_scan.banner_timeout_ms = 50;
    config.template_scan.use_external = false;
    config
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_config_default() {
    let config = Config::default();

    assert!(config.port_scan.use_external);
    assert_eq!(config.port_scan.exec_timeout_secs, 600);
    assert_eq!(config.template_scan.rate_limit, 150);
    assert_eq!(config.intel.kev_ttl_hours, 6);
    assert!(config.intel.nvd_api_key.is_none());
    assert_eq!(config.reporting.output_dir.to_string_lossy(), "./reports");
    assert_eq!(config.reporting.formats, vec![OutputFormat::Json, OutputFormat::Csv]);
}

#[test]
fn test_config_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hostscan.toml");

    let mut config = Config::default();
    config.port_scan.tool_path = "/opt/nmap/bin/nmap".into();
    config.template_scan.bulk_size = 10;
    config.intel.enrichment_concurrency = 2;
    config.save_to_file(&path.to_string_lossy()).unwrap();

    let loaded = Config::load_from_file(&path.to_string_lossy()).unwrap();
    assert_eq!(loaded.port_scan.tool_path, "/opt/nmap/bin/nmap");
    assert_eq!(loaded.template_scan.bulk_size, 10);
    assert_eq!(loaded.intel.enrichment_concurrency, 2);
    assert_eq!(loaded.intel.cache_ttl_hours, 24);
}

#[tokio::test]
async fn native_scan_reports_listening_ports() {
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_a = first.local_addr().unwrap().port();
    let open_b = second.local_addr().unwrap().port();
    let closed = closed_port().await;

    let scanner = PortScanner::new(offline_config());
    let options = PortScanOptions {
        ports: format!("{},{},{}", open_a, open_b, closed),
        timeout_ms: 500,
        ..PortScanOptions::default()
    };
    let fragment = scanner.scan("127.0.0.1", &options).await.unwrap();

    let ports: Vec<u16> = fragment.open_ports.iter().map(|p| p.port).collect();
    assert!(ports.contains(&open_a));
    assert!(ports.contains(&open_b));
    assert!(!ports.contains(&closed));
    assert_eq!(fragment.scan_method, ScanMethod::NativeFallback);
    assert!(!fragment.interrupted);
}

#[tokio::test]
async fn missing_port_tool_falls_back_to_native() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = offline_config();
    config.port_scan.use_external = true;
    config.port_scan.tool_path = "/nonexistent/hostscan-nmap".into();
    let scanner = PortScanner::new(config);

    let options = PortScanOptions {
        ports: port.to_string(),
        ..PortScanOptions::default()
    };
    let fragment = scanner.scan("127.0.0.1", &options).await.unwrap();
    assert_eq!(fragment.scan_method, ScanMethod::NativeFallback);
    assert_eq!(fragment.open_ports.len(), 1);
}

#[tokio::test]
async fn invalid_port_spec_is_rejected_up_front() {
    let orchestrator = ScanOrchestrator::new(offline_config()).unwrap();
    let options = ScanOptions {
        ports: PortScanOptions {
            ports: "80-".into(),
            ..PortScanOptions::default()
        },
        ..ScanOptions::default()
    };

    let err = orchestrator.run("127.0.0.1", &options).await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidInput(_)));
}

#[tokio::test]
async fn unresolvable_host_fails() {
    let orchestrator = ScanOrchestrator::new(offline_config()).unwrap();
    let err = orchestrator
        .run("does-not-exist.invalid", &ScanOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::UnresolvableHost(_)));
}

#[tokio::test]
async fn cancelled_scan_returns_partial_result() {
    let orchestrator = ScanOrchestrator::new(offline_config()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let options = ScanOptions {
        ports: PortScanOptions {
            ports: closed_port().await.to_string(),
            ..PortScanOptions::default()
        },
        ..ScanOptions::default()
    };

    match orchestrator.run_with_cancel("127.0.0.1", &options, cancel).await {
        Err(ScanError::Cancelled { reason, partial }) => {
            assert_eq!(reason, "cancelled by caller");
            let partial = partial.expect("partial result");
            assert_eq!(partial.target.input, "127.0.0.1");
            assert!(partial.findings.is_empty());
            assert!(partial.completed_at >= partial.started_at);
        }
        other => panic!("expected cancellation, got {:?}", other.map(|r| r.scan_id)),
    }
}

/// Every probe takes longer than the scan deadline.
struct SlowConnector;

#[async_trait]
impl Connector for SlowConnector {
    async fn probe(&self, _addr: SocketAddr, _connect_timeout: Duration) -> ProbeOutcome {
        tokio::time::sleep(Duration::from_millis(200)).await;
        ProbeOutcome::Closed
    }
}

#[tokio::test]
async fn deadline_stops_a_slow_scan() {
    let config = offline_config();
    let orchestrator = ScanOrchestrator::with_components(
        PortScanner::with_connector(config.clone(), Arc::new(SlowConnector)),
        TemplateVulnerabilityScanner::new(config.clone()).unwrap(),
        Arc::new(VulnerabilityIntelligence::new(&config).unwrap()),
    );
    let options = ScanOptions {
        ports: PortScanOptions {
            ports: "1-50".into(),
            concurrency: 1,
            ..PortScanOptions::default()
        },
        deadline_ms: Some(100),
        ..ScanOptions::default()
    };

    let started = std::time::Instant::now();
    let err = orchestrator.run("127.0.0.1", &options).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(
        matches!(&err, ScanError::Cancelled { reason, .. } if reason == "deadline exceeded"),
        "{}",
        err
    );
    let partial = err.into_partial().expect("partial result");
    assert!(partial.open_ports.is_empty());
    assert!(partial.warnings.iter().any(|w| w.contains("interrupted")));
}

#[tokio::test]
async fn port_only_scan_has_no_risk() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let orchestrator = ScanOrchestrator::new(offline_config()).unwrap();
    let options = ScanOptions {
        ports: PortScanOptions {
            ports: port.to_string(),
            ..PortScanOptions::default()
        },
        skip_templates: true,
        ..ScanOptions::default()
    };

    let result = orchestrator.run("127.0.0.1", &options).await.unwrap();
    assert_eq!(result.open_ports.len(), 1);
    assert_eq!(result.open_ports[0].port, port);
    assert!(result.findings.is_empty());
    assert!(result.template_scan_method.is_none());
    assert_eq!(result.risk_score, 0);
    assert_eq!(result.risk_level, RiskLevel::None);
    assert!(result.services.values().any(|s| s.ports.contains(&port)));
}
