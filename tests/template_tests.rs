use hostscan::{
    config::Config,
    types::{OpenPort, ScanMethod, Severity, Target},
    vuln_scan::{TemplateMode, TemplateScanOptions, TemplateVulnerabilityScanner},
};
use tokio_util::sync::CancellationToken;

fn local_target() -> Target {
    Target::from_ip("127.0.0.1".parse().unwrap())
}

#[cfg(unix)]
mod engine {
    use super::*;
    use hostscan::ScanError;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    const FINDINGS: &str = r#"{"template-id":"CVE-2021-36260","info":{"name":"Hikvision Web Server RCE","severity":"critical","tags":"cve,rce,hikvision","classification":{"cve-id":["CVE-2021-36260"],"cwe-id":["CWE-78"]}},"host":"http://127.0.0.1","matched-at":"http://127.0.0.1/SDK/webLanguage"}
{"template-id":"exposed-redis","info":{"name":"Redis Unauthenticated","severity":"HIGH","tags":["network","redis"]},"host":"127.0.0.1:6379","matched-at":"127.0.0.1:6379"}
[WRN] Could not parse template hikvision-default-login.yaml
{"template-id":"apache-status","info":{"name":"Apache Server Status","severity":"medium"},"host":"http://127.0.0.1","matched-at":"http://127.0.0.1/server-status"}"#;

    /// A stand-in engine: answers the version probe, then prints `stdout` and exits with `code`.
    fn fake_engine(dir: &Path, stdout: &str, code: i32) -> PathBuf {
        let path = dir.join("fake-nuclei");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"-version\" ]; then echo 'Nuclei Engine Version: v3.1.0'; exit 0; fi\ncat <<'EOF'\n{}\nEOF\nexit {}\n",
            stdout, code
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn scanner_for(engine: &Path) -> TemplateVulnerabilityScanner {
        let mut config = Config::default();
        config.template_scan.engine_path = engine.to_string_lossy().into_owned();
        config.template_scan.templates_dir = None;
        TemplateVulnerabilityScanner::new(config).unwrap()
    }

    #[tokio::test]
    async fn engine_output_with_a_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner_for(&fake_engine(dir.path(), FINDINGS, 0));

        let report = scanner
            .scan("127.0.0.1", &TemplateScanOptions::default())
            .await
            .unwrap();

        assert_eq!(report.scan_method, ScanMethod::ExternalTool);
        assert_eq!(report.findings.len(), 3);
        assert_eq!(report.counts_by_severity.critical, 1);
        assert_eq!(report.counts_by_severity.high, 1);
        assert_eq!(report.counts_by_severity.medium, 1);
        assert_eq!(report.findings[0].cve(), Some("CVE-2021-36260"));
        assert!(report.warnings.iter().any(|w| w.contains("unparsable")));
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_parsed_findings() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner_for(&fake_engine(dir.path(), FINDINGS, 2));
        let mode = scanner.select_mode().await;
        assert!(matches!(mode, TemplateMode::ExternalEngine { .. }));

        let report = scanner
            .scan_with_context(
                &local_target(),
                None,
                &TemplateScanOptions::default(),
                &mode,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.findings.len(), 3);
        assert!(report.warnings.iter().any(|w| w.contains("exited with status")));
    }

    #[tokio::test]
    async fn non_zero_exit_without_findings_fails() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner_for(&fake_engine(dir.path(), "[FTL] no templates found", 1));

        let result = scanner
            .scan_with_context(
                &local_target(),
                None,
                &TemplateScanOptions::default(),
                &TemplateMode::ExternalEngine { templates: None },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ScanError::ToolFailed { .. })));
    }
}

#[tokio::test]
async fn missing_engine_selects_builtin_checks() {
    let mut config = Config::default();
    config.template_scan.engine_path = "/nonexistent/hostscan-test-engine".into();
    let scanner = TemplateVulnerabilityScanner::new(config).unwrap();

    assert_eq!(scanner.select_mode().await, TemplateMode::Builtin);
    assert!(scanner.builtin_checks().len() >= 8);
}

#[tokio::test]
async fn builtin_checks_against_local_server() {
    let mut server = mockito::Server::new_async().await;
    let _git = server
        .mock("GET", "/.git/config")
        .with_status(200)
        .with_header("content-type", "text/plain")
        .with_body("[core]\n\trepositoryformatversion = 0\n\tbare = false\n")
        .create_async()
        .await;
    let _env = server
        .mock("GET", "/.env")
        .with_status(200)
        .with_header("content-type", "text/plain")
        .with_body("APP_ENV=production\nDB_PASSWORD=hunter2\n")
        .create_async()
        .await;

    let port: u16 = server
        .host_with_port()
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap();

    let mut config = Config::default();
    config.template_scan.use_external = false;
    let scanner = TemplateVulnerabilityScanner::new(config).unwrap();
    let open_ports = vec![OpenPort::tcp(port, "http")];

    let report = scanner
        .scan_with_context(
            &local_target(),
            Some(&open_ports),
            &TemplateScanOptions::default(),
            &TemplateMode::Builtin,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.scan_method, ScanMethod::NativeFallback);
    let ids: Vec<&str> = report.findings.iter().map(|f| f.template_id.as_str()).collect();
    assert!(ids.contains(&"git-config-exposure"), "{:?}", ids);
    assert!(ids.contains(&"env-file-exposure"), "{:?}", ids);
    assert!(!ids.contains(&"redis-unauthenticated"));
    assert_eq!(report.counts_by_severity.high, 2);

    let env = report
        .findings
        .iter()
        .find(|f| f.template_id == "env-file-exposure")
        .unwrap();
    assert_eq!(env.severity, Severity::High);
    assert_eq!(
        env.extracted_data.as_deref(),
        Some(&["APP_ENV".to_string(), "DB_PASSWORD".to_string()][..])
    );
}

#[tokio::test]
async fn builtin_filters_select_specific_checks() {
    let mut server = mockito::Server::new_async().await;
    let _git = server
        .mock("GET", "/.git/config")
        .with_status(200)
        .with_body("[core]\n\tbare = false\n")
        .create_async()
        .await;

    let port: u16 = server
        .host_with_port()
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap();

    let scanner = TemplateVulnerabilityScanner::new(Config::default()).unwrap();
    let options = TemplateScanOptions {
        specific_templates: vec!["env-file-exposure".into()],
        ..TemplateScanOptions::default()
    };
    let report = scanner
        .scan_with_context(
            &local_target(),
            Some(&[OpenPort::tcp(port, "http")]),
            &options,
            &TemplateMode::Builtin,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.findings.is_empty());
}
