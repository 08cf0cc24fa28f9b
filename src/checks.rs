//! Built-in checks used when no external template engine is available.
//!
//! Each check is a small self-contained probe. A probe that cannot reach its
//! target, or gets an unexpected answer, simply reports nothing.

use crate::types::Severity;
use futures::future::BoxFuture;
use futures::FutureExt;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

lazy_static! {
    static ref ENV_ASSIGNMENT: Regex = Regex::new(r"(?m)^\s*[A-Z][A-Z0-9_]+\s*=").unwrap();
    static ref PHP_VERSION: Regex = Regex::new(r"PHP Version\s*(?:</[^>]+>\s*<[^>]+>\s*)?(\d+\.\d+\.\d+)").unwrap();
    static ref VERSIONED_PRODUCT: Regex = Regex::new(r"[A-Za-z][\w\-]*/\d").unwrap();
}

/// Everything a probe needs to reach one endpoint.
pub struct CheckContext {
    pub client: reqwest::Client,
    /// Scheme, host and port without a trailing slash, e.g. `http://10.0.0.5:8080`.
    pub base_url: String,
    /// Host component as it appears in URLs.
    pub host: String,
    pub ip: IpAddr,
    /// Port for service checks.
    pub port: Option<u16>,
    pub timeout: Duration,
}

impl CheckContext {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// A positive probe result.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckHit {
    pub location: String,
    pub extracted: Vec<String>,
}

impl CheckHit {
    fn at(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            extracted: Vec::new(),
        }
    }

    fn with_data(mut self, data: Vec<String>) -> Self {
        self.extracted = data;
        self
    }
}

pub type ProbeFn = for<'a> fn(&'a CheckContext) -> BoxFuture<'a, Option<CheckHit>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// Runs once per HTTP base URL.
    Web,
    /// Runs against the host when one of `ports` is open.
    Service { ports: &'static [u16] },
}

pub struct BuiltinCheck {
    pub id: &'static str,
    pub name: &'static str,
    pub severity: Severity,
    pub tags: &'static [&'static str],
    pub description: &'static str,
    pub references: &'static [&'static str],
    pub cwe: Option<&'static str>,
    pub kind: CheckKind,
    pub probe: ProbeFn,
}

impl BuiltinCheck {
    pub fn required_ports(&self) -> &'static [u16] {
        match self.kind {
            CheckKind::Web => &[],
            CheckKind::Service { ports } => ports,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

impl std::fmt::Debug for BuiltinCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinCheck")
            .field("id", &self.id)
            .field("severity", &self.severity)
            .field("kind", &self.kind)
            .finish()
    }
}

pub fn registry() -> Vec<BuiltinCheck> {
    vec![
        BuiltinCheck {
            id: "git-config-exposure",
            name: "Exposed Git Repository",
            severity: Severity::High,
            tags: &["exposure", "config", "git"],
            description: "The .git/config file is served over HTTP, which usually allows the whole repository to be downloaded.",
            references: &["https://owasp.org/www-project-web-security-testing-guide/latest/4-Web_Application_Security_Testing/02-Configuration_and_Deployment_Management_Testing/04-Review_Old_Backup_and_Unreferenced_Files_for_Sensitive_Information"],
            cwe: Some("CWE-538"),
            kind: CheckKind::Web,
            probe: git_config,
        },
        BuiltinCheck {
            id: "env-file-exposure",
            name: "Exposed Environment File",
            severity: Severity::High,
            tags: &["exposure", "config", "secrets"],
            description: "A .env file with application settings, often including credentials, is publicly readable.",
            references: &["https://cwe.mitre.org/data/definitions/200.html"],
            cwe: Some("CWE-200"),
            kind: CheckKind::Web,
            probe: env_file,
        },
        BuiltinCheck {
            id: "backup-file-exposure",
            name: "Exposed Backup Archive",
            severity: Severity::Medium,
            tags: &["exposure", "backup"],
            description: "A backup or database dump is downloadable from the web root.",
            references: &["https://cwe.mitre.org/data/definitions/530.html"],
            cwe: Some("CWE-530"),
            kind: CheckKind::Web,
            probe: backup_files,
        },
        BuiltinCheck {
            id: "directory-listing",
            name: "Directory Listing Enabled",
            severity: Severity::Medium,
            tags: &["exposure", "misconfig"],
            description: "The web server generates directory indexes, exposing file names that were not meant to be linked.",
            references: &["https://cwe.mitre.org/data/definitions/548.html"],
            cwe: Some("CWE-548"),
            kind: CheckKind::Web,
            probe: directory_listing,
        },
        BuiltinCheck {
            id: "server-status-exposure",
            name: "Apache server-status Exposed",
            severity: Severity::Medium,
            tags: &["exposure", "apache", "misconfig"],
            description: "mod_status output is public and leaks client addresses and requested URLs.",
            references: &["https://httpd.apache.org/docs/2.4/mod/mod_status.html"],
            cwe: Some("CWE-200"),
            kind: CheckKind::Web,
            probe: server_status,
        },
        BuiltinCheck {
            id: "phpinfo-exposure",
            name: "phpinfo() Page Exposed",
            severity: Severity::Medium,
            tags: &["exposure", "php", "debug"],
            description: "A phpinfo() page discloses PHP configuration, loaded modules and environment variables.",
            references: &["https://www.php.net/manual/en/function.phpinfo.php"],
            cwe: Some("CWE-200"),
            kind: CheckKind::Web,
            probe: phpinfo,
        },
        BuiltinCheck {
            id: "missing-security-headers",
            name: "Missing HTTP Security Headers",
            severity: Severity::Info,
            tags: &["headers", "misconfig"],
            description: "Recommended HTTP response headers are not set.",
            references: &["https://owasp.org/www-project-secure-headers/"],
            cwe: Some("CWE-693"),
            kind: CheckKind::Web,
            probe: missing_security_headers,
        },
        BuiltinCheck {
            id: "version-disclosure",
            name: "Server Version Disclosure",
            severity: Severity::Low,
            tags: &["headers", "fingerprint", "disclosure"],
            description: "Response headers reveal exact server or framework versions.",
            references: &["https://cwe.mitre.org/data/definitions/497.html"],
            cwe: Some("CWE-497"),
            kind: CheckKind::Web,
            probe: version_disclosure,
        },
        BuiltinCheck {
            id: "redis-unauthenticated",
            name: "Redis Without Authentication",
            severity: Severity::High,
            tags: &["database", "redis", "auth"],
            description: "Redis answers commands without authentication.",
            references: &["https://redis.io/docs/management/security/"],
            cwe: Some("CWE-306"),
            kind: CheckKind::Service { ports: &[6379] },
            probe: redis_unauthenticated,
        },
        BuiltinCheck {
            id: "elasticsearch-unauthenticated",
            name: "Elasticsearch Without Authentication",
            severity: Severity::High,
            tags: &["database", "elasticsearch", "auth"],
            description: "The Elasticsearch REST API is reachable without credentials.",
            references: &["https://www.elastic.co/guide/en/elasticsearch/reference/current/secure-cluster.html"],
            cwe: Some("CWE-306"),
            kind: CheckKind::Service { ports: &[9200] },
            probe: elasticsearch_unauthenticated,
        },
    ]
}

struct Page {
    url: String,
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl Page {
    fn is_html(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/html"))
            .unwrap_or(false)
            || self.body.trim_start().starts_with('<')
    }
}

async fn fetch(ctx: &CheckContext, url: String) -> Option<reqwest::Response> {
    match ctx.client.get(&url).timeout(ctx.timeout).send().await {
        Ok(response) => Some(response),
        Err(e) => {
            debug!("GET {} failed: {}", url, e);
            None
        }
    }
}

async fn fetch_page(ctx: &CheckContext, path: &str) -> Option<Page> {
    let url = ctx.url(path);
    let response = fetch(ctx, url.clone()).await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.ok()?;
    Some(Page {
        url,
        status,
        headers,
        body,
    })
}

fn git_config(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let page = fetch_page(ctx, "/.git/config").await?;
        (page.status.is_success() && page.body.contains("[core]")).then(|| CheckHit::at(page.url))
    }
    .boxed()
}

fn env_file(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let page = fetch_page(ctx, "/.env").await?;
        if !page.status.is_success() || page.is_html() || !ENV_ASSIGNMENT.is_match(&page.body) {
            return None;
        }
        let keys = page
            .body
            .lines()
            .filter_map(|line| line.split_once('=').map(|(k, _)| k.trim().to_string()))
            .filter(|k| !k.is_empty() && !k.starts_with('#'))
            .take(10)
            .collect();
        Some(CheckHit::at(page.url).with_data(keys))
    }
    .boxed()
}

fn backup_files(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    const CANDIDATES: &[&str] = &[
        "/backup.zip",
        "/backup.tar.gz",
        "/backup.sql",
        "/database.sql",
        "/db.sql",
        "/site.zip",
        "/www.zip",
    ];

    async move {
        for path in CANDIDATES {
            let url = ctx.url(path);
            let response = match fetch(ctx, url.clone()).await {
                Some(response) => response,
                None => continue,
            };
            let html = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("text/html"))
                .unwrap_or(false);
            let non_empty = response.content_length().map(|len| len > 0).unwrap_or(true);

            if response.status().is_success() && !html && non_empty {
                return Some(CheckHit::at(url));
            }
        }
        None
    }
    .boxed()
}

fn directory_listing(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let page = fetch_page(ctx, "/").await?;
        if !page.status.is_success() {
            return None;
        }

        let title = {
            let document = Html::parse_document(&page.body);
            let selector = Selector::parse("title").ok()?;
            document
                .select(&selector)
                .next()
                .map(|t| t.text().collect::<String>())
                .unwrap_or_default()
        };

        let listed = title.starts_with("Index of")
            || title.starts_with("Directory listing for")
            || page.body.contains("<h1>Index of /");
        listed.then(|| CheckHit::at(page.url).with_data(vec![title.trim().to_string()]))
    }
    .boxed()
}

fn server_status(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let page = fetch_page(ctx, "/server-status").await?;
        (page.status.is_success() && page.body.contains("Apache Server Status"))
            .then(|| CheckHit::at(page.url))
    }
    .boxed()
}

fn phpinfo(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        for path in ["/phpinfo.php", "/info.php", "/test.php"] {
            let page = match fetch_page(ctx, path).await {
                Some(page) => page,
                None => continue,
            };
            if page.status.is_success()
                && (page.body.contains("<title>phpinfo()</title>") || page.body.contains("PHP Extension Build"))
            {
                let version = PHP_VERSION
                    .captures(&page.body)
                    .map(|c| vec![c[1].to_string()])
                    .unwrap_or_default();
                return Some(CheckHit::at(page.url).with_data(version));
            }
        }
        None
    }
    .boxed()
}

fn missing_security_headers(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let page = fetch_page(ctx, "/").await?;
        if !page.status.is_success() {
            return None;
        }

        let mut expected = vec!["content-security-policy", "x-frame-options", "x-content-type-options"];
        if page.url.starts_with("https://") {
            expected.push("strict-transport-security");
        }
        let missing: Vec<String> = expected
            .into_iter()
            .filter(|h| !page.headers.contains_key(*h))
            .map(String::from)
            .collect();

        (!missing.is_empty()).then(|| CheckHit::at(page.url).with_data(missing))
    }
    .boxed()
}

fn version_disclosure(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let response = fetch(ctx, ctx.url("/")).await?;
        let mut disclosed = Vec::new();

        for header in ["server", "x-powered-by", "x-aspnet-version", "x-generator"] {
            if let Some(value) = response.headers().get(header).and_then(|v| v.to_str().ok()) {
                let versioned = header != "server" || VERSIONED_PRODUCT.is_match(value);
                if versioned && value.chars().any(|c| c.is_ascii_digit()) {
                    disclosed.push(format!("{}: {}", header, value));
                }
            }
        }

        (!disclosed.is_empty()).then(|| CheckHit::at(ctx.url("/")).with_data(disclosed))
    }
    .boxed()
}

fn redis_unauthenticated(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let port = ctx.port.unwrap_or(6379);
        let addr = SocketAddr::new(ctx.ip, port);
        let mut stream = timeout(ctx.timeout, TcpStream::connect(addr)).await.ok()?.ok()?;

        timeout(ctx.timeout, stream.write_all(b"*1\r\n$4\r\nPING\r\n"))
            .await
            .ok()?
            .ok()?;

        let mut buffer = vec![0u8; 256];
        let n = timeout(ctx.timeout, stream.read(&mut buffer)).await.ok()?.ok()?;
        let response = String::from_utf8_lossy(&buffer[..n]);

        response
            .contains("+PONG")
            .then(|| CheckHit::at(format!("redis://{}:{}", ctx.host, port)))
    }
    .boxed()
}

fn elasticsearch_unauthenticated(ctx: &CheckContext) -> BoxFuture<'_, Option<CheckHit>> {
    async move {
        let port = ctx.port.unwrap_or(9200);
        let url = format!("http://{}:{}/", ctx.host, port);
        let response = fetch(ctx, url.clone()).await?;
        if !response.status().is_success() {
            return None;
        }

        let info: serde_json::Value = response.json().await.ok()?;
        info.get("cluster_name")?;
        let version = info
            .pointer("/version/number")
            .and_then(|v| v.as_str())
            .map(|v| vec![format!("version {}", v)])
            .unwrap_or_default();
        Some(CheckHit::at(url).with_data(version))
    }
    .boxed()
}
