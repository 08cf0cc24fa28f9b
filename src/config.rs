use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `HOSTSCAN__PORT_SCAN__TOOL_PATH`.
pub const ENV_PREFIX: &str = "HOSTSCAN";
pub const NVD_API_KEY_ENV: &str = "NVD_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub port_scan: PortScanConfig,
    pub template_scan: TemplateScanConfig,
    pub intel: IntelConfig,
    pub reporting: ReportingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortScanConfig {
    pub use_external: bool,
    pub tool_path: String,
    pub detect_timeout_ms: u64,
    pub exec_timeout_secs: u64,
    pub banner_timeout_ms: u64,
    pub banner_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateScanConfig {
    pub use_external: bool,
    pub engine_path: String,
    pub templates_dir: Option<PathBuf>,
    pub detect_timeout_ms: u64,
    pub exec_timeout_secs: u64,
    pub rate_limit: u32,
    pub bulk_size: u32,
    pub check_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntelConfig {
    pub nvd_url: String,
    pub epss_url: String,
    pub kev_url: String,
    pub nvd_api_key: Option<String>,
    pub cache_ttl_hours: i64,
    pub kev_ttl_hours: u64,
    pub nvd_interval_ms: u64,
    pub nvd_keyed_interval_ms: u64,
    pub epss_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub enrichment_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub output_dir: PathBuf,
    pub formats: Vec<OutputFormat>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Csv,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("hostscan/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 10,
            verify_ssl: false,
        }
    }
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self {
            use_external: true,
            tool_path: "nmap".to_string(),
            detect_timeout_ms: 5000,
            exec_timeout_secs: 600,
            banner_timeout_ms: 500,
            banner_bytes: 200,
        }
    }
}

impl Default for TemplateScanConfig {
    fn default() -> Self {
        Self {
            use_external: true,
            engine_path: "nuclei".to_string(),
            templates_dir: None,
            detect_timeout_ms: 5000,
            exec_timeout_secs: 900,
            rate_limit: 150,
            bulk_size: 25,
            check_concurrency: 8,
        }
    }
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            nvd_url: "https://services.nvd.nist.gov/rest/json/cves/2.0".to_string(),
            epss_url: "https://api.first.org/data/v1/epss".to_string(),
            kev_url: "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json"
                .to_string(),
            nvd_api_key: None,
            cache_ttl_hours: 24,
            kev_ttl_hours: 6,
            // NVD allows 5 requests / 30s anonymously and 50 / 30s with a key
            nvd_interval_ms: 6000,
            nvd_keyed_interval_ms: 600,
            epss_interval_ms: 100,
            request_timeout_secs: 30,
            enrichment_concurrency: 4,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./reports"),
            formats: vec![OutputFormat::Json, OutputFormat::Csv],
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| crate::ScanError::InvalidInput(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.scan.http_timeout_secs)
    }

    pub fn tool_detect_timeout(&self) -> Duration {
        Duration::from_millis(self.port_scan.detect_timeout_ms)
    }

    pub fn tool_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.port_scan.exec_timeout_secs)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.port_scan.banner_timeout_ms)
    }

    pub fn engine_detect_timeout(&self) -> Duration {
        Duration::from_millis(self.template_scan.detect_timeout_ms)
    }

    pub fn engine_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.template_scan.exec_timeout_secs)
    }
}

impl IntelConfig {
    /// API key from the config file, else from `NVD_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        self.nvd_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(NVD_API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn nvd_interval(&self) -> Duration {
        if self.api_key().is_some() {
            Duration::from_millis(self.nvd_keyed_interval_ms)
        } else {
            Duration::from_millis(self.nvd_interval_ms)
        }
    }

    pub fn epss_interval(&self) -> Duration {
        Duration::from_millis(self.epss_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours)
    }

    pub fn kev_ttl(&self) -> Duration {
        Duration::from_secs(self.kev_ttl_hours * 3600)
    }
}
