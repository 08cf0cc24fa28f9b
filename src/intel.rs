//! Vulnerability intelligence: NVD records enriched with EPSS, KEV, weakness
//! categories, remediation hints and a risk score, behind a TTL cache.

use crate::cache::VulnerabilityCache;
use crate::config::Config;
use crate::epss::{self, EpssClient};
use crate::kev::KevCatalog;
use crate::nvd::{self, NvdClient};
use crate::rate_limit::RateLimiter;
use crate::risk::record_risk_score;
use crate::types::{CveRecord, Finding, Reference, Remediation};
use crate::{Result, ScanError};
use chrono::Utc;
use futures::future::join_all;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

lazy_static! {
    static ref CVE_ID: Regex = Regex::new(r"^CVE-\d{4}-\d{4,}$").unwrap();

    static ref WEAKNESS_CATEGORIES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("CWE-20", "Improper Input Validation");
        m.insert("CWE-22", "Path Traversal");
        m.insert("CWE-77", "Command Injection");
        m.insert("CWE-78", "OS Command Injection");
        m.insert("CWE-79", "Cross-Site Scripting");
        m.insert("CWE-89", "SQL Injection");
        m.insert("CWE-94", "Code Injection");
        m.insert("CWE-119", "Memory Corruption");
        m.insert("CWE-120", "Buffer Overflow");
        m.insert("CWE-125", "Out-of-bounds Read");
        m.insert("CWE-200", "Information Disclosure");
        m.insert("CWE-287", "Improper Authentication");
        m.insert("CWE-306", "Missing Authentication");
        m.insert("CWE-352", "Cross-Site Request Forgery");
        m.insert("CWE-400", "Resource Exhaustion");
        m.insert("CWE-416", "Use After Free");
        m.insert("CWE-434", "Unrestricted File Upload");
        m.insert("CWE-502", "Insecure Deserialization");
        m.insert("CWE-611", "XML External Entity");
        m.insert("CWE-787", "Out-of-bounds Write");
        m.insert("CWE-798", "Hard-coded Credentials");
        m.insert("CWE-862", "Missing Authorization");
        m.insert("CWE-863", "Incorrect Authorization");
        m.insert("CWE-918", "Server-Side Request Forgery");
        m
    };
}

/// Trimmed, uppercased CVE identifier, or `InvalidInput`.
pub fn normalize_cve_id(raw: &str) -> Result<String> {
    let id = raw.trim().to_uppercase();
    if CVE_ID.is_match(&id) {
        Ok(id)
    } else {
        Err(ScanError::InvalidInput(format!("not a CVE identifier: '{}'", raw.trim())))
    }
}

pub fn weakness_category(cwe: &str) -> Option<&'static str> {
    WEAKNESS_CATEGORIES.get(cwe.trim()).copied()
}

fn categories_for(weaknesses: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    weaknesses
        .iter()
        .filter_map(|w| weakness_category(w))
        .filter(|c| seen.insert(*c))
        .map(str::to_string)
        .collect()
}

fn has_tag(reference: &Reference, tag: &str) -> bool {
    reference.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
}

/// Patch availability from reference tags; a tagged patch wins over an advisory link.
pub fn remediation_from_references(references: &[Reference]) -> Remediation {
    let patch = references.iter().find(|r| has_tag(r, "Patch"));
    let advisory = references.iter().find(|r| has_tag(r, "Vendor Advisory"));

    Remediation {
        patch_available: patch.is_some() || advisory.is_some(),
        patch_url: patch.or(advisory).map(|r| r.url.clone()),
    }
}

fn derive_local_fields(record: &mut CveRecord) {
    record.categories = categories_for(&record.weaknesses);
    record.remediation = remediation_from_references(&record.references);
    record.risk_score = record_risk_score(record);
}

pub struct VulnerabilityIntelligence {
    nvd: NvdClient,
    epss: EpssClient,
    kev: KevCatalog,
    cache: Arc<VulnerabilityCache>,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
}

impl VulnerabilityIntelligence {
    pub fn new(config: &Config) -> Result<Self> {
        let cache = Arc::new(VulnerabilityCache::new(config.intel.cache_ttl()));
        let limiter = Arc::new(
            RateLimiter::new(config.intel.nvd_interval())
                .with_interval(nvd::API_NAME, config.intel.nvd_interval())
                .with_interval(epss::API_NAME, config.intel.epss_interval()),
        );
        Self::with_shared(config, cache, limiter)
    }

    /// Build on a cache and rate limiter shared with other instances.
    pub fn with_shared(
        config: &Config,
        cache: Arc<VulnerabilityCache>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.intel.request_timeout())
            .user_agent(config.scan.user_agent.clone())
            .build()?;

        let api_key = config.intel.api_key();
        if api_key.is_none() {
            debug!("No NVD API key configured, using the public rate limit");
        }

        Ok(Self {
            nvd: NvdClient::new(client.clone(), &config.intel.nvd_url, api_key),
            epss: EpssClient::new(client.clone(), &config.intel.epss_url),
            kev: KevCatalog::new(client, &config.intel.kev_url, config.intel.kev_ttl()),
            cache,
            limiter,
            concurrency: config.intel.enrichment_concurrency.max(1),
        })
    }

    pub fn cache(&self) -> &Arc<VulnerabilityCache> {
        &self.cache
    }

    /// Enriched record for `cve_id`; `Ok(None)` when the NVD does not know it.
    pub async fn lookup(&self, cve_id: &str) -> Result<Option<CveRecord>> {
        let id = normalize_cve_id(cve_id)?;

        if let Some(record) = self.cache.get_fresh(&id) {
            debug!("Cache hit for {}", id);
            return Ok(Some(record));
        }

        self.limiter.acquire(nvd::API_NAME).await;
        let mut record = match self.nvd.fetch_cve(&id).await? {
            Some(record) => record,
            None => {
                info!("{} not found in the NVD", id);
                return Ok(None);
            }
        };

        self.limiter.acquire(epss::API_NAME).await;
        match self.epss.fetch(&id).await {
            Ok(score) => record.epss = score,
            Err(e) => warn!("EPSS unavailable for {}: {}", id, e),
        }

        match self.kev.lookup(&id).await {
            Ok(status) => record.kev = status,
            Err(e) => warn!("KEV catalog unavailable for {}: {}", id, e),
        }

        derive_local_fields(&mut record);
        let now = Utc::now();
        record.fetched_at = now;
        record.expires_at = self.cache.expiry_from(now);

        self.cache.upsert(record.clone());
        Ok(Some(record))
    }

    /// Keyword search against the NVD. Results are not cached.
    pub async fn search(&self, keyword: &str, limit: usize) -> Result<Vec<CveRecord>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(ScanError::InvalidInput("empty search keyword".into()));
        }

        self.limiter.acquire(nvd::API_NAME).await;
        let mut records = self.nvd.search(keyword, limit).await?;
        for record in &mut records {
            derive_local_fields(record);
        }
        Ok(records)
    }

    /// Attach intelligence to every finding carrying a CVE, one lookup per
    /// distinct identifier. Returns a warning per identifier that failed.
    pub async fn enrich(&self, findings: &mut [Finding]) -> Vec<String> {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!("Dropped {} expired cache entries", purged);
        }

        let mut warnings = Vec::new();
        let mut ids = Vec::new();
        let mut seen = HashSet::new();

        for finding in findings.iter() {
            let Some(raw) = finding.cve() else { continue };
            match normalize_cve_id(raw) {
                Ok(id) => {
                    if seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
                Err(e) => {
                    if seen.insert(raw.to_string()) {
                        warnings.push(format!("Skipping enrichment for {}: {}", finding.template_id, e));
                    }
                }
            }
        }

        let mut records: HashMap<String, CveRecord> = HashMap::new();
        for batch in ids.chunks(self.concurrency) {
            let results = join_all(batch.iter().map(|id| async move { (id, self.lookup(id).await) })).await;

            for (id, result) in results {
                match result {
                    Ok(Some(record)) => {
                        records.insert(id.clone(), record);
                    }
                    Ok(None) => debug!("No intelligence for {}", id),
                    Err(e) => {
                        warn!("Enrichment failed for {}: {}", id, e);
                        warnings.push(format!("Enrichment failed for {}: {}", id, e));
                    }
                }
            }
        }

        for finding in findings.iter_mut() {
            let Some(id) = finding.cve().and_then(|raw| normalize_cve_id(raw).ok()) else {
                continue;
            };
            if let Some(record) = records.get(&id) {
                finding.intelligence = Some(record.clone());
            }
        }

        warnings
    }
}
