//! CISA Known Exploited Vulnerabilities catalog.
//!
//! The whole catalog is downloaded in one request and kept in memory for a
//! configurable TTL. Only one refresh runs at a time; callers that arrive
//! during a refresh wait for it and reuse its snapshot. The download happens
//! without holding the snapshot lock.

use crate::types::KevStatus;
use crate::{Result, ScanError};
use log::{debug, info};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const API_NAME: &str = "kev";

#[derive(Debug, Deserialize)]
struct KevCatalogResponse {
    #[serde(default)]
    vulnerabilities: Vec<KevEntry>,
}

/// One catalog entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KevEntry {
    #[serde(rename = "cveID")]
    pub cve_id: String,
    #[serde(default)]
    pub vendor_project: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub vulnerability_name: String,
    #[serde(default)]
    pub date_added: Option<String>,
    #[serde(default)]
    pub required_action: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub known_ransomware_campaign_use: Option<String>,
}

impl KevEntry {
    pub fn status(&self) -> KevStatus {
        KevStatus {
            is_known_exploited: true,
            due_date: self.due_date.clone(),
            date_added: self.date_added.clone(),
            required_action: self.required_action.clone(),
            known_ransomware_use: self
                .known_ransomware_campaign_use
                .as_deref()
                .map(|s| s.eq_ignore_ascii_case("known"))
                .unwrap_or(false),
        }
    }
}

/// Parse the catalog feed into a map keyed by uppercase CVE id.
pub fn parse_kev_catalog(body: &str) -> Result<HashMap<String, KevEntry>> {
    let catalog: KevCatalogResponse =
        serde_json::from_str(body).map_err(|e| ScanError::Parse(format!("KEV catalog: {}", e)))?;
    Ok(catalog
        .vulnerabilities
        .into_iter()
        .map(|entry| (entry.cve_id.trim().to_uppercase(), entry))
        .collect())
}

struct Snapshot {
    entries: Arc<HashMap<String, KevEntry>>,
    fetched: Instant,
}

pub struct KevCatalog {
    client: reqwest::Client,
    url: String,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
    refresh: tokio::sync::Mutex<()>,
}

impl KevCatalog {
    pub fn new(client: reqwest::Client, url: &str, ttl: Duration) -> Self {
        Self {
            client,
            url: url.to_string(),
            ttl,
            snapshot: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// KEV status for `cve_id`; a CVE absent from the catalog is "not exploited".
    pub async fn lookup(&self, cve_id: &str) -> Result<KevStatus> {
        let entries = self.entries().await?;
        Ok(entries
            .get(&cve_id.to_uppercase())
            .map(KevEntry::status)
            .unwrap_or_default())
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot.read().is_some()
    }

    fn fresh_entries(&self) -> Option<Arc<HashMap<String, KevEntry>>> {
        let guard = self.snapshot.read();
        guard
            .as_ref()
            .filter(|s| s.fetched.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.entries))
    }

    async fn entries(&self) -> Result<Arc<HashMap<String, KevEntry>>> {
        if let Some(entries) = self.fresh_entries() {
            return Ok(entries);
        }

        let _refreshing = self.refresh.lock().await;
        // another caller may have refreshed while we waited
        if let Some(entries) = self.fresh_entries() {
            return Ok(entries);
        }

        let entries = Arc::new(self.download().await?);
        info!("Loaded {} known exploited vulnerabilities", entries.len());
        *self.snapshot.write() = Some(Snapshot {
            entries: Arc::clone(&entries),
            fetched: Instant::now(),
        });
        Ok(entries)
    }

    async fn download(&self) -> Result<HashMap<String, KevEntry>> {
        debug!("Downloading KEV catalog from {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ScanError::external_api(API_NAME, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::external_api(API_NAME, format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ScanError::external_api(API_NAME, e.to_string()))?;
        parse_kev_catalog(&body)
    }
}
