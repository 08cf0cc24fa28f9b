//! NVD CVE API 2.0 client.

use crate::cpe::parse_cpe;
use crate::types::{CveRecord, CvssScore, Reference};
use crate::{Result, ScanError};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;

pub const API_NAME: &str = "nvd";
/// NVD caps `resultsPerPage` at 2000.
const MAX_PAGE: usize = 2000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdResponse {
    #[serde(default)]
    vulnerabilities: Vec<NvdItem>,
}

#[derive(Debug, Deserialize)]
struct NvdItem {
    cve: NvdCve,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCve {
    id: String,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    descriptions: Vec<LangString>,
    #[serde(default)]
    metrics: NvdMetrics,
    #[serde(default)]
    weaknesses: Vec<NvdWeakness>,
    #[serde(default)]
    configurations: Vec<NvdConfiguration>,
    #[serde(default)]
    references: Vec<NvdReference>,
}

#[derive(Debug, Deserialize)]
struct LangString {
    lang: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct NvdMetrics {
    #[serde(rename = "cvssMetricV31", default)]
    v31: Vec<NvdMetric>,
    #[serde(rename = "cvssMetricV30", default)]
    v30: Vec<NvdMetric>,
    #[serde(rename = "cvssMetricV2", default)]
    v2: Vec<NvdMetric>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdMetric {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    cvss_data: CvssData,
    // v2 keeps the severity next to cvssData
    #[serde(default)]
    base_severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssData {
    base_score: f32,
    #[serde(default)]
    base_severity: Option<String>,
    #[serde(default)]
    vector_string: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NvdWeakness {
    #[serde(default)]
    description: Vec<LangString>,
}

#[derive(Debug, Deserialize)]
struct NvdConfiguration {
    #[serde(default)]
    nodes: Vec<NvdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdNode {
    #[serde(default)]
    cpe_match: Vec<NvdCpeMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdCpeMatch {
    #[serde(default)]
    vulnerable: bool,
    criteria: String,
    #[serde(default)]
    version_start_including: Option<String>,
    #[serde(default)]
    version_start_excluding: Option<String>,
    #[serde(default)]
    version_end_including: Option<String>,
    #[serde(default)]
    version_end_excluding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NvdReference {
    url: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Prefer the NVD's own ("Primary") score when several sources scored the CVE.
fn pick_metric(metrics: &[NvdMetric]) -> Option<CvssScore> {
    let metric = metrics
        .iter()
        .find(|m| m.kind.as_deref() == Some("Primary"))
        .or_else(|| metrics.first())?;

    Some(CvssScore {
        base_score: metric.cvss_data.base_score,
        severity: metric
            .cvss_data
            .base_severity
            .clone()
            .or_else(|| metric.base_severity.clone()),
        vector: metric.cvss_data.vector_string.clone(),
    })
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // NVD omits the offset; timestamps are UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl NvdCve {
    fn into_record(self) -> CveRecord {
        let mut record = CveRecord::new(&self.id);

        record.description = self
            .descriptions
            .iter()
            .find(|d| d.lang == "en")
            .or_else(|| self.descriptions.first())
            .map(|d| d.value.clone())
            .unwrap_or_default();
        record.published_at = parse_timestamp(self.published.as_deref());
        record.modified_at = parse_timestamp(self.last_modified.as_deref());

        record.cvss_v3 = pick_metric(&self.metrics.v31).or_else(|| pick_metric(&self.metrics.v30));
        record.cvss_v2 = pick_metric(&self.metrics.v2);

        for weakness in self.weaknesses.iter().flat_map(|w| &w.description) {
            let value = weakness.value.trim();
            // NVD-CWE-noinfo / NVD-CWE-Other are placeholders
            if value.starts_with("CWE-") && !record.weaknesses.iter().any(|w| w == value) {
                record.weaknesses.push(value.to_string());
            }
        }

        let matches = self
            .configurations
            .into_iter()
            .flat_map(|c| c.nodes)
            .flat_map(|n| n.cpe_match)
            .filter(|m| m.vulnerable);
        for cpe_match in matches {
            if record.affected_products.iter().any(|p| p.cpe == cpe_match.criteria) {
                continue;
            }
            if let Some(mut product) = parse_cpe(&cpe_match.criteria) {
                product.version_start_including = cpe_match.version_start_including;
                product.version_start_excluding = cpe_match.version_start_excluding;
                product.version_end_including = cpe_match.version_end_including;
                product.version_end_excluding = cpe_match.version_end_excluding;
                record.affected_products.push(product);
            }
        }

        record.references = self
            .references
            .into_iter()
            .map(|r| Reference {
                url: r.url,
                source: r.source,
                tags: r.tags,
            })
            .collect();

        record
    }
}

/// Parse an NVD 2.0 response body into (un-enriched) records.
pub fn parse_nvd_response(body: &str) -> Result<Vec<CveRecord>> {
    let response: NvdResponse =
        serde_json::from_str(body).map_err(|e| ScanError::Parse(format!("NVD response: {}", e)))?;
    Ok(response
        .vulnerabilities
        .into_iter()
        .map(|item| item.cve.into_record())
        .collect())
}

pub struct NvdClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl NvdClient {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Canonical record for `cve_id`, or `None` if the NVD does not know it.
    pub async fn fetch_cve(&self, cve_id: &str) -> Result<Option<CveRecord>> {
        let body = match self.get(&[("cveId", cve_id.to_string())]).await? {
            Some(body) => body,
            None => return Ok(None),
        };
        let records = parse_nvd_response(&body)?;
        Ok(records.into_iter().find(|r| r.id.eq_ignore_ascii_case(cve_id)))
    }

    /// Keyword search, most relevant first as returned by the NVD.
    pub async fn search(&self, keyword: &str, limit: usize) -> Result<Vec<CveRecord>> {
        let limit = limit.clamp(1, MAX_PAGE);
        let query = [
            ("keywordSearch", keyword.to_string()),
            ("resultsPerPage", limit.to_string()),
        ];
        match self.get(&query).await? {
            Some(body) => {
                let mut records = parse_nvd_response(&body)?;
                records.truncate(limit);
                Ok(records)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn get(&self, query: &[(&str, String)]) -> Result<Option<String>> {
        let mut request = self.client.get(&self.base_url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header("apiKey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ScanError::external_api(API_NAME, e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("NVD returned 404 for {:?}", query);
                Ok(None)
            }
            status if status.is_success() => response
                .text()
                .await
                .map(Some)
                .map_err(|e| ScanError::external_api(API_NAME, e.to_string())),
            status => Err(ScanError::external_api(API_NAME, format!("HTTP {}", status))),
        }
    }
}
