//! FIRST EPSS (Exploit Prediction Scoring System) client.

use crate::types::EpssScore;
use crate::{Result, ScanError};
use log::debug;
use serde::Deserialize;

pub const API_NAME: &str = "epss";

#[derive(Debug, Deserialize)]
struct EpssResponse {
    #[serde(default)]
    data: Vec<EpssEntry>,
}

// The API serialises both numbers as strings.
#[derive(Debug, Deserialize)]
struct EpssEntry {
    cve: String,
    epss: String,
    percentile: String,
}

/// Score for `cve_id` in an EPSS response body, if present.
pub fn parse_epss_response(body: &str, cve_id: &str) -> Result<Option<EpssScore>> {
    let response: EpssResponse =
        serde_json::from_str(body).map_err(|e| ScanError::Parse(format!("EPSS response: {}", e)))?;

    let entry = match response
        .data
        .into_iter()
        .find(|e| e.cve.eq_ignore_ascii_case(cve_id))
    {
        Some(entry) => entry,
        None => return Ok(None),
    };

    let score = entry
        .epss
        .trim()
        .parse::<f64>()
        .map_err(|e| ScanError::Parse(format!("EPSS score '{}': {}", entry.epss, e)))?;
    let percentile = entry
        .percentile
        .trim()
        .parse::<f64>()
        .map_err(|e| ScanError::Parse(format!("EPSS percentile '{}': {}", entry.percentile, e)))?;

    if !score.is_finite() || !percentile.is_finite() {
        return Err(ScanError::Parse(format!(
            "EPSS values for {} are not finite: '{}', '{}'",
            cve_id, entry.epss, entry.percentile
        )));
    }

    Ok(Some(EpssScore {
        score: score.clamp(0.0, 1.0),
        percentile: percentile.clamp(0.0, 1.0),
    }))
}

pub struct EpssClient {
    client: reqwest::Client,
    base_url: String,
}

impl EpssClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch(&self, cve_id: &str) -> Result<Option<EpssScore>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("cve", cve_id)])
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
        let score = parse_epss_response(&body, cve_id)?;
        if score.is_none() {
            debug!("No EPSS score published for {}", cve_id);
        }
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_encoded_scores() {
        let body = r#"{"status":"OK","status-code":200,"version":"1.0","total":1,
            "data":[{"cve":"CVE-2021-36260","epss":"0.94358","percentile":"0.99917","date":"2024-07-01"}]}"#;
        let score = parse_epss_response(body, "CVE-2021-36260").unwrap().unwrap();
        assert!((score.score - 0.94358).abs() < 1e-9);
        assert!((score.percentile - 0.99917).abs() < 1e-9);
    }

    #[test]
    fn missing_entry_is_none() {
        let body = r#"{"status":"OK","data":[]}"#;
        assert!(parse_epss_response(body, "CVE-2099-0001").unwrap().is_none());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_epss_response("<html>", "CVE-2021-36260"),
            Err(ScanError::Parse(_))
        ));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let nan = r#"{"data":[{"cve":"CVE-2021-36260","epss":"NaN","percentile":"0.5"}]}"#;
        assert!(matches!(parse_epss_response(nan, "CVE-2021-36260"), Err(ScanError::Parse(_))));

        let inf = r#"{"data":[{"cve":"CVE-2021-36260","epss":"0.5","percentile":"inf"}]}"#;
        assert!(matches!(parse_epss_response(inf, "CVE-2021-36260"), Err(ScanError::Parse(_))));
    }
}
