//! Risk scoring for enriched vulnerabilities and whole scans.
//!
//! ```text
//! risk = 6 * cvss (0-10)
//!      + 20 * epss (0-1)
//!      + 15 if known exploited
//!      + 5 if no patch is known
//! ```
//!
//! Every term is non-negative and non-decreasing in its input, so the score
//! never drops when CVSS or EPSS rise, or when a CVE becomes known exploited
//! or loses its patch. The maximum is exactly 100.

use crate::types::{CveRecord, Finding, RiskLevel, SeverityCounts};

const CVSS_WEIGHT: f64 = 6.0;
const EPSS_WEIGHT: f64 = 20.0;
const KEV_BONUS: f64 = 15.0;
const NO_PATCH_BONUS: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RiskInputs {
    pub cvss: Option<f32>,
    pub epss: Option<f64>,
    pub known_exploited: bool,
    pub patch_available: bool,
}

impl RiskInputs {
    pub fn from_record(record: &CveRecord) -> Self {
        Self {
            cvss: record.base_score(),
            epss: record.epss.map(|e| e.score),
            known_exploited: record.kev.is_known_exploited,
            patch_available: record.remediation.patch_available,
        }
    }
}

pub fn risk_score(inputs: &RiskInputs) -> u8 {
    let cvss = inputs.cvss.map(f64::from).unwrap_or(0.0).clamp(0.0, 10.0);
    let epss = inputs.epss.unwrap_or(0.0).clamp(0.0, 1.0);

    let mut score = CVSS_WEIGHT * cvss + EPSS_WEIGHT * epss;
    if inputs.known_exploited {
        score += KEV_BONUS;
    }
    if !inputs.patch_available {
        score += NO_PATCH_BONUS;
    }

    score.round().clamp(0.0, 100.0) as u8
}

pub fn record_risk_score(record: &CveRecord) -> u8 {
    risk_score(&RiskInputs::from_record(record))
}

/// Floor implied by the raw severity counts alone.
pub fn severity_baseline(counts: &SeverityCounts) -> u8 {
    if counts.critical > 0 {
        75
    } else if counts.high > 0 {
        50
    } else if counts.medium > 0 {
        30
    } else if counts.low > 0 {
        10
    } else {
        0
    }
}

pub fn risk_level(score: u8) -> RiskLevel {
    match score {
        90..=u8::MAX => RiskLevel::Critical,
        70..=89 => RiskLevel::High,
        40..=69 => RiskLevel::Medium,
        10..=39 => RiskLevel::Low,
        _ => RiskLevel::None,
    }
}

/// Scan-level score: the worst enriched finding, or the severity baseline.
pub fn aggregate_risk(findings: &[Finding], counts: &SeverityCounts) -> u8 {
    let enriched = findings
        .iter()
        .filter_map(|f| f.intelligence.as_ref().map(|i| i.risk_score))
        .max()
        .unwrap_or(0);
    enriched.max(severity_baseline(counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn inputs(cvss: f32, epss: f64, kev: bool, patched: bool) -> RiskInputs {
        RiskInputs {
            cvss: Some(cvss),
            epss: Some(epss),
            known_exploited: kev,
            patch_available: patched,
        }
    }

    #[test]
    fn bounds() {
        assert_eq!(risk_score(&inputs(10.0, 1.0, true, false)), 100);
        assert_eq!(risk_score(&inputs(0.0, 0.0, false, true)), 0);
        assert_eq!(risk_score(&RiskInputs::default()), 5);
        assert_eq!(risk_score(&inputs(42.0, 7.0, true, false)), 100);
    }

    #[test]
    fn monotonic_in_cvss() {
        let mut previous = 0;
        for tenth in 0..=100 {
            let score = risk_score(&inputs(tenth as f32 / 10.0, 0.3, false, true));
            assert!(score >= previous, "score dropped at cvss {}", tenth);
            previous = score;
        }
    }

    #[test]
    fn kev_and_missing_patch_never_lower_the_score() {
        for cvss in [0.0, 4.3, 7.5, 9.8, 10.0] {
            for epss in [0.0, 0.2, 0.97] {
                let base = risk_score(&inputs(cvss, epss, false, true));
                assert!(risk_score(&inputs(cvss, epss, true, true)) >= base);
                assert!(risk_score(&inputs(cvss, epss, false, false)) >= base);
            }
        }
    }

    #[test]
    fn record_uses_v2_only_without_v3() {
        let mut record = CveRecord::new("CVE-2010-0001");
        record.cvss_v2 = Some(crate::types::CvssScore {
            base_score: 5.0,
            severity: None,
            vector: None,
        });
        record.remediation.patch_available = true;
        assert_eq!(record_risk_score(&record), 30);

        record.cvss_v3 = Some(crate::types::CvssScore {
            base_score: 9.0,
            severity: None,
            vector: None,
        });
        assert_eq!(record_risk_score(&record), 54);
    }

    #[test]
    fn tiers() {
        assert_eq!(risk_level(0), RiskLevel::None);
        assert_eq!(risk_level(10), RiskLevel::Low);
        assert_eq!(risk_level(40), RiskLevel::Medium);
        assert_eq!(risk_level(75), RiskLevel::High);
        assert_eq!(risk_level(100), RiskLevel::Critical);
    }

    #[test]
    fn critical_finding_lifts_scan_to_high() {
        let mut counts = SeverityCounts::default();
        counts.add(Severity::Critical);
        let score = aggregate_risk(&[], &counts);
        assert!(risk_level(score) >= RiskLevel::High);
    }
}
