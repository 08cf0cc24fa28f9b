use chrono::{Duration, Utc};
use hostscan::{
    cache::VulnerabilityCache,
    config::Config,
    intel::VulnerabilityIntelligence,
    rate_limit::RateLimiter,
    types::{Classification, CveRecord, Finding, Severity},
    ScanError,
};
use mockito::{Matcher, Mock, ServerGuard};
use std::sync::Arc;

const NVD_BODY: &str = include_str!("fixtures/nvd_cve_2021_36260.json");
const EPSS_BODY: &str = include_str!("fixtures/epss_cve_2021_36260.json");
const KEV_BODY: &str = include_str!("fixtures/kev_catalog.json");
const CVE: &str = "CVE-2021-36260";

fn config_for(server: &ServerGuard) -> Config {
    let mut config = Config::default();
    config.intel.nvd_url = format!("{}/rest/json/cves/2.0", server.url());
    config.intel.epss_url = format!("{}/data/v1/epss", server.url());
    config.intel.kev_url = format!("{}/kev.json", server.url());
    config.intel.nvd_interval_ms = 10;
    config.intel.nvd_keyed_interval_ms = 10;
    config.intel.epss_interval_ms = 10;
    config
}

async fn nvd_mock(server: &mut ServerGuard, cve: &str, status: usize, body: &str, hits: usize) -> Mock {
    server
        .mock("GET", "/rest/json/cves/2.0")
        .match_query(Matcher::UrlEncoded("cveId".into(), cve.into()))
        .with_status(status)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect(hits)
        .create_async()
        .await
}

async fn epss_mock(server: &mut ServerGuard, status: usize, body: &str, hits: usize) -> Mock {
    server
        .mock("GET", "/data/v1/epss")
        .match_query(Matcher::UrlEncoded("cve".into(), CVE.into()))
        .with_status(status)
        .with_body(body)
        .expect(hits)
        .create_async()
        .await
}

async fn kev_mock(server: &mut ServerGuard, hits: usize) -> Mock {
    server
        .mock("GET", "/kev.json")
        .with_status(200)
        .with_body(KEV_BODY)
        .expect(hits)
        .create_async()
        .await
}

fn finding_with_cve(id: &str, cve: Option<&str>) -> Finding {
    Finding {
        template_id: id.to_string(),
        name: id.to_string(),
        severity: Severity::Critical,
        target: "http://192.0.2.10".into(),
        matched_location: "http://192.0.2.10/SDK/webLanguage".into(),
        description: String::new(),
        references: Vec::new(),
        classification: Classification {
            cve: cve.map(str::to_string),
            cwe: None,
        },
        extracted_data: None,
        tags: Vec::new(),
        intelligence: None,
    }
}

#[tokio::test]
async fn cache_miss_fetches_each_source_once() {
    let mut server = mockito::Server::new_async().await;
    let nvd = nvd_mock(&mut server, CVE, 200, NVD_BODY, 1).await;
    let epss = epss_mock(&mut server, 200, EPSS_BODY, 1).await;
    let kev = kev_mock(&mut server, 1).await;

    let intel = VulnerabilityIntelligence::new(&config_for(&server)).unwrap();
    let mut findings = vec![finding_with_cve("CVE-2021-36260", Some(CVE))];
    let warnings = intel.enrich(&mut findings).await;

    assert!(warnings.is_empty(), "{:?}", warnings);
    let record = findings[0].intelligence.as_ref().expect("finding enriched");
    assert_eq!(record.cvss_v3.as_ref().unwrap().base_score, 9.8);
    assert!((record.epss.unwrap().score - 0.94358).abs() < 1e-9);
    assert!(record.kev.is_known_exploited);
    assert_eq!(record.kev.due_date.as_deref(), Some("2022-01-24"));
    assert_eq!(record.categories, vec!["OS Command Injection"]);
    assert!(record.remediation.patch_available);
    assert!(record.risk_score <= 100);
    assert_eq!(record.risk_score, 93);

    // a second lookup is served from the cache
    assert!(intel.lookup(CVE).await.unwrap().is_some());
    assert_eq!(intel.cache().observation(CVE).unwrap().lookups, 1);

    nvd.assert_async().await;
    epss.assert_async().await;
    kev.assert_async().await;
}

#[tokio::test]
async fn stale_entry_is_refetched_once() {
    let mut server = mockito::Server::new_async().await;
    let nvd = nvd_mock(&mut server, CVE, 200, NVD_BODY, 1).await;
    let _epss = epss_mock(&mut server, 200, EPSS_BODY, 1).await;
    let _kev = kev_mock(&mut server, 1).await;

    let config = config_for(&server);
    let cache = Arc::new(VulnerabilityCache::new(config.intel.cache_ttl()));
    let mut stale = CveRecord::new(CVE);
    stale.description = "stale".into();
    stale.expires_at = Utc::now() - Duration::hours(1);
    cache.upsert(stale);

    let limiter = Arc::new(RateLimiter::new(std::time::Duration::from_millis(10)));
    let intel = VulnerabilityIntelligence::with_shared(&config, Arc::clone(&cache), limiter).unwrap();

    let before = Utc::now();
    let record = intel.lookup(CVE).await.unwrap().unwrap();
    assert!(record.description.starts_with("A command injection"));

    let expected = before + Duration::hours(24);
    assert!(record.expires_at >= expected);
    assert!(record.expires_at <= Utc::now() + Duration::hours(24));

    // fresh now, no further fetch
    intel.lookup(CVE).await.unwrap();
    nvd.assert_async().await;
    assert_eq!(cache.peek(CVE).unwrap().expires_at, record.expires_at);
}

#[tokio::test]
async fn unknown_cve_is_not_found_and_not_cached() {
    let mut server = mockito::Server::new_async().await;
    let nvd = nvd_mock(&mut server, "CVE-2099-0001", 404, "", 1).await;
    let epss = epss_mock(&mut server, 200, EPSS_BODY, 0).await;

    let intel = VulnerabilityIntelligence::new(&config_for(&server)).unwrap();
    assert!(intel.lookup("cve-2099-0001").await.unwrap().is_none());
    assert!(intel.cache().is_empty());

    nvd.assert_async().await;
    epss.assert_async().await;
}

#[tokio::test]
async fn epss_failure_degrades_gracefully() {
    let mut server = mockito::Server::new_async().await;
    let _nvd = nvd_mock(&mut server, CVE, 200, NVD_BODY, 1).await;
    let _epss = epss_mock(&mut server, 500, "upstream error", 1).await;
    let _kev = kev_mock(&mut server, 1).await;

    let intel = VulnerabilityIntelligence::new(&config_for(&server)).unwrap();
    let record = intel.lookup(CVE).await.unwrap().unwrap();

    assert!(record.epss.is_none());
    assert!(record.kev.is_known_exploited);
    assert!(record.risk_score > 0);
}

#[tokio::test]
async fn primary_database_failure_becomes_a_warning() {
    let mut server = mockito::Server::new_async().await;
    let _nvd = nvd_mock(&mut server, CVE, 503, "unavailable", 2).await;

    let intel = VulnerabilityIntelligence::new(&config_for(&server)).unwrap();
    assert!(matches!(intel.lookup(CVE).await, Err(ScanError::ExternalApi { .. })));

    let mut findings = vec![finding_with_cve("hik", Some(CVE))];
    let warnings = intel.enrich(&mut findings).await;
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains(CVE));
    assert!(findings[0].intelligence.is_none());
}

#[tokio::test]
async fn enrich_deduplicates_identifiers() {
    let mut server = mockito::Server::new_async().await;
    let nvd = nvd_mock(&mut server, CVE, 200, NVD_BODY, 1).await;
    let _epss = epss_mock(&mut server, 200, EPSS_BODY, 1).await;
    let _kev = kev_mock(&mut server, 1).await;

    let intel = VulnerabilityIntelligence::new(&config_for(&server)).unwrap();
    let mut findings = vec![
        finding_with_cve("hik-a", Some(CVE)),
        finding_with_cve("hik-b", Some("cve-2021-36260")),
        finding_with_cve("no-cve", None),
    ];
    let warnings = intel.enrich(&mut findings).await;

    assert!(warnings.is_empty());
    assert!(findings[0].intelligence.is_some());
    assert!(findings[1].intelligence.is_some());
    assert!(findings[2].intelligence.is_none());
    nvd.assert_async().await;
}

#[tokio::test]
async fn keyword_search_is_not_cached() {
    let mut server = mockito::Server::new_async().await;
    let search = server
        .mock("GET", "/rest/json/cves/2.0")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("keywordSearch".into(), "hikvision".into()),
            Matcher::UrlEncoded("resultsPerPage".into(), "5".into()),
        ]))
        .with_status(200)
        .with_body(NVD_BODY)
        .expect(1)
        .create_async()
        .await;

    let intel = VulnerabilityIntelligence::new(&config_for(&server)).unwrap();
    let records = intel.search("hikvision", 5).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, CVE);
    assert_eq!(records[0].categories, vec!["OS Command Injection"]);
    assert!(intel.cache().is_empty());
    search.assert_async().await;
}

#[tokio::test]
async fn api_key_is_sent_as_header() {
    let mut server = mockito::Server::new_async().await;
    let nvd = server
        .mock("GET", "/rest/json/cves/2.0")
        .match_query(Matcher::UrlEncoded("cveId".into(), CVE.into()))
        .match_header("apiKey", "test-key")
        .with_status(200)
        .with_body(NVD_BODY)
        .expect(1)
        .create_async()
        .await;
    let _epss = epss_mock(&mut server, 200, EPSS_BODY, 1).await;
    let _kev = kev_mock(&mut server, 1).await;

    let mut config = config_for(&server);
    config.intel.nvd_api_key = Some("test-key".into());
    let intel = VulnerabilityIntelligence::new(&config).unwrap();
    assert!(intel.lookup(CVE).await.unwrap().is_some());
    nvd.assert_async().await;
}
