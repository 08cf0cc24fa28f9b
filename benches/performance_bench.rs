use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hostscan::nmap_output::parse_nmap_xml;
use hostscan::port_spec::PortSpec;
use hostscan::risk::{risk_score, RiskInputs};
use hostscan::vuln_scan::parse_engine_output;
use std::net::IpAddr;
use std::str::FromStr;

fn nmap_report(ports: u16) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0"?><nmaprun><host><address addr="10.0.0.5" addrtype="ipv4"/><ports>"#,
    );
    for port in 1..=ports {
        xml.push_str(&format!(
            r#"<port protocol="tcp" portid="{}"><state state="open" reason="syn-ack"/><service name="http" product="nginx" version="1.25.{}"/></port>"#,
            port,
            port % 10
        ));
    }
    xml.push_str("</ports></host></nmaprun>");
    xml
}

fn port_spec_benchmark(c: &mut Criterion) {
    c.bench_function("port_spec_full_range", |b| {
        b.iter(|| PortSpec::parse(black_box("1-65535")).map(|s| s.len()))
    });

    c.bench_function("port_spec_mixed", |b| {
        b.iter(|| PortSpec::parse(black_box("21-23,25,53,80,110-143,443,445,3306,3389,8000-8100")))
    });
}

fn parser_benchmark(c: &mut Criterion) {
    let strict = nmap_report(500);
    c.bench_function("nmap_xml_primary", |b| b.iter(|| parse_nmap_xml(black_box(&strict))));

    // attribute order swapped so only the loose pattern matches
    let loose = strict.replace(r#"protocol="tcp" portid="#, r#"portid="#);
    c.bench_function("nmap_xml_secondary", |b| b.iter(|| parse_nmap_xml(black_box(&loose))));

    let line = r#"{"template-id":"CVE-2021-36260","info":{"name":"Hikvision RCE","severity":"critical","tags":"cve,rce","classification":{"cve-id":["CVE-2021-36260"]}},"host":"http://10.0.0.5","matched-at":"http://10.0.0.5/SDK/webLanguage"}"#;
    let stream = vec![line; 200].join("\n");
    c.bench_function("engine_jsonl_200", |b| b.iter(|| parse_engine_output(black_box(&stream))));
}

fn risk_benchmark(c: &mut Criterion) {
    let inputs = RiskInputs {
        cvss: Some(9.8),
        epss: Some(0.94358),
        known_exploited: true,
        patch_available: true,
    };
    c.bench_function("risk_score", |b| b.iter(|| risk_score(black_box(&inputs))));
}

fn network_utils_benchmark(c: &mut Criterion) {
    use hostscan::utils::network::*;

    let ip = IpAddr::from_str("192.168.1.1").unwrap();

    c.bench_function("is_valid_scan_target", |b| {
        b.iter(|| is_valid_scan_target(&black_box(ip)))
    });

    c.bench_function("host_from_input", |b| {
        b.iter(|| host_from_input(black_box("https://[2001:db8::1]:8443/admin")))
    });
}

criterion_group!(
    benches,
    port_spec_benchmark,
    parser_benchmark,
    risk_benchmark,
    network_utils_benchmark
);
criterion_main!(benches);
