//! Best-effort parser for the port-scan tool's XML report (`-oX -`).
//!
//! Parsing is pure and tolerant: a strict pattern is tried first and a looser
//! per-element pattern takes over when the strict one yields no ports, which
//! covers reordered attributes and reports truncated by a killed process.

use crate::types::{OsGuess, Protocol};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;

lazy_static! {
    static ref PRIMARY_PORT: Regex = Regex::new(
        r#"<port protocol="(tcp|udp)" portid="(\d+)">\s*<state state="([^"]+)"[^>]*/>(?:\s*<service\s+([^>]*?)/?>)?"#
    )
    .unwrap();
    static ref LOOSE_PORT_START: Regex = Regex::new(r"<port\b").unwrap();
    static ref LOOSE_STATE: Regex = Regex::new(r#"<state\b[^>]*?\bstate="([^"]+)""#).unwrap();
    static ref LOOSE_SERVICE: Regex = Regex::new(r"<service\b([^>]*)").unwrap();
    static ref ADDRESS: Regex = Regex::new(r"<address\b([^>]*)").unwrap();
    static ref HOSTNAME: Regex = Regex::new(r#"<hostname\b[^>]*?\bname="([^"]+)""#).unwrap();
    static ref OS_MATCH: Regex = Regex::new(r"<osmatch\b([^>]*)").unwrap();
    // closing quote optional so a truncated final attribute still parses
    static ref ATTRIBUTE: Regex = Regex::new(r#"([\w\-]+)="([^"]*)(?:"|$)"#).unwrap();
}

/// Which pattern produced the port records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    Primary,
    Secondary,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NmapPort {
    pub protocol: Protocol,
    pub port: u16,
    pub state: String,
    pub service: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NmapReport {
    pub address: Option<IpAddr>,
    pub hostname: Option<String>,
    /// Only ports whose state is exactly `open`.
    pub ports: Vec<NmapPort>,
    pub os_guess: Option<OsGuess>,
    pub tier: ParseTier,
}

pub fn parse_nmap_xml(xml: &str) -> NmapReport {
    let mut tier = ParseTier::Primary;
    let mut ports = parse_primary(xml);
    if ports.is_empty() {
        ports = parse_secondary(xml);
        tier = if ports.is_empty() {
            ParseTier::Empty
        } else {
            ParseTier::Secondary
        };
    }

    ports.retain(|p| p.state == "open");
    ports.sort_by_key(|p| (p.port, p.protocol == Protocol::Udp));
    ports.dedup_by_key(|p| (p.port, p.protocol));

    NmapReport {
        address: parse_address(xml),
        hostname: HOSTNAME.captures(xml).map(|c| decode_entities(&c[1])),
        ports,
        os_guess: parse_os(xml),
        tier,
    }
}

fn parse_primary(xml: &str) -> Vec<NmapPort> {
    PRIMARY_PORT
        .captures_iter(xml)
        .filter_map(|caps| {
            let port = caps[2].parse::<u16>().ok()?;
            let service = caps.get(4).map(|m| attributes(m.as_str()));
            Some(build_port(&caps[1], port, &caps[3], service.as_ref()))
        })
        .collect()
}

fn parse_secondary(xml: &str) -> Vec<NmapPort> {
    let starts: Vec<usize> = LOOSE_PORT_START.find_iter(xml).map(|m| m.start()).collect();
    let mut ports = Vec::new();

    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(xml.len());
        let chunk = &xml[start..end];

        let tag_end = chunk.find('>').unwrap_or(chunk.len());
        let port_attrs = attributes(&chunk[..tag_end]);
        let port = match port_attrs.get("portid").and_then(|p| p.parse::<u16>().ok()) {
            Some(port) => port,
            None => continue,
        };
        let state = match LOOSE_STATE.captures(chunk) {
            Some(caps) => caps[1].to_string(),
            None => continue,
        };
        let protocol = port_attrs.get("protocol").map(String::as_str).unwrap_or("tcp");
        let service = LOOSE_SERVICE.captures(chunk).map(|c| attributes(&c[1]));

        ports.push(build_port(protocol, port, &state, service.as_ref()));
    }

    ports
}

fn build_port(
    protocol: &str,
    port: u16,
    state: &str,
    service: Option<&HashMap<String, String>>,
) -> NmapPort {
    let protocol = if protocol.eq_ignore_ascii_case("udp") {
        Protocol::Udp
    } else {
        Protocol::Tcp
    };

    let (name, version) = match service {
        Some(attrs) => {
            let name = attrs.get("name").filter(|n| !n.is_empty()).cloned();
            let version = [attrs.get("product"), attrs.get("version")]
                .into_iter()
                .flatten()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            (name, Some(version).filter(|v| !v.is_empty()))
        }
        None => (None, None),
    };

    NmapPort {
        protocol,
        port,
        state: state.to_string(),
        service: name,
        version,
    }
}

fn parse_address(xml: &str) -> Option<IpAddr> {
    ADDRESS.captures_iter(xml).find_map(|caps| {
        let attrs = attributes(&caps[1]);
        match attrs.get("addrtype").map(String::as_str) {
            Some("ipv4") | Some("ipv6") => attrs.get("addr")?.parse().ok(),
            _ => None,
        }
    })
}

fn parse_os(xml: &str) -> Option<OsGuess> {
    let caps = OS_MATCH.captures(xml)?;
    let attrs = attributes(&caps[1]);
    Some(OsGuess {
        name: attrs.get("name")?.clone(),
        accuracy: attrs.get("accuracy").and_then(|a| a.parse().ok()),
    })
}

fn attributes(fragment: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(fragment)
        .map(|caps| (caps[1].to_string(), decode_entities(&caps[2])))
        .collect()
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
