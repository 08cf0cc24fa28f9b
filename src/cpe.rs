//! CPE (Common Platform Enumeration) parsing.
//!
//! Accepts the 2.3 formatted string
//! (`cpe:2.3:part:vendor:product:version:update:edition:language:...`) and the
//! older 2.2 URI form (`cpe:/part:vendor:product:version:update`). `*` and `-`
//! both mean "unspecified" and become `None`.

use crate::types::{AffectedProduct, CpePart};

/// Split on `:` while honouring `\:` escapes.
fn split_components(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn component(raw: Option<&String>) -> Option<String> {
    match raw.map(|s| s.trim()) {
        None | Some("") | Some("*") | Some("-") => None,
        Some(value) => Some(value.to_string()),
    }
}

fn part(raw: Option<&String>) -> Option<CpePart> {
    match raw.map(|s| s.trim()) {
        Some("a") => Some(CpePart::Application),
        Some("o") => Some(CpePart::OperatingSystem),
        Some("h") => Some(CpePart::Hardware),
        _ => None,
    }
}

/// Parse a CPE string into its platform fields; `None` if it is not a CPE.
pub fn parse_cpe(cpe: &str) -> Option<AffectedProduct> {
    let cpe = cpe.trim();
    let components = if let Some(rest) = cpe.strip_prefix("cpe:2.3:") {
        split_components(rest)
    } else if let Some(rest) = cpe.strip_prefix("cpe:/") {
        split_components(rest)
            .into_iter()
            .map(|c| urlencoding::decode(&c).map(|d| d.into_owned()).unwrap_or(c))
            .collect()
    } else {
        return None;
    };

    let part = part(components.first());
    let vendor = component(components.get(1));
    if part.is_none() && vendor.is_none() {
        return None;
    }

    Some(AffectedProduct {
        cpe: cpe.to_string(),
        part,
        vendor,
        product: component(components.get(2)),
        version: component(components.get(3)),
        update: component(components.get(4)),
        version_start_including: None,
        version_start_excluding: None,
        version_end_including: None,
        version_end_excluding: None,
    })
}
