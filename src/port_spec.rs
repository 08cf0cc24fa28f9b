use crate::{Result, ScanError};
use std::collections::BTreeSet;
use std::fmt;

pub const DEFAULT_PORTS: &str = "1-1000";

/// Normalized port list: ascending, deduplicated, every element in `1..=65535`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSpec {
    ports: Vec<u16>,
}

impl PortSpec {
    /// Parse a range expression such as `"20-25,80,443"`.
    ///
    /// Ports outside `1..=65535` are dropped silently; malformed tokens are an error.
    pub fn parse(expr: &str) -> Result<Self> {
        let mut ports = BTreeSet::new();

        for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                let start = parse_bound(start, part)?;
                let end = parse_bound(end, part)?;
                if start > end {
                    return Err(ScanError::InvalidInput(format!(
                        "Start port cannot be greater than end port: {}",
                        part
                    )));
                }

                let lo = start.max(1);
                let hi = end.min(u16::MAX as u64);
                for port in lo..=hi {
                    ports.insert(port as u16);
                }
            } else {
                let port = parse_bound(part, part)?;
                if (1..=u16::MAX as u64).contains(&port) {
                    ports.insert(port as u16);
                }
            }
        }

        Ok(Self {
            ports: ports.into_iter().collect(),
        })
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Compact expression for external tools: consecutive runs become ranges.
    pub fn to_expression(&self) -> String {
        let mut parts = Vec::new();
        let mut iter = self.ports.iter().copied().peekable();

        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next == end + 1 {
                    end = next;
                    iter.next();
                } else {
                    break;
                }
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }

        parts.join(",")
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_expression())
    }
}

/// Numeric bound; digit strings too long for `u64` saturate so they fall out of range.
fn parse_bound(raw: &str, part: &str) -> Result<u64> {
    let raw = raw.trim();
    match raw.parse::<u64>() {
        Ok(value) => Ok(value),
        Err(_) if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) => Ok(u64::MAX),
        Err(_) => Err(ScanError::InvalidInput(format!(
            "Invalid port specification: {}",
            part
        ))),
    }
}
