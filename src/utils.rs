use crate::types::Target;
use crate::{Result, ScanError};
use log::debug;
use std::net::IpAddr;

/// Network utilities
pub mod network {
    use super::*;

    /// Check if an IP address is valid for scanning
    pub fn is_valid_scan_target(ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(ipv4) => {
                !ipv4.is_unspecified() && !ipv4.is_broadcast() && !ipv4.is_multicast()
            }
            IpAddr::V6(ipv6) => !ipv6.is_unspecified() && !ipv6.is_multicast(),
        }
    }

    /// Strip an optional URL scheme, path and IPv6 brackets from user input.
    pub fn host_from_input(input: &str) -> Result<String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ScanError::InvalidInput("empty target".to_string()));
        }

        if trimmed.contains("://") {
            let parsed = url::Url::parse(trimmed)
                .map_err(|e| ScanError::InvalidInput(format!("{}: {}", trimmed, e)))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| ScanError::InvalidInput(format!("no host in {}", trimmed)))?;
            return Ok(host.trim_matches(|c| c == '[' || c == ']').to_string());
        }

        Ok(trimmed.trim_matches(|c| c == '[' || c == ']').to_string())
    }

    /// Resolve user input to a [`Target`]. IP literals never touch DNS.
    pub async fn resolve_target(input: &str) -> Result<Target> {
        let host = host_from_input(input)?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            if !is_valid_scan_target(&ip) {
                return Err(ScanError::InvalidInput(format!("{} is not a scannable address", ip)));
            }
            return Ok(Target {
                input: host,
                ip,
                hostname: None,
            });
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), 0))
            .await
            .map_err(|e| ScanError::UnresolvableHost(format!("{}: {}", host, e)))?
            .map(|addr| addr.ip())
            .collect();

        let ip = addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ScanError::UnresolvableHost(host.clone()))?;

        debug!("Resolved {} to {}", host, ip);
        Ok(Target {
            input: host.clone(),
            ip,
            hostname: Some(host),
        })
    }
}

/// Progress reporting utilities
pub mod progress {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    pub fn create_spinner(message: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();

        pb.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );

        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }
}

/// Time and formatting utilities
pub mod time {
    use std::time::Duration;

    /// Format duration as human readable string
    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let seconds = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else if secs > 0 {
            format!("{}s", seconds)
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    /// Serde adapter storing a `Duration` as whole milliseconds.
    pub mod duration_ms {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_u64(duration.as_millis() as u64)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
            Ok(Duration::from_millis(u64::deserialize(deserializer)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::network::*;
    use super::time::*;
    use std::time::Duration;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_host_from_input() {
        assert_eq!(host_from_input(" 10.0.0.1 ").unwrap(), "10.0.0.1");
        assert_eq!(host_from_input("https://example.com/login").unwrap(), "example.com");
        assert_eq!(host_from_input("[::1]").unwrap(), "::1");
        assert!(host_from_input("  ").is_err());
    }

    #[test]
    fn test_scan_target_classification() {
        assert!(is_valid_scan_target(&"192.168.1.1".parse().unwrap()));
        assert!(is_valid_scan_target(&"::1".parse().unwrap()));
        assert!(!is_valid_scan_target(&"255.255.255.255".parse().unwrap()));
        assert!(!is_valid_scan_target(&"ff02::1".parse().unwrap()));
        assert!(!is_valid_scan_target(&"0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn test_resolve_ip_literal() {
        let target = tokio_test::block_on(resolve_target("127.0.0.1")).unwrap();
        assert_eq!(target.ip.to_string(), "127.0.0.1");
        assert!(target.hostname.is_none());

        let v6 = tokio_test::block_on(resolve_target("http://[::1]:8080/")).unwrap();
        assert!(v6.ip.is_ipv6());
        assert_eq!(v6.input, "::1");
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let err = resolve_target("does-not-exist.invalid").await.unwrap_err();
        assert!(matches!(err, crate::ScanError::UnresolvableHost(_)));
    }
}
