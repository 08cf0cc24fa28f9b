//! Service identification: static port table, banner heuristics and
//! version extraction.

use crate::types::Protocol;
use lazy_static::lazy_static;
use regex::Regex;

/// Ports that usually speak HTTP in clear text.
pub const HTTP_PORTS: &[u16] = &[80, 81, 3000, 5000, 8000, 8008, 8080, 8081, 8888, 9000, 9200];
/// Ports that usually speak HTTP over TLS.
pub const HTTPS_PORTS: &[u16] = &[443, 4443, 8443, 9443];

lazy_static! {
    static ref SERVER_HEADER: Regex = Regex::new(r"(?im)^server:\s*(.+?)\s*$").unwrap();
    static ref FTP_PRODUCT: Regex =
        Regex::new(r"(?i)\b(vsFTPd|ProFTPD|Pure-FTPd|FileZilla Server|Microsoft FTP Service)[ /]*([0-9][\w.\-]*)?").unwrap();
    static ref SMTP_PRODUCT: Regex = Regex::new(r"(?i)\b(Postfix|Exim|Sendmail|Microsoft ESMTP MAIL Service)[ /]*([0-9][\w.\-]*)?").unwrap();
    static ref MYSQL_VERSION: Regex = Regex::new(r"(\d+\.\d+\.\d+[\w.\-]*)").unwrap();
}

/// Well-known service for a port, if any.
pub fn service_for_port(port: u16, protocol: Protocol) -> Option<&'static str> {
    let name = match (protocol, port) {
        (Protocol::Tcp, 21) => "ftp",
        (Protocol::Tcp, 22) => "ssh",
        (Protocol::Tcp, 23) => "telnet",
        (Protocol::Tcp, 25) | (Protocol::Tcp, 587) => "smtp",
        (Protocol::Tcp, 53) | (Protocol::Udp, 53) => "dns",
        (Protocol::Tcp, 80) | (Protocol::Tcp, 8000) | (Protocol::Tcp, 8080) | (Protocol::Tcp, 8008) => "http",
        (Protocol::Tcp, 110) => "pop3",
        (Protocol::Tcp, 111) | (Protocol::Udp, 111) => "rpcbind",
        (Protocol::Tcp, 135) => "msrpc",
        (Protocol::Tcp, 139) => "netbios-ssn",
        (Protocol::Tcp, 143) => "imap",
        (Protocol::Tcp, 389) => "ldap",
        (Protocol::Tcp, 443) | (Protocol::Tcp, 8443) => "https",
        (Protocol::Tcp, 445) => "microsoft-ds",
        (Protocol::Tcp, 465) => "smtps",
        (Protocol::Tcp, 636) => "ldaps",
        (Protocol::Tcp, 873) => "rsync",
        (Protocol::Tcp, 993) => "imaps",
        (Protocol::Tcp, 995) => "pop3s",
        (Protocol::Tcp, 1433) => "mssql",
        (Protocol::Tcp, 1521) => "oracle",
        (Protocol::Tcp, 2049) => "nfs",
        (Protocol::Tcp, 2375) => "docker",
        (Protocol::Tcp, 3306) => "mysql",
        (Protocol::Tcp, 3389) => "rdp",
        (Protocol::Tcp, 5432) => "postgresql",
        (Protocol::Tcp, 5900) => "vnc",
        (Protocol::Tcp, 5984) => "couchdb",
        (Protocol::Tcp, 6379) => "redis",
        (Protocol::Tcp, 8888) => "http-alt",
        (Protocol::Tcp, 9200) => "elasticsearch",
        (Protocol::Tcp, 11211) => "memcached",
        (Protocol::Tcp, 27017) => "mongodb",
        (Protocol::Udp, 67) => "dhcp-server",
        (Protocol::Udp, 69) => "tftp",
        (Protocol::Udp, 123) => "ntp",
        (Protocol::Udp, 161) => "snmp",
        (Protocol::Udp, 514) => "syslog",
        _ => return None,
    };
    Some(name)
}

/// Guess a service from the first bytes it sent.
pub fn identify_from_banner(banner: &str) -> Option<&'static str> {
    let lower = banner.to_ascii_lowercase();

    if banner.starts_with("SSH-") {
        Some("ssh")
    } else if banner.starts_with("HTTP/") {
        Some("http")
    } else if banner.starts_with("RFB ") {
        Some("vnc")
    } else if banner.starts_with("+PONG") || lower.contains("-noauth") || lower.contains("redis") {
        Some("redis")
    } else if banner.starts_with("220") && lower.contains("ftp") {
        Some("ftp")
    } else if banner.starts_with("220") && (lower.contains("smtp") || lower.contains("mail")) {
        Some("smtp")
    } else if banner.starts_with("+OK") {
        Some("pop3")
    } else if banner.starts_with("* OK") {
        Some("imap")
    } else if lower.contains("mysql") || lower.contains("mariadb") {
        Some("mysql")
    } else {
        None
    }
}

/// Extract a product/version string from a banner.
pub fn extract_version(banner: &str, service: &str) -> Option<String> {
    match service {
        // "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5"
        "ssh" => banner.lines().next().and_then(|line| {
            let rest = line.strip_prefix("SSH-")?;
            let software = rest.split_once('-').map(|(_, s)| s).unwrap_or(rest);
            let software = software.split_whitespace().next()?;
            Some(software.replace('_', " "))
        }),
        // "220 (vsFTPd 3.0.3)"
        "ftp" => FTP_PRODUCT.captures(banner).map(|caps| join_product(&caps)),
        "smtp" => SMTP_PRODUCT.captures(banner).map(|caps| join_product(&caps)),
        // "Server: Apache/2.4.41 (Ubuntu)"
        "http" | "https" | "http-alt" => SERVER_HEADER
            .captures(banner)
            .map(|caps| caps[1].to_string()),
        "mysql" => MYSQL_VERSION.captures(banner).map(|caps| caps[1].to_string()),
        _ => None,
    }
}

fn join_product(caps: &regex::Captures<'_>) -> String {
    match caps.get(2) {
        Some(version) => format!("{} {}", &caps[1], version.as_str()),
        None => caps[1].to_string(),
    }
}

/// Whether an open port should be treated as a web endpoint.
pub fn is_web_service(service_name: &str, port: u16) -> bool {
    let name = service_name.to_ascii_lowercase();
    name.contains("http") || HTTP_PORTS.contains(&port) || HTTPS_PORTS.contains(&port)
}

/// Whether a web endpoint should be reached over TLS.
pub fn is_tls_service(service_name: &str, port: u16) -> bool {
    let name = service_name.to_ascii_lowercase();
    name == "https" || name.starts_with("ssl/") || name.contains("https") || HTTPS_PORTS.contains(&port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_lookup() {
        assert_eq!(service_for_port(22, Protocol::Tcp), Some("ssh"));
        assert_eq!(service_for_port(53, Protocol::Udp), Some("dns"));
        assert_eq!(service_for_port(161, Protocol::Tcp), None);
        assert_eq!(service_for_port(40000, Protocol::Tcp), None);
    }

    #[test]
    fn banner_heuristics() {
        assert_eq!(identify_from_banner("SSH-2.0-OpenSSH_8.2p1"), Some("ssh"));
        assert_eq!(identify_from_banner("220 (vsFTPd 3.0.3)"), Some("ftp"));
        assert_eq!(identify_from_banner("220 mail.example.com ESMTP Postfix"), Some("smtp"));
        assert_eq!(identify_from_banner("HTTP/1.1 200 OK\r\nServer: nginx"), Some("http"));
        assert_eq!(identify_from_banner("garbage"), None);
    }

    #[test]
    fn version_extraction() {
        assert_eq!(
            extract_version("SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5", "ssh").as_deref(),
            Some("OpenSSH 8.2p1")
        );
        assert_eq!(
            extract_version("220 (vsFTPd 3.0.3)", "ftp").as_deref(),
            Some("vsFTPd 3.0.3")
        );
        assert_eq!(
            extract_version("HTTP/1.0 200 OK\r\nServer: Apache/2.4.41 (Ubuntu)\r\n", "http").as_deref(),
            Some("Apache/2.4.41 (Ubuntu)")
        );
        assert_eq!(extract_version("hello", "telnet"), None);
    }

    #[test]
    fn web_and_tls_detection() {
        assert!(is_web_service("http", 31337));
        assert!(is_web_service("unknown", 8080));
        assert!(!is_web_service("ssh", 22));
        assert!(is_tls_service("ssl/http", 4444));
        assert!(is_tls_service("unknown", 443));
        assert!(!is_tls_service("http", 80));
    }
}
