use crate::types::{CveRecord, Finding, OpenPort, RiskLevel, ScanResult, Severity, SeverityCounts};
use crate::utils::time::format_duration;
use colored::*;

/// Coloured terminal output for scan results.
pub struct DisplayManager {
    use_colors: bool,
    quiet_mode: bool,
}

impl DisplayManager {
    pub fn new() -> Self {
        Self::with_quiet(false)
    }

    pub fn with_quiet(quiet: bool) -> Self {
        let use_colors = std::env::var("NO_COLOR").is_err()
            && std::env::var("TERM").map_or(true, |term| term != "dumb");

        Self {
            use_colors,
            quiet_mode: quiet,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet_mode
    }

    pub fn print_finding(&self, finding: &Finding) {
        if self.quiet_mode {
            return;
        }

        let label = format!("[{}]", finding.severity.as_str().to_uppercase());
        if self.use_colors {
            println!(
                "  {} {} {}",
                label.color(severity_color(finding.severity)).bold(),
                finding.name.bright_white().bold(),
                format!("({})", finding.template_id).bright_black()
            );
            println!("    └─ {}", finding.matched_location.cyan());
        } else {
            println!("  {} {} ({})", label, finding.name, finding.template_id);
            println!("    Location: {}", finding.matched_location);
        }

        if let Some(cve) = finding.cve() {
            let mut parts = vec![cve.to_string()];
            if let Some(intel) = &finding.intelligence {
                if let Some(score) = intel.base_score() {
                    parts.push(format!("CVSS {:.1}", score));
                }
                if let Some(epss) = intel.epss {
                    parts.push(format!("EPSS {:.1}%", epss.score * 100.0));
                }
                if intel.kev.is_known_exploited {
                    parts.push("KEV".to_string());
                }
                parts.push(format!("risk {}", intel.risk_score));
            }
            let line = parts.join(" | ");
            if self.use_colors {
                println!("    └─ {}", line.bright_black());
            } else {
                println!("    Intel: {}", line);
            }
        }

        if let Some(data) = &finding.extracted_data {
            if !data.is_empty() {
                println!("    └─ Extracted: {}", data.join(", ").truncate_with_ellipsis(120));
            }
        }
    }

    pub fn print_port_results(&self, target: &str, open_ports: &[OpenPort]) {
        if self.quiet_mode {
            return;
        }

        if open_ports.is_empty() {
            if self.use_colors {
                println!("  {} {} - {}", "•".bright_black(), target.cyan(), "No open ports".bright_black());
            } else {
                println!("  • {} - No open ports", target);
            }
            return;
        }

        if self.use_colors {
            println!(
                "  {} {} → {} ports",
                "•".bright_green().bold(),
                target.cyan().bold(),
                open_ports.len().to_string().yellow().bold()
            );
        } else {
            println!("  • {} → {} ports", target, open_ports.len());
        }

        for port in open_ports {
            let version = port
                .version
                .as_ref()
                .map(|v| format!(" {}", v))
                .unwrap_or_default();
            let label = format!("{}/{}", port.port, port.protocol);
            if self.use_colors {
                println!(
                    "    {} {:<10} {}{}",
                    "→".bright_green(),
                    label.yellow(),
                    port.service_name.white(),
                    version.bright_black()
                );
            } else {
                println!("    → {:<10} {}{}", label, port.service_name, version);
            }
        }
    }

    pub fn print_scan_summary(&self, result: &ScanResult) {
        if self.quiet_mode {
            return;
        }

        println!();
        self.print_section_header("SCAN SUMMARY");
        let rows = [
            ("Target", format!("{} ({})", result.target.input, result.target.ip)),
            ("Port scan", result.scan_method.to_string()),
            (
                "Template scan",
                result
                    .template_scan_method
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "skipped".into()),
            ),
            ("Open ports", result.open_ports.len().to_string()),
            ("Findings", result.findings.len().to_string()),
            ("Duration", format_duration(result.duration)),
        ];
        for (name, value) in rows {
            if self.use_colors {
                println!("  {:<14} {}", name.bright_white().bold(), value.cyan());
            } else {
                println!("  {:<14} {}", name, value);
            }
        }

        if let Some(os) = &result.os_guess {
            let accuracy = os.accuracy.map(|a| format!(" ({}%)", a)).unwrap_or_default();
            println!("  {:<14} {}{}", "OS", os.name, accuracy);
        }

        let risk = format!("{}/100 ({})", result.risk_score, result.risk_level);
        if self.use_colors {
            println!(
                "  {:<14} {}",
                "Risk".bright_white().bold(),
                risk.color(risk_color(result.risk_level)).bold()
            );
        } else {
            println!("  {:<14} {}", "Risk", risk);
        }

        println!();
        self.print_severity_table(&result.counts_by_severity);

        for warning in &result.warnings {
            self.print_warning(warning);
        }
    }

    fn print_severity_table(&self, counts: &SeverityCounts) {
        if counts.total() == 0 {
            self.print_success("No vulnerabilities found");
            return;
        }

        println!("  ┌──────────┬───────┐");
        println!("  │ Severity │ Count │");
        println!("  ├──────────┼───────┤");
        for severity in Severity::ALL.iter() {
            let count = counts.get(*severity);
            if count == 0 {
                continue;
            }
            let name = format!("{:<8}", severity.as_str());
            let count = format!("{:>5}", count);
            if self.use_colors {
                let color = severity_color(*severity);
                println!("  │ {} │ {} │", name.color(color).bold(), count.color(color).bold());
            } else {
                println!("  │ {} │ {} │", name, count);
            }
        }
        println!("  └──────────┴───────┘");
    }

    pub fn print_cve_record(&self, record: &CveRecord) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", record.id.bright_white().bold(), format!("risk {}", record.risk_score).bright_black());
        } else {
            println!("  {} (risk {})", record.id, record.risk_score);
        }
        println!("    {}", record.description.truncate_with_ellipsis(200));

        if let Some(cvss) = record.cvss_v3.as_ref().or(record.cvss_v2.as_ref()) {
            let score = format!("{:.1}", cvss.base_score);
            let vector = cvss.vector.clone().unwrap_or_default();
            if self.use_colors {
                println!("    CVSS {} {}", score.color(cvss_color(cvss.base_score)).bold(), vector.bright_black());
            } else {
                println!("    CVSS {} {}", score, vector);
            }
        }
        if let Some(epss) = record.epss {
            println!(
                "    EPSS {:.2}% (percentile {:.1})",
                epss.score * 100.0,
                epss.percentile * 100.0
            );
        }
        if record.kev.is_known_exploited {
            let due = record.kev.due_date.as_deref().unwrap_or("n/a");
            let line = format!("Known exploited (due {})", due);
            if self.use_colors {
                println!("    {}", line.bright_red().bold());
            } else {
                println!("    {}", line);
            }
        }
        if !record.categories.is_empty() {
            println!("    Categories: {}", record.categories.join(", "));
        } else if !record.weaknesses.is_empty() {
            println!("    Weaknesses: {}", record.weaknesses.join(", "));
        }
        match &record.remediation.patch_url {
            Some(url) => println!("    Patch: {}", url),
            None if !record.remediation.patch_available => println!("    Patch: none known"),
            None => {}
        }
        println!();
    }

    pub fn print_section_header(&self, title: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("{}", title.bright_cyan().bold());
            println!("{}", "─".repeat(title.chars().count()).bright_cyan());
        } else {
            println!("{}", title);
            println!("{}", "=".repeat(title.chars().count()));
        }
    }

    pub fn print_success(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "✓".bright_green().bold(), message.green());
        } else {
            println!("[✓] {}", message);
        }
    }

    pub fn print_warning(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "!".bright_yellow().bold(), message.yellow());
        } else {
            println!("[!] {}", message);
        }
    }

    /// Errors are printed even in quiet mode.
    pub fn print_error(&self, message: &str) {
        if self.use_colors {
            eprintln!("  {} {}", "✗".bright_red().bold(), message.red().bold());
        } else {
            eprintln!("[✗] {}", message);
        }
    }

    pub fn print_info(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "i".bright_blue().bold(), message.blue());
        } else {
            println!("[i] {}", message);
        }
    }

    pub fn print_banner(&self, title: &str, subtitle: Option<&str>) {
        if self.quiet_mode {
            return;
        }

        let width = title.chars().count();
        if self.use_colors {
            println!();
            println!("  {}", "┌─".bright_cyan().to_string() + &"─".repeat(width + 2) + "─┐");
            println!("  {} {} {}", "│".bright_cyan(), title.bright_white().bold(), "│".bright_cyan());
            if let Some(sub) = subtitle {
                println!(
                    "  {} {} {}",
                    "│".bright_cyan(),
                    format!("{:^width$}", sub, width = width).bright_black(),
                    "│".bright_cyan()
                );
            }
            println!("  {}", "└─".bright_cyan().to_string() + &"─".repeat(width + 2) + "─┘");
            println!();
        } else {
            let border = "=".repeat(width + 4);
            println!("\n{}", border);
            println!("  {}  ", title);
            if let Some(sub) = subtitle {
                println!("  {}  ", sub);
            }
            println!("{}\n", border);
        }
    }
}

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new()
    }
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Critical => Color::BrightRed,
        Severity::High => Color::Red,
        Severity::Medium => Color::Yellow,
        Severity::Low => Color::Green,
        Severity::Info => Color::Blue,
    }
}

fn risk_color(level: RiskLevel) -> Color {
    match level {
        RiskLevel::Critical => Color::BrightRed,
        RiskLevel::High => Color::Red,
        RiskLevel::Medium => Color::Yellow,
        RiskLevel::Low => Color::Green,
        RiskLevel::None => Color::BrightBlack,
    }
}

fn cvss_color(cvss: f32) -> Color {
    match cvss {
        score if score >= 9.0 => Color::BrightRed,
        score if score >= 7.0 => Color::Red,
        score if score >= 4.0 => Color::Yellow,
        _ => Color::Green,
    }
}

trait StringExt {
    fn truncate_with_ellipsis(&self, max_chars: usize) -> String;
}

impl StringExt for str {
    fn truncate_with_ellipsis(&self, max_chars: usize) -> String {
        if self.chars().count() <= max_chars {
            self.to_string()
        } else {
            let kept: String = self.chars().take(max_chars.saturating_sub(3)).collect();
            format!("{}...", kept)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!("short".truncate_with_ellipsis(10), "short");
        assert_eq!("ümlautümlaut".truncate_with_ellipsis(8), "ümlau...");
    }

    #[test]
    fn cvss_colour_bands() {
        assert_eq!(cvss_color(9.8), Color::BrightRed);
        assert_eq!(cvss_color(7.5), Color::Red);
        assert_eq!(cvss_color(5.3), Color::Yellow);
        assert_eq!(cvss_color(2.1), Color::Green);
    }
}
