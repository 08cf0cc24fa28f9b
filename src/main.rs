use clap::Parser;
use env_logger::Env;
use hostscan::{
    cli::{Cli, Commands, OutputArgs, PortArgs, RunArgs, TemplateArgs},
    config::Config,
    display::DisplayManager,
    intel::VulnerabilityIntelligence,
    orchestrator::{ScanOptions, ScanOrchestrator},
    reporting::ReportGenerator,
    types::ScanResult,
    utils::{network::resolve_target, progress::create_spinner},
    vuln_scan::TemplateVulnerabilityScanner,
    Result, ScanError,
};
use log::{debug, warn};
use std::process;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    let display = DisplayManager::with_quiet(cli.quiet);
    display.print_banner("hostscan", Some("Authorized Testing Only"));

    let config = load_config(&cli, &display);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping scan");
                cancel.cancel();
            }
        });
    }

    let start_time = Instant::now();
    let result = match &cli.command {
        Commands::PortScan { target, ports, run } => {
            execute_port_scan(config, &display, target, ports, run, cancel).await
        }
        Commands::VulnScan { target, templates, run } => {
            execute_vuln_scan(config, &display, target, templates, run, cancel).await
        }
        Commands::Cve { ids, output } => execute_cve_lookup(config, &display, ids, output).await,
        Commands::CveSearch { keyword, limit } => {
            execute_cve_search(config, &display, keyword, *limit).await
        }
        Commands::FullScan {
            target,
            ports,
            templates,
            skip_enrichment,
            skip_templates,
            run,
        } => {
            let options = ScanOptions {
                ports: ports.to_options(),
                templates: templates.to_options(),
                skip_templates: *skip_templates,
                skip_enrichment: *skip_enrichment,
                deadline_ms: run.deadline_ms(),
            };
            execute_full_scan(config, &display, target, options, run, cancel).await
        }
    };

    match result {
        Ok(()) => {
            display.print_success(&format!(
                "Completed in {}",
                hostscan::utils::time::format_duration(start_time.elapsed())
            ));
        }
        Err(ScanError::Cancelled { reason, .. }) => {
            display.print_warning(&format!("Scan stopped early: {}", reason));
            process::exit(130);
        }
        Err(e) => {
            display.print_error(&format!("Scan failed: {}", e));
            process::exit(1);
        }
    }
}

fn load_config(cli: &Cli, display: &DisplayManager) -> Config {
    match &cli.config {
        Some(path) => match Config::load_from_file(&path.to_string_lossy()) {
            Ok(config) => {
                display.print_success(&format!("Loaded configuration from {}", path.display()));
                config
            }
            Err(e) => {
                display.print_warning(&format!("Failed to load configuration: {}, using defaults", e));
                Config::default()
            }
        },
        None => Config::from_env().unwrap_or_else(|e| {
            debug!("Ignoring environment configuration: {}", e);
            Config::default()
        }),
    }
}

/// Apply `--no-external` and the output flags; returns whether reports were requested.
fn apply_run_args(config: &mut Config, run: &RunArgs) -> bool {
    if run.no_external {
        config.port_scan.use_external = false;
        config.template_scan.use_external = false;
    }
    apply_output_args(config, &run.output)
}

fn apply_output_args(config: &mut Config, output: &OutputArgs) -> bool {
    if let Some(dir) = &output.output {
        config.reporting.output_dir = dir.clone();
    }
    if !output.format.is_empty() {
        config.reporting.formats = output.format.iter().map(|f| (*f).into()).collect();
    }
    output.output.is_some() || !output.format.is_empty()
}

async fn execute_port_scan(
    mut config: Config,
    display: &DisplayManager,
    target: &str,
    ports: &PortArgs,
    run: &RunArgs,
    cancel: CancellationToken,
) -> Result<()> {
    display.print_section_header("PORT SCAN");
    let write_reports = apply_run_args(&mut config, run);

    let options = ScanOptions {
        ports: ports.to_options(),
        skip_templates: true,
        skip_enrichment: true,
        deadline_ms: run.deadline_ms(),
        ..ScanOptions::default()
    };
    let result = run_orchestrated(config.clone(), display, target, &options, cancel).await?;

    display.print_port_results(&result.target.ip.to_string(), &result.open_ports);
    display.print_scan_summary(&result);
    if write_reports {
        write_scan_reports(config, display, &result).await?;
    }
    Ok(())
}

async fn execute_vuln_scan(
    mut config: Config,
    display: &DisplayManager,
    target: &str,
    templates: &TemplateArgs,
    run: &RunArgs,
    cancel: CancellationToken,
) -> Result<()> {
    display.print_section_header("VULNERABILITY SCAN");
    let write_reports = apply_run_args(&mut config, run);

    let target = resolve_target(target).await?;
    let scanner = TemplateVulnerabilityScanner::new(config.clone())?;
    let intel = VulnerabilityIntelligence::new(&config)?;

    let token = cancel.child_token();
    let deadline = run.deadline.map(|seconds| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
            token.cancel();
        })
    });

    let mode = scanner.select_mode().await;
    display.print_info(&format!("Scanning {} ({})", target.input, mode.method()));
    let spinner = (!display.is_quiet()).then(|| create_spinner("Running templates..."));
    let report = scanner
        .scan_with_context(&target, None, &templates.to_options(), &mode, &token)
        .await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    if let Some(deadline) = deadline {
        deadline.abort();
    }
    let mut report = report?;

    let warnings = intel.enrich(&mut report.findings).await;
    for warning in report.warnings.iter().chain(warnings.iter()) {
        display.print_warning(warning);
    }

    if report.findings.is_empty() {
        display.print_success("No findings");
    }
    for finding in &report.findings {
        display.print_finding(finding);
    }

    if write_reports {
        let files = ReportGenerator::new(config)
            .generate_findings_report(&target.input, &report.findings)
            .await?;
        for file in files {
            display.print_info(&format!("Report written to {}", file.display()));
        }
    }

    if report.interrupted {
        return Err(ScanError::Cancelled {
            reason: "stopped before all templates ran".into(),
            partial: None,
        });
    }
    Ok(())
}

async fn execute_cve_lookup(
    mut config: Config,
    display: &DisplayManager,
    ids: &[String],
    output: &OutputArgs,
) -> Result<()> {
    display.print_section_header("CVE LOOKUP");
    let write_reports = apply_output_args(&mut config, output);
    let intel = VulnerabilityIntelligence::new(&config)?;

    let mut records = Vec::new();
    for id in ids {
        match intel.lookup(id).await {
            Ok(Some(record)) => {
                display.print_cve_record(&record);
                records.push(record);
            }
            Ok(None) => display.print_warning(&format!("{} not found", id)),
            Err(e) => display.print_error(&format!("{}: {}", id, e)),
        }
    }

    if write_reports && !records.is_empty() {
        let path = ReportGenerator::new(config).generate_cve_report(&records).await?;
        display.print_info(&format!("Report written to {}", path.display()));
    }
    Ok(())
}

async fn execute_cve_search(
    config: Config,
    display: &DisplayManager,
    keyword: &str,
    limit: usize,
) -> Result<()> {
    display.print_section_header("CVE SEARCH");
    let intel = VulnerabilityIntelligence::new(&config)?;
    let records = intel.search(keyword, limit).await?;

    if records.is_empty() {
        display.print_warning(&format!("No CVEs match '{}'", keyword));
    }
    for record in &records {
        display.print_cve_record(record);
    }
    Ok(())
}

async fn execute_full_scan(
    mut config: Config,
    display: &DisplayManager,
    target: &str,
    options: ScanOptions,
    run: &RunArgs,
    cancel: CancellationToken,
) -> Result<()> {
    display.print_section_header("FULL SCAN");
    let write_reports = apply_run_args(&mut config, run);

    let result = run_orchestrated(config.clone(), display, target, &options, cancel).await?;

    display.print_port_results(&result.target.ip.to_string(), &result.open_ports);
    println!();
    for finding in &result.findings {
        display.print_finding(finding);
    }
    display.print_scan_summary(&result);
    if write_reports {
        write_scan_reports(config, display, &result).await?;
    }
    Ok(())
}

/// Run the orchestrator under a spinner, showing partial results on cancellation.
async fn run_orchestrated(
    config: Config,
    display: &DisplayManager,
    target: &str,
    options: &ScanOptions,
    cancel: CancellationToken,
) -> Result<ScanResult> {
    let orchestrator = ScanOrchestrator::new(config)?;
    let spinner = (!display.is_quiet()).then(|| create_spinner(&format!("Scanning {}...", target)));
    let outcome = orchestrator.run_with_cancel(target, options, cancel).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    match outcome {
        Err(ScanError::Cancelled { reason, partial }) => {
            if let Some(partial) = &partial {
                display.print_warning("Partial results:");
                display.print_port_results(&partial.target.ip.to_string(), &partial.open_ports);
                for finding in &partial.findings {
                    display.print_finding(finding);
                }
                display.print_scan_summary(partial);
            }
            Err(ScanError::Cancelled { reason, partial })
        }
        other => other,
    }
}

async fn write_scan_reports(config: Config, display: &DisplayManager, result: &ScanResult) -> Result<()> {
    let files = ReportGenerator::new(config).generate_report(result).await?;
    for file in files {
        display.print_info(&format!("Report written to {}", file.display()));
    }
    Ok(())
}
