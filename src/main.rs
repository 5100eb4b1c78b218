use std::path::Path;
use std::process::ExitCode;

use tracing::{error, info};

use perfscope::calltree::CallPathDocument;
use perfscope::config::{AppConfig, ConfigFile, LcpiConfig, MachineConfig};
use perfscope::logging::{init_logging, LoggingConfig};
use perfscope::profile::aggregator::{AggregatedProfile, FlatProfileParser};
use perfscope::profile::ranges::thread_regex;
use perfscope::recommend::{RecommendationEngine, RuleDatabase};
use perfscope::report;

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = match ConfigFile::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut logging = LoggingConfig::default();
    if let Some(dir) = config.logging.log_dir.clone() {
        logging.log_dir = dir;
    }
    if let Some(filter) = config.logging.level_filter.clone() {
        logging.level_filter = filter;
    }
    if let Some(file_output) = config.logging.file_output {
        logging.file_output = file_output;
    }
    let _guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(&config.application) {
        Ok(output) => {
            print!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(app: &AppConfig) -> Result<String, Box<dyn std::error::Error>> {
    let lcpi_config = LcpiConfig::load(Path::new(&app.lcpi_config))?;
    let machine = MachineConfig::load(Path::new(&app.machine_config))?;
    let threads = thread_regex(app.threads.as_deref())?;

    let mut primary = analyze(
        &app.input,
        app.threshold,
        &threads,
        app.aggregate_only,
        lcpi_config.len(),
    )?;
    info!(
        input = %app.input,
        sections = primary.sections.len(),
        "profile aggregated"
    );

    if app.recommend {
        let db = RuleDatabase::load(Path::new(&app.rules_database))?;
        info!(entries = db.len(), "rule database loaded");
        let mut engine = RecommendationEngine::new(db);
        return Ok(report::present_recommendations(
            &mut primary,
            &lcpi_config,
            &machine,
            &mut engine,
            app.aggregate_only,
            app.max_suggestions,
        ));
    }

    let mut comparison = match &app.comparison_input {
        // The comparison pass keeps every section: threshold zero.
        Some(path) => Some(analyze(
            path,
            0.0,
            &threads,
            app.aggregate_only,
            lcpi_config.len(),
        )?),
        None => None,
    };
    Ok(report::present_summary(
        &mut primary,
        comparison.as_mut(),
        &lcpi_config,
        &machine,
        &app.input,
        app.comparison_input.as_deref(),
        app.aggregate_only,
    ))
}

/// One full pipeline pass: parse the call-path document, flatten it, and
/// aggregate the flat profile. Each input gets its own parser instances,
/// comparison runs share no state with the primary run.
fn analyze(
    path: &str,
    threshold: f64,
    threads: &str,
    aggregate_only: bool,
    lcpi_slots: usize,
) -> Result<AggregatedProfile, Box<dyn std::error::Error>> {
    let input = std::fs::read_to_string(path)?;
    let document = CallPathDocument::parse(&input)?;
    let flat = document.flatten();
    info!(input = path, flat_bytes = flat.len(), "call-path document flattened");

    let mut parser = FlatProfileParser::new(threshold, threads, aggregate_only, lcpi_slots);
    parser.parse(&flat)?;
    parser
        .into_parsed()
        .ok_or_else(|| "aggregation produced no result".into())
}
