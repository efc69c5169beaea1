//! MedFlow CLI Entry Point
//!
//! Loads and validates a flow definition and prints its execution plan.
//! Capabilities are provided by the embedding application, so the CLI
//! never runs a flow.
//!
//! # Usage
//!
//! ```bash
//! # Check the default flow (ORCHESTRATION_ID or dual_llm_v1)
//! medflow
//!
//! # Check a flow by id from a configuration directory
//! medflow --id dual_llm_v1 --config-dir config/orchestrations
//!
//! # Check a flow file without requiring its environment variables
//! medflow path/to/flow.yaml --permissive
//!
//! # List available flows
//! medflow --list
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use medflow::flow::{
    FlowDefinition, FlowLocator, OnError, StepDescriptor, StepKind, ValidationMode,
    DEFAULT_CONFIG_DIR,
};
use medflow::{load_flow, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, PartialEq)]
struct Config {
    flow_path: Option<PathBuf>,
    flow_id: Option<String>,
    config_dir: PathBuf,
    mode: ValidationMode,
    list: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flow_path: None,
            flow_id: None,
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            mode: ValidationMode::from_env(),
            list: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Clinical Pipeline Orchestration");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: medflow [OPTIONS] [FLOW_FILE]");
    println!();
    println!("Arguments:");
    println!("  [FLOW_FILE]         Path to a flow YAML file (overrides --id)");
    println!();
    println!("Options:");
    println!("  --id ID             Flow id to load (default: $ORCHESTRATION_ID or dual_llm_v1)");
    println!("  --config-dir DIR    Directory holding <id>.yaml files (default: {})", DEFAULT_CONFIG_DIR);
    println!("  --permissive        Do not fail on missing environment variables");
    println!("  --list              List flows available in the configuration directory");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  medflow");
    println!("  medflow --id dual_llm_v1 --permissive");
    println!("  medflow pipelines/custom.yaml");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--permissive" => {
                config.mode = ValidationMode::Permissive;
            }
            "--list" => {
                config.list = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--id" => {
                i += 1;
                let id = args.get(i).ok_or("--id requires a flow id argument")?;
                config.flow_id = Some(id.clone());
            }
            "--config-dir" => {
                i += 1;
                let dir = args.get(i).ok_or("--config-dir requires a path argument")?;
                config.config_dir = PathBuf::from(dir);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.flow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.flow_path = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    Ok(config)
}

/// One-line summary of a capability step.
fn describe_step(step: &StepDescriptor) -> String {
    let StepKind::Single { capability, target } = &step.kind else {
        return format!("parallel ({} steps)", step.children().len());
    };

    let on_error = match step.on_error {
        OnError::Retry => "retry".normal(),
        OnError::Skip => "skip".yellow(),
        OnError::Abort => "abort".red(),
    };

    let mut line = format!(
        "{:<5} -> {}  on_error={}  attempts={}",
        capability.to_string(),
        target,
        on_error,
        step.retry_policy.max_attempts
    );
    if let Some(timeout) = step.timeout {
        line.push_str(&format!("  timeout={:?}", timeout));
    }
    if step.output_key != step.name {
        line.push_str(&format!("  writes={}", step.output_key));
    }
    line
}

/// Prints the execution plan of a validated flow.
fn print_plan(flow: &FlowDefinition) {
    match &flow.version {
        Some(version) => println!("Flow: {} v{}", flow.id.bold(), version),
        None => println!("Flow: {}", flow.id.bold()),
    }
    if !flow.description.is_empty() {
        println!("  {}", flow.description);
    }
    if !flow.env.is_empty() {
        println!("Required environment: {}", flow.env.join(", "));
    }
    println!();

    for (index, step) in flow.steps.iter().enumerate() {
        println!("  {:>2}. {:<20} {}", index + 1, step.name.cyan(), describe_step(step));
        if let Some(condition) = &step.condition {
            println!("      {:<20} if {}", "", condition);
        }
        for child in step.children() {
            println!("      - {:<18} {}", child.name.cyan(), describe_step(child));
            if let Some(condition) = &child.condition {
                println!("        {:<18} if {}", "", condition);
            }
        }
    }

    if let Some(policy) = &flow.escalation {
        println!();
        println!(
            "Escalation: {} -> {}",
            policy.condition(flow),
            policy.to.magenta()
        );
    }

    let overrides: Vec<&str> = flow
        .steps
        .iter()
        .flat_map(|s| std::iter::once(s).chain(s.children()))
        .filter(|s| flow.overrides_for(&s.name).is_some())
        .map(|s| s.name.as_str())
        .collect();
    if !overrides.is_empty() {
        println!("Overrides: {}", overrides.join(", "));
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    let locator = FlowLocator::new(&config.config_dir);

    if config.list {
        let ids = locator.available()?;
        info!("{} flows in {}", ids.len(), locator.root().display());
        for id in ids {
            println!("  {}", id);
        }
        return Ok(());
    }

    if config.mode == ValidationMode::Permissive {
        info!("Mode: PERMISSIVE (missing environment variables are ignored)");
    }

    // Load and validate the flow
    let flow = match &config.flow_path {
        Some(path) => load_flow(path, config.mode),
        None => locator.load(config.flow_id.as_deref(), config.mode),
    }
    .map_err(|e| {
        error!("Failed to load flow: {}", e);
        e
    })?;

    print_plan(&flow);

    println!();
    println!("{}", "Flow definition is valid".green());

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("medflow")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let config = parse_arguments(&args(&[])).unwrap();
        assert!(config.flow_path.is_none());
        assert!(config.flow_id.is_none());
        assert_eq!(config.config_dir, PathBuf::from(DEFAULT_CONFIG_DIR));
        assert!(!config.list);
    }

    #[test]
    fn test_parse_options() {
        let config = parse_arguments(&args(&[
            "--id",
            "dual_llm_v1",
            "--config-dir",
            "/etc/medflow",
            "--permissive",
            "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.flow_id.as_deref(), Some("dual_llm_v1"));
        assert_eq!(config.config_dir, PathBuf::from("/etc/medflow"));
        assert_eq!(config.mode, ValidationMode::Permissive);
        assert!(config.verbose);
    }

    #[test]
    fn test_parse_flow_path() {
        let config = parse_arguments(&args(&["flows/custom.yaml"])).unwrap();
        assert_eq!(config.flow_path, Some(PathBuf::from("flows/custom.yaml")));

        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--id"])).is_err());
        assert!(parse_arguments(&args(&["--config-dir"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_describe_step() {
        let step = StepDescriptor::agent("specialist_a")
            .with_target("clinical_specialist_openai")
            .with_output_key("report_a");
        let line = describe_step(&step);

        assert!(line.contains("clinical_specialist_openai"));
        assert!(line.contains("attempts=3"));
        assert!(line.contains("writes=report_a"));

        let group = StepDescriptor::parallel("specialists", vec![step]);
        assert_eq!(describe_step(&group), "parallel (1 steps)");
    }
}
