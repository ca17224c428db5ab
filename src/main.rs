//! # Host Override
//!
//! Operator tool for hostname override rule files.
//!
//! ## Usage
//!
//! ```bash
//! # Validate a rule file
//! host-override --rules rules.yaml check
//!
//! # Show the rule table
//! host-override --rules rules.yaml list
//!
//! # Ask what a connection would be redirected to
//! host-override --rules rules.yaml resolve api.example.com --port 443
//!
//! # Resolve hostnames typed on stdin, following rule file edits
//! host-override -c host-override.yaml watch --reload
//! ```

use clap::{Parser, Subcommand};
use host_override::bridge::{PersistMode, ReloadOutcome, RuleFile, RuleFileBridge};
use host_override::config::AppConfig;
use host_override::error::OverrideError;
use host_override::logging;
use host_override::resolver::HostResolver;
use host_override::store::RuleStore;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Hostname override rules: validate, inspect and test them.
#[derive(Parser, Debug)]
#[command(name = "host-override")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH", global = true)]
    config: Option<PathBuf>,

    /// Path to the rule file (overrides config)
    #[arg(short, long, env = "RULES_FILE", global = true)]
    rules: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the rule file and report every invalid record
    Check,

    /// Print the rule table in evaluation order
    List,

    /// Print the decision for one hostname
    Resolve {
        /// Hostname to resolve
        host: String,

        /// Port of the original connection
        #[arg(short, long, default_value_t = 443)]
        port: u16,
    },

    /// Resolve `host[:port]` lines from stdin, following rule file edits
    /// when `rules.watch` is set or `--reload` is given
    Watch {
        /// Port used for lines without one
        #[arg(short, long, default_value_t = 443)]
        port: u16,

        /// Reload the rule file on change even if the config does not ask for it
        #[arg(long)]
        reload: bool,
    },
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None, // Use config default
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }
}

/// Application entry point.
#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = load_config(&args);

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let rules_path = args.rules.clone().or_else(|| config.rules.file.clone());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        rules = ?rules_path,
        "Starting host-override"
    );

    let result = match &args.command {
        Command::Check => check(rules_path.as_deref()),
        Command::List => list(&config, rules_path.as_deref()),
        Command::Resolve { host, port } => resolve(&config, rules_path.as_deref(), host, *port),
        Command::Watch { port, reload } => watch(&config, rules_path, *port, *reload).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load configuration from file or use defaults
fn load_config(args: &Args) -> AppConfig {
    let Some(path) = args.config.clone().or_else(AppConfig::find_default) else {
        // No config file - use defaults silently
        return AppConfig::default();
    };

    match AppConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Failed to load config from {:?}: {}", path, e);
            eprintln!("Using default configuration");
            AppConfig::default()
        }
    }
}

fn require_rules(path: Option<&Path>) -> Result<&Path, OverrideError> {
    path.ok_or_else(|| {
        OverrideError::config_validation("no rule file given (use --rules or rules.file)")
    })
}

fn load_resolver(config: &AppConfig, path: Option<&Path>) -> Result<HostResolver, OverrideError> {
    let resolver =
        HostResolver::with_event_capacity(Arc::new(RuleStore::new()), config.events.capacity);
    if let Some(path) = path {
        RuleFileBridge::new(path).load_into(&resolver)?;
    }
    Ok(resolver)
}

fn check(path: Option<&Path>) -> Result<ExitCode, OverrideError> {
    let path = require_rules(path)?;
    let file = RuleFile::load(path)?;
    let count = file.rules.len();

    match RuleStore::new().import_rules(file.rules) {
        Ok(()) => {
            println!("{}: {} rule(s) OK", path.display(), count);
            Ok(ExitCode::SUCCESS)
        }
        Err(OverrideError::Import(import)) => {
            for failure in &import.failures {
                println!("{}: {}", path.display(), failure);
            }
            println!(
                "{}: {} of {} rule(s) invalid",
                path.display(),
                import.failures.len(),
                count
            );
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e),
    }
}

fn list(config: &AppConfig, path: Option<&Path>) -> Result<ExitCode, OverrideError> {
    let resolver = load_resolver(config, path)?;
    let rules = resolver.list();
    if rules.is_empty() {
        println!("(no rules)");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<4} {:<6} {:<3} {:<8} {:<32} {:<24} {:>8}  LABEL",
        "#", "ID", "ON", "TYPE", "PATTERN", "TARGET", "PRIORITY"
    );
    for (index, rule) in rules.iter().enumerate() {
        let target = match rule.target_port {
            Some(port) => format!("{}:{}", rule.target_host, port),
            None => rule.target_host.clone(),
        };
        println!(
            "{:<4} {:<6} {:<3} {:<8} {:<32} {:<24} {:>8}  {}",
            index,
            rule.id.to_string(),
            if rule.enabled { "yes" } else { "no" },
            rule.pattern_type.as_str(),
            rule.pattern,
            target,
            rule.priority,
            rule.label
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn resolve(
    config: &AppConfig,
    path: Option<&Path>,
    host: &str,
    port: u16,
) -> Result<ExitCode, OverrideError> {
    let resolver = load_resolver(config, path)?;
    println!("{} -> {}", host, resolver.resolve(host, port));
    Ok(ExitCode::SUCCESS)
}

async fn watch(
    config: &AppConfig,
    path: Option<PathBuf>,
    default_port: u16,
    reload: bool,
) -> Result<ExitCode, OverrideError> {
    let path = require_rules(path.as_deref())?.to_path_buf();
    let bridge = Arc::new(RuleFileBridge::new(&path));

    let mut resolver =
        HostResolver::with_event_capacity(Arc::new(RuleStore::new()), config.events.capacity);
    bridge.load_into(&resolver)?;
    if config.rules.persistence == PersistMode::WriteThrough {
        resolver = resolver.with_persister(bridge.clone());
    }

    if config.rules.should_watch(reload) {
        let mut reloads = bridge.start_watcher(resolver.clone())?;
        tokio::spawn(async move {
            while let Some(outcome) = reloads.recv().await {
                match outcome {
                    ReloadOutcome::Reloaded { rules } => info!(rules, "Rules reloaded"),
                    ReloadOutcome::Rejected { error } => {
                        warn!(error = %error, "Rule file change rejected, keeping previous rules")
                    }
                }
            }
        });
    } else {
        info!("Rule file watching disabled");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            println!("{} -> {}", line, resolver.resolve_authority(line, default_port));
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
