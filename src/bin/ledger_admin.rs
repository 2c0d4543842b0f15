//! Ledger Admin CLI Tool
//!
//! Runs single ledger operations against the configured ledger without
//! starting the HTTP server.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::Read;

use audit_ledger::audit::ledger::ActionRecord;
use audit_ledger::audit::query::QueryRequest;
use audit_ledger::compliance::report::ReportPeriod;
use audit_ledger::config::AppConfig;
use audit_ledger::service::{EvaluateRequest, PurgeRequest, RangeRequest, ReportRequest};
use audit_ledger::{LedgerService, Operation};

#[derive(Parser)]
#[command(name = "ledger-admin")]
#[command(about = "Audit ledger administration tool")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Ledger file (overrides LEDGER_PATH)
    #[arg(long)]
    ledger: Option<String>,

    /// Signing key directory (overrides LEDGER_KEY_DIR)
    #[arg(long)]
    key_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show service and ledger health
    Health,

    /// Record an action
    Ingest {
        /// Dotted action type, e.g. auth.login
        #[arg(short, long)]
        action_type: String,

        /// Actor that performed the action
        #[arg(long)]
        actor: String,

        /// Target of the action
        #[arg(short, long)]
        target: String,

        /// Outcome (success, failure, ...)
        #[arg(short, long)]
        result: String,

        /// Details as a JSON object
        #[arg(short, long)]
        details: Option<String>,
    },

    /// Query recorded entries
    Query {
        /// Filters as key=value pairs (dotted keys reach into details/context)
        #[arg(short, long)]
        filter: Vec<String>,

        /// Inclusive RFC3339 lower bound
        #[arg(long)]
        start: Option<String>,

        /// Inclusive RFC3339 upper bound
        #[arg(long)]
        end: Option<String>,

        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Verify a single entry by log id
    VerifyEntry {
        log_id: String,
    },

    /// Verify the hash chain over a time range
    VerifyRange {
        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the ledger public key
    PublicKey,

    /// Evaluate a target against a compliance framework
    Evaluate {
        /// Framework name (gdpr, hipaa, ...)
        #[arg(short, long)]
        framework: String,

        /// Target identifier
        #[arg(short, long)]
        target: String,

        /// Evaluation parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,
    },

    /// Summarize compliance checks over a period
    Report {
        #[arg(short, long)]
        framework: String,

        /// day, week, month, quarter or year
        #[arg(short, long, default_value = "month")]
        period: String,
    },

    /// Purge expired entries of a category
    Purge {
        #[arg(short, long)]
        category: String,

        /// Actually remove entries instead of previewing
        #[arg(long)]
        execute: bool,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Run an operation given as JSON (from a file, or stdin when omitted)
    Dispatch {
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().context("Failed to load configuration")?;
    if let Some(ledger) = cli.ledger {
        config.ledger_path = ledger.into();
    }
    if let Some(key_dir) = cli.key_dir {
        config.key_dir = key_dir.into();
    }

    let operation = build_operation(cli.command)?;
    let service = LedgerService::from_config(&config).context("Failed to open ledger")?;

    let outcome = service.dispatch(operation).await;
    service.close().await.context("Failed to close ledger")?;

    match outcome {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {} ({})", e, e.kind());
            std::process::exit(1);
        }
    }
}

fn build_operation(command: Commands) -> anyhow::Result<Operation> {
    let operation = match command {
        Commands::Health => Operation::Health,
        Commands::Ingest {
            action_type,
            actor,
            target,
            result,
            details,
        } => {
            let mut record = ActionRecord::new(action_type, actor, target, result);
            if let Some(details) = details {
                record = record.with_details(parse_object("details", &details)?);
            }
            Operation::Ingest(record)
        }
        Commands::Query {
            filter,
            start,
            end,
            limit,
            offset,
        } => Operation::Query(QueryRequest {
            filters: parse_filters(&filter)?,
            start_time: start,
            end_time: end,
            limit,
            offset,
        }),
        Commands::VerifyEntry { log_id } => Operation::VerifyEntry { log_id },
        Commands::VerifyRange {
            start,
            end,
            timeout_ms,
        } => Operation::VerifyRange(RangeRequest {
            start_time: start,
            end_time: end,
            timeout_ms,
        }),
        Commands::PublicKey => Operation::PublicKey,
        Commands::Evaluate {
            framework,
            target,
            params,
        } => Operation::Evaluate(EvaluateRequest {
            framework,
            target_id: target,
            params: match params {
                Some(raw) => parse_object("params", &raw)?,
                None => Map::new(),
            },
        }),
        Commands::Report { framework, period } => {
            let period: ReportPeriod = serde_json::from_value(Value::String(period.clone()))
                .map_err(|_| anyhow!("Unknown period '{}'", period))?;
            Operation::Report(ReportRequest { framework, period })
        }
        Commands::Purge {
            category,
            execute,
            timeout_ms,
        } => Operation::Purge(PurgeRequest {
            category,
            dry_run: !execute,
            timeout_ms,
        }),
        Commands::Dispatch { file } => {
            let raw = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path))?,
                None => {
                    let mut raw = String::new();
                    std::io::stdin().read_to_string(&mut raw)?;
                    raw
                }
            };
            serde_json::from_str(&raw).context("Invalid operation JSON")?
        }
    };
    Ok(operation)
}

fn parse_object(name: &str, raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str(raw).with_context(|| format!("Invalid JSON in --{}", name))? {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("--{} must be a JSON object", name)),
    }
}

/// `key=value` pairs. Values that parse as JSON keep their type.
fn parse_filters(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut filters = Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Filter '{}' must be key=value", pair))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        filters.insert(key.to_string(), value);
    }
    Ok(filters)
}
