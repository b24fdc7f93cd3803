use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use risk_explorer_core::{
    EntityRef, FilterOptions, FilterState, Ident, RiskLevel, ViewMode,
};
use risk_explorer_store::{Dataset, ExplorerStore};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rx")]
#[command(about = "Risk Explorer CLI")]
struct Cli {
    /// Directory holding the three dataset JSON files.
    #[arg(long, global = true, conflicts_with = "base_url")]
    data_dir: Option<PathBuf>,
    /// HTTP base URL serving the three dataset JSON files.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Data {
        #[command(subcommand)]
        command: DataCommand,
    },
    Query {
        #[command(subcommand)]
        command: QueryCommand,
    },
    Entities {
        #[command(subcommand)]
        command: EntitiesCommand,
    },
    Cases {
        #[command(subcommand)]
        command: CasesCommand,
    },
    Sample {
        #[command(subcommand)]
        command: SampleCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DataCommand {
    /// Load the dataset and print counts and the content fingerprint.
    Info,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    /// The filtered sample subset.
    Filtered(FilterArgs),
    /// The top anomaly leaderboard over the filtered subset.
    Anomalies(FilterArgs),
    /// The top safe-sample leaderboard over the filtered subset.
    Safe(FilterArgs),
    /// The leaderboard selected by the resolved analysis mode.
    Display(FilterArgs),
}

#[derive(Debug, Subcommand)]
enum EntitiesCommand {
    /// Entity frequency across the risky filtered samples.
    Risk(FilterArgs),
    /// Entity frequency across the safe filtered samples.
    Safety(FilterArgs),
}

#[derive(Debug, Subcommand)]
enum CasesCommand {
    /// Best representative cases over the full collection.
    Best,
}

#[derive(Debug, Subcommand)]
enum SampleCommand {
    /// One sample with its resolved context and explanation chains.
    Show {
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// View mode: all, risk or safe.
    #[arg(long, default_value = "all")]
    mode: String,
    /// Risk-level allowlist entry; repeat the flag to allow several.
    #[arg(long = "risk-level")]
    risk_levels: Vec<String>,
    #[arg(long, default_value_t = 0.0)]
    score_min: f64,
    #[arg(long, default_value_t = 1.0)]
    score_max: f64,
    /// Case-sensitive substring match against sample id or name.
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long)]
    province: Option<String>,
    /// Pivot token, e.g. `Farmer[7001]`. A malformed token deactivates the
    /// pivot filter.
    #[arg(long)]
    pivot: Option<String>,
    /// Select a sample id; drives the analysis mode.
    #[arg(long)]
    select: Option<String>,
}

#[derive(Debug, Serialize)]
struct CliEnvelope<T>
where
    T: Serialize,
{
    contract_version: &'static str,
    data: T,
}

#[derive(Debug, Serialize)]
struct DataInfo {
    fingerprint: Option<String>,
    counts: risk_explorer_store::DatasetCounts,
    loaded_at: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let dataset = load_dataset(&cli)?;
    let mut store = ExplorerStore::new();
    store.initialize(dataset);

    match cli.command {
        Command::Data { command: DataCommand::Info } => print_envelope(&DataInfo {
            fingerprint: store.fingerprint().map(ToString::to_string),
            counts: store.dataset().counts(),
            loaded_at: store.loaded_at_rfc3339(),
        }),
        Command::Query { command } => {
            let args = match &command {
                QueryCommand::Filtered(args)
                | QueryCommand::Anomalies(args)
                | QueryCommand::Safe(args)
                | QueryCommand::Display(args) => args,
            };
            store.apply_filter_state(filter_state(args)?);
            let views = store.views();
            match command {
                QueryCommand::Filtered(_) => print_envelope(&views.filtered),
                QueryCommand::Anomalies(_) => print_envelope(&views.anomalies),
                QueryCommand::Safe(_) => print_envelope(&views.safe),
                QueryCommand::Display(_) => print_envelope(&views.display),
            }
        }
        Command::Entities { command } => {
            let args = match &command {
                EntitiesCommand::Risk(args) | EntitiesCommand::Safety(args) => args,
            };
            store.apply_filter_state(filter_state(args)?);
            let views = store.views();
            match command {
                EntitiesCommand::Risk(_) => print_envelope(&views.entity_risk),
                EntitiesCommand::Safety(_) => print_envelope(&views.entity_safety),
            }
        }
        Command::Cases { command: CasesCommand::Best } => print_envelope(&store.best_cases()),
        Command::Sample { command: SampleCommand::Show { id } } => {
            let id = parse_ident(&id);
            store.toggle_select(id.clone());
            let sample = store
                .selected_sample()
                .ok_or_else(|| anyhow!("no sample with id {id}"))?;
            print_envelope(&serde_json::json!({
                "sample": sample,
                "context": store.selected_context(),
                "explanation": store.selected_explanation(),
                "analysis_mode": store.views().analysis_mode,
            }))
        }
    }
}

fn load_dataset(cli: &Cli) -> Result<Dataset> {
    match (&cli.data_dir, &cli.base_url) {
        (Some(dir), _) => Dataset::load_from_dir(dir),
        (None, Some(url)) => Ok(Dataset::load_from_base_url(url)),
        (None, None) => Err(anyhow!("either --data-dir or --base-url is required")),
    }
}

fn filter_state(args: &FilterArgs) -> Result<FilterState> {
    let view_mode = ViewMode::parse(&args.mode)
        .ok_or_else(|| anyhow!("unknown view mode: {}", args.mode))?;
    let risk_levels = args
        .risk_levels
        .iter()
        .map(|raw| RiskLevel::parse(raw).ok_or_else(|| anyhow!("unknown risk level: {raw}")))
        .collect::<Result<BTreeSet<_>>>()?;
    let score_threshold = if args.score_min <= args.score_max {
        (args.score_min, args.score_max)
    } else {
        (args.score_max, args.score_min)
    };

    Ok(FilterState {
        view_mode,
        options: FilterOptions { risk_levels, score_threshold },
        search_query: args.search.clone(),
        province: args.province.clone(),
        pivot: args.pivot.as_deref().and_then(EntityRef::parse),
        selected: args.select.as_deref().map(parse_ident),
    })
}

fn parse_ident(raw: &str) -> Ident {
    raw.parse::<i64>().map_or_else(|_| Ident::Text(raw.to_string()), Ident::Num)
}

fn print_envelope<T>(data: T) -> Result<()>
where
    T: Serialize,
{
    let envelope = CliEnvelope { contract_version: CLI_CONTRACT_VERSION, data };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
