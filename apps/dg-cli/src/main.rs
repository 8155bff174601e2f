use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use device_graph as dg;
use device_graph::stock::{self, StockContexts};

#[derive(Parser, Debug)]
#[command(
    name = "dg",
    version,
    about = "Device graph configuration tool",
    disable_help_subcommand = true
)]
struct Cli {
    /// Log filter (e.g. `debug`, `device_graph=trace`); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a configuration against the stock contexts and report what was built
    Validate {
        /// Configuration document (.yaml, .yml or .json)
        #[arg(long)]
        file: Option<String>,
        /// Directory of configuration documents, loaded in name order
        #[arg(long)]
        dir: Option<String>,
        /// Print the load summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List every context with its realized devices
    List {
        #[arg(long)]
        file: String,
    },
    /// Drive one device through its context
    Act {
        #[arg(long)]
        file: String,
        /// Context kind, e.g. `valve` or `muscle`
        #[arg(long)]
        context: String,
        /// Identifier within the context
        #[arg(long)]
        id: String,
        #[arg(long, value_enum)]
        action: Action,
    },
    /// Load a configuration and print the registry gauges in Prometheus text format
    Metrics {
        #[arg(long)]
        file: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Action {
    On,
    Off,
    Toggle,
    State,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.log_level.as_deref());

    match cli.command {
        Commands::Validate { file, dir, json } => {
            device_validate(file.as_deref(), dir.as_deref(), json)
        }
        Commands::List { file } => device_list(&file),
        Commands::Act {
            file,
            context,
            id,
            action,
        } => device_act(&file, &context, &id, action),
        Commands::Metrics { file } => device_metrics(&file),
    }
}

fn setup_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::from_default_env(),
    };
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn device_validate(file: Option<&str>, dir: Option<&str>, json: bool) -> Result<()> {
    let registry = dg::Registry::new();
    StockContexts::install_simulated(&registry)?;
    let loader = dg::Loader::new(&registry);
    let session = match (file, dir) {
        (Some(f), None) => loader.load_scoped(f)?,
        (None, Some(d)) => loader.load_dir_scoped(d)?,
        _ => {
            return Err(anyhow::anyhow!("provide --file <path> or --dir <dir>"));
        }
    };
    let summary = session.summary();
    println!(
        "ok: {} devices across {} contexts ({} entries)",
        summary.total_devices(),
        summary.contexts,
        summary.entries
    );
    for kind in summary.skipped.iter() {
        println!("skipped: {kind} (no such context)");
    }
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    Ok(())
}

fn device_list(file: &str) -> Result<()> {
    let registry = dg::Registry::new();
    StockContexts::install_simulated(&registry)?;
    let session = dg::Loader::new(&registry).load_scoped(file)?;
    for ctx in session.registry().contexts() {
        match ctx.origin() {
            Some(origin) => println!("{}\tmask of {origin}\t{} devices", ctx.kind(), ctx.len()),
            None => println!("{}\t{} devices", ctx.kind(), ctx.len()),
        }
        for (id, device) in ctx.describe() {
            println!("  {id}\t{device}");
        }
    }
    Ok(())
}

fn device_act(file: &str, context: &str, id: &str, action: Action) -> Result<()> {
    let registry = dg::Registry::new();
    let stock = StockContexts::install_simulated(&registry)?;
    let _session = dg::Loader::new(&registry).load_scoped(file)?;

    let state = if context == stock::MUSCLE {
        match action {
            Action::On => {
                stock::contract(&stock, id)?;
            }
            Action::Off => {
                stock::relax(&stock, id)?;
            }
            Action::Toggle => {
                stock::toggle_muscle(&stock, id)?;
            }
            Action::State => {}
        }
        let muscle = stock.muscles.resolve(&id.into())?;
        stock::get_state(&stock.valves, &muscle.valve)?
    } else {
        let outputs = registry.context::<dyn dg::DigitalOutput>(context)?;
        match action {
            Action::On => stock::turn_on(&outputs, id)?,
            Action::Off => stock::turn_off(&outputs, id)?,
            Action::Toggle => stock::toggle(&outputs, id)?,
            Action::State => {}
        }
        stock::get_state(&outputs, id)?
    };
    info!(context, id, ?action, state, "action applied");
    println!("{context}/{id}: {}", if state { "on" } else { "off" });
    Ok(())
}

fn device_metrics(file: &str) -> Result<()> {
    let hub = dg::MetricsHub::new().map_err(anyhow::Error::msg)?;
    let registry = dg::Registry::new();
    StockContexts::install_simulated(&registry)?;
    let _session = dg::Loader::new(&registry)
        .with_metrics(&hub)
        .load_scoped(file)?;
    print!("{}", hub.encode_text());
    Ok(())
}
