use anyhow::{Context, Result};
use clap::{self, Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use firewall_audit::firewall::engine::FirewallRulesEngine;
use firewall_audit::firewall::inventory::Inventory;
use firewall_audit::firewall::saver::{Json, ViolationSerializer, Yaml};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "firewall-audit", version, about, long_about)]
struct Args {
    /// Policy definitions
    #[arg(short, long, value_name = "RULES")]
    rules: PathBuf,

    /// Snapshot of the live firewall rules
    #[arg(short, long, value_name = "INVENTORY")]
    inventory: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Yaml)]
    format: Format,

    /// Output file, stdout when not set
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Debug
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    debug: bool,
}

fn start(args: Args) -> Result<()> {
    let engine = FirewallRulesEngine::new(&args.rules);

    engine.build_rule_book().map_err(|e| {
        let msg = format!("load rules: {}", &e.root_cause());
        e.context(msg)
    })?;

    let inventory = Inventory::load(&args.inventory)?;
    let live = inventory.live_policies();

    info!("auditing {} resources", live.len());

    let violations = engine.find_violations_batch(live.iter().map(|(r, p)| (r, p.as_slice())))?;

    info!("found {} violations", violations.len());

    let serializer: Box<dyn ViolationSerializer> = match args.format {
        Format::Yaml => Box::new(Yaml),
        Format::Json => Box::new(Json),
    };

    let serialized = serializer.serialize(&violations)?;

    match args.output {
        Some(path) => fs::write(&path, serialized).with_context(|| format!("cannot write {}", path.display()))?,
        None => print!("{}", serialized),
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let f = fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry().with(env_filter).with(f).init();

    if let Err(e) = start(args) {
        error!("{:#}", &e);
        std::process::exit(1);
    }
}
