use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use gpib_sorter::device::{SortManager, UdevBringUp};
use gpib_sorter::events::{EventSink, LogSink, MultiSink, TranscriptSink};
use gpib_sorter::handler::{BinConfig, JobSpec};
use gpib_sorter::ids::{FileIdSource, IdSource};
use gpib_sorter::serial::SerialInterface;
use gpib_sorter::SorterConfig;

#[derive(Debug, clap::Parser)]
#[command(name = "gpib-sort", version, about = "Sort parts on a GPIB test handler by device identifier")]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `gpib_sorter=debug`. `RUST_LOG` wins when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// List USB serial ports a bridge adapter could be on.
    Ports,

    /// Enumerate instruments on the bus and print them as JSON.
    Discover(DiscoverArgs),

    /// Configure the handler and sort a lot.
    Run(RunArgs),
}

#[derive(Debug, clap::Args)]
struct DiscoverArgs {
    /// Serial device of the bridge adapter.
    #[arg(long)]
    port: Option<String>,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// GPIB address of the handler.
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=30))]
    address: u8,

    /// File of accepted device identifiers, one per line or comma separated.
    #[arg(long)]
    ids: PathBuf,

    /// Parts to sort. Defaults to one per accepted identifier.
    #[arg(long)]
    parts: Option<usize>,

    #[arg(long)]
    pass_bin: Option<u8>,

    #[arg(long)]
    fail_bin: Option<u8>,

    /// Serial device of the bridge adapter.
    #[arg(long)]
    port: Option<String>,

    /// Set the adapter's auto-read mode (`++auto`) before configuring the handler.
    #[arg(long)]
    auto_read: Option<bool>,

    /// Reload udev rules and run gpib_config before connecting.
    #[arg(long)]
    bring_up: bool,
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn build_sink(config: &SorterConfig) -> Result<Arc<dyn EventSink>> {
    let mut sink = MultiSink::new().with(Arc::new(LogSink));
    if let Some(path) = &config.transcript {
        let transcript = TranscriptSink::append_to(path)
            .with_context(|| format!("failed to open transcript {}", path.display()))?;
        sink = sink.with(Arc::new(transcript));
    }
    Ok(Arc::new(sink))
}

fn list_ports() -> Result<()> {
    let ports = SerialInterface::available_ports().context("failed to list serial ports")?;
    if ports.is_empty() {
        println!("No USB serial ports found");
    }
    for port in ports {
        println!(
            "{}\t{:04x}:{:04x}\t{}",
            port.port_name,
            port.vid,
            port.pid,
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn discover(mut config: SorterConfig, args: DiscoverArgs) -> Result<()> {
    if let Some(port) = args.port {
        config.connection.port = port;
    }
    let sink = build_sink(&config)?;
    let manager = SortManager::new(config).with_sink(sink);

    manager.connect().await.context("failed to connect to the bridge adapter")?;
    let devices = manager.discover_devices().await;
    manager.disconnect().await?;

    let devices = devices.context("bus discovery failed")?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn run(mut config: SorterConfig, args: RunArgs) -> Result<()> {
    if let Some(port) = args.port {
        config.connection.port = port;
    }
    if args.auto_read.is_some() {
        config.auto_read = args.auto_read;
    }
    let bins = BinConfig {
        pass_bin: args.pass_bin.unwrap_or(config.bins.pass_bin),
        fail_bin: args.fail_bin.unwrap_or(config.bins.fail_bin),
    };
    bins.validate()?;

    let accepted = FileIdSource::new(&args.ids).accepted_ids()?;
    if accepted.is_empty() && args.parts.is_none() {
        bail!("{} has no identifiers; pass --parts to sort anyway", args.ids.display());
    }

    let mut spec = JobSpec::for_accepted(args.address, accepted, bins);
    if let Some(parts) = args.parts {
        spec.num_parts = parts;
    }

    let sink = build_sink(&config)?;
    let mut manager = SortManager::new(config).with_sink(sink);
    if args.bring_up {
        manager = manager.with_bring_up(Box::new(UdevBringUp::default()));
    }

    manager.connect().await.context("failed to connect to the bridge adapter")?;
    let result = manager.run(&spec).await;
    if let Err(e) = manager.disconnect().await {
        log::warn!("Error while closing the bridge: {}", e);
    }

    let report = result.context("sort job failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = SorterConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Ports => list_ports(),
        Command::Discover(args) => discover(config, args).await,
        Command::Run(args) => run(config, args).await,
    }
}
