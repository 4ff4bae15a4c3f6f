use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use informant::capture::PacketSource;
use informant::classify::{Classifier, ClassifierOptions};
use informant::engine::{self, EngineConfig};
use informant::extract::Extractor;
use informant::geo::{Geolocator, GoogleGeolocator};
use informant::inform::InformCodec;
use informant::output::{Formatter, Reporter};
use informant::registry::{KeyRegistry, LocatedDevices};

#[derive(Parser)]
#[command(
    name = "informant",
    version,
    about = "Harvest keys and device locations from captured inform traffic"
)]
struct Cli {
    /// pcap/pcapng file to read
    #[arg(short = 'I', long)]
    input: PathBuf,

    /// BPF filter expression (same syntax as tcpdump)
    #[arg(short = 'F', long)]
    bpf: Option<String>,

    /// File of known keys, one per line ('#' starts a comment)
    #[arg(short = 'k', long)]
    keys: Option<PathBuf>,

    /// Print every decoded envelope header
    #[arg(long)]
    header: bool,

    /// Print every decrypted payload
    #[arg(long)]
    message: bool,

    /// Geolocate devices from their neighbor scans
    #[arg(long)]
    locate: bool,

    /// API key for the geolocation service
    #[arg(long, env = "PD_MAPS_API_KEY", hide_env_values = true)]
    maps_api_key: Option<String>,

    /// Geolocation request timeout in seconds (default: none)
    #[arg(long)]
    geo_timeout: Option<u64>,

    /// Print every known key when the capture is done
    #[arg(long)]
    find_keys: bool,

    /// Output as JSON lines
    #[arg(long)]
    json: bool,

    /// Maximum number of concurrently tracked flows
    #[arg(long, default_value_t = 10_000)]
    max_flows: usize,

    /// Bytes read per flow before it is abandoned
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    max_flow_bytes: usize,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let keys = Arc::new(KeyRegistry::new());
    if let Some(path) = &cli.keys {
        let loaded = keys.load_file(path)?;
        info!(count = loaded, path = %path.display(), "loaded keys");
    }

    let mut source = PacketSource::from_file(&cli.input, cli.bpf.as_deref())?;

    let formatter = Arc::new(Formatter::new(cli.json));
    let reporter: Arc<dyn Reporter> = formatter.clone();
    let geolocator: Option<Arc<dyn Geolocator>> = if cli.locate {
        let timeout = cli.geo_timeout.map(Duration::from_secs);
        Some(Arc::new(GoogleGeolocator::new(cli.maps_api_key.clone(), timeout)))
    } else {
        None
    };

    let extractor = Extractor::new(
        keys.clone(),
        Arc::new(LocatedDevices::new()),
        geolocator,
        reporter.clone(),
    );
    let classifier = Classifier::new(
        InformCodec,
        keys.clone(),
        extractor,
        reporter,
        ClassifierOptions {
            show_header: cli.header,
            show_message: cli.message,
        },
    );

    let mut config = EngineConfig::default();
    config.flow.max_flows = cli.max_flows;
    config.flow.max_flow_bytes = cli.max_flow_bytes;

    engine::run(&mut source, Arc::new(classifier), &config)
        .with_context(|| format!("Failed to process {}", cli.input.display()))?;

    if cli.find_keys {
        formatter.print_keys(&keys.keys());
    }
    Ok(())
}
