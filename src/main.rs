//! mqtt-publisher command line entry point
//!
//! Connects to the configured broker, runs one VU on the main thread and
//! publishes through it, synchronously or with completion handlers.

use clap::{Args, Parser, Subcommand};
use mqtt_publisher::config::PublisherConfig;
use mqtt_publisher::observability::init_default_logging;
use mqtt_publisher::observability::metrics::{Registry, Sample, TagSet};
use mqtt_publisher::publish::{MqttMetrics, PublishHandlers, PublishRequest, Publisher};
use mqtt_publisher::transport::mqtt::MqttClient;
use mqtt_publisher::vu::Vu;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, info, warn};

/// Publish MQTT messages from a single-threaded VU
#[derive(Parser)]
#[command(name = "mqtt-publisher")]
#[command(about = "Publish MQTT messages without blocking the owning thread")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_PUBLISHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one or more messages
    Publish(PublishArgs),
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Args)]
struct PublishArgs {
    #[arg(long)]
    topic: String,

    #[arg(long)]
    payload: String,

    /// QoS level (defaults to publish.qos)
    #[arg(long)]
    qos: Option<u8>,

    /// Retain flag (defaults to publish.retain)
    #[arg(long)]
    retain: Option<bool>,

    /// Acknowledgment timeout (defaults to publish.timeout_ms)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Deliver results through handlers instead of blocking
    #[arg(long = "async")]
    run_async: bool,

    /// Number of messages to publish
    #[arg(long, default_value_t = 1)]
    count: u32,
}

fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-publisher v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish(args) => run_publish(config, args),
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<PublisherConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => ["mqtt-publisher.toml", "config/mqtt-publisher.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or("no configuration file found, pass one with -c/--config")?,
    };

    info!("Loading configuration from: {}", path.display());
    Ok(PublisherConfig::load_from_file(&path)?)
}

fn handle_config_command(
    config: PublisherConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn run_publish(
    config: PublisherConfig,
    args: PublishArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    // The VU lives on this thread; network work runs on the runtime's workers
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("mqtt-publisher-io")
        .build()?;

    let registry = Arc::new(Registry::with_root_tags(
        TagSet::new().with("topic", args.topic.clone()),
    ));
    let mut vu = Vu::new(registry);
    let metrics = MqttMetrics::register(&vu, &config.metrics)?;

    let mut client = MqttClient::new(config.mqtt.clone())?;
    runtime.block_on(client.connect())?;
    let client = Arc::new(client);
    let publisher = Publisher::new(client.clone(), metrics, runtime.handle().clone())?;

    let (samples_tx, samples_rx) = mpsc::unbounded_channel();
    vu.activate(samples_tx);

    let qos = args.qos.unwrap_or(config.publish.qos);
    let retain = args.retain.unwrap_or(config.publish.retain);
    let timeout_ms = args.timeout_ms.unwrap_or(config.publish.timeout_ms);
    let failures = Arc::new(AtomicUsize::new(0));

    for _ in 0..args.count {
        let request =
            PublishRequest::new(&args.topic, qos, args.payload.clone(), retain, timeout_ms)?;

        if args.run_async {
            let failed = failures.clone();
            let handlers = PublishHandlers::new()
                .on_success(|event| {
                    println!("{}", serde_json::to_string(&event)?);
                    Ok(())
                })
                .on_failure(move |event| {
                    failed.fetch_add(1, Ordering::SeqCst);
                    println!("{}", serde_json::to_string(&event)?);
                    Ok(())
                });
            publisher.publish(&vu, request, handlers)?;
        } else if publisher
            .publish(&vu, request, PublishHandlers::new())
            .is_err()
        {
            failures.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = vu.take_exception() {
                warn!("Publish failed: {}", e);
            }
        }
    }

    vu.run_event_loop()?;
    vu.teardown();
    log_sample_summary(samples_rx);
    if publisher.state_unavailable_count() > 0 {
        warn!(
            skipped = publisher.state_unavailable_count(),
            "Some publishes finished after teardown, their samples were skipped"
        );
    }

    drop(publisher);
    match Arc::try_unwrap(client) {
        Ok(mut client) => runtime.block_on(client.disconnect())?,
        Err(_) => warn!("MQTT client still shared, skipping clean disconnect"),
    }

    match failures.load(Ordering::SeqCst) {
        0 => Ok(()),
        failed => Err(format!("{failed} of {} publishes failed", args.count).into()),
    }
}

fn log_sample_summary(mut samples: UnboundedReceiver<Sample>) {
    let mut totals: BTreeMap<String, (usize, f64)> = BTreeMap::new();
    while let Ok(sample) = samples.try_recv() {
        let entry = totals
            .entry(sample.metric.name().to_string())
            .or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += sample.value;
    }

    for (metric, (count, total)) in totals {
        info!(metric = %metric, samples = count, total, "Recorded samples");
    }
}
