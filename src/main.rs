use clap::{Parser, Subcommand};
use std::path::PathBuf;
use ticket_relay::kafka::Producer;
use ticket_relay::tickets::Ticket;
use ticket_relay::{Config, Error, Relay, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "ticket-relay")]
#[command(about = "Kafka ticket event consumer and publisher", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume ticket events until interrupted
    Consume,
    /// Publish a single ticket event
    Publish {
        /// Destination topic; defaults to the first configured topic
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        chat_id: i64,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(Error::Config(e.to_string()));
        }
    };
    config.validate().map_err(Error::Config)?;

    info!(
        kafka_brokers = ?config.kafka.brokers,
        group_id = %config.kafka.group_id,
        topics = ?config.kafka.topics,
        queue_capacity = config.consumer.queue_capacity,
        "Configuration summary"
    );

    match args.command {
        Command::Consume => consume(config).await,
        Command::Publish {
            topic,
            chat_id,
            unit,
            name,
            description,
        } => {
            let ticket = Ticket {
                chat_id,
                unit,
                name,
                description,
            };
            publish(config, topic, ticket).await
        }
    }
}

async fn consume(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let result = Relay::for_tickets(config).run(shutdown).await;
    if let Err(e) = &result {
        error!("Relay failed: {}", e);
    }
    result
}

async fn publish(config: Config, topic: Option<String>, ticket: Ticket) -> Result<()> {
    let topic = match topic.or_else(|| config.kafka.topics.first().cloned()) {
        Some(topic) => topic,
        None => return Err(Error::Config("no topic to publish to".to_string())),
    };

    let producer = Producer::new(config.kafka.client_config(), &config.producer)?;
    let delivery = producer.publish(&topic, &ticket).await?;

    info!(
        topic = %topic,
        partition = delivery.partition,
        offset = delivery.offset,
        "Ticket published"
    );
    println!("{}:{}@{}", topic, delivery.partition, delivery.offset);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("ticket_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ticket_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
