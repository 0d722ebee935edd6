use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use sneaker::config::{Config, ObservabilityConfig};
use sneaker::messaging::{merge_map, AmqpGateway, Consumer, ConsumerEvent, MessageHandler, Publisher};
use sneaker::AppError;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sneaker-cli")]
#[command(about = "Publish to and consume from an AMQP exchange with automatic recovery", long_about = None)]
#[command(version)]
struct Cli {
    /// Broker URL (overrides the configured one)
    #[arg(short, long, env = "SNEAKER_URL")]
    url: Option<String>,

    /// Direct exchange name (overrides the configured one)
    #[arg(short, long, env = "SNEAKER_EXCHANGE")]
    exchange: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message
    Publish {
        #[arg(short, long)]
        routing_key: String,

        #[arg(short, long)]
        content_type: Option<String>,

        /// Message body; read from stdin when omitted
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Consume a queue until interrupted, printing every payload
    Consume(ConsumeArgs),
}

#[derive(Args)]
struct ConsumeArgs {
    #[arg(short, long)]
    queue: String,

    /// Worker count
    #[arg(short, long)]
    threads: Option<usize>,

    /// Let the broker acknowledge on delivery
    #[arg(long)]
    auto_ack: bool,

    /// Extra option as key=value; values are parsed as JSON when possible
    #[arg(short = 'o', long = "option", value_parser = parse_option)]
    options: Vec<(String, Value)>,
}

impl ConsumeArgs {
    fn overrides(&self) -> Map<String, Value> {
        let mut map: Map<String, Value> = self.options.iter().cloned().collect();
        if let Some(threads) = self.threads {
            map.insert("threads".to_string(), Value::from(threads));
        }
        if self.auto_ack {
            map.insert("autoAck".to_string(), Value::Bool(true));
        }
        map
    }
}

fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing option name in '{}'", raw));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(AppError::from(e).exit_code() as u8);
        }
    };
    if cli.json_logs {
        config.observability.json_logs = true;
    }
    init_tracing(&config.observability);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{:#}", err), "Command failed");
            eprintln!("error: {:#}", err);
            let code = err
                .downcast_ref::<AppError>()
                .map(AppError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(cli: Cli, mut config: Config) -> anyhow::Result<()> {
    if let Some(url) = cli.url {
        config.messaging.url = url;
    }
    if let Some(exchange) = cli.exchange {
        config.messaging.exchange = exchange;
    }
    config.validate()?;

    if config.observability.prometheus_enabled {
        sneaker::messaging::init_messaging_metrics();
    }

    match cli.command {
        Commands::Publish {
            routing_key,
            content_type,
            body,
        } => {
            let body = match body {
                Some(body) => body.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin()
                        .read_to_end(&mut buf)
                        .await
                        .context("reading message body from stdin")?;
                    buf
                }
            };

            let messaging = &config.messaging;
            let publisher =
                Publisher::connect(&messaging.url, messaging.exchange_name(), &AmqpGateway::new())
                    .await
                    .map_err(AppError::from)?;
            let content_type = content_type
                .as_deref()
                .unwrap_or_else(|| messaging.content_type());
            publisher
                .publish(&routing_key, Some(content_type), &body)
                .await
                .map_err(AppError::from)?;

            info!(exchange = %publisher.exchange(), routing_key = %routing_key, bytes = body.len(), "Published");
            if let Err(e) = publisher.close().await {
                warn!(error = %e, "Publisher close failed");
            }
        }

        Commands::Consume(args) => {
            // a bad --option is a usage error, reported before any dial
            let options = merge_map(&config.messaging.consume_defaults, &args.overrides())
                .map_err(AppError::from)?;
            let queue = args.queue.clone();
            let handler: Arc<dyn MessageHandler> =
                Arc::new(move |payload: &[u8]| -> anyhow::Result<()> {
                    println!("[{}] {}", queue, String::from_utf8_lossy(payload));
                    Ok(())
                });

            let consumer = Consumer::with_config(config.messaging.clone(), Arc::new(AmqpGateway::new()))
                .await
                .map_err(AppError::from)?;

            let mut events = consumer.events();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => log_event(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event receiver lagged")
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            consumer
                .consume_resolved(&args.queue, options, handler)
                .await
                .map_err(AppError::from)?;

            info!(queue = %args.queue, exchange = %consumer.exchange(), "Consuming; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;

            info!("Shutting down");
            consumer.shutdown().await;
        }
    }

    Ok(())
}

fn log_event(event: &ConsumerEvent) {
    match event {
        ConsumerEvent::ReplayFailed { .. }
        | ConsumerEvent::HandlerFailed { .. }
        | ConsumerEvent::AckFailed { .. } => {
            warn!(event = event.event_type(), queue = ?event.queue(), "{:?}", event)
        }
        _ => info!(event = event.event_type(), "{:?}", event),
    }
}
