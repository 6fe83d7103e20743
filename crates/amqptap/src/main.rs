//! amqptap binary.
//!
//! Taps exchanges, subscribes to queues, publishes messages and reports
//! broker topology.

mod config;
mod output;
mod report;

use std::io::Stdout;
use std::path::PathBuf;
use std::sync::Arc;

use amqptap_core::{
    parse_bindings, AmqpDialer, ConnectionSupervisor, Envelope, MessageProperties,
    OutboundMessage, PublishConfig, PublishWorker, SubscribeConfig, SubscribeWorker,
    SupervisorConfig, TapConfig, TapError, TapWorker, TopologyClient,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::CliConfig;
use output::{MessagePrinter, OutputFormat, SavedMessage};

#[derive(Parser)]
#[command(name = "amqptap")]
#[command(version, about = "Tap, subscribe to and publish on AMQP exchanges", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Tap exchanges without disturbing their consumers
    ///
    /// Each argument is a comma separated list of EXCHANGE:KEY pairs tapped
    /// over one connection. Pair arguments with --uri options to tap several
    /// brokers at once, or give a single --uri for all of them.
    ///
    /// Examples:
    ///     amqptap tap 'orders:order.*'
    ///     amqptap tap 'amq.topic:#,billing:invoice.created'
    ///     amqptap tap orders:# audit:# --uri amqp://a/%2f --uri amqp://b/%2f
    #[command(verbatim_doc_comment)]
    Tap {
        /// Exchange bindings (format: EXCHANGE:KEY[,EXCHANGE:KEY...])
        #[arg(value_name = "EXCHANGE:KEY[,...]", required = true)]
        bindings: Vec<String>,

        /// Broker URI, can be repeated (default: AMQPTAP_AMQP_URI)
        #[arg(long = "uri", value_name = "URI")]
        uris: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Consume an existing queue
    Sub {
        /// Queue name
        queue: String,

        /// Broker URI (default: AMQPTAP_AMQP_URI)
        #[arg(long)]
        uri: Option<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Publish a file or stdin
    ///
    /// By default the whole input is published as one message. With
    /// --json-lines every line is a message as printed by `tap --json`;
    /// --exchange and --routing-key then override the saved values.
    Pub {
        /// Target exchange
        #[arg(short, long, required_unless_present = "json_lines")]
        exchange: Option<String>,

        /// Routing key
        #[arg(short = 'k', long)]
        routing_key: Option<String>,

        /// Content type property of published messages
        #[arg(long)]
        content_type: Option<String>,

        /// Input file (default: stdin)
        file: Option<PathBuf>,

        /// Read one JSON message per line
        #[arg(long)]
        json_lines: bool,

        /// Broker URI (default: AMQPTAP_AMQP_URI)
        #[arg(long)]
        uri: Option<String>,
    },

    /// Show exchanges, queues, bindings and consumers
    Info {
        /// Management API URI (default: AMQPTAP_API_URI)
        #[arg(long)]
        api: Option<String>,

        /// Print the raw records as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct OutputArgs {
    /// Print messages as JSON lines
    #[arg(long)]
    json: bool,

    /// Also save every message as a JSON file in this directory
    #[arg(long, value_name = "DIR")]
    save_dir: Option<PathBuf>,
}

impl OutputArgs {
    fn printer(self) -> Result<MessagePrinter<Stdout>> {
        let format = if self.json {
            OutputFormat::JsonLines
        } else {
            OutputFormat::Plain
        };
        MessagePrinter::stdout(format, self.save_dir)
    }
}

/// A supervisor running on its own task.
struct Running {
    supervisor: Arc<ConnectionSupervisor<AmqpDialer>>,
    task: JoinHandle<Result<(), TapError>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = CliConfig::from_env()?;
    tracing::debug!(
        amqp_uri = %redact_uri(&config.amqp_uri),
        api_uri = %redact_uri(&config.api_uri),
        retry_delay = ?config.retry_delay,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Tap {
            bindings,
            uris,
            output,
        } => {
            let taps = tap_configs(&bindings, uris, &config.amqp_uri)?;
            run_tap(&config, taps, output.printer()?).await
        }
        Commands::Sub { queue, uri, output } => {
            let sub = SubscribeConfig {
                uri: uri.unwrap_or_else(|| config.amqp_uri.clone()),
                queue,
            };
            run_sub(&config, sub, output.printer()?).await
        }
        Commands::Pub {
            exchange,
            routing_key,
            content_type,
            file,
            json_lines,
            uri,
        } => {
            let messages = read_messages(
                file,
                json_lines,
                exchange.as_deref(),
                routing_key.as_deref(),
                content_type,
            )
            .await?;
            let publish = PublishConfig {
                uri: uri.unwrap_or_else(|| config.amqp_uri.clone()),
            };
            run_pub(&config, publish, messages).await
        }
        Commands::Info { api, json } => {
            let api = api.unwrap_or_else(|| config.api_uri.clone());
            let client = TopologyClient::new(&api)?;
            let info = client
                .broker_info()
                .await
                .with_context(|| format!("Failed to query {}", client.base_url()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print!("{}", report::render_topology(&info));
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug,amqptap=trace,amqptap_core=trace")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,amqptap=debug,amqptap_core=debug".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn supervisor_config(config: &CliConfig) -> SupervisorConfig {
    SupervisorConfig {
        retry_delay: config.retry_delay,
    }
}

/// One tap configuration per binding list. No URI means the default for all
/// lists, one URI applies to all lists, otherwise URIs pair up with lists.
fn tap_configs(bindings: &[String], uris: Vec<String>, default_uri: &str) -> Result<Vec<TapConfig>> {
    let uris = match uris.len() {
        0 => vec![default_uri.to_string(); bindings.len()],
        1 => vec![uris[0].clone(); bindings.len()],
        n if n == bindings.len() => uris,
        n => anyhow::bail!(
            "{n} URIs given for {} binding lists, expected 1 or {}",
            bindings.len(),
            bindings.len()
        ),
    };

    bindings
        .iter()
        .zip(uris)
        .map(|(list, uri)| -> Result<TapConfig> {
            let bindings = parse_bindings(list)?;
            if let Some(binding) = bindings.iter().find(|b| b.exchange.is_empty()) {
                anyhow::bail!("Missing exchange name in binding '{binding}'");
            }
            Ok(TapConfig::new(uri, bindings))
        })
        .collect()
}

async fn run_tap(
    config: &CliConfig,
    taps: Vec<TapConfig>,
    mut printer: MessagePrinter<Stdout>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(config.output_buffer);

    let running: Vec<Running> = taps
        .into_iter()
        .enumerate()
        .map(|(id, tap)| {
            let span = tracing::info_span!("tap", id, uri = %redact_uri(&tap.uri));
            tracing::info!(
                parent: &span,
                bindings = %tap
                    .bindings
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                "Starting tap"
            );
            let worker = TapWorker::new(tap.bindings, tx.clone(), span.clone())
                .with_setup_retry_delay(config.retry_delay);
            spawn_supervisor(config, tap.uri, worker, span)
        })
        .collect();
    drop(tx);

    let result = consume(rx, &mut printer).await;
    shutdown(running).await;
    result
}

async fn run_sub(
    config: &CliConfig,
    sub: SubscribeConfig,
    mut printer: MessagePrinter<Stdout>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(config.output_buffer);
    let span = tracing::info_span!("sub", queue = %sub.queue, uri = %redact_uri(&sub.uri));
    let worker = SubscribeWorker::new(sub.queue, tx, span.clone());
    let running = spawn_supervisor(config, sub.uri, worker, span);

    let result = consume(rx, &mut printer).await;
    shutdown(vec![running]).await;
    result
}

async fn run_pub(
    config: &CliConfig,
    publish: PublishConfig,
    messages: Vec<OutboundMessage>,
) -> Result<()> {
    let total = messages.len();
    let (tx, rx) = mpsc::channel(config.output_buffer);
    let span = tracing::info_span!("pub", uri = %redact_uri(&publish.uri));
    let worker = PublishWorker::new(rx, span.clone());
    let Running {
        supervisor,
        mut task,
    } = spawn_supervisor(config, publish.uri, worker, span);

    let feed = async move {
        for message in messages {
            if tx.send(message).await.is_err() {
                break;
            }
        }
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    tokio::select! {
        _ = feed => {}
        _ = &mut ctrl_c => {
            tracing::info!("Interrupted");
            return stop(supervisor, task).await;
        }
    }

    // the worker stops by itself once the stream is drained
    tokio::select! {
        result = &mut task => {
            result.context("Publish task failed")??;
            tracing::info!(messages = total, "Published");
            Ok(())
        }
        _ = &mut ctrl_c => {
            tracing::info!("Interrupted");
            stop(supervisor, task).await
        }
    }
}

fn spawn_supervisor<W>(config: &CliConfig, uri: String, mut worker: W, span: Span) -> Running
where
    W: amqptap_core::Worker<amqptap_core::broker::amqp::AmqpConnection> + 'static,
{
    let supervisor = Arc::new(ConnectionSupervisor::new(
        uri,
        AmqpDialer,
        supervisor_config(config),
        span,
    ));
    let running = supervisor.clone();
    let task = tokio::spawn(async move { running.connect(&mut worker).await });
    Running { supervisor, task }
}

/// Drain the shared output until Ctrl-C, a terminal error or every worker
/// has stopped.
async fn consume(mut rx: mpsc::Receiver<Envelope>, printer: &mut MessagePrinter<Stdout>) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Could not listen for Ctrl-C");
                }
                tracing::info!("Interrupted");
                return Ok(());
            }
            envelope = rx.recv() => match envelope {
                Some(Envelope::Delivered(message)) => printer.print(&message)?,
                Some(Envelope::Failed(e)) if e.is_transient() => {
                    tracing::warn!(error = %e, "Retrying after error");
                }
                Some(Envelope::Failed(e)) => return Err(e.into()),
                None => {
                    tracing::info!("All workers stopped");
                    return Ok(());
                }
            }
        }
    }
}

/// Close every supervisor. The output receiver must already be dropped so
/// no worker is blocked on a full output channel.
async fn shutdown(running: Vec<Running>) {
    for Running { supervisor, task } in running {
        if let Err(e) = stop(supervisor, task).await {
            tracing::warn!(error = %e, "Shutdown failed");
        }
    }
}

async fn stop(
    supervisor: Arc<ConnectionSupervisor<AmqpDialer>>,
    task: JoinHandle<Result<(), TapError>>,
) -> Result<()> {
    match supervisor.close().await {
        Ok(()) => {}
        Err(TapError::NotConnected) => {
            // still dialing for the first time
            task.abort();
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }
    match task.await {
        Ok(result) => Ok(result?),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(e).context("Supervisor task failed"),
    }
}

async fn read_messages(
    file: Option<PathBuf>,
    json_lines: bool,
    exchange: Option<&str>,
    routing_key: Option<&str>,
    content_type: Option<String>,
) -> Result<Vec<OutboundMessage>> {
    let input: Box<dyn AsyncRead + Unpin + Send> = match &file {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open file: {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let mut messages = Vec::new();
    if json_lines {
        let mut lines = BufReader::new(input).lines();
        let mut number = 0;
        while let Some(line) = lines.next_line().await? {
            number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let saved: SavedMessage = serde_json::from_str(&line)
                .with_context(|| format!("Invalid message on line {number}"))?;
            let mut message = saved
                .into_outbound(exchange, routing_key)
                .with_context(|| format!("Invalid message on line {number}"))?;
            if content_type.is_some() {
                message.properties.content_type = content_type.clone();
            }
            messages.push(message);
        }
    } else {
        let mut body = Vec::new();
        let mut input = input;
        input.read_to_end(&mut body).await?;
        let properties = MessageProperties {
            content_type,
            ..Default::default()
        };
        messages.push(
            OutboundMessage::new(
                exchange.unwrap_or_default(),
                routing_key.unwrap_or_default(),
                body,
            )
            .with_properties(properties),
        );
    }

    tracing::debug!(count = messages.len(), "Messages read");
    Ok(messages)
}

/// Hide the password of a URI for logging.
fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return uri.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => uri.to_string(),
    }
}
