use clap::{Parser, Subcommand};
use kubedelta::config::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS;
use kubedelta::k8s::{self, KubeRemote, RemoteApi};
use kubedelta::{
    Config, DeltaStream, EventManager, EventSpec, GraphManager, GraphSpec, LogSpec, PodLogManager,
    StreamItem,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Namespace to watch; all namespaces when omitted
    #[arg(short, long)]
    namespace: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON on stderr
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream graph deltas for the configured kinds
    Graph {
        /// Kind names to watch; all configured kinds when omitted
        #[arg(short, long)]
        kind: Vec<String>,

        /// Equality label selector, `key=value`
        #[arg(short, long, value_parser = parse_label)]
        label: Vec<(String, String)>,
    },
    /// Stream namespace events
    Events {
        /// Only events about this kind
        #[arg(long)]
        involved_kind: Option<String>,

        /// Only events about this object (requires --involved-kind)
        #[arg(long)]
        involved_name: Option<String>,

        /// Only these event types, e.g. Warning
        #[arg(short = 't', long = "type")]
        types: Vec<String>,
    },
    /// Tail one container's logs
    Logs {
        #[arg(short, long)]
        pod: String,

        #[arg(short, long)]
        container: String,

        /// Lines of history before following
        #[arg(long)]
        tail: Option<i64>,
    },
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s}"))
}

/// Print every delta as one JSON line until the stream ends or Ctrl-C
async fn pump<T: Clone + Send + Serialize + 'static>(mut stream: DeltaStream<T>) -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                return Ok(());
            }
            item = stream.recv() => match item {
                Some(StreamItem::Delta(envelope)) => println!("{}", serde_json::to_string(&envelope)?),
                Some(StreamItem::Lagged(missed)) => warn!(missed, "consumer lagging, deltas dropped"),
                None => return Ok(()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    kubedelta::logging::init(&config.log_level, args.json_logs);

    let namespace = args.namespace.or_else(|| config.namespace.clone());
    let client = k8s::client::new(Some(k8s::USER_AGENT)).await?;
    let remote: Arc<dyn RemoteApi> =
        Arc::new(KubeRemote::new(client).with_watch_timeout(config.watch_timeout_secs));
    let config = Arc::new(config);
    let shutdown = Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS);

    match args.command {
        Command::Graph { kind, label } => {
            let kinds = if kind.is_empty() {
                config.graph.kinds.iter().map(|k| k.kind.clone()).collect()
            } else {
                kind
            };
            let manager = GraphManager::new(remote, config);
            let (_, stream) = manager.subscribe(GraphSpec {
                kinds,
                namespace,
                labels: label.into_iter().collect(),
            })?;
            pump(stream).await?;
            manager.stop(shutdown).await?;
        }
        Command::Events {
            involved_kind,
            involved_name,
            types,
        } => {
            let manager = EventManager::new(remote, config);
            let (_, stream) = manager.subscribe(EventSpec {
                namespace,
                involved_kind,
                involved_name,
                types,
            })?;
            pump(stream).await?;
            manager.stop(shutdown).await?;
        }
        Command::Logs {
            pod,
            container,
            tail,
        } => {
            let namespace = namespace.unwrap_or_else(|| "default".to_string());
            let manager = PodLogManager::new(remote, config);
            let (_, stream) = manager.subscribe(LogSpec {
                namespace,
                pod,
                container,
                tail_lines: tail,
            })?;
            pump(stream).await?;
            manager.stop(shutdown).await?;
        }
    }

    Ok(())
}
