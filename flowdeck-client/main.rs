use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flowdeck::config::Config;
use flowdeck::execution::HttpExecutionClient;
use flowdeck::state::file_repository::FileNodeStateRepository;
use flowdeck::state::NodeStateStore;
use flowdeck::stream::WsTransport;
use flowdeck::views::{self, ViewMode};
use flowdeck::workbench::Workbench;

#[derive(Parser)]
#[command(name = "flowdeck", about = "Run workflow nodes and watch them live")]
enum Cli {
    /// Run one tool on a node and follow its progress
    Run {
        /// Backend tool name, e.g. cleanf
        tool: String,
        /// Node the run belongs to
        #[arg(long)]
        node: String,
        /// Tool parameter as key=value (value parsed as JSON when possible)
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,
        /// Full tool config as a JSON object; --param entries are merged on top
        #[arg(long)]
        config_json: Option<String>,
        #[arg(long, value_enum, default_value_t = ViewArg::Compact)]
        view: ViewArg,
    },
    /// Print the stored state of a node
    Show {
        node: String,
        #[arg(long, value_enum, default_value_t = ViewArg::Fullscreen)]
        view: ViewArg,
    },
    /// List nodes with stored state
    Nodes,
    /// List the tools the backend offers
    Types,
}

#[derive(Clone, Copy, ValueEnum)]
enum ViewArg {
    Compact,
    Fullscreen,
}

impl From<ViewArg> for ViewMode {
    fn from(arg: ViewArg) -> Self {
        match arg {
            ViewArg::Compact => ViewMode::Compact,
            ViewArg::Fullscreen => ViewMode::Fullscreen,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowdeck=info,tungstenite=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Run {
            tool,
            node,
            params,
            config_json,
            view,
        } => {
            let payload = build_payload(&params, config_json.as_deref())?;
            run_node(&config, &node, &tool, payload, view.into()).await?;
        }
        Cli::Show { node, view } => {
            let store = open_store(&config).await?;
            let handle = store
                .get(&node)
                .await
                .ok_or_else(|| anyhow!("no stored state for node {node}"))?;
            println!("{}", handle.read(|s| views::render(view.into(), &node, s)));
        }
        Cli::Nodes => {
            let store = open_store(&config).await?;
            for node_id in store.node_ids().await {
                if let Some(handle) = store.get(&node_id).await {
                    println!("{}", handle.read(|s| views::render_compact(&node_id, s)));
                }
            }
        }
        Cli::Types => {
            let client = HttpExecutionClient::new(&config.api_url)
                .context("failed to build execution client")?;
            for info in client.list_node_types().await? {
                let label = if info.display_name.is_empty() {
                    info.name.clone()
                } else {
                    info.display_name.clone()
                };
                println!("{:<16} {:<24} {}", info.name, label, info.description);
            }
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> Result<NodeStateStore> {
    let repo = Arc::new(FileNodeStateRepository::new(config.state_dir.clone()));
    NodeStateStore::open(repo, config.log_capacity, config.save_debounce)
        .await
        .with_context(|| format!("failed to load node state from {}", config.state_dir.display()))
}

async fn run_node(
    config: &Config,
    node_id: &str,
    tool: &str,
    payload: serde_json::Value,
    mode: ViewMode,
) -> Result<()> {
    let store = open_store(config).await?;
    let backend = Arc::new(
        HttpExecutionClient::new(&config.api_url).context("failed to build execution client")?,
    );
    let transport = Arc::new(WsTransport::new(&config.api_url).context("invalid API URL")?);
    let workbench = Workbench::new(store.clone(), backend, transport, config.session);

    let mut view = workbench.mount(node_id, None, mode).await;
    let (task_id, mut run) = view.spawn_run(tool, payload);
    tracing::info!(node_id, tool, task_id = %task_id, "running");

    let mut last_frame = String::new();
    let outcome = loop {
        tokio::select! {
            joined = &mut run => break joined.context("run task panicked")?,
            alive = view.changed() => {
                if !alive {
                    continue;
                }
                let frame = view.render();
                if frame != last_frame {
                    println!("{frame}");
                    last_frame = frame;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                view.stop();
                store.flush_all().await;
                bail!("interrupted, task {task_id} may still be running on the backend");
            }
        }
    };

    println!("{}", view.handle().read(|s| views::render_fullscreen(node_id, s)));
    view.unmount();
    store.flush_all().await;

    if !outcome.success {
        bail!("{tool} failed: {}", outcome.message);
    }
    Ok(())
}

/// Merge `--config-json` and `--param key=value` pairs into one JSON object.
fn build_payload(params: &[String], config_json: Option<&str>) -> Result<serde_json::Value> {
    let mut payload = match config_json {
        Some(text) => match serde_json::from_str(text).context("invalid --config-json")? {
            serde_json::Value::Object(map) => map,
            _ => bail!("--config-json must be a JSON object"),
        },
        None => serde_json::Map::new(),
    };

    for param in params {
        let (key, raw) = param
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got {param:?}"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("empty parameter name in {param:?}");
        }
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        payload.insert(key.to_string(), value);
    }

    Ok(serde_json::Value::Object(payload))
}
