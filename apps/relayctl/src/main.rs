use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use relay_client::{ActionDef, ActionOutcome, ClientBuilder, ClientExecution, Priority};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relayctl")]
#[command(about = "Send actions to a relay server and report their outcomes")]
struct Cli {
    /// Server base URL. Falls back to the config file.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    descriptor: String,
    /// Action parameters as a JSON object.
    #[arg(long, default_value = "{}")]
    params: String,
    #[arg(long)]
    storable: bool,
    #[arg(long, default_value_t = 1)]
    repeat: usize,
    #[arg(long)]
    background: bool,
    #[arg(long)]
    pool_size: Option<usize>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Cache responses on disk here instead of in memory.
    #[arg(long)]
    storage_root: Option<PathBuf>,
    #[arg(long)]
    production: bool,
    /// JSON file with defaults for the connection flags.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
struct FileConfig {
    host: Option<String>,
    endpoint: Option<String>,
    pool_size: Option<usize>,
    timeout_ms: Option<u64>,
    storage_root: Option<PathBuf>,
    production: bool,
    client_execution: ClientExecution,
}

/// Flags win over the config file.
#[derive(Debug)]
struct Settings {
    host: String,
    endpoint: Option<String>,
    pool_size: Option<usize>,
    timeout: Option<Duration>,
    storage_root: Option<PathBuf>,
    production: bool,
    client_execution: ClientExecution,
}

impl Settings {
    fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let Some(host) = cli.host.clone().or(file.host) else {
            bail!("no server host given; pass --host or set `host` in the config file");
        };
        Ok(Self {
            host,
            endpoint: file.endpoint,
            pool_size: cli.pool_size.or(file.pool_size),
            timeout: cli.timeout_ms.or(file.timeout_ms).map(Duration::from_millis),
            storage_root: cli.storage_root.clone().or(file.storage_root),
            production: cli.production || file.production,
            client_execution: file.client_execution,
        })
    }
}

fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing config file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log.as_str())
        .compact()
        .init();

    let settings = Settings::resolve(&cli, load_file_config(cli.config.as_deref())?)?;
    let params: Value = serde_json::from_str(&cli.params).context("--params is not valid JSON")?;

    let mut def = ActionDef::server(cli.descriptor.clone());
    if cli.storable {
        def = def.storable();
    }
    if cli.background {
        def = def.priority(Priority::Background);
    }

    let mut builder = ClientBuilder::new(settings.host.clone())
        .production(settings.production)
        .client_execution(settings.client_execution)
        .register(def);
    if let Some(endpoint) = settings.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(pool_size) = settings.pool_size {
        builder = builder.pool_size(pool_size);
    }
    if let Some(timeout) = settings.timeout {
        builder = builder.request_timeout(timeout);
    }
    if let Some(root) = settings.storage_root {
        builder = builder.storage_root(root);
    }

    let client = builder.build()?;
    client.bootstrap().await?;

    let mut events = client.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(event = %event.name, payload = %event.payload, "client.event");
        }
    });

    let mut actions = Vec::with_capacity(cli.repeat);
    for _ in 0..cli.repeat {
        actions.push(client.new_action(&cli.descriptor, params.clone())?);
    }
    let outcomes = client.run_and_wait(actions.clone()).await;

    let mut failures = 0;
    for (action, outcome) in actions.iter().zip(&outcomes) {
        match outcome {
            ActionOutcome::Success(value) => info!(
                action_id = %action.id(),
                from_storage = action.is_from_storage(),
                value = %value,
                "action succeeded"
            ),
            other => {
                failures += 1;
                warn!(
                    action_id = %action.id(),
                    state = other.state().as_str(),
                    error = other.error_message().unwrap_or_default(),
                    "action did not succeed"
                );
            }
        }
    }

    let snapshot = client.snapshot();
    info!(
        total = outcomes.len(),
        failures,
        connected = snapshot.connected,
        token = client.token().is_some(),
        "run complete"
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    event_task.abort();
    if let Err(error) = event_task.await
        && !error.is_cancelled()
    {
        warn!(%error, "event task stopped");
    }

    Ok(())
}
