use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tradenet_network::{
    ApplicationMessage, BanList, ClearNetTransport, ClearNetTransportConfig, CloseReason,
    Connection, MessageTypeAuthorization, NodeConfig, NodeContext, NodeState, NodesById,
    NodesByIdListener,
};
use tradenet_storage::{
    AuthenticatedDataRequest, AuthenticatedDataStorageService, AuthenticatedPayload,
    DataStorageListener, DataStorageResult, JsonFilePersistence, RetentionPolicy, StorageConfig,
};
use tradenet_types::Address;

mod version;

use version::{git_commit_hash, TRADENET_VERSION};

const STORE_NAME: &str = "authenticated_data_store";

#[derive(Debug, Clone)]
struct AppConfig {
    config_path: Option<PathBuf>,
    node_id: String,
    p2p_host: String,
    p2p_port: u16,
    data_dir: String,
    log_level: String,
    log_format: String,
    socket_timeout_ms: u64,
    peers: Vec<Address>,
    max_map_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            node_id: "default".to_string(),
            p2p_host: "127.0.0.1".to_string(),
            p2p_port: 9000,
            data_dir: "./data".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            socket_timeout_ms: 120_000,
            peers: Vec::new(),
            max_map_size: tradenet_storage::retention::DEFAULT_MAX_MAP_SIZE,
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional TOML file, then `TRADENET_*` variables.
    fn load(config_path: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => None,
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("TRADENET"));
        let config = builder.build()?;

        let defaults = AppConfig::default();
        let peers = get_string_value(&config, &["PEERS", "p2p.peers"])
            .map(|value| parse_peers(&value))
            .unwrap_or_default();

        let p2p_port = match get_number_value(&config, &["P2P_PORT", "p2p.port"]) {
            Some(value) => u16::try_from(value)
                .map_err(|_| anyhow::anyhow!("P2P_PORT must be at most 65535, got {}", value))?,
            None => defaults.p2p_port,
        };
        let max_map_size = match get_number_value(&config, &["MAX_MAP_SIZE", "storage.max_map_size"]) {
            Some(value) => usize::try_from(value)
                .map_err(|_| anyhow::anyhow!("MAX_MAP_SIZE {} does not fit this platform", value))?,
            None => defaults.max_map_size,
        };

        Ok(Self {
            config_path: resolved_path,
            node_id: get_string_value(&config, &["NODE_ID", "node.id"]).unwrap_or(defaults.node_id),
            p2p_host: get_string_value(&config, &["P2P_HOST", "p2p.host"])
                .unwrap_or(defaults.p2p_host),
            p2p_port,
            data_dir: get_string_value(&config, &["DATA_DIR", "node.data_dir"])
                .unwrap_or(defaults.data_dir),
            log_level: get_string_value(&config, &["LOG_LEVEL", "log.level"])
                .unwrap_or(defaults.log_level),
            log_format: get_string_value(&config, &["LOG_FORMAT", "log.format"])
                .unwrap_or(defaults.log_format),
            socket_timeout_ms: get_number_value(
                &config,
                &["SOCKET_TIMEOUT_MS", "p2p.socket_timeout_ms"],
            )
            .unwrap_or(defaults.socket_timeout_ms),
            peers,
            max_map_size,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("NODE_ID must not be empty");
        }
        if self.data_dir.trim().is_empty() {
            anyhow::bail!("DATA_DIR must not be empty");
        }
        if self.socket_timeout_ms == 0 {
            anyhow::bail!("SOCKET_TIMEOUT_MS must be greater than zero");
        }
        if self.max_map_size == 0 {
            anyhow::bail!("MAX_MAP_SIZE must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("LOG_FORMAT must be 'pretty' or 'json', got '{}'", self.log_format);
        }
        Ok(())
    }

    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
            ..NodeConfig::default()
        }
    }

    fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            store_name: STORE_NAME.to_string(),
            retention: RetentionPolicy {
                max_map_size: self.max_map_size,
                ..RetentionPolicy::default()
            },
            ..StorageConfig::default()
        }
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_number_value(config: &Config, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| {
        config
            .get_int(key)
            .ok()
            .and_then(|value| u64::try_from(value).ok())
            .or_else(|| {
                config
                    .get_string(key)
                    .ok()
                    .and_then(|raw| raw.trim().parse::<u64>().ok())
            })
    })
}

/// Comma separated `host:port` list. Invalid entries are skipped with a warning.
fn parse_peers(value: &str) -> Vec<Address> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match Address::from_full_address(entry) {
            Ok(address) => Some(address),
            Err(err) => {
                warn!("Invalid peer address {}: {}", entry, err);
                None
            }
        })
        .collect()
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(node_id) = matches.get_one::<String>("node-id") {
        config.node_id = node_id.clone();
    }

    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = data_dir.clone();
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(p2p_host) = matches.get_one::<String>("p2p-host") {
        config.p2p_host = p2p_host.clone();
    }

    if let Some(p2p_port) = matches.get_one::<u16>("p2p-port") {
        config.p2p_port = *p2p_port;
    }

    if let Some(peers) = matches.get_many::<String>("peer") {
        let peers: Vec<String> = peers.cloned().collect();
        config.peers = parse_peers(&peers.join(","));
    }
}

fn build_cli() -> Command {
    Command::new("tradenet-node")
        .version(TRADENET_VERSION)
        .about("Tradenet P2P node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Logical node identity"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("p2p-host")
                .long("p2p-host")
                .value_name("HOST")
                .help("Interface to listen on"),
        )
        .arg(
            Arg::new("p2p-port")
                .long("p2p-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override P2P port (0 picks a free port)"),
        )
        .arg(
            Arg::new("peer")
                .long("peer")
                .value_name("HOST:PORT")
                .action(ArgAction::Append)
                .help("Peer to connect to at startup; may be repeated"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate the configuration and data directory, then exit"),
        )
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn run_self_check(config: &AppConfig) -> Result<()> {
    let data_dir = Path::new(&config.data_dir);
    fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let persistence = JsonFilePersistence::in_dir(data_dir, STORE_NAME);
    info!("Store file: {}", persistence.path().display());
    info!("Node id: {}", config.node_id);
    info!("Listen address: {}:{}", config.p2p_host, config.p2p_port);
    info!("Configured peers: {}", config.peers.len());
    info!("Configuration OK");
    Ok(())
}

/// Logs store mutations.
struct StoreLogger;

impl DataStorageListener for StoreLogger {
    fn on_added(&self, payload: &AuthenticatedPayload) {
        debug!(
            "Added {} {}",
            payload.meta_data.class_name,
            payload.hash().to_hex()
        );
    }

    fn on_removed(&self, payload: &AuthenticatedPayload) {
        debug!(
            "Removed {} {}",
            payload.meta_data.class_name,
            payload.hash().to_hex()
        );
    }

    fn on_refreshed(&self, payload: &AuthenticatedPayload) {
        debug!(
            "Refreshed {} {}",
            payload.meta_data.class_name,
            payload.hash().to_hex()
        );
    }
}

/// Logs network events for every node identity.
struct NetworkLogger;

impl NodesByIdListener for NetworkLogger {
    fn on_message(&self, node_id: &str, message: &ApplicationMessage, connection: &Arc<Connection>) {
        info!(
            "[{}] {} message ({} bytes) from {}",
            node_id,
            message.kind,
            message.payload.len(),
            connection.peer_address()
        );
    }

    fn on_data_request_result(
        &self,
        node_id: &str,
        request: &AuthenticatedDataRequest,
        result: &DataStorageResult,
        connection: &Arc<Connection>,
    ) {
        if result.is_success() {
            debug!(
                "[{}] Applied {} from {}",
                node_id,
                request.kind(),
                connection.peer_address()
            );
        } else {
            debug!(
                "[{}] Rejected {} from {}: {:?}",
                node_id,
                request.kind(),
                connection.peer_address(),
                result.reason
            );
        }
    }

    fn on_connection(&self, node_id: &str, connection: &Arc<Connection>) {
        info!(
            "[{}] New {} connection with {}",
            node_id,
            connection.direction(),
            connection.peer_address()
        );
    }

    fn on_disconnect(&self, node_id: &str, connection: &Arc<Connection>, reason: CloseReason) {
        info!(
            "[{}] Connection with {} closed ({})",
            node_id,
            connection.peer_address(),
            reason
        );
    }

    fn on_state_change(&self, node_id: &str, state: NodeState) {
        debug!("[{}] Node state: {}", node_id, state);
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!(
        "Starting Tradenet node {} (version {}, commit {})",
        config.node_id,
        TRADENET_VERSION,
        git_commit_hash()
    );
    if let Some(path) = &config.config_path {
        info!("Using configuration file {}", path.display());
    }

    let data_dir = PathBuf::from(&config.data_dir);
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let persistence = Arc::new(JsonFilePersistence::in_dir(&data_dir, STORE_NAME));
    let storage = Arc::new(AuthenticatedDataStorageService::new(
        config.storage_config(),
        persistence,
    ));
    storage.load().context("loading the data store")?;
    storage.add_listener(Arc::new(StoreLogger));
    storage.start_expiry_pruning();

    let transport = Arc::new(ClearNetTransport::new(ClearNetTransportConfig {
        host: config.p2p_host.clone(),
        ..ClearNetTransportConfig::default()
    }));
    let nodes = NodesById::new(
        config.node_config(),
        NodeContext {
            transport,
            authorization: Arc::new(MessageTypeAuthorization),
            ban_list: Arc::new(BanList::new()),
            storage: Some(storage.clone()),
        },
    );
    nodes.add_listener(Arc::new(NetworkLogger));

    let capability = nodes
        .initialize_server(&config.node_id, config.p2p_port)
        .await
        .with_context(|| format!("starting server on {}:{}", config.p2p_host, config.p2p_port))?;
    info!("Node {} reachable at {}", config.node_id, capability.address);

    for peer in &config.peers {
        match nodes.get_connection(&config.node_id, peer, false).await {
            Ok(connection) => info!("Connected to peer {} ({})", peer, connection.id()),
            Err(err) => warn!("Could not connect to peer {}: {}", peer, err),
        }
    }

    info!("Tradenet node is ready and running");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down Tradenet node");

    nodes.shutdown().await;
    storage.shutdown();

    info!("Tradenet node shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;

    if matches.get_flag("check") {
        return run_self_check(&config);
    }

    run(config).await
}
