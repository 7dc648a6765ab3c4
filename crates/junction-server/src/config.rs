//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults
//! - TOML configuration file
//! - Environment variables (JUNCTION_*) and command line flags

use crate::error::StartupError;
use clap::builder::BoolishValueParser;
use clap::Parser;
use junction_protocol::rawsocket::MAX_LENGTH_EXPONENT;
use junction_protocol::uri::validate_uri;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_junction_core::{ClientConfig, RealmConfig, RouterConfig, TransportKind};
use tenvis_junction_transport::{
    validate_path, Network, OriginPolicy, RawSocketOptions, WebSocketOptions,
};
use tracing::info;

/// Config file locations searched when `--config` is not given.
const CONFIG_PATHS: [&str; 3] = [
    "junction.toml",
    "/etc/junction/junction.toml",
    "~/.config/junction/junction.toml",
];

/// Command line arguments. Every flag can also be set through its
/// environment variable.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "junction", version, about = "WAMP router with WebSocket and raw-socket transports")]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "JUNCTION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Realm served by the router.
    #[arg(long, env = "JUNCTION_REALM")]
    pub realm: Option<String>,

    /// Enable the WebSocket transport.
    #[arg(long = "ws-enable", alias = "ws", env = "JUNCTION_WS_ENABLE", value_name = "BOOL",
          num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub ws_enable: Option<bool>,

    /// WebSocket listen host.
    #[arg(long, env = "JUNCTION_WS_HOST")]
    pub ws_host: Option<String>,

    /// WebSocket listen port.
    #[arg(long, env = "JUNCTION_WS_PORT")]
    pub ws_port: Option<u16>,

    /// Origins accepted on WebSocket upgrade; `*` accepts all.
    #[arg(long, env = "JUNCTION_WS_ORIGINS", value_delimiter = ',')]
    pub ws_origins: Option<Vec<String>>,

    /// Enable the raw-socket transport.
    #[arg(long = "rs-enable", alias = "rs", env = "JUNCTION_RS_ENABLE", value_name = "BOOL",
          num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub rs_enable: Option<bool>,

    /// Raw-socket listen host, or socket path for unix networks.
    #[arg(long, env = "JUNCTION_RS_HOST")]
    pub rs_host: Option<String>,

    /// Raw-socket listen port.
    #[arg(long, env = "JUNCTION_RS_PORT")]
    pub rs_port: Option<u16>,

    /// Raw-socket network: tcp, tcp4, tcp6, unix or unixpacket.
    #[arg(long, env = "JUNCTION_RS_PROTO")]
    pub rs_proto: Option<String>,

    /// Register the delayed echo procedure `dev.echo`.
    #[arg(long, env = "JUNCTION_DECHO", value_name = "BOOL",
          num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub decho: Option<bool>,

    /// Publish the time on `dev.time`.
    #[arg(long, env = "JUNCTION_DTIME", value_name = "BOOL",
          num_args = 0..=1, default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub dtime: Option<bool>,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "JUNCTION_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// File configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Realm served by the router.
    #[serde(default = "default_realm")]
    pub realm: String,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub rawsocket: RawSocketConfig,

    #[serde(default)]
    pub demo: DemoConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// WebSocket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ws_host")]
    pub host: String,

    #[serde(default = "default_ws_port")]
    pub port: u16,

    /// Upgrade path.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Accepted origins. Empty means same-origin only.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default = "default_true")]
    pub tracking_cookie: bool,

    /// Keep-alive interval in milliseconds.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
}

/// Raw-socket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen host, or socket path for unix networks.
    #[serde(default = "default_rs_host")]
    pub host: String,

    #[serde(default = "default_rs_port")]
    pub port: u16,

    /// One of tcp, tcp4, tcp6, unix, unixpacket.
    #[serde(default = "default_rs_protocol")]
    pub protocol: String,

    /// Keep-alive interval in milliseconds.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// Announced maximum message length exponent (`2^(9 + n)` octets).
    #[serde(default = "default_length_exponent")]
    pub max_length_exponent: u8,
}

/// Demo workloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemoConfig {
    /// Register `dev.echo`.
    #[serde(default)]
    pub echo: bool,

    /// Publish on `dev.time`.
    #[serde(default)]
    pub time: bool,

    #[serde(default = "default_echo_delay_ms")]
    pub echo_delay_ms: u64,

    #[serde(default = "default_time_interval_ms")]
    pub time_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_realm() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ws_host() -> String {
    "localhost".to_string()
}

fn default_ws_port() -> u16 {
    8951
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_rs_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rs_port() -> u16 {
    8952
}

fn default_rs_protocol() -> String {
    "tcp".to_string()
}

fn default_keep_alive_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_length_exponent() -> u8 {
    MAX_LENGTH_EXPONENT
}

fn default_echo_delay_ms() -> u64 {
    2_000
}

fn default_time_interval_ms() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            websocket: WebSocketConfig::default(),
            rawsocket: RawSocketConfig::default(),
            demo: DemoConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_ws_host(),
            port: default_ws_port(),
            path: default_ws_path(),
            allowed_origins: Vec::new(),
            compression: true,
            tracking_cookie: true,
            keep_alive_ms: default_keep_alive_ms(),
        }
    }
}

impl Default for RawSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_rs_host(),
            port: default_rs_port(),
            protocol: default_rs_protocol(),
            keep_alive_ms: default_keep_alive_ms(),
            max_length_exponent: default_length_exponent(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            echo: false,
            time: false,
            echo_delay_ms: default_echo_delay_ms(),
            time_interval_ms: default_time_interval_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load the configuration file named by `--config`, or the first one
    /// found in the default locations, then apply flags and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or parsed.
    pub fn load(cli: &Cli) -> Result<Self, StartupError> {
        let mut config = match cli.config.as_deref() {
            Some(path) => Self::from_file(path)?,
            None => Self::discover()?,
        };
        config.apply_cli(cli);
        Ok(config)
    }

    fn discover() -> Result<Self, StartupError> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StartupError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StartupError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config: Config = toml::from_str(&contents).map_err(|e| {
            StartupError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?;

        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Override file values with flags and environment variables.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(realm) = &cli.realm {
            self.realm = realm.clone();
        }
        if let Some(enabled) = cli.ws_enable {
            self.websocket.enabled = enabled;
        }
        if let Some(host) = &cli.ws_host {
            self.websocket.host = host.clone();
        }
        if let Some(port) = cli.ws_port {
            self.websocket.port = port;
        }
        if let Some(origins) = &cli.ws_origins {
            self.websocket.allowed_origins = origins.clone();
        }
        if let Some(enabled) = cli.rs_enable {
            self.rawsocket.enabled = enabled;
        }
        if let Some(host) = &cli.rs_host {
            self.rawsocket.host = host.clone();
        }
        if let Some(port) = cli.rs_port {
            self.rawsocket.port = port;
        }
        if let Some(protocol) = &cli.rs_proto {
            self.rawsocket.protocol = protocol.clone();
        }
        if let Some(echo) = cli.decho {
            self.demo.echo = echo;
        }
        if let Some(time) = cli.dtime {
            self.demo.time = time;
        }
        if let Some(port) = cli.metrics_port {
            self.metrics.enabled = true;
            self.metrics.port = port;
        }
    }

    /// Validate and resolve into startup settings.
    ///
    /// # Errors
    ///
    /// Fails if no transport is enabled, the realm is not a valid URI, the
    /// raw-socket network is unknown, a unix socket has no path, the
    /// WebSocket path cannot be routed, or the time interval is zero.
    pub fn resolve(self) -> Result<Settings, StartupError> {
        if !self.websocket.enabled && !self.rawsocket.enabled {
            return Err(StartupError::Configuration(
                "no transport enabled; enable websocket or rawsocket".to_string(),
            ));
        }

        validate_uri(&self.realm).map_err(|reason| {
            StartupError::Configuration(format!("invalid realm {:?}: {}", self.realm, reason))
        })?;

        let network: Network = self.rawsocket.protocol.parse().map_err(|_| {
            StartupError::Configuration(format!(
                "unknown raw-socket protocol {:?}; expected tcp, tcp4, tcp6, unix or unixpacket",
                self.rawsocket.protocol
            ))
        })?;
        if self.rawsocket.enabled && network.is_unix() && self.rawsocket.host.trim().is_empty() {
            return Err(StartupError::Configuration(format!(
                "{} raw socket needs a socket path in rawsocket.host",
                network
            )));
        }
        if self.rawsocket.max_length_exponent > MAX_LENGTH_EXPONENT {
            return Err(StartupError::Configuration(format!(
                "rawsocket.max_length_exponent must be at most {}",
                MAX_LENGTH_EXPONENT
            )));
        }
        if self.websocket.enabled {
            validate_path(&self.websocket.path)
                .map_err(|e| StartupError::Configuration(format!("websocket.path: {}", e)))?;
        }
        if self.demo.time_interval_ms == 0 {
            return Err(StartupError::Configuration(
                "demo.time_interval_ms must be greater than zero".to_string(),
            ));
        }

        let websocket = WebSocketSpec {
            enabled: self.websocket.enabled,
            host: self.websocket.host,
            port: self.websocket.port,
            options: WebSocketOptions {
                path: self.websocket.path,
                enable_compression: self.websocket.compression,
                origin_policy: OriginPolicy::from_origins(&self.websocket.allowed_origins),
                tracking_cookie: self.websocket.tracking_cookie,
                keep_alive: Duration::from_millis(self.websocket.keep_alive_ms),
                ..WebSocketOptions::default()
            },
        };
        let rawsocket = RawSocketSpec {
            enabled: self.rawsocket.enabled,
            host: self.rawsocket.host,
            port: self.rawsocket.port,
            network,
            options: RawSocketOptions {
                keep_alive: Duration::from_millis(self.rawsocket.keep_alive_ms),
                length_exponent: self.rawsocket.max_length_exponent,
                ..RawSocketOptions::default()
            },
        };

        Ok(Settings {
            router: RouterConfiguration {
                realm: self.realm,
                anonymous_auth: true,
                allow_disclose: true,
            },
            transports: vec![
                TransportSpec::WebSocket(websocket),
                TransportSpec::RawSocket(rawsocket),
            ],
            demo: DemoSettings {
                echo: self.demo.echo,
                time: self.demo.time,
                echo_delay: Duration::from_millis(self.demo.echo_delay_ms),
                time_interval: Duration::from_millis(self.demo.time_interval_ms),
            },
            metrics_port: self.metrics.enabled.then_some(self.metrics.port),
        })
    }
}

/// Validated startup settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub router: RouterConfiguration,
    /// In startup order.
    pub transports: Vec<TransportSpec>,
    pub demo: DemoSettings,
    pub metrics_port: Option<u16>,
}

/// The realm and its policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfiguration {
    pub realm: String,
    pub anonymous_auth: bool,
    pub allow_disclose: bool,
}

impl RouterConfiguration {
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig::single(
            RealmConfig::new(self.realm.clone())
                .with_anonymous_auth(self.anonymous_auth)
                .with_allow_disclose(self.allow_disclose),
        )
    }

    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.realm.clone())
    }
}

/// One transport to start.
#[derive(Debug, Clone)]
pub enum TransportSpec {
    WebSocket(WebSocketSpec),
    RawSocket(RawSocketSpec),
}

impl TransportSpec {
    #[must_use]
    pub fn enabled(&self) -> bool {
        match self {
            TransportSpec::WebSocket(spec) => spec.enabled,
            TransportSpec::RawSocket(spec) => spec.enabled,
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSpec::WebSocket(_) => TransportKind::WebSocket,
            TransportSpec::RawSocket(_) => TransportKind::RawSocket,
        }
    }

    /// Bind address as passed to the listener.
    #[must_use]
    pub fn address(&self) -> String {
        match self {
            TransportSpec::WebSocket(spec) => host_port(&spec.host, spec.port),
            TransportSpec::RawSocket(spec) if spec.network.is_unix() => spec.host.clone(),
            TransportSpec::RawSocket(spec) => host_port(&spec.host, spec.port),
        }
    }
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketSpec {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub options: WebSocketOptions,
}

#[derive(Debug, Clone)]
pub struct RawSocketSpec {
    pub enabled: bool,
    /// Host, or socket path for unix networks.
    pub host: String,
    pub port: u16,
    pub network: Network,
    pub options: RawSocketOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSettings {
    pub echo: bool,
    pub time: bool,
    pub echo_delay: Duration,
    pub time_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let settings = Config::default().resolve().unwrap();
        assert_eq!(settings.router.realm, "default");
        assert!(settings.router.anonymous_auth);
        assert!(settings.router.allow_disclose);
        assert_eq!(settings.metrics_port, None);

        let addresses: Vec<String> = settings.transports.iter().map(TransportSpec::address).collect();
        assert_eq!(addresses, vec!["localhost:8951", "127.0.0.1:8952"]);
        assert!(matches!(settings.transports[0], TransportSpec::WebSocket(_)));

        match &settings.transports[0] {
            TransportSpec::WebSocket(ws) => {
                assert_eq!(ws.options.keep_alive, Duration::from_secs(30));
                assert!(ws.options.enable_compression);
                assert!(ws.options.tracking_cookie);
                assert_eq!(ws.options.origin_policy, OriginPolicy::SameOrigin);
            }
            other => panic!("Expected WebSocket spec, got {:?}", other),
        }
        assert_eq!(settings.demo.echo_delay, Duration::from_secs(2));
        assert_eq!(settings.demo.time_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_no_transport_enabled() {
        let mut config = Config::default();
        config.websocket.enabled = false;
        config.rawsocket.enabled = false;

        match config.resolve() {
            Err(StartupError::Configuration(msg)) => assert!(msg.contains("no transport")),
            other => panic!("Expected Configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.realm = "bad realm".to_string();
        assert!(matches!(config.resolve(), Err(StartupError::Configuration(_))));

        let mut config = Config::default();
        config.rawsocket.protocol = "udp".to_string();
        assert!(matches!(config.resolve(), Err(StartupError::Configuration(_))));

        let mut config = Config::default();
        config.rawsocket.protocol = "unix".to_string();
        config.rawsocket.host = String::new();
        assert!(matches!(config.resolve(), Err(StartupError::Configuration(_))));
    }

    #[test]
    fn test_zero_time_interval_rejected() {
        let mut config = Config::default();
        config.demo.time = true;
        config.demo.time_interval_ms = 0;

        match config.resolve() {
            Err(StartupError::Configuration(msg)) => assert!(msg.contains("time_interval_ms")),
            other => panic!("Expected Configuration error, got {:?}", other),
        }

        // Zero keep-alive disables pings instead of ticking.
        let mut config = Config::default();
        config.websocket.keep_alive_ms = 0;
        config.rawsocket.keep_alive_ms = 0;
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn test_websocket_path_validated() {
        for path in ["ws", "/health", "/ws/:id"] {
            let mut config = Config::default();
            config.websocket.path = path.to_string();
            match config.resolve() {
                Err(StartupError::Configuration(msg)) => assert!(msg.contains("websocket.path")),
                other => panic!("Expected Configuration error for {:?}, got {:?}", path, other),
            }
        }

        let mut config = Config::default();
        config.websocket.path = "/ws".to_string();
        assert!(config.resolve().is_ok());

        // Ignored while the transport is off.
        let mut config = Config::default();
        config.websocket.enabled = false;
        config.websocket.path = "ws".to_string();
        assert!(config.resolve().is_ok());
    }

    #[test]
    fn test_unix_address_is_path() {
        let mut config = Config::default();
        config.rawsocket.protocol = "unixpacket".to_string();
        config.rawsocket.host = "/tmp/junction.sock".to_string();
        let settings = config.resolve().unwrap();
        assert_eq!(settings.transports[1].address(), "/tmp/junction.sock");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            realm = "realm1"

            [websocket]
            port = 9000
            allowed_origins = ["*"]

            [rawsocket]
            enabled = false

            [demo]
            echo = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.realm, "realm1");
        assert_eq!(config.websocket.port, 9000);
        assert_eq!(config.websocket.host, "localhost");
        assert!(!config.rawsocket.enabled);
        assert!(config.demo.echo);
        assert_eq!(config.demo.echo_delay_ms, 2000);

        let settings = config.resolve().unwrap();
        match &settings.transports[0] {
            TransportSpec::WebSocket(ws) => assert_eq!(ws.options.origin_policy, OriginPolicy::AllowAll),
            other => panic!("Expected WebSocket spec, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = Cli::try_parse_from([
            "junction",
            "--realm",
            "realm2",
            "--ws=false",
            "--rs-proto",
            "tcp6",
            "--rs-host",
            "::1",
            "--decho",
            "--metrics-port",
            "9100",
        ])
        .unwrap();

        let mut config = Config::default();
        config.apply_cli(&cli);
        assert_eq!(config.realm, "realm2");
        assert!(!config.websocket.enabled);
        assert!(config.demo.echo);
        assert!(!config.demo.time);

        let settings = config.resolve().unwrap();
        assert_eq!(settings.transports[1].address(), "[::1]:8952");
        assert_eq!(settings.metrics_port, Some(9100));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junction.toml");
        std::fs::write(&path, "realm = \"from-file\"\n[rawsocket]\nport = 7000\n").unwrap();

        let cli = Cli {
            config: Some(path),
            rs_port: Some(7001),
            ..Cli::default()
        };
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.realm, "from-file");
        assert_eq!(config.rawsocket.port, 7001);

        let missing = Cli {
            config: Some(dir.path().join("missing.toml")),
            ..Cli::default()
        };
        assert!(matches!(Config::load(&missing), Err(StartupError::Configuration(_))));
    }
}
