//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "vetrina";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_POOL_MIN_INSTANCES: u32 = 2;
const DEFAULT_POOL_MAX_USES: u32 = 50;
const DEFAULT_POOL_SETTLE_DELAY_MS: u64 = 100;
const DEFAULT_STABILITY_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_ASSET_DIR: &str = "public";
const DEFAULT_INDEX_FILE: &str = "index.html";
const DEFAULT_INTERNAL_ASSET_MARKER: &str = "/public/";
const DEFAULT_VISITOR_HEADER: &str = "x-visitor-id";
const DEFAULT_ROUTE: &str = "home";

fn default_bypass_markers() -> Vec<String> {
    ["/api/", "/oidc/", "/sys/", "/_health"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Command-line arguments for the Vetrina binary.
#[derive(Debug, Parser)]
#[command(name = "vetrina", version, about = "Vetrina SSR gateway")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VETRINA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the Vetrina HTTP gateway.
    Serve(Box<ServeArgs>),
    /// Render a single application path and print the document to stdout.
    #[command(name = "render")]
    RenderPath(RenderPathArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RenderPathArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,

    /// Application path to render, including the leading slash.
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of pooled rendering environments.
    #[arg(long = "pool-min-instances", value_name = "COUNT")]
    pub pool_min_instances: Option<u32>,

    /// Override the per-environment usage ceiling before retirement.
    #[arg(long = "pool-max-uses", value_name = "COUNT")]
    pub pool_max_uses: Option<u32>,

    /// Override the settle delay between environment constructions.
    #[arg(long = "pool-settle-delay-ms", value_name = "MILLIS")]
    pub pool_settle_delay_ms: Option<u64>,

    /// Override the acquire timeout; zero disables the bound entirely.
    #[arg(long = "pool-acquire-timeout-ms", value_name = "MILLIS")]
    pub pool_acquire_timeout_ms: Option<u64>,

    /// Override the per-request stability wait ceiling.
    #[arg(long = "ssr-stability-timeout-ms", value_name = "MILLIS")]
    pub ssr_stability_timeout_ms: Option<u64>,

    /// Override the directory holding the client build output.
    #[arg(long = "assets-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub assets_directory: Option<PathBuf>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub pool: PoolConfigSettings,
    pub ssr: SsrSettings,
    pub assets: AssetSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct PoolConfigSettings {
    pub min_instances: NonZeroU32,
    pub max_uses: NonZeroU32,
    pub settle_delay: Duration,
    /// `None` preserves the historical unbounded wait for a free environment.
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SsrSettings {
    pub stability_timeout: Duration,
    pub bypass_markers: Vec<String>,
    pub visitor_header: String,
    pub default_route: String,
    pub known_routes: Vec<String>,
    pub routes: Vec<RouteSettings>,
}

/// One registry entry: a normalized application path and an optional upstream
/// JSON endpoint whose response is injected as the pre-fetched payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSettings {
    pub path: String,
    #[serde(default)]
    pub data_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssetSettings {
    pub directory: PathBuf,
    pub index_file: String,
    pub internal_marker: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("VETRINA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_overrides(&args.overrides),
        Some(Command::RenderPath(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    pool: RawPoolSettings,
    ssr: RawSsrSettings,
    assets: RawAssetSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(count) = overrides.pool_min_instances {
            self.pool.min_instances = Some(count);
        }
        if let Some(count) = overrides.pool_max_uses {
            self.pool.max_uses = Some(count);
        }
        if let Some(millis) = overrides.pool_settle_delay_ms {
            self.pool.settle_delay_ms = Some(millis);
        }
        if let Some(millis) = overrides.pool_acquire_timeout_ms {
            self.pool.acquire_timeout_ms = Some(millis);
        }
        if let Some(millis) = overrides.ssr_stability_timeout_ms {
            self.ssr.stability_timeout_ms = Some(millis);
        }
        if let Some(directory) = overrides.assets_directory.as_ref() {
            self.assets.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            pool,
            ssr,
            assets,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let pool = build_pool_settings(pool)?;
        let ssr = build_ssr_settings(ssr)?;
        let assets = build_asset_settings(assets)?;

        Ok(Self {
            server,
            logging,
            pool,
            ssr,
            assets,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolConfigSettings, LoadError> {
    let min_instances = non_zero_u32(
        pool.min_instances.unwrap_or(DEFAULT_POOL_MIN_INSTANCES).into(),
        "pool.min_instances",
    )?;
    let max_uses = non_zero_u32(
        pool.max_uses.unwrap_or(DEFAULT_POOL_MAX_USES).into(),
        "pool.max_uses",
    )?;

    let settle_delay = Duration::from_millis(
        pool.settle_delay_ms.unwrap_or(DEFAULT_POOL_SETTLE_DELAY_MS),
    );

    // Zero keeps the historical behavior: wait forever for a free environment.
    let acquire_timeout = match pool.acquire_timeout_ms {
        None | Some(0) => None,
        Some(millis) => Some(Duration::from_millis(millis)),
    };

    Ok(PoolConfigSettings {
        min_instances,
        max_uses,
        settle_delay,
        acquire_timeout,
    })
}

fn build_ssr_settings(ssr: RawSsrSettings) -> Result<SsrSettings, LoadError> {
    let stability_millis = ssr
        .stability_timeout_ms
        .unwrap_or(DEFAULT_STABILITY_TIMEOUT_MS);
    if stability_millis == 0 {
        return Err(LoadError::invalid(
            "ssr.stability_timeout_ms",
            "must be greater than zero",
        ));
    }

    let visitor_header = ssr
        .visitor_header
        .unwrap_or_else(|| DEFAULT_VISITOR_HEADER.to_string())
        .to_ascii_lowercase();
    if visitor_header.is_empty() {
        return Err(LoadError::invalid(
            "ssr.visitor_header",
            "header name must not be empty",
        ));
    }

    let default_route = ssr
        .default_route
        .unwrap_or_else(|| DEFAULT_ROUTE.to_string());
    if default_route.is_empty() {
        return Err(LoadError::invalid(
            "ssr.default_route",
            "route name must not be empty",
        ));
    }

    let mut known_routes = ssr.known_routes.unwrap_or_default();
    if !known_routes.contains(&default_route) {
        known_routes.push(default_route.clone());
    }

    for route in &ssr.routes {
        if !route.path.starts_with('/') {
            return Err(LoadError::invalid(
                "ssr.routes",
                format!("route path `{}` must start with a slash", route.path),
            ));
        }
    }

    Ok(SsrSettings {
        stability_timeout: Duration::from_millis(stability_millis),
        bypass_markers: ssr.bypass_markers.unwrap_or_else(default_bypass_markers),
        visitor_header,
        default_route,
        known_routes,
        routes: ssr.routes,
    })
}

fn build_asset_settings(assets: RawAssetSettings) -> Result<AssetSettings, LoadError> {
    let directory = assets
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSET_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "assets.directory",
            "path must not be empty",
        ));
    }

    let index_file = assets
        .index_file
        .unwrap_or_else(|| DEFAULT_INDEX_FILE.to_string());
    if index_file.is_empty() {
        return Err(LoadError::invalid(
            "assets.index_file",
            "file name must not be empty",
        ));
    }

    let internal_marker = assets
        .internal_marker
        .unwrap_or_else(|| DEFAULT_INTERNAL_ASSET_MARKER.to_string());
    if internal_marker.is_empty() {
        return Err(LoadError::invalid(
            "assets.internal_marker",
            "marker must not be empty",
        ));
    }

    Ok(AssetSettings {
        directory,
        index_file,
        internal_marker,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    public_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    min_instances: Option<u32>,
    max_uses: Option<u32>,
    settle_delay_ms: Option<u64>,
    acquire_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSsrSettings {
    stability_timeout_ms: Option<u64>,
    bypass_markers: Option<Vec<String>>,
    visitor_header: Option<String>,
    default_route: Option<String>,
    known_routes: Option<Vec<String>>,
    routes: Vec<RouteSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAssetSettings {
    directory: Option<PathBuf>,
    index_file: Option<String>,
    internal_marker: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.public_port = Some(4000);
        raw.pool.min_instances = Some(4);

        let overrides = ServeOverrides {
            public_port: Some(4321),
            pool_min_instances: Some(8),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.public_addr.port(), 4321);
        assert_eq!(settings.pool.min_instances.get(), 8);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn pool_defaults_match_documented_values() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
        assert_eq!(settings.pool.min_instances.get(), DEFAULT_POOL_MIN_INSTANCES);
        assert_eq!(settings.pool.max_uses.get(), DEFAULT_POOL_MAX_USES);
        assert_eq!(
            settings.pool.settle_delay,
            Duration::from_millis(DEFAULT_POOL_SETTLE_DELAY_MS)
        );
        assert!(settings.pool.acquire_timeout.is_none());
    }

    #[test]
    fn zero_acquire_timeout_means_unbounded() {
        let mut raw = RawSettings::default();
        raw.pool.acquire_timeout_ms = Some(0);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.pool.acquire_timeout.is_none());
    }

    #[test]
    fn acquire_timeout_can_be_enabled() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            pool_acquire_timeout_ms: Some(1_500),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(
            settings.pool.acquire_timeout,
            Some(Duration::from_millis(1_500))
        );
    }

    #[test]
    fn zero_min_instances_is_rejected() {
        let mut raw = RawSettings::default();
        raw.pool.min_instances = Some(0);
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key, .. }) if key == "pool.min_instances"
        ));
    }

    #[test]
    fn default_route_is_always_a_known_route() {
        let mut raw = RawSettings::default();
        raw.ssr.default_route = Some("landing".to_string());
        raw.ssr.known_routes = Some(vec!["contact".to_string()]);

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.ssr.known_routes.contains(&"landing".to_string()));
        assert!(settings.ssr.known_routes.contains(&"contact".to_string()));
    }

    #[test]
    fn route_paths_must_be_absolute() {
        let mut raw = RawSettings::default();
        raw.ssr.routes = vec![RouteSettings {
            path: "home".to_string(),
            data_url: None,
        }];
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key, .. }) if key == "ssr.routes"
        ));
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["vetrina"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_render_arguments() {
        let args = CliArgs::parse_from([
            "vetrina",
            "render",
            "--pool-min-instances",
            "1",
            "/workspace/home",
        ]);

        match args.command.expect("render command") {
            Command::RenderPath(render) => {
                assert_eq!(render.path, "/workspace/home");
                assert_eq!(render.overrides.pool_min_instances, Some(1));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "vetrina",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--pool-max-uses",
            "10",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(serve.overrides.pool_max_uses, Some(10));
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
