//! Configuration module for filexfer.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::bench::{HarnessOptions, WorkerArgs};
use crate::pool::ExecutorKind;
use crate::server::connection::ConnectionOptions;
use crate::server::{ServeWorkerArgs, ServerOptions};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "filexfer")]
#[command(author = "filexfer authors")]
#[command(version = "0.1.0")]
#[command(about = "File transfer server and throughput benchmark client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the file server
    Serve(ServeArgs),
    /// List files on the server
    List(ClientArgs),
    /// Download benchmark
    Download {
        #[command(flatten)]
        client: ClientArgs,
        /// 1-based file numbers separated by commas, or "all"
        #[arg(long, default_value = "all")]
        select: String,
    },
    /// Upload benchmark with a generated random file
    Upload {
        #[command(flatten)]
        client: ClientArgs,
        /// Payload size in MB
        #[arg(long)]
        size_mb: u64,
    },
    /// Delete a file on the server
    Delete {
        #[command(flatten)]
        client: ClientArgs,
        filename: String,
    },
    /// Run one transfer task and print its outcome (process executor)
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// Serve connections for a supervising server (process executor)
    #[command(hide = true)]
    ServeWorker(ServeWorkerArgs),
}

/// Server overrides
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 127.0.0.1:6677)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Worker pool size (0 = serve connections one at a time)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Execution unit for workers
    #[arg(short = 'e', long, value_enum)]
    pub executor: Option<ExecutorKind>,

    /// Directory holding served files
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Connections allowed to wait for a free worker
    #[arg(long)]
    pub queue_limit: Option<usize>,

    /// Seconds to wait for a complete request
    #[arg(long)]
    pub receive_timeout: Option<u64>,

    /// Seconds in-flight connections get after shutdown
    #[arg(long)]
    pub shutdown_grace: Option<u64>,
}

/// Client overrides
#[derive(Args, Debug, Default)]
pub struct ClientArgs {
    /// Server address (e.g., 127.0.0.1:6677)
    #[arg(long)]
    pub server: Option<String>,

    /// Client worker pool size (0 = one task at a time)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Execution unit for client tasks
    #[arg(short = 'e', long, value_enum)]
    pub executor: Option<ExecutorKind>,

    /// Server pool size recorded in the results
    #[arg(long)]
    pub server_workers: Option<usize>,

    /// Round trip timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Largest response body accepted, in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// CSV file receiving one row per benchmark run
    #[arg(long)]
    pub ledger: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_executor")]
    pub executor: ExecutorKind,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Seconds
    #[serde(default = "default_io_timeout")]
    pub receive_timeout: u64,
    /// Seconds
    #[serde(default = "default_io_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    pub queue_limit: Option<usize>,
    /// Seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            executor: default_executor(),
            storage_dir: default_storage_dir(),
            receive_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            max_frame_size: default_max_frame_size(),
            queue_limit: None,
            shutdown_grace: default_shutdown_grace(),
            backlog: default_backlog(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_listen")]
    pub server: String,
    /// Seconds
    #[serde(default = "default_client_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_executor")]
    pub executor: ExecutorKind,
    #[serde(default)]
    pub server_workers: usize,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_listen(),
            timeout: default_client_timeout(),
            max_frame_size: default_max_frame_size(),
            workers: default_workers(),
            executor: default_executor(),
            server_workers: 0,
            download_dir: default_download_dir(),
            upload_dir: default_upload_dir(),
            ledger: default_ledger(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:6677".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_executor() -> ExecutorKind {
    ExecutorKind::Thread
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("server_files")
}

fn default_io_timeout() -> u64 {
    60
}

fn default_max_frame_size() -> usize {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_backlog() -> i32 {
    50
}

fn default_client_timeout() -> u64 {
    300
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloaded_files")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("upload_files")
}

fn default_ledger() -> PathBuf {
    PathBuf::from("stress_test_results.csv")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server: String,
    pub timeout: Duration,
    pub max_frame_size: usize,
    pub ledger: PathBuf,
    pub harness: HarnessOptions,
}

/// What the binary was asked to do, with settings resolved
#[derive(Debug, Clone)]
pub enum Action {
    Serve(ServerOptions),
    List(ClientSettings),
    Download {
        settings: ClientSettings,
        selection: String,
    },
    Upload {
        settings: ClientSettings,
        size_mb: u64,
    },
    Delete {
        settings: ClientSettings,
        filename: String,
    },
    Worker(WorkerArgs),
    ServeWorker(ServeWorkerArgs),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        let server = toml_config.server;
        let client = toml_config.client;
        let action = match cli.command {
            Commands::Serve(args) => Action::Serve(server_options(args, server)),
            Commands::List(args) => Action::List(client_settings(args, client)),
            Commands::Download {
                client: args,
                select,
            } => Action::Download {
                settings: client_settings(args, client),
                selection: select,
            },
            Commands::Upload {
                client: args,
                size_mb,
            } => Action::Upload {
                settings: client_settings(args, client),
                size_mb,
            },
            Commands::Delete {
                client: args,
                filename,
            } => Action::Delete {
                settings: client_settings(args, client),
                filename,
            },
            Commands::Worker(args) => Action::Worker(args),
            Commands::ServeWorker(args) => Action::ServeWorker(args),
        };

        Config { action, log_level }
    }
}

fn server_options(cli: ServeArgs, file: ServerConfig) -> ServerOptions {
    ServerOptions {
        listen: cli.listen.unwrap_or(file.listen),
        workers: cli.workers.unwrap_or(file.workers),
        executor: cli.executor.unwrap_or(file.executor),
        storage_dir: cli.storage_dir.unwrap_or(file.storage_dir),
        connection: ConnectionOptions {
            receive_timeout: Duration::from_secs(
                cli.receive_timeout.unwrap_or(file.receive_timeout),
            ),
            write_timeout: Duration::from_secs(file.write_timeout),
            max_frame_size: file.max_frame_size,
        },
        queue_limit: cli.queue_limit.or(file.queue_limit),
        shutdown_grace: Duration::from_secs(cli.shutdown_grace.unwrap_or(file.shutdown_grace)),
        backlog: file.backlog,
        worker_program: None,
    }
}

fn client_settings(cli: ClientArgs, file: ClientConfig) -> ClientSettings {
    ClientSettings {
        server: cli.server.unwrap_or(file.server),
        timeout: Duration::from_secs(cli.timeout.unwrap_or(file.timeout)),
        max_frame_size: cli.max_frame_size.unwrap_or(file.max_frame_size),
        ledger: cli.ledger.unwrap_or(file.ledger),
        harness: HarnessOptions {
            client_workers: cli.workers.unwrap_or(file.workers),
            server_workers: cli.server_workers.unwrap_or(file.server_workers),
            executor: cli.executor.unwrap_or(file.executor),
            download_dir: cli.download_dir.unwrap_or(file.download_dir),
            upload_dir: cli.upload_dir.unwrap_or(file.upload_dir),
            worker_program: None,
        },
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:6677");
        assert_eq!(config.server.workers, 1);
        assert_eq!(config.server.executor, ExecutorKind::Thread);
        assert_eq!(config.server.backlog, 50);
        assert_eq!(config.server.queue_limit, None);
        assert_eq!(config.client.timeout, 300);
        assert_eq!(config.client.max_frame_size, 1024 * 1024 * 1024);
        assert_eq!(config.client.ledger, PathBuf::from("stress_test_results.csv"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"
            workers = 4
            executor = "process"
            queue_limit = 16

            [client]
            server = "10.0.0.5:7000"
            timeout = 30
            max_frame_size = 2048
            workers = 8

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.executor, ExecutorKind::Process);
        assert_eq!(config.server.queue_limit, Some(16));
        assert_eq!(config.server.storage_dir, PathBuf::from("server_files"));
        assert_eq!(config.client.server, "10.0.0.5:7000");
        assert_eq!(config.client.timeout, 30);
        assert_eq!(config.client.max_frame_size, 2048);
        assert_eq!(config.client.workers, 8);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            workers = 4
            storage_dir = "from_file"

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();
        let cli = parse(&["filexfer", "serve", "--workers", "0", "-e", "process"]);

        let config = Config::merge(cli, file);
        assert_eq!(config.log_level, "warn");
        match config.action {
            Action::Serve(options) => {
                assert_eq!(options.workers, 0);
                assert_eq!(options.executor, ExecutorKind::Process);
                assert_eq!(options.storage_dir, PathBuf::from("from_file"));
                assert_eq!(options.listen, "127.0.0.1:6677");
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_client_subcommands() {
        let cli = parse(&[
            "filexfer",
            "--log-level",
            "debug",
            "download",
            "--server",
            "127.0.0.1:9000",
            "-w",
            "5",
            "--select",
            "1,2",
            "--max-frame-size",
            "4096",
        ]);
        let config = Config::merge(cli, TomlConfig::default());
        assert_eq!(config.log_level, "debug");
        match config.action {
            Action::Download {
                settings,
                selection,
            } => {
                assert_eq!(settings.server, "127.0.0.1:9000");
                assert_eq!(settings.harness.client_workers, 5);
                assert_eq!(settings.timeout, Duration::from_secs(300));
                assert_eq!(settings.max_frame_size, 4096);
                assert_eq!(selection, "1,2");
            }
            other => panic!("unexpected action: {:?}", other),
        }

        let cli = parse(&["filexfer", "upload", "--size-mb", "10"]);
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()).action,
            Action::Upload { size_mb: 10, .. }
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = parse(&["filexfer", "--config", "/nonexistent/filexfer.toml", "list"]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
