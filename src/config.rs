//! Configuration for the client and server binaries.
//!
//! The client is configured from the command line only. The server also
//! accepts a TOML file; CLI arguments take precedence over file values.

use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Default server logic program handed each accepted connection.
pub const DEFAULT_HANDLER_PROGRAM: &str = "/usr/local/bin/simple_message_server_logic";

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 10;

/// Command-line arguments for the message client
#[derive(Parser, Debug)]
#[command(name = "simple-message-client")]
#[command(version = "0.1.0")]
#[command(about = "Post a message to the bulletin board server", long_about = None)]
pub struct ClientArgs {
    /// Fully qualified domain name or IP address of the server
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub server: String,

    /// Well-known port of the server
    #[arg(short, long)]
    pub port: u16,

    /// Name of the posting user
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub user: String,

    /// URL pointing to an image of the posting user
    #[arg(short, long)]
    pub image: Option<String>,

    /// Message to be added to the bulletin board
    #[arg(short, long, value_parser = NonEmptyStringValueParser::new())]
    pub message: String,

    /// Directory the returned documents are written to
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Verbose output (same as --log-level debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub message: String,
    pub image_url: Option<String>,
    pub output_dir: PathBuf,
    pub log_level: String,
}

impl ClientConfig {
    /// Parse from the process arguments. Exits with usage text on error.
    pub fn load() -> Self {
        Self::from_args(ClientArgs::parse())
    }

    pub fn from_args(args: ClientArgs) -> Self {
        let log_level = if args.verbose {
            "debug".to_string()
        } else {
            args.log_level
        };
        Self {
            server: args.server,
            port: args.port,
            user: args.user,
            message: args.message,
            image_url: args.image,
            output_dir: args.output_dir,
            log_level,
        }
    }
}

/// Command-line arguments for the message server
#[derive(Parser, Debug)]
#[command(name = "simple-message-server")]
#[command(version = "0.1.0")]
#[command(about = "Accept message postings and hand each connection to the server logic", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port of the server
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Local host/address to bind
    #[arg(short = 'l', long)]
    pub listen_host: Option<String>,

    /// Program run for each connection, with the connection as stdin/stdout
    #[arg(long)]
    pub logic: Option<PathBuf>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub handler: HandlerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            backlog: default_backlog(),
        }
    }
}

/// Per-connection handler program
#[derive(Debug, Deserialize)]
pub struct HandlerSection {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for HandlerSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_program() -> PathBuf {
    PathBuf::from(DEFAULT_HANDLER_PROGRAM)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub handler_program: PathBuf,
    pub handler_args: Vec<String>,
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values.
    fn merge(cli: ServerArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;

        Ok(ServerConfig {
            host: cli.listen_host.unwrap_or(toml_config.server.host),
            port,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            handler_program: cli.logic.unwrap_or(toml_config.handler.program),
            handler_args: toml_config.handler.args,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    /// Neither the command line nor the file named a port.
    MissingPort,
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
            ConfigError::MissingPort => write!(f, "No port given (use --port or [server] port)"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_args(args: &[&str]) -> ServerArgs {
        ServerArgs::try_parse_from(std::iter::once("simple-message-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_client_args() {
        let args = ClientArgs::try_parse_from([
            "simple-message-client",
            "-s",
            "localhost",
            "-p",
            "6789",
            "-u",
            "alice",
            "-m",
            "hello\nworld",
            "-i",
            "http://x/y.png",
            "-v",
        ])
        .unwrap();
        let config = ClientConfig::from_args(args);

        assert_eq!(config.server, "localhost");
        assert_eq!(config.port, 6789);
        assert_eq!(config.message, "hello\nworld");
        assert_eq!(config.image_url.as_deref(), Some("http://x/y.png"));
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_client_rejects_empty_user_and_bad_port() {
        let empty_user = ClientArgs::try_parse_from([
            "simple-message-client", "-s", "h", "-p", "1", "-u", "", "-m", "hi",
        ]);
        assert!(empty_user.is_err());

        let bad_port = ClientArgs::try_parse_from([
            "simple-message-client", "-s", "h", "-p", "70000", "-u", "a", "-m", "hi",
        ]);
        assert!(bad_port.is_err());

        let missing_message =
            ClientArgs::try_parse_from(["simple-message-client", "-s", "h", "-p", "1", "-u", "a"]);
        assert!(missing_message.is_err());
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::merge(server_args(&["-p", "6789"]), TomlConfig::default())
            .unwrap();
        assert_eq!(config.port, 6789);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.handler_program, PathBuf::from(DEFAULT_HANDLER_PROGRAM));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_server_requires_port() {
        let err = ServerConfig::merge(server_args(&[]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort));
    }

    #[test]
    fn test_toml_parsing_and_precedence() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            backlog = 64

            [handler]
            program = "/opt/logic"
            args = ["--fast"]

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.port, Some(7000));
        assert_eq!(toml_config.handler.args, vec!["--fast".to_string()]);

        let config = ServerConfig::merge(
            server_args(&["-p", "7001", "--logic", "/bin/cat"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.backlog, 64);
        assert_eq!(config.handler_program, PathBuf::from("/bin/cat"));
        assert_eq!(config.handler_args, vec!["--fast".to_string()]);
        assert_eq!(config.log_level, "debug");
    }
}
