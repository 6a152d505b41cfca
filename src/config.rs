//! Configuration parsing.

use std::default::Default;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use regex::{Captures, Regex};
use serde::Deserialize;
use structopt::StructOpt;

const INTERPOLATE_RE: &str = r"(?m)\$\{([A-Z][A-Z0-9_]*)(?:=([^}]+))?\}";

/// Parsed command line options when a worker process is started.
#[derive(Debug, StructOpt)]
#[structopt(name = "rusque-worker")]
pub struct CliOpts {
    #[structopt(parse(from_os_str), help = "Path to configuration file")]
    pub config: Option<PathBuf>,
}

/// Parses configuration from the configuration path specified in command
/// line arguments (default configuration if none given), then applies
/// environment variable overrides.
pub fn parse_config_from_cli_args() -> Config {
    let opts = CliOpts::from_args();
    let mut conf = match opts.config {
        Some(config_path) => match Config::from_file(&config_path) {
            Ok(config) => config,
            Err(msg) => {
                eprintln!(
                    "Failed to parse config file {}: {}",
                    &config_path.display(),
                    msg
                );
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    conf.apply_env();
    conf
}

/// Log verbosity selected via the `LOGGING` environment variable.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    None,
    Normal,
    Verbose,
}

impl LogLevel {
    /// The `env_logger` filter string this level maps to.
    pub fn filter(self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Normal => "info",
            LogLevel::Verbose => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(LogLevel::None),
            "NORMAL" => Ok(LogLevel::Normal),
            "VERBOSE" => Ok(LogLevel::Verbose),
            _ => Err(format!("Invalid logging level: {}", s)),
        }
    }
}

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Read configuration from given TOML file. `${ENVVAR}` and
    /// `${ENVVAR=default}` strings in the file are interpolated from the
    /// environment before parsing.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_str(&contents),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Apply the environment variable surface over this configuration:
    /// `QUEUE`, `COUNT`, `INTERVAL`, `REDIS_BACKEND`, `REDIS_DATABASE`,
    /// `REDIS_NAMESPACE`, `REDIS_PASSWORD`, `PREFIX` and `LOGGING`.
    pub fn apply_env(&mut self) {
        if let Ok(queue) = std::env::var("QUEUE") {
            self.worker.queues = queue
                .split(',')
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(count) = std::env::var("COUNT") {
            match count.parse() {
                Ok(count) => self.worker.count = count,
                Err(_) => warn!("Ignoring unparseable COUNT: {}", count),
            }
        }
        if let Ok(interval) = std::env::var("INTERVAL") {
            match interval.parse() {
                Ok(interval) => self.worker.interval = interval,
                Err(_) => warn!("Ignoring unparseable INTERVAL: {}", interval),
            }
        }
        if let Ok(server) = std::env::var("REDIS_BACKEND") {
            self.redis.server = server;
        }
        if let Ok(database) = std::env::var("REDIS_DATABASE") {
            match database.parse() {
                Ok(database) => self.redis.database = database,
                Err(_) => warn!("Ignoring unparseable REDIS_DATABASE: {}", database),
            }
        }
        // PREFIX is the historical alias; REDIS_NAMESPACE wins when both set
        if let Ok(prefix) = std::env::var("PREFIX") {
            self.redis.namespace = prefix;
        }
        if let Ok(namespace) = std::env::var("REDIS_NAMESPACE") {
            self.redis.namespace = namespace;
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }
        if let Ok(logging) = std::env::var("LOGGING") {
            match logging.parse() {
                Ok(logging) => self.worker.logging = logging,
                Err(msg) => warn!("{}", msg),
            }
        }
    }

    fn from_str(s: &str) -> Result<Self, String> {
        let re = Regex::new(INTERPOLATE_RE).unwrap();
        let mut failed = None;
        let interpolated = re.replace_all(s, |caps: &Captures| {
            let name = caps.get(1).unwrap().as_str();
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        failed = Some(format!("Environment variable {} is not set", name));
                        String::new()
                    }
                },
            }
        });
        if let Some(msg) = failed {
            return Err(msg);
        }
        toml::from_str(&interpolated).map_err(|err| err.to_string())
    }
}

/// Configuration for connecting to Redis.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Server to connect to, either `host:port` or `unix:/path/to/socket`.
    pub server: String,

    /// Database number to select after connecting.
    pub database: i64,

    /// Namespace prefix added to every key. A trailing `:` is appended when
    /// missing.
    pub namespace: String,

    /// Optional password sent on connect.
    pub password: Option<String>,
}

impl RedisConfig {
    /// Build the Redis connection URL this configuration describes.
    pub fn url(&self) -> String {
        let auth = match &self.password {
            Some(password) => format!(":{}@", password),
            None => String::new(),
        };
        match self.server.strip_prefix("unix:") {
            Some(path) => {
                let mut url = format!("redis+unix://{}?db={}", path, self.database);
                if let Some(password) = &self.password {
                    url.push_str(&format!("&pass={}", password));
                }
                url
            }
            None => format!("redis://{}{}/{}", auth, &self.server, self.database),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            server: "127.0.0.1:6379".to_string(),
            database: 0,
            namespace: "resque".to_string(),
            password: None,
        }
    }
}

/// Configuration for the worker runtime.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queues to poll, in priority order. `*` polls every known queue.
    pub queues: Vec<String>,

    /// Number of worker processes the launcher starts.
    pub count: usize,

    /// Seconds to sleep between empty polls.
    pub interval: u64,

    /// Log verbosity.
    pub logging: LogLevel,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            queues: Vec::new(),
            count: 1,
            interval: 5,
            logging: LogLevel::Normal,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal() {
        let toml_str = r#"
[redis]
server = "redis-host:6379"
namespace = "myapp"

[worker]
queues = ["high", "low"]
interval = 2
"#;
        let conf = Config::from_str(toml_str).unwrap();
        assert_eq!(conf.redis.server, "redis-host:6379");
        assert_eq!(conf.redis.namespace, "myapp");
        assert_eq!(conf.worker.queues, vec!["high", "low"]);
        assert_eq!(conf.worker.interval, 2);
        assert_eq!(conf.worker.count, 1);
    }

    #[test]
    fn parse_env_interpolation_default() {
        let toml_str = r#"
[redis]
server = "${RUSQUE_TEST_UNSET_SERVER=localhost:7777}"
"#;
        let conf = Config::from_str(toml_str).unwrap();
        assert_eq!(conf.redis.server, "localhost:7777");
    }

    #[test]
    fn missing_env_without_default_is_an_error() {
        let toml_str = r#"
[redis]
server = "${RUSQUE_TEST_UNSET_SERVER}"
"#;
        assert!(Config::from_str(toml_str).is_err());
    }

    #[test]
    fn redis_urls() {
        let mut conf = RedisConfig::default();
        assert_eq!(conf.url(), "redis://127.0.0.1:6379/0");

        conf.database = 7;
        conf.password = Some("secret".to_string());
        assert_eq!(conf.url(), "redis://:secret@127.0.0.1:6379/7");

        conf.server = "unix:/var/run/redis.sock".to_string();
        assert_eq!(conf.url(), "redis+unix:///var/run/redis.sock?db=7&pass=secret");
    }

    #[test]
    fn logging_levels() {
        assert_eq!("NONE".parse::<LogLevel>().unwrap(), LogLevel::None);
        assert_eq!("NORMAL".parse::<LogLevel>().unwrap(), LogLevel::Normal);
        assert_eq!("VERBOSE".parse::<LogLevel>().unwrap(), LogLevel::Verbose);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
