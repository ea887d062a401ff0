use std::path::Path;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::protocol::PROTOCOL_VERSION;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// Version number both ends must agree on during the handshake.
    pub protocol_version: i64,
    /// Texts the server picks from when answering HELLO.
    pub greetings: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            protocol_version: PROTOCOL_VERSION,
            greetings: vec![
                "Hello".to_string(),
                "Hi there".to_string(),
                "Welcome to Biddr".to_string(),
                "Good to see you".to_string(),
            ],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub max_package_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 4730,
            max_connection: 1024,
            max_package_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SecureConfig {
    pub enable: bool,
    pub port: u16,
}

impl Default for SecureConfig {
    fn default() -> Self {
        SecureConfig {
            enable: false,
            port: 4731,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Upper bound for every single handshake step.
    pub timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig { timeout_ms: 5000 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// A connection that stays silent for this long is considered lost.
    pub ping_timeout_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            ping_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerPoolSection {
    pub workers: usize,
    pub channel_capacity: usize,
    pub monitor_interval_ms: u64,
    pub worker_check_timeout_ms: u64,
}

impl Default for WorkerPoolSection {
    fn default() -> Self {
        WorkerPoolSection {
            workers: num_cpus::get(),
            channel_capacity: 1024,
            monitor_interval_ms: 5000,
            worker_check_timeout_ms: 200,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// When set, logs are also written to an hourly rolling file in this directory.
    pub dir: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct BiddrConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub secure: SecureConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,
    #[serde(default)]
    pub worker_pool: WorkerPoolSection,
    #[serde(default)]
    pub log: LogConfig,
}

impl BiddrConfig {
    /// Loads the config file at `path`, layered over the built-in defaults and
    /// `BIDDR_` prefixed environment variables (e.g. `BIDDR_NETWORK__PORT`).
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BiddrConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;

        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("BIDDR")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut server_config: BiddrConfig = config.try_deserialize()?;
        server_config.normalize();
        Ok(server_config)
    }

    fn normalize(&mut self) {
        if self.worker_pool.workers < 1 {
            tracing::warn!("workers directive was < 1. Setting to 1.");
            self.worker_pool.workers = 1;
        }
        if self.general.greetings.is_empty() {
            self.general.greetings = GeneralConfig::default().greetings;
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }

    pub fn secure_listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.secure.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake.timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive.ping_timeout_ms)
    }

    /// Delay before answering a PING, slightly under the peer's deadline so
    /// transit time does not trip it.
    pub fn pong_delay(&self) -> Duration {
        self.ping_timeout().mul_f64(0.95)
    }

    /// One of the configured greetings, picked at random.
    pub fn random_greeting(&self) -> String {
        self.general
            .greetings
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "Hello".to_string())
    }

    /// Human readable dump used by `biddrd print-config`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("protocol-version: {}\n", self.general.protocol_version));
        out.push_str(&format!("listen: {}\n", self.listen_address()));
        out.push_str(&format!("max-connection: {}\n", self.network.max_connection));
        out.push_str(&format!("workers: {}\n", self.worker_pool.workers));
        out.push_str(&format!("handshake-timeout-ms: {}\n", self.handshake.timeout_ms));
        out.push_str(&format!("ping-timeout-ms: {}\n", self.keep_alive.ping_timeout_ms));
        if self.secure.enable {
            out.push_str("secure-listening-enabled: true\n");
            out.push_str(&format!("secure-port: {}\n", self.secure.port));
        }
        if let Some(dir) = &self.log.dir {
            out.push_str(&format!("log-dir: {}\n", dir));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[network]
ip = "127.0.0.1"
port = 9000
max_connection = 10
max_package_size = 1024

[worker_pool]
workers = 0
channel_capacity = 8
monitor_interval_ms = 100
worker_check_timeout_ms = 10
"#
        )
        .unwrap();

        let config = BiddrConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.listen_address(), "127.0.0.1:9000");
        assert_eq!(config.worker_pool.workers, 1);
        assert_eq!(config.general.protocol_version, PROTOCOL_VERSION);
        assert!(!config.secure.enable);
        assert_eq!(config.handshake.timeout_ms, 5000);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = BiddrConfig::set_up_config("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, AppError::ConfigFileError(_)));
    }

    #[test]
    fn pong_delay_is_just_under_the_timeout() {
        let mut config = BiddrConfig::default();
        config.keep_alive.ping_timeout_ms = 1000;
        assert_eq!(config.pong_delay(), Duration::from_millis(950));
    }
}
