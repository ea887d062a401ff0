pub use app_error::{AppError, AppResult};
pub use client_connection::{ClientConnection, ClientRegistry};
pub use config::{
    BiddrConfig, GeneralConfig, HandshakeConfig, KeepAliveConfig, LogConfig, NetworkConfig,
    SecureConfig, WorkerPoolSection,
};
pub use daemon::Daemon;
pub use server::{Server, SERVER_SHUTTING_DOWN};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod client_connection;
mod config;
mod daemon;
mod server;
mod shutdown;
mod tracing_config;
