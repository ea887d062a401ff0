use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::{runtime, signal};
use tracing::{error, info, warn};

use super::{BiddrConfig, Server};
use crate::network::StreamUpgrader;
use crate::store::AuctionStore;
use crate::{AppError, AppResult};

/// Process level wrapper around [`Server`]: binds the listeners, runs until
/// ctrl-c and then shuts the server down.
pub struct Daemon {
    config: Arc<BiddrConfig>,
    store: Arc<dyn AuctionStore>,
    upgrader: Option<Arc<dyn StreamUpgrader>>,
}

impl Daemon {
    pub fn new(config: BiddrConfig, store: Arc<dyn AuctionStore>) -> Self {
        Daemon {
            config: Arc::new(config),
            store,
            upgrader: None,
        }
    }

    pub fn with_upgrader(mut self, upgrader: Arc<dyn StreamUpgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn start(&self, rt: &runtime::Runtime) -> AppResult<()> {
        rt.block_on(self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", e);
            }
        }))?;
        info!("biddrd shutdown complete");
        Ok(())
    }

    /// Serves until `stop` resolves or a listener fails.
    pub async fn run_until(&self, stop: impl Future<Output = ()>) -> AppResult<()> {
        let listener = bind(&self.config.listen_address()).await?;
        let secure_listener = match (&self.upgrader, self.config.secure.enable) {
            (Some(_), true) => Some(bind(&self.config.secure_listen_address()).await?),
            (None, true) => {
                warn!("secure listening is enabled but no upgrader is installed; serving plain connections only");
                None
            }
            _ => None,
        };

        let (notify_shutdown, _) = broadcast::channel(1);
        let mut server = Server::new(self.config.clone(), self.store.clone(), notify_shutdown);
        if let Some(upgrader) = &self.upgrader {
            server = server.with_upgrader(upgrader.clone());
        }

        let secure = async {
            match secure_listener {
                Some(listener) => server.run_secure(listener).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = server.run(listener) => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            res = secure => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept on secure port");
                }
            }
            _ = stop => {
                info!("get shutdown signal");
            }
        }

        server.shutdown();
        Ok(())
    }
}

async fn bind(address: &str) -> AppResult<TcpListener> {
    match TcpListener::bind(address).await {
        Ok(listener) => {
            info!("tcp server binding to {} for listening", address);
            Ok(listener)
        }
        Err(err) => {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                address, err
            );
            error!(error_msg);
            Err(AppError::IllegalStateError(error_msg))
        }
    }
}
