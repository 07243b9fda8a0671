use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    routes::{router, AppState},
    store::KvStore,
};

pub struct Server {
    listener: TcpListener,
    state: AppState,
}

impl Server {
    pub fn new(listener: TcpListener, store: Arc<dyn KvStore>, config: &ServerConfig) -> Self {
        Self {
            listener,
            state: AppState::new(store, config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves. Open result streams are closed first so
    /// the graceful drain does not wait on them forever.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, state } = self;
        let relay = state.relay.clone();
        let app = router(state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("server shutting down");
                relay.shutdown();
            })
            .await
            .context("http server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
