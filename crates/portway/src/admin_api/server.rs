//! Admin API server.

use crate::admin_api::router::route_request;
use crate::forward::Supervisor;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Admin API server for portway
pub struct AdminApiServer {
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
}

impl AdminApiServer {
    /// Bind the admin API listener
    pub async fn bind(addr: SocketAddr, supervisor: Arc<Supervisor>) -> Result<Self, anyhow::Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin API on {addr}: {e}"))?;
        Ok(Self {
            listener,
            supervisor,
        })
    }

    /// The address the admin API is listening on
    pub fn local_addr(&self) -> Result<SocketAddr, anyhow::Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the admin API server
    pub async fn run(self) -> Result<(), anyhow::Error> {
        info!(
            "Portway Admin API listening on http://{}",
            self.local_addr()?
        );

        loop {
            let (stream, _) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Admin API accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let supervisor = Arc::clone(&self.supervisor);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let supervisor = Arc::clone(&supervisor);
                    async move { route_request(req, supervisor).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Admin API connection error: {}", e);
                }
            });
        }
    }
}
