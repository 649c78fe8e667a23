use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use stow_dictionary::TypeDictionary;
use stow_types::EntityRef;

use crate::config::NetworkConfig;
use crate::error::NetResult;
use crate::frame::{read_frame, write_frame};
use crate::message::GraphMessage;

/// Application logic behind a [`NetworkServer`].
#[async_trait]
pub trait GraphHandler: Send + Sync {
    /// Handle one received graph. `root` is `None` for an empty request.
    /// The returned graph, if any, is sent back as the reply.
    async fn handle(&self, root: Option<EntityRef>) -> NetResult<Option<EntityRef>>;
}

/// Accept loop: one request per connection, no state between requests.
pub struct NetworkServer {
    config: NetworkConfig,
    handler: Arc<dyn GraphHandler>,
}

impl NetworkServer {
    pub fn new(config: NetworkConfig, handler: Arc<dyn GraphHandler>) -> Self {
        Self { config, handler }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    ///
    /// Every connection is handled on its own task. A failing request is
    /// logged and its connection dropped; the loop keeps accepting.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> NetResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let local = listener.local_addr()?;
        info!(%local, "graph server listening");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let handler = Arc::clone(&self.handler);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, &config, handler.as_ref()).await {
                            Ok(()) => debug!(%peer, "graph request served"),
                            Err(e) => warn!(%peer, error = %e, "graph request failed"),
                        }
                    });
                }
            }
        }

        info!(%local, "graph server stopped");
        Ok(())
    }
}

async fn handle_connection(mut stream: TcpStream, config: &NetworkConfig, handler: &dyn GraphHandler) -> NetResult<()> {
    stream.set_nodelay(true)?;
    let request = GraphMessage::decode(read_frame(&mut stream, config).await?)?;
    let root = request.materialize(&TypeDictionary::in_memory())?;

    let reply = match handler.handle(root).await? {
        Some(reply_root) => GraphMessage::from_graph(&reply_root, &TypeDictionary::in_memory())?,
        None => GraphMessage::empty(),
    };
    write_frame(&mut stream, &reply.encode()?, config).await?;
    stream.shutdown().await?;
    Ok(())
}
