use std::sync::Arc;

use async_trait::async_trait;
use stow_net::{GraphHandler, NetError, NetResult};
use stow_types::EntityRef;
use tracing::info;

use crate::engine::EmbeddedStorage;

/// Stores every received graph as the new root of an engine.
///
/// The reply is empty; a client that gets one back knows the graph reached
/// the channels.
pub struct StoreGraphHandler {
    engine: Arc<EmbeddedStorage>,
}

impl StoreGraphHandler {
    pub fn new(engine: Arc<EmbeddedStorage>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl GraphHandler for StoreGraphHandler {
    async fn handle(&self, root: Option<EntityRef>) -> NetResult<Option<EntityRef>> {
        let Some(root) = root else {
            return Ok(None);
        };
        let engine = Arc::clone(&self.engine);
        let oid = tokio::task::spawn_blocking(move || engine.set_root(&root))
            .await
            .map_err(|e| NetError::Handler(e.to_string()))?
            .map_err(|e| NetError::Handler(e.to_string()))?;
        info!(%oid, "received graph stored as root");
        Ok(None)
    }
}
