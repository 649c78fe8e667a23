use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use stow_dictionary::TypeDictionary;
use stow_types::EntityRef;

use crate::config::NetworkConfig;
use crate::error::{NetError, NetResult};
use crate::frame::{read_frame, write_frame};
use crate::message::GraphMessage;

/// Sends one graph per connection and waits for the reply graph.
#[derive(Clone, Debug)]
pub struct NetworkClient<A> {
    addr: A,
    config: NetworkConfig,
}

impl<A> NetworkClient<A>
where
    A: ToSocketAddrs + Clone,
{
    pub fn new(addr: A, config: NetworkConfig) -> Self {
        Self { addr, config }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Send the graph rooted at `root` and return the peer's reply root.
    ///
    /// Each call opens a fresh connection and closes it afterwards; every
    /// message carries the type layouts it needs.
    pub async fn send(&self, root: &EntityRef) -> NetResult<Option<EntityRef>> {
        let message = GraphMessage::from_graph(root, &TypeDictionary::in_memory())?;
        let reply = self.exchange(&message).await?;
        reply.materialize(&TypeDictionary::in_memory())
    }

    /// Send a prepared message and return the raw reply.
    pub async fn exchange(&self, message: &GraphMessage) -> NetResult<GraphMessage> {
        let mut stream = match tokio::time::timeout(self.config.timeout(), TcpStream::connect(self.addr.clone())).await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(NetError::Timeout {
                    expected: 0,
                    transferred: 0,
                })
            }
        };
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        write_frame(&mut stream, &message.encode()?, &self.config).await?;
        debug!(%peer, records = message.records.len(), "graph sent");
        let reply = GraphMessage::decode(read_frame(&mut stream, &self.config).await?)?;
        info!(%peer, sent = message.records.len(), received = reply.records.len(), "graph exchanged");
        Ok(reply)
    }
}
