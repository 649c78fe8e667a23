use std::sync::Arc;

use stow_engine::{EmbeddedStorage, EngineConfig, StoreGraphHandler};
use stow_net::{NetworkClient, NetworkConfig, NetworkServer};
use stow_types::{Entity, EntityRef, FieldDescriptor, PrimitiveKind, TypeDescriptor};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn node(value: i64, next: Option<&EntityRef>) -> EntityRef {
    let layout = TypeDescriptor::new(
        "Node",
        vec![
            FieldDescriptor::primitive("value", PrimitiveKind::I64),
            FieldDescriptor::reference("next"),
        ],
    )
    .unwrap();
    let entity = Entity::with_defaults(Arc::new(layout));
    entity.set("value", value).unwrap();
    if let Some(next) = next {
        entity.set_reference("next", next).unwrap();
    }
    entity
}

#[tokio::test]
async fn served_graph_is_stored_as_root() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path().join("data"), 2);
    config.storage.sync_writes = false;
    let engine = Arc::new(EmbeddedStorage::start(config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = NetworkServer::new(
        NetworkConfig::default(),
        Arc::new(StoreGraphHandler::new(Arc::clone(&engine))),
    );
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(async move {
        server
            .serve_until(listener, async {
                let _ = stopped.await;
            })
            .await
    });

    let tail = node(3, None);
    let middle = node(2, Some(&tail));
    let head = node(1, Some(&middle));
    let client = NetworkClient::new(addr, NetworkConfig::default());
    assert!(client.send(&head).await.unwrap().is_none());

    stop.send(()).unwrap();
    serving.await.unwrap().unwrap();

    // the received graph is a copy; the sender's objects stay unregistered
    assert_eq!(engine.registry().peek(&head), None);
    let root_oid = engine.root_oid().unwrap();
    assert!(!root_oid.is_reserved());
    engine.registry().prune();

    let mut values = Vec::new();
    let mut current = engine.root().unwrap();
    while let Some(entity) = current {
        values.push(entity.get("value").unwrap().as_i64().unwrap());
        current = entity.reference("next", engine.as_ref()).unwrap();
    }
    assert_eq!(values, vec![1, 2, 3]);
    assert!(engine.check_integrity().unwrap().is_clean());
}
