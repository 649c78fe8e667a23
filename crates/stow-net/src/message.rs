use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use stow_codec::{decode_record, BinaryRecord, StoreMode, Storer, StubPolicy};
use stow_dictionary::{TypeDictionary, TypeEntry};
use stow_registry::ObjectRegistry;
use stow_types::{EntityRef, Oid, Reference, Value};
use tracing::debug;

use crate::error::{NetError, NetResult};

/// A whole graph as it travels in one frame.
///
/// Payload layout: `[u64 LE delta length][bincode Vec<TypeEntry>][records]`.
/// The first record is the root. A message without records is an empty
/// reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphMessage {
    pub types: Vec<TypeEntry>,
    pub records: Vec<BinaryRecord>,
}

impl GraphMessage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render every object reachable from `root`.
    ///
    /// OIDs are assigned by a registry private to this message and carry no
    /// meaning outside it. References to objects that are not in memory
    /// cannot be sent and fail the whole message.
    pub fn from_graph(root: &EntityRef, dictionary: &TypeDictionary) -> NetResult<Self> {
        let registry = ObjectRegistry::new();
        let mut storer = Storer::new(&registry, dictionary, StoreMode::Eager).with_stub_policy(StubPolicy::Reject);
        storer.store(root)?;
        let batch = storer.finish();
        let types = dictionary.delta_for(batch.tids())?;
        Ok(Self {
            types,
            records: batch.records,
        })
    }

    pub fn encode(&self) -> NetResult<Bytes> {
        let delta = bincode::serialize(&self.types).map_err(|e| NetError::Serialization(e.to_string()))?;
        let records_len: u64 = self.records.iter().map(BinaryRecord::total_length).sum();
        let mut buf = BytesMut::with_capacity(8 + delta.len() + records_len as usize);
        buf.put_u64_le(delta.len() as u64);
        buf.put_slice(&delta);
        let mut records = Vec::with_capacity(records_len as usize);
        for record in &self.records {
            record.write_to(&mut records);
        }
        buf.put_slice(&records);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> NetResult<Self> {
        if payload.is_empty() {
            return Ok(Self::empty());
        }
        if payload.len() < 8 {
            return Err(NetError::Malformed(format!(
                "payload of {} bytes has no delta length",
                payload.len()
            )));
        }
        let delta_len = payload.get_u64_le();
        if delta_len > payload.len() as u64 {
            return Err(NetError::Malformed(format!(
                "delta of {delta_len} bytes exceeds remaining {} bytes",
                payload.len()
            )));
        }
        let delta = payload.split_to(delta_len as usize);
        let types: Vec<TypeEntry> =
            bincode::deserialize(&delta).map_err(|e| NetError::Serialization(e.to_string()))?;
        let records = BinaryRecord::parse_all(&payload)?;
        Ok(Self { types, records })
    }

    /// Rebuild the graph and return its root.
    ///
    /// The type delta is imported into `dictionary` first. Every reference
    /// must point at another record of the same message.
    pub fn materialize(&self, dictionary: &TypeDictionary) -> NetResult<Option<EntityRef>> {
        if self.records.is_empty() {
            return Ok(None);
        }
        dictionary.import(&self.types)?;

        let registry = ObjectRegistry::new();
        let mut entities: HashMap<Oid, EntityRef> = HashMap::with_capacity(self.records.len());
        let mut order = Vec::with_capacity(self.records.len());
        for record in &self.records {
            if record.oid.is_reserved() || record.tid.is_reserved() {
                return Err(NetError::Malformed(format!(
                    "record {} with type id {} is not an application object",
                    record.oid, record.tid
                )));
            }
            let decoded = decode_record(record, dictionary, &registry)?;
            let tid = decoded.tid;
            let entity = decoded.into_entity()?;
            registry.bind(record.oid, tid, &entity)?;
            entities.insert(record.oid, entity);
            order.push(record.oid);
        }

        for oid in &order {
            let entity = &entities[oid];
            let wired = entity
                .values()
                .into_iter()
                .map(|value| wire(*oid, value, &entities))
                .collect::<NetResult<Vec<_>>>()?;
            entity.replace_values(wired).map_err(stow_codec::CodecError::from)?;
        }

        debug!(records = self.records.len(), types = self.types.len(), "graph materialized");
        Ok(entities.remove(&order[0]))
    }
}

fn wire(from: Oid, value: Value, entities: &HashMap<Oid, EntityRef>) -> NetResult<Value> {
    let resolve = |reference: Reference| match reference {
        Reference::Stub(to) => entities
            .get(&to)
            .map(Reference::to)
            .ok_or(NetError::DanglingReference { from, to }),
        other => Ok(other),
    };
    Ok(match value {
        Value::Ref(r) => Value::Ref(resolve(r)?),
        Value::RefList(list) => Value::RefList(list.into_iter().map(resolve).collect::<NetResult<_>>()?),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stow_codec::CodecError;
    use stow_types::{Entity, FieldDescriptor, PrimitiveKind, TypeDescriptor};

    use super::*;

    fn node_type() -> Arc<TypeDescriptor> {
        Arc::new(
            TypeDescriptor::new(
                "Node",
                vec![
                    FieldDescriptor::primitive("value", PrimitiveKind::I64),
                    FieldDescriptor::text("label"),
                    FieldDescriptor::reference("next"),
                    FieldDescriptor::reference_list("children"),
                ],
            )
            .unwrap(),
        )
    }

    fn node(value: i64) -> EntityRef {
        let e = Entity::with_defaults(node_type());
        e.set("value", value).unwrap();
        e
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    #[test]
    fn graph_survives_the_wire_format() {
        let sender = TypeDictionary::in_memory();
        let a = node(1);
        let b = node(42);
        a.set_reference("next", &b).unwrap();
        a.set("label", "root").unwrap();

        let message = GraphMessage::from_graph(&a, &sender).unwrap();
        assert_eq!(message.records.len(), 2);
        assert_eq!(message.types.len(), 1);

        let decoded = GraphMessage::decode(message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);

        let receiver = TypeDictionary::in_memory();
        let root = decoded.materialize(&receiver).unwrap().unwrap();
        assert_eq!(root.get("label").unwrap().as_text(), Some("root"));
        let next = root.get("next").unwrap();
        let next = next.as_reference().unwrap().resident().unwrap();
        assert_eq!(next.get("value").unwrap().as_i64(), Some(42));
    }

    #[test]
    fn cycles_materialize_as_cycles() {
        let dict = TypeDictionary::in_memory();
        let a = node(1);
        let b = node(2);
        a.set_reference("next", &b).unwrap();
        b.set("children", Value::RefList(vec![Reference::to(&a), Reference::Null])).unwrap();

        let message = GraphMessage::from_graph(&a, &dict).unwrap();
        assert_eq!(message.records.len(), 2);
        let root = message.materialize(&TypeDictionary::in_memory()).unwrap().unwrap();
        let b2 = root.get("next").unwrap().as_reference().unwrap().resident().unwrap().clone();
        let children = b2.get("children").unwrap();
        let back = children.as_reference_list().unwrap()[0].resident().unwrap().clone();
        assert!(Arc::ptr_eq(&back, &root));

        // break both cycles so the test does not leak
        a.set("next", Value::Ref(Reference::Null)).unwrap();
        root.set("next", Value::Ref(Reference::Null)).unwrap();
    }

    #[test]
    fn empty_payload_is_an_empty_message() {
        let message = GraphMessage::decode(Bytes::new()).unwrap();
        assert!(message.is_empty());
        assert!(message.materialize(&TypeDictionary::in_memory()).unwrap().is_none());
        let encoded = GraphMessage::empty().encode().unwrap();
        assert!(GraphMessage::decode(encoded).unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------

    #[test]
    fn stubs_cannot_be_sent() {
        let a = node(1);
        a.set("next", Value::Ref(Reference::Stub(Oid::FIRST))).unwrap();
        let err = GraphMessage::from_graph(&a, &TypeDictionary::in_memory()).unwrap_err();
        assert!(matches!(err, NetError::Codec(CodecError::UnresolvedStub { .. })));
    }

    #[test]
    fn reference_outside_the_message_is_dangling() {
        let dict = TypeDictionary::in_memory();
        let a = node(1);
        let b = node(2);
        a.set_reference("next", &b).unwrap();
        let mut message = GraphMessage::from_graph(&a, &dict).unwrap();
        let missing = message.records.pop().unwrap().oid;

        let err = message.materialize(&TypeDictionary::in_memory()).unwrap_err();
        assert!(matches!(err, NetError::DanglingReference { to, .. } if to == missing));
    }

    #[test]
    fn truncated_delta_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(100);
        buf.put_slice(&[0u8; 10]);
        assert!(matches!(
            GraphMessage::decode(buf.freeze()),
            Err(NetError::Malformed(_))
        ));
    }

    #[test]
    fn conflicting_type_ids_are_refused() {
        let dict = TypeDictionary::in_memory();
        let message = GraphMessage::from_graph(&node(1), &dict).unwrap();

        let receiver = TypeDictionary::in_memory();
        let other = TypeDescriptor::new("Other", vec![FieldDescriptor::text("name")]).unwrap();
        receiver.type_id_for(&other).unwrap();
        assert!(matches!(
            message.materialize(&receiver),
            Err(NetError::Dictionary(_))
        ));
    }
}
