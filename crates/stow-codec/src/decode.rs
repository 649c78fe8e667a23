use std::sync::Arc;

use stow_dictionary::TypeDictionary;
use stow_registry::ObjectRegistry;
use stow_types::{
    EmbeddedKind, Entity, EntityRef, FieldKind, Oid, PrimitiveKind, Reference, Tid, TypeDescriptor, Value,
};

use crate::error::{CodecError, CodecResult};
use crate::record::BinaryRecord;

/// A record turned back into field values under its type's current layout.
#[derive(Debug)]
pub struct DecodedEntity {
    pub oid: Oid,
    /// TID the record was written with.
    pub record_tid: Tid,
    /// TID of the layout `values` follow.
    pub tid: Tid,
    pub descriptor: Arc<TypeDescriptor>,
    pub values: Vec<Value>,
}

impl DecodedEntity {
    /// Build the runtime object. It is not yet bound to its OID.
    pub fn into_entity(self) -> CodecResult<EntityRef> {
        Ok(Entity::new(self.descriptor, self.values)?)
    }
}

struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    oid: Oid,
    tid: Tid,
}

impl<'a> PayloadReader<'a> {
    fn malformed(&self, reason: impl Into<String>) -> CodecError {
        CodecError::MalformedPayload {
            oid: self.oid,
            tid: self.tid,
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        let remaining = self.bytes.len() - self.pos;
        if n > remaining {
            return Err(self.malformed(format!("need {n} bytes, {remaining} left")));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// A `u64` length, checked against what is left so corrupt input never
    /// triggers a huge allocation.
    fn length(&mut self, unit: usize) -> CodecResult<usize> {
        let len = self.u64()?;
        let remaining = (self.bytes.len() - self.pos) as u64;
        match len.checked_mul(unit as u64) {
            Some(total) if total <= remaining => Ok(len as usize),
            _ => Err(self.malformed(format!("length {len} exceeds remaining {remaining} bytes"))),
        }
    }
}

fn reference(oid: Oid, registry: Option<&ObjectRegistry>) -> Reference {
    if oid.is_null() {
        return Reference::Null;
    }
    match registry.and_then(|r| r.lookup(oid)) {
        Some(resident) => Reference::Resident(resident),
        None => Reference::Stub(oid),
    }
}

/// Decode a payload laid out as `layout`.
///
/// References to objects already resident in `registry` come back as
/// [`Reference::Resident`]; all others are [`Reference::Stub`]s.
pub fn decode_payload(
    oid: Oid,
    tid: Tid,
    layout: &TypeDescriptor,
    payload: &[u8],
    registry: Option<&ObjectRegistry>,
) -> CodecResult<Vec<Value>> {
    let mut r = PayloadReader {
        bytes: payload,
        pos: 0,
        oid,
        tid,
    };
    let mut values = Vec::with_capacity(layout.fields().len());
    for field in layout.fields() {
        let value = match field.kind {
            FieldKind::Primitive(p) => match p {
                PrimitiveKind::Bool => match r.array::<1>()?[0] {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    other => return Err(r.malformed(format!("invalid bool byte {other}"))),
                },
                PrimitiveKind::I8 => Value::I8(i8::from_le_bytes(r.array()?)),
                PrimitiveKind::I16 => Value::I16(i16::from_le_bytes(r.array()?)),
                PrimitiveKind::I32 => Value::I32(i32::from_le_bytes(r.array()?)),
                PrimitiveKind::I64 => Value::I64(i64::from_le_bytes(r.array()?)),
                PrimitiveKind::F32 => Value::F32(f32::from_le_bytes(r.array()?)),
                PrimitiveKind::F64 => Value::F64(f64::from_le_bytes(r.array()?)),
            },
            FieldKind::Embedded(kind) => {
                let len = r.length(1)?;
                let bytes = r.take(len)?.to_vec();
                match kind {
                    EmbeddedKind::Bytes => Value::Bytes(bytes),
                    EmbeddedKind::Text => match String::from_utf8(bytes) {
                        Ok(s) => Value::Text(s),
                        Err(_) => return Err(r.malformed(format!("field `{}` is not utf-8", field.name))),
                    },
                }
            }
            FieldKind::Reference => Value::Ref(reference(Oid::new(r.u64()?), registry)),
            FieldKind::ReferenceList => {
                let count = r.length(8)?;
                let mut list = Vec::with_capacity(count);
                for _ in 0..count {
                    list.push(reference(Oid::new(r.u64()?), registry));
                }
                Value::RefList(list)
            }
        };
        values.push(value);
    }

    let trailing = payload.len() - r.pos;
    if trailing != 0 {
        return Err(CodecError::TrailingBytes { oid, tid, trailing });
    }
    Ok(values)
}

/// Decode a stored record into current-layout values.
///
/// A record written under an older TID is decoded with the layout it was
/// written in and then migrated forward.
pub fn decode_record(
    record: &BinaryRecord,
    dictionary: &TypeDictionary,
    registry: &ObjectRegistry,
) -> CodecResult<DecodedEntity> {
    let plan = dictionary.decode_plan(record.tid)?;
    let values = decode_payload(
        record.oid,
        record.tid,
        &plan.record_layout,
        &record.payload,
        Some(registry),
    )?;
    let values = plan.migrate(values)?;
    Ok(DecodedEntity {
        oid: record.oid,
        record_tid: record.tid,
        tid: plan.target_tid,
        descriptor: plan.target_layout,
        values,
    })
}

/// Every non-null OID a record refers to, in field order.
pub fn referenced_oids(record: &BinaryRecord, dictionary: &TypeDictionary) -> CodecResult<Vec<Oid>> {
    let layout = dictionary.layout_for(record.tid)?;
    if !layout.has_references() {
        return Ok(Vec::new());
    }
    let values = decode_payload(record.oid, record.tid, &layout, &record.payload, None)?;
    let mut oids = Vec::new();
    for value in &values {
        match value {
            Value::Ref(r) => oids.extend(r.stub_oid()),
            Value::RefList(list) => oids.extend(list.iter().filter_map(Reference::stub_oid)),
            _ => {}
        }
    }
    Ok(oids)
}
