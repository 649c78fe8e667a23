use stow_types::{Oid, Reference, TypeDescriptor, Value};

use crate::error::{CodecError, CodecResult};

/// Render field values in layout order.
///
/// `reference` maps each reference to the OID written in its place; the
/// storer uses it to register targets and queue them for storing.
pub fn encode_payload<F>(layout: &TypeDescriptor, values: &[Value], mut reference: F) -> CodecResult<Vec<u8>>
where
    F: FnMut(&Reference) -> CodecResult<Oid>,
{
    let mut out = Vec::with_capacity(layout.fixed_payload_len().unwrap_or(64));
    if values.len() != layout.fields().len() {
        return Err(CodecError::Type(stow_types::TypeError::ArityMismatch {
            type_name: layout.name().to_string(),
            expected: layout.fields().len(),
            actual: values.len(),
        }));
    }

    for (field, value) in layout.fields().iter().zip(values) {
        if !value.matches(&field.kind) {
            return Err(CodecError::FieldMismatch {
                type_name: layout.name().to_string(),
                field: field.name.clone(),
                expected: field.kind.to_string(),
            });
        }
        match value {
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bytes(b) => put_variable(&mut out, b),
            Value::Text(s) => put_variable(&mut out, s.as_bytes()),
            Value::Ref(r) => out.extend_from_slice(&reference(r)?.to_le_bytes()),
            Value::RefList(list) => {
                out.extend_from_slice(&(list.len() as u64).to_le_bytes());
                for r in list {
                    out.extend_from_slice(&reference(r)?.to_le_bytes());
                }
            }
        }
    }
    Ok(out)
}

fn put_variable(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}
