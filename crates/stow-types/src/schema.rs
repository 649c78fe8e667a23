use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Fixed-width primitive field kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl PrimitiveKind {
    /// Encoded width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::Bool | Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

/// Variable-length values stored inline in the owning record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddedKind {
    Bytes,
    Text,
}

/// Semantic kind of a persistent field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Primitive(PrimitiveKind),
    Embedded(EmbeddedKind),
    /// A single reference, encoded as an 8-byte OID.
    Reference,
    /// A sequence of references, encoded as a count followed by OIDs.
    ReferenceList,
}

/// Encoded size of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteLength {
    Fixed(usize),
    Variable,
}

impl FieldKind {
    pub fn byte_length(&self) -> ByteLength {
        match self {
            Self::Primitive(p) => ByteLength::Fixed(p.width()),
            Self::Reference => ByteLength::Fixed(8),
            Self::Embedded(_) | Self::ReferenceList => ByteLength::Variable,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference | Self::ReferenceList)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{p:?}"),
            Self::Embedded(e) => write!(f, "{e:?}"),
            Self::Reference => f.write_str("Reference"),
            Self::ReferenceList => f.write_str("ReferenceList"),
        }
    }
}

/// One named field of a persistent type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn primitive(name: impl Into<String>, kind: PrimitiveKind) -> Self {
        Self::new(name, FieldKind::Primitive(kind))
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Embedded(EmbeddedKind::Text))
    }

    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Embedded(EmbeddedKind::Bytes))
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Reference)
    }

    pub fn reference_list(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::ReferenceList)
    }
}

/// Ordered field layout of a persistent type.
///
/// Two descriptors are the same schema version only if both the type name
/// and the full ordered field list match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    name: String,
    fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Result<Self, TypeError> {
        let name = name.into();
        let mut seen = HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(TypeError::DuplicateField {
                    type_name: name,
                    field: field.name.clone(),
                });
            }
        }
        Ok(Self { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_references(&self) -> bool {
        self.fields.iter().any(|f| f.kind.is_reference())
    }

    /// Payload size when every field is fixed width.
    pub fn fixed_payload_len(&self) -> Option<usize> {
        self.fields.iter().try_fold(0usize, |acc, f| match f.kind.byte_length() {
            ByteLength::Fixed(n) => Some(acc + n),
            ByteLength::Variable => None,
        })
    }

    pub(crate) fn index_of(&self, field: &str) -> Result<usize, TypeError> {
        self.field_index(field).ok_or_else(|| TypeError::UnknownField {
            type_name: self.name.clone(),
            field: field.to_string(),
        })
    }
}
