use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::TypeError;
use crate::id::Oid;
use crate::schema::{EmbeddedKind, FieldKind, PrimitiveKind, TypeDescriptor};

/// Shared handle to a runtime object instance.
///
/// Object identity is pointer identity of the `Arc`: two handles refer to the
/// same object exactly when `Arc::ptr_eq` holds.
pub type EntityRef = Arc<Entity>;

/// Materializes objects that are referenced but not yet resident in memory.
pub trait ObjectLoader {
    type Error;

    fn load_object(&self, oid: Oid) -> Result<EntityRef, Self::Error>;
}

/// A pointer from one entity to another.
#[derive(Clone)]
pub enum Reference {
    Null,
    /// The target is in memory.
    Resident(EntityRef),
    /// The target is known only by its OID and is loaded on first access.
    Stub(Oid),
}

impl Reference {
    pub fn to(entity: &EntityRef) -> Self {
        Self::Resident(Arc::clone(entity))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn resident(&self) -> Option<&EntityRef> {
        match self {
            Self::Resident(e) => Some(e),
            _ => None,
        }
    }

    pub fn stub_oid(&self) -> Option<Oid> {
        match self {
            Self::Stub(oid) => Some(*oid),
            _ => None,
        }
    }

    fn materialize<L: ObjectLoader>(&self, loader: &L) -> Result<Option<EntityRef>, L::Error> {
        match self {
            Self::Null => Ok(None),
            Self::Resident(e) => Ok(Some(Arc::clone(e))),
            Self::Stub(oid) => loader.load_object(*oid).map(Some),
        }
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Resident(a), Self::Resident(b)) => Arc::ptr_eq(a, b),
            (Self::Stub(a), Self::Stub(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Reference {
    // Never recurse into the target: graphs may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Resident(e) => write!(f, "Resident({}@{:p})", e.type_name(), Arc::as_ptr(e)),
            Self::Stub(oid) => write!(f, "Stub({oid})"),
        }
    }
}

/// The value held by one field of an entity.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
    Text(String),
    Ref(Reference),
    RefList(Vec<Reference>),
}

impl Value {
    /// Zero value for a field kind: `false`, `0`, empty, or null.
    pub fn default_for(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Primitive(p) => match p {
                PrimitiveKind::Bool => Self::Bool(false),
                PrimitiveKind::I8 => Self::I8(0),
                PrimitiveKind::I16 => Self::I16(0),
                PrimitiveKind::I32 => Self::I32(0),
                PrimitiveKind::I64 => Self::I64(0),
                PrimitiveKind::F32 => Self::F32(0.0),
                PrimitiveKind::F64 => Self::F64(0.0),
            },
            FieldKind::Embedded(EmbeddedKind::Bytes) => Self::Bytes(Vec::new()),
            FieldKind::Embedded(EmbeddedKind::Text) => Self::Text(String::new()),
            FieldKind::Reference => Self::Ref(Reference::Null),
            FieldKind::ReferenceList => Self::RefList(Vec::new()),
        }
    }

    pub fn matches(&self, kind: &FieldKind) -> bool {
        matches!(
            (self, kind),
            (Self::Bool(_), FieldKind::Primitive(PrimitiveKind::Bool))
                | (Self::I8(_), FieldKind::Primitive(PrimitiveKind::I8))
                | (Self::I16(_), FieldKind::Primitive(PrimitiveKind::I16))
                | (Self::I32(_), FieldKind::Primitive(PrimitiveKind::I32))
                | (Self::I64(_), FieldKind::Primitive(PrimitiveKind::I64))
                | (Self::F32(_), FieldKind::Primitive(PrimitiveKind::F32))
                | (Self::F64(_), FieldKind::Primitive(PrimitiveKind::F64))
                | (Self::Bytes(_), FieldKind::Embedded(EmbeddedKind::Bytes))
                | (Self::Text(_), FieldKind::Embedded(EmbeddedKind::Text))
                | (Self::Ref(_), FieldKind::Reference)
                | (Self::RefList(_), FieldKind::ReferenceList)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "Bool",
            Self::I8(_) => "I8",
            Self::I16(_) => "I16",
            Self::I32(_) => "I32",
            Self::I64(_) => "I64",
            Self::F32(_) => "F32",
            Self::F64(_) => "F64",
            Self::Bytes(_) => "Bytes",
            Self::Text(_) => "Text",
            Self::Ref(_) => "Reference",
            Self::RefList(_) => "ReferenceList",
        }
    }

    /// Convert to another field kind without losing information.
    ///
    /// Integers widen to larger integers and to floats that represent them
    /// exactly, `F32` widens to `F64`, and text converts to its UTF-8 bytes.
    /// Returns `None` for narrowing or unrelated conversions.
    pub fn convert_to(self, kind: &FieldKind) -> Option<Self> {
        use PrimitiveKind as P;
        if self.matches(kind) {
            return Some(self);
        }
        let converted = match (self, kind) {
            (Self::I8(v), FieldKind::Primitive(p)) => match p {
                P::I16 => Self::I16(v.into()),
                P::I32 => Self::I32(v.into()),
                P::I64 => Self::I64(v.into()),
                P::F32 => Self::F32(v.into()),
                P::F64 => Self::F64(v.into()),
                _ => return None,
            },
            (Self::I16(v), FieldKind::Primitive(p)) => match p {
                P::I32 => Self::I32(v.into()),
                P::I64 => Self::I64(v.into()),
                P::F32 => Self::F32(v.into()),
                P::F64 => Self::F64(v.into()),
                _ => return None,
            },
            (Self::I32(v), FieldKind::Primitive(p)) => match p {
                P::I64 => Self::I64(v.into()),
                P::F64 => Self::F64(v.into()),
                _ => return None,
            },
            (Self::F32(v), FieldKind::Primitive(P::F64)) => Self::F64(v.into()),
            (Self::Text(s), FieldKind::Embedded(EmbeddedKind::Bytes)) => Self::Bytes(s.into_bytes()),
            _ => return None,
        };
        Some(converted)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer value, widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some((*v).into()),
            Self::I16(v) => Some((*v).into()),
            Self::I32(v) => Some((*v).into()),
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some((*v).into()),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_reference_list(&self) -> Option<&[Reference]> {
        match self {
            Self::RefList(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Reference> for Value {
    fn from(v: Reference) -> Self {
        Self::Ref(v)
    }
}

/// A runtime object instance: an immutable type plus mutable field values.
pub struct Entity {
    descriptor: Arc<TypeDescriptor>,
    values: RwLock<Vec<Value>>,
}

impl Entity {
    /// Create an entity, checking every value against its field kind.
    pub fn new(descriptor: Arc<TypeDescriptor>, values: Vec<Value>) -> Result<EntityRef, TypeError> {
        check_values(&descriptor, &values)?;
        Ok(Arc::new(Self {
            descriptor,
            values: RwLock::new(values),
        }))
    }

    /// Create an entity with every field at its zero value.
    pub fn with_defaults(descriptor: Arc<TypeDescriptor>) -> EntityRef {
        let values = descriptor
            .fields()
            .iter()
            .map(|f| Value::default_for(&f.kind))
            .collect();
        Arc::new(Self {
            descriptor,
            values: RwLock::new(values),
        })
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn get(&self, field: &str) -> Result<Value, TypeError> {
        let idx = self.descriptor.index_of(field)?;
        Ok(self.values.read().expect("entity lock poisoned")[idx].clone())
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<(), TypeError> {
        let idx = self.descriptor.index_of(field)?;
        let value = value.into();
        let kind = &self.descriptor.fields()[idx].kind;
        if !value.matches(kind) {
            return Err(self.kind_mismatch(field, kind, &value));
        }
        self.values.write().expect("entity lock poisoned")[idx] = value;
        Ok(())
    }

    /// Point a reference field at `target`.
    pub fn set_reference(&self, field: &str, target: &EntityRef) -> Result<(), TypeError> {
        self.set(field, Value::Ref(Reference::to(target)))
    }

    /// Snapshot of all field values in layout order.
    pub fn values(&self) -> Vec<Value> {
        self.values.read().expect("entity lock poisoned").clone()
    }

    pub fn replace_values(&self, values: Vec<Value>) -> Result<(), TypeError> {
        check_values(&self.descriptor, &values)?;
        *self.values.write().expect("entity lock poisoned") = values;
        Ok(())
    }

    /// Follow a reference field, loading the target if it is not resident.
    ///
    /// A loaded target replaces the stub in place so later accesses do not
    /// go back to the loader.
    pub fn reference<L>(&self, field: &str, loader: &L) -> Result<Option<EntityRef>, L::Error>
    where
        L: ObjectLoader,
        L::Error: From<TypeError>,
    {
        let idx = self.descriptor.index_of(field)?;
        let current = match &self.values.read().expect("entity lock poisoned")[idx] {
            Value::Ref(r) => r.clone(),
            other => {
                return Err(self
                    .kind_mismatch(field, &FieldKind::Reference, other)
                    .into())
            }
        };
        let target = current.materialize(loader)?;
        if let (Reference::Stub(oid), Some(entity)) = (&current, &target) {
            let mut values = self.values.write().expect("entity lock poisoned");
            if let Value::Ref(slot) = &mut values[idx] {
                if slot.stub_oid() == Some(*oid) {
                    *slot = Reference::to(entity);
                }
            }
        }
        Ok(target)
    }

    /// Follow every element of a reference-list field.
    pub fn references<L>(&self, field: &str, loader: &L) -> Result<Vec<Option<EntityRef>>, L::Error>
    where
        L: ObjectLoader,
        L::Error: From<TypeError>,
    {
        let idx = self.descriptor.index_of(field)?;
        let current = match &self.values.read().expect("entity lock poisoned")[idx] {
            Value::RefList(list) => list.clone(),
            other => {
                return Err(self
                    .kind_mismatch(field, &FieldKind::ReferenceList, other)
                    .into())
            }
        };
        let targets = current
            .iter()
            .map(|r| r.materialize(loader))
            .collect::<Result<Vec<_>, _>>()?;

        let mut values = self.values.write().expect("entity lock poisoned");
        if let Value::RefList(list) = &mut values[idx] {
            if list.len() == targets.len() {
                for ((slot, read), target) in list.iter_mut().zip(&current).zip(&targets) {
                    if let (Some(oid), Some(entity)) = (read.stub_oid(), target) {
                        if slot.stub_oid() == Some(oid) {
                            *slot = Reference::to(entity);
                        }
                    }
                }
            }
        }
        Ok(targets)
    }

    fn kind_mismatch(&self, field: &str, expected: &FieldKind, actual: &Value) -> TypeError {
        TypeError::FieldKindMismatch {
            type_name: self.descriptor.name().to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
            actual: actual.kind_name().to_string(),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.read().expect("entity lock poisoned");
        let mut s = f.debug_struct(self.descriptor.name());
        for (field, value) in self.descriptor.fields().iter().zip(values.iter()) {
            s.field(&field.name, value);
        }
        s.finish()
    }
}

fn check_values(descriptor: &TypeDescriptor, values: &[Value]) -> Result<(), TypeError> {
    let fields = descriptor.fields();
    if fields.len() != values.len() {
        return Err(TypeError::ArityMismatch {
            type_name: descriptor.name().to_string(),
            expected: fields.len(),
            actual: values.len(),
        });
    }
    for (field, value) in fields.iter().zip(values) {
        if !value.matches(&field.kind) {
            return Err(TypeError::FieldKindMismatch {
                type_name: descriptor.name().to_string(),
                field: field.name.clone(),
                expected: field.kind.to_string(),
                actual: value.kind_name().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::HashMap;

    use super::*;
    use crate::schema::FieldDescriptor;

    fn node_type() -> Arc<TypeDescriptor> {
        Arc::new(
            TypeDescriptor::new(
                "Node",
                vec![
                    FieldDescriptor::primitive("value", PrimitiveKind::I64),
                    FieldDescriptor::reference("next"),
                    FieldDescriptor::reference_list("children"),
                ],
            )
            .unwrap(),
        )
    }

    struct MapLoader {
        objects: HashMap<Oid, EntityRef>,
        calls: Cell<usize>,
    }

    impl ObjectLoader for MapLoader {
        type Error = TypeError;

        fn load_object(&self, oid: Oid) -> Result<EntityRef, TypeError> {
            self.calls.set(self.calls.get() + 1);
            self.objects.get(&oid).cloned().ok_or(TypeError::UnknownField {
                type_name: "missing".into(),
                field: oid.to_string(),
            })
        }
    }

    // ---- Construction ----

    #[test]
    fn new_checks_arity_and_kinds() {
        let ty = node_type();
        let err = Entity::new(Arc::clone(&ty), vec![Value::I64(1)]).unwrap_err();
        assert!(matches!(err, TypeError::ArityMismatch { expected: 3, actual: 1, .. }));

        let err = Entity::new(
            ty,
            vec![
                Value::Text("x".into()),
                Value::Ref(Reference::Null),
                Value::RefList(vec![]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, TypeError::FieldKindMismatch { .. }));
    }

    #[test]
    fn defaults_are_zero_values() {
        let e = Entity::with_defaults(node_type());
        assert_eq!(e.get("value").unwrap(), Value::I64(0));
        assert_eq!(e.get("next").unwrap(), Value::Ref(Reference::Null));
        assert_eq!(e.get("children").unwrap(), Value::RefList(vec![]));
    }

    #[test]
    fn set_rejects_wrong_kind() {
        let e = Entity::with_defaults(node_type());
        assert!(e.set("value", 42i64).is_ok());
        assert!(e.set("value", 42i32).is_err());
        assert!(matches!(
            e.set("nope", 1i64),
            Err(TypeError::UnknownField { .. })
        ));
    }

    // ---- Lazy references ----

    #[test]
    fn stub_is_materialized_once() {
        let ty = node_type();
        let target = Entity::with_defaults(Arc::clone(&ty));
        target.set("value", 42i64).unwrap();
        let oid = Oid::new(Oid::FIRST.get() + 7);
        let loader = MapLoader {
            objects: HashMap::from([(oid, Arc::clone(&target))]),
            calls: Cell::new(0),
        };

        let owner = Entity::with_defaults(ty);
        owner.set("next", Reference::Stub(oid)).unwrap();

        let first = owner.reference("next", &loader).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &target));
        let second = owner.reference("next", &loader).unwrap().unwrap();
        assert!(Arc::ptr_eq(&second, &target));
        assert_eq!(loader.calls.get(), 1);
        assert_eq!(owner.get("next").unwrap(), Value::Ref(Reference::to(&target)));
    }

    #[test]
    fn null_reference_loads_nothing() {
        let loader = MapLoader {
            objects: HashMap::new(),
            calls: Cell::new(0),
        };
        let owner = Entity::with_defaults(node_type());
        assert!(owner.reference("next", &loader).unwrap().is_none());
        assert_eq!(loader.calls.get(), 0);
    }

    #[test]
    fn reference_list_materializes_each_stub() {
        let ty = node_type();
        let a = Entity::with_defaults(Arc::clone(&ty));
        let b = Entity::with_defaults(Arc::clone(&ty));
        let (oa, ob) = (Oid::new(Oid::FIRST.get()), Oid::new(Oid::FIRST.get() + 1));
        let loader = MapLoader {
            objects: HashMap::from([(oa, Arc::clone(&a)), (ob, Arc::clone(&b))]),
            calls: Cell::new(0),
        };
        let owner = Entity::with_defaults(ty);
        owner
            .set(
                "children",
                Value::RefList(vec![Reference::Stub(oa), Reference::Null, Reference::Stub(ob)]),
            )
            .unwrap();

        let targets = owner.references("children", &loader).unwrap();
        assert_eq!(targets.len(), 3);
        assert!(Arc::ptr_eq(targets[0].as_ref().unwrap(), &a));
        assert!(targets[1].is_none());
        assert!(Arc::ptr_eq(targets[2].as_ref().unwrap(), &b));

        owner.references("children", &loader).unwrap();
        assert_eq!(loader.calls.get(), 2);
    }

    /// Rewrites `owner.children` while the first stub is being loaded.
    struct RewritingLoader {
        inner: MapLoader,
        owner: EntityRef,
        replacement: Value,
    }

    impl ObjectLoader for RewritingLoader {
        type Error = TypeError;

        fn load_object(&self, oid: Oid) -> Result<EntityRef, TypeError> {
            if self.inner.calls.get() == 0 {
                self.owner.set("children", self.replacement.clone())?;
            }
            self.inner.load_object(oid)
        }
    }

    #[test]
    fn reference_list_keeps_stubs_rewritten_during_load() {
        let ty = node_type();
        let a = Entity::with_defaults(Arc::clone(&ty));
        let b = Entity::with_defaults(Arc::clone(&ty));
        let (oa, ob) = (Oid::new(Oid::FIRST.get()), Oid::new(Oid::FIRST.get() + 1));
        let (oc, od) = (Oid::new(Oid::FIRST.get() + 2), Oid::new(Oid::FIRST.get() + 3));
        let owner = Entity::with_defaults(ty);
        owner
            .set("children", Value::RefList(vec![Reference::Stub(oa), Reference::Stub(ob)]))
            .unwrap();
        let replacement = Value::RefList(vec![Reference::Stub(oc), Reference::Stub(od)]);
        let loader = RewritingLoader {
            inner: MapLoader {
                objects: HashMap::from([(oa, Arc::clone(&a)), (ob, Arc::clone(&b))]),
                calls: Cell::new(0),
            },
            owner: Arc::clone(&owner),
            replacement: replacement.clone(),
        };

        let targets = owner.references("children", &loader).unwrap();
        assert!(Arc::ptr_eq(targets[0].as_ref().unwrap(), &a));
        assert!(Arc::ptr_eq(targets[1].as_ref().unwrap(), &b));
        // the concurrent rewrite wins; its stubs are not replaced by stale targets
        assert_eq!(owner.get("children").unwrap(), replacement);
    }

    #[test]
    fn debug_does_not_recurse_through_cycles() {
        let ty = node_type();
        let a = Entity::with_defaults(Arc::clone(&ty));
        a.set_reference("next", &a).unwrap();
        let rendered = format!("{a:?}");
        assert!(rendered.contains("Resident(Node@"));
    }

    // ---- Conversions ----

    #[test]
    fn widening_conversions() {
        let i64_kind = FieldKind::Primitive(PrimitiveKind::I64);
        assert_eq!(Value::I32(7).convert_to(&i64_kind), Some(Value::I64(7)));
        assert_eq!(
            Value::F32(1.5).convert_to(&FieldKind::Primitive(PrimitiveKind::F64)),
            Some(Value::F64(1.5))
        );
        assert_eq!(
            Value::I64(7).convert_to(&FieldKind::Primitive(PrimitiveKind::I32)),
            None
        );
        assert_eq!(
            Value::Text("hi".into()).convert_to(&FieldKind::Embedded(EmbeddedKind::Bytes)),
            Some(Value::Bytes(b"hi".to_vec()))
        );
    }
}
