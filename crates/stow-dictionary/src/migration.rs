use serde::{Deserialize, Serialize};
use stow_types::{FieldDescriptor, FieldKind, Tid, TypeDescriptor, Value};

use crate::error::{DictionaryError, DictionaryResult};

/// Where a field of the newer layout takes its value from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldSource {
    /// Copy (and widen if needed) the named field of the older layout.
    Field(String),
    /// Start at the zero value of the new field's kind.
    Default,
}

/// Rewrites values laid out for `from` into the layout of `to`.
///
/// `fields` has one entry per field of the `to` layout, in layout order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub from: Tid,
    pub to: Tid,
    pub fields: Vec<FieldSource>,
    /// Recorded automatically when a changed layout was first stored.
    #[serde(default)]
    pub inferred: bool,
}

/// Whether every value of kind `from` converts into kind `to`.
pub(crate) fn kind_convertible(from: &FieldKind, to: &FieldKind) -> bool {
    Value::default_for(from).convert_to(to).is_some()
}

/// Same-named old field when its kind converts, the zero value otherwise.
fn same_name_source(old: &TypeDescriptor, field: &FieldDescriptor) -> FieldSource {
    match old.field(&field.name) {
        Some(same) if kind_convertible(&same.kind, &field.kind) => FieldSource::Field(field.name.clone()),
        _ => FieldSource::Default,
    }
}

impl Migration {
    /// Build the field mapping for `old -> new`.
    ///
    /// Explicit `overrides` win; any other new field copies the same-named
    /// old field when one exists with a convertible kind, and defaults
    /// otherwise.
    pub(crate) fn plan(
        from: Tid,
        old: &TypeDescriptor,
        to: Tid,
        new: &TypeDescriptor,
        overrides: &[(String, FieldSource)],
    ) -> DictionaryResult<Self> {
        let mut fields = Vec::with_capacity(new.fields().len());
        for field in new.fields() {
            let explicit = overrides
                .iter()
                .find(|(name, _)| *name == field.name)
                .map(|(_, source)| source.clone());
            let source = match explicit {
                Some(FieldSource::Field(source_name)) => {
                    let source_field = old.field(&source_name).ok_or_else(|| {
                        DictionaryError::UnknownSourceField {
                            from,
                            field: source_name.clone(),
                        }
                    })?;
                    if !kind_convertible(&source_field.kind, &field.kind) {
                        return Err(DictionaryError::IncompatibleField {
                            from,
                            to,
                            field: field.name.clone(),
                            source_field: source_name,
                        });
                    }
                    FieldSource::Field(source_name)
                }
                Some(FieldSource::Default) => FieldSource::Default,
                None => same_name_source(old, field),
            };
            fields.push(source);
        }
        Ok(Self {
            from,
            to,
            fields,
            inferred: false,
        })
    }

    /// Mapping by field name only, for a layout change nobody declared.
    pub(crate) fn inferred(from: Tid, old: &TypeDescriptor, to: Tid, new: &TypeDescriptor) -> Self {
        Self {
            from,
            to,
            fields: new.fields().iter().map(|f| same_name_source(old, f)).collect(),
            inferred: true,
        }
    }

    /// Apply this migration to values decoded under `old`.
    pub fn apply(
        &self,
        old: &TypeDescriptor,
        new: &TypeDescriptor,
        values: Vec<Value>,
    ) -> DictionaryResult<Vec<Value>> {
        let mut out = Vec::with_capacity(new.fields().len());
        for (field, source) in new.fields().iter().zip(&self.fields) {
            let value = match source {
                FieldSource::Default => Value::default_for(&field.kind),
                FieldSource::Field(name) => {
                    let idx = old.field_index(name).ok_or_else(|| {
                        DictionaryError::UnknownSourceField {
                            from: self.from,
                            field: name.clone(),
                        }
                    })?;
                    // an old field may feed several new ones
                    values[idx]
                        .clone()
                        .convert_to(&field.kind)
                        .ok_or_else(|| DictionaryError::IncompatibleField {
                            from: self.from,
                            to: self.to,
                            field: field.name.clone(),
                            source_field: name.clone(),
                        })?
                }
            };
            out.push(value);
        }
        Ok(out)
    }
}
