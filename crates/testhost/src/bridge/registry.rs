//! Message shapes and the per-family serializer registry.
//!
//! A shape declares, for one message type id, the fields it carries and the
//! default substituted when a peer omits one. The registry is filled once at
//! setup and then shared read-only (behind an `Arc`) by the codec.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use bytes::BytesMut;

use super::error::ProtocolError;
use super::protocol::system_shapes;
use super::wire::{self, FieldId, FieldValue, Fields, WireKind};

pub type MessageTypeId = u32;

/// Field id reserved for the dispatch envelope.
pub const ENVELOPE_FIELD_ID: FieldId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
}

/// Declaration of a single field within a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub id: FieldId,
    pub name: &'static str,
    pub kind: WireKind,
    /// Element kind, only meaningful for arrays.
    pub element: Option<WireKind>,
    pub default: FieldValue,
}

impl FieldSpec {
    fn scalar(id: FieldId, name: &'static str, default: FieldValue) -> Self {
        Self {
            id,
            name,
            kind: default.kind(),
            element: None,
            default,
        }
    }

    pub fn bool(id: FieldId, name: &'static str) -> Self {
        Self::scalar(id, name, FieldValue::Bool(false))
    }

    pub fn byte(id: FieldId, name: &'static str) -> Self {
        Self::scalar(id, name, FieldValue::Byte(0))
    }

    pub fn int16(id: FieldId, name: &'static str) -> Self {
        Self::scalar(id, name, FieldValue::Int16(0))
    }

    pub fn int32(id: FieldId, name: &'static str) -> Self {
        Self::scalar(id, name, FieldValue::Int32(0))
    }

    pub fn int64(id: FieldId, name: &'static str) -> Self {
        Self::scalar(id, name, FieldValue::Int64(0))
    }

    pub fn string(id: FieldId, name: &'static str) -> Self {
        Self::scalar(id, name, FieldValue::String(String::new()))
    }

    pub fn complex(id: FieldId, name: &'static str) -> Self {
        Self::scalar(id, name, FieldValue::Complex(Fields::new()))
    }

    pub fn array(id: FieldId, name: &'static str, element: WireKind) -> Self {
        Self {
            id,
            name,
            kind: WireKind::Array,
            element: Some(element),
            default: FieldValue::array(element, Vec::new()),
        }
    }

    /// Override the value used when the field is absent.
    pub fn with_default(mut self, default: impl Into<FieldValue>) -> Self {
        self.default = default.into();
        self
    }

    pub fn matches(&self, value: &FieldValue) -> bool {
        match value {
            FieldValue::Array { element, .. } => {
                self.kind == WireKind::Array && self.element == Some(*element)
            }
            other => other.kind() == self.kind,
        }
    }
}

/// Declared layout of one message type.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageShape {
    pub type_id: MessageTypeId,
    pub name: String,
    pub kind: MessageKind,
    fields: Vec<FieldSpec>,
}

impl MessageShape {
    pub fn request(type_id: MessageTypeId, name: impl Into<String>) -> Self {
        Self::new(type_id, name, MessageKind::Request)
    }

    pub fn response(type_id: MessageTypeId, name: impl Into<String>) -> Self {
        Self::new(type_id, name, MessageKind::Response)
    }

    fn new(type_id: MessageTypeId, name: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            type_id,
            name: name.into(),
            kind,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self.fields.sort_by_key(|f| f.id);
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_spec(&self, id: FieldId) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.id == id)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let invalid = |reason: String| ProtocolError::InvalidShape {
            shape: self.name.clone(),
            reason,
        };
        let mut seen = BTreeSet::new();
        for spec in &self.fields {
            if spec.id == ENVELOPE_FIELD_ID {
                return Err(invalid(format!(
                    "field '{}' uses reserved id {ENVELOPE_FIELD_ID}",
                    spec.name
                )));
            }
            if !seen.insert(spec.id) {
                return Err(invalid(format!("field id {} declared twice", spec.id)));
            }
            if !spec.matches(&spec.default) {
                return Err(invalid(format!(
                    "default for field '{}' does not match its kind",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Serialize every declared field in ascending id order, substituting
    /// defaults for the ones `fields` does not carry.
    pub fn encode_fields(&self, fields: &Fields, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        for (id, value) in fields {
            let spec = self.field_spec(*id).ok_or_else(|| {
                ProtocolError::invalid_message(format!(
                    "{} has no field with id {id}",
                    self.name
                ))
            })?;
            if !spec.matches(value) {
                return Err(ProtocolError::invalid_message(format!(
                    "{}.{} expects {:?}, got {:?}",
                    self.name,
                    spec.name,
                    spec.kind,
                    value.kind()
                )));
            }
        }
        for spec in &self.fields {
            let value = fields.get(spec.id).unwrap_or(&spec.default);
            wire::encode_field(spec.id, value, dst)?;
        }
        Ok(())
    }

    /// Project decoded wire fields onto this shape: unknown ids are dropped,
    /// missing ids take their default.
    pub fn decode_fields(&self, decoded: Fields) -> Result<Fields, ProtocolError> {
        let mut out = Fields::new();
        for (id, value) in decoded {
            match self.field_spec(id) {
                Some(spec) if spec.matches(&value) => {
                    out.insert(id, value);
                }
                Some(spec) => {
                    return Err(ProtocolError::corrupt(format!(
                        "{}.{} arrived as {:?}, expected {:?}",
                        self.name,
                        spec.name,
                        value.kind(),
                        spec.kind
                    )));
                }
                None => {
                    tracing::trace!(shape = %self.name, field_id = id, "Skipping unknown field");
                }
            }
        }
        for spec in &self.fields {
            if !out.contains(spec.id) {
                out.insert(spec.id, spec.default.clone());
            }
        }
        Ok(out)
    }
}

/// A typed message: type id plus field values. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    type_id: MessageTypeId,
    fields: Fields,
}

impl Message {
    pub fn new(type_id: MessageTypeId, fields: Fields) -> Self {
        Self { type_id, fields }
    }

    pub fn empty(type_id: MessageTypeId) -> Self {
        Self::new(type_id, Fields::new())
    }

    pub fn with_field(mut self, id: FieldId, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(id, value);
        self
    }

    pub fn type_id(&self) -> MessageTypeId {
        self.type_id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// Decode into a typed message, checking the type id first.
    pub fn decode<M: WireMessage>(&self) -> Result<M, ProtocolError> {
        if self.type_id != M::TYPE_ID {
            return Err(ProtocolError::invalid_message(format!(
                "expected message type {}, got {}",
                M::TYPE_ID,
                self.type_id
            )));
        }
        M::from_message(self)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message type {} ({} fields)", self.type_id, self.fields.len())
    }
}

/// Strongly typed view over a registered shape.
pub trait WireMessage: Sized {
    const TYPE_ID: MessageTypeId;

    fn shape() -> MessageShape;

    fn to_message(&self) -> Message;

    fn from_message(message: &Message) -> Result<Self, ProtocolError>;
}

/// Type id → shape table for one protocol family.
#[derive(Debug, Clone)]
pub struct SerializerRegistry {
    family: String,
    shapes: HashMap<MessageTypeId, MessageShape>,
}

impl SerializerRegistry {
    /// Create a registry with the system shapes already bound.
    pub fn new(family: impl Into<String>) -> Self {
        let mut registry = Self {
            family: family.into(),
            shapes: HashMap::new(),
        };
        for shape in system_shapes() {
            registry.shapes.insert(shape.type_id, shape);
        }
        registry
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn register(&mut self, shape: MessageShape) -> Result<(), ProtocolError> {
        if self.shapes.contains_key(&shape.type_id) {
            return Err(ProtocolError::DuplicateTypeId {
                type_id: shape.type_id,
                family: self.family.clone(),
            });
        }
        shape.validate()?;
        tracing::debug!(
            family = %self.family,
            type_id = shape.type_id,
            shape = %shape.name,
            "Registered message shape"
        );
        self.shapes.insert(shape.type_id, shape);
        Ok(())
    }

    pub fn register_message<M: WireMessage>(&mut self) -> Result<(), ProtocolError> {
        let shape = M::shape();
        if shape.type_id != M::TYPE_ID {
            return Err(ProtocolError::InvalidShape {
                shape: shape.name,
                reason: format!("shape id {} differs from TYPE_ID {}", shape.type_id, M::TYPE_ID),
            });
        }
        self.register(shape)
    }

    pub fn resolve(&self, type_id: MessageTypeId) -> Result<&MessageShape, ProtocolError> {
        self.shapes
            .get(&type_id)
            .ok_or(ProtocolError::UnknownTypeId(type_id))
    }

    pub fn contains(&self, type_id: MessageTypeId) -> bool {
        self.shapes.contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}
