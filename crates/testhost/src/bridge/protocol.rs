//! Message types spoken between a controller and its test hosts.
//!
//! - **System messages** (ids 0-3): pre-registered in every registry.
//! - **Echo messages** (ids 16-18): the smoke protocol of `testhost-echo`.

use std::collections::BTreeMap;

use super::error::ProtocolError;
use super::registry::{FieldSpec, Message, MessageShape, MessageTypeId, WireMessage};
use super::wire::{FieldValue, Fields, WireKind};

pub const HANDSHAKE_TYPE: MessageTypeId = 0;
pub const ERROR_RESPONSE_TYPE: MessageTypeId = 1;
pub const VOID_RESPONSE_TYPE: MessageTypeId = 2;
pub const HOST_EXITING_TYPE: MessageTypeId = 3;

pub const ECHO_REQUEST_TYPE: MessageTypeId = 16;
pub const ECHO_RESPONSE_TYPE: MessageTypeId = 17;
pub const SHUTDOWN_REQUEST_TYPE: MessageTypeId = 18;
pub const ECHO_EVENT_TYPE: MessageTypeId = 19;

/// Keys of the handshake property bag.
pub mod handshake_keys {
    pub const PROCESS_ID: u8 = 0;
    pub const PROTOCOL_VERSION: u8 = 1;
    pub const PROTOCOL_FAMILY: u8 = 2;
    pub const HOST_ROLE: u8 = 3;
    pub const OPERATING_SYSTEM: u8 = 4;
    pub const ARCHITECTURE: u8 = 5;
    pub const EXECUTION_ID: u8 = 6;
    pub const RUNTIME_VERSION: u8 = 7;
}

/// Shapes bound in every registry before user registration.
pub fn system_shapes() -> Vec<MessageShape> {
    vec![
        Handshake::shape(),
        ErrorResponse::shape(),
        VoidResponse::shape(),
        HostExiting::shape(),
    ]
}

/// First frame in each direction: a `u8 → String` property bag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub properties: BTreeMap<u8, String>,
}

impl Handshake {
    pub fn with(mut self, key: u8, value: impl Into<String>) -> Self {
        self.properties.insert(key, value.into());
        self
    }

    pub fn get(&self, key: u8) -> Option<&str> {
        self.properties.get(&key).map(String::as_str)
    }
}

impl WireMessage for Handshake {
    const TYPE_ID: MessageTypeId = HANDSHAKE_TYPE;

    fn shape() -> MessageShape {
        MessageShape::request(Self::TYPE_ID, "Handshake")
            .field(FieldSpec::array(1, "properties", WireKind::Complex))
    }

    fn to_message(&self) -> Message {
        let entries = self
            .properties
            .iter()
            .map(|(key, value)| {
                FieldValue::Complex(Fields::new().with(1, *key).with(2, value.as_str()))
            })
            .collect();
        Message::empty(Self::TYPE_ID).with_field(1, FieldValue::array(WireKind::Complex, entries))
    }

    fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let mut properties = BTreeMap::new();
        for entry in message.fields().get_array(1).unwrap_or_default() {
            let FieldValue::Complex(entry) = entry else {
                return Err(ProtocolError::HandshakeViolation(
                    "handshake entry is not a complex value".into(),
                ));
            };
            let (Some(key), Some(value)) = (entry.get_u8(1), entry.get_str(2)) else {
                return Err(ProtocolError::HandshakeViolation(
                    "handshake entry lacks a key or value".into(),
                ));
            };
            properties.insert(key, value.to_string());
        }
        Ok(Self { properties })
    }
}

/// Failure reply carrying the remote error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub message: String,
}

impl WireMessage for ErrorResponse {
    const TYPE_ID: MessageTypeId = ERROR_RESPONSE_TYPE;

    fn shape() -> MessageShape {
        MessageShape::response(Self::TYPE_ID, "ErrorResponse").field(FieldSpec::string(1, "message"))
    }

    fn to_message(&self) -> Message {
        Message::empty(Self::TYPE_ID).with_field(1, self.message.as_str())
    }

    fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        Ok(Self {
            message: message.fields().get_str(1).unwrap_or_default().to_string(),
        })
    }
}

/// Empty acknowledgement for handlers that produce no reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoidResponse;

impl WireMessage for VoidResponse {
    const TYPE_ID: MessageTypeId = VOID_RESPONSE_TYPE;

    fn shape() -> MessageShape {
        MessageShape::response(Self::TYPE_ID, "VoidResponse")
    }

    fn to_message(&self) -> Message {
        Message::empty(Self::TYPE_ID)
    }

    fn from_message(_message: &Message) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// Sent by a test host just before it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostExiting {
    pub exit_code: i32,
}

impl WireMessage for HostExiting {
    const TYPE_ID: MessageTypeId = HOST_EXITING_TYPE;

    fn shape() -> MessageShape {
        MessageShape::request(Self::TYPE_ID, "HostExiting").field(FieldSpec::int32(1, "exit_code"))
    }

    fn to_message(&self) -> Message {
        Message::empty(Self::TYPE_ID).with_field(1, self.exit_code)
    }

    fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        Ok(Self {
            exit_code: message.fields().get_i32(1).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoRequest {
    pub text: String,
    pub value: i32,
}

impl WireMessage for EchoRequest {
    const TYPE_ID: MessageTypeId = ECHO_REQUEST_TYPE;

    fn shape() -> MessageShape {
        MessageShape::request(Self::TYPE_ID, "EchoRequest")
            .field(FieldSpec::string(1, "text"))
            .field(FieldSpec::int32(2, "value"))
    }

    fn to_message(&self) -> Message {
        Message::empty(Self::TYPE_ID)
            .with_field(1, self.text.as_str())
            .with_field(2, self.value)
    }

    fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let fields = message.fields();
        Ok(Self {
            text: fields.get_str(1).unwrap_or_default().to_string(),
            value: fields.get_i32(2).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoResponse {
    pub text: String,
    pub value: i32,
    /// Pid of the answering host.
    pub pid: i32,
}

impl WireMessage for EchoResponse {
    const TYPE_ID: MessageTypeId = ECHO_RESPONSE_TYPE;

    fn shape() -> MessageShape {
        MessageShape::response(Self::TYPE_ID, "EchoResponse")
            .field(FieldSpec::string(1, "text"))
            .field(FieldSpec::int32(2, "value"))
            .field(FieldSpec::int32(3, "pid"))
    }

    fn to_message(&self) -> Message {
        Message::empty(Self::TYPE_ID)
            .with_field(1, self.text.as_str())
            .with_field(2, self.value)
            .with_field(3, self.pid)
    }

    fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let fields = message.fields();
        Ok(Self {
            text: fields.get_str(1).unwrap_or_default().to_string(),
            value: fields.get_i32(2).unwrap_or_default(),
            pid: fields.get_i32(3).unwrap_or_default(),
        })
    }
}

/// Asks an echo host to exit with the given code. Sent fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub exit_code: i32,
}

impl WireMessage for ShutdownRequest {
    const TYPE_ID: MessageTypeId = SHUTDOWN_REQUEST_TYPE;

    fn shape() -> MessageShape {
        MessageShape::request(Self::TYPE_ID, "ShutdownRequest").field(FieldSpec::int32(1, "exit_code"))
    }

    fn to_message(&self) -> Message {
        Message::empty(Self::TYPE_ID).with_field(1, self.exit_code)
    }

    fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        Ok(Self {
            exit_code: message.fields().get_i32(1).unwrap_or_default(),
        })
    }
}

/// Data message published by an echo host. Routed to data consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoEvent {
    pub sequence: i32,
    pub text: String,
}

impl WireMessage for EchoEvent {
    const TYPE_ID: MessageTypeId = ECHO_EVENT_TYPE;

    fn shape() -> MessageShape {
        MessageShape::request(Self::TYPE_ID, "EchoEvent")
            .field(FieldSpec::int32(1, "sequence"))
            .field(FieldSpec::string(2, "text"))
    }

    fn to_message(&self) -> Message {
        Message::empty(Self::TYPE_ID)
            .with_field(1, self.sequence)
            .with_field(2, self.text.as_str())
    }

    fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let fields = message.fields();
        Ok(Self {
            sequence: fields.get_i32(1).unwrap_or_default(),
            text: fields.get_str(2).unwrap_or_default().to_string(),
        })
    }
}

/// Register the echo smoke protocol on top of the system shapes.
pub fn register_echo_protocol(
    registry: &mut super::registry::SerializerRegistry,
) -> Result<(), ProtocolError> {
    registry.register_message::<EchoRequest>()?;
    registry.register_message::<EchoResponse>()?;
    registry.register_message::<ShutdownRequest>()?;
    registry.register_message::<EchoEvent>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_bag_roundtrips_through_message() {
        let hello = Handshake::default()
            .with(handshake_keys::PROTOCOL_VERSION, "1.0")
            .with(handshake_keys::PROTOCOL_FAMILY, "testhost")
            .with(handshake_keys::EXECUTION_ID, "");
        let decoded = Handshake::from_message(&hello.to_message()).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(decoded.get(handshake_keys::EXECUTION_ID), Some(""));
    }

    #[test]
    fn empty_handshake_is_an_empty_bag() {
        let decoded = Handshake::from_message(&Message::empty(HANDSHAKE_TYPE)).unwrap();
        assert!(decoded.properties.is_empty());
    }

    #[test]
    fn malformed_handshake_entry_is_a_violation() {
        let msg = Message::empty(HANDSHAKE_TYPE).with_field(
            1,
            FieldValue::array(WireKind::Complex, vec![Fields::new().with(2, "orphan").into()]),
        );
        assert!(matches!(
            Handshake::from_message(&msg),
            Err(ProtocolError::HandshakeViolation(_))
        ));
    }

    #[test]
    fn echo_messages_map_fields_by_id() {
        let req = EchoRequest {
            text: "ping".into(),
            value: 3,
        };
        let msg = req.to_message();
        assert_eq!(msg.type_id(), ECHO_REQUEST_TYPE);
        assert_eq!(msg.fields().get_str(1), Some("ping"));
        assert_eq!(EchoRequest::from_message(&msg).unwrap(), req);
    }

    #[test]
    fn system_shapes_have_expected_kinds() {
        let names: Vec<_> = system_shapes()
            .into_iter()
            .map(|s| (s.type_id, s.name, s.kind))
            .collect();
        insta::assert_debug_snapshot!(names, @r#"
        [
            (
                0,
                "Handshake",
                Request,
            ),
            (
                1,
                "ErrorResponse",
                Response,
            ),
            (
                2,
                "VoidResponse",
                Response,
            ),
            (
                3,
                "HostExiting",
                Request,
            ),
        ]
        "#);
    }
}
