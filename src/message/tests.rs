use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Message, MessageRegistry, StringMessage, TestMessage};
use crate::utils::error::Error;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Pose {
    x: f64,
    y: f64,
}

impl Message for Pose {
    const TYPE_NAME: &'static str = "Pose";
}

#[test]
fn test_message_payload_is_json() {
    let msg = TestMessage {
        test_string: "hello".to_string(),
    };
    let payload = msg.encode_payload().unwrap();
    assert_eq!(payload, br#"{"test_string":"hello"}"#);
    assert_eq!(TestMessage::decode_payload(&payload).unwrap(), msg);
}

#[test]
fn test_decode_payload_rejects_wrong_shape() {
    let err = TestMessage::decode_payload(br#"{"data":"x"}"#).unwrap_err();
    assert!(matches!(err, Error::Json(_)));
}

#[test]
fn test_builtin_registry() {
    let registry = MessageRegistry::builtin();
    assert_eq!(
        registry.type_names(),
        vec![
            "BoolMessage",
            "EmptyMessage",
            "Float64Message",
            "Int64Message",
            "StringMessage",
            "TestMessage"
        ]
    );
    assert!(!registry.contains("Pose"));
}

#[test]
fn test_registry_encode_and_decode() {
    let registry = MessageRegistry::builtin();
    let payload = registry
        .encode(StringMessage::TYPE_NAME, &json!({"data": "hi"}))
        .unwrap();
    assert_eq!(
        StringMessage::decode_payload(&payload).unwrap(),
        StringMessage {
            data: "hi".to_string()
        }
    );
    assert_eq!(
        registry.decode(StringMessage::TYPE_NAME, &payload).unwrap(),
        json!({"data": "hi"})
    );
}

#[test]
fn test_registry_validates_values() {
    let registry = MessageRegistry::builtin();
    assert!(matches!(
        registry.encode("Int64Message", &json!({"data": "not a number"})),
        Err(Error::Json(_))
    ));
    assert!(matches!(
        registry.decode("Nope", b"{}"),
        Err(Error::UnknownMessageType(name)) if name == "Nope"
    ));
}

#[test]
fn test_registry_accepts_application_types() {
    let mut registry = MessageRegistry::new();
    registry.register::<Pose>();
    let payload = registry.encode("Pose", &json!({"x": 1.5, "y": -2.0})).unwrap();
    assert_eq!(
        Pose::decode_payload(&payload).unwrap(),
        Pose { x: 1.5, y: -2.0 }
    );
}
