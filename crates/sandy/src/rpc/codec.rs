//! One message per line, UTF-8 JSON, terminated by `\n`.

use thiserror::Error;

use super::message::{Message, WireMessage};

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    Shape(&'static str),
}

/// Encodes `message` as a single newline-terminated line.
///
/// JSON string escaping guarantees the body itself never contains a raw
/// newline.
pub fn encode(message: &Message) -> Result<String, FramingError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line (with or without its terminator).
pub fn decode(line: &str) -> Result<Message, FramingError> {
    let wire: WireMessage = serde_json::from_str(line.trim_end_matches(['\r', '\n']))?;
    wire.classify().map_err(FramingError::Shape)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::{error::ErrorKind, rpc::RpcError};

    #[test]
    fn encodes_one_line_per_message() {
        let line = encode(&Message::request(7, "Invoke", json!({"text": "a\nb"})))
            .expect("encode");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(
            decode(&line).expect("decode"),
            Message::request(7, "Invoke", json!({"text": "a\nb"}))
        );
    }

    #[test]
    fn null_result_is_a_successful_response() {
        let message = decode(r#"{"id":3,"result":null}"#).expect("decode");
        assert_eq!(message, Message::response(3, Ok(Value::Null)));

        let line = encode(&message).expect("encode");
        assert!(line.contains(r#""result":null"#));
    }

    #[test]
    fn error_response_keeps_type_and_guest_type() {
        let message = decode(
            r#"{"id":1,"error":{"type":"GuestFault","message":"boom","guestType":"Overflow"}}"#,
        )
        .expect("decode");
        let Message::Response {
            id: 1,
            outcome: Err(error),
        } = message
        else {
            panic!("expected an error response, got {message:?}");
        };
        assert_eq!(
            error,
            RpcError {
                kind: ErrorKind::GuestFault,
                message: "boom".into(),
                guest_type: Some("Overflow".into()),
            }
        );
    }

    #[test]
    fn notification_without_params_decodes_null() {
        assert_eq!(
            decode(r#"{"method":"NotifyStarted"}"#).expect("decode"),
            Message::notification("NotifyStarted", Value::Null)
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        assert_eq!(
            decode(r#"{"jsonrpc":"2.0","id":9,"method":"Shutdown"}"#).expect("decode"),
            Message::request(9, "Shutdown", Value::Null)
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(decode("{not json"), Err(FramingError::Malformed(_))));
        assert!(matches!(decode("42"), Err(FramingError::Malformed(_))));
        assert!(matches!(decode("{}"), Err(FramingError::Shape(_))));
        assert!(matches!(
            decode(r#"{"id":1}"#),
            Err(FramingError::Shape(_))
        ));
        assert!(matches!(
            decode(r#"{"id":1,"result":1,"error":{"type":"Internal","message":""}}"#),
            Err(FramingError::Shape(_))
        ));
    }
}
