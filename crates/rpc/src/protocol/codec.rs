//! Dual codec: JSON-RPC 2.0 shaped text frames and CBOR binary frames.
//!
//! Both forms share one logical shape. Requests are
//! `{jsonrpc, id, method, params}` and responses `{jsonrpc, id, result}` or
//! `{jsonrpc, id, error}`. Binary frames carry errors as an exception tag
//! (see [`EXCEPTION_TAG`]); text frames carry them as a JSON-RPC error object
//! `{code, message, data: {type, attributes}}`.

use std::collections::BTreeMap;

use bytes::Bytes;
use ciborium::Value;

use crate::error::{CodecError, Error, ProtocolError, Result};
use crate::protocol::exception::{
    EXCEPTION_TAG, ExceptionKind, RemoteException, attributes_from_value,
};
use crate::protocol::message::{Message, Params, Request, RequestId, Response};

const JSONRPC_VERSION: &str = "2.0";

/// Wire representation of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON in a text frame.
    Text,
    /// CBOR in a binary frame.
    #[default]
    Binary,
}

/// Encode a message as a JSON text frame.
///
/// # Errors
///
/// Returns an error if the message carries values JSON cannot represent
/// (byte strings, tags, non-text map keys, non-finite floats).
pub fn encode_text(message: &Message) -> Result<String> {
    let json = value_to_json(&to_value(message, WireFormat::Text))?;
    serde_json::to_string(&json)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()).into())
}

/// Encode a message as a CBOR binary frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn encode_binary(message: &Message) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&to_value(message, WireFormat::Binary), &mut buf)
        .map_err(CodecError::from)?;
    Ok(Bytes::from(buf))
}

/// Decode a JSON text frame.
///
/// # Errors
///
/// Returns a codec error for invalid JSON or exception data, or a protocol
/// error for a well-formed document of the wrong shape.
pub fn decode_text(text: &str) -> Result<Message> {
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| CodecError::DeserializationFailed(e.to_string()))?;
    from_value(json_to_value(json))
}

/// Decode a CBOR binary frame.
///
/// # Errors
///
/// Returns a codec error for invalid CBOR or an exception tag that cannot be
/// reconstructed, or a protocol error for a message of the wrong shape.
pub fn decode_binary(data: &[u8]) -> Result<Message> {
    let value: Value = ciborium::de::from_reader(data).map_err(CodecError::from)?;
    from_value(value)
}

/// Build the wire document for a message.
#[must_use]
pub fn to_value(message: &Message, format: WireFormat) -> Value {
    let mut fields = vec![
        text("jsonrpc", Value::Text(JSONRPC_VERSION.to_string())),
        text("id", Value::Integer(message.id().into())),
    ];

    match message {
        Message::Request(request) => {
            fields.push(text("method", Value::Text(request.method.clone())));
            fields.push(text("params", params_to_value(&request.params)));
        }
        Message::Response(response) => match &response.payload {
            Ok(result) => fields.push(text("result", result.clone())),
            Err(exception) => {
                let error = match format {
                    WireFormat::Binary => exception.to_value(),
                    WireFormat::Text => error_object(exception),
                };
                fields.push(text("error", error));
            }
        },
    }

    Value::Map(fields)
}

/// Classify a decoded wire document.
///
/// A document with `method` is a request; one with `result` or `error` is a
/// response. Anything else is a protocol error.
///
/// # Errors
///
/// Returns a protocol error for missing or mistyped keys and a codec error for
/// exception data that cannot be reconstructed.
pub fn from_value(value: Value) -> Result<Message> {
    let Value::Map(entries) = value else {
        return Err(invalid("message", "expected a map"));
    };

    let mut id = None;
    let mut method = None;
    let mut params = None;
    let mut result = None;
    let mut error = None;

    for (key, value) in entries {
        let Value::Text(key) = key else { continue };
        match key.as_str() {
            "id" => id = Some(value),
            "method" => method = Some(value),
            "params" => params = Some(value),
            "result" => result = Some(value),
            "error" => error = Some(value),
            _ => {}
        }
    }

    if let Some(method) = method {
        let id = parse_id(id)?;
        let Value::Text(method) = method else {
            return Err(invalid("method", "expected text"));
        };
        let params = match params {
            None | Some(Value::Null) => Params::none(),
            Some(Value::Array(args)) => {
                args.iter().try_for_each(validate_tags)?;
                Params::Positional(args)
            }
            Some(Value::Map(args)) => Params::Named(named_params(args)?),
            Some(_) => return Err(invalid("params", "expected an array or a map")),
        };
        return Ok(Request { id, method, params }.into());
    }

    match (result, error) {
        (_, Some(error)) if !error.is_null() => {
            let id = parse_id(id)?;
            Ok(Response::error(id, exception_from_error(&error)?).into())
        }
        (Some(result), _) => {
            let id = parse_id(id)?;
            validate_tags(&result)?;
            Ok(Response::result(id, result).into())
        }
        (None, Some(_)) => Ok(Response::result(parse_id(id)?, Value::Null).into()),
        (None, None) => Err(ProtocolError::UnknownShape.into()),
    }
}

/// JSON-RPC error object for a text frame.
#[must_use]
pub fn error_object(exception: &RemoteException) -> Value {
    Value::Map(vec![
        text("code", Value::Integer(exception.kind().code().into())),
        text("message", Value::Text(exception.message().to_string())),
        text(
            "data",
            Value::Map(vec![
                text("type", Value::Text(exception.kind().type_name().to_string())),
                text("attributes", exception.attributes_value()),
            ]),
        ),
    ])
}

/// Check that every exception tag nested in `value` reconstructs.
///
/// Other tags are left alone.
///
/// # Errors
///
/// Returns a codec error for the first exception tag that does not reconstruct.
pub fn validate_tags(value: &Value) -> Result<()> {
    match value {
        Value::Tag(EXCEPTION_TAG, payload) => {
            RemoteException::from_envelope(payload)?;
            Ok(())
        }
        Value::Tag(_, inner) => validate_tags(inner),
        Value::Array(items) => items.iter().try_for_each(validate_tags),
        Value::Map(entries) => entries.iter().try_for_each(|(key, value)| {
            validate_tags(key)?;
            validate_tags(value)
        }),
        _ => Ok(()),
    }
}

fn text(key: &str, value: Value) -> (Value, Value) {
    (Value::Text(key.to_string()), value)
}

fn invalid(field: &'static str, reason: &str) -> Error {
    ProtocolError::InvalidField {
        field,
        reason: reason.to_string(),
    }
    .into()
}

fn parse_id(id: Option<Value>) -> Result<RequestId> {
    match id {
        Some(Value::Integer(id)) => {
            RequestId::try_from(id).map_err(|_| invalid("id", "out of range"))
        }
        Some(_) => Err(invalid("id", "expected an integer")),
        None => Err(invalid("id", "missing")),
    }
}

fn params_to_value(params: &Params) -> Value {
    match params {
        Params::Positional(args) => Value::Array(args.clone()),
        Params::Named(args) => Value::Map(
            args.iter()
                .map(|(name, value)| (Value::Text(name.clone()), value.clone()))
                .collect(),
        ),
    }
}

fn named_params(entries: Vec<(Value, Value)>) -> Result<BTreeMap<String, Value>> {
    entries
        .into_iter()
        .map(|(key, value)| match key {
            Value::Text(key) => {
                validate_tags(&value)?;
                Ok((key, value))
            }
            _ => Err(invalid("params", "keyword names must be text")),
        })
        .collect()
}

fn exception_from_error(error: &Value) -> Result<RemoteException> {
    if let Value::Tag(..) = error {
        return Ok(RemoteException::from_value(error)?);
    }

    let entries = error
        .as_map()
        .ok_or_else(|| CodecError::MalformedException("error must be a map or tag".to_string()))?;
    let field = |name: &str| {
        entries
            .iter()
            .find(|(key, _)| key.as_text().is_some_and(|key| key == name))
            .map(|(_, value)| value)
    };

    if let Some(data) = field("data").filter(|data| data.is_map()) {
        let data = data.as_map().map_or(&[][..], Vec::as_slice);
        let lookup = |name: &str| {
            data.iter()
                .find(|(key, _)| key.as_text().is_some_and(|key| key == name))
                .map(|(_, value)| value)
        };
        if let Some(type_name) = lookup("type").and_then(Value::as_text) {
            let kind = ExceptionKind::from_type_name(type_name)
                .ok_or_else(|| CodecError::UnknownExceptionType(type_name.to_string()))?;
            let attributes = match lookup("attributes") {
                Some(attributes) => attributes_from_value(attributes)?,
                None => BTreeMap::new(),
            };
            return Ok(RemoteException::from_parts(kind, attributes));
        }
    }

    // Foreign JSON-RPC peers only send a code and a message.
    let kind = field("code")
        .and_then(Value::as_integer)
        .and_then(|code| i64::try_from(code).ok())
        .map_or(ExceptionKind::InternalError, ExceptionKind::from_code);
    let message = field("message")
        .and_then(Value::as_text)
        .map(str::to_string)
        .unwrap_or_default();
    Ok(RemoteException::new(kind, message))
}

/// Convert a payload to JSON.
///
/// # Errors
///
/// Returns an error for values JSON cannot represent.
pub fn value_to_json(value: &Value) -> Result<serde_json::Value> {
    let unsupported = |what: &str| -> Error {
        CodecError::SerializationFailed(format!("{what} cannot be represented as JSON")).into()
    };

    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(integer) => {
            let integer = i128::from(*integer);
            if let Ok(n) = i64::try_from(integer) {
                n.into()
            } else if let Ok(n) = u64::try_from(integer) {
                n.into()
            } else {
                return Err(unsupported("integer outside 64-bit range"));
            }
        }
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| unsupported("non-finite float"))?,
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(
            items.iter().map(value_to_json).collect::<Result<_>>()?,
        ),
        Value::Map(entries) => {
            let mut object = serde_json::Map::with_capacity(entries.len());
            for (key, value) in entries {
                let Value::Text(key) = key else {
                    return Err(unsupported("non-text map key"));
                };
                object.insert(key.clone(), value_to_json(value)?);
            }
            serde_json::Value::Object(object)
        }
        Value::Bytes(_) => return Err(unsupported("byte string")),
        Value::Tag(tag, _) => return Err(unsupported(&format!("tag {tag}"))),
        _ => return Err(unsupported("value")),
    })
}

/// Convert JSON to a payload.
#[must_use]
pub fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(n) = n.as_i64() {
                Value::Integer(n.into())
            } else if let Some(n) = n.as_u64() {
                Value::Integer(n.into())
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(object) => Value::Map(
            object
                .into_iter()
                .map(|(key, value)| (Value::Text(key), json_to_value(value)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        Request::new(
            42,
            "fs.enumerate_directory",
            [Value::Text("/tmp".to_string())],
        )
        .into()
    }

    #[test]
    fn test_text_request_shape() {
        let text = encode_text(&request()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 42);
        assert_eq!(json["method"], "fs.enumerate_directory");
        assert_eq!(json["params"], serde_json::json!(["/tmp"]));
        assert_eq!(decode_text(&text).unwrap(), request());
    }

    #[test]
    fn test_binary_request_roundtrip() {
        let mut named = BTreeMap::new();
        named.insert("blob".to_string(), Value::Bytes(vec![0, 1, 2]));
        let message: Message = Request::new(7, "shell.run_shell_command", named).into();

        let encoded = encode_binary(&message).unwrap();
        assert_eq!(decode_binary(&encoded).unwrap(), message);
    }

    #[test]
    fn test_text_rejects_bytes() {
        let message: Message = Response::result(1, Value::Bytes(vec![1])).into();
        assert!(matches!(
            encode_text(&message),
            Err(Error::Codec(CodecError::SerializationFailed(_)))
        ));
    }

    #[test]
    fn test_error_response_both_formats() {
        let exception = RemoteException::new(ExceptionKind::IoError, "Permission denied")
            .with_attribute("errno", Value::Integer(13.into()));
        let message: Message = Response::error(9, exception.clone()).into();

        for decoded in [
            decode_binary(&encode_binary(&message).unwrap()).unwrap(),
            decode_text(&encode_text(&message).unwrap()).unwrap(),
        ] {
            let Message::Response(response) = decoded else {
                panic!("expected a response");
            };
            let err = response.payload.unwrap_err();
            assert_eq!(err.kind(), ExceptionKind::IoError);
            assert_eq!(err.attributes(), exception.attributes());
        }
    }

    #[test]
    fn test_text_error_carries_jsonrpc_code() {
        let message: Message =
            Response::error(3, RemoteException::method_not_found("nope")).into();
        let json: serde_json::Value =
            serde_json::from_str(&encode_text(&message).unwrap()).unwrap();

        assert_eq!(json["error"]["code"], -32601);
        assert_eq!(json["error"]["data"]["type"], "MethodNotFound");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_foreign_error_maps_by_code() {
        let message = decode_text(
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32602,"message":"bad"}}"#,
        )
        .unwrap();
        let Message::Response(response) = message else {
            panic!("expected a response");
        };
        let err = response.payload.unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::InvalidParams);
        assert_eq!(err.message(), "bad");

        let message =
            decode_text(r#"{"id":6,"error":{"code":1234,"message":"odd"}}"#).unwrap();
        let Message::Response(response) = message else {
            panic!("expected a response");
        };
        assert_eq!(response.payload.unwrap_err().kind(), ExceptionKind::InternalError);
    }

    #[test]
    fn test_null_result_is_a_response() {
        let message = decode_text(r#"{"jsonrpc":"2.0","id":11,"result":null}"#).unwrap();
        assert_eq!(message, Response::result(11, Value::Null).into());
    }

    #[test]
    fn test_missing_keys_is_protocol_error() {
        let err = decode_text(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownShape)));

        let err = decode_text(r#"{"method":"x"}"#).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidField { field: "id", .. })
        ));

        let err = decode_text(r#"{"id":-1,"result":0}"#).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidField { field: "id", .. })
        ));
    }

    #[test]
    fn test_unknown_tag_passes_through() {
        let tagged = Value::Tag(1, Box::new(Value::Integer(1_700_000_000.into())));
        let message: Message = Response::result(2, tagged).into();

        let encoded = encode_binary(&message).unwrap();
        assert_eq!(decode_binary(&encoded).unwrap(), message);
    }

    #[test]
    fn test_unknown_exception_type_fails_decode() {
        let bogus = Value::Tag(
            EXCEPTION_TAG,
            Box::new(Value::Array(vec![
                Value::Text("subprocess.Popen".to_string()),
                Value::Map(vec![]),
            ])),
        );

        for message in [
            Message::from(Response::result(4, bogus.clone())),
            Message::from(Request::new(4, "m", [Value::Array(vec![bogus.clone()])])),
        ] {
            let encoded = encode_binary(&message).unwrap();
            assert!(matches!(
                decode_binary(&encoded),
                Err(Error::Codec(CodecError::UnknownExceptionType(_)))
            ));
        }

        let mut buf = Vec::new();
        let raw = Value::Map(vec![
            (Value::Text("id".to_string()), Value::Integer(4.into())),
            (Value::Text("error".to_string()), bogus),
        ]);
        ciborium::ser::into_writer(&raw, &mut buf).unwrap();
        assert!(matches!(
            decode_binary(&buf),
            Err(Error::Codec(CodecError::UnknownExceptionType(_)))
        ));
    }

    #[test]
    fn test_garbage_is_codec_error() {
        assert!(matches!(
            decode_binary(&[0xFF, 0xFF, 0xFF]),
            Err(Error::Codec(CodecError::DeserializationFailed(_)))
        ));
        assert!(matches!(
            decode_text("{not json"),
            Err(Error::Codec(CodecError::DeserializationFailed(_)))
        ));
    }
}
