//! Remote exceptions marshaled across the wire.
//!
//! Only a closed set of exception kinds can be reconstructed on the receiving
//! side. Binary frames carry an exception as CBOR tag 27 (a language-independent
//! object identified by type name) wrapping `[type_name, {attributes}]`.

use std::collections::BTreeMap;
use std::fmt;

use ciborium::Value;

use crate::error::CodecError;

/// CBOR tag wrapping an exception envelope.
pub const EXCEPTION_TAG: u64 = 27;

/// Kinds of exceptions a peer can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// No handler registered under the requested name.
    MethodNotFound,
    /// Arguments were missing or had the wrong shape.
    InvalidParams,
    /// The handler failed.
    InternalError,
    /// The handler panicked.
    HandlerPanicked,
    /// An operating-system level I/O failure.
    IoError,
    /// The handler gave up waiting on something.
    TimeoutError,
}

impl ExceptionKind {
    /// Every known kind.
    pub const ALL: [Self; 6] = [
        Self::MethodNotFound,
        Self::InvalidParams,
        Self::InternalError,
        Self::HandlerPanicked,
        Self::IoError,
        Self::TimeoutError,
    ];

    /// Name used on the wire.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::MethodNotFound => "MethodNotFound",
            Self::InvalidParams => "InvalidParams",
            Self::InternalError => "InternalError",
            Self::HandlerPanicked => "HandlerPanicked",
            Self::IoError => "IoError",
            Self::TimeoutError => "TimeoutError",
        }
    }

    /// Resolve a wire type name.
    #[must_use]
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.type_name() == name)
    }

    /// JSON-RPC error code for text frames.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::HandlerPanicked => -32000,
            Self::IoError => -32001,
            Self::TimeoutError => -32002,
        }
    }

    /// Best match for a bare JSON-RPC error code from a foreign peer.
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .unwrap_or(Self::InternalError)
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// An exception raised by a remote handler, reconstructed from its type name
/// and public attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteException {
    kind: ExceptionKind,
    attributes: BTreeMap<String, Value>,
}

impl RemoteException {
    /// Create an exception carrying a `message` attribute.
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self::from_parts(kind, BTreeMap::new())
            .with_attribute("message", Value::Text(message.into()))
    }

    /// Create an exception from raw attributes.
    #[must_use]
    pub const fn from_parts(kind: ExceptionKind, attributes: BTreeMap<String, Value>) -> Self {
        Self { kind, attributes }
    }

    /// No handler for `method`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(ExceptionKind::MethodNotFound, format!("method `{method}` not found"))
            .with_attribute("method", Value::Text(method.to_string()))
    }

    /// Bad arguments.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::InvalidParams, message)
    }

    /// Generic handler failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::InternalError, message)
    }

    /// Add or replace an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Kind of this exception.
    #[must_use]
    pub const fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// The `message` attribute, or an empty string.
    #[must_use]
    pub fn message(&self) -> &str {
        self.attributes
            .get("message")
            .and_then(Value::as_text)
            .unwrap_or("")
    }

    /// Look up an attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// All attributes.
    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Attributes as a CBOR map value.
    #[must_use]
    pub fn attributes_value(&self) -> Value {
        Value::Map(
            self.attributes
                .iter()
                .map(|(name, value)| (Value::Text(name.clone()), value.clone()))
                .collect(),
        )
    }

    /// Wrap this exception in its tagged envelope.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Tag(
            EXCEPTION_TAG,
            Box::new(Value::Array(vec![
                Value::Text(self.kind.type_name().to_string()),
                self.attributes_value(),
            ])),
        )
    }

    /// Reconstruct an exception from its tagged envelope.
    ///
    /// # Errors
    ///
    /// Fails if the value is not an exception tag, names an unknown type, or
    /// has a malformed payload.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Tag(EXCEPTION_TAG, payload) => Self::from_envelope(payload),
            other => Err(CodecError::MalformedException(format!(
                "expected tag {EXCEPTION_TAG}, got {other:?}"
            ))),
        }
    }

    /// Reconstruct an exception from the payload of an exception tag.
    ///
    /// # Errors
    ///
    /// Fails if the payload names an unknown type or is not `[name, {attributes}]`.
    pub fn from_envelope(payload: &Value) -> Result<Self, CodecError> {
        let Some([name, attributes]) = payload.as_array().map(Vec::as_slice) else {
            return Err(CodecError::MalformedException(
                "envelope must be a two element array".to_string(),
            ));
        };

        let name = name.as_text().ok_or_else(|| {
            CodecError::MalformedException("type name must be text".to_string())
        })?;
        let kind = ExceptionKind::from_type_name(name)
            .ok_or_else(|| CodecError::UnknownExceptionType(name.to_string()))?;

        Ok(Self::from_parts(kind, attributes_from_value(attributes)?))
    }
}

/// Read an attribute map with text keys.
pub(crate) fn attributes_from_value(value: &Value) -> Result<BTreeMap<String, Value>, CodecError> {
    let entries = value.as_map().ok_or_else(|| {
        CodecError::MalformedException("attributes must be a map".to_string())
    })?;

    entries
        .iter()
        .map(|(key, value)| match key {
            Value::Text(key) => Ok((key.clone(), value.clone())),
            other => Err(CodecError::MalformedException(format!(
                "attribute name must be text, got {other:?}"
            ))),
        })
        .collect()
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message())
    }
}

impl std::error::Error for RemoteException {}

impl From<std::io::Error> for RemoteException {
    fn from(err: std::io::Error) -> Self {
        let mut exception = Self::new(ExceptionKind::IoError, err.to_string())
            .with_attribute("kind", Value::Text(err.kind().to_string()));
        if let Some(errno) = err.raw_os_error() {
            exception = exception.with_attribute("errno", Value::Integer(errno.into()));
        }
        exception
    }
}
