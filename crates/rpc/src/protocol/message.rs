//! Core message types.

use std::collections::BTreeMap;

use ciborium::Value;
use serde::de::DeserializeOwned;

use crate::protocol::exception::RemoteException;

/// Correlation id pairing a request with its response.
///
/// Only unique among the issuer's currently outstanding calls.
pub type RequestId = u64;

/// A single logical message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A method invocation.
    Request(Request),
    /// The outcome of a previous invocation.
    Response(Response),
}

impl Message {
    /// Correlation id of this message.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        match self {
            Self::Request(request) => request.id,
            Self::Response(response) => response.id,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id chosen by the issuer.
    pub id: RequestId,
    /// Dotted or flat method name, e.g. `fs.enumerate_directory`.
    pub method: String,
    /// Call arguments.
    pub params: Params,
}

impl Request {
    /// Create a new request.
    pub fn new(id: RequestId, method: impl Into<String>, params: impl Into<Params>) -> Self {
        Self {
            id,
            method: method.into(),
            params: params.into(),
        }
    }
}

/// The outcome of a call: a result value or the exception raised by the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Result or error payload.
    pub payload: Result<Value, RemoteException>,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub const fn result(id: RequestId, value: Value) -> Self {
        Self {
            id,
            payload: Ok(value),
        }
    }

    /// A failed response.
    #[must_use]
    pub const fn error(id: RequestId, exception: RemoteException) -> Self {
        Self {
            id,
            payload: Err(exception),
        }
    }
}

/// Call arguments, positional or keyed but never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// Arguments by position.
    Positional(Vec<Value>),
    /// Arguments by name.
    Named(BTreeMap<String, Value>),
}

impl Params {
    /// No arguments.
    #[must_use]
    pub const fn none() -> Self {
        Self::Positional(Vec::new())
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Positional(args) => args.len(),
            Self::Named(args) => args.len(),
        }
    }

    /// Whether there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an argument by position or, for keyed params, by name.
    #[must_use]
    pub fn arg(&self, position: usize, name: &str) -> Option<&Value> {
        match self {
            Self::Positional(args) => args.get(position),
            Self::Named(args) => args.get(name),
        }
    }

    /// Look up and deserialize an argument.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidParams` exception if the argument is absent or has the wrong shape.
    pub fn parse<T: DeserializeOwned>(
        &self,
        position: usize,
        name: &str,
    ) -> Result<T, RemoteException> {
        let value = self.arg(position, name).ok_or_else(|| {
            RemoteException::invalid_params(format!("missing argument `{name}`"))
        })?;

        value.deserialized().map_err(|e| {
            RemoteException::invalid_params(format!("argument `{name}`: {e}"))
        })
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::none()
    }
}

impl From<Vec<Value>> for Params {
    fn from(args: Vec<Value>) -> Self {
        Self::Positional(args)
    }
}

impl<const N: usize> From<[Value; N]> for Params {
    fn from(args: [Value; N]) -> Self {
        Self::Positional(args.into())
    }
}

impl From<BTreeMap<String, Value>> for Params {
    fn from(args: BTreeMap<String, Value>) -> Self {
        Self::Named(args)
    }
}
