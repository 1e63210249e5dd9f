//! Protocol layer for the RPC session.
//!
//! This module contains the wire-independent definitions:
//! - Message types and call parameters
//! - The closed set of marshalable remote exceptions
//! - The text (JSON) and binary (CBOR) codecs
//! - Scalar file metadata records

pub mod codec;
pub mod exception;
pub mod message;
pub mod metadata;

pub use codec::WireFormat;
pub use exception::{EXCEPTION_TAG, ExceptionKind, RemoteException};
pub use message::{Message, Params, Request, RequestId, Response};
pub use metadata::FileStat;
