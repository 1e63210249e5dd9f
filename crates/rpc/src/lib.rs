//! Bidirectional RPC sessions over pluggable frame transports.
//!
//! Either peer of a [`Connection`] may invoke methods exposed by the other and
//! await a correlated result, while the same stream carries unsolicited data
//! frames. The crate is split into:
//!
//! - **Protocol**: the [`Message`] model and a dual codec (JSON text frames,
//!   CBOR binary frames with a tagged exception envelope)
//! - **Transport**: the [`Connector`]/[`Channel`] boundary plus an in-process
//!   [`transport::memory`] binding
//! - **Connection**: one physical stream with its outbound and inbound pumps
//! - **Session**: call correlation by id and dispatch into a [`MethodTable`]
//! - **Reconnect**: [`RetryPolicy`] and the client-side [`ReconnectDriver`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use launchpad_rpc::{Connection, ConnectionConfig, MethodTable, Params, Session, Value, transport::memory};
//!
//! async fn example() -> launchpad_rpc::Result<()> {
//!     let mut methods = MethodTable::new();
//!     methods.register("server.greet", |_session, _params| async {
//!         Ok(Value::Text("Howdy".to_string()))
//!     });
//!
//!     let (client_side, server_side) = memory::pair();
//!
//!     let server = Session::new(methods);
//!     let mut server_conn = Connection::new(Arc::clone(&server), ConnectionConfig::default());
//!     server_conn.accept(server_side)?;
//!     tokio::spawn(async move { server_conn.run().await });
//!
//!     let client = Session::new(MethodTable::new());
//!     let mut client_conn = Connection::new(Arc::clone(&client), ConnectionConfig::default());
//!     client_conn.accept(client_side)?;
//!     tokio::spawn(async move { client_conn.run().await });
//!
//!     let greeting = client.remote("server").call("greet", Params::none()).await?;
//!     assert_eq!(greeting, Value::Text("Howdy".to_string()));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, ConnectionHandle, ConnectionState, Outbound};
pub use error::{CodecError, ConnectionError, Error, ProtocolError, Result};
pub use handler::{MethodResult, MethodTable, RpcHandler};
pub use protocol::{
    codec::{self, WireFormat},
    exception::{EXCEPTION_TAG, ExceptionKind, RemoteException},
    message::{Message, Params, Request, RequestId, Response},
    metadata::FileStat,
};
pub use reconnect::{
    AttemptOutcome, Backoff, DriverExit, MIN_HEALTHY_UPTIME, ReconnectDriver, RetryPolicy,
};
pub use registry::SessionRegistry;
pub use session::{RemoteProxy, Session, SessionConfig};
pub use transport::{Channel, Connector, Frame, TransportError, find_connector};

/// Dynamic payload value carried in params and results.
pub use ciborium::Value;
