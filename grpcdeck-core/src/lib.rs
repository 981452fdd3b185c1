//! # grpcdeck-core
//!
//! The reflection-to-invocation pipeline behind grpcdeck: point it at a
//! gRPC server address and it discovers the server's services over server
//! reflection, renders their methods, and invokes any RPC (unary or any
//! streaming shape) with JSON on the wire, without compile-time knowledge
//! of the server's message types.
//!
//! The pipeline has three layers:
//!
//! - **Descriptor resolution** ([`repair`], [`registry`], [`reflection`]):
//!   drives the reflection protocol, repairs the malformed file descriptors
//!   real-world servers ship, and assembles them into a registry of message
//!   and service descriptors. Canonical well-known types live in a
//!   process-wide registry that server-supplied duplicates can never
//!   shadow.
//! - **Dynamic invocation** ([`invoke`], [`metadata`]): builds untyped
//!   messages from a method descriptor plus a JSON body and drives the RPC
//!   in whichever of the four shapes the method declares.
//! - **Connection lifecycle** ([`connection`]): owns the transport
//!   (plaintext, TLS, or mutual TLS), exposes a reactive state signal, and
//!   hands live transport handles to the other two layers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grpcdeck_core::{ConnectConfig, ConnectionManager};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConnectionManager::new();
//! manager
//!     .connect(ConnectConfig {
//!         address: "localhost:50051".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! let mut reflection = manager.reflection_client()?;
//! for service in reflection.list_services().await? {
//!     println!("{}", service.full_name);
//! }
//!
//! let method = reflection
//!     .method_descriptor("grpctest.TestService", "UnaryEcho")
//!     .await?;
//! let reply = manager
//!     .invoker()?
//!     .unary(&method, r#"{"item":{"id":"x"}}"#, &[], &CancellationToken::new())
//!     .await?;
//! println!("{}", reply.body);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod invoke;
pub mod metadata;
pub mod reflection;
pub mod registry;
pub mod repair;

pub use connection::{
    ConnectConfig, ConnectionManager, ConnectionState, StateCallback, StateChange, TlsOptions,
};
pub use error::{Error, ErrorKind, Result};
pub use invoke::{BidiStreamCall, CallReply, ClientStreamCall, Invoker, ServerStreamCall};
pub use reflection::{MethodInfo, MethodType, ReflectionClient, ServiceInfo};
