#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! GSS-style transport security for RPC byte streams.
//!
//! This crate layers mutual authentication, message confidentiality and integrity, identity
//! mapping and credential delegation over an existing request/response transport, without
//! changing the transport itself. A [`Session`] wraps the transport's raw I/O hooks
//! ([`Transport`]): it runs the context-establishment handshake with the peer, then protects every
//! message with the established context.
//!
//! The cryptography is not implemented here. It is supplied by a [`SecurityProvider`], which
//! acquires credentials, produces and consumes handshake tokens and wraps or unwraps messages;
//! this crate drives it, frames its tokens on the wire and applies the identity policy.
//!
//! # Examples
//!
//! A server accepting one connection:
//!
//! ```no_run
//! use std::net::TcpListener;
//! use std::sync::Arc;
//! use gss_channel::{Config, GridMapFile, Options, SecurityProvider, Session, TcpTransport};
//!
//! # fn serve<P: SecurityProvider>(provider: Arc<P>) -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("0.0.0.0:8443")?;
//! let template = Session::new(provider, TcpTransport::new(), Config::server())?
//!     .with_mapper(Arc::new(GridMapFile::default()));
//!
//! let (stream, _) = listener.accept()?;
//! let mut session = template.duplicate(TcpTransport::from_stream(stream))?;
//!
//! let mut buf = [0u8; 4096];
//! match session.recv(&mut buf) {
//!     Ok(n) => {
//!         println!("{:?} sent {n} bytes", session.local_identity());
//!         session.send(b"pong")?;
//!     }
//!     // The peer left before the handshake: close without answering.
//!     Err(e) if e.is_silent() => {}
//!     Err(e) => eprintln!("{}", gss_channel::Fault::new(session.role(), &e)),
//! }
//! session.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`logging`** (default): diagnostics are emitted as [`log`](https://docs.rs/log) records.
//! - **`tracing`**: diagnostics are emitted as [`tracing`](https://docs.rs/tracing) events.

mod observability;

pub mod attributes;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod identity;
pub mod mapping;
pub mod options;
pub mod provider;
pub mod runtime;
pub mod session;
pub mod transport;

mod delegation;

pub use crate::attributes::{
    AttributeError, AttributeExtension, AttributeRetriever, ChainAttributeRetriever, NoExtension,
    PeerAttributes, VoAttributes,
};
pub use crate::error::{
    Error, Fault, FaultKind, HandshakeError, PolicyViolation, ResourceError, Result,
};
pub use crate::framing::FramingError;
pub use crate::handshake::HandshakeState;
pub use crate::identity::{NameResolver, SystemResolver};
pub use crate::mapping::{GridMap, GridMapFile, IdentityMapper, MappingError, NoMapping};
pub use crate::options::{Config, ContextFlags, CredentialPaths, NameResolution, Options, Role};
pub use crate::provider::{AcceptStep, CredentialUsage, InitStep, ProviderError, SecurityProvider};
pub use crate::session::Session;
pub use crate::transport::{TcpTransport, Transport};
