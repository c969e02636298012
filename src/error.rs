//! Error types for session, handshake and policy failures.

use crate::attributes::AttributeError;
use crate::framing::FramingError;
use crate::mapping::MappingError;
use crate::options::Role;
use crate::provider::ProviderError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by a [`Session`](crate::Session).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A round of context establishment failed, or the established identities are unusable.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A token could not be read from or written to the underlying transport.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The mechanism failed to protect an outgoing message.
    #[error("error wrapping the data: {0}")]
    Wrap(#[source] ProviderError),

    /// The mechanism failed to verify or decrypt an incoming message.
    #[error("error unwrapping the data: {0}")]
    Unwrap(#[source] ProviderError),

    /// The peer identity does not satisfy the session policy.
    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    /// A credential could not be exported, imported or written out.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The session is not configured for the requested operation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No security context is established; nothing is sent or read unprotected.
    #[error("security context is not established")]
    NotEstablished,

    /// A previous send failed; the amount of data already on the wire is unknown.
    #[error("request to send data after a previous send failed")]
    SendDisabled,

    /// The peer went away before sending anything on a fresh connection.
    #[error("peer closed the connection before the handshake started")]
    PeerDisconnected,

    /// The underlying transport failed to open or close.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl Error {
    /// Returns `true` when the error must not be reported back over the connection.
    ///
    /// The host transport should close the socket without writing a fault.
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::PeerDisconnected)
    }
}

/// Failures during context establishment.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// Credentials could not be acquired or imported.
    #[error("could not load {role} credentials: {source}")]
    Credential {
        /// Side that tried to acquire the credential.
        role: Role,
        /// Mechanism diagnostic.
        source: ProviderError,
    },

    /// A name could not be inquired or displayed.
    #[error("error displaying name: {0}")]
    Name(#[source] ProviderError),

    /// A displayed name exceeds the configured maximum.
    #[error("name too long ({len} bytes, maximum {max})")]
    NameTooLong {
        /// Length of the displayed name.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The connection to the server could not be opened.
    #[error("could not open connection to {host}: {source}")]
    Open {
        /// Host passed to `open`.
        host: String,
        /// Transport error.
        source: io::Error,
    },

    /// The target identity for the server could not be built.
    #[error("could not build target name: {0}")]
    TargetName(String),

    /// `init_context` failed.
    #[error("error initializing context: {0}")]
    InitContext(#[source] ProviderError),

    /// `accept_context` failed.
    #[error("could not accept security context: {0}")]
    AcceptContext(#[source] ProviderError),

    /// The acceptor finished without learning who the initiator is.
    #[error("context established without a peer name")]
    MissingPeerName,

    /// The handshake ran without a credential of its own.
    #[error("no credential held for the handshake")]
    MissingCredential,

    /// The mechanism finished the exchange without producing a context.
    #[error("the mechanism returned no security context")]
    MissingContext,

    /// The mechanism did not grant protection the session requires.
    #[error("required context flags not negotiated: {missing:?}")]
    FlagsNotNegotiated {
        /// Requested flags absent from the negotiated set.
        missing: crate::options::ContextFlags,
    },

    /// The delegated credential returned by the mechanism could not be inspected.
    #[error("error inquiring delegated credentials: {0}")]
    DelegatedCredential(#[source] ProviderError),

    /// Peer attributes could not be retrieved.
    #[error("error retrieving the peer attributes: {0}")]
    Attributes(#[from] AttributeError),
}

/// The peer identity does not satisfy the session policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyViolation {
    /// Self-only policy is in effect and the peer presented another identity.
    #[error("the peer <{peer}> does not have the same identity as this endpoint <{local}>")]
    IdentityMismatch {
        /// Peer display name.
        peer: String,
        /// Local display name.
        local: String,
    },

    /// The identities could not be compared.
    #[error("error comparing peer and local names: {0}")]
    Comparison(#[source] ProviderError),

    /// No local account is mapped to the peer.
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// Credential material could not be handled.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// The peer did not delegate a credential on this connection.
    #[error("no delegated credentials available")]
    NoDelegatedCredential,

    /// The mechanism failed to serialize a credential.
    #[error("error exporting credentials: {0}")]
    Export(#[source] ProviderError),

    /// The delegated credential file could not be written.
    #[error("could not write delegated credentials to {path}: {source}")]
    CredentialFile {
        /// Destination path.
        path: String,
        /// I/O error.
        source: io::Error,
    },

    /// Process-wide mechanism activation failed.
    #[error("could not activate the security mechanism: {0}")]
    Activation(#[source] ProviderError),
}

/// Which party a [`Fault`] is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The client side raised the fault.
    Sender,
    /// The server side raised the fault.
    Receiver,
}

/// A user-visible fault, suitable for the host RPC layer's error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    kind: FaultKind,
    message: String,
}

impl Fault {
    /// Identifies this layer in fault messages.
    pub const ORIGIN: &'static str = "gss-channel";

    /// Builds the fault reported by `role` for `error`.
    pub fn new(role: Role, error: &Error) -> Self {
        let host = dns_lookup::get_hostname().unwrap_or_else(|_| "unknown".to_owned());
        Self::with_host(role, error, &host)
    }

    pub(crate) fn with_host(role: Role, error: &Error, host: &str) -> Self {
        let kind = match role {
            Role::Client => FaultKind::Sender,
            Role::Server => FaultKind::Receiver,
        };
        Self {
            kind,
            message: format!("{} running on {host} reports {error}", Self::ORIGIN),
        }
    }

    /// Returns the side the fault is attributed to.
    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Returns the human-readable diagnostic.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
