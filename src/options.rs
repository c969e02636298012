//! Session options, requested context flags and per-session policy.
//!
//! # Examples
//!
//! ```rust
//! use gss_channel::{Config, NameResolution, Options};
//!
//! // A client that delegates its credential and verifies the server by reverse lookup.
//! let config = Config::from_options(Options::CLIENT | Options::DELEGATION)
//!     .name_resolution(NameResolution::ReverseLookup);
//! assert!(config.context_flags().contains(gss_channel::ContextFlags::DELEGATION));
//!
//! // A server that only maps identities later, on demand.
//! let config = Config::server().with_options(Options::DISABLE_ATTRIBUTE_CHECK);
//! assert!(config.options().contains(Options::SERVER));
//! ```

use bitflags::bitflags;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Default maximum length of a displayed identity, in bytes.
pub const DEFAULT_MAX_NAME_LEN: usize = 511;

/// Side of the connection a session acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiator: establishes the context when the connection is opened.
    Client,
    /// Acceptor: establishes the context on the first receive.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

bitflags! {
    /// Recognized session options, combinable with `|`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Options: u32 {
        /// The program acts as a client.
        const CLIENT = 0x1;
        /// The program acts as a server.
        const SERVER = 0x2;
        /// Request credential delegation.
        const DELEGATION = 0x4;
        /// Use record framing compatible with plain SSL peers.
        const SSL_COMPATIBLE = 0x8;
        /// Verify the server against its reverse-resolved address instead of the caller's
        /// hostname.
        const DISABLE_NAME_CHECK = 0x10;
        /// Ask the host transport to keep the connection alive.
        const KEEP_ALIVE = 0x20;
        /// Do not map peer names to local accounts.
        const DISABLE_MAPPING = 0x40;
        /// Do not retrieve peer attributes during the handshake.
        const DISABLE_ATTRIBUTE_CHECK = 0x80;
        /// Only accept peers presenting the same identity as this endpoint.
        const ALLOW_ONLY_SELF = 0x100;
    }
}

impl Options {
    const ROLE_MASK: Options = Options::CLIENT.union(Options::SERVER);
}

bitflags! {
    /// Context flags requested from, and granted by, the security mechanism.
    ///
    /// Bits the mechanism reports beyond the named flags are kept as they are.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ContextFlags: u32 {
        /// Credential delegation.
        const DELEGATION = 0x1;
        /// Mutual authentication.
        const MUTUAL = 0x2;
        /// Message confidentiality.
        const CONFIDENTIALITY = 0x10;
        /// Message integrity.
        const INTEGRITY = 0x20;
        /// SSL-compatible record framing.
        const SSL_COMPATIBLE = 0x1000;

        const _ = !0;
    }
}

impl ContextFlags {
    /// The protection every session requests.
    pub const DEFAULT: ContextFlags = ContextFlags::CONFIDENTIALITY
        .union(ContextFlags::MUTUAL)
        .union(ContextFlags::INTEGRITY);

    /// The message-protection subset (confidentiality, integrity, mutual authentication).
    pub const fn protection(self) -> ContextFlags {
        self.intersection(Self::DEFAULT)
    }
}

/// Explicit certificate (and optional key) used instead of the ambient credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    certificate: PathBuf,
    key: Option<PathBuf>,
}

impl CredentialPaths {
    /// A certificate file; if it is a proxy, the key is read from the same file.
    pub fn new(certificate: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            key: None,
        }
    }

    /// Sets a separate private key file.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Returns the certificate path.
    pub fn certificate(&self) -> &Path {
        &self.certificate
    }

    /// Returns the key path, if one was given.
    pub fn key(&self) -> Option<&Path> {
        self.key.as_deref()
    }
}

/// How a client builds the identity it expects the server to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameResolution {
    /// Use the hostname passed to `open`, without any network lookup.
    #[default]
    Strict,
    /// Reverse-resolve the connected peer address (legacy behavior).
    ReverseLookup,
}

/// Per-session policy.
///
/// Built once and copied into every duplicated session. Options can be adjusted later through
/// the session (see [`Session::set_options`](crate::Session::set_options)), except for the role.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    role: Role,
    options: Options,
    credentials: Option<CredentialPaths>,
    credential_token: Option<Zeroizing<Vec<u8>>>,
    max_name_len: usize,
    name_resolution: NameResolution,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("role", &self.role)
            .field("options", &self.options)
            .field("credentials", &self.credentials)
            .field("credential_token", &self.credential_token.is_some())
            .field("max_name_len", &self.max_name_len)
            .field("name_resolution", &self.name_resolution)
            .finish()
    }
}

impl Config {
    /// Builds a policy from an option set. `SERVER` selects the acceptor role, anything else the
    /// initiator role.
    pub fn from_options(options: Options) -> Self {
        let role = if options.contains(Options::SERVER) {
            Role::Server
        } else {
            Role::Client
        };
        let mut options = options;
        options.remove(Options::ROLE_MASK);
        options.insert(match role {
            Role::Client => Options::CLIENT,
            Role::Server => Options::SERVER,
        });

        Self {
            role,
            options,
            credentials: None,
            credential_token: None,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            name_resolution: NameResolution::default(),
        }
    }

    /// Initiator policy with default options.
    pub fn client() -> Self {
        Self::from_options(Options::CLIENT)
    }

    /// Acceptor policy with default options.
    pub fn server() -> Self {
        Self::from_options(Options::SERVER)
    }

    /// Adds non-role options.
    #[must_use]
    pub fn with_options(mut self, options: Options) -> Self {
        let mut options = options;
        options.remove(Options::ROLE_MASK);
        self.options.insert(options);
        self
    }

    /// Uses an explicit certificate/key pair instead of the ambient credential.
    #[must_use]
    pub fn credentials(mut self, paths: CredentialPaths) -> Self {
        self.credentials = Some(paths);
        self
    }

    /// Initiates with a previously exported credential token (for example one delegated to this
    /// process by an upstream client) instead of acquiring a credential.
    #[must_use]
    pub fn credential_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.credential_token = Some(Zeroizing::new(token.into()));
        self
    }

    /// Sets the maximum accepted length of a displayed identity.
    #[must_use]
    pub fn max_name_len(mut self, max: usize) -> Self {
        self.max_name_len = max;
        self
    }

    /// Sets how the client derives the expected server identity.
    #[must_use]
    pub fn name_resolution(mut self, mode: NameResolution) -> Self {
        self.name_resolution = mode;
        self
    }

    /// Returns the role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the option set, including the role option.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Returns the explicit credential paths, if any.
    pub fn credential_paths(&self) -> Option<&CredentialPaths> {
        self.credentials.as_ref()
    }

    pub(crate) fn credential_token_bytes(&self) -> Option<&[u8]> {
        self.credential_token.as_deref().map(Vec::as_slice)
    }

    /// Returns the maximum accepted length of a displayed identity.
    pub fn max_name_length(&self) -> usize {
        self.max_name_len
    }

    /// Returns the configured target-name resolution mode.
    pub fn resolution(&self) -> NameResolution {
        self.name_resolution
    }

    /// Flags requested from the mechanism.
    pub fn context_flags(&self) -> ContextFlags {
        let mut flags = ContextFlags::DEFAULT;
        if self.options.contains(Options::DELEGATION) {
            flags |= ContextFlags::DELEGATION;
        }
        if self.options.contains(Options::SSL_COMPATIBLE) {
            flags |= ContextFlags::SSL_COMPATIBLE;
        }
        flags
    }

    /// Whether the client derives the target name from a reverse lookup.
    pub fn reverse_lookup(&self) -> bool {
        self.options.contains(Options::DISABLE_NAME_CHECK)
            || self.name_resolution == NameResolution::ReverseLookup
    }

    /// Whether peer names are mapped to local accounts.
    pub fn mapping_enabled(&self) -> bool {
        !self.options.contains(Options::DISABLE_MAPPING)
    }

    /// Whether peer attributes are retrieved during the handshake.
    pub fn attribute_check_enabled(&self) -> bool {
        !self.options.contains(Options::DISABLE_ATTRIBUTE_CHECK)
    }

    /// Whether both ends must present the same identity.
    pub fn allow_only_self(&self) -> bool {
        self.options.contains(Options::ALLOW_ONLY_SELF)
    }

    /// Whether the host transport should keep the connection alive.
    pub fn keep_alive(&self) -> bool {
        self.options.contains(Options::KEEP_ALIVE)
    }

    pub(crate) fn set_options(&mut self, options: Options) -> Result<(), String> {
        if options.intersects(Options::ROLE_MASK) {
            return Err("the role of a session cannot be changed".to_owned());
        }
        self.options.insert(options);
        Ok(())
    }

    pub(crate) fn clear_options(&mut self, options: Options) -> Result<(), String> {
        if options.intersects(Options::ROLE_MASK) {
            return Err("the role of a session cannot be changed".to_owned());
        }
        self.options.remove(options);
        Ok(())
    }

    pub(crate) fn set_credentials(&mut self, paths: Option<CredentialPaths>) {
        self.credentials = paths;
    }
}
