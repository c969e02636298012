//! Per-connection security state.
//!
//! A [`Session`] sits between the host RPC runtime and its byte-stream [`Transport`]. Clients
//! establish the security context in [`Session::open`]; servers establish it lazily on the first
//! [`Session::recv`]. Once established, every send is wrapped into one record and every record
//! received is unwrapped before it reaches the caller.
//!
//! # Examples
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use gss_channel::{Config, Session, SecurityProvider, TcpTransport};
//! # fn run<P: SecurityProvider>(provider: Arc<P>) -> gss_channel::Result<()> {
//! let mut session = Session::new(provider, TcpTransport::new(), Config::client())?;
//! session.open("se.example.org:8443", "se.example.org", 8443)?;
//! session.send(b"ping")?;
//!
//! let mut buf = [0u8; 4096];
//! let n = session.recv(&mut buf)?;
//! println!("{} answered with {n} bytes", session.peer_name().unwrap_or_default());
//! session.close()?;
//! # Ok(())
//! # }
//! ```

use crate::attributes::{AttributeRetriever, ChainAttributeRetriever, PeerAttributes};
use crate::delegation::write_credential_file;
use crate::error::{Error, Fault, HandshakeError, PolicyViolation, ResourceError, Result};
use crate::framing::{read_token, write_token};
use crate::handshake::{Endpoint, HandshakeState, SecurityContext};
use crate::identity::{NameResolver, SystemResolver};
use crate::mapping::{GridMapFile, IdentityMapper};
use crate::observability::{log_debug, log_error, log_info};
use crate::options::{Config, ContextFlags, CredentialPaths, Options, Role};
use crate::provider::SecurityProvider;
use crate::runtime::{self, RuntimeLease};
use crate::transport::Transport;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Security state of one connection.
pub struct Session<P: SecurityProvider, T> {
    provider: Arc<P>,
    transport: T,
    config: Config,
    context: SecurityContext<P>,
    mapper: Arc<dyn IdentityMapper>,
    retriever: Arc<dyn AttributeRetriever>,
    resolver: Arc<dyn NameResolver>,
    local_identity: Option<String>,
    pending: Zeroizing<Vec<u8>>,
    pending_pos: usize,
    send_failed: bool,
    last_fault: Option<Fault>,
    _lease: RuntimeLease,
}

impl<P: SecurityProvider, T: Transport> Session<P, T> {
    /// Creates a session over `transport`, activating the mechanism runtime if this is the first
    /// session using it.
    ///
    /// Peer names are mapped with the default grid-mapfile, attributes are read from the peer
    /// chain without extension support and host names are resolved by the system resolver;
    /// each can be replaced with the `with_*` methods.
    pub fn new(provider: Arc<P>, transport: T, config: Config) -> Result<Self> {
        runtime::activate(&*provider)?;
        log_debug!("New {} session with options {:?}", config.role(), config.options());
        Ok(Self {
            context: SecurityContext::new(Arc::clone(&provider)),
            provider,
            transport,
            config,
            mapper: Arc::new(GridMapFile::default()),
            retriever: Arc::new(ChainAttributeRetriever::new()),
            resolver: Arc::new(SystemResolver),
            local_identity: None,
            pending: Zeroizing::new(Vec::new()),
            pending_pos: 0,
            send_failed: false,
            last_fault: None,
            _lease: RuntimeLease::acquire(),
        })
    }

    /// Maps peer names with `mapper`.
    #[must_use]
    pub fn with_mapper(mut self, mapper: Arc<dyn IdentityMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Reads peer attributes with `retriever`.
    #[must_use]
    pub fn with_attribute_retriever(mut self, retriever: Arc<dyn AttributeRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    /// Resolves host names with `resolver`.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Creates a session for another connection with the same policy and collaborators.
    ///
    /// Handles, identities and buffered data are never copied; the new session starts
    /// unestablished and this one is left untouched.
    pub fn duplicate<U: Transport>(&self, transport: U) -> Result<Session<P, U>> {
        Ok(Session::new(Arc::clone(&self.provider), transport, self.config.clone())?
            .with_mapper(Arc::clone(&self.mapper))
            .with_attribute_retriever(Arc::clone(&self.retriever))
            .with_resolver(Arc::clone(&self.resolver)))
    }

    /// Connects to the server and establishes the security context.
    ///
    /// On failure the transport is closed and the session stays unestablished.
    pub fn open(&mut self, endpoint: &str, host: &str, port: u16) -> Result<()> {
        if self.config.role() != Role::Client {
            let err = Error::Configuration("only a client session can open a connection".into());
            return self.report(Err(err));
        }

        self.reset_connection_state();
        log_debug!("Opening {endpoint}");
        let result = self.context.initiate(
            &self.config,
            &mut self.transport,
            Endpoint {
                endpoint,
                host,
                port,
            },
            &*self.resolver,
        );
        if result.is_err() {
            let _ = self.transport.close();
        } else {
            log_info!(
                "Security context established with {}",
                self.context.peer_name().unwrap_or_default()
            );
        }
        self.report(result)
    }

    /// Protects `data` and writes it as one record, returning the number of bytes consumed.
    ///
    /// After a failed write every later send fails with [`Error::SendDisabled`] without touching
    /// the transport.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let result = self.send_record(data);
        self.report(result)
    }

    /// Reads decrypted data into `buf`, returning the number of bytes written.
    ///
    /// A server session establishes its context on the first call. Data left over when a record
    /// is larger than `buf` is returned by the following calls before a new record is read.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.recv_data(buf);
        self.report(result)
    }

    /// Deletes the security context, releases every handle and closes the transport.
    ///
    /// Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.context.is_established() {
            if let Some(token) = self.context.delete() {
                log_debug!("Context deleted, {} byte deletion token not sent", token.len());
            }
        }
        self.reset_connection_state();
        self.transport.close().map_err(Error::Transport)
    }

    /// Drops every per-connection handle, identity and buffered byte.
    pub fn reset_connection_state(&mut self) {
        self.context.release();
        self.context = SecurityContext::new(Arc::clone(&self.provider));
        self.local_identity = None;
        self.pending = Zeroizing::new(Vec::new());
        self.pending_pos = 0;
    }

    /// Reads the peer attributes if the handshake did not already.
    pub fn retrieve_attributes(&mut self) -> Result<&PeerAttributes> {
        if !self.context.is_established() {
            return Err(Error::NotEstablished);
        }
        let retriever = Arc::clone(&self.retriever);
        match self.context.retrieve_attributes(&*retriever) {
            Ok(_) => {}
            Err(e) => return self.report(Err(HandshakeError::Attributes(e).into())),
        }
        self.context.attributes().ok_or(Error::NotEstablished)
    }

    /// Returns the exported delegated credential, exporting it on first use.
    pub fn delegated_credential(&mut self) -> Result<&[u8]> {
        let delegated = self
            .context
            .delegated_mut()
            .ok_or(ResourceError::NoDelegatedCredential)?;
        delegated.token(&*self.provider)
    }

    /// Writes the delegated credential to a new owner-only file at `path`.
    pub fn export_delegated_credential(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let token = self.delegated_credential()?;
        write_credential_file(path, token)
    }

    /// Sets non-role options. Role bits are rejected.
    pub fn set_options(&mut self, options: Options) -> Result<()> {
        self.config.set_options(options).map_err(Error::Configuration)
    }

    /// Clears non-role options. Role bits are rejected.
    pub fn clear_options(&mut self, options: Options) -> Result<()> {
        self.config
            .clear_options(options)
            .map_err(Error::Configuration)
    }

    /// Uses an explicit certificate/key pair for the next handshake, or the ambient credential
    /// when `None`.
    pub fn set_credentials(&mut self, paths: Option<CredentialPaths>) {
        self.config.set_credentials(paths);
    }

    fn send_record(&mut self, data: &[u8]) -> Result<usize> {
        if self.send_failed {
            return Err(Error::SendDisabled);
        }
        let confidential = self
            .context
            .flags()
            .contains(ContextFlags::CONFIDENTIALITY);
        let record = self.context.wrap(confidential, data)?;
        if let Err(e) = write_token(&mut self.transport, &record) {
            self.send_failed = true;
            return Err(e.into());
        }
        Ok(data.len())
    }

    fn recv_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.context.is_established() {
            match self.config.role() {
                Role::Server => self.accept()?,
                Role::Client => return Err(Error::NotEstablished),
            }
        }

        if self.config.role() == Role::Server
            && self.config.mapping_enabled()
            && self.local_identity.is_none()
        {
            self.map_peer()?;
        }

        if self.pending_pos < self.pending.len() {
            return Ok(self.drain_pending(buf));
        }

        let record = read_token(&mut self.transport)?;
        let plaintext = Zeroizing::new(self.context.unwrap(&record)?);
        let n = plaintext.len().min(buf.len());
        buf[..n].copy_from_slice(&plaintext[..n]);
        if n < plaintext.len() {
            log_debug!("Buffering {} bytes of decrypted data", plaintext.len() - n);
            self.pending = plaintext;
            self.pending_pos = n;
        }
        Ok(n)
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        if self.pending_pos == self.pending.len() {
            self.pending = Zeroizing::new(Vec::new());
            self.pending_pos = 0;
        }
        n
    }

    fn accept(&mut self) -> Result<()> {
        self.reset_connection_state();
        let result = self
            .context
            .accept(&self.config, &mut self.transport, &*self.retriever);
        match &result {
            Ok(()) => log_info!(
                "Security context accepted from {}",
                self.context.peer_name().unwrap_or_default()
            ),
            Err(_) => {
                // The peer may already be gone; answer nothing on this socket.
                let _ = self.transport.close();
            }
        }
        result
    }

    fn map_peer(&mut self) -> Result<()> {
        let peer = self.context.peer_name().ok_or(HandshakeError::MissingPeerName)?;
        let user = self
            .mapper
            .map(peer)
            .map_err(|e| Error::Policy(PolicyViolation::Mapping(e)))?;
        log_debug!("Mapped {peer} to {user}");
        self.local_identity = Some(user);
        Ok(())
    }

    fn report<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if e.is_silent() {
                log_debug!("{e}");
            } else {
                log_error!("{e}");
                self.last_fault = Some(Fault::new(self.config.role(), e));
            }
        }
        result
    }
}

impl<P: SecurityProvider, T> Session<P, T> {
    /// Returns `true` once a security context protects this connection.
    pub fn is_established(&self) -> bool {
        self.context.is_established()
    }

    /// Progress of context establishment.
    pub fn state(&self) -> HandshakeState {
        self.context.state()
    }

    /// Side of the connection this session acts for.
    pub fn role(&self) -> Role {
        self.config.role()
    }

    /// The session policy.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The current options.
    pub fn options(&self) -> Options {
        self.config.options()
    }

    /// Whether the host transport should keep this connection alive.
    pub fn keep_alive(&self) -> bool {
        self.config.keep_alive()
    }

    /// Flags granted by the mechanism for the current context.
    pub fn context_flags(&self) -> ContextFlags {
        self.context.flags()
    }

    /// Number of token-exchange rounds of the current handshake.
    pub fn iteration_count(&self) -> u32 {
        self.context.iterations()
    }

    /// Display name of the authenticated peer.
    pub fn peer_name(&self) -> Option<&str> {
        self.context.peer_name()
    }

    /// Display name of this endpoint's credential.
    pub fn self_name(&self) -> Option<&str> {
        self.context.self_name()
    }

    /// Local account the peer is mapped to.
    pub fn local_identity(&self) -> Option<&str> {
        self.local_identity.as_deref()
    }

    /// Returns `true` if the peer delegated a credential on this connection.
    pub fn has_delegated_credential(&self) -> bool {
        self.context.has_delegated()
    }

    /// Peer attributes, once retrieved.
    pub fn attributes(&self) -> Option<&PeerAttributes> {
        self.context.attributes()
    }

    /// Issuer of the peer's end-entity certificate.
    pub fn user_ca(&self) -> Option<&str> {
        self.context.attributes().and_then(PeerAttributes::user_ca)
    }

    /// Virtual organization of the peer.
    pub fn vo(&self) -> Option<&str> {
        self.context.attributes().and_then(PeerAttributes::vo)
    }

    /// Fully qualified attribute names of the peer.
    pub fn fqans(&self) -> &[String] {
        self.context
            .attributes()
            .map_or(&[][..], PeerAttributes::fqans)
    }

    /// The fault produced by the last failed operation.
    pub fn last_fault(&self) -> Option<&Fault> {
        self.last_fault.as_ref()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably. Bytes moved through it bypass the security layer.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<P: SecurityProvider, T> fmt::Debug for Session<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("context", &self.context)
            .field("local_identity", &self.local_identity)
            .field("pending", &(self.pending.len() - self.pending_pos))
            .field("send_failed", &self.send_failed)
            .finish_non_exhaustive()
    }
}
