//! Context establishment.
//!
//! The initiator runs when a client connection is opened; the acceptor runs on the first receive
//! of a server connection. Both exchange framed tokens with the peer until the mechanism reports
//! that no more input is needed, then check the established identities against the session
//! policy. On any failure the context and credential are released and the context is left in the
//! terminal [`HandshakeState::Failed`] state; a new handshake always starts from a fresh context.

use crate::attributes::{AttributeError, AttributeRetriever, PeerAttributes};
use crate::delegation::DelegatedCredential;
use crate::error::{Error, HandshakeError, Result};
use crate::framing::{read_token, write_token};
use crate::identity::{bounded_display_name, ensure_same_identity, target_service, NameResolver};
use crate::observability::{log_debug, log_info, log_warn};
use crate::options::{Config, ContextFlags, Role};
use crate::provider::{ContextHandle, CredentialHandle, CredentialUsage, SecurityProvider};
use crate::transport::Transport;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Progress of context establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No token exchanged yet.
    NotStarted,
    /// Tokens are being exchanged.
    Negotiating,
    /// The context can protect messages.
    Established,
    /// Establishment failed; the context cannot be resumed.
    Failed,
}

/// Where a client connects to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Endpoint<'a> {
    pub(crate) endpoint: &'a str,
    pub(crate) host: &'a str,
    pub(crate) port: u16,
}

/// A security context and the identities established with it.
pub(crate) struct SecurityContext<P: SecurityProvider> {
    provider: Arc<P>,
    state: HandshakeState,
    credential: Option<CredentialHandle<P>>,
    context: ContextHandle<P>,
    flags: ContextFlags,
    iterations: u32,
    self_name: Option<String>,
    peer_name: Option<String>,
    delegated: Option<DelegatedCredential<P>>,
    attributes: Option<PeerAttributes>,
}

impl<P: SecurityProvider> SecurityContext<P> {
    pub(crate) fn new(provider: Arc<P>) -> Self {
        Self {
            context: ContextHandle::empty(Arc::clone(&provider)),
            provider,
            state: HandshakeState::NotStarted,
            credential: None,
            flags: ContextFlags::empty(),
            iterations: 0,
            self_name: None,
            peer_name: None,
            delegated: None,
            attributes: None,
        }
    }

    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    pub(crate) fn is_established(&self) -> bool {
        self.state == HandshakeState::Established && self.context.get().is_some()
    }

    pub(crate) fn flags(&self) -> ContextFlags {
        self.flags
    }

    pub(crate) fn iterations(&self) -> u32 {
        self.iterations
    }

    pub(crate) fn self_name(&self) -> Option<&str> {
        self.self_name.as_deref()
    }

    pub(crate) fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub(crate) fn attributes(&self) -> Option<&PeerAttributes> {
        self.attributes.as_ref()
    }

    pub(crate) fn delegated_mut(&mut self) -> Option<&mut DelegatedCredential<P>> {
        self.delegated.as_mut()
    }

    pub(crate) fn has_delegated(&self) -> bool {
        self.delegated.is_some()
    }

    /// Runs the initiator side: acquire, open, resolve the target, exchange tokens, verify.
    pub(crate) fn initiate<T: Transport + ?Sized>(
        &mut self,
        config: &Config,
        transport: &mut T,
        endpoint: Endpoint<'_>,
        resolver: &dyn NameResolver,
    ) -> Result<()> {
        self.begin()?;
        let result = self.run_initiator(config, transport, endpoint, resolver);
        self.finish(result)
    }

    /// Runs the acceptor side: acquire, exchange tokens, verify, retain delegation, read
    /// attributes.
    pub(crate) fn accept<T: Transport + ?Sized>(
        &mut self,
        config: &Config,
        transport: &mut T,
        retriever: &dyn AttributeRetriever,
    ) -> Result<()> {
        self.begin()?;
        let result = self.run_acceptor(config, transport, retriever);
        self.finish(result)
    }

    /// Protects an outgoing message.
    pub(crate) fn wrap(&mut self, confidential: bool, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (provider, context) = self.established_context()?;
        provider
            .wrap(context, confidential, plaintext)
            .map_err(Error::Wrap)
    }

    /// Verifies and decrypts one record.
    pub(crate) fn unwrap(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        let (provider, context) = self.established_context()?;
        provider.unwrap(context, record).map_err(Error::Unwrap)
    }

    /// Reads the peer attributes once per connection.
    pub(crate) fn retrieve_attributes(
        &mut self,
        retriever: &dyn AttributeRetriever,
    ) -> std::result::Result<&PeerAttributes, AttributeError> {
        if self.attributes.is_none() {
            let context = self.context.get().ok_or(AttributeError::MissingPeerCredential)?;
            let credential = self
                .provider
                .peer_credential(context)
                .map_err(AttributeError::Credential)?
                .ok_or(AttributeError::MissingPeerCredential)?;
            let credential = CredentialHandle::new(Arc::clone(&self.provider), credential);
            let chain = credential
                .get()
                .map(|credential| self.provider.certificate_chain(credential))
                .transpose()
                .map_err(AttributeError::Credential)?
                .unwrap_or_default();

            let attributes = retriever.retrieve(&chain)?;
            log_debug!(
                "Peer attributes: CA {:?}, VO {:?}, {} FQAN(s)",
                attributes.user_ca(),
                attributes.vo(),
                attributes.fqans().len()
            );
            self.attributes = Some(attributes);
        }
        self.attributes
            .as_ref()
            .ok_or(AttributeError::MissingPeerCredential)
    }

    /// Deletes the context, returning the deletion token if one was produced.
    pub(crate) fn delete(&mut self) -> Option<Vec<u8>> {
        match self.context.delete()? {
            Ok(token) => Some(token),
            Err(e) => {
                log_warn!("Error deleting the security context: {e}");
                None
            }
        }
    }

    /// Releases every handle. Safe to call any number of times.
    pub(crate) fn release(&mut self) {
        self.delegated = None;
        self.context.release();
        if let Some(mut credential) = self.credential.take() {
            credential.release();
        }
    }

    fn begin(&mut self) -> Result<()> {
        if self.state != HandshakeState::NotStarted {
            return Err(Error::Configuration(
                "a security context can only be negotiated once".to_owned(),
            ));
        }
        self.state = HandshakeState::Negotiating;
        Ok(())
    }

    fn finish(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.state = HandshakeState::Established;
                Ok(())
            }
            Err(e) => {
                self.release();
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    fn established_context(&mut self) -> Result<(&P, &mut P::Context)> {
        if self.state != HandshakeState::Established {
            return Err(Error::NotEstablished);
        }
        let context = self.context.get_mut().ok_or(Error::NotEstablished)?;
        Ok((&*self.provider, context))
    }

    fn acquire(&mut self, config: &Config, role: Role) -> Result<()> {
        let credential = match (role, config.credential_token_bytes()) {
            (Role::Client, Some(token)) => self.provider.import_credential(token),
            (Role::Client, None) => self
                .provider
                .acquire_credential(CredentialUsage::Initiate, config.credential_paths()),
            (Role::Server, _) => self
                .provider
                .acquire_credential(CredentialUsage::Accept, config.credential_paths()),
        }
        .map_err(|source| HandshakeError::Credential { role, source })?;
        let credential = CredentialHandle::new(Arc::clone(&self.provider), credential);

        let name = credential
            .get()
            .map(|credential| self.provider.credential_name(credential))
            .transpose()
            .map_err(HandshakeError::Name)?;
        if let Some(name) = name {
            let display = bounded_display_name(&*self.provider, &name, config.max_name_length())?;
            log_debug!("The {role} is: {display}");
            self.self_name = Some(display);
        }
        self.credential = Some(credential);
        Ok(())
    }

    fn own_name(&self) -> Result<P::Name> {
        let credential = self
            .credential
            .as_ref()
            .and_then(CredentialHandle::get)
            .ok_or(HandshakeError::MissingCredential)?;
        Ok(self
            .provider
            .credential_name(credential)
            .map_err(HandshakeError::Name)?)
    }

    fn run_initiator<T: Transport + ?Sized>(
        &mut self,
        config: &Config,
        transport: &mut T,
        endpoint: Endpoint<'_>,
        resolver: &dyn NameResolver,
    ) -> Result<()> {
        self.acquire(config, Role::Client)?;

        transport
            .open(endpoint.endpoint, endpoint.host, endpoint.port)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::Unsupported {
                    Error::Configuration(format!("cannot open a connection: {source}"))
                } else {
                    HandshakeError::Open {
                        host: endpoint.host.to_owned(),
                        source,
                    }
                    .into()
                }
            })?;

        let target = if config.allow_only_self() {
            self.own_name()?
        } else {
            let service = target_service(config, endpoint.host, &*transport, resolver)?;
            self.provider
                .host_based_name(&service)
                .map_err(|e| HandshakeError::TargetName(format!("{service}: {e}")))?
        };

        let requested = config.context_flags();
        let credential = self
            .credential
            .as_ref()
            .and_then(CredentialHandle::get)
            .ok_or(HandshakeError::MissingCredential)?;

        let mut input: Option<Vec<u8>> = None;
        loop {
            self.iterations += 1;
            log_debug!("Client iteration {}", self.iterations);

            let step = self
                .provider
                .init_context(
                    credential,
                    self.context.slot(),
                    &target,
                    requested,
                    input.as_deref(),
                )
                .map_err(HandshakeError::InitContext)?;
            self.flags = step.flags;

            if !step.output.is_empty() {
                write_token(transport, &step.output)?;
            }
            if !step.continue_needed {
                break;
            }
            input = Some(read_token(transport)?);
        }

        let missing = requested.protection() - self.flags.protection();
        if !missing.is_empty() {
            return Err(HandshakeError::FlagsNotNegotiated { missing }.into());
        }

        let context = self.context.get().ok_or(HandshakeError::MissingContext)?;
        let server = self
            .provider
            .target_name(context)
            .map_err(HandshakeError::Name)?;
        let server_display =
            bounded_display_name(&*self.provider, &server, config.max_name_length())?;
        log_info!("The server is: {server_display}");

        if config.allow_only_self() {
            let local = self.own_name()?;
            let local_display = self.self_name.clone().unwrap_or_default();
            ensure_same_identity(
                &*self.provider,
                (&server, &server_display),
                (&local, &local_display),
            )?;
        }
        self.peer_name = Some(server_display);
        Ok(())
    }

    fn run_acceptor<T: Transport + ?Sized>(
        &mut self,
        config: &Config,
        transport: &mut T,
        retriever: &dyn AttributeRetriever,
    ) -> Result<()> {
        self.acquire(config, Role::Server)?;
        let credential = self
            .credential
            .as_ref()
            .and_then(CredentialHandle::get)
            .ok_or(HandshakeError::MissingCredential)?;

        let mut peer = None;
        let mut delegated = None;
        loop {
            self.iterations += 1;
            log_debug!("Server iteration {}", self.iterations);

            let token = match read_token(transport) {
                Ok(token) => token,
                Err(e) if self.iterations == 1 && e.nothing_received() => {
                    log_debug!("Peer closed the connection without sending a token");
                    return Err(Error::PeerDisconnected);
                }
                Err(e) => return Err(e.into()),
            };

            let step = self
                .provider
                .accept_context(credential, self.context.slot(), &token)
                .map_err(HandshakeError::AcceptContext)?;
            self.flags = step.flags;
            if step.peer.is_some() {
                peer = step.peer;
            }
            if let Some(credential) = step.delegated {
                delegated = Some(CredentialHandle::new(Arc::clone(&self.provider), credential));
            }

            if !step.output.is_empty() {
                write_token(transport, &step.output)?;
            }
            if !step.continue_needed {
                break;
            }
        }

        let peer = peer.ok_or(HandshakeError::MissingPeerName)?;
        let peer_display = bounded_display_name(&*self.provider, &peer, config.max_name_length())?;
        log_info!("The client is: {peer_display}");

        if config.allow_only_self() {
            let local = self.own_name()?;
            let local_display = self.self_name.clone().unwrap_or_default();
            ensure_same_identity(
                &*self.provider,
                (&peer, &peer_display),
                (&local, &local_display),
            )?;
        }
        self.peer_name = Some(peer_display);

        match delegated {
            Some(handle) if self.flags.contains(ContextFlags::DELEGATION) => {
                if let Some(credential) = handle.get() {
                    let name = self
                        .provider
                        .credential_name(credential)
                        .and_then(|name| self.provider.display_name(&name))
                        .map_err(HandshakeError::DelegatedCredential)?;
                    log_debug!("Delegated credential name: {name}");
                }
                self.delegated = Some(DelegatedCredential::new(handle));
            }
            Some(mut handle) => handle.release(),
            None => log_debug!("No delegated credential"),
        }

        if config.attribute_check_enabled() {
            self.retrieve_attributes(retriever)
                .map_err(HandshakeError::Attributes)?;
        }
        Ok(())
    }
}

impl<P: SecurityProvider> fmt::Debug for SecurityContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("iterations", &self.iterations)
            .field("self_name", &self.self_name)
            .field("peer_name", &self.peer_name)
            .field("delegated", &self.delegated.is_some())
            .finish_non_exhaustive()
    }
}
