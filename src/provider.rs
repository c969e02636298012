//! The security-mechanism capability this crate drives.
//!
//! A [`SecurityProvider`] performs every cryptographic step (credential acquisition, context
//! establishment, message protection) on opaque handles. This crate owns the protocol around it:
//! framing, round sequencing, policy and resource lifetimes.
//!
//! Handles acquired through a provider are held by crate-internal guards which release them
//! exactly once when dropped, on every exit path.

use crate::options::{ContextFlags, CredentialPaths};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A diagnostic reported by the security mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", DetailSuffix(.detail))]
pub struct ProviderError {
    message: String,
    detail: Option<String>,
}

impl ProviderError {
    /// Creates a diagnostic from the mechanism's message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Attaches a secondary diagnostic, such as a minor status description.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Returns the primary message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the secondary diagnostic, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

struct DetailSuffix<'a>(&'a Option<String>);

impl fmt::Display for DetailSuffix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(detail) => write!(f, " ({detail})"),
            None => Ok(()),
        }
    }
}

/// What a credential will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialUsage {
    /// Establishing contexts as the initiator.
    Initiate,
    /// Accepting contexts as the acceptor.
    Accept,
}

/// Result of one `init_context` round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitStep {
    /// Token to send to the acceptor; may be empty.
    pub output: Vec<u8>,
    /// Whether another token from the acceptor is expected.
    pub continue_needed: bool,
    /// Flags granted so far.
    pub flags: ContextFlags,
}

/// Result of one `accept_context` round.
pub struct AcceptStep<C, N> {
    /// Token to send back to the initiator; may be empty.
    pub output: Vec<u8>,
    /// Whether another token from the initiator is expected.
    pub continue_needed: bool,
    /// Flags granted so far.
    pub flags: ContextFlags,
    /// Initiator identity, available once the context is complete.
    pub peer: Option<N>,
    /// Credential the initiator delegated, if any.
    pub delegated: Option<C>,
}

impl<C, N> fmt::Debug for AcceptStep<C, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptStep")
            .field("output_len", &self.output.len())
            .field("continue_needed", &self.continue_needed)
            .field("flags", &self.flags)
            .field("peer", &self.peer.is_some())
            .field("delegated", &self.delegated.is_some())
            .finish()
    }
}

/// A GSS-style security mechanism.
///
/// Implementations must be usable from several connections at once; each connection only ever
/// touches its own credential and context handles, from one thread at a time.
pub trait SecurityProvider: Send + Sync + 'static {
    /// Opaque credential handle.
    type Credential: Send;
    /// Opaque security context handle.
    type Context: Send;
    /// Opaque internal name.
    type Name: Clone + Send;

    /// Process-wide initialization of the mechanism's runtime.
    ///
    /// Called at most once per provider type, before any other method. See
    /// [`runtime::activate`](crate::runtime::activate).
    fn activate(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Acquires a credential, from `paths` if given, else from the ambient default location.
    fn acquire_credential(
        &self,
        usage: CredentialUsage,
        paths: Option<&CredentialPaths>,
    ) -> Result<Self::Credential, ProviderError>;

    /// Rebuilds a credential from a token produced by [`export_credential`](Self::export_credential).
    fn import_credential(&self, token: &[u8]) -> Result<Self::Credential, ProviderError>;

    /// Serializes a credential.
    fn export_credential(&self, credential: &Self::Credential) -> Result<Vec<u8>, ProviderError>;

    /// Returns the identity a credential asserts.
    fn credential_name(&self, credential: &Self::Credential) -> Result<Self::Name, ProviderError>;

    /// Imports a host-based service name such as `host@node1.example.org`.
    fn host_based_name(&self, service: &str) -> Result<Self::Name, ProviderError>;

    /// Runs one initiator round. `context` is `None` on the first round and is populated by the
    /// mechanism.
    fn init_context(
        &self,
        credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        target: &Self::Name,
        flags: ContextFlags,
        input: Option<&[u8]>,
    ) -> Result<InitStep, ProviderError>;

    /// Runs one acceptor round. `context` is `None` on the first round and is populated by the
    /// mechanism.
    fn accept_context(
        &self,
        credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        input: &[u8],
    ) -> Result<AcceptStep<Self::Credential, Self::Name>, ProviderError>;

    /// Returns the acceptor identity of an initiated context.
    fn target_name(&self, context: &Self::Context) -> Result<Self::Name, ProviderError>;

    /// Protects an outgoing message. The output is one complete record.
    fn wrap(
        &self,
        context: &mut Self::Context,
        confidential: bool,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProviderError>;

    /// Verifies and decrypts one complete record, header included.
    fn unwrap(&self, context: &mut Self::Context, record: &[u8]) -> Result<Vec<u8>, ProviderError>;

    /// Renders a name for display.
    fn display_name(&self, name: &Self::Name) -> Result<String, ProviderError>;

    /// Returns `true` if both names denote the same principal.
    fn compare_names(&self, a: &Self::Name, b: &Self::Name) -> Result<bool, ProviderError>;

    /// Returns the credential the peer authenticated with, if the mechanism exposes it.
    fn peer_credential(
        &self,
        context: &Self::Context,
    ) -> Result<Option<Self::Credential>, ProviderError>;

    /// Returns the DER certificates of a credential, concatenated, end entity first.
    fn certificate_chain(&self, credential: &Self::Credential) -> Result<Vec<u8>, ProviderError>;

    /// Tears down a context and returns the deletion token for the peer, possibly empty.
    fn delete_context(&self, context: Self::Context) -> Result<Vec<u8>, ProviderError>;

    /// Frees a context without producing a token.
    fn release_context(&self, context: Self::Context) {
        drop(context);
    }

    /// Frees a credential.
    fn release_credential(&self, credential: Self::Credential) {
        drop(credential);
    }
}

/// Owns a credential handle and releases it when dropped.
pub(crate) struct CredentialHandle<P: SecurityProvider> {
    provider: Arc<P>,
    inner: Option<P::Credential>,
}

impl<P: SecurityProvider> CredentialHandle<P> {
    pub(crate) fn new(provider: Arc<P>, credential: P::Credential) -> Self {
        Self {
            provider,
            inner: Some(credential),
        }
    }

    pub(crate) fn get(&self) -> Option<&P::Credential> {
        self.inner.as_ref()
    }

    /// Releases the credential. Safe to call any number of times.
    pub(crate) fn release(&mut self) {
        if let Some(credential) = self.inner.take() {
            self.provider.release_credential(credential);
        }
    }
}

impl<P: SecurityProvider> Drop for CredentialHandle<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: SecurityProvider> fmt::Debug for CredentialHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("held", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}

/// Owns a (possibly partially established) context handle and releases it when dropped.
pub(crate) struct ContextHandle<P: SecurityProvider> {
    provider: Arc<P>,
    inner: Option<P::Context>,
}

impl<P: SecurityProvider> ContextHandle<P> {
    pub(crate) fn empty(provider: Arc<P>) -> Self {
        Self {
            provider,
            inner: None,
        }
    }

    pub(crate) fn slot(&mut self) -> &mut Option<P::Context> {
        &mut self.inner
    }

    pub(crate) fn get(&self) -> Option<&P::Context> {
        self.inner.as_ref()
    }

    pub(crate) fn get_mut(&mut self) -> Option<&mut P::Context> {
        self.inner.as_mut()
    }

    /// Deletes the context, returning the mechanism's deletion token.
    pub(crate) fn delete(&mut self) -> Option<Result<Vec<u8>, ProviderError>> {
        self.inner
            .take()
            .map(|context| self.provider.delete_context(context))
    }

    /// Releases the context. Safe to call any number of times.
    pub(crate) fn release(&mut self) {
        if let Some(context) = self.inner.take() {
            self.provider.release_context(context);
        }
    }
}

impl<P: SecurityProvider> Drop for ContextHandle<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: SecurityProvider> fmt::Debug for ContextHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("held", &self.inner.is_some())
            .finish_non_exhaustive()
    }
}
