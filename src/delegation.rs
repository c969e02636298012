//! Credentials delegated by the peer.

use crate::error::{ResourceError, Result};
use crate::observability::log_debug;
use crate::provider::{CredentialHandle, SecurityProvider};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

/// A delegated credential held for the lifetime of one connection.
///
/// The exported token is computed on first request and cached; it is wiped from memory when the
/// credential is dropped.
pub(crate) struct DelegatedCredential<P: SecurityProvider> {
    handle: CredentialHandle<P>,
    token: Option<Zeroizing<Vec<u8>>>,
}

impl<P: SecurityProvider> DelegatedCredential<P> {
    pub(crate) fn new(handle: CredentialHandle<P>) -> Self {
        Self {
            handle,
            token: None,
        }
    }

    /// Returns the exported credential, exporting it on first use.
    pub(crate) fn token(&mut self, provider: &P) -> Result<&[u8]> {
        if self.token.is_none() {
            let credential = self
                .handle
                .get()
                .ok_or(ResourceError::NoDelegatedCredential)?;
            let exported = provider
                .export_credential(credential)
                .map_err(ResourceError::Export)?;
            log_debug!("Exported delegated credential ({} bytes)", exported.len());
            self.token = Some(Zeroizing::new(exported));
        }
        Ok(self
            .token
            .as_deref()
            .map(Vec::as_slice)
            .unwrap_or_default())
    }
}

impl<P: SecurityProvider> std::fmt::Debug for DelegatedCredential<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedCredential")
            .field("exported", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

/// Writes `token` to `path`, readable by the owner only. An existing file is replaced and its
/// permissions are restricted first.
pub(crate) fn write_credential_file(path: &Path, token: &[u8]) -> Result<()> {
    let file_error = |source| ResourceError::CredentialFile {
        path: path.display().to_string(),
        source,
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(file_error)?;
    // An existing file keeps its mode on open; restrict it before the secret lands in it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(file_error)?;
    }
    file.set_len(0).map_err(file_error)?;
    file.write_all(token).map_err(file_error)?;
    file.flush().map_err(file_error)?;
    log_debug!("Wrote delegated credential to {}", path.display());
    Ok(())
}
