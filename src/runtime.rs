//! Process-wide mechanism activation.
//!
//! A mechanism's runtime is activated once per provider type, the first time any session needs
//! it, and is never deactivated: sessions on other threads may still call into it at any time.

use crate::error::{ResourceError, Result};
use crate::observability::{log_debug, log_warn};
use crate::provider::SecurityProvider;
use once_cell::sync::Lazy;
use std::any::TypeId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

static ACTIVATED: Lazy<Mutex<HashSet<TypeId>>> = Lazy::new(|| Mutex::new(HashSet::new()));
static LIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

fn activated() -> MutexGuard<'static, HashSet<TypeId>> {
    // A panic while holding the lock cannot leave the set half-updated.
    ACTIVATED.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Activates the runtime of provider type `P` unless that already happened in this process.
///
/// A failed activation is not remembered; the next call tries again.
pub fn activate<P: SecurityProvider>(provider: &P) -> Result<()> {
    let mut activated = activated();
    let id = TypeId::of::<P>();
    if activated.contains(&id) {
        return Ok(());
    }
    provider.activate().map_err(|e| {
        log_warn!("Error activating {}: {e}", std::any::type_name::<P>());
        ResourceError::Activation(e)
    })?;
    activated.insert(id);
    log_debug!("Activated {}", std::any::type_name::<P>());
    Ok(())
}

/// Returns `true` if provider type `P` has been activated in this process.
pub fn is_activated<P: SecurityProvider>() -> bool {
    activated().contains(&TypeId::of::<P>())
}

/// Number of sessions currently alive in this process.
pub fn live_sessions() -> usize {
    LIVE_SESSIONS.load(Ordering::SeqCst)
}

/// Counts one live session for as long as it is held.
#[derive(Debug)]
pub(crate) struct RuntimeLease(());

impl RuntimeLease {
    pub(crate) fn acquire() -> Self {
        LIVE_SESSIONS.fetch_add(1, Ordering::SeqCst);
        RuntimeLease(())
    }
}

impl Drop for RuntimeLease {
    fn drop(&mut self) {
        LIVE_SESSIONS.fetch_sub(1, Ordering::SeqCst);
    }
}
