//! Identity policy: target-name resolution and name checks.

use crate::error::{HandshakeError, PolicyViolation};
use crate::observability::log_debug;
use crate::options::Config;
use crate::provider::SecurityProvider;
use crate::transport::Transport;
use std::io;
use std::net::IpAddr;

/// Host name lookups used to build the expected server identity.
pub trait NameResolver: Send + Sync {
    /// Name of the local machine.
    fn local_hostname(&self) -> io::Result<String>;

    /// Forward lookup.
    fn lookup_host(&self, host: &str) -> io::Result<Vec<IpAddr>>;

    /// Reverse lookup.
    fn reverse_lookup(&self, addr: IpAddr) -> io::Result<String>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn local_hostname(&self) -> io::Result<String> {
        dns_lookup::get_hostname()
    }

    fn lookup_host(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        dns_lookup::lookup_host(host)
    }

    fn reverse_lookup(&self, addr: IpAddr) -> io::Result<String> {
        dns_lookup::lookup_addr(&addr)
    }
}

/// Returns `true` for 127.0.0.0/8, `::1` and IPv4-mapped 127.0.0.0/8.
pub fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}

/// First non-loopback address of the local host name, IPv4 preferred.
fn local_address(resolver: &dyn NameResolver) -> Result<IpAddr, HandshakeError> {
    let hostname = resolver
        .local_hostname()
        .map_err(|e| HandshakeError::TargetName(format!("could not get the local host name: {e}")))?;
    let addrs = resolver.lookup_host(&hostname).map_err(|e| {
        HandshakeError::TargetName(format!("could not resolve local host {hostname}: {e}"))
    })?;

    let usable = || addrs.iter().copied().filter(|addr| !is_loopback(*addr));
    usable()
        .find(IpAddr::is_ipv4)
        .or_else(|| usable().find(IpAddr::is_ipv6))
        .ok_or_else(|| {
            HandshakeError::TargetName(format!(
                "local host {hostname} has no non-loopback address"
            ))
        })
}

/// Builds the host-based service name the client expects the server to present.
///
/// In strict mode this is `host@<host>` for the host name the caller connected to. In reverse
/// lookup mode the connected peer address is resolved back to a name; a loopback peer is
/// replaced by the local machine's own address first.
pub fn target_service<T: Transport + ?Sized>(
    config: &Config,
    host: &str,
    transport: &T,
    resolver: &dyn NameResolver,
) -> Result<String, HandshakeError> {
    if !config.reverse_lookup() {
        return Ok(format!("host@{host}"));
    }

    let peer = transport
        .peer_addr()
        .map_err(|e| HandshakeError::TargetName(format!("could not get the peer address: {e}")))?
        .ip();
    let addr = if is_loopback(peer) {
        local_address(resolver)?
    } else {
        peer
    };
    let name = resolver.reverse_lookup(addr).map_err(|e| {
        HandshakeError::TargetName(format!("could not get the host name of {addr}: {e}"))
    })?;

    let service = format!("host@{}", name.to_lowercase());
    log_debug!("Reverse lookup of {addr} gives target {service}");
    Ok(service)
}

/// Displays `name`, rejecting names longer than `max` bytes.
pub(crate) fn bounded_display_name<P: SecurityProvider>(
    provider: &P,
    name: &P::Name,
    max: usize,
) -> Result<String, HandshakeError> {
    let display = provider.display_name(name).map_err(HandshakeError::Name)?;
    if display.len() > max {
        return Err(HandshakeError::NameTooLong {
            len: display.len(),
            max,
        });
    }
    Ok(display)
}

/// Fails unless `peer` and `local` denote the same principal.
pub(crate) fn ensure_same_identity<P: SecurityProvider>(
    provider: &P,
    peer: (&P::Name, &str),
    local: (&P::Name, &str),
) -> Result<(), PolicyViolation> {
    let equal = provider
        .compare_names(peer.0, local.0)
        .map_err(PolicyViolation::Comparison)?;
    if !equal {
        return Err(PolicyViolation::IdentityMismatch {
            peer: peer.1.to_owned(),
            local: local.1.to_owned(),
        });
    }
    log_debug!("Peer <{}> has the same identity as this endpoint", peer.1);
    Ok(())
}
