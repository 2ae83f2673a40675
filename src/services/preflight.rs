//! 启动前检查
//!
//! Probe a host port by binding it once. The listener is dropped straight
//! away; failures are mapped by I/O error kind only.

use std::net::{SocketAddr, TcpListener};
use tracing::{debug, warn};

use crate::domain::binding::{PortBinding, PortMapping};
use crate::error::StartError;

/// Fail when `addr` cannot be bound right now.
pub fn probe_host_port(addr: SocketAddr) -> Result<(), StartError> {
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            debug!(%addr, "Host port is free");
            Ok(())
        }
        Err(e) => {
            warn!(%addr, error = %e, "Host port probe failed");
            Err(StartError::from_bind(addr, e))
        }
    }
}

/// Everything that can be verified before a container is created: the
/// mapping targets the port the process binds, and its host side is free.
pub fn check_publish(mapping: &PortMapping, binding: &PortBinding) -> Result<(), StartError> {
    mapping.check_against(binding)?;
    if let Some(addr) = mapping.host_socket() {
        probe_host_port(addr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::binding::MappingError;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_port_in_use() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = held.local_addr().unwrap();
        assert!(matches!(
            probe_host_port(addr),
            Err(StartError::PortInUse { addr: a }) if a == addr
        ));

        drop(held);
        assert!(probe_host_port(addr).is_ok());
    }

    #[test]
    fn test_check_publish_rejects_mismatch_and_loopback() {
        let binding = PortBinding::wildcard(5000);
        let err = check_publish(&PortMapping::new(0, 8000), &binding).unwrap_err();
        assert!(matches!(
            err,
            StartError::Mapping(MappingError::PortMismatch { declared: 8000, bound: 5000, .. })
        ));

        let loopback = PortBinding::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
        let err = check_publish(&PortMapping::same(5000), &loopback).unwrap_err();
        assert!(matches!(err, StartError::Mapping(MappingError::LoopbackBind(_))));
    }

    #[test]
    fn test_check_publish_probes_host_side() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let mut mapping = PortMapping::new(port, 5000);
        mapping.host_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

        let err = check_publish(&mapping, &PortBinding::wildcard(5000)).unwrap_err();
        assert!(matches!(err, StartError::PortInUse { .. }));
    }
}
