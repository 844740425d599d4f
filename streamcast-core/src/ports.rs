//! Ephemeral port discovery for RTSP placeholders and RTP/RTCP pairs.

use std::net::{TcpListener, UdpSocket};

use thiserror::Error;

/// Upper bound on RTP/RTCP pair probing before giving up.
const MAX_PAIR_ATTEMPTS: usize = 200;

/// Errors that can occur while probing for free ports
#[derive(Debug, Error)]
pub enum PortAllocationError {
    #[error("Failed to probe for a free port: {0}")]
    Probe(#[from] std::io::Error),

    #[error("No free RTP/RTCP port pair after {attempts} attempts")]
    Exhausted { attempts: usize },
}

/// Finds a free TCP port by binding an ephemeral socket and releasing it.
///
/// The port is handed back to the OS immediately, so a race window exists
/// between probe and actual use. Callers must treat a later bind failure on
/// the returned port as retryable rather than fatal.
pub fn allocate_tcp_port() -> Result<u16, PortAllocationError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Finds a free even/odd UDP port pair for RTP and RTCP.
///
/// Probes ephemeral UDP ports until one lands on an even number whose odd
/// neighbor also binds, per the RTP convention. The search is bounded:
/// under port pressure it fails with [`PortAllocationError::Exhausted`]
/// instead of spinning.
pub fn allocate_rtp_rtcp_pair() -> Result<(u16, u16), PortAllocationError> {
    for _ in 0..MAX_PAIR_ATTEMPTS {
        let rtp_socket = UdpSocket::bind(("127.0.0.1", 0))?;
        let rtp_port = rtp_socket.local_addr()?.port();

        if rtp_port % 2 != 0 {
            continue;
        }

        let Some(rtcp_port) = rtp_port.checked_add(1) else {
            continue;
        };

        // Both sockets must bind simultaneously for the pair to count.
        if UdpSocket::bind(("127.0.0.1", rtcp_port)).is_ok() {
            return Ok((rtp_port, rtcp_port));
        }
    }

    Err(PortAllocationError::Exhausted {
        attempts: MAX_PAIR_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_port_is_nonzero() {
        let port = allocate_tcp_port().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_rtp_rtcp_pair_is_even_and_adjacent() {
        let (rtp, rtcp) = allocate_rtp_rtcp_pair().unwrap();
        assert_eq!(rtp % 2, 0, "RTP port must be even");
        assert_eq!(rtcp, rtp + 1, "RTCP port must be the odd neighbor");
    }

    #[test]
    fn test_repeated_pair_allocation_holds_invariant() {
        for _ in 0..10 {
            let (rtp, rtcp) = allocate_rtp_rtcp_pair().unwrap();
            assert_eq!(rtp % 2, 0);
            assert_eq!(rtcp, rtp + 1);
        }
    }
}
