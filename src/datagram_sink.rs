#[cfg(test)] use mockall::automock;
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, trace, warn};

/// This is an abstraction for handing a finished datagram to the transport layer, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// Sending must not block: A datagram that cannot be sent right away is dropped, reporting
///  `false`.
#[cfg_attr(test, automock)]
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8], hop_limit: Option<u8>) -> bool;
}

/// The socket must be in non-blocking mode. It is typically a clone of the socket that a tokio
///  [tokio::net::UdpSocket] receives on: sending through it does not depend on the tokio
///  reactor having seen the socket become writable.
impl DatagramSink for UdpSocket {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8], hop_limit: Option<u8>) -> bool {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", datagram.len(), to);

        let mut previous_ttl = None;
        if let Some(hop_limit) = hop_limit {
            match self.ttl().and_then(|ttl| self.set_ttl(hop_limit.into()).map(|_| ttl)) {
                Ok(ttl) => previous_ttl = Some(ttl),
                Err(e) => warn!("error setting hop limit {} for datagram to {:?}: {}", hop_limit, to, e),
            }
        }

        let result = match self.send_to(datagram, to) {
            Ok(_) => true,
            Err(e) => {
                debug!("error sending UDP datagram to {:?}: {}", to, e);
                false
            }
        };

        if let Some(ttl) = previous_ttl {
            if let Err(e) = self.set_ttl(ttl) {
                warn!("error restoring TTL {}: {}", ttl, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::time::timeout;

    #[rstest]
    #[case::default_ttl(None)]
    #[case::hop_limit(Some(5))]
    #[tokio::test]
    async fn test_udp_send(#[case] hop_limit: Option<u8>) {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.set_nonblocking(true).unwrap();
        sender.set_ttl(17).unwrap();
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert!(sender.send_datagram(receiver.local_addr().unwrap(), &[1, 2, 3], hop_limit));
        assert_eq!(sender.ttl().unwrap(), 17);

        let mut buf = [0u8; 16];
        let (num_read, from) = timeout(Duration::from_secs(5), receiver.recv_from(&mut buf)).await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..num_read], &[1, 2, 3]);
        assert_eq!(from, sender.local_addr().unwrap());
    }
}
