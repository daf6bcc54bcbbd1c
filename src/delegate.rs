#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

/// The engine's view of its surroundings: time, protocol limits, and a way to ask a peer for
///  feedback on its receive rate
#[cfg_attr(test, automock)]
pub trait EngineDelegate: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// The local send rate to a destination looks suspiciously high - ask the peer to report
    ///  its receive rate, which is eventually fed back through
    ///  [crate::engine::Engine::set_peer_reported_receive_rate]
    fn request_peer_receive_rate_report(&self, destination: SocketAddr);

    fn max_message_length(&self) -> u32;

    /// maximum payload per datagram, *excluding* the fragment header. Both sides must agree
    ///  on this value
    fn mtu(&self) -> u32;
}

/// A delegate with fixed limits and the system clock, for setups without a channel for
///  feeding back receive rates. Report requests are only logged.
pub struct FixedLimitsDelegate {
    mtu: u32,
    max_message_length: u32,
}
impl FixedLimitsDelegate {
    pub fn new(mtu: u32, max_message_length: u32) -> FixedLimitsDelegate {
        FixedLimitsDelegate {
            mtu,
            max_message_length,
        }
    }
}

impl EngineDelegate for FixedLimitsDelegate {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn request_peer_receive_rate_report(&self, destination: SocketAddr) {
        debug!("send rate to {:?} is high, but there is no way to request a receive rate report", destination);
    }

    fn max_message_length(&self) -> u32 {
        self.max_message_length
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }
}
