use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::config::FragmentationConfig;
use crate::fragment_header::FragmentHeader;
use crate::rate_estimator::RateEstimator;
use crate::safe_converter::PrecheckedCast;
use std::cmp::min;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub struct OutboundMessage {
    pub payload: PooledBuf,
    pub coalescable: bool,
    pub hop_limit: Option<u8>,
    /// 0 means 'no replace semantics'
    pub replace_key: u64,
    /// used for matching `replace_key` only, not for routing
    pub logical_dest_id: Option<u64>,
}
impl OutboundMessage {
    fn replaces(&self, replace_key: u64, logical_dest_id: u64) -> bool {
        self.replace_key == replace_key && self.logical_dest_id == Some(logical_dest_id)
    }
}

/// A finished datagram, ready to be handed to the transport
#[derive(Debug)]
pub struct OutboundDatagram {
    pub destination: SocketAddr,
    pub hop_limit: Option<u8>,
    pub bytes: PooledBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Appended,
    Replaced,
}

#[derive(Default)]
struct PriorityLevel {
    coalescable: VecDeque<OutboundMessage>,
    non_coalescable: VecDeque<OutboundMessage>,
}
impl PriorityLevel {
    fn list_mut(&mut self, coalescable: bool) -> &mut VecDeque<OutboundMessage> {
        if coalescable {
            &mut self.coalescable
        }
        else {
            &mut self.non_coalescable
        }
    }
}

/// Token bucket enforcing the allowed send speed. It refills at the allowed speed up to a burst
///  of one brake window's worth of bytes. A datagram may overdraw it, and the deficit must be
///  paid off before the next datagram.
struct SendBrake {
    tokens: f64,
    last_refill: Instant,
    window: Duration,
}
impl SendBrake {
    fn new(allowed_speed: f64, window: Duration, now: Instant) -> SendBrake {
        SendBrake {
            tokens: allowed_speed * window.as_secs_f64(),
            last_refill: now,
            window,
        }
    }

    fn refill(&mut self, allowed_speed: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let capacity = allowed_speed * self.window.as_secs_f64();
        self.tokens = (self.tokens + allowed_speed * elapsed.as_secs_f64()).min(capacity);
        self.last_refill = self.last_refill.max(now);
    }

    fn consume(&mut self, num_bytes: usize) {
        self.tokens -= num_bytes as f64;
    }

    fn is_overdrawn(&self) -> bool {
        self.tokens < 0.0
    }
}

/// The bundle that is currently being sent, one fragment per scheduler invocation
struct Staging {
    messages: Vec<PooledBuf>,
    total_len: usize,
    message_id: u32,
    hop_limit: Option<u8>,
    /// The MTU is fixed for the lifetime of a bundle - fragment offsets are based on it
    mtu: usize,

    /// number of bundle bytes emitted so far
    emitted: usize,
    cursor_message: usize,
    cursor_offset: usize,
}
impl Staging {
    fn new(messages: Vec<PooledBuf>, total_len: usize, message_id: u32, hop_limit: Option<u8>, mtu: usize) -> Staging {
        Staging {
            messages,
            total_len,
            message_id,
            hop_limit,
            mtu,
            emitted: 0,
            cursor_message: 0,
            cursor_offset: 0,
        }
    }

    fn is_single_datagram(&self) -> bool {
        self.total_len <= self.mtu
    }

    fn is_done(&self) -> bool {
        self.emitted == self.total_len
    }

    fn write_next_fragment(&mut self, filter_tag: u8, datagram: &mut PooledBuf) {
        let header = if self.is_single_datagram() {
            FragmentHeader::non_fragmented(self.total_len.prechecked_cast(), self.message_id)
        }
        else {
            FragmentHeader::fragmented(
                self.total_len.prechecked_cast(),
                self.message_id,
                (self.emitted / self.mtu).prechecked_cast(),
                filter_tag,
            )
        };
        header.ser(&mut **datagram);

        let mut remaining = min(self.mtu, self.total_len - self.emitted);
        while remaining > 0 {
            let message = &self.messages[self.cursor_message];
            let slice_len = min(remaining, message.len() - self.cursor_offset);
            datagram.extend_from_slice(&message[self.cursor_offset..self.cursor_offset + slice_len]);

            self.cursor_offset += slice_len;
            self.emitted += slice_len;
            remaining -= slice_len;

            if self.cursor_offset == message.len() {
                self.cursor_message += 1;
                self.cursor_offset = 0;
            }
        }
    }
}

/// All outbound state for a single destination address
pub struct OutboundQueue {
    destination: SocketAddr,
    levels: Vec<PriorityLevel>,
    num_pending: usize,
    staging: Option<Staging>,
    next_message_id: u32,
    /// filter tag nibble for the peer, taken from the most recent logical destination id
    remote_id: u8,

    send_rate: RateEstimator,
    brake: SendBrake,
    peer_receive_rate: RateEstimator,
    allowed_max_send_speed: f64,

    last_activity: Instant,
    /// in the fragmenter's list of schedulable destinations
    pub(crate) scheduled: bool,
    /// excluded from scheduling because it exceeds its allowed send speed
    pub(crate) braked: bool,
}

impl OutboundQueue {
    /// The local send rate limits the allowed speed to this multiple of itself, leaving room to
    ///  speed up from one long tick to the next
    const LOCAL_RATE_HEADROOM: f64 = 2.0;

    pub fn new(destination: SocketAddr, config: &FragmentationConfig, now: Instant) -> OutboundQueue {
        OutboundQueue {
            destination,
            levels: (0..config.num_priorities).map(|_| PriorityLevel::default()).collect(),
            num_pending: 0,
            staging: None,
            next_message_id: 0,
            remote_id: 0,
            send_rate: RateEstimator::new(config.rate_window),
            brake: SendBrake::new(config.max_send_rate, config.brake_window, now),
            peer_receive_rate: RateEstimator::new(config.rate_window),
            allowed_max_send_speed: config.max_send_rate,
            last_activity: now,
            scheduled: false,
            braked: false,
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn remote_id(&self) -> u8 {
        self.remote_id
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    pub fn has_staged_bundle(&self) -> bool {
        self.staging.is_some()
    }

    /// no pending messages and no bundle in progress
    pub fn is_empty(&self) -> bool {
        self.num_pending == 0 && self.staging.is_none()
    }

    pub fn allowed_max_send_speed(&self) -> f64 {
        self.allowed_max_send_speed
    }

    pub fn recent_send_rate(&self) -> f64 {
        self.send_rate.recent_rate()
    }

    /// The caller is responsible for a valid priority
    pub fn enqueue(&mut self, mut message: OutboundMessage, priority: usize, now: Instant) -> EnqueueOutcome {
        self.last_activity = now;
        if let Some(logical_dest_id) = message.logical_dest_id {
            self.remote_id = (logical_dest_id & 0xF) as u8;
        }

        let list = self.levels[priority].list_mut(message.coalescable);

        if message.replace_key != 0 {
            if let Some(logical_dest_id) = message.logical_dest_id {
                if let Some(existing) = list.iter_mut().find(|m| m.replaces(message.replace_key, logical_dest_id)) {
                    trace!("replacing queued message with key {} for {:?}", message.replace_key, self.destination);
                    // the superseded payload goes back to the pool when `message` is dropped
                    std::mem::swap(&mut existing.payload, &mut message.payload);
                    return EnqueueOutcome::Replaced;
                }
            }
        }

        list.push_back(message);
        self.num_pending += 1;
        EnqueueOutcome::Appended
    }

    /// Produces the next datagram for this destination: a pending non-coalescable message that
    ///  fits the MTU if there is one at any priority level, otherwise the next fragment of the
    ///  current bundle. A new bundle is either a single non-coalescable message that outgrew the
    ///  MTU, or a batch of coalescable messages.
    pub fn pop_datagram(&mut self, pool: &BufferPool, filter_tag: u8, mtu: usize, now: Instant) -> anyhow::Result<Option<OutboundDatagram>> {
        if self.is_empty() {
            return Ok(None);
        }

        // acquire the buffer before touching any queue state, so an exhausted pool leaves the
        //  queue unchanged
        let mut datagram = pool.get_from_pool()?;

        let hop_limit = if let Some(message) = self.pop_non_coalescable(mtu) {
            let message_id = self.take_message_id();
            trace!("sending standalone message #{} of {} bytes to {:?}", message_id, message.payload.len(), self.destination);

            FragmentHeader::non_fragmented(message.payload.len().prechecked_cast(), message_id)
                .ser(&mut *datagram);
            datagram.extend_from_slice(&message.payload);
            message.hop_limit
        }
        else {
            if self.staging.is_none() && !self.stage_oversized_non_coalescable(mtu) {
                self.start_bundle(mtu);
            }
            let Some(staging) = &mut self.staging else {
                return Ok(None);
            };

            staging.write_next_fragment(filter_tag, &mut datagram);
            let hop_limit = staging.hop_limit;

            if staging.is_done() {
                trace!("bundle #{} to {:?} is fully sent", staging.message_id, self.destination);
                // this returns the bundle's messages to the pool
                self.staging = None;
            }
            hop_limit
        };

        self.send_rate.accumulate(datagram.len(), now);
        self.brake.consume(datagram.len());
        self.last_activity = now;

        Ok(Some(OutboundDatagram {
            destination: self.destination,
            hop_limit,
            bytes: datagram,
        }))
    }

    fn take_message_id(&mut self) -> u32 {
        let result = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        result
    }

    /// the first non-coalescable message in priority order that fits into a single datagram
    fn pop_non_coalescable(&mut self, mtu: usize) -> Option<OutboundMessage> {
        let message = self.levels.iter_mut()
            .find(|level| level.non_coalescable.front().is_some_and(|m| m.payload.len() <= mtu))?
            .non_coalescable
            .pop_front()?;
        self.num_pending -= 1;
        Some(message)
    }

    /// A non-coalescable message that is bigger than the MTU is fragmented as a bundle of its
    ///  own. The MTU can change while it is queued, so this is decided when it is staged.
    fn stage_oversized_non_coalescable(&mut self, mtu: usize) -> bool {
        let Some(message) = self.levels.iter_mut()
            .find_map(|level| level.non_coalescable.pop_front())
        else {
            return false;
        };
        self.num_pending -= 1;

        let message_id = self.take_message_id();
        let total_len = message.payload.len();
        debug!("starting bundle #{} for {:?}: non-coalescable message of {} bytes", message_id, self.destination, total_len);

        self.staging = Some(Staging::new(vec![message.payload], total_len, message_id, message.hop_limit, mtu));
        true
    }

    /// Moves coalescable messages into a new bundle, highest priority first. The first message
    ///  is always admitted, even if it is bigger than the MTU. Subsequent messages are only
    ///  admitted while the bundle fits into a single MTU and they share the first message's
    ///  hop limit; the first message that does not qualify stays queued.
    fn start_bundle(&mut self, mtu: usize) {
        let mut staged: Vec<PooledBuf> = Vec::new();
        let mut total_len = 0;
        let mut hop_limit = None;

        'levels: for level in &mut self.levels {
            while let Some(candidate) = level.coalescable.front() {
                if !staged.is_empty() && (total_len + candidate.payload.len() > mtu || candidate.hop_limit != hop_limit) {
                    break 'levels;
                }

                if let Some(message) = level.coalescable.pop_front() {
                    if staged.is_empty() {
                        hop_limit = message.hop_limit;
                    }
                    total_len += message.payload.len();
                    staged.push(message.payload);
                }
            }
        }

        if staged.is_empty() {
            return;
        }

        self.num_pending -= staged.len();
        let message_id = self.take_message_id();
        debug!("starting bundle #{} for {:?}: {} messages, {} bytes", message_id, self.destination, staged.len(), total_len);

        self.staging = Some(Staging::new(staged, total_len, message_id, hop_limit, mtu));
    }

    /// refills the brake, returning whether this queue currently exceeds its allowed send speed
    pub fn refresh_brake(&mut self, now: Instant) -> bool {
        self.brake.refill(self.allowed_max_send_speed, now);
        self.brake.is_overdrawn()
    }

    pub fn record_peer_receive_rate(&mut self, bytes_per_second: f64, now: Instant) {
        self.peer_receive_rate.record_rate(bytes_per_second, now);
    }

    fn peer_reported_receive_rate(&self, now: Instant) -> Option<f64> {
        if self.peer_receive_rate.is_safe_to_discard(now) || self.peer_receive_rate.recent_rate() <= 0.0 {
            return None;
        }
        Some(self.peer_receive_rate.recent_rate())
    }

    /// Periodic maintenance, returning whether the local send rate is suspiciously high so the
    ///  peer should be asked for a report of its receive rate
    pub fn long_tick(&mut self, now: Instant, config: &FragmentationConfig) -> bool {
        self.send_rate.tick(now);
        self.peer_receive_rate.tick(now);

        let target = match self.peer_reported_receive_rate(now) {
            Some(peer_rate) => {
                let local_rate = self.send_rate.recent_rate();
                let local_bound = if local_rate > 0.0 { local_rate * Self::LOCAL_RATE_HEADROOM } else { f64::MAX };
                peer_rate.min(local_bound).min(config.max_send_rate)
            }
            None => config.max_send_rate,
        };
        self.allowed_max_send_speed = ((self.allowed_max_send_speed + target) / 2.0)
            .max(config.min_send_rate);

        self.send_rate.recent_rate() > config.over_send_suspicion_rate
    }

    pub fn is_idle_expired(&self, now: Instant, removal_timeout: Duration) -> bool {
        self.is_empty()
            && !self.scheduled
            && !self.braked
            && now.saturating_duration_since(self.last_activity) > removal_timeout
    }
}
