use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::config::FragmentationConfig;
use crate::delegate::EngineDelegate;
use crate::filter_tag;
use crate::fragment_header::{FragmentHeader, FragmentKind, HeaderError};
use crate::rate_estimator::RateEstimator;
use crate::safe_converter::SafeCast;
use bit_set::BitSet;
use rustc_hash::FxHashMap;
use std::cmp::min;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// The result of successfully ingesting a datagram
#[derive(Debug)]
pub enum Ingested {
    Complete(PooledBuf),
    StillAssembling,
    /// The fragment failed the filter tag check and was dropped without touching any state.
    ///  This happens legitimately while a peer's address changes, so callers should treat it
    ///  like [Ingested::StillAssembling].
    FilterRejected,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed fragment header: {0}")]
    HeaderTruncated(HeaderError),
    #[error("unknown fragment type {0}")]
    UnknownType(u8),
    #[error("fragment out of range: packet length {packet_length}, fragment index {fragment_index}, payload length {payload_len}")]
    LengthOutOfRange {
        packet_length: u32,
        fragment_index: u32,
        payload_len: usize,
    },
    #[error("message #{message_id} was started with length {expected}, but a fragment declares length {declared}")]
    LengthMismatch {
        message_id: u32,
        expected: usize,
        declared: usize,
    },
    #[error("no buffer for reassembly: {0}")]
    PoolExhausted(String),
}

impl From<HeaderError> for IngestError {
    fn from(value: HeaderError) -> Self {
        match value {
            HeaderError::UnknownType(kind) => IngestError::UnknownType(kind),
            other => IngestError::HeaderTruncated(other),
        }
    }
}

/// A partially received message
struct ReassemblyState {
    target_len: usize,
    num_fragments: usize,
    filled: BitSet,
    num_filled: usize,
    buf: PooledBuf,
    created_at: Instant,
}

/// Everything received from a given sender address
struct ReassemblyBoard {
    states: FxHashMap<u32, ReassemblyState>,
    receive_rate: RateEstimator,
}
impl ReassemblyBoard {
    fn new(rate_window: Duration) -> ReassemblyBoard {
        ReassemblyBoard {
            states: FxHashMap::default(),
            receive_rate: RateEstimator::new(rate_window),
        }
    }
}

/// The inbound side: collects fragments per sender and message id until a message is complete
pub struct Reassembler {
    config: Arc<FragmentationConfig>,
    delegate: Arc<dyn EngineDelegate>,
    pool: BufferPool,
    boards: FxHashMap<SocketAddr, ReassemblyBoard>,
    num_evicted_states: u64,
    num_evicted_boards: u64,
}

impl Reassembler {
    pub fn new(config: Arc<FragmentationConfig>, delegate: Arc<dyn EngineDelegate>, pool: BufferPool) -> Reassembler {
        Reassembler {
            config,
            delegate,
            pool,
            boards: FxHashMap::default(),
            num_evicted_states: 0,
            num_evicted_boards: 0,
        }
    }

    /// `resolved_src_id` is the filter tag nibble the caller associates with `sender`, or
    ///  [filter_tag::WILDCARD] if it has none
    pub fn ingest(&mut self, datagram: &[u8], sender: SocketAddr, resolved_src_id: u8) -> Result<Ingested, IngestError> {
        let mut parse_buf = datagram;
        let header = FragmentHeader::deser(&mut parse_buf)?;
        let payload = parse_buf;

        if filter_tag::should_reject(header.filter_tag, resolved_src_id, self.config.local_id) {
            trace!("fragment from {:?} failed the filter check (tag {:#04x}) - dropping", sender, header.filter_tag);
            return Ok(Ingested::FilterRejected);
        }

        let out_of_range = || IngestError::LengthOutOfRange {
            packet_length: header.packet_length,
            fragment_index: header.fragment_index,
            payload_len: payload.len(),
        };

        let max_message_length: usize = self.delegate.max_message_length().safe_cast();
        let packet_length: usize = header.packet_length.safe_cast();
        if packet_length == 0 || packet_length > max_message_length {
            return Err(out_of_range());
        }

        let now = self.delegate.now();

        if header.kind == FragmentKind::NonFragmented {
            if payload.len() != packet_length {
                return Err(out_of_range());
            }
            let message = self.pool.get_with_content(payload)
                .map_err(|e| IngestError::PoolExhausted(e.to_string()))?;

            trace!("received non-fragmented message #{} of {} bytes from {:?}", header.message_id, packet_length, sender);
            self.board_for(sender).receive_rate.accumulate(datagram.len(), now);
            return Ok(Ingested::Complete(message));
        }

        let mtu: usize = self.delegate.mtu().safe_cast();
        if mtu == 0 {
            return Err(out_of_range());
        }
        let num_fragments = packet_length.div_ceil(mtu);
        let fragment_index: usize = header.fragment_index.safe_cast();
        if fragment_index >= num_fragments {
            return Err(out_of_range());
        }
        let offset = fragment_index * mtu;
        if payload.len() != min(mtu, packet_length - offset) {
            return Err(out_of_range());
        }

        let pool = self.pool.clone();
        let board = self.board_for(sender);

        let state = match board.states.entry(header.message_id) {
            Entry::Occupied(e) if e.get().target_len != packet_length => {
                let expected = e.get().target_len;
                debug!("length mismatch for message #{} from {:?} - discarding partial state", header.message_id, sender);
                e.remove();
                return Err(IngestError::LengthMismatch {
                    message_id: header.message_id,
                    expected,
                    declared: packet_length,
                });
            }
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let mut buf = pool.get_from_pool()
                    .map_err(|err| IngestError::PoolExhausted(err.to_string()))?;
                buf.resize(packet_length, 0);

                trace!("starting reassembly of message #{} ({} bytes, {} fragments) from {:?}", header.message_id, packet_length, num_fragments, sender);
                e.insert(ReassemblyState {
                    target_len: packet_length,
                    num_fragments,
                    filled: BitSet::with_capacity(num_fragments),
                    num_filled: 0,
                    buf,
                    created_at: now,
                })
            }
        };
        board.receive_rate.accumulate(datagram.len(), now);

        if state.filled.insert(fragment_index) {
            state.buf[offset..offset + payload.len()].copy_from_slice(payload);
            state.num_filled += 1;
        }
        else {
            trace!("duplicate fragment {} of message #{} from {:?} - ignoring", fragment_index, header.message_id, sender);
        }

        if state.num_filled < state.num_fragments {
            return Ok(Ingested::StillAssembling);
        }

        trace!("message #{} from {:?} is complete", header.message_id, sender);
        match board.states.remove(&header.message_id) {
            Some(state) => Ok(Ingested::Complete(state.buf)),
            None => Ok(Ingested::StillAssembling),
        }
    }

    fn board_for(&mut self, sender: SocketAddr) -> &mut ReassemblyBoard {
        let rate_window = self.config.rate_window;
        self.boards.entry(sender)
            .or_insert_with(|| {
                debug!("creating reassembly board for {:?}", sender);
                ReassemblyBoard::new(rate_window)
            })
    }

    /// Periodic maintenance: rolls receive rate windows, discards partial messages that are
    ///  older than the assembly timeout, and removes boards that have become irrelevant
    pub fn long_tick(&mut self) {
        let now = self.delegate.now();
        let assembly_timeout = self.config.assembly_timeout;

        for (sender, board) in self.boards.iter_mut() {
            board.receive_rate.tick(now);

            let num_before = board.states.len();
            board.states.retain(|message_id, state| {
                if now.saturating_duration_since(state.created_at) > assembly_timeout {
                    debug!("discarding incomplete message #{} from {:?}: {} of {} fragments received", message_id, sender, state.num_filled, state.num_fragments);
                    return false;
                }
                true
            });
            self.num_evicted_states += (num_before - board.states.len()) as u64;
        }

        let num_before = self.boards.len();
        self.boards.retain(|sender, board| {
            if board.states.is_empty() && board.receive_rate.is_safe_to_discard(now) {
                debug!("removing reassembly board for {:?}", sender);
                return false;
            }
            true
        });
        self.num_evicted_boards += (num_before - self.boards.len()) as u64;
    }

    /// bytes per second received from a sender, for reporting back to the peer
    pub fn receive_rate(&self, sender: &SocketAddr) -> Option<f64> {
        self.boards.get(sender)
            .map(|b| b.receive_rate.recent_rate())
    }

    pub fn num_boards(&self) -> usize {
        self.boards.len()
    }

    pub fn num_states(&self, sender: &SocketAddr) -> usize {
        self.boards.get(sender)
            .map(|b| b.states.len())
            .unwrap_or(0)
    }

    pub fn num_evicted_states(&self) -> u64 {
        self.num_evicted_states
    }

    pub fn num_evicted_boards(&self) -> u64 {
        self.num_evicted_boards
    }
}
