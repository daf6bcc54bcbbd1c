use crate::buffer_pool::BufferPool;
use crate::config::FragmentationConfig;
use crate::delegate::EngineDelegate;
use crate::filter_tag;
use crate::safe_converter::SafeCast;
use crate::send_queue::{EnqueueOutcome, OutboundDatagram, OutboundMessage, OutboundQueue};
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Per-message options for [Fragmenter::enqueue]
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// 0 is the highest priority
    pub priority: usize,
    /// Whether the message may share datagrams with other messages. A non-coalescable message
    ///  that is bigger than the MTU is fragmented, but never shares a datagram.
    ///
    /// NB: Coalesced messages are delivered as a single buffer, so their encoding must be
    ///      self-delimiting
    pub coalescable: bool,
    pub hop_limit: Option<u8>,
    /// if non-zero (and `logical_dest_id` is set), a queued message with the same key and
    ///  logical destination is overwritten instead of queueing another message
    pub replace_key: u64,
    pub logical_dest_id: Option<u64>,
}

/// The outbound side: a queue per destination and round-robin scheduling across destinations,
///  emitting a single datagram per call to [Fragmenter::pop_one]
pub struct Fragmenter {
    config: Arc<FragmentationConfig>,
    delegate: Arc<dyn EngineDelegate>,
    pool: BufferPool,
    queues: FxHashMap<SocketAddr, OutboundQueue>,
    /// destinations with pending data that are not rate limited, in round-robin order
    schedulable: VecDeque<SocketAddr>,
    /// destinations with pending data that are rate limited
    braked: Vec<SocketAddr>,
    num_removed_queues: u64,
}

impl Fragmenter {
    pub fn new(config: Arc<FragmentationConfig>, delegate: Arc<dyn EngineDelegate>, pool: BufferPool) -> Fragmenter {
        Fragmenter {
            config,
            delegate,
            pool,
            queues: FxHashMap::default(),
            schedulable: VecDeque::new(),
            braked: Vec::new(),
            num_removed_queues: 0,
        }
    }

    pub fn enqueue(&mut self, destination: SocketAddr, payload: &[u8], options: &SendOptions) -> anyhow::Result<()> {
        if payload.is_empty() {
            trace!("ignoring empty message for {:?}", destination);
            return Ok(());
        }
        if options.priority >= self.config.num_priorities {
            bail!("priority {} is out of range: there are {} priority levels", options.priority, self.config.num_priorities);
        }
        let max_message_length: usize = self.delegate.max_message_length().safe_cast();
        if payload.len() > max_message_length {
            bail!("message for {:?} has {} bytes, exceeding the maximum message length of {}", destination, payload.len(), max_message_length);
        }

        let now = self.delegate.now();

        let message = OutboundMessage {
            payload: self.pool.get_with_content(payload)?,
            coalescable: options.coalescable,
            hop_limit: options.hop_limit,
            replace_key: options.replace_key,
            logical_dest_id: options.logical_dest_id,
        };

        let queue = self.queues.entry(destination)
            .or_insert_with(|| {
                debug!("creating outbound queue for {:?}", destination);
                OutboundQueue::new(destination, &self.config, now)
            });

        if queue.enqueue(message, options.priority, now) == EnqueueOutcome::Appended {
            trace!("queued message of {} bytes for {:?} with priority {}", payload.len(), destination, options.priority);
        }

        if !queue.is_empty() && !queue.scheduled && !queue.braked {
            queue.scheduled = true;
            self.schedulable.push_back(destination);
        }
        Ok(())
    }

    /// Emits the next datagram, taking destinations in round-robin order. Returns `None` if no
    ///  destination has anything to send right now.
    pub fn pop_one(&mut self) -> anyhow::Result<Option<OutboundDatagram>> {
        let now = self.delegate.now();
        self.release_brakes(now);

        let mtu: usize = self.delegate.mtu().safe_cast();
        if mtu == 0 {
            bail!("MTU must be positive");
        }

        while let Some(destination) = self.schedulable.pop_front() {
            let Some(queue) = self.queues.get_mut(&destination) else {
                continue;
            };

            if queue.refresh_brake(now) {
                trace!("{:?} exceeds its allowed send speed - pausing", destination);
                queue.scheduled = false;
                queue.braked = true;
                self.braked.push(destination);
                continue;
            }

            let tag = filter_tag::make(self.config.local_id, queue.remote_id());
            let datagram = match queue.pop_datagram(&self.pool, tag, mtu, now) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => {
                    queue.scheduled = false;
                    continue;
                }
                Err(e) => {
                    self.schedulable.push_front(destination);
                    return Err(e);
                }
            };

            if queue.is_empty() {
                queue.scheduled = false;
            }
            else if queue.refresh_brake(now) {
                queue.scheduled = false;
                queue.braked = true;
                self.braked.push(destination);
            }
            else {
                self.schedulable.push_back(destination);
            }

            return Ok(Some(datagram));
        }
        Ok(None)
    }

    /// re-schedule rate limited queues that have become eligible again
    fn release_brakes(&mut self, now: Instant) {
        let queues = &mut self.queues;
        let schedulable = &mut self.schedulable;

        self.braked.retain(|destination| {
            let Some(queue) = queues.get_mut(destination) else {
                return false;
            };
            if queue.refresh_brake(now) {
                return true;
            }

            trace!("{:?} is back below its allowed send speed", destination);
            queue.braked = false;
            if !queue.is_empty() && !queue.scheduled {
                queue.scheduled = true;
                schedulable.push_back(*destination);
            }
            false
        });
    }

    pub fn set_peer_reported_receive_rate(&mut self, destination: SocketAddr, bytes_per_second: f64) {
        let now = self.delegate.now();
        match self.queues.get_mut(&destination) {
            Some(queue) => queue.record_peer_receive_rate(bytes_per_second, now),
            None => trace!("ignoring receive rate report for unknown destination {:?}", destination),
        }
    }

    /// Periodic maintenance: advance rate estimators, adjust allowed send speeds, and remove
    ///  queues that were idle for too long
    pub fn long_tick(&mut self) {
        let now = self.delegate.now();

        let mut report_requests = Vec::new();
        for (destination, queue) in self.queues.iter_mut() {
            if queue.long_tick(now, &self.config) {
                report_requests.push(*destination);
            }
        }
        for destination in report_requests {
            debug!("send rate to {:?} is suspiciously high - requesting a receive rate report", destination);
            self.delegate.request_peer_receive_rate_report(destination);
        }

        self.release_brakes(now);

        let removal_timeout = self.config.queue_removal_timeout;
        let num_before = self.queues.len();
        self.queues.retain(|destination, queue| {
            if queue.is_idle_expired(now, removal_timeout) {
                debug!("removing idle outbound queue for {:?}", destination);
                return false;
            }
            true
        });
        self.num_removed_queues += (num_before - self.queues.len()) as u64;
    }

    pub fn queue(&self, destination: &SocketAddr) -> Option<&OutboundQueue> {
        self.queues.get(destination)
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn num_removed_queues(&self) -> u64 {
        self.num_removed_queues
    }

    pub fn is_schedulable(&self, destination: &SocketAddr) -> bool {
        self.queues.get(destination)
            .map(|q| q.scheduled)
            .unwrap_or(false)
    }
}
