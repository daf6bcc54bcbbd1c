use anyhow::bail;
use std::time::Duration;

pub struct FragmentationConfig {
    /// This node's id as far as the filter tag is concerned - only the low nibble is used, and
    ///  0 means 'unknown' (i.e. the filter tag never rejects anything)
    pub local_id: u8,

    /// Number of priority levels for outbound messages, 0 being the highest priority
    pub num_priorities: usize,

    /// Partially received messages are discarded if they are not complete after this time
    pub assembly_timeout: Duration,

    /// An idle outbound queue for a destination is removed after this time. This must be
    ///  significantly bigger than the peer's assembly timeout: Removing the queue resets the
    ///  message id counter, and a re-used message id must not collide with fragments of an
    ///  old message that are still in the peer's reassembly state.
    pub queue_removal_timeout: Duration,

    /// averaging window for send and receive rates
    pub rate_window: Duration,

    /// burst allowance of the per-destination brake: a destination may send up to its allowed
    ///  speed times this window in one go
    pub brake_window: Duration,

    /// bytes per second per destination, regardless of what the peer reports
    pub max_send_rate: f64,
    /// lower bound for the allowed send rate, so a destination is never throttled to zero
    pub min_send_rate: f64,
    /// If the local send rate to a destination exceeds this (bytes per second), the peer is
    ///  asked for a fresh report of its receive rate
    pub over_send_suspicion_rate: f64,

    /// Number of buffers that are pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub buffer_pool_size: usize,
    /// Upper bound for the number of pooled buffers in use at any given time
    pub max_outstanding_buffers: usize,
    /// initial capacity of pooled buffers
    pub buffer_capacity: usize,

    pub max_datagrams_per_tick: usize,
    pub tick_interval: Duration,
    pub long_tick_interval: Duration,
}

impl Default for FragmentationConfig {
    fn default() -> FragmentationConfig {
        FragmentationConfig {
            local_id: 0,
            num_priorities: 4,
            assembly_timeout: Duration::from_secs(10),
            queue_removal_timeout: Duration::from_secs(120),
            rate_window: Duration::from_secs(1),
            brake_window: Duration::from_millis(50),
            max_send_rate: 64.0 * 1024.0 * 1024.0,
            min_send_rate: 16.0 * 1024.0,
            over_send_suspicion_rate: 8.0 * 1024.0 * 1024.0,
            buffer_pool_size: 4096,
            max_outstanding_buffers: 65536,
            buffer_capacity: 1500,
            max_datagrams_per_tick: 256,
            tick_interval: Duration::from_millis(1),
            long_tick_interval: Duration::from_millis(100),
        }
    }
}

impl FragmentationConfig {
    const MIN_REMOVAL_TO_ASSEMBLY_RATIO: u32 = 4;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_priorities == 0 {
            bail!("at least one priority level is required");
        }
        if self.assembly_timeout.is_zero() {
            bail!("assembly timeout must be non-zero");
        }
        if self.queue_removal_timeout < self.assembly_timeout * Self::MIN_REMOVAL_TO_ASSEMBLY_RATIO {
            bail!("queue removal timeout {:?} must be at least {} times the assembly timeout {:?}",
                self.queue_removal_timeout, Self::MIN_REMOVAL_TO_ASSEMBLY_RATIO, self.assembly_timeout);
        }
        if self.rate_window.is_zero() || self.brake_window.is_zero() {
            bail!("rate windows must be non-zero");
        }
        if !(self.min_send_rate > 0.0) || self.min_send_rate > self.max_send_rate {
            bail!("send rate bounds are inconsistent: min {} max {}", self.min_send_rate, self.max_send_rate);
        }
        if self.max_outstanding_buffers < self.buffer_pool_size {
            bail!("pooling more buffers than may be outstanding makes no sense");
        }
        if self.max_datagrams_per_tick == 0 {
            bail!("max datagrams per tick must be at least 1");
        }
        Ok(())
    }
}
