use crate::config::FragmentationConfig;
use crate::delegate::EngineDelegate;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 4000 + n as u16))
}

pub fn test_config() -> FragmentationConfig {
    FragmentationConfig {
        local_id: 0,
        num_priorities: 4,
        assembly_timeout: Duration::from_secs(5),
        queue_removal_timeout: Duration::from_secs(60),
        rate_window: Duration::from_secs(1),
        brake_window: Duration::from_millis(100),
        max_send_rate: 100.0 * 1024.0 * 1024.0,
        min_send_rate: 1024.0,
        over_send_suspicion_rate: 50.0 * 1024.0 * 1024.0,
        buffer_pool_size: 64,
        max_outstanding_buffers: 4096,
        buffer_capacity: 1500,
        max_datagrams_per_tick: 16,
        tick_interval: Duration::from_millis(1),
        long_tick_interval: Duration::from_millis(20),
    }
}

/// A delegate with a manually advanced clock that records requests for receive rate reports
pub struct TestDelegate {
    now: Mutex<Instant>,
    mtu: AtomicU32,
    max_message_length: u32,
    report_requests: Mutex<Vec<SocketAddr>>,
}

impl TestDelegate {
    pub fn new(mtu: u32, max_message_length: u32) -> Arc<TestDelegate> {
        Arc::new(TestDelegate {
            now: Mutex::new(Instant::now()),
            mtu: AtomicU32::new(mtu),
            max_message_length,
            report_requests: Default::default(),
        })
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }

    pub fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::Release);
    }

    pub fn report_requests(&self) -> Vec<SocketAddr> {
        self.report_requests.lock().unwrap().clone()
    }
}

impl EngineDelegate for TestDelegate {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn request_peer_receive_rate_report(&self, destination: SocketAddr) {
        self.report_requests.lock().unwrap().push(destination);
    }

    fn max_message_length(&self) -> u32 {
        self.max_message_length
    }

    fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }
}
