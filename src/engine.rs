use crate::buffer_pool::BufferPool;
use crate::config::FragmentationConfig;
use crate::datagram_sink::DatagramSink;
use crate::delegate::EngineDelegate;
use crate::fragmenter::{Fragmenter, SendOptions};
use crate::reassembly::{IngestError, Ingested, Reassembler};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// The context object owning all outbound and inbound state. It does no locking and spawns no
///  threads: the owner serializes access, and calls [Engine::pump] / [Engine::long_tick]
///  regularly from a single place.
pub struct Engine {
    config: Arc<FragmentationConfig>,
    sink: Arc<dyn DatagramSink>,
    pool: BufferPool,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    num_dropped_datagrams: u64,
}

impl Engine {
    pub fn new(config: FragmentationConfig, delegate: Arc<dyn EngineDelegate>, sink: Arc<dyn DatagramSink>) -> anyhow::Result<Engine> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = BufferPool::new(config.buffer_capacity, config.buffer_pool_size, config.max_outstanding_buffers);
        Ok(Engine {
            fragmenter: Fragmenter::new(config.clone(), delegate.clone(), pool.clone()),
            reassembler: Reassembler::new(config.clone(), delegate, pool.clone()),
            config,
            sink,
            pool,
            num_dropped_datagrams: 0,
        })
    }

    pub fn enqueue(&mut self, destination: SocketAddr, payload: &[u8], options: &SendOptions) -> anyhow::Result<()> {
        self.fragmenter.enqueue(destination, payload, options)
    }

    pub fn ingest(&mut self, datagram: &[u8], sender: SocketAddr, resolved_src_id: u8) -> Result<Ingested, IngestError> {
        let result = self.reassembler.ingest(datagram, sender, resolved_src_id);
        if let Err(e) = &result {
            warn!("dropping datagram from {:?}: {}", sender, e);
        }
        result
    }

    /// Emits a single datagram through the sink, returning `false` if there was nothing to send
    pub fn pop_one(&mut self) -> anyhow::Result<bool> {
        let Some(datagram) = self.fragmenter.pop_one()? else {
            return Ok(false);
        };

        if !self.sink.send_datagram(datagram.destination, &datagram.bytes, datagram.hop_limit) {
            debug!("datagram to {:?} was not sent", datagram.destination);
            self.num_dropped_datagrams += 1;
        }
        Ok(true)
    }

    /// Emits up to `max_datagrams_per_tick` datagrams, returning the number of datagrams emitted
    pub fn pump(&mut self) -> anyhow::Result<usize> {
        let mut num_sent = 0;
        while num_sent < self.config.max_datagrams_per_tick && self.pop_one()? {
            num_sent += 1;
        }
        Ok(num_sent)
    }

    pub fn long_tick(&mut self) {
        self.fragmenter.long_tick();
        self.reassembler.long_tick();
    }

    /// Feeds back a receive rate (bytes per second) that `destination` reported for traffic
    ///  from this node
    pub fn set_peer_reported_receive_rate(&mut self, destination: SocketAddr, bytes_per_second: f64) {
        self.fragmenter.set_peer_reported_receive_rate(destination, bytes_per_second);
    }

    /// The rate at which this node receives data from `sender`, which is what the sender needs
    ///  for its [Engine::set_peer_reported_receive_rate]
    pub fn receive_rate(&self, sender: &SocketAddr) -> Option<f64> {
        self.reassembler.receive_rate(sender)
    }

    pub fn fragmenter(&self) -> &Fragmenter {
        &self.fragmenter
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn num_dropped_datagrams(&self) -> u64 {
        self.num_dropped_datagrams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram_sink::MockDatagramSink;
    use crate::delegate::MockEngineDelegate;
    use crate::test_util::{addr, test_config};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    type Captured = Arc<Mutex<Vec<(SocketAddr, Vec<u8>, Option<u8>)>>>;

    fn mock_delegate(clock: Arc<Mutex<Instant>>) -> MockEngineDelegate {
        let mut delegate = MockEngineDelegate::new();
        delegate.expect_now()
            .returning(move || *clock.lock().unwrap());
        delegate.expect_mtu()
            .return_const(100u32);
        delegate.expect_max_message_length()
            .return_const(10_000u32);
        delegate
    }

    fn capturing_sink(success: bool) -> (MockDatagramSink, Captured) {
        let captured: Captured = Default::default();
        let mut sink = MockDatagramSink::new();
        let c = captured.clone();
        sink.expect_send_datagram()
            .returning(move |to, datagram, hop_limit| {
                c.lock().unwrap().push((to, datagram.to_vec(), hop_limit));
                success
            });
        (sink, captured)
    }

    fn engine(config: FragmentationConfig, delegate: MockEngineDelegate, sink: MockDatagramSink) -> Engine {
        Engine::new(config, Arc::new(delegate), Arc::new(sink)).unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let mut config = test_config();
        config.num_priorities = 0;

        let clock = Arc::new(Mutex::new(Instant::now()));
        let result = Engine::new(config, Arc::new(mock_delegate(clock)), Arc::new(MockDatagramSink::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_send_and_receive() {
        let clock = Arc::new(Mutex::new(Instant::now()));
        let (sink, captured) = capturing_sink(true);
        let mut sender = engine(test_config(), mock_delegate(clock.clone()), sink);
        let mut receiver = engine(test_config(), mock_delegate(clock), MockDatagramSink::new());

        let big = (0..250).map(|i| i as u8).collect::<Vec<_>>();
        sender.enqueue(addr(2), &big, &SendOptions::default()).unwrap();
        sender.enqueue(addr(2), &[1, 2, 3], &SendOptions { hop_limit: Some(3), priority: 1, ..Default::default() }).unwrap();

        assert_eq!(sender.pump().unwrap(), 4);
        assert_eq!(sender.pump().unwrap(), 0);

        let captured = captured.lock().unwrap();
        assert!(captured.iter().all(|(to, _, _)| *to == addr(2)));
        assert_eq!(captured[0].2, Some(3));
        assert!(captured[1..].iter().all(|(_, _, hop_limit)| hop_limit.is_none()));

        let mut messages = Vec::new();
        for (_, datagram, _) in captured.iter() {
            if let Ingested::Complete(message) = receiver.ingest(datagram, addr(1), 0).unwrap() {
                messages.push(message.to_vec());
            }
        }
        assert_eq!(messages, vec![vec![1, 2, 3], big]);
        assert!(receiver.receive_rate(&addr(1)).is_some());
    }

    #[test]
    fn test_pump_limit() {
        let clock = Arc::new(Mutex::new(Instant::now()));
        let (sink, captured) = capturing_sink(true);
        let mut config = test_config();
        config.max_datagrams_per_tick = 2;
        let mut engine = engine(config, mock_delegate(clock), sink);

        for i in 0..5 {
            engine.enqueue(addr(2), &[i], &SendOptions::default()).unwrap();
        }
        assert_eq!(engine.pump().unwrap(), 2);
        assert_eq!(engine.pump().unwrap(), 2);
        assert_eq!(engine.pump().unwrap(), 1);
        assert_eq!(engine.pump().unwrap(), 0);
        assert_eq!(captured.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_failed_send_is_counted() {
        let clock = Arc::new(Mutex::new(Instant::now()));
        let (sink, _) = capturing_sink(false);
        let mut engine = engine(test_config(), mock_delegate(clock), sink);

        engine.enqueue(addr(2), &[1], &SendOptions::default()).unwrap();
        assert!(engine.pop_one().unwrap());
        assert!(!engine.pop_one().unwrap());
        assert_eq!(engine.num_dropped_datagrams(), 1);
        assert_eq!(engine.buffer_pool().num_outstanding(), 0);
    }

    #[test]
    fn test_over_send_requests_report() {
        let clock = Arc::new(Mutex::new(Instant::now()));
        let mut delegate = mock_delegate(clock.clone());
        delegate.expect_request_peer_receive_rate_report()
            .withf(|destination| *destination == addr(2))
            .times(1)
            .return_const(());

        let (sink, _) = capturing_sink(true);
        let mut config = test_config();
        config.over_send_suspicion_rate = 100.0;
        let mut engine = engine(config, delegate, sink);

        engine.enqueue(addr(2), &[1; 500], &SendOptions::default()).unwrap();
        engine.pump().unwrap();
        engine.long_tick();

        *clock.lock().unwrap() += Duration::from_secs(1);
        engine.long_tick();
    }

    #[test]
    fn test_peer_reported_rate() {
        let clock = Arc::new(Mutex::new(Instant::now()));
        let (sink, _) = capturing_sink(true);
        let mut engine = engine(test_config(), mock_delegate(clock), sink);

        engine.enqueue(addr(2), &[1], &SendOptions::default()).unwrap();
        engine.set_peer_reported_receive_rate(addr(2), 4096.0);
        engine.long_tick();

        let allowed = engine.fragmenter().queue(&addr(2)).unwrap().allowed_max_send_speed();
        assert_eq!(allowed, (test_config().max_send_rate + 4096.0) / 2.0);
    }

    #[test]
    fn test_ingest_error_is_surfaced() {
        let clock = Arc::new(Mutex::new(Instant::now()));
        let mut engine = engine(test_config(), mock_delegate(clock), MockDatagramSink::new());

        assert!(matches!(engine.ingest(&[0x80, 1, 1], addr(1), 0), Err(IngestError::UnknownType(2))));
        assert_eq!(engine.reassembler().num_boards(), 0);
    }
}
