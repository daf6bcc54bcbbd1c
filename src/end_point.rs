use crate::config::FragmentationConfig;
use crate::delegate::EngineDelegate;
use crate::engine::Engine;
use crate::filter_tag;
use crate::fragmenter::SendOptions;
use crate::reassembly::Ingested;
use anyhow::anyhow;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, trace, warn};

/// Application callback for completely received messages
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, sender: SocketAddr, message: &[u8]);
}

type SrcIdResolver = Arc<dyn Fn(SocketAddr) -> u8 + Send + Sync>;

/// EndPoint wires an [Engine] to a UDP socket: It dispatches received datagrams to the
///  reassembly side, and drives the outbound side and periodic maintenance from timers.
///
/// The engine is protected by a plain mutex that is never held across an `await`.
pub struct EndPoint {
    engine: Arc<Mutex<Engine>>,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn MessageHandler>,
    src_id_resolver: SrcIdResolver,
    tick_interval: Duration,
    long_tick_interval: Duration,
}

impl EndPoint {
    /// max size of a UDP payload
    const RECEIVE_BUFFER_SIZE: usize = 65536;

    pub async fn bind(
        addr: SocketAddr,
        config: FragmentationConfig,
        delegate: Arc<dyn EngineDelegate>,
        handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<EndPoint> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let sink = Arc::new(std_socket.try_clone()?);
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        info!("bound socket to {:?}", socket.local_addr()?);

        let tick_interval = config.tick_interval;
        let long_tick_interval = config.long_tick_interval;
        let engine = Engine::new(config, delegate, sink)?;

        Ok(EndPoint {
            engine: Arc::new(Mutex::new(engine)),
            socket,
            handler,
            src_id_resolver: Arc::new(|_| filter_tag::WILDCARD),
            tick_interval,
            long_tick_interval,
        })
    }

    /// Maps a sender address to the filter tag id the application knows for it. Without a
    ///  resolver, all senders are unknown and the filter tag check never rejects anything.
    pub fn with_src_id_resolver(mut self, resolver: impl Fn(SocketAddr) -> u8 + Send + Sync + 'static) -> EndPoint {
        self.src_id_resolver = Arc::new(resolver);
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn send(&self, destination: SocketAddr, message: &[u8], options: &SendOptions) -> anyhow::Result<()> {
        self.lock_engine()?
            .enqueue(destination, message, options)
    }

    pub fn set_peer_reported_receive_rate(&self, destination: SocketAddr, bytes_per_second: f64) -> anyhow::Result<()> {
        self.lock_engine()?
            .set_peer_reported_receive_rate(destination, bytes_per_second);
        Ok(())
    }

    pub fn receive_rate(&self, sender: &SocketAddr) -> anyhow::Result<Option<f64>> {
        Ok(self.lock_engine()?.receive_rate(sender))
    }

    fn lock_engine(&self) -> anyhow::Result<MutexGuard<'_, Engine>> {
        self.engine.lock()
            .map_err(|_| anyhow!("engine mutex is poisoned"))
    }

    /// Runs until the engine's mutex is poisoned
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("starting end point loop");

        let mut receive_buf = vec![0u8; Self::RECEIVE_BUFFER_SIZE];

        let mut tick = interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut long_tick = interval(self.long_tick_interval);
        long_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                received = self.socket.recv_from(&mut receive_buf) => {
                    match received {
                        Ok((num_read, from)) => self.on_datagram(&receive_buf[..num_read], from)?,
                        Err(e) => error!("socket error: {}", e),
                    }
                }
                _ = tick.tick() => self.on_tick()?,
                _ = long_tick.tick() => self.on_long_tick()?,
            }
        }
    }

    fn on_datagram(&self, datagram: &[u8], from: SocketAddr) -> anyhow::Result<()> {
        trace!("received datagram of {} bytes from {:?}", datagram.len(), from);

        let resolved_src_id = (self.src_id_resolver)(from);
        let ingested = self.lock_engine()?
            .ingest(datagram, from, resolved_src_id);

        // the handler is called without holding the lock, so it may send messages
        if let Ok(Ingested::Complete(message)) = ingested {
            self.handler.on_message(from, &message);
        }
        Ok(())
    }

    fn on_tick(&self) -> anyhow::Result<()> {
        if let Err(e) = self.lock_engine()?.pump() {
            warn!("error sending datagrams: {}", e);
        }
        Ok(())
    }

    fn on_long_tick(&self) -> anyhow::Result<()> {
        self.lock_engine()?.long_tick();
        Ok(())
    }
}
