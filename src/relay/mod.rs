//! Support for relaying the traffic of a virtual interface to ordinary sockets.

pub mod tcp;
pub mod udp;

use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::http::BodySink;
use crate::pool::{BufferPool, PooledBuffer};
use crate::proxy::{ForwardProxy, Protect};
use crate::stat::Traffic;
use crate::tunnel::{self, Demux, Device};
pub use tcp::{TcpMultiplexer, TcpRelay};
pub use udp::{UdpMultiplexer, UdpRelay};

/// Represents the configuration of a `Relay`.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// The capacity of each connection table.
    pub capacity: usize,
    /// The idle time after which a TCP connection may be evicted early.
    pub tcp_idle: Duration,
    /// The idle time after which an UDP connection may be evicted early.
    pub udp_idle: Duration,
    /// The time without data after which an end of stream from the network closes the TCP
    /// connection without a FIN to the device.
    pub eof_idle: Duration,
    /// The timeout of writing a segment to an outbound TCP socket, after which the connection
    /// is reset.
    pub write_timeout: Duration,
    /// The MTU of the device, also the size of the pooled buffers.
    pub mtu: usize,
    /// The destination ports of the TCP flows whose HTTP bodies are reassembled.
    pub inspect_ports: Vec<u16>,
}

impl Default for RelayConfig {
    fn default() -> RelayConfig {
        RelayConfig {
            capacity: 500,
            tcp_idle: Duration::from_secs(120),
            udp_idle: Duration::from_secs(60),
            eof_idle: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            mtu: 1500,
            inspect_ports: Vec::new(),
        }
    }
}

/// Waits until the stop signal is raised or its sender is gone.
pub(crate) async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Represents a handle which stops a running `Relay`.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Requests the relay to stop. Calling it more than once has no further effect.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Returns if the stop is requested.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Represents the relay of a device: the device pumps and both protocol engines sharing one
/// buffer pool.
pub struct Relay {
    pool: Arc<BufferPool>,
    tcp: Arc<TcpRelay>,
    tcp_multiplexer: TcpMultiplexer,
    udp: Arc<UdpRelay>,
    udp_multiplexer: UdpMultiplexer,
    device_rx: mpsc::UnboundedReceiver<PooledBuffer>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl Relay {
    /// Creates a new `Relay`.
    pub fn new(
        config: RelayConfig,
        protect: Arc<dyn Protect>,
        proxy: Arc<ForwardProxy>,
        sink: Option<Arc<dyn BodySink>>,
    ) -> Relay {
        let pool = BufferPool::new(config.mtu);
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (tcp, tcp_multiplexer) = TcpRelay::new(
            &config,
            Arc::clone(&pool),
            device_tx.clone(),
            Arc::clone(&protect),
            Arc::clone(&proxy),
            sink,
        );
        let (udp, udp_multiplexer) =
            UdpRelay::new(&config, Arc::clone(&pool), device_tx, protect, proxy);
        let (stop_tx, _) = watch::channel(false);

        Relay {
            pool,
            tcp,
            tcp_multiplexer,
            udp,
            udp_multiplexer,
            device_rx,
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Returns a handle which stops the relay.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Returns the TCP engine.
    pub fn tcp(&self) -> &Arc<TcpRelay> {
        &self.tcp
    }

    /// Returns the UDP engine.
    pub fn udp(&self) -> &Arc<UdpRelay> {
        &self.udp
    }

    /// Returns the buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Runs the relay on the device until it is stopped or the device fails, then closes
    /// every connection.
    pub async fn run<D: Device>(self, device: Arc<D>) -> io::Result<()> {
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let traffic_in = Traffic::new();
        let traffic_out = Traffic::new();
        let stop_rx = self.stop_tx.subscribe();

        let reader = tokio::spawn(tunnel::read_loop(
            Arc::clone(&device),
            Arc::clone(&self.pool),
            Demux {
                tcp: tcp_tx,
                udp: udp_tx,
            },
            traffic_in.clone(),
            stop_rx.clone(),
            Arc::clone(&self.stop_tx),
        ));
        let handles = vec![
            tokio::spawn(tunnel::write_loop(
                device,
                self.device_rx,
                traffic_out.clone(),
                stop_rx.clone(),
            )),
            tokio::spawn(Arc::clone(&self.tcp).run_dispatcher(tcp_rx, stop_rx.clone())),
            tokio::spawn(self.tcp_multiplexer.run(stop_rx.clone())),
            tokio::spawn(Arc::clone(&self.udp).run_dispatcher(udp_rx, stop_rx.clone())),
            tokio::spawn(self.udp_multiplexer.run(stop_rx)),
        ];

        let result = match reader.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        };
        for handle in handles {
            if let Err(ref e) = handle.await {
                warn!("join relay task: {}", e);
            }
        }

        let tcp = self.tcp.close_all();
        let udp = self.udp.close_all();
        info!("Close {} TCP and {} UDP connections", tcp, udp);
        info!("Receive {} from the device", traffic_in);
        info!("Send {} to the device", traffic_out);
        debug!("Buffers: {}", self.pool);
        self.pool.drain();

        result
    }
}

#[tokio::test]
async fn relay_run_and_stop() {
    use crate::packet::Packet;
    use crate::proxy::NoProtect;
    use crate::tunnel::MemoryDevice;
    use pnet::packet::tcp::TcpFlags;
    use std::net::{SocketAddr, SocketAddrV4};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::time;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dst = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_dst = match server.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };
    let src: SocketAddrV4 = "10.0.0.2:50000".parse().unwrap();

    let (device, inbound, mut outbound) = MemoryDevice::new();
    let relay = Relay::new(
        RelayConfig::default(),
        Arc::new(NoProtect),
        Arc::new(ForwardProxy::default()),
        None,
    );
    let stop = relay.stop_handle();
    let tcp = Arc::clone(relay.tcp());
    let running = tokio::spawn(relay.run(device));

    let syn = Packet::new_tcp(src, dst, TcpFlags::SYN, 1, 0, &[]).unwrap();
    inbound.send(syn.as_bytes().to_vec()).unwrap();
    let query = Packet::new_udp(src, udp_dst, b"query").unwrap();
    inbound.send(query.as_bytes().to_vec()).unwrap();

    let datagram = time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .unwrap()
        .unwrap();
    let syn_ack = Packet::parse(datagram).unwrap();
    assert!(syn_ack.tcp().unwrap().is_syn());
    assert_eq!(syn_ack.src(), dst);
    let (_stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"query");

    stop.stop();
    assert!(stop.is_stopped());
    time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(tcp.table().is_empty());
}

#[tokio::test]
async fn relay_device_failure() {
    use crate::proxy::NoProtect;
    use crate::tunnel::MemoryDevice;
    use tokio::time;

    let (device, inbound, _outbound) = MemoryDevice::new();
    let relay = Relay::new(
        RelayConfig::default(),
        Arc::new(NoProtect),
        Arc::new(ForwardProxy::default()),
        None,
    );
    let stop = relay.stop_handle();
    drop(inbound);

    let result = time::timeout(Duration::from_secs(5), relay.run(device))
        .await
        .unwrap();
    assert!(result.is_err());
    assert!(stop.is_stopped());
}

#[tokio::test]
async fn wait_stop_on_dropped_sender() {
    use tokio::time;

    let (tx, mut rx) = watch::channel(false);
    drop(tx);
    time::timeout(Duration::from_secs(1), wait_stop(&mut rx))
        .await
        .unwrap();
}
