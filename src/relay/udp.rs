//! Support for relaying UDP flows through one connected socket per flow.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, trace, warn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

use super::{wait_stop, RelayConfig};
use crate::cache::FlowKey;
use crate::packet::{Packet, UDP_PAYLOAD_OFFSET};
use crate::pool::{BufferPool, PooledBuffer};
use crate::proxy::{ForwardProxy, Protect};
use crate::udp::{self, UdpConnection, UdpTable};

type Registration = BoxFuture<'static, UdpEvent>;

enum UdpEvent {
    Read(Arc<UdpConnection>, PooledBuffer, io::Result<usize>),
    Closed(Arc<UdpConnection>),
}

/// Represents the UDP engine.
pub struct UdpRelay {
    table: UdpTable,
    pool: Arc<BufferPool>,
    device_tx: UnboundedSender<PooledBuffer>,
    registration_tx: UnboundedSender<Registration>,
    protect: Arc<dyn Protect>,
    proxy: Arc<ForwardProxy>,
}

impl UdpRelay {
    /// Creates a new `UdpRelay` with its multiplexer.
    pub fn new(
        config: &RelayConfig,
        pool: Arc<BufferPool>,
        device_tx: UnboundedSender<PooledBuffer>,
        protect: Arc<dyn Protect>,
        proxy: Arc<ForwardProxy>,
    ) -> (Arc<UdpRelay>, UdpMultiplexer) {
        let (registration_tx, registrations) = mpsc::unbounded_channel();
        let relay = Arc::new(UdpRelay {
            table: udp::new_table(config.capacity, config.udp_idle),
            pool,
            device_tx,
            registration_tx,
            protect,
            proxy,
        });
        let multiplexer = UdpMultiplexer {
            relay: Arc::clone(&relay),
            registrations,
        };

        (relay, multiplexer)
    }

    /// Returns the connection table.
    pub fn table(&self) -> &UdpTable {
        &self.table
    }

    /// Closes every connection, returns the number of connections closed.
    pub fn close_all(&self) -> usize {
        self.table.close_all()
    }

    /// Handles the datagrams queued by the device until the relay stops.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<Packet<PooledBuffer>>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let packet = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = wait_stop(&mut stop) => break,
            };
            if let Err(ref e) = self.handle(packet).await {
                warn!("handle UDP: {}", e);
            }
        }
        trace!("UDP dispatcher stopped");
    }

    /// Handles a datagram from the device. A datagram whose outbound socket cannot be set
    /// up is dropped.
    pub async fn handle<B: AsRef<[u8]>>(&self, packet: Packet<B>) -> io::Result<()> {
        if !packet.is_udp() {
            return Ok(());
        }
        let key = FlowKey::new(packet.dst(), packet.src().port());

        let conn = match self.table.get(&key) {
            Some(conn) => conn,
            None => match self.open(key, &packet).await {
                Ok(conn) => conn,
                Err(ref e) => {
                    debug!("open {}: {}", key, e);
                    return Ok(());
                }
            },
        };

        let payload = packet.payload();
        match conn.socket().send(payload).await {
            Ok(n) => {
                trace!("send to {}: {} Bytes", key, n);
                let mut state = conn.state();
                state.last_active = Instant::now();
                state.bytes_written += n;
            }
            Err(ref e) => {
                debug!("send to {}: {}", key, e);
                self.terminate(&conn);
            }
        }

        Ok(())
    }

    async fn open<B: AsRef<[u8]>>(
        &self,
        key: FlowKey,
        packet: &Packet<B>,
    ) -> io::Result<Arc<UdpConnection>> {
        let socket = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        self.protect.protect(socket.as_raw_fd())?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        let target = self.proxy.resolve(key.dst());
        socket.connect(SocketAddr::V4(target)).await?;

        let mut template = packet.indicator().clone();
        template.swap_source_and_destination();
        let conn = UdpConnection::new(key, socket, template);
        self.table.put(key, Arc::clone(&conn));
        debug!("open {} -> {}", key, target);
        self.register(self.read(Arc::clone(&conn)))?;

        Ok(conn)
    }

    fn handle_event(&self, event: UdpEvent) -> Option<Registration> {
        match event {
            UdpEvent::Read(conn, mut buffer, result) => {
                if conn.is_closed() {
                    return None;
                }
                let n = match result {
                    Ok(n) => n,
                    Err(ref e) => {
                        debug!("receive from {}: {}", conn.key(), e);
                        self.terminate(&conn);
                        return None;
                    }
                };
                trace!("receive from {}: {} Bytes", conn.key(), n);

                {
                    let mut state = conn.state();
                    let result = state
                        .template
                        .write_udp_response(&mut buffer, n)
                        .and_then(|len| self.send_buffer(buffer, len));
                    if let Err(ref e) = result {
                        warn!("send {} to device: {}", conn.key(), e);
                    }
                    state.last_active = Instant::now();
                    state.bytes_read += n;
                }

                Some(self.read(conn))
            }
            UdpEvent::Closed(conn) => {
                trace!("release {}", conn.key());
                None
            }
        }
    }

    fn read(&self, conn: Arc<UdpConnection>) -> Registration {
        let mut buffer = self.pool.acquire();
        Box::pin(async move {
            let result = tokio::select! {
                result = conn.socket().recv(&mut buffer[UDP_PAYLOAD_OFFSET..]) => Some(result),
                _ = conn.closed() => None,
            };
            match result {
                Some(result) => UdpEvent::Read(conn, buffer, result),
                None => UdpEvent::Closed(conn),
            }
        })
    }

    fn register(&self, registration: Registration) -> io::Result<()> {
        self.registration_tx
            .send(registration)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "multiplexer stopped"))
    }

    fn send_buffer(&self, mut buffer: PooledBuffer, n: usize) -> io::Result<()> {
        buffer.truncate(n);
        trace!("send to device: {} Bytes", n);
        self.device_tx
            .send(buffer)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device writer stopped"))
    }

    fn terminate(&self, conn: &Arc<UdpConnection>) {
        conn.close();
        self.table.close_if(&conn.key(), |v| Arc::ptr_eq(v, conn));
        let state = conn.state();
        debug!(
            "close {} ({} Bytes sent, {} Bytes received)",
            conn.key(),
            state.bytes_written,
            state.bytes_read
        );
    }
}

/// Represents the multiplexer of the outbound UDP sockets.
pub struct UdpMultiplexer {
    relay: Arc<UdpRelay>,
    registrations: UnboundedReceiver<Registration>,
}

impl UdpMultiplexer {
    /// Runs the multiplexer until the relay stops.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut pending: FuturesUnordered<Registration> = FuturesUnordered::new();
        loop {
            tokio::select! {
                registration = self.registrations.recv() => match registration {
                    Some(registration) => pending.push(registration),
                    None => break,
                },
                Some(event) = pending.next(), if !pending.is_empty() => {
                    if let Some(registration) = self.relay.handle_event(event) {
                        pending.push(registration);
                    }
                }
                _ = wait_stop(&mut stop) => break,
            }
        }
        trace!("UDP multiplexer stopped");
    }
}

#[cfg(test)]
const SRC: &str = "10.0.0.2:40000";

#[cfg(test)]
struct Harness {
    relay: Arc<UdpRelay>,
    device_rx: UnboundedReceiver<PooledBuffer>,
    stop_tx: watch::Sender<bool>,
}

#[cfg(test)]
impl Harness {
    fn new(config: RelayConfig, proxy: ForwardProxy) -> Harness {
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (relay, multiplexer) = UdpRelay::new(
            &config,
            BufferPool::new(config.mtu),
            device_tx,
            Arc::new(crate::proxy::NoProtect),
            Arc::new(proxy),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(multiplexer.run(stop_rx));

        Harness {
            relay,
            device_rx,
            stop_tx,
        }
    }

    async fn datagram(&self, src: &str, dst: SocketAddrV4, payload: &[u8]) {
        let packet = Packet::new_udp(src.parse().unwrap(), dst, payload).unwrap();
        self.relay.handle(packet).await.unwrap();
    }
}

#[cfg(test)]
impl Drop for Harness {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

#[cfg(test)]
async fn bind() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };

    (socket, addr)
}

#[tokio::test]
async fn udp_relay_echo() {
    use std::time::Duration;
    use tokio::time;

    let (server, dst) = bind().await;
    let mut harness = Harness::new(RelayConfig::default(), ForwardProxy::default());

    harness.datagram(SRC, dst, b"ping").await;
    let mut buf = [0u8; 64];
    let (n, peer) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    // Same flow reuses the socket
    harness.datagram(SRC, dst, b"again").await;
    let (n, second) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"again");
    assert_eq!(peer, second);
    assert_eq!(harness.relay.table().len(), 1);

    server.send_to(b"pong", peer).await.unwrap();
    let buffer = time::timeout(Duration::from_secs(5), harness.device_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let packet = Packet::parse(buffer.to_vec()).unwrap();
    assert!(packet.is_udp());
    assert_eq!(packet.src(), dst);
    assert_eq!(packet.dst(), SRC.parse::<SocketAddrV4>().unwrap());
    assert_eq!(packet.payload(), b"pong");
}

#[tokio::test]
async fn udp_relay_flow_per_key() {
    let (server, dst) = bind().await;
    let (other, other_dst) = bind().await;
    let harness = Harness::new(RelayConfig::default(), ForwardProxy::default());

    harness.datagram(SRC, dst, b"a").await;
    harness.datagram("10.0.0.2:40001", dst, b"b").await;
    harness.datagram(SRC, other_dst, b"c").await;
    assert_eq!(harness.relay.table().len(), 3);

    let mut buf = [0u8; 64];
    let (_, first) = server.recv_from(&mut buf).await.unwrap();
    let (_, second) = server.recv_from(&mut buf).await.unwrap();
    assert_ne!(first, second);
    let (n, _) = other.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"c");
}

#[tokio::test]
async fn udp_relay_bounded_by_capacity() {
    use std::time::Duration;
    use tokio::time;

    let (server, dst) = bind().await;
    let config = RelayConfig {
        capacity: 2,
        ..RelayConfig::default()
    };
    let harness = Harness::new(config, ForwardProxy::default());

    let mut peers = Vec::new();
    let mut buf = [0u8; 64];
    for port in 40000..40003u16 {
        let src = format!("10.0.0.2:{}", port);
        harness.datagram(&src, dst, b"x").await;
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();
        peers.push(peer);
    }
    assert_eq!(harness.relay.table().len(), 2);
    assert!(!harness.relay.table().contains(&FlowKey::new(dst, 40000)));

    // The socket of the evicted flow is released, so its port can be bound again
    let port = peers[0].port();
    let mut rebound = None;
    for _ in 0..500 {
        if let Ok(socket) = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await {
            rebound = Some(socket);
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rebound.is_some());

    // The sockets of the remaining flows are still open
    for peer in &peers[1..] {
        let taken = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, peer.port())).await;
        assert!(taken.is_err());
    }
}

#[tokio::test]
async fn udp_relay_forward_proxy() {
    use std::time::Duration;
    use tokio::time;

    let (upstream, upstream_addr) = bind().await;
    let (_server, dst) = bind().await;
    let harness = Harness::new(
        RelayConfig::default(),
        ForwardProxy::with_proxy(dst.port(), upstream_addr),
    );

    harness.datagram(SRC, dst, b"proxied").await;
    let mut buf = [0u8; 64];
    let (n, _) = time::timeout(Duration::from_secs(5), upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"proxied");
}

#[tokio::test]
async fn udp_relay_close_all() {
    let (_server, dst) = bind().await;
    let harness = Harness::new(RelayConfig::default(), ForwardProxy::default());

    harness.datagram(SRC, dst, b"a").await;
    let conn = harness.relay.table().values().remove(0);
    assert_eq!(harness.relay.close_all(), 1);
    assert!(conn.is_closed());
    assert!(harness.relay.table().is_empty());
}
