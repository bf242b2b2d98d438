//! Support for relaying TCP flows by emulating the remote end of each connection.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, trace, warn};
use pnet::packet::tcp::TcpFlags;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time;

use super::{wait_stop, RelayConfig};
use crate::cache::FlowKey;
use crate::http::{BodySink, Direction, HttpInspector};
use crate::packet::layer::tcp::Tcp;
use crate::packet::{Packet, TCP_PAYLOAD_OFFSET};
use crate::pool::{BufferPool, PooledBuffer};
use crate::proxy::{ForwardProxy, Protect};
use crate::tcp::{self, Segment, TcpConnection, TcpState, TcpStatus, TcpTable};

/// Represents the send and receive buffer size of outbound sockets.
const SOCKET_BUFFER_SIZE: u32 = 65535;

type Registration = BoxFuture<'static, TcpEvent>;

enum TcpEvent {
    Connected(Arc<TcpConnection>, io::Result<TcpStream>),
    Read(Arc<TcpConnection>, OwnedReadHalf, PooledBuffer, io::Result<usize>),
    Closed(Arc<TcpConnection>),
}

/// Represents the TCP engine. Segments from the device are handled one at a time by the
/// dispatcher and their data is written by a writer task per connection, while the outbound
/// sockets are read by the `TcpMultiplexer`.
pub struct TcpRelay {
    table: TcpTable,
    pool: Arc<BufferPool>,
    device_tx: UnboundedSender<PooledBuffer>,
    registration_tx: UnboundedSender<Registration>,
    protect: Arc<dyn Protect>,
    proxy: Arc<ForwardProxy>,
    sink: Option<Arc<dyn BodySink>>,
    eof_idle: Duration,
    write_timeout: Duration,
    inspect_ports: Vec<u16>,
}

impl TcpRelay {
    /// Creates a new `TcpRelay` with its multiplexer. Packets for the device are queued to
    /// `device_tx`.
    pub fn new(
        config: &RelayConfig,
        pool: Arc<BufferPool>,
        device_tx: UnboundedSender<PooledBuffer>,
        protect: Arc<dyn Protect>,
        proxy: Arc<ForwardProxy>,
        sink: Option<Arc<dyn BodySink>>,
    ) -> (Arc<TcpRelay>, TcpMultiplexer) {
        let (registration_tx, registrations) = mpsc::unbounded_channel();
        let relay = Arc::new(TcpRelay {
            table: tcp::new_table(config.capacity, config.tcp_idle),
            pool,
            device_tx,
            registration_tx,
            protect,
            proxy,
            sink,
            eof_idle: config.eof_idle,
            write_timeout: config.write_timeout,
            inspect_ports: config.inspect_ports.clone(),
        });
        let multiplexer = TcpMultiplexer {
            relay: Arc::clone(&relay),
            registrations,
        };

        (relay, multiplexer)
    }

    /// Returns the connection table.
    pub fn table(&self) -> &TcpTable {
        &self.table
    }

    /// Closes every connection, returns the number of connections closed.
    pub fn close_all(&self) -> usize {
        self.table.close_all()
    }

    /// Handles the segments queued by the device until the relay stops.
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
                warn!("handle TCP: {}", e);
            }
        }
        trace!("TCP dispatcher stopped");
    }

    /// Handles a segment from the device. Data and FINs are queued to the writer of the
    /// connection and acknowledged once they are written to the outbound socket.
    pub async fn handle<B: AsRef<[u8]>>(&self, packet: Packet<B>) -> io::Result<()> {
        let tcp = match packet.tcp() {
            Some(tcp) => tcp.clone(),
            None => return Ok(()),
        };
        let key = FlowKey::new(packet.dst(), packet.src().port());

        match self.table.get(&key) {
            Some(conn) => self.handle_segment(conn, &packet, &tcp).await,
            None => {
                if tcp.is_syn() && !tcp.is_ack() && !tcp.is_rst() {
                    self.open(key, packet, &tcp)
                } else {
                    trace!("ignore {} of unknown {}", tcp.flag_string(), key);
                    Ok(())
                }
            }
        }
    }

    fn open<B: AsRef<[u8]>>(&self, key: FlowKey, packet: Packet<B>, tcp: &Tcp) -> io::Result<()> {
        let mut template = packet.into_indicator();
        template.swap_source_and_destination();

        let socket = match self.new_socket() {
            Ok(socket) => socket,
            Err(e) => {
                let mut buffer = self.pool.acquire();
                let n = template.write_tcp_response(
                    &mut buffer,
                    TcpFlags::RST | TcpFlags::ACK,
                    0,
                    tcp.sequence().wrapping_add(1),
                    0,
                )?;
                self.send_buffer(buffer, n)?;
                return Err(e);
            }
        };

        let inspector = match self.sink {
            Some(_) if self.inspect_ports.contains(&key.dst().port()) => Some(HttpInspector::new()),
            _ => None,
        };
        let conn = TcpConnection::new(key, template, rand::random(), tcp.sequence(), inspector);
        self.table.put(key, Arc::clone(&conn));

        let target = self.proxy.resolve(key.dst());
        debug!("connect {} -> {}", key, target);
        self.register(Box::pin(async move {
            let result = tokio::select! {
                result = socket.connect(SocketAddr::V4(target)) => Some(result),
                _ = conn.closed() => None,
            };
            match result {
                Some(result) => TcpEvent::Connected(conn, result),
                None => TcpEvent::Closed(conn),
            }
        }))
    }

    fn new_socket(&self) -> io::Result<TcpSocket> {
        let socket = TcpSocket::new_v4()?;
        self.protect.protect(socket.as_raw_fd())?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;

        Ok(socket)
    }

    async fn handle_segment<B: AsRef<[u8]>>(
        &self,
        conn: Arc<TcpConnection>,
        packet: &Packet<B>,
        tcp: &Tcp,
    ) -> io::Result<()> {
        let mut state = conn.state().lock().await;
        if conn.is_closed() {
            return Ok(());
        }
        state.touch();
        if tcp.is_ack() {
            state.their_acknowledgement = tcp.acknowledgement();
        }
        trace!("{} of {} in {}", tcp.flag_string(), conn.key(), state.status);

        if tcp.is_rst() {
            self.terminate(&conn, &mut state);
            return Ok(());
        }

        let status = state.status;
        if tcp.is_syn() {
            match status {
                // Retransmitted SYN
                TcpStatus::SynSent | TcpStatus::SynReceived => {
                    state.acknowledgement = tcp.sequence().wrapping_add(1);
                }
                _ => self.reset(&conn, &mut state),
            }
            return Ok(());
        }
        if !tcp.is_fin() && !tcp.is_ack() {
            return Ok(());
        }
        if status == TcpStatus::SynSent {
            self.reset(&conn, &mut state);
            return Ok(());
        }
        if status == TcpStatus::SynReceived && tcp.is_ack() {
            state.status = TcpStatus::Established;
            debug!("establish {}", conn.key());
        }

        let payload = packet.payload();
        // A bare ACK only matters while waiting for the last acknowledgement
        if payload.is_empty() && !tcp.is_fin() && status != TcpStatus::LastAck {
            return Ok(());
        }
        let segment = Segment {
            sequence: tcp.sequence(),
            payload: payload.to_vec(),
            fin: tcp.is_fin(),
        };
        let result = match state.writer {
            Some(ref writer) => writer
                .send(segment)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped")),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")),
        };
        if let Err(e) = result {
            self.reset(&conn, &mut state);
            return Err(e);
        }

        Ok(())
    }

    /// Writes the queued segments of a connection to its outbound socket in order. The
    /// connection is only locked once a write completes.
    async fn run_writer(
        self: Arc<Self>,
        conn: Arc<TcpConnection>,
        mut writer: OwnedWriteHalf,
        mut rx: UnboundedReceiver<Segment>,
    ) {
        loop {
            let segment = tokio::select! {
                segment = rx.recv() => match segment {
                    Some(segment) => segment,
                    None => break,
                },
                _ = conn.closed() => break,
            };
            let result = if segment.payload.is_empty() {
                Ok(())
            } else {
                let write = time::timeout(self.write_timeout, writer.write_all(&segment.payload));
                tokio::select! {
                    result = write => match result {
                        Ok(result) => result,
                        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
                    },
                    _ = conn.closed() => break,
                }
            };

            let mut state = conn.state().lock().await;
            if conn.is_closed() {
                break;
            }
            if let Err(ref e) = result {
                debug!("send to {}: {}", conn.key(), e);
                self.reset(&conn, &mut state);
                break;
            }
            if let Err(ref e) = self.complete(&conn, &mut state, segment) {
                warn!("acknowledge {}: {}", conn.key(), e);
                self.terminate(&conn, &mut state);
                break;
            }
        }
        trace!("release writer of {}", conn.key());
    }

    /// Acknowledges a segment once it is written to the outbound socket. The connection is
    /// removed on the last acknowledgement.
    fn complete(
        &self,
        conn: &Arc<TcpConnection>,
        state: &mut TcpState,
        segment: Segment,
    ) -> io::Result<()> {
        if !segment.payload.is_empty() {
            trace!("send to {}: {} Bytes", conn.key(), segment.payload.len());
            state.bytes_written += segment.payload.len();
            self.inspect(conn, state, Direction::Request, &segment.payload);
        }

        if segment.fin {
            state.acknowledgement = segment.end();
            if state.status == TcpStatus::LastAck {
                self.send(state, TcpFlags::ACK)?;
                self.terminate(conn, state);
            } else {
                self.send(state, TcpFlags::FIN | TcpFlags::ACK)?;
                state.sequence = state.sequence.wrapping_add(1);
                state.status = TcpStatus::LastAck;
            }
        } else if !segment.payload.is_empty() {
            state.acknowledgement = segment.end();
            self.send(state, TcpFlags::ACK)?;
        } else if state.status == TcpStatus::LastAck
            && state.their_acknowledgement == state.sequence
        {
            self.terminate(conn, state);
        }

        Ok(())
    }

    fn inspect(
        &self,
        conn: &Arc<TcpConnection>,
        state: &mut TcpState,
        direction: Direction,
        data: &[u8],
    ) {
        if let (Some(inspector), Some(sink)) = (state.inspector.as_mut(), self.sink.as_ref()) {
            match inspector.push(direction, data) {
                Ok(bodies) => {
                    for body in bodies {
                        sink.deliver(conn.key(), direction, body);
                    }
                }
                Err(ref e) => debug!("inspect {} of {}: {}", direction, conn.key(), e),
            }
        }
    }

    async fn handle_event(self: Arc<Self>, event: TcpEvent) {
        let registration = match event {
            TcpEvent::Connected(conn, result) => self.on_connected(conn, result).await,
            TcpEvent::Read(conn, reader, buffer, result) => {
                self.on_read(conn, reader, buffer, result).await
            }
            TcpEvent::Closed(conn) => {
                trace!("release {}", conn.key());
                None
            }
        };
        if let Some(registration) = registration {
            if let Err(ref e) = self.register(registration) {
                debug!("register: {}", e);
            }
        }
    }

    async fn on_connected(
        self: &Arc<Self>,
        conn: Arc<TcpConnection>,
        result: io::Result<TcpStream>,
    ) -> Option<Registration> {
        let mut state = conn.state().lock().await;
        if conn.is_closed() || state.status != TcpStatus::SynSent {
            return None;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(ref e) => {
                debug!("connect {}: {}", conn.key(), e);
                state.sequence = 0;
                self.reset(&conn, &mut state);
                return None;
            }
        };
        if let Err(ref e) = self.send(&state, TcpFlags::SYN | TcpFlags::ACK) {
            warn!("handshake {}: {}", conn.key(), e);
            self.terminate(&conn, &mut state);
            return None;
        }
        state.sequence = state.sequence.wrapping_add(1);
        state.status = TcpStatus::SynReceived;
        state.touch();

        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        state.writer = Some(writer_tx);
        tokio::spawn(Arc::clone(self).run_writer(Arc::clone(&conn), writer, writer_rx));

        Some(self.read(Arc::clone(&conn), reader))
    }

    async fn on_read(
        &self,
        conn: Arc<TcpConnection>,
        reader: OwnedReadHalf,
        mut buffer: PooledBuffer,
        result: io::Result<usize>,
    ) -> Option<Registration> {
        let mut state = conn.state().lock().await;
        if conn.is_closed() || state.status == TcpStatus::LastAck {
            return None;
        }

        match result {
            Ok(0) => {
                if state.last_read.elapsed() > self.eof_idle {
                    debug!("close idle {}", conn.key());
                    self.terminate(&conn, &mut state);
                    return None;
                }
                if let Err(ref e) = self.send(&state, TcpFlags::FIN | TcpFlags::ACK) {
                    warn!("close {}: {}", conn.key(), e);
                    self.terminate(&conn, &mut state);
                    return None;
                }
                state.sequence = state.sequence.wrapping_add(1);
                state.status = TcpStatus::LastAck;

                None
            }
            Ok(n) => {
                trace!("receive from {}: {} Bytes", conn.key(), n);
                self.inspect(
                    &conn,
                    &mut state,
                    Direction::Response,
                    &buffer[TCP_PAYLOAD_OFFSET..TCP_PAYLOAD_OFFSET + n],
                );

                let result = state
                    .template
                    .write_tcp_response(
                        &mut buffer,
                        TcpFlags::PSH | TcpFlags::ACK,
                        state.sequence,
                        state.acknowledgement,
                        n,
                    )
                    .and_then(|len| self.send_buffer(buffer, len));
                if let Err(ref e) = result {
                    warn!("send {} to device: {}", conn.key(), e);
                    self.terminate(&conn, &mut state);
                    return None;
                }
                state.sequence = state.sequence.wrapping_add(n as u32);
                state.bytes_read += n;
                state.last_read = Instant::now();
                state.touch();

                Some(self.read(Arc::clone(&conn), reader))
            }
            Err(ref e) => {
                debug!("receive from {}: {}", conn.key(), e);
                self.reset(&conn, &mut state);
                None
            }
        }
    }

    fn read(&self, conn: Arc<TcpConnection>, mut reader: OwnedReadHalf) -> Registration {
        let mut buffer = self.pool.acquire();
        Box::pin(async move {
            let result = tokio::select! {
                result = reader.read(&mut buffer[TCP_PAYLOAD_OFFSET..]) => Some(result),
                _ = conn.closed() => None,
            };
            match result {
                Some(result) => TcpEvent::Read(conn, reader, buffer, result),
                None => TcpEvent::Closed(conn),
            }
        })
    }

    fn register(&self, registration: Registration) -> io::Result<()> {
        self.registration_tx
            .send(registration)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "multiplexer stopped"))
    }

    fn send(&self, state: &TcpState, flags: u8) -> io::Result<()> {
        let mut buffer = self.pool.acquire();
        let n = state.template.write_tcp_response(
            &mut buffer,
            flags,
            state.sequence,
            state.acknowledgement,
            0,
        )?;

        self.send_buffer(buffer, n)
    }

    fn send_buffer(&self, mut buffer: PooledBuffer, n: usize) -> io::Result<()> {
        buffer.truncate(n);
        trace!("send to device: {} Bytes", n);
        self.device_tx
            .send(buffer)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device writer stopped"))
    }

    /// Sends a RST to the device unless the connection is already closing, then closes the
    /// connection.
    fn reset(&self, conn: &Arc<TcpConnection>, state: &mut TcpState) {
        if !state.is_closing() {
            if let Err(ref e) = self.send(state, TcpFlags::RST | TcpFlags::ACK) {
                warn!("reset {}: {}", conn.key(), e);
            }
        }
        self.terminate(conn, state);
    }

    fn terminate(&self, conn: &Arc<TcpConnection>, state: &mut TcpState) {
        state.writer = None;
        conn.close();
        self.table.close_if(&conn.key(), |v| Arc::ptr_eq(v, conn));
        debug!(
            "close {} ({} Bytes sent, {} Bytes received)",
            conn.key(),
            state.bytes_written,
            state.bytes_read
        );
    }
}

/// Represents the multiplexer of the outbound TCP sockets. It drives the pending connects
/// and reads of every connection and hands each completion to a task of its own.
pub struct TcpMultiplexer {
    relay: Arc<TcpRelay>,
    registrations: UnboundedReceiver<Registration>,
}

impl TcpMultiplexer {
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
                    tokio::spawn(Arc::clone(&self.relay).handle_event(event));
                }
                _ = wait_stop(&mut stop) => break,
            }
        }
        trace!("TCP multiplexer stopped");
    }
}

#[cfg(test)]
use crate::packet::Indicator;
#[cfg(test)]
use std::net::SocketAddrV4;
#[cfg(test)]
use tokio::net::TcpListener;

#[cfg(test)]
const SRC: &str = "10.0.0.2:50000";
#[cfg(test)]
const ISN: u32 = 1000;

#[cfg(test)]
struct Harness {
    relay: Arc<TcpRelay>,
    device_rx: UnboundedReceiver<PooledBuffer>,
    stop_tx: watch::Sender<bool>,
}

#[cfg(test)]
impl Harness {
    fn new(config: RelayConfig, sink: Option<Arc<dyn BodySink>>) -> Harness {
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (relay, multiplexer) = TcpRelay::new(
            &config,
            BufferPool::new(config.mtu),
            device_tx,
            Arc::new(crate::proxy::NoProtect),
            Arc::new(ForwardProxy::default()),
            sink,
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(multiplexer.run(stop_rx));

        Harness {
            relay,
            device_rx,
            stop_tx,
        }
    }

    async fn segment(&self, dst: SocketAddrV4, flags: u8, seq: u32, ack: u32, payload: &[u8]) {
        let packet = Packet::new_tcp(SRC.parse().unwrap(), dst, flags, seq, ack, payload).unwrap();
        self.relay.handle(packet).await.unwrap();
    }

    /// Sends full segments of zeros from the device, starting right after the handshake.
    async fn flood(&self, dst: SocketAddrV4, ack: u32, count: usize) {
        let data = [0u8; 1400];
        for i in 0..count {
            let seq = (ISN + 1).wrapping_add((i * data.len()) as u32);
            self.segment(dst, TcpFlags::PSH | TcpFlags::ACK, seq, ack, &data)
                .await;
        }
    }

    /// Returns the next packet to the device sent from `dst`, skipping the others.
    async fn next(&mut self, dst: SocketAddrV4) -> (Indicator, Vec<u8>) {
        loop {
            let buffer = time::timeout(Duration::from_secs(5), self.device_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let packet = Packet::parse(buffer.to_vec()).unwrap();
            if packet.src() != dst {
                continue;
            }
            let payload = packet.payload().to_vec();

            return (packet.into_indicator(), payload);
        }
    }

    /// Performs the handshake, returns the sequence of the relay after it.
    async fn handshake(&mut self, dst: SocketAddrV4) -> u32 {
        self.segment(dst, TcpFlags::SYN, ISN, 0, &[]).await;
        let (syn_ack, _) = self.next(dst).await;
        let tcp = syn_ack.tcp().unwrap();
        assert!(tcp.is_syn() && tcp.is_ack());
        assert_eq!(tcp.acknowledgement(), ISN + 1);
        assert_eq!(syn_ack.dst(), SRC.parse::<SocketAddrV4>().unwrap());

        let seq = tcp.sequence().wrapping_add(1);
        self.segment(dst, TcpFlags::ACK, ISN + 1, seq, &[]).await;

        seq
    }
}

#[cfg(test)]
impl Drop for Harness {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

#[cfg(test)]
fn flow_key(dst: SocketAddrV4) -> FlowKey {
    FlowKey::new(dst, SRC.parse::<SocketAddrV4>().unwrap().port())
}

#[cfg(test)]
async fn listen() -> (TcpListener, SocketAddrV4) {
    listen_with_recv_buffer(None).await
}

/// Listens with a small receive buffer, so a server which never reads stalls its peer soon.
#[cfg(test)]
async fn listen_small() -> (TcpListener, SocketAddrV4) {
    listen_with_recv_buffer(Some(4096)).await
}

#[cfg(test)]
async fn listen_with_recv_buffer(size: Option<u32>) -> (TcpListener, SocketAddrV4) {
    let socket = TcpSocket::new_v4().unwrap();
    if let Some(size) = size {
        socket.set_recv_buffer_size(size).unwrap();
    }
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(16).unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };

    (listener, addr)
}

#[cfg(test)]
async fn status(relay: &TcpRelay, dst: SocketAddrV4) -> Option<TcpStatus> {
    match relay.table().get(&flow_key(dst)) {
        Some(conn) => Some(conn.state().lock().await.status),
        None => None,
    }
}

/// Waits until the connection to `dst` leaves the table, returns if it did.
#[cfg(test)]
async fn removed(relay: &TcpRelay, dst: SocketAddrV4) -> bool {
    for _ in 0..500 {
        if !relay.table().contains(&flow_key(dst)) {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }

    false
}

#[tokio::test]
async fn tcp_relay_session() {
    let (listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    let seq = harness.handshake(dst).await;
    let (mut server, _) = listener.accept().await.unwrap();
    assert_eq!(status(&harness.relay, dst).await, Some(TcpStatus::Established));

    harness
        .segment(dst, TcpFlags::PSH | TcpFlags::ACK, ISN + 1, seq, b"hello")
        .await;
    let mut received = [0u8; 5];
    server.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"hello");
    let (ack, _) = harness.next(dst).await;
    assert!(ack.tcp().unwrap().is_ack());
    assert_eq!(ack.tcp().unwrap().acknowledgement(), ISN + 6);

    server.write_all(b"world").await.unwrap();
    let (data, payload) = harness.next(dst).await;
    let tcp = data.tcp().unwrap();
    assert!(tcp.is_psh() && tcp.is_ack());
    assert_eq!(tcp.sequence(), seq);
    assert_eq!(payload, b"world");

    // Device closes first
    harness
        .segment(dst, TcpFlags::FIN | TcpFlags::ACK, ISN + 6, seq + 5, &[])
        .await;
    let (fin, _) = harness.next(dst).await;
    let tcp = fin.tcp().unwrap();
    assert!(tcp.is_fin() && tcp.is_ack());
    assert_eq!(tcp.sequence(), seq + 5);
    assert_eq!(tcp.acknowledgement(), ISN + 7);
    assert_eq!(status(&harness.relay, dst).await, Some(TcpStatus::LastAck));

    harness
        .segment(dst, TcpFlags::ACK, ISN + 7, seq + 6, &[])
        .await;
    assert!(removed(&harness.relay, dst).await);
}

#[tokio::test]
async fn tcp_relay_stalled_flow_isolated() {
    let (stalled_listener, stalled) = listen_small().await;
    let (listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    let stalled_seq = harness.handshake(stalled).await;
    let (_stalled_server, _) = stalled_listener.accept().await.unwrap();
    let seq = harness.handshake(dst).await;
    let (mut server, _) = listener.accept().await.unwrap();

    // The server of the stalled flow never reads, its writes block until they time out
    harness.flood(stalled, stalled_seq, 500).await;
    time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    server.write_all(b"hello").await.unwrap();
    let (data, payload) = time::timeout(Duration::from_secs(2), harness.next(dst))
        .await
        .unwrap();
    assert!(data.tcp().unwrap().is_psh());
    assert_eq!(payload, b"hello");

    harness
        .segment(dst, TcpFlags::PSH | TcpFlags::ACK, ISN + 1, seq + 5, b"ping")
        .await;
    let mut received = [0u8; 4];
    time::timeout(Duration::from_secs(2), server.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"ping");
    let (ack, _) = time::timeout(Duration::from_secs(2), harness.next(dst))
        .await
        .unwrap();
    assert_eq!(ack.tcp().unwrap().acknowledgement(), ISN + 5);
    assert!(start.elapsed() < Duration::from_secs(2));

    assert_eq!(
        status(&harness.relay, stalled).await,
        Some(TcpStatus::Established)
    );
}

#[tokio::test]
async fn tcp_relay_write_timeout() {
    let (listener, dst) = listen_small().await;
    let config = RelayConfig {
        write_timeout: Duration::from_millis(200),
        ..RelayConfig::default()
    };
    let mut harness = Harness::new(config, None);

    let seq = harness.handshake(dst).await;
    let (_server, _) = listener.accept().await.unwrap();
    harness.flood(dst, seq, 500).await;

    // The segments written before the timeout are acknowledged first
    loop {
        let (packet, _) = harness.next(dst).await;
        let tcp = packet.tcp().unwrap();
        if tcp.is_rst() {
            assert_eq!(tcp.sequence(), seq);
            break;
        }
        assert!(tcp.is_ack());
    }
    assert!(removed(&harness.relay, dst).await);
}

#[tokio::test]
async fn tcp_relay_reset_by_network() {
    let (listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    let seq = harness.handshake(dst).await;
    let (server, _) = listener.accept().await.unwrap();
    // A zero linger makes the close send a RST
    #[allow(deprecated)]
    server.set_linger(Some(Duration::ZERO)).unwrap();
    drop(server);

    let (rst, _) = harness.next(dst).await;
    let tcp = rst.tcp().unwrap();
    assert!(tcp.is_rst() && tcp.is_ack());
    assert_eq!(tcp.sequence(), seq);
    assert_eq!(tcp.acknowledgement(), ISN + 1);
    assert!(removed(&harness.relay, dst).await);
}

#[tokio::test]
async fn tcp_relay_remote_eof() {
    let (listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    let seq = harness.handshake(dst).await;
    let (server, _) = listener.accept().await.unwrap();
    drop(server);

    let (fin, _) = harness.next(dst).await;
    let tcp = fin.tcp().unwrap();
    assert!(tcp.is_fin() && tcp.is_ack());
    assert_eq!(tcp.sequence(), seq);
    assert_eq!(status(&harness.relay, dst).await, Some(TcpStatus::LastAck));

    // The device acknowledges with its own FIN
    harness
        .segment(dst, TcpFlags::FIN | TcpFlags::ACK, ISN + 1, seq + 1, &[])
        .await;
    let (ack, _) = harness.next(dst).await;
    assert!(ack.tcp().unwrap().is_ack());
    assert_eq!(ack.tcp().unwrap().acknowledgement(), ISN + 2);
    assert!(removed(&harness.relay, dst).await);
}

#[tokio::test]
async fn tcp_relay_remote_eof_after_idle() {
    let (listener, dst) = listen().await;
    let config = RelayConfig {
        eof_idle: Duration::from_millis(0),
        ..RelayConfig::default()
    };
    let mut harness = Harness::new(config, None);

    harness.handshake(dst).await;
    let (server, _) = listener.accept().await.unwrap();
    time::sleep(Duration::from_millis(20)).await;
    drop(server);

    // Closed without a FIN to the device
    assert!(removed(&harness.relay, dst).await);
    assert!(harness.device_rx.try_recv().is_err());
}

#[tokio::test]
async fn tcp_relay_connect_refused() {
    let (listener, dst) = listen().await;
    drop(listener);
    let mut harness = Harness::new(RelayConfig::default(), None);

    harness.segment(dst, TcpFlags::SYN, ISN, 0, &[]).await;
    let (rst, _) = harness.next(dst).await;
    let tcp = rst.tcp().unwrap();
    assert!(tcp.is_rst());
    assert_eq!(tcp.sequence(), 0);
    assert_eq!(tcp.acknowledgement(), ISN + 1);
    assert!(harness.relay.table().is_empty());
}

#[tokio::test]
async fn tcp_relay_ack_while_connecting() {
    let (_listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    // A connection whose connect is still pending
    let key = flow_key(dst);
    let mut template = Indicator::new_tcp(SRC.parse().unwrap(), dst, TcpFlags::SYN, ISN, 0);
    template.swap_source_and_destination();
    let conn = TcpConnection::new(key, template, 5000, ISN, None);
    harness.relay.table().put(key, Arc::clone(&conn));

    harness.segment(dst, TcpFlags::ACK, ISN + 1, 1, &[]).await;
    let (rst, _) = harness.next(dst).await;
    let tcp = rst.tcp().unwrap();
    assert!(tcp.is_rst() && tcp.is_ack());
    assert_eq!(tcp.sequence(), 5000);
    assert_eq!(tcp.acknowledgement(), ISN + 1);
    assert!(conn.is_closed());
    assert!(harness.relay.table().is_empty());
}

#[tokio::test]
async fn tcp_relay_syn_while_established() {
    let (listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    let seq = harness.handshake(dst).await;
    let (mut server, _) = listener.accept().await.unwrap();
    harness.segment(dst, TcpFlags::SYN, ISN + 1, 0, &[]).await;

    let (rst, _) = harness.next(dst).await;
    let tcp = rst.tcp().unwrap();
    assert!(tcp.is_rst());
    assert_eq!(tcp.sequence(), seq);
    assert!(harness.relay.table().is_empty());

    let mut buf = [0u8; 1];
    let n = time::timeout(Duration::from_secs(5), server.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn tcp_relay_reset_by_device() {
    let (listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    let seq = harness.handshake(dst).await;
    let (mut server, _) = listener.accept().await.unwrap();
    harness.segment(dst, TcpFlags::RST, ISN + 1, seq, &[]).await;
    assert!(harness.relay.table().is_empty());

    // The outbound socket is released
    let mut buf = [0u8; 1];
    let n = time::timeout(Duration::from_secs(5), server.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn tcp_relay_eviction_closes_socket() {
    let (evicted_listener, evicted) = listen().await;
    let (listener, dst) = listen().await;
    let config = RelayConfig {
        capacity: 1,
        ..RelayConfig::default()
    };
    let mut harness = Harness::new(config, None);

    harness.handshake(evicted).await;
    let (mut evicted_server, _) = evicted_listener.accept().await.unwrap();
    harness.handshake(dst).await;
    let (_server, _) = listener.accept().await.unwrap();
    assert_eq!(harness.relay.table().len(), 1);
    assert_eq!(status(&harness.relay, evicted).await, None);

    // The peer of the evicted connection sees the end of stream
    let mut buf = [0u8; 1];
    let n = time::timeout(Duration::from_secs(5), evicted_server.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn tcp_relay_ignores_unknown() {
    let (_listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    harness.segment(dst, TcpFlags::ACK, ISN, 1, b"stray").await;
    assert!(harness.relay.table().is_empty());
    assert!(harness.device_rx.try_recv().is_err());
}

#[tokio::test]
async fn tcp_relay_retransmitted_syn() {
    let (listener, dst) = listen().await;
    let mut harness = Harness::new(RelayConfig::default(), None);

    harness.segment(dst, TcpFlags::SYN, ISN, 0, &[]).await;
    harness.segment(dst, TcpFlags::SYN, ISN, 0, &[]).await;
    let (syn_ack, _) = harness.next(dst).await;
    let tcp = syn_ack.tcp().unwrap();
    assert!(tcp.is_syn() && tcp.is_ack());
    assert_eq!(harness.relay.table().len(), 1);
    let seq = tcp.sequence().wrapping_add(1);
    let (mut server, _) = listener.accept().await.unwrap();

    harness.segment(dst, TcpFlags::ACK, ISN + 1, seq, &[]).await;
    harness
        .segment(dst, TcpFlags::PSH | TcpFlags::ACK, ISN + 1, seq, b"data")
        .await;
    let (ack, _) = harness.next(dst).await;
    assert_eq!(ack.tcp().unwrap().acknowledgement(), ISN + 5);
    let mut received = [0u8; 4];
    server.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"data");

    harness
        .segment(dst, TcpFlags::FIN | TcpFlags::ACK, ISN + 5, seq, &[])
        .await;
    let (fin, _) = harness.next(dst).await;
    assert!(fin.tcp().unwrap().is_fin());
    harness
        .segment(dst, TcpFlags::ACK, ISN + 6, seq + 1, &[])
        .await;

    assert!(removed(&harness.relay, dst).await);
    assert!(harness.device_rx.try_recv().is_err());
}

#[cfg(test)]
struct CollectSink(std::sync::Mutex<Vec<(Direction, Vec<u8>)>>);

#[cfg(test)]
impl BodySink for CollectSink {
    fn deliver(&self, _: FlowKey, direction: Direction, body: Vec<u8>) {
        self.0.lock().unwrap().push((direction, body));
    }
}

#[tokio::test]
async fn tcp_relay_inspect() {
    let (listener, dst) = listen().await;
    let sink = Arc::new(CollectSink(std::sync::Mutex::new(Vec::new())));
    let config = RelayConfig {
        inspect_ports: vec![dst.port()],
        ..RelayConfig::default()
    };
    let mut harness = Harness::new(config, Some(sink.clone()));

    let seq = harness.handshake(dst).await;
    let (mut server, _) = listener.accept().await.unwrap();
    let request = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nping";
    harness
        .segment(dst, TcpFlags::PSH | TcpFlags::ACK, ISN + 1, seq, request)
        .await;
    let _ = harness.next(dst).await;
    let mut received = vec![0u8; request.len()];
    server.read_exact(&mut received).await.unwrap();

    server
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
        .await
        .unwrap();
    let _ = harness.next(dst).await;

    let bodies = sink.0.lock().unwrap().clone();
    assert_eq!(
        bodies,
        vec![
            (Direction::Request, b"ping".to_vec()),
            (Direction::Response, b"pong".to_vec())
        ]
    );
}
