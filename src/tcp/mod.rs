//! Support for tracking TCP connections.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::cache::{Closer, ConnectionTable, FlowKey};
use crate::http::HttpInspector;
use crate::packet::Indicator;

/// Represents the status of an emulated TCP connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TcpStatus {
    /// The outbound socket is connecting.
    SynSent,
    /// The SYN+ACK is sent to the device.
    SynReceived,
    /// The handshake with the device is completed.
    Established,
    /// The device closed its side while the network side is still open.
    CloseWait,
    /// A FIN is sent to the device, waiting for its acknowledgement.
    LastAck,
}

impl Display for TcpStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TcpStatus::SynSent => "SYN_SENT",
                TcpStatus::SynReceived => "SYN_RECEIVED",
                TcpStatus::Established => "ESTABLISHED",
                TcpStatus::CloseWait => "CLOSE_WAIT",
                TcpStatus::LastAck => "LAST_ACK",
            }
        )
    }
}

/// Represents the mutable state of a TCP connection, guarded by the connection's own lock.
#[derive(Debug)]
pub struct TcpState {
    /// The status of the connection.
    pub status: TcpStatus,
    /// The next sequence sent to the device.
    pub sequence: u32,
    /// The acknowledgement sent to the device, the next sequence expected from it.
    pub acknowledgement: u32,
    /// The last acknowledgement received from the device.
    pub their_acknowledgement: u32,
    /// The template of the responses, addressed from the destination to the device.
    pub template: Indicator,
    /// The queue of the writer of the outbound socket, once connected.
    pub writer: Option<UnboundedSender<Segment>>,
    /// The time of the last activity of the connection.
    pub last_active: Instant,
    /// The time of the last successful read from the outbound socket.
    pub last_read: Instant,
    /// The bytes read from the outbound socket.
    pub bytes_read: usize,
    /// The bytes written to the outbound socket.
    pub bytes_written: usize,
    /// The HTTP inspector, if the flow is inspected.
    pub inspector: Option<HttpInspector>,
}

impl TcpState {
    /// Marks the connection active.
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Returns if the connection is half closed or waiting for the last acknowledgement.
    pub fn is_closing(&self) -> bool {
        matches!(self.status, TcpStatus::CloseWait | TcpStatus::LastAck)
    }
}

/// Represents the data and FIN of a segment from the device, queued to the writer of its
/// connection in arrival order.
#[derive(Debug)]
pub struct Segment {
    /// The sequence of the segment.
    pub sequence: u32,
    /// The payload of the segment.
    pub payload: Vec<u8>,
    /// If the segment carries a FIN.
    pub fin: bool,
}

impl Segment {
    /// Returns the sequence following the segment.
    pub fn end(&self) -> u32 {
        let end = self.sequence.wrapping_add(self.payload.len() as u32);
        if self.fin {
            end.wrapping_add(1)
        } else {
            end
        }
    }
}

/// Represents an emulated TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    key: FlowKey,
    closer: Closer,
    state: Mutex<TcpState>,
}

impl TcpConnection {
    /// Creates a new `TcpConnection` in `SYN_SENT` from the device's SYN. `template` must
    /// already be addressed from the destination to the device.
    pub fn new(
        key: FlowKey,
        template: Indicator,
        isn: u32,
        their_sequence: u32,
        inspector: Option<HttpInspector>,
    ) -> Arc<TcpConnection> {
        let now = Instant::now();
        Arc::new(TcpConnection {
            key,
            closer: Closer::new(),
            state: Mutex::new(TcpState {
                status: TcpStatus::SynSent,
                sequence: isn,
                acknowledgement: their_sequence.wrapping_add(1),
                their_acknowledgement: 0,
                template,
                writer: None,
                last_active: now,
                last_read: now,
                bytes_read: 0,
                bytes_written: 0,
                inspector,
            }),
        })
    }

    /// Returns the key of the connection.
    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Returns the state of the connection.
    pub fn state(&self) -> &Mutex<TcpState> {
        &self.state
    }

    /// Closes the connection, waking the tasks waiting on it and releasing the writer queue
    /// unless the state is in use.
    pub fn close(&self) -> bool {
        let first = self.closer.close();
        if let Ok(mut state) = self.state.try_lock() {
            state.writer = None;
        }

        first
    }

    /// Returns if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        self.closer.closed().await
    }

    /// Returns if the connection may be evicted before the least recently used one: it is
    /// closing or idle for longer than `idle`. A connection in use is never evictable.
    pub fn can_evict_early(&self, idle: Duration) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.is_closing() || state.last_active.elapsed() > idle,
            Err(_) => false,
        }
    }
}

/// Represents the table of TCP connections.
pub type TcpTable = ConnectionTable<FlowKey, Arc<TcpConnection>>;

/// Creates a new `TcpTable` which closes the connections leaving it.
pub fn new_table(capacity: usize, idle: Duration) -> TcpTable {
    ConnectionTable::new(
        capacity,
        |_, conn: &Arc<TcpConnection>| {
            conn.close();
        },
        move |conn: &Arc<TcpConnection>| conn.can_evict_early(idle),
    )
}

#[cfg(test)]
fn new_connection(dst_port: u16, src_port: u16) -> Arc<TcpConnection> {
    use pnet::packet::tcp::TcpFlags;
    use std::net::{Ipv4Addr, SocketAddrV4};

    let dst = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), dst_port);
    let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), src_port);
    let mut template = Indicator::new_tcp(src, dst, TcpFlags::SYN, 100, 0);
    template.swap_source_and_destination();

    TcpConnection::new(FlowKey::new(dst, src_port), template, 5000, 100, None)
}

#[tokio::test]
async fn tcp_connection_new() {
    let conn = new_connection(80, 50000);
    let state = conn.state().lock().await;
    assert_eq!(state.status, TcpStatus::SynSent);
    assert_eq!(state.sequence, 5000);
    assert_eq!(state.acknowledgement, 101);
    assert!(state.writer.is_none());
    assert_eq!(format!("{}", conn.key()), "93.184.216.34:80:50000");
}

#[test]
fn segment_end() {
    let data = Segment {
        sequence: 100,
        payload: b"hello".to_vec(),
        fin: false,
    };
    assert_eq!(data.end(), 105);

    let fin = Segment {
        sequence: u32::MAX,
        payload: Vec::new(),
        fin: true,
    };
    assert_eq!(fin.end(), 0);
}

#[tokio::test]
async fn tcp_connection_evictable() {
    let idle = Duration::from_secs(120);
    let conn = new_connection(80, 50000);
    assert!(!conn.can_evict_early(idle));

    conn.state().lock().await.status = TcpStatus::LastAck;
    assert!(conn.can_evict_early(idle));

    {
        let mut state = conn.state().lock().await;
        state.status = TcpStatus::Established;
        state.last_active = Instant::now() - Duration::from_secs(121);
    }
    assert!(conn.can_evict_early(idle));

    // A connection in use is never evictable
    let _state = conn.state().lock().await;
    assert!(!conn.can_evict_early(idle));
}

#[tokio::test]
async fn tcp_table_evicts_closing() {
    let table = new_table(2, Duration::from_secs(120));
    let a = new_connection(80, 1);
    let b = new_connection(80, 2);
    let c = new_connection(80, 3);
    table.put(a.key(), Arc::clone(&a));
    table.put(b.key(), Arc::clone(&b));
    b.state().lock().await.status = TcpStatus::CloseWait;

    let evicted = table.put(c.key(), Arc::clone(&c));
    assert_eq!(evicted.map(|(k, _)| k), Some(b.key()));
    assert!(b.is_closed());
    assert!(!a.is_closed());
    assert_eq!(table.len(), 2);
}

#[tokio::test]
async fn tcp_connection_close_releases_writer() {
    let conn = new_connection(80, 50000);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Segment>();
    conn.state().lock().await.writer = Some(tx);

    assert!(conn.close());
    assert!(!conn.close());
    assert!(conn.state().lock().await.writer.is_none());
    assert!(rx.recv().await.is_none());
}
