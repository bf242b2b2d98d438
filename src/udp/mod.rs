//! Support for tracking UDP connections.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use crate::cache::{Closer, ConnectionTable, FlowKey};
use crate::packet::Indicator;

/// Represents the mutable state of an UDP connection.
#[derive(Debug)]
pub struct UdpState {
    /// The template of the responses, addressed from the destination to the device.
    pub template: Indicator,
    /// The time of the last activity of the connection.
    pub last_active: Instant,
    /// The bytes read from the outbound socket.
    pub bytes_read: usize,
    /// The bytes written to the outbound socket.
    pub bytes_written: usize,
}

/// Represents an UDP connection, a connected outbound socket per flow.
#[derive(Debug)]
pub struct UdpConnection {
    key: FlowKey,
    socket: Arc<UdpSocket>,
    closer: Closer,
    state: Mutex<UdpState>,
}

impl UdpConnection {
    /// Creates a new `UdpConnection`. `template` must already be addressed from the
    /// destination to the device.
    pub fn new(key: FlowKey, socket: UdpSocket, template: Indicator) -> Arc<UdpConnection> {
        Arc::new(UdpConnection {
            key,
            socket: Arc::new(socket),
            closer: Closer::new(),
            state: Mutex::new(UdpState {
                template,
                last_active: Instant::now(),
                bytes_read: 0,
                bytes_written: 0,
            }),
        })
    }

    /// Returns the key of the connection.
    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Returns the outbound socket.
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Locks and returns the state of the connection.
    pub fn state(&self) -> MutexGuard<UdpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the connection, waking the tasks waiting on it.
    pub fn close(&self) -> bool {
        self.closer.close()
    }

    /// Returns if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        self.closer.closed().await
    }

    /// Returns if the connection is idle for longer than `idle`. A connection in use is
    /// never evictable.
    pub fn can_evict_early(&self, idle: Duration) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.last_active.elapsed() > idle,
            Err(_) => false,
        }
    }
}

/// Represents the table of UDP connections.
pub type UdpTable = ConnectionTable<FlowKey, Arc<UdpConnection>>;

/// Creates a new `UdpTable` which closes the connections leaving it.
pub fn new_table(capacity: usize, idle: Duration) -> UdpTable {
    ConnectionTable::new(
        capacity,
        |_, conn: &Arc<UdpConnection>| {
            conn.close();
        },
        move |conn: &Arc<UdpConnection>| conn.can_evict_early(idle),
    )
}

#[tokio::test]
async fn udp_table_evicts_idle() {
    use std::net::{Ipv4Addr, SocketAddrV4};

    let table = new_table(2, Duration::from_secs(60));
    let mut conns = Vec::new();
    for port in [53u16, 123, 443] {
        let dst = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), port);
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000);
        let mut template = Indicator::new_udp(src, dst);
        template.swap_source_and_destination();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        conns.push(UdpConnection::new(
            FlowKey::new(dst, 40000),
            socket,
            template,
        ));
    }

    table.put(conns[0].key(), Arc::clone(&conns[0]));
    table.put(conns[1].key(), Arc::clone(&conns[1]));
    conns[1].state().last_active = Instant::now() - Duration::from_secs(61);

    table.put(conns[2].key(), Arc::clone(&conns[2]));
    assert!(conns[1].is_closed());
    assert!(!conns[0].is_closed());
    assert!(table.contains(&conns[0].key()));
    assert!(!table.contains(&conns[1].key()));
}
