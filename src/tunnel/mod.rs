//! Support for pumping packets between the virtual interface and the relay engines.

use log::{error, trace, warn};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time;

use crate::packet::Packet;
use crate::pool::{BufferPool, PooledBuffer};
use crate::relay::wait_stop;
use crate::stat::Traffic;

/// Represents the wait time after an empty read from the device.
const EMPTY_READ_WAIT: u64 = 10;

/// Trait for a virtual network interface exchanging whole IPv4 datagrams.
pub trait Device: Send + Sync + 'static {
    /// Receives a datagram into the buffer, returns its length.
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Sends a datagram, returns the number of bytes written.
    fn send<'a>(&'a self, buf: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a;
}

impl Device for tun_rs::AsyncDevice {
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        tun_rs::AsyncDevice::recv(self, buf)
    }

    fn send<'a>(&'a self, buf: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        tun_rs::AsyncDevice::send(self, buf)
    }
}

/// Represents the queues of the relay engines fed by the device.
#[derive(Clone, Debug)]
pub struct Demux {
    /// The queue of the TCP engine.
    pub tcp: UnboundedSender<Packet<PooledBuffer>>,
    /// The queue of the UDP engine.
    pub udp: UnboundedSender<Packet<PooledBuffer>>,
}

impl Demux {
    /// Routes a datagram read from the device to its engine. Unparseable datagrams are
    /// dropped.
    pub fn route(&self, buffer: PooledBuffer) {
        let packet = match Packet::parse(buffer) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("drop packet from device: {}", e);
                return;
            }
        };
        trace!("receive from device: {} ({} Bytes)", packet, packet.len());

        let queue = if packet.is_tcp() { &self.tcp } else { &self.udp };
        if queue.send(packet).is_err() {
            trace!("drop packet from device: engine stopped");
        }
    }
}

/// Reads datagrams from the device and routes them to the engines until the relay stops.
/// A fatal device error requests the relay-wide stop.
pub async fn read_loop<D: Device>(
    device: Arc<D>,
    pool: Arc<BufferPool>,
    demux: Demux,
    traffic: Traffic,
    mut stop: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
) -> io::Result<()> {
    loop {
        let mut buffer = pool.acquire();
        let result = tokio::select! {
            result = device.recv(&mut buffer[..]) => result,
            _ = wait_stop(&mut stop) => break,
        };

        match result {
            Ok(0) => {
                tokio::select! {
                    _ = time::sleep(Duration::from_millis(EMPTY_READ_WAIT)) => {},
                    _ = wait_stop(&mut stop) => break,
                }
            }
            Ok(n) => {
                traffic.add(n);
                buffer.truncate(n);
                demux.route(buffer);
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                continue
            }
            Err(e) => {
                error!("receive from device: {}", e);
                stop_tx.send_replace(true);
                return Err(e);
            }
        }
    }
    trace!("device reader stopped");

    Ok(())
}

/// Writes the packets completed by the engines to the device until the relay stops, then
/// flushes the packets still queued.
pub async fn write_loop<D: Device>(
    device: Arc<D>,
    mut rx: UnboundedReceiver<PooledBuffer>,
    traffic: Traffic,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let buffer = tokio::select! {
            buffer = rx.recv() => match buffer {
                Some(buffer) => buffer,
                None => break,
            },
            _ = wait_stop(&mut stop) => {
                while let Ok(buffer) = rx.try_recv() {
                    write(device.as_ref(), buffer, &traffic).await;
                }
                break;
            }
        };
        write(device.as_ref(), buffer, &traffic).await;
    }
    trace!("device writer stopped");
}

async fn write<D: Device>(device: &D, buffer: PooledBuffer, traffic: &Traffic) {
    match device.send(&buffer[..]).await {
        Ok(n) => {
            trace!("send to device: {} Bytes", n);
            traffic.add(n);
        }
        Err(e) => warn!("send to device: {}", e),
    }
}

/// Represents an in-memory `Device` fed and drained through channels.
#[cfg(test)]
pub(crate) struct MemoryDevice {
    inbound: tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>,
    outbound: UnboundedSender<Vec<u8>>,
}

#[cfg(test)]
impl MemoryDevice {
    /// Creates a new `MemoryDevice`, returns it with the sender of the datagrams it reads
    /// and the receiver of the datagrams written to it.
    pub(crate) fn new() -> (
        Arc<MemoryDevice>,
        UnboundedSender<Vec<u8>>,
        UnboundedReceiver<Vec<u8>>,
    ) {
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let device = MemoryDevice {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            outbound: outbound_tx,
        };

        (Arc::new(device), inbound_tx, outbound_rx)
    }
}

#[cfg(test)]
impl Device for MemoryDevice {
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move {
            match self.inbound.lock().await.recv().await {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(datagram.len())
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed")),
            }
        }
    }

    fn send<'a>(&'a self, buf: &'a [u8]) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move {
            self.outbound
                .send(buf.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;
            Ok(buf.len())
        }
    }
}

#[tokio::test]
async fn tunnel_route() {
    use pnet::packet::tcp::TcpFlags;
    use tokio::sync::mpsc;

    let (device, inbound, _outbound) = MemoryDevice::new();
    let pool = BufferPool::new(1500);
    let (tcp_tx, mut tcp_rx) = mpsc::unbounded_channel();
    let (udp_tx, mut udp_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let traffic = Traffic::new();

    let reader = tokio::spawn(read_loop(
        device,
        Arc::clone(&pool),
        Demux {
            tcp: tcp_tx,
            udp: udp_tx,
        },
        traffic.clone(),
        stop_rx,
        Arc::clone(&stop_tx),
    ));

    let src = "10.0.0.2:50000".parse().unwrap();
    let dst = "93.184.216.34:80".parse().unwrap();
    let syn = Packet::new_tcp(src, dst, TcpFlags::SYN, 1, 0, &[]).unwrap();
    let query = Packet::new_udp(src, "8.8.8.8:53".parse().unwrap(), b"query").unwrap();
    inbound.send(vec![0x60; 40]).unwrap();
    inbound.send(syn.as_bytes().to_vec()).unwrap();
    inbound.send(query.as_bytes().to_vec()).unwrap();

    let packet = tcp_rx.recv().await.unwrap();
    assert!(packet.tcp().unwrap().is_syn());
    assert_eq!(packet.dst(), dst);
    let packet = udp_rx.recv().await.unwrap();
    assert_eq!(packet.payload(), b"query");
    assert_eq!(traffic.count(), 3);

    stop_tx.send_replace(true);
    reader.await.unwrap().unwrap();
}

#[tokio::test]
async fn tunnel_write_flushes_on_stop() {
    use tokio::sync::mpsc;

    let (device, _inbound, mut outbound) = MemoryDevice::new();
    let pool = BufferPool::new(64);
    let (tx, rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);
    let traffic = Traffic::new();

    for i in 0..3u8 {
        let mut buffer = pool.acquire();
        buffer.truncate(4);
        buffer[0] = i;
        tx.send(buffer).unwrap();
    }
    stop_tx.send_replace(true);
    write_loop(device, rx, traffic.clone(), stop_rx).await;

    // Queued packets are either written before the stop is seen or flushed after it
    let mut written = Vec::new();
    while let Ok(datagram) = outbound.try_recv() {
        written.push(datagram[0]);
    }
    assert_eq!(written, vec![0, 1, 2]);
    assert_eq!(traffic.size(), 12);
    assert_eq!(pool.available(), 3);
}

#[tokio::test]
async fn tunnel_device_error_stops_relay() {
    use tokio::sync::mpsc;

    let (device, inbound, _outbound) = MemoryDevice::new();
    let (tcp_tx, _tcp_rx) = mpsc::unbounded_channel();
    let (udp_tx, _udp_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let mut observer = stop_tx.subscribe();

    drop(inbound);
    let result = read_loop(
        device,
        BufferPool::new(1500),
        Demux {
            tcp: tcp_tx,
            udp: udp_tx,
        },
        Traffic::new(),
        stop_rx,
        Arc::clone(&stop_tx),
    )
    .await;
    assert!(result.is_err());
    assert!(*observer.borrow_and_update());
}
