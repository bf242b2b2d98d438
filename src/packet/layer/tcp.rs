//! Support for serializing and deserializing the TCP layer.

use super::ipv4::Ipv4;
use super::{Layer, LayerKind, LayerKinds};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpPacket};
use std::clone::Clone;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::mem;
use std::net::Ipv4Addr;

/// Represents the window advertised in the sent segments.
pub const WINDOW: u16 = u16::MAX;

/// Represents a TCP packet.
#[derive(Clone, Debug)]
pub struct Tcp {
    layer: tcp::Tcp,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

impl Tcp {
    /// Creates a `Tcp` with the given flags.
    pub fn new(src: u16, dst: u16, flags: u8, sequence: u32, acknowledgement: u32) -> Tcp {
        let d_tcp = tcp::Tcp {
            source: src,
            destination: dst,
            sequence,
            acknowledgement,
            data_offset: 5,
            reserved: 0,
            flags,
            window: WINDOW,
            checksum: 0,
            urgent_ptr: 0,
            options: vec![],
            payload: vec![],
        };
        Tcp::from(d_tcp)
    }

    /// Creates a `Tcp` according to the given `Tcp`.
    pub fn from(tcp: tcp::Tcp) -> Tcp {
        Tcp {
            layer: tcp,
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Creates a `Tcp` according to the given TCP packet and the `Ipv4`. Options are not
    /// kept.
    pub fn parse(packet: &TcpPacket, ipv4: &Ipv4) -> Tcp {
        let d_tcp = tcp::Tcp {
            source: packet.get_source(),
            destination: packet.get_destination(),
            sequence: packet.get_sequence(),
            acknowledgement: packet.get_acknowledgement(),
            data_offset: 5,
            reserved: 0,
            flags: packet.get_flags(),
            window: packet.get_window(),
            checksum: packet.get_checksum(),
            urgent_ptr: packet.get_urgent_ptr(),
            options: vec![],
            payload: vec![],
        };
        let mut tcp = Tcp::from(d_tcp);
        tcp.set_ipv4_layer(ipv4);

        tcp
    }

    /// Returns the minimum of the layer when converted into a byte-array.
    pub fn minimum_len() -> usize {
        20
    }

    /// Sets the source and destination IP address for the layer with the given `Ipv4`.
    pub fn set_ipv4_layer(&mut self, ipv4: &Ipv4) {
        self.src = ipv4.src();
        self.dst = ipv4.dst();
    }

    /// Returns the source IP address of the layer.
    pub fn src_ip_addr(&self) -> Ipv4Addr {
        self.src
    }

    /// Returns the destination IP address of the layer.
    pub fn dst_ip_addr(&self) -> Ipv4Addr {
        self.dst
    }

    /// Returns the source of the layer.
    pub fn src(&self) -> u16 {
        self.layer.source
    }

    /// Returns the destination of the layer.
    pub fn dst(&self) -> u16 {
        self.layer.destination
    }

    /// Returns the sequence of the layer.
    pub fn sequence(&self) -> u32 {
        self.layer.sequence
    }

    /// Returns the acknowledgement of the layer.
    pub fn acknowledgement(&self) -> u32 {
        self.layer.acknowledgement
    }

    /// Returns the flags of the layer.
    pub fn flags(&self) -> u8 {
        self.layer.flags
    }

    /// Returns the string represents the flags of the layer.
    pub fn flag_string(&self) -> String {
        let mut flags = String::from("[");
        if self.is_syn() {
            flags += "S";
        }
        if self.is_rst() {
            flags += "R";
        }
        if self.is_fin() {
            flags += "F";
        }
        if self.is_psh() {
            flags += "P";
        }
        if self.is_ack() {
            flags += ".";
        }
        flags += "]";

        flags
    }

    /// Returns the window size of the layer.
    pub fn window(&self) -> u16 {
        self.layer.window
    }

    /// Returns if the layer is a TCP acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.layer.flags & TcpFlags::ACK != 0
    }

    /// Returns if the layer is a TCP reset.
    pub fn is_rst(&self) -> bool {
        self.layer.flags & TcpFlags::RST != 0
    }

    /// Returns if the layer is a TCP synchronization.
    pub fn is_syn(&self) -> bool {
        self.layer.flags & TcpFlags::SYN != 0
    }

    /// Returns if the layer is a TCP finish.
    pub fn is_fin(&self) -> bool {
        self.layer.flags & TcpFlags::FIN != 0
    }

    /// Returns if the layer is a TCP push.
    pub fn is_psh(&self) -> bool {
        self.layer.flags & TcpFlags::PSH != 0
    }

    /// Swaps the source and the destination of the layer, both ports and addresses.
    pub fn swap(&mut self) {
        mem::swap(&mut self.layer.source, &mut self.layer.destination);
        mem::swap(&mut self.src, &mut self.dst);
    }

    /// Sets the flags, the sequence and the acknowledgement of the layer.
    pub fn set_control(&mut self, flags: u8, sequence: u32, acknowledgement: u32) {
        self.layer.flags = flags;
        self.layer.sequence = sequence;
        self.layer.acknowledgement = acknowledgement;
        self.layer.window = WINDOW;
    }
}

impl Display for Tcp {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} {}",
            LayerKinds::Tcp,
            self.layer.source,
            self.layer.destination,
            self.flag_string()
        )
    }
}

impl Layer for Tcp {
    fn kind(&self) -> LayerKind {
        LayerKinds::Tcp
    }

    fn len(&self) -> usize {
        TcpPacket::packet_size(&self.layer)
    }

    fn serialize(&self, buffer: &mut [u8], n: usize) -> io::Result<usize> {
        if buffer.len() < n {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer too small"));
        }
        let mut packet = MutableTcpPacket::new(&mut buffer[..n])
            .ok_or_else(|| io::Error::new(io::ErrorKind::WriteZero, "buffer too small"))?;

        packet.populate(&self.layer);

        // Fix length
        let header_length = self.len();
        packet.set_data_offset((header_length / 4) as u8);

        // Compute checksum over the header and the staged payload
        let checksum = tcp::ipv4_checksum(
            &packet.to_immutable(),
            &self.src_ip_addr(),
            &self.dst_ip_addr(),
        );
        packet.set_checksum(checksum);

        Ok(header_length)
    }

    fn serialize_with_payload(
        &self,
        buffer: &mut [u8],
        payload: &[u8],
        n: usize,
    ) -> io::Result<usize> {
        let header_length = self.len();
        if buffer.len() < header_length + payload.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer too small"));
        }

        // Copy payload
        buffer[header_length..header_length + payload.len()].copy_from_slice(payload);

        self.serialize(buffer, n)?;

        Ok(header_length + payload.len())
    }
}

#[test]
fn tcp_serialize_with_payload() {
    let mut tcp = Tcp::new(80, 50000, TcpFlags::PSH | TcpFlags::ACK, 1000, 2000);
    let ipv4 = Ipv4::new(
        0,
        LayerKinds::Tcp,
        Ipv4Addr::new(93, 184, 216, 34),
        Ipv4Addr::new(10, 0, 0, 2),
    )
    .unwrap();
    tcp.set_ipv4_layer(&ipv4);

    let mut buffer = vec![0u8; 64];
    let n = tcp.serialize_with_payload(&mut buffer, b"hello", 25).unwrap();
    assert_eq!(n, 25);

    let packet = TcpPacket::new(&buffer[..25]).unwrap();
    assert_eq!(packet.get_source(), 80);
    assert_eq!(packet.get_destination(), 50000);
    assert_eq!(packet.get_sequence(), 1000);
    assert_eq!(packet.get_acknowledgement(), 2000);
    assert_eq!(packet.get_window(), WINDOW);
    assert_eq!(packet.get_data_offset(), 5);
    assert_eq!(
        packet.get_checksum(),
        tcp::ipv4_checksum(
            &packet,
            &Ipv4Addr::new(93, 184, 216, 34),
            &Ipv4Addr::new(10, 0, 0, 2)
        )
    );

    let parsed = Tcp::parse(&packet, &ipv4);
    assert!(parsed.is_ack());
    assert!(parsed.is_psh());
    assert!(!parsed.is_syn());
    assert_eq!(parsed.flag_string(), "[P.]");
}

#[test]
fn tcp_swap() {
    let mut tcp = Tcp::new(50000, 80, TcpFlags::SYN, 1, 0);
    let ipv4 = Ipv4::new(
        0,
        LayerKinds::Tcp,
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(93, 184, 216, 34),
    )
    .unwrap();
    tcp.set_ipv4_layer(&ipv4);
    tcp.swap();
    assert_eq!(tcp.src(), 80);
    assert_eq!(tcp.dst(), 50000);
    assert_eq!(tcp.src_ip_addr(), Ipv4Addr::new(93, 184, 216, 34));
    assert_eq!(tcp.dst_ip_addr(), Ipv4Addr::new(10, 0, 0, 2));
}
