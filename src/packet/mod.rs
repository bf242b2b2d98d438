//! Support for serializing and deserializing packets.

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{MutableUdpPacket, UdpPacket};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::SocketAddrV4;
use std::ops::Range;

pub mod layer;
use layer::ipv4::Ipv4;
use layer::tcp::Tcp;
use layer::udp::Udp;
use layer::{Layer, LayerKind, LayerKinds, Layers};

/// Represents the offset of the payload in a TCP packet synthesized by the relay.
pub const TCP_PAYLOAD_OFFSET: usize = 40;
/// Represents the offset of the payload in an UDP packet synthesized by the relay.
pub const UDP_PAYLOAD_OFFSET: usize = 28;

/// Represents the reason a buffer is not accepted as a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MalformedPacket {
    /// The buffer is too short to hold the headers.
    TooShort,
    /// The IP version is not 4.
    UnsupportedVersion(u8),
    /// The transport protocol is neither TCP nor UDP.
    UnsupportedProtocol(u8),
    /// The datagram is an IPv4 fragment.
    Fragmented,
    /// A length field is inconsistent with the buffer.
    InvalidLength,
}

impl Display for MalformedPacket {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            MalformedPacket::TooShort => write!(f, "packet too short"),
            MalformedPacket::UnsupportedVersion(version) => {
                write!(f, "unsupported IP version {}", version)
            }
            MalformedPacket::UnsupportedProtocol(protocol) => {
                write!(f, "unsupported protocol {}", protocol)
            }
            MalformedPacket::Fragmented => write!(f, "fragmented datagram"),
            MalformedPacket::InvalidLength => write!(f, "invalid length"),
        }
    }
}

impl Error for MalformedPacket {}

impl From<MalformedPacket> for io::Error {
    fn from(e: MalformedPacket) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Represents a packet indicator, the parsed headers of an IPv4 datagram carrying TCP or
/// UDP. An indicator kept by a connection serves as the template of its responses.
#[derive(Clone, Debug)]
pub struct Indicator {
    network: Ipv4,
    transport: Layers,
}

impl Indicator {
    /// Creates a `Indicator`.
    pub fn new(network: Ipv4, transport: Layers) -> Indicator {
        Indicator { network, transport }
    }

    /// Creates a `Indicator` represents a TCP segment between the given endpoints.
    pub fn new_tcp(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        flags: u8,
        sequence: u32,
        acknowledgement: u32,
    ) -> Indicator {
        let network = new_ipv4(LayerKinds::Tcp, &src, &dst);
        let mut tcp = Tcp::new(src.port(), dst.port(), flags, sequence, acknowledgement);
        tcp.set_ipv4_layer(&network);

        Indicator::new(network, Layers::Tcp(tcp))
    }

    /// Creates a `Indicator` represents an UDP datagram between the given endpoints.
    pub fn new_udp(src: SocketAddrV4, dst: SocketAddrV4) -> Indicator {
        let network = new_ipv4(LayerKinds::Udp, &src, &dst);
        let mut udp = Udp::new(src.port(), dst.port());
        udp.set_ipv4_layer(&network);

        Indicator::new(network, Layers::Udp(udp))
    }

    /// Parses the headers of the given IPv4 datagram, returns the `Indicator` and the range
    /// of the transport payload.
    pub fn parse(bytes: &[u8]) -> Result<(Indicator, Range<usize>), MalformedPacket> {
        if bytes.len() < Ipv4::minimum_len() {
            return Err(MalformedPacket::TooShort);
        }
        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(MalformedPacket::UnsupportedVersion(version));
        }
        let ipv4_packet = Ipv4Packet::new(bytes).ok_or(MalformedPacket::TooShort)?;

        let header_length = ipv4_packet.get_header_length() as usize * 4;
        if header_length < Ipv4::minimum_len() || header_length > bytes.len() {
            return Err(MalformedPacket::InvalidLength);
        }
        let total_length = ipv4_packet.get_total_length() as usize;
        if total_length < header_length || total_length > bytes.len() {
            return Err(MalformedPacket::InvalidLength);
        }
        if ipv4_packet.get_flags() & Ipv4Flags::MoreFragments != 0
            || ipv4_packet.get_fragment_offset() != 0
        {
            return Err(MalformedPacket::Fragmented);
        }

        let network = Ipv4::parse(&ipv4_packet);
        let segment = &bytes[header_length..total_length];
        match ipv4_packet.get_next_level_protocol() {
            IpNextHeaderProtocols::Tcp => {
                let tcp_packet = TcpPacket::new(segment).ok_or(MalformedPacket::TooShort)?;
                let data_offset = tcp_packet.get_data_offset() as usize * 4;
                if data_offset < Tcp::minimum_len() || data_offset > segment.len() {
                    return Err(MalformedPacket::InvalidLength);
                }
                let tcp = Tcp::parse(&tcp_packet, &network);

                Ok((
                    Indicator::new(network, Layers::Tcp(tcp)),
                    header_length + data_offset..total_length,
                ))
            }
            IpNextHeaderProtocols::Udp => {
                let udp_packet = UdpPacket::new(segment).ok_or(MalformedPacket::TooShort)?;
                let length = udp_packet.get_length() as usize;
                if length < Udp::minimum_len() || length > segment.len() {
                    return Err(MalformedPacket::InvalidLength);
                }
                let udp = Udp::parse(&udp_packet, &network);

                Ok((
                    Indicator::new(network, Layers::Udp(udp)),
                    header_length + Udp::minimum_len()..header_length + length,
                ))
            }
            protocol => Err(MalformedPacket::UnsupportedProtocol(protocol.0)),
        }
    }

    /// Returns the brief of the indicator.
    pub fn brief(&self) -> String {
        match &self.transport {
            Layers::Tcp(tcp) => format!(
                "{}: {}:{} -> {}:{} {}",
                tcp.kind(),
                tcp.src_ip_addr(),
                tcp.src(),
                tcp.dst_ip_addr(),
                tcp.dst(),
                tcp.flag_string(),
            ),
            Layers::Udp(udp) => format!(
                "{}: {}:{} -> {}:{}, Length = {}",
                udp.kind(),
                udp.src_ip_addr(),
                udp.src(),
                udp.dst_ip_addr(),
                udp.dst(),
                udp.length()
            ),
        }
    }

    /// Returns the network layer.
    pub fn network(&self) -> &Ipv4 {
        &self.network
    }

    /// Returns the transport layer.
    pub fn transport(&self) -> &Layers {
        &self.transport
    }

    /// Returns the transport layer kind.
    pub fn transport_kind(&self) -> LayerKind {
        self.transport.kind()
    }

    /// Returns the TCP layer.
    pub fn tcp(&self) -> Option<&Tcp> {
        match &self.transport {
            Layers::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    /// Returns the UDP layer.
    pub fn udp(&self) -> Option<&Udp> {
        match &self.transport {
            Layers::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    /// Returns if the indicator carries TCP.
    pub fn is_tcp(&self) -> bool {
        self.transport_kind() == LayerKinds::Tcp
    }

    /// Returns if the indicator carries UDP.
    pub fn is_udp(&self) -> bool {
        self.transport_kind() == LayerKinds::Udp
    }

    /// Returns the source socket address.
    pub fn src(&self) -> SocketAddrV4 {
        let port = match &self.transport {
            Layers::Tcp(tcp) => tcp.src(),
            Layers::Udp(udp) => udp.src(),
        };
        SocketAddrV4::new(self.network.src(), port)
    }

    /// Returns the destination socket address.
    pub fn dst(&self) -> SocketAddrV4 {
        let port = match &self.transport {
            Layers::Tcp(tcp) => tcp.dst(),
            Layers::Udp(udp) => udp.dst(),
        };
        SocketAddrV4::new(self.network.dst(), port)
    }

    /// Swaps the source and the destination of the indicator, both addresses and ports.
    pub fn swap_source_and_destination(&mut self) {
        self.network.swap();
        match &mut self.transport {
            Layers::Tcp(tcp) => tcp.swap(),
            Layers::Udp(udp) => udp.swap(),
        }
    }

    /// Writes a TCP response with the addressing of the indicator into the buffer, in front
    /// of the `payload_len` bytes already staged at `TCP_PAYLOAD_OFFSET`. Returns the length
    /// of the packet.
    pub fn write_tcp_response(
        &self,
        buffer: &mut [u8],
        flags: u8,
        sequence: u32,
        acknowledgement: u32,
        payload_len: usize,
    ) -> io::Result<usize> {
        let mut tcp = match &self.transport {
            Layers::Tcp(tcp) => tcp.clone(),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "not a TCP template",
                ))
            }
        };
        tcp.set_control(flags, sequence, acknowledgement);
        let network = new_ipv4(LayerKinds::Tcp, &self.src(), &self.dst());

        let n = TCP_PAYLOAD_OFFSET + payload_len;
        if buffer.len() < n {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer too small"));
        }
        tcp.serialize(&mut buffer[network.len()..], n - network.len())?;
        network.serialize(buffer, n)?;

        Ok(n)
    }

    /// Writes an UDP response with the addressing of the indicator into the buffer, in front
    /// of the `payload_len` bytes already staged at `UDP_PAYLOAD_OFFSET`. Returns the length
    /// of the packet.
    pub fn write_udp_response(&self, buffer: &mut [u8], payload_len: usize) -> io::Result<usize> {
        let udp = match &self.transport {
            Layers::Udp(udp) => udp.clone(),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "not an UDP template",
                ))
            }
        };
        let network = new_ipv4(LayerKinds::Udp, &self.src(), &self.dst());

        let n = UDP_PAYLOAD_OFFSET + payload_len;
        if buffer.len() < n {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer too small"));
        }
        udp.serialize(&mut buffer[network.len()..], n - network.len())?;
        network.serialize(buffer, n)?;

        Ok(n)
    }

    /// Serializes the indicator with the payload into a byte-array.
    pub fn serialize_with_payload(&self, buffer: &mut [u8], payload: &[u8]) -> io::Result<usize> {
        let n = self.network.len() + self.transport.len() + payload.len();
        if buffer.len() < n {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer too small"));
        }
        let network = new_ipv4(self.transport_kind(), &self.src(), &self.dst());
        self.transport.serialize_with_payload(
            &mut buffer[network.len()..],
            payload,
            n - network.len(),
        )?;
        network.serialize(buffer, n)?;

        Ok(n)
    }
}

impl Display for Indicator {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.brief())
    }
}

fn new_ipv4(kind: LayerKind, src: &SocketAddrV4, dst: &SocketAddrV4) -> Ipv4 {
    match Ipv4::new(0, kind, *src.ip(), *dst.ip()) {
        Some(ipv4) => ipv4,
        // Only TCP and UDP indicators exist
        None => unreachable!(),
    }
}

/// Represents a parsed IPv4 datagram over a byte buffer.
#[derive(Debug)]
pub struct Packet<B = Vec<u8>> {
    buffer: B,
    indicator: Indicator,
    payload: Range<usize>,
}

impl<B: AsRef<[u8]>> Packet<B> {
    /// Parses the buffer into a `Packet`. Bytes past the IPv4 total length are ignored.
    pub fn parse(buffer: B) -> Result<Packet<B>, MalformedPacket> {
        let (indicator, payload) = Indicator::parse(buffer.as_ref())?;

        Ok(Packet {
            buffer,
            indicator,
            payload,
        })
    }

    /// Returns the indicator of the packet.
    pub fn indicator(&self) -> &Indicator {
        &self.indicator
    }

    /// Consumes the packet, returns its indicator and releases the buffer.
    pub fn into_indicator(self) -> Indicator {
        self.indicator
    }

    /// Returns the transport payload of the packet.
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[self.payload.clone()]
    }

    /// Returns the length of the packet.
    pub fn len(&self) -> usize {
        self.indicator.network().total_length() as usize
    }

    /// Returns if the packet carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns the bytes of the packet.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.len()]
    }

    /// Returns if the packet carries TCP.
    pub fn is_tcp(&self) -> bool {
        self.indicator.is_tcp()
    }

    /// Returns if the packet carries UDP.
    pub fn is_udp(&self) -> bool {
        self.indicator.is_udp()
    }

    /// Returns the source socket address.
    pub fn src(&self) -> SocketAddrV4 {
        self.indicator.src()
    }

    /// Returns the destination socket address.
    pub fn dst(&self) -> SocketAddrV4 {
        self.indicator.dst()
    }

    /// Returns the TCP layer.
    pub fn tcp(&self) -> Option<&Tcp> {
        self.indicator.tcp()
    }

    /// Returns the UDP layer.
    pub fn udp(&self) -> Option<&Udp> {
        self.indicator.udp()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Packet<B> {
    /// Swaps the source and the destination of the packet in place. Checksums stay valid
    /// since the one's complement sum does not depend on the order of the words.
    pub fn swap_source_and_destination(&mut self) {
        let header_length = (self.buffer.as_ref()[0] & 0x0f) as usize * 4;
        let len = self.len();
        let bytes = &mut self.buffer.as_mut()[..len];
        let (network, transport) = bytes.split_at_mut(header_length);
        if let Some(mut ipv4_packet) = MutableIpv4Packet::new(network) {
            let src = ipv4_packet.get_source();
            ipv4_packet.set_source(ipv4_packet.get_destination());
            ipv4_packet.set_destination(src);
        }
        match self.indicator.transport() {
            Layers::Tcp(_) => {
                if let Some(mut tcp_packet) = MutableTcpPacket::new(transport) {
                    let src = tcp_packet.get_source();
                    tcp_packet.set_source(tcp_packet.get_destination());
                    tcp_packet.set_destination(src);
                }
            }
            Layers::Udp(_) => {
                if let Some(mut udp_packet) = MutableUdpPacket::new(transport) {
                    let src = udp_packet.get_source();
                    udp_packet.set_source(udp_packet.get_destination());
                    udp_packet.set_destination(src);
                }
            }
        }
        self.indicator.swap_source_and_destination();
    }
}

impl Packet<Vec<u8>> {
    /// Creates a TCP `Packet` between the given endpoints.
    pub fn new_tcp(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        flags: u8,
        sequence: u32,
        acknowledgement: u32,
        payload: &[u8],
    ) -> io::Result<Packet> {
        let indicator = Indicator::new_tcp(src, dst, flags, sequence, acknowledgement);
        let mut buffer = vec![0u8; TCP_PAYLOAD_OFFSET + payload.len()];
        indicator.serialize_with_payload(&mut buffer, payload)?;

        Ok(Packet::parse(buffer)?)
    }

    /// Creates an UDP `Packet` between the given endpoints.
    pub fn new_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> io::Result<Packet> {
        let indicator = Indicator::new_udp(src, dst);
        let mut buffer = vec![0u8; UDP_PAYLOAD_OFFSET + payload.len()];
        indicator.serialize_with_payload(&mut buffer, payload)?;

        Ok(Packet::parse(buffer)?)
    }
}

impl<B> Display for Packet<B> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.indicator)
    }
}

#[cfg(test)]
fn verify_checksums(bytes: &[u8]) {
    use pnet::packet::ipv4;
    use pnet::packet::{tcp, udp, Packet as _};

    let ipv4_packet = Ipv4Packet::new(bytes).unwrap();
    assert_eq!(ipv4_packet.get_checksum(), ipv4::checksum(&ipv4_packet));
    let src = ipv4_packet.get_source();
    let dst = ipv4_packet.get_destination();
    match ipv4_packet.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp_packet = TcpPacket::new(ipv4_packet.payload()).unwrap();
            assert_eq!(
                tcp_packet.get_checksum(),
                tcp::ipv4_checksum(&tcp_packet, &src, &dst)
            );
        }
        IpNextHeaderProtocols::Udp => {
            let udp_packet = UdpPacket::new(ipv4_packet.payload()).unwrap();
            assert_eq!(
                udp_packet.get_checksum(),
                udp::ipv4_checksum(&udp_packet, &src, &dst)
            );
        }
        _ => unreachable!(),
    }
}

#[test]
fn packet_parse_tcp() {
    use pnet::packet::tcp::TcpFlags;

    let src = "10.0.0.2:50000".parse().unwrap();
    let dst = "93.184.216.34:80".parse().unwrap();
    let packet = Packet::new_tcp(src, dst, TcpFlags::PSH | TcpFlags::ACK, 7, 9, b"GET /").unwrap();

    assert!(packet.is_tcp());
    assert!(!packet.is_udp());
    assert_eq!(packet.src(), src);
    assert_eq!(packet.dst(), dst);
    assert_eq!(packet.len(), 45);
    assert_eq!(packet.payload(), b"GET /");
    let tcp = packet.tcp().unwrap();
    assert_eq!(tcp.sequence(), 7);
    assert_eq!(tcp.acknowledgement(), 9);
    assert!(tcp.is_ack());
    assert!(!tcp.is_syn());
    verify_checksums(packet.as_bytes());
}

#[test]
fn packet_parse_ignores_trailing_bytes() {
    let src = "10.0.0.2:40000".parse().unwrap();
    let dst = "8.8.8.8:53".parse().unwrap();
    let packet = Packet::new_udp(src, dst, b"query").unwrap();

    let mut buffer = packet.as_bytes().to_vec();
    buffer.extend_from_slice(&[0xaa; 16]);
    let packet = Packet::parse(buffer).unwrap();
    assert!(packet.is_udp());
    assert_eq!(packet.payload(), b"query");
    assert_eq!(packet.as_bytes().len(), 33);
}

#[test]
fn packet_tcp_response_preserves_addressing() {
    use pnet::packet::tcp::TcpFlags;

    let src = "10.0.0.2:50000".parse().unwrap();
    let dst = "93.184.216.34:443".parse().unwrap();
    let syn = Packet::new_tcp(src, dst, TcpFlags::SYN, 100, 0, &[]).unwrap();

    let mut template = syn.into_indicator();
    template.swap_source_and_destination();

    let mut buffer = vec![0u8; 1500];
    buffer[TCP_PAYLOAD_OFFSET..TCP_PAYLOAD_OFFSET + 4].copy_from_slice(b"data");
    let n = template
        .write_tcp_response(&mut buffer, TcpFlags::PSH | TcpFlags::ACK, 5000, 101, 4)
        .unwrap();
    assert_eq!(n, 44);
    buffer.truncate(n);
    verify_checksums(&buffer);

    let response = Packet::parse(buffer).unwrap();
    assert_eq!(response.src(), dst);
    assert_eq!(response.dst(), src);
    assert_eq!(response.payload(), b"data");
    let tcp = response.tcp().unwrap();
    assert_eq!(tcp.sequence(), 5000);
    assert_eq!(tcp.acknowledgement(), 101);
    assert_eq!(tcp.window(), 65535);
    assert!(tcp.is_psh());
}

#[test]
fn packet_udp_response_preserves_addressing() {
    let src = "10.0.0.2:40000".parse().unwrap();
    let dst = "8.8.8.8:53".parse().unwrap();
    let query = Packet::new_udp(src, dst, b"query").unwrap();

    let mut template = query.into_indicator();
    template.swap_source_and_destination();

    let mut buffer = vec![0u8; 1500];
    buffer[UDP_PAYLOAD_OFFSET..UDP_PAYLOAD_OFFSET + 6].copy_from_slice(b"answer");
    let n = template.write_udp_response(&mut buffer, 6).unwrap();
    assert_eq!(n, 34);
    buffer.truncate(n);
    verify_checksums(&buffer);

    let response = Packet::parse(buffer).unwrap();
    assert_eq!(response.src(), dst);
    assert_eq!(response.dst(), src);
    assert_eq!(response.udp().unwrap().length(), 14);
    assert_eq!(response.payload(), b"answer");
}

#[test]
fn packet_response_kind_mismatch() {
    let src = "10.0.0.2:40000".parse().unwrap();
    let dst = "8.8.8.8:53".parse().unwrap();
    let template = Indicator::new_udp(src, dst);
    let mut buffer = vec![0u8; 64];
    assert!(template.write_tcp_response(&mut buffer, 0, 0, 0, 0).is_err());
}

#[test]
fn packet_swap_in_place() {
    use pnet::packet::tcp::TcpFlags;

    let src = "10.0.0.2:50000".parse().unwrap();
    let dst = "93.184.216.34:80".parse().unwrap();
    let mut packet = Packet::new_tcp(src, dst, TcpFlags::ACK, 1, 2, b"payload").unwrap();
    packet.swap_source_and_destination();
    assert_eq!(packet.src(), dst);
    assert_eq!(packet.dst(), src);
    verify_checksums(packet.as_bytes());

    let reparsed = Packet::parse(packet.as_bytes().to_vec()).unwrap();
    assert_eq!(reparsed.src(), dst);
    assert_eq!(reparsed.dst(), src);
    assert_eq!(reparsed.payload(), b"payload");
}

#[test]
fn packet_malformed() {
    let src = "10.0.0.2:40000".parse().unwrap();
    let dst = "8.8.8.8:53".parse().unwrap();
    let valid = Packet::new_udp(src, dst, b"query").unwrap().as_bytes().to_vec();

    assert_eq!(
        Packet::parse(vec![0x45u8; 10]).unwrap_err(),
        MalformedPacket::TooShort
    );

    let mut v6 = valid.clone();
    v6[0] = 0x65;
    assert_eq!(
        Packet::parse(v6).unwrap_err(),
        MalformedPacket::UnsupportedVersion(6)
    );

    let mut icmp = valid.clone();
    icmp[9] = 1;
    assert_eq!(
        Packet::parse(icmp).unwrap_err(),
        MalformedPacket::UnsupportedProtocol(1)
    );

    let mut fragment = valid.clone();
    fragment[6] = 0x20;
    assert_eq!(
        Packet::parse(fragment).unwrap_err(),
        MalformedPacket::Fragmented
    );

    let mut truncated = valid.clone();
    truncated.truncate(30);
    assert_eq!(
        Packet::parse(truncated).unwrap_err(),
        MalformedPacket::InvalidLength
    );

    let mut short_header = valid.clone();
    short_header[0] = 0x44;
    assert_eq!(
        Packet::parse(short_header).unwrap_err(),
        MalformedPacket::InvalidLength
    );

    let mut udp_length = valid;
    udp_length[25] = 0xff;
    assert_eq!(
        Packet::parse(udp_length).unwrap_err(),
        MalformedPacket::InvalidLength
    );
}
