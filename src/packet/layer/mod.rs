//! Support for serializing and deserializing layers.

use std::clone::Clone;
use std::cmp::{Eq, PartialEq};
use std::fmt::{self, Display, Formatter};
use std::hash::Hash;
use std::io;

pub mod ipv4;
pub mod tcp;
pub mod udp;

/// Represents the kind of the layer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct LayerKind(u8);

impl Display for LayerKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                LayerKinds::Ipv4 => "IPv4",
                LayerKinds::Tcp => "TCP",
                LayerKinds::Udp => "UDP",
                _ => "unknown",
            }
        )
    }
}

#[allow(non_snake_case)]
#[allow(non_upper_case_globals)]
/// Represents all the layer kinds.
pub mod LayerKinds {
    use super::LayerKind;

    /// Represents the layer kind of IPv4.
    pub const Ipv4: LayerKind = LayerKind(0);
    /// Represents the layer kind of TCP.
    pub const Tcp: LayerKind = LayerKind(1);
    /// Represents the layer kind of UDP.
    pub const Udp: LayerKind = LayerKind(2);
}

/// Represents a layer.
#[allow(clippy::len_without_is_empty)]
pub trait Layer: Display {
    /// Returns the kind of the layer.
    fn kind(&self) -> LayerKind;

    /// Returns the length of the layer header when converted into a byte-array.
    fn len(&self) -> usize;

    /// Serializes the layer header into the front of a byte-array whose following bytes
    /// already hold the payload. `n` is the length of the layer including its payload.
    fn serialize(&self, buffer: &mut [u8], n: usize) -> io::Result<usize>;

    /// Serializes the layer into a byte-array with payload.
    fn serialize_with_payload(
        &self,
        buffer: &mut [u8],
        payload: &[u8],
        n: usize,
    ) -> io::Result<usize>;
}

/// Enumeration of transport layers.
#[derive(Clone, Debug)]
pub enum Layers {
    /// Represents the TCP layer.
    Tcp(tcp::Tcp),
    /// Represents the UDP layer.
    Udp(udp::Udp),
}

impl Display for Layers {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Layers::Tcp(ref layer) => layer.fmt(f),
            Layers::Udp(ref layer) => layer.fmt(f),
        }
    }
}

impl Layer for Layers {
    fn kind(&self) -> LayerKind {
        match self {
            Layers::Tcp(ref layer) => layer.kind(),
            Layers::Udp(ref layer) => layer.kind(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Layers::Tcp(ref layer) => layer.len(),
            Layers::Udp(ref layer) => layer.len(),
        }
    }

    fn serialize(&self, buffer: &mut [u8], n: usize) -> io::Result<usize> {
        match self {
            Layers::Tcp(ref layer) => layer.serialize(buffer, n),
            Layers::Udp(ref layer) => layer.serialize(buffer, n),
        }
    }

    fn serialize_with_payload(
        &self,
        buffer: &mut [u8],
        payload: &[u8],
        n: usize,
    ) -> io::Result<usize> {
        match self {
            Layers::Tcp(ref layer) => layer.serialize_with_payload(buffer, payload, n),
            Layers::Udp(ref layer) => layer.serialize_with_payload(buffer, payload, n),
        }
    }
}
