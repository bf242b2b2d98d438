use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use structopt::StructOpt;

use crate::relay::RelayConfig;

/// Represents the minimum MTU of the device.
const MIN_MTU: usize = 576;

#[derive(StructOpt, Clone, Debug)]
#[structopt(about = "Relay traffic captured by a TUN device to ordinary sockets.")]
pub struct Flags {
    #[structopt(long, short, help = "Prints verbose information")]
    pub verbose: bool,
    #[structopt(long = "vv", help = "Prints verbose information with trace")]
    pub vverbose: bool,
    #[structopt(
        long = "interface",
        short = "i",
        help = "Name of the TUN device",
        value_name = "NAME",
        default_value = "tun2net"
    )]
    pub inter: String,
    #[structopt(
        long = "address",
        short = "a",
        help = "Address and prefix of the TUN device",
        value_name = "CIDR",
        default_value = "10.6.0.1/24"
    )]
    pub addr: String,
    #[structopt(
        long,
        short,
        help = "MTU of the TUN device",
        value_name = "VALUE",
        default_value = "1500"
    )]
    pub mtu: usize,
    #[structopt(
        long,
        short,
        help = "Capacity of each connection table",
        value_name = "VALUE",
        default_value = "500"
    )]
    pub capacity: usize,
    #[structopt(
        long = "tcp-idle",
        help = "Idle time before a TCP connection may be evicted",
        value_name = "SECONDS",
        default_value = "120"
    )]
    pub tcp_idle: u64,
    #[structopt(
        long = "udp-idle",
        help = "Idle time before an UDP connection may be evicted",
        value_name = "SECONDS",
        default_value = "60"
    )]
    pub udp_idle: u64,
    #[structopt(
        long = "eof-idle",
        help = "Time without data after which an end of stream closes silently",
        value_name = "SECONDS",
        default_value = "30"
    )]
    pub eof_idle: u64,
    #[structopt(
        long = "write-timeout",
        help = "Timeout of writing a segment to an outbound socket",
        value_name = "SECONDS",
        default_value = "10"
    )]
    pub write_timeout: u64,
    #[structopt(long, help = "Mark of outbound sockets", value_name = "MARK")]
    pub fwmark: Option<u32>,
    #[structopt(
        long = "forward",
        short = "f",
        help = "Forwarding proxy",
        value_name = "HOST:PORT"
    )]
    pub forward: Option<String>,
    #[structopt(
        long = "forward-port",
        help = "Destination port sent to the forwarding proxy",
        value_name = "PORT",
        default_value = "80"
    )]
    pub forward_port: u16,
    #[structopt(
        long = "inspect",
        help = "Destination ports whose HTTP bodies are reassembled",
        value_name = "PORT"
    )]
    pub inspect: Vec<u16>,
}

#[derive(Clone, Debug)]
pub struct Opts {
    pub inter: String,
    pub network: Ipv4Network,
    pub mtu: usize,
    pub capacity: usize,
    pub tcp_idle: Duration,
    pub udp_idle: Duration,
    pub eof_idle: Duration,
    pub write_timeout: Duration,
    pub fwmark: Option<u32>,
    pub forward: Option<SocketAddrV4>,
    pub forward_port: u16,
    pub inspect: Vec<u16>,
}

impl Opts {
    /// Validates flags and creates a new `Opts`.
    pub fn validate(flags: &Flags) -> Result<Opts, String> {
        if flags.inter.is_empty() {
            return Err(String::from("validate interface: name unspecified"));
        }

        let network = match flags.addr.parse::<Ipv4Network>() {
            Ok(network) => network,
            Err(e) => return Err(format!("validate address {}: {}", flags.addr, e)),
        };
        if network.ip().is_unspecified() {
            return Err(format!(
                "validate address {}: {}",
                flags.addr, "IP address unspecified"
            ));
        }

        if flags.mtu < MIN_MTU || flags.mtu > u16::MAX as usize {
            return Err(format!(
                "validate MTU {}: out of range {}-{}",
                flags.mtu,
                MIN_MTU,
                u16::MAX
            ));
        }
        if flags.capacity == 0 {
            return Err(String::from("validate capacity: must be positive"));
        }

        let forward = match flags.forward {
            Some(ref forward) => Some(resolve(forward)?),
            None => None,
        };

        Ok(Opts {
            inter: flags.inter.clone(),
            network,
            mtu: flags.mtu,
            capacity: flags.capacity,
            tcp_idle: Duration::from_secs(flags.tcp_idle),
            udp_idle: Duration::from_secs(flags.udp_idle),
            eof_idle: Duration::from_secs(flags.eof_idle),
            write_timeout: Duration::from_secs(flags.write_timeout),
            fwmark: flags.fwmark,
            forward,
            forward_port: flags.forward_port,
            inspect: flags.inspect.clone(),
        })
    }

    /// Returns the `RelayConfig` of the options.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            capacity: self.capacity,
            tcp_idle: self.tcp_idle,
            udp_idle: self.udp_idle,
            eof_idle: self.eof_idle,
            write_timeout: self.write_timeout,
            mtu: self.mtu,
            inspect_ports: self.inspect.clone(),
        }
    }
}

/// Resolves `HOST:PORT` into an IPv4 socket address.
fn resolve(s: &str) -> Result<SocketAddrV4, String> {
    let (host, port) = match s.rfind(':') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => return Err(format!("validate forward {}: port unspecified", s)),
    };
    let port = match port.parse::<u16>() {
        Ok(port) => port,
        Err(e) => return Err(format!("validate forward {}: {}", s, e)),
    };

    let ip_addr = match host.parse::<Ipv4Addr>() {
        Ok(ip_addr) => ip_addr,
        Err(_) => {
            let ip_addrs = match dns_lookup::lookup_host(host) {
                Ok(ip_addrs) => ip_addrs,
                Err(e) => return Err(format!("validate forward {}: {}", s, e)),
            };
            match ip_addrs.into_iter().find_map(|ip_addr| match ip_addr {
                IpAddr::V4(ip_addr) => Some(ip_addr),
                IpAddr::V6(_) => None,
            }) {
                Some(ip_addr) => ip_addr,
                None => {
                    return Err(format!(
                        "validate forward {}: {}",
                        s, "no IPv4 address resolved"
                    ))
                }
            }
        }
    };
    if ip_addr.is_unspecified() {
        return Err(format!(
            "validate forward {}: {}",
            s, "IP address unspecified"
        ));
    }

    Ok(SocketAddrV4::new(ip_addr, port))
}

#[cfg(test)]
fn flags(args: &[&str]) -> Flags {
    Flags::from_iter(std::iter::once("tun2net").chain(args.iter().copied()))
}

#[test]
fn opts_validate_default() {
    let opts = Opts::validate(&flags(&[])).unwrap();
    assert_eq!(opts.inter, "tun2net");
    assert_eq!(opts.network.ip(), Ipv4Addr::new(10, 6, 0, 1));
    assert_eq!(opts.network.prefix(), 24);
    assert_eq!(opts.forward, None);

    let config = opts.relay_config();
    let default = RelayConfig::default();
    assert_eq!(config.capacity, default.capacity);
    assert_eq!(config.tcp_idle, default.tcp_idle);
    assert_eq!(config.udp_idle, default.udp_idle);
    assert_eq!(config.eof_idle, default.eof_idle);
    assert_eq!(config.write_timeout, default.write_timeout);
    assert_eq!(config.mtu, default.mtu);
}

#[test]
fn opts_validate_forward() {
    let opts = Opts::validate(&flags(&[
        "-f",
        "192.168.1.1:3128",
        "--forward-port",
        "8080",
        "--inspect",
        "80",
        "--inspect",
        "8080",
    ]))
    .unwrap();
    assert_eq!(opts.forward, Some("192.168.1.1:3128".parse().unwrap()));
    assert_eq!(opts.forward_port, 8080);
    assert_eq!(opts.relay_config().inspect_ports, vec![80, 8080]);
}

#[test]
fn opts_validate_invalid() {
    assert!(Opts::validate(&flags(&["-a", "10.6.0.1"])).is_ok());
    assert!(Opts::validate(&flags(&["-a", "0.0.0.0/24"])).is_err());
    assert!(Opts::validate(&flags(&["-a", "10.6.0.1/33"])).is_err());
    assert!(Opts::validate(&flags(&["-m", "100"])).is_err());
    assert!(Opts::validate(&flags(&["-m", "70000"])).is_err());
    assert!(Opts::validate(&flags(&["-c", "0"])).is_err());
    assert!(Opts::validate(&flags(&["-f", "192.168.1.1"])).is_err());
    assert!(Opts::validate(&flags(&["-f", "192.168.1.1:proxy"])).is_err());
    assert!(Opts::validate(&flags(&["-f", "0.0.0.0:3128"])).is_err());
}
