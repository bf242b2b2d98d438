//! Support for protecting outbound sockets and forwarding to an upstream proxy.

use log::debug;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Trait for excluding a socket from the capture of the virtual interface. Every outbound
/// socket is protected before it connects.
pub trait Protect: Send + Sync {
    /// Protects the socket.
    fn protect(&self, fd: RawFd) -> io::Result<()>;
}

/// Represents a `Protect` which does nothing, for hosts whose routing already excludes the
/// relay's own traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProtect;

impl Protect for NoProtect {
    fn protect(&self, _: RawFd) -> io::Result<()> {
        Ok(())
    }
}

/// Represents a `Protect` which marks sockets with `SO_MARK` so a policy routing rule can
/// steer them around the virtual interface.
#[cfg(target_os = "linux")]
#[derive(Clone, Copy, Debug)]
pub struct FwmarkProtect {
    mark: u32,
}

#[cfg(target_os = "linux")]
impl FwmarkProtect {
    /// Creates a new `FwmarkProtect`.
    pub fn new(mark: u32) -> FwmarkProtect {
        FwmarkProtect { mark }
    }

    /// Returns the mark.
    pub fn mark(&self) -> u32 {
        self.mark
    }
}

#[cfg(target_os = "linux")]
impl Protect for FwmarkProtect {
    fn protect(&self, fd: RawFd) -> io::Result<()> {
        let mark = self.mark as libc::c_int;
        // SAFETY: `fd` is an open socket and the option value outlives the call.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

/// Represents an optional upstream forwarding proxy. Flows to the proxied port are sent to
/// the proxy while it is set and available, every other flow goes to its own destination.
#[derive(Debug)]
pub struct ForwardProxy {
    port: u16,
    addr: RwLock<Option<SocketAddrV4>>,
    available: AtomicBool,
}

impl ForwardProxy {
    /// Creates a new `ForwardProxy` for the proxied port, with no proxy set.
    pub fn new(port: u16) -> ForwardProxy {
        ForwardProxy {
            port,
            addr: RwLock::new(None),
            available: AtomicBool::new(false),
        }
    }

    /// Creates a new `ForwardProxy` for the proxied port pointing at the proxy, available.
    pub fn with_proxy(port: u16, addr: SocketAddrV4) -> ForwardProxy {
        let proxy = ForwardProxy::new(port);
        proxy.set(Some(addr));
        proxy.set_available(true);

        proxy
    }

    /// Sets or unsets the proxy address.
    pub fn set(&self, addr: Option<SocketAddrV4>) {
        match self.addr.write() {
            Ok(mut current) => *current = addr,
            Err(e) => *e.into_inner() = addr,
        }
        debug!("set forwarding proxy to {}", DisplayAddr(addr));
    }

    /// Sets the availability of the proxy.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Returns if the proxy is available.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Returns the proxy address.
    pub fn addr(&self) -> Option<SocketAddrV4> {
        match self.addr.read() {
            Ok(addr) => *addr,
            Err(e) => *e.into_inner(),
        }
    }

    /// Returns the proxied port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the address the flow to the destination should connect to.
    pub fn resolve(&self, dst: SocketAddrV4) -> SocketAddrV4 {
        if dst.port() != self.port || !self.is_available() {
            return dst;
        }

        self.addr().unwrap_or(dst)
    }
}

impl Default for ForwardProxy {
    fn default() -> ForwardProxy {
        ForwardProxy::new(80)
    }
}

struct DisplayAddr(Option<SocketAddrV4>);

impl Display for DisplayAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "none"),
        }
    }
}

#[test]
fn forward_proxy_resolve() {
    let dst: SocketAddrV4 = "93.184.216.34:80".parse().unwrap();
    let other: SocketAddrV4 = "93.184.216.34:443".parse().unwrap();
    let upstream: SocketAddrV4 = "10.1.1.1:8080".parse().unwrap();

    let proxy = ForwardProxy::default();
    assert_eq!(proxy.resolve(dst), dst);

    proxy.set(Some(upstream));
    // Not available yet
    assert_eq!(proxy.resolve(dst), dst);

    proxy.set_available(true);
    assert_eq!(proxy.resolve(dst), upstream);
    assert_eq!(proxy.resolve(other), other);

    proxy.set(None);
    assert_eq!(proxy.resolve(dst), dst);
}

#[test]
fn no_protect() {
    assert!(NoProtect.protect(0).is_ok());
}
