use log::{error, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tun_rs::DeviceBuilder;

use lib::http::{BodySink, LogSink};
use lib::proxy::{ForwardProxy, NoProtect, Protect};
use lib::Relay;
use tun2net as lib;

#[tokio::main]
async fn main() {
    // Parse arguments
    let flags = lib::parse();

    // Log
    lib::set_logger(&flags);

    // Validate
    let opts = match lib::validate(&flags) {
        Ok(opts) => opts,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    // Device
    let device = match DeviceBuilder::new()
        .name(opts.inter.as_str())
        .ipv4(opts.network.ip(), opts.network.prefix(), None)
        .mtu(opts.mtu as u16)
        .build_async()
    {
        Ok(device) => device,
        Err(ref e) => {
            error!("open device {}: {}", opts.inter, e);
            return;
        }
    };
    info!("Open {} ({})", opts.inter, opts.network);

    // Protect
    let protect: Arc<dyn Protect> = match opts.fwmark {
        Some(mark) => protect(mark),
        None => Arc::new(NoProtect),
    };

    // Forwarding proxy
    let proxy = match opts.forward {
        Some(addr) => {
            info!("Forward port {} to {}", opts.forward_port, addr);
            ForwardProxy::with_proxy(opts.forward_port, addr)
        }
        None => ForwardProxy::new(opts.forward_port),
    };

    // Inspection
    let sink: Option<Arc<dyn BodySink>> = match opts.inspect.is_empty() {
        true => None,
        false => {
            info!("Inspect HTTP on ports {:?}", opts.inspect);
            Some(Arc::new(LogSink))
        }
    };

    // Instructions
    show_info(&opts.inter, opts.network.ip(), opts.network.mask(), opts.mtu, opts.fwmark);

    // Relay
    let relay = Relay::new(opts.relay_config(), protect, Arc::new(proxy), sink);
    let stop = relay.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(_) => {
                info!("Stop");
                stop.stop();
            }
            Err(ref e) => warn!("listen for interrupt: {}", e),
        }
    });
    if let Err(ref e) = relay.run(Arc::new(device)).await {
        error!("{}", e);
    }
}

#[cfg(target_os = "linux")]
fn protect(mark: u32) -> Arc<dyn Protect> {
    info!("Mark outbound sockets with {}", mark);
    Arc::new(lib::proxy::FwmarkProtect::new(mark))
}

#[cfg(not(target_os = "linux"))]
fn protect(_: u32) -> Arc<dyn Protect> {
    warn!("Socket marks are not supported on this platform");
    Arc::new(NoProtect)
}

fn show_info(name: &str, ip_addr: Ipv4Addr, mask: Ipv4Addr, mtu: usize, fwmark: Option<u32>) {
    info!("Please route the traffic which is going to be relayed to the device with the following parameters:");
    info!("    ┌─{:─<10}─{:─>15}─┐", "", "");
    info!("    │ {:<10} {:>15} │", "Device", name);
    info!("    │ {:<10} {:>15} │", "IP Address", ip_addr);
    info!("    │ {:<10} {:>15} │", "Mask", mask);
    info!("    │─{:─<10}─{:─>15}─│", "", "");
    info!("    │ {:<10} {:>15} │", "MTU", mtu);
    if let Some(mark) = fwmark {
        info!("    │ {:<10} {:>15} │", "Bypass Mark", mark);
    }
    info!("    └─{:─<10}─{:─>15}─┘", "", "");
}
