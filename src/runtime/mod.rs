//! Single-threaded cooperative runtime.
//!
//! One thread, one poller, no locks: the discovery socket, every
//! listener, and every open control connection share the same readiness
//! loop. `Poller::poll` is the only suspension point; everything a ready
//! descriptor triggers (accepts, reads, handler calls, replies) runs to
//! completion before the next cycle. A handler that sleeps for a pulse
//! dwell stalls the whole loop for its duration; that same stall is the
//! guarantee that at most one actuation is ever in flight.

mod device;
mod discovery;
mod poller;

pub use device::VirtualDevice;
pub use discovery::DiscoveryResponder;
pub use poller::{Owner, Poller};

use crate::actions::{build_handler, ActionHandler, SoftBank};
use crate::config::Config;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tracing::{error, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Owns the poller, the discovery responder, and the devices, and runs
/// the dispatch loop.
pub struct Engine {
    poller: Poller,
    responder: Option<DiscoveryResponder>,
    devices: Vec<VirtualDevice>,
}

impl Engine {
    pub fn new(backend: crate::config::Backend) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new(backend)?,
            responder: None,
            devices: Vec::new(),
        })
    }

    /// Bind the multicast responder and add it to the watch set.
    pub fn enable_discovery(&mut self, reply_delay: Duration) -> io::Result<()> {
        let responder = DiscoveryResponder::bind(reply_delay)?;
        self.attach_responder(responder)
    }

    /// Watch an already-bound responder socket.
    pub fn attach_responder(&mut self, mut responder: DiscoveryResponder) -> io::Result<()> {
        responder.register(&mut self.poller)?;
        self.responder = Some(responder);
        Ok(())
    }

    /// Bind a device, watch its listener, then make it discoverable.
    ///
    /// Registration with the discovery responder happens strictly last,
    /// so a device is never advertised before it can accept connections.
    pub fn add_device(
        &mut self,
        name: &str,
        ip: Ipv4Addr,
        port: u16,
        handler: Box<dyn ActionHandler>,
    ) -> io::Result<SocketAddr> {
        let device_idx = self.devices.len();
        let mut device = VirtualDevice::bind(name, ip, port, handler)?;
        device.register_listener(&mut self.poller, device_idx)?;
        if let Some(responder) = &mut self.responder {
            responder.register_device(device.record());
        }
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, device.port()));
        self.devices.push(device);
        Ok(addr)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn discoverable_count(&self) -> usize {
        self.responder.as_ref().map_or(0, DiscoveryResponder::device_count)
    }

    /// Watched descriptors across all components.
    pub fn watched(&self) -> usize {
        self.poller.watched()
    }

    /// One poll-and-dispatch cycle.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let ready = self.poller.poll(timeout)?;
        for (token, owner) in ready {
            match owner {
                Owner::Discovery => {
                    if let Some(responder) = &mut self.responder {
                        responder.handle_ready();
                    }
                }
                Owner::Listener(idx) => {
                    self.devices[idx].handle_listener_ready(&mut self.poller, idx);
                }
                Owner::Connection(idx) => {
                    self.devices[idx].handle_connection_ready(&mut self.poller, token);
                }
            }
        }
        Ok(())
    }

    /// Run until the process exits or the poller fails.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once(Some(POLL_TIMEOUT))?;
        }
    }
}

/// Build everything from resolved configuration and run the loop.
///
/// Startup failures degrade per component: a device that cannot bind is
/// skipped, a discovery socket that cannot join the multicast group
/// disables discovery only. Coming up with nothing at all to watch is
/// the one fatal case.
pub fn run(config: Config) -> io::Result<()> {
    let mut engine = Engine::new(config.backend)?;

    if config.discovery_enabled {
        match engine.enable_discovery(Duration::from_millis(config.reply_delay_ms)) {
            Ok(()) => info!("Listening for UPnP broadcasts"),
            Err(e) => warn!(error = %e, "Discovery disabled: multicast socket setup failed"),
        }
    }

    let bank = SoftBank::shared();
    for entry in &config.devices {
        let handler = build_handler(entry.handler.as_ref(), &bank);
        match engine.add_device(&entry.name, config.ip, entry.port, handler) {
            Ok(addr) => info!(name = %entry.name, %addr, "Device ready"),
            Err(e) => error!(name = %entry.name, error = %e, "Device failed to start; skipped"),
        }
    }

    if engine.watched() == 0 {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no discovery socket and no device came up",
        ));
    }

    info!(
        devices = engine.device_count(),
        discoverable = engine.discoverable_count(),
        "Entering main loop"
    );
    engine.run()
}
