//! SSDP broadcast responder.
//!
//! One process manages several virtual switches, so one multicast
//! listener answers for all of them: a matching search gets one unicast
//! reply per registered device, in registration order.

use crate::protocols::ssdp;
use crate::runtime::poller::{Owner, Poller};
use mio::net::UdpSocket;
use mio::Token;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const RECV_BUFFER: usize = 1024;

/// What the responder needs to advertise one device.
pub struct DeviceRecord {
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub persistent_uuid: String,
    pub extra_headers: Vec<String>,
}

/// Answers Belkin device searches on the SSDP multicast group.
///
/// The device list is append-only for the process lifetime; a reply set
/// reflects exactly the devices registered at dispatch time.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    devices: Vec<DeviceRecord>,
    reply_delay: Duration,
}

impl DiscoveryResponder {
    /// Bind the multicast socket and join the SSDP group.
    ///
    /// Failure here is fatal for discovery only; the caller keeps the
    /// per-device listeners running without it.
    pub fn bind(reply_delay: Duration) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, ssdp::MULTICAST_PORT);
        socket.bind(&SocketAddr::V4(bind_addr).into())?;
        socket.join_multicast_v4(&ssdp::MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;

        Ok(Self::from_socket(UdpSocket::from_std(socket.into()), reply_delay))
    }

    /// Wrap an already-bound non-blocking socket.
    pub fn from_socket(socket: UdpSocket, reply_delay: Duration) -> Self {
        Self {
            socket,
            devices: Vec::new(),
            reply_delay,
        }
    }

    /// Register the responder's socket with the poller.
    pub fn register(&mut self, poller: &mut Poller) -> io::Result<Token> {
        poller.register(&mut self.socket, Owner::Discovery)
    }

    /// Append a device. Only called after its listener is live.
    pub fn register_device(&mut self, record: DeviceRecord) {
        debug!(name = %record.name, port = record.port, "Device registered for discovery");
        self.devices.push(record);
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Drain pending datagrams and answer the matching ones.
    pub fn handle_ready(&mut self) {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, sender)) => self.handle_datagram(&buf[..n], sender),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Transient receive failure; the datagram is gone,
                    // the loop continues.
                    warn!(error = %e, "Discovery receive failed");
                    break;
                }
            }
        }
    }

    /// Answer one datagram if it is the Belkin device search.
    ///
    /// Replies go out in registration order with a pacing delay between
    /// them; the Echo copes badly with back-to-back reply bursts.
    pub fn handle_datagram(&mut self, data: &[u8], sender: SocketAddr) {
        if !ssdp::is_device_search(data) {
            return;
        }
        debug!(%sender, devices = self.devices.len(), "Answering device search");

        for record in &self.devices {
            if !self.reply_delay.is_zero() {
                thread::sleep(self.reply_delay);
            }
            let reply = ssdp::build_search_reply(
                &ssdp::SearchReply {
                    ip: record.ip,
                    port: record.port,
                    persistent_uuid: &record.persistent_uuid,
                    extra_headers: &record.extra_headers,
                },
                &uuid::Uuid::new_v4().to_string(),
            );
            if let Err(e) = self.socket.send_to(&reply, sender) {
                warn!(name = %record.name, error = %e, "Discovery reply failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &[u8] = b"M-SEARCH * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        MAN: \"ssdp:discover\"\r\n\
        ST: urn:Belkin:device:**\r\n\r\n";

    fn loopback_responder() -> DiscoveryResponder {
        let socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        DiscoveryResponder::from_socket(socket, Duration::ZERO)
    }

    fn record(name: &str, port: u16) -> DeviceRecord {
        DeviceRecord {
            name: name.to_string(),
            ip: Ipv4Addr::LOCALHOST,
            port,
            persistent_uuid: format!("Socket-1_0-{name}"),
            extra_headers: vec![],
        }
    }

    fn receiver() -> std::net::UdpSocket {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        socket
    }

    #[test]
    fn test_one_reply_per_device_in_registration_order() {
        let mut responder = loopback_responder();
        responder.register_device(record("alpha", 58301));
        responder.register_device(record("beta", 58302));
        responder.register_device(record("gamma", 58303));

        let receiver = receiver();
        responder.handle_datagram(SEARCH, receiver.local_addr().unwrap());

        let mut buf = [0u8; 1024];
        let mut usns = Vec::new();
        for _ in 0..3 {
            let (n, _) = receiver.recv_from(&mut buf).unwrap();
            let text = std::str::from_utf8(&buf[..n]).unwrap().to_string();
            assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
            let usn = text
                .lines()
                .find(|l| l.starts_with("USN: "))
                .unwrap()
                .to_string();
            usns.push(usn);
        }
        assert!(usns[0].contains("Socket-1_0-alpha"));
        assert!(usns[1].contains("Socket-1_0-beta"));
        assert!(usns[2].contains("Socket-1_0-gamma"));
        // Exactly three replies.
        assert!(receiver.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_non_matching_datagram_yields_no_reply() {
        let mut responder = loopback_responder();
        responder.register_device(record("alpha", 58301));

        let receiver = receiver();
        let dest = receiver.local_addr().unwrap();
        responder.handle_datagram(b"NOTIFY * HTTP/1.1\r\nST: urn:Belkin:device:**\r\n\r\n", dest);
        responder.handle_datagram(b"M-SEARCH * HTTP/1.1\r\nST: upnp:rootdevice\r\n\r\n", dest);

        let mut buf = [0u8; 1024];
        assert!(receiver.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_instance_token_is_fresh_per_reply() {
        let mut responder = loopback_responder();
        responder.register_device(record("alpha", 58301));

        let receiver = receiver();
        let dest = receiver.local_addr().unwrap();
        responder.handle_datagram(SEARCH, dest);
        responder.handle_datagram(SEARCH, dest);

        let mut buf = [0u8; 1024];
        let mut tokens = Vec::new();
        for _ in 0..2 {
            let (n, _) = receiver.recv_from(&mut buf).unwrap();
            let text = std::str::from_utf8(&buf[..n]).unwrap();
            let nls = text
                .lines()
                .find(|l| l.starts_with("01-NLS: "))
                .unwrap()
                .to_string();
            tokens.push(nls);
        }
        assert_ne!(tokens[0], tokens[1]);
    }
}
