//! Virtual switch devices.
//!
//! Each device owns one listening socket and its accepted control
//! connections. The protocol is request-per-connection: one bounded
//! read is treated as a complete request, the reply (when there is one)
//! carries `CONNECTION: close` and the server side closes after
//! writing it.

use crate::actions::ActionHandler;
use crate::protocols::{wemo, USER_AGENT_HEADER};
use crate::runtime::discovery::DeviceRecord;
use crate::runtime::poller::{Owner, Poller};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::{debug, error, info, warn};

const READ_BUFFER: usize = 4096;
const LISTEN_BACKLOG: i32 = 5;

/// One emulated WeMo switch.
pub struct VirtualDevice {
    name: String,
    serial: String,
    persistent_uuid: String,
    ip: Ipv4Addr,
    port: u16,
    extra_headers: Vec<String>,
    listener: TcpListener,
    handler: Box<dyn ActionHandler>,
    conns: HashMap<Token, TcpStream>,
}

impl VirtualDevice {
    /// Bind and listen on the control port.
    ///
    /// Port 0 asks the kernel for an ephemeral port; the real port is
    /// observable through [`port`](Self::port) afterwards and is what
    /// discovery replies advertise.
    pub fn bind(
        name: &str,
        ip: Ipv4Addr,
        port: u16,
        handler: Box<dyn ActionHandler>,
    ) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(ip, port)).into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let listener: std::net::TcpListener = socket.into();
        let port = listener.local_addr()?.port();
        let serial = wemo::make_serial(name);

        Ok(Self {
            name: name.to_string(),
            persistent_uuid: format!("Socket-1_0-{serial}"),
            serial,
            ip,
            port,
            extra_headers: vec![USER_AGENT_HEADER.to_string()],
            listener: TcpListener::from_std(listener),
            handler,
            conns: HashMap::new(),
        })
    }

    /// Watch the listening socket. `device_idx` is this device's slot in
    /// the engine, echoed back by the poller as the endpoint owner.
    pub fn register_listener(&mut self, poller: &mut Poller, device_idx: usize) -> io::Result<Token> {
        let token = poller.register(&mut self.listener, Owner::Listener(device_idx))?;
        info!(
            name = %self.name,
            serial = %self.serial,
            addr = %format!("{}:{}", self.ip, self.port),
            "Device listening"
        );
        Ok(token)
    }

    /// Snapshot for the discovery responder's registration list.
    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            name: self.name.clone(),
            ip: self.ip,
            port: self.port,
            persistent_uuid: self.persistent_uuid.clone(),
            extra_headers: self.extra_headers.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept pending connections and hand them to the poller.
    ///
    /// Drains the accept queue: the poller's mio backend is
    /// edge-triggered, so a connection left queued here would never
    /// trigger again.
    pub fn handle_listener_ready(&mut self, poller: &mut Poller, device_idx: usize) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    match poller.register(&mut stream, Owner::Connection(device_idx)) {
                        Ok(token) => {
                            debug!(name = %self.name, %peer, "Accepted control connection");
                            self.conns.insert(token, stream);
                        }
                        Err(e) => {
                            warn!(name = %self.name, %peer, error = %e, "Failed to watch connection");
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(name = %self.name, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Read and dispatch one request on a control connection.
    pub fn handle_connection_ready(&mut self, poller: &mut Poller, token: Token) {
        let Some(stream) = self.conns.get_mut(&token) else {
            return;
        };

        let mut buf = [0u8; READ_BUFFER];
        let n = match stream.read(&mut buf) {
            // Zero-length read: peer closed.
            Ok(0) => {
                debug!(name = %self.name, "Peer closed connection");
                self.close_connection(poller, token);
                return;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(name = %self.name, error = %e, "Connection read failed");
                self.close_connection(poller, token);
                return;
            }
        };

        self.dispatch(poller, token, &buf[..n]);
    }

    /// One bounded read is one complete request; there is no multi-read
    /// framing in this protocol.
    fn dispatch(&mut self, poller: &mut Poller, token: Token, data: &[u8]) {
        match wemo::parse_request(data) {
            wemo::ControlRequest::Describe => {
                debug!(name = %self.name, "Serving setup.xml");
                let xml = wemo::setup_xml(&self.name, &self.serial);
                let response = wemo::describe_response(&xml, &self.extra_headers);
                self.send_and_close(poller, token, &response);
            }
            wemo::ControlRequest::SetBinaryState(state) => self.actuate(poller, token, state),
            wemo::ControlRequest::Unknown => {
                // Ignored; observable only here.
                debug!(
                    name = %self.name,
                    request = %String::from_utf8_lossy(data),
                    "Unrecognized request shape"
                );
            }
        }
    }

    /// Drive the action handler and answer iff it reports success.
    ///
    /// The protocol has no failure vocabulary: `Ok(false)` and `Err`
    /// both leave the client waiting in silence, and nothing is retried.
    fn actuate(&mut self, poller: &mut Poller, token: Token, state: wemo::BinaryState) {
        let result = match state {
            wemo::BinaryState::On => {
                debug!(name = %self.name, "Actuating ON");
                self.handler.on()
            }
            wemo::BinaryState::Off => {
                debug!(name = %self.name, "Actuating OFF");
                self.handler.off()
            }
            wemo::BinaryState::Unrecognized => {
                debug!(name = %self.name, "Unrecognized binary state; no action taken");
                return;
            }
        };

        match result {
            Ok(true) => {
                let response = wemo::actuate_response(&self.extra_headers);
                self.send_and_close(poller, token, &response);
            }
            Ok(false) => {
                debug!(name = %self.name, "Actuation reported failure; staying silent");
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "Action handler error; staying silent");
            }
        }
    }

    /// Write a full response, then close (connection-close framing).
    fn send_and_close(&mut self, poller: &mut Poller, token: Token, data: &[u8]) {
        if let Some(stream) = self.conns.get_mut(&token) {
            if let Err(e) = write_fully(stream, data) {
                warn!(name = %self.name, error = %e, "Response write failed");
            }
        }
        self.close_connection(poller, token);
    }

    fn close_connection(&mut self, poller: &mut Poller, token: Token) {
        if let Some(mut stream) = self.conns.remove(&token) {
            if let Err(e) = poller.deregister(&mut stream, token) {
                warn!(name = %self.name, error = %e, "Deregister failed");
            }
        }
    }
}

/// Responses are a couple of KiB at most and the peer just connected, so
/// the socket send buffer always has room; WouldBlock is treated as a
/// transient failure and the connection is dropped by the caller.
fn write_fully(stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::DefaultHandler;

    #[test]
    fn test_ephemeral_bind_reports_real_port() {
        let device =
            VirtualDevice::bind("lounge", Ipv4Addr::LOCALHOST, 0, Box::new(DefaultHandler))
                .unwrap();
        assert_ne!(device.port(), 0);
        assert_eq!(device.serial, wemo::make_serial("lounge"));
        assert_eq!(device.record().port, device.port());
        assert_eq!(
            device.record().persistent_uuid,
            format!("Socket-1_0-{}", wemo::make_serial("lounge"))
        );
    }

    #[test]
    fn test_bind_conflict_errors() {
        let first =
            VirtualDevice::bind("one", Ipv4Addr::LOCALHOST, 0, Box::new(DefaultHandler)).unwrap();
        let err = VirtualDevice::bind(
            "two",
            Ipv4Addr::LOCALHOST,
            first.port(),
            Box::new(DefaultHandler),
        );
        assert!(err.is_err());
    }
}
