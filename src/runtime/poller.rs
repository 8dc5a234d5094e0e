//! Readiness multiplexing behind a uniform register/deregister/poll
//! contract.
//!
//! Two backend strategies, chosen once at construction:
//! - `Mio`: epoll on Linux, kqueue on macOS, via mio.
//! - `PollVec`: a portable poll(2) readiness vector rebuilt every cycle.
//!
//! Both surface every ready descriptor each cycle, so no endpoint is
//! starved while repeatedly ready. Ordering across descriptors ready in
//! the same cycle is unspecified.

use crate::config::Backend as BackendKind;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

/// Component owning a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The multicast discovery socket.
    Discovery,
    /// A device's listening socket (device index).
    Listener(usize),
    /// An accepted control connection (device index).
    Connection(usize),
}

struct Endpoint {
    fd: RawFd,
    owner: Owner,
}

enum Backend {
    Mio { poll: Poll, events: Events },
    PollVec,
}

/// Single-threaded readiness poller.
///
/// The slab is the watched set: exactly the discovery socket plus every
/// listener and open connection, keyed by `Token`.
pub struct Poller {
    backend: Backend,
    endpoints: Slab<Endpoint>,
}

impl Poller {
    pub fn new(kind: BackendKind) -> io::Result<Self> {
        let backend = match kind {
            BackendKind::Mio => Backend::Mio {
                poll: Poll::new()?,
                events: Events::with_capacity(64),
            },
            BackendKind::Poll => Backend::PollVec,
        };
        Ok(Self {
            backend,
            endpoints: Slab::new(),
        })
    }

    /// Add a descriptor to the watched set for readability.
    ///
    /// Registering a closed or never-opened descriptor is an error.
    pub fn register<S>(&mut self, source: &mut S, owner: Owner) -> io::Result<Token>
    where
        S: Source + AsRawFd,
    {
        let fd = source.as_raw_fd();
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} is not open"),
            ));
        }

        let token = Token(self.endpoints.vacant_key());
        if let Backend::Mio { poll, .. } = &self.backend {
            poll.registry().register(source, token, Interest::READABLE)?;
        }
        self.endpoints.insert(Endpoint { fd, owner });
        Ok(token)
    }

    /// Remove a descriptor from the watched set.
    ///
    /// Deregistering an unknown token is an error.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + AsRawFd,
    {
        if !self.endpoints.contains(token.0) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("token {} is not registered", token.0),
            ));
        }
        if let Backend::Mio { poll, .. } = &self.backend {
            poll.registry().deregister(source)?;
        }
        self.endpoints.remove(token.0);
        Ok(())
    }

    /// Number of watched descriptors.
    pub fn watched(&self) -> usize {
        self.endpoints.len()
    }

    /// Block up to `timeout`, then return each ready descriptor and its
    /// owner at most once. An empty watched set is a safe no-op that
    /// sleeps out the timeout.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Owner)>> {
        match &mut self.backend {
            Backend::Mio { poll, events } => {
                match poll.poll(events, timeout) {
                    Ok(()) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
                    Err(e) => return Err(e),
                }
                let mut ready = Vec::with_capacity(events.iter().count());
                for event in events.iter() {
                    let token = event.token();
                    // An earlier dispatch this cycle may have dropped it.
                    if let Some(endpoint) = self.endpoints.get(token.0) {
                        ready.push((token, endpoint.owner));
                    }
                }
                Ok(ready)
            }
            Backend::PollVec => {
                if self.endpoints.is_empty() {
                    if let Some(timeout) = timeout {
                        thread::sleep(timeout);
                    }
                    return Ok(Vec::new());
                }

                let mut keys = Vec::with_capacity(self.endpoints.len());
                let mut fds = Vec::with_capacity(self.endpoints.len());
                for (key, endpoint) in self.endpoints.iter() {
                    keys.push(key);
                    fds.push(libc::pollfd {
                        fd: endpoint.fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                }

                let timeout_ms = match timeout {
                    Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
                    None => -1,
                };
                let rc = unsafe {
                    libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms)
                };
                if rc == -1 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        return Ok(Vec::new());
                    }
                    return Err(err);
                }

                let mut ready = Vec::new();
                for (key, pollfd) in keys.into_iter().zip(fds.iter()) {
                    if pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                        ready.push((Token(key), self.endpoints[key].owner));
                    }
                }
                Ok(ready)
            }
        }
    }
}
