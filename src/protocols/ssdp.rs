//! SSDP discovery protocol.
//!
//! The Echo locates switches with an SSDP M-SEARCH for the Belkin device
//! search target. This module only recognizes that one search; the more
//! common `upnp:rootdevice` general search is deliberately unsupported
//! (the Echo never sends it).
//!
//! ## Wire format
//!
//! ```text
//! Request:  M-SEARCH * HTTP/1.1
//!           ST: urn:Belkin:device:**
//!           ...
//!
//! Reply:    HTTP/1.1 200 OK
//!           LOCATION: http://<ip>:<port>/setup.xml
//!           USN: uuid:<persistent-id>::urn:Belkin:device:**
//!           ...
//! ```

use crate::protocols::{header_lines, http_date, split_head_body, SERVER_VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Multicast group SSDP searches arrive on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// Well-known SSDP port.
pub const MULTICAST_PORT: u16 = 1900;

/// The one search target we answer.
pub const SEARCH_TARGET: &str = "urn:Belkin:device:**";

/// Check whether a datagram is an M-SEARCH for the Belkin device target.
///
/// Matches iff the first line starts with `M-SEARCH` and some header line
/// contains the search target. Everything else is silently ignored by the
/// caller.
pub fn is_device_search(data: &[u8]) -> bool {
    let (head, _) = split_head_body(data);
    let mut lines = header_lines(head);
    match lines.next() {
        Some(first) if first.starts_with(b"M-SEARCH") => {}
        _ => return false,
    }
    let target = SEARCH_TARGET.as_bytes();
    lines.any(|line| line.windows(target.len()).any(|w| w == target))
}

/// Per-device fields baked into one search reply.
pub struct SearchReply<'a> {
    /// Address the description URL points at.
    pub ip: Ipv4Addr,
    /// Port the description URL points at.
    pub port: u16,
    /// Stable identifier, e.g. `Socket-1_0-<serial>`.
    pub persistent_uuid: &'a str,
    /// Verbatim extra header lines appended before the terminator.
    pub extra_headers: &'a [String],
}

/// Build one unicast search reply datagram.
///
/// `instance_token` is the per-reply `01-NLS` value; the caller generates
/// a fresh one for every reply sent.
pub fn build_search_reply(reply: &SearchReply<'_>, instance_token: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);
    buf.put_slice(b"HTTP/1.1 200 OK\r\n");
    buf.put_slice(b"CACHE-CONTROL: max-age=86400\r\n");
    put_header(&mut buf, "DATE", &http_date());
    buf.put_slice(b"EXT:\r\n");
    put_header(
        &mut buf,
        "LOCATION",
        &format!("http://{}:{}/setup.xml", reply.ip, reply.port),
    );
    buf.put_slice(b"OPT: \"http://schemas.upnp.org/upnp/1/0/\"; ns=01\r\n");
    put_header(&mut buf, "01-NLS", instance_token);
    put_header(&mut buf, "SERVER", SERVER_VERSION);
    put_header(&mut buf, "ST", SEARCH_TARGET);
    put_header(
        &mut buf,
        "USN",
        &format!("uuid:{}::{}", reply.persistent_uuid, SEARCH_TARGET),
    );
    for header in reply.extra_headers {
        buf.put_slice(header.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}
