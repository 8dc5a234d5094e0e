//! Protocol implementations.
//!
//! Each protocol module is a set of pure parsing and formatting functions
//! used by the runtime event loop:
//! - `ssdp`: UPnP discovery over multicast UDP (M-SEARCH matching, search
//!   replies)
//! - `wemo`: per-device control over TCP (setup.xml descriptor, Belkin
//!   basicevent SOAP actuation)

pub mod ssdp;
pub mod wemo;

use chrono::Utc;

/// Server token advertised in discovery replies and control responses.
///
/// The Echo accepts this generic UPnP/1.0 identification; a realistic
/// WeMo firmware string is not required.
pub const SERVER_VERSION: &str = "Unspecified, UPnP/1.0, Unspecified";

/// Extra header the real WeMo firmware sends; the Echo expects it.
pub const USER_AGENT_HEADER: &str = "X-User-Agent: redsonic";

/// Current time as an RFC 1123 HTTP date (always GMT).
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Split a wire request into header block and body at the blank line.
///
/// Returns the bytes before the `\r\n\r\n` separator and the bytes after
/// it. With no separator the whole input is treated as headers.
pub fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    for i in 0..data.len().saturating_sub(3) {
        if &data[i..i + 4] == b"\r\n\r\n" {
            return (&data[..i], &data[i + 4..]);
        }
    }
    (data, &[])
}

/// Iterate the CRLF-separated lines of a header block.
pub fn header_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
