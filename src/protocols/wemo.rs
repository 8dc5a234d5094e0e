//! WeMo control protocol.
//!
//! A WeMo switch exposes two things over its TCP port: a `setup.xml`
//! device descriptor the Echo fetches after discovery, and a SOAP
//! `SetBinaryState` action used to flip it. We emulate exactly those
//! two, nothing else; this is not an HTTP server, it recognizes the two
//! request shapes the Echo produces and ignores everything else.
//!
//! The protocol has no failure vocabulary: a successful actuation gets
//! an empty 200, a failed one gets silence.

use crate::protocols::{header_lines, http_date, split_head_body, SERVER_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Request line prefix of a descriptor fetch.
const DESCRIBE_PREFIX: &[u8] = b"GET /setup.xml HTTP/1.1";

/// Header marking a binary-state actuation.
const SOAP_ACTION: &[u8] = b"SOAPACTION: \"urn:Belkin:service:basicevent:1#SetBinaryState\"";

/// Requested binary state inside an actuation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryState {
    On,
    Off,
    /// Body carried neither marker; no handler call is made.
    Unrecognized,
}

/// Classified control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// `GET /setup.xml` descriptor fetch.
    Describe,
    /// SOAP SetBinaryState actuation.
    SetBinaryState(BinaryState),
    /// Anything else; logged and dropped.
    Unknown,
}

/// Classify one complete request (request-per-connection, single read).
pub fn parse_request(data: &[u8]) -> ControlRequest {
    if data.starts_with(DESCRIBE_PREFIX) {
        return ControlRequest::Describe;
    }

    let (head, body) = split_head_body(data);
    let is_actuate = header_lines(head)
        .any(|line| line.len() >= SOAP_ACTION.len() && line[..SOAP_ACTION.len()].eq_ignore_ascii_case(SOAP_ACTION));
    if !is_actuate {
        return ControlRequest::Unknown;
    }

    let state = if contains(body, b"<BinaryState>1</BinaryState>") {
        BinaryState::On
    } else if contains(body, b"<BinaryState>0</BinaryState>") {
        BinaryState::Off
    } else {
        BinaryState::Unrecognized
    };
    ControlRequest::SetBinaryState(state)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Derive a device serial from its name.
///
/// Pure and stable across restarts: hex of the byte sum of the name,
/// followed by the per-byte hex of the salted name, truncated to 14
/// characters. Distinct names yield distinct serials in practice; the
/// Echo only needs stability and local uniqueness.
pub fn make_serial(name: &str) -> String {
    let sum: u32 = name.bytes().map(u32::from).sum();
    let mut serial = format!("{sum:x}");
    for b in name.bytes().chain("wemulator!".bytes()) {
        serial.push_str(&format!("{b:x}"));
    }
    serial.truncate(14);
    serial
}

/// Render the setup.xml device descriptor.
///
/// The minimum document the Echo needs to adopt a switch.
pub fn setup_xml(name: &str, serial: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n\
         <root>\n\
           <device>\n\
             <deviceType>urn:MakerMusings:device:controllee:1</deviceType>\n\
             <friendlyName>{name}</friendlyName>\n\
             <manufacturer>Belkin International Inc.</manufacturer>\n\
             <modelName>Emulated Socket</modelName>\n\
             <modelNumber>3.1415</modelNumber>\n\
             <UDN>uuid:Socket-1_0-{serial}</UDN>\n\
           </device>\n\
         </root>\n"
    )
}

/// Build the 200 response to a descriptor fetch.
pub fn describe_response(xml: &str, extra_headers: &[String]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + xml.len());
    buf.put_slice(b"HTTP/1.1 200 OK\r\n");
    put_line(&mut buf, &format!("CONTENT-LENGTH: {}", xml.len()));
    buf.put_slice(b"CONTENT-TYPE: text/xml\r\n");
    put_line(&mut buf, &format!("DATE: {}", http_date()));
    buf.put_slice(b"LAST-MODIFIED: Sat, 01 Jan 2000 00:01:15 GMT\r\n");
    put_line(&mut buf, &format!("SERVER: {SERVER_VERSION}"));
    for header in extra_headers {
        put_line(&mut buf, header);
    }
    buf.put_slice(b"CONNECTION: close\r\n\r\n");
    buf.put_slice(xml.as_bytes());
    buf.freeze()
}

/// Build the empty 200 acknowledging a successful actuation.
///
/// The Echo only checks the status code; no SOAP envelope is needed.
pub fn actuate_response(extra_headers: &[String]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"HTTP/1.1 200 OK\r\n");
    buf.put_slice(b"CONTENT-LENGTH: 0\r\n");
    buf.put_slice(b"CONTENT-TYPE: text/xml charset=\"utf-8\"\r\n");
    put_line(&mut buf, &format!("DATE: {}", http_date()));
    buf.put_slice(b"EXT:\r\n");
    put_line(&mut buf, &format!("SERVER: {SERVER_VERSION}"));
    for header in extra_headers {
        put_line(&mut buf, header);
    }
    buf.put_slice(b"CONNECTION: close\r\n\r\n");
    buf.freeze()
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(b"\r\n");
}
