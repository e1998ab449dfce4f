//! Server List Ping wire format.

use std::io::{Cursor, Read};

/// Length prefix (1) followed by the status-request packet id (0x00).
pub const STATUS_REQUEST: [u8; 2] = [0x01, 0x00];

/// Responses larger than this are cut off before parsing. Status payloads
/// with a favicon run tens of kilobytes; anything past a megabyte is not a
/// status response.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseError {
    Empty,
    Malformed,
}

pub fn write_varint(writer: &mut Vec<u8>, mut value: i32) {
    if value == 0 {
        writer.push(0);
    }
    while value != 0 {
        let mut byte = (value & 0b0111_1111) as u8;
        value = (value >> 7) & (i32::MAX >> 6);
        if value != 0 {
            byte |= 0b1000_0000;
        }
        writer.push(byte);
    }
}

/// Reads a VarInt: up to 5 bytes, 7 payload bits each, high bit set means
/// another byte follows. A continuation bit on the fifth byte is an error.
pub fn read_varint(reader: &mut (dyn Read + Unpin + Send)) -> Option<i32> {
    let mut buffer = [0];
    let mut ans = 0;
    for i in 0..5 {
        reader.read_exact(&mut buffer).ok()?;
        ans |= ((buffer[0] & 0b0111_1111) as i32) << (7 * i);
        if buffer[0] & 0b1000_0000 == 0 {
            return Some(ans);
        }
    }
    None
}

/// Build the handshake packet for the given hostname and port, followed
/// immediately by the status request.
///
/// With `framed` set the handshake body gets the outer VarInt length prefix
/// the protocol documents. Without it the body is written bare, which is
/// what most of the scanning ecosystem sends and nearly every server
/// accepts.
pub fn build_status_request(hostname: &str, port: u16, framed: bool) -> Vec<u8> {
    // handshake body: packet id, protocol version, hostname, port, next state
    let mut body = vec![
        0x00, // packet id: handshake
    ];
    write_varint(&mut body, 0); // protocol version 0: "just tell me your status"
    write_varint(&mut body, hostname.len() as i32);
    body.extend_from_slice(hostname.as_bytes());
    body.extend_from_slice(&[
        (port >> 8) as u8,
        (port & 0b1111_1111) as u8,
        0x01, // next state: status
    ]);

    let mut buffer = Vec::new();
    if framed {
        write_varint(&mut buffer, body.len() as i32);
    }
    buffer.append(&mut body);
    buffer.extend_from_slice(&STATUS_REQUEST);
    buffer
}

/// Whether `buf` already holds a complete framed status response. Used to
/// stop reading early, since most servers leave the connection open after
/// replying.
pub fn response_complete(buf: &[u8]) -> bool {
    let mut stream = Cursor::new(buf);
    let Some(_packet_length) = read_varint(&mut stream) else {
        return false;
    };
    let Some(packet_id) = read_varint(&mut stream) else {
        return false;
    };
    let Some(json_length) = read_varint(&mut stream) else {
        return false;
    };
    if packet_id != 0x00 || json_length < 0 {
        return false;
    }
    let header = stream.position() as usize;
    buf.len() >= header + json_length as usize
}

/// Parse a status response buffer into its JSON payload.
///
/// Tries the framed layout first: packet length, packet id, JSON length,
/// then that many bytes of JSON. If any of that fails, falls back to
/// slicing from the first `{` to the last `}` of the buffer decoded as
/// UTF-8, which recovers responses from servers that frame incorrectly.
pub fn parse_status_response(buf: &[u8]) -> Result<serde_json::Value, ResponseError> {
    if buf.is_empty() {
        return Err(ResponseError::Empty);
    }

    if let Some(value) = parse_framed(buf) {
        return Ok(value);
    }
    parse_brace_window(buf).ok_or(ResponseError::Malformed)
}

fn parse_framed(buf: &[u8]) -> Option<serde_json::Value> {
    let mut stream = Cursor::new(buf);
    let _packet_length = read_varint(&mut stream)?;
    let packet_id = read_varint(&mut stream)?;
    let json_length = read_varint(&mut stream)?;
    if packet_id != 0x00 || json_length < 0 {
        return None;
    }

    let start = stream.position() as usize;
    let end = start.checked_add(json_length as usize)?;
    let payload = buf.get(start..end)?;
    serde_json::from_slice(payload).ok()
}

fn parse_brace_window(buf: &[u8]) -> Option<serde_json::Value> {
    let text = String::from_utf8_lossy(buf);
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn varint_bytes(value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [
            0,
            1,
            127,
            128,
            255,
            25565,
            2_097_151,
            2_097_152,
            i32::MAX,
        ] {
            let bytes = varint_bytes(value);
            let mut cursor = Cursor::new(bytes.as_slice());
            assert_eq!(read_varint(&mut cursor), Some(value), "value {value}");
        }
    }

    #[test]
    fn test_varint_boundary_lengths() {
        assert_eq!(varint_bytes(127).len(), 1);
        assert_eq!(varint_bytes(128).len(), 2);
        assert_eq!(varint_bytes(2_097_151).len(), 3);
        assert_eq!(varint_bytes(2_097_152).len(), 4);
        assert_eq!(varint_bytes(i32::MAX).len(), 5);
    }

    #[test]
    fn test_varint_overflow_is_an_error() {
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff];
        let mut cursor = Cursor::new(bytes.as_slice());
        assert_eq!(read_varint(&mut cursor), None);
    }

    #[test]
    fn test_varint_truncated_is_an_error() {
        let bytes = [0x80];
        let mut cursor = Cursor::new(bytes.as_slice());
        assert_eq!(read_varint(&mut cursor), None);
    }

    #[test]
    fn test_handshake_layout_bare() {
        let request = build_status_request("198.51.100.7", 25565, false);
        let handshake = &request[..request.len() - 2];

        // id + protocol version + length byte + hostname + port + next state
        assert_eq!(handshake.len(), 6 + "198.51.100.7".len());
        assert_eq!(handshake[0], 0x00);
        assert_eq!(handshake[1], 0x00);
        assert_eq!(handshake[2] as usize, "198.51.100.7".len());
        assert_eq!(&handshake[3..handshake.len() - 3], b"198.51.100.7");
        assert_eq!(handshake[handshake.len() - 3], (25565 >> 8) as u8);
        assert_eq!(handshake[handshake.len() - 2], (25565 & 0xff) as u8);
        assert_eq!(handshake[handshake.len() - 1], 0x01);
        assert_eq!(&request[request.len() - 2..], &STATUS_REQUEST);
    }

    #[test]
    fn test_handshake_layout_framed() {
        let hostname = "203.0.113.5";
        let request = build_status_request(hostname, 25565, true);
        let handshake = &request[..request.len() - 2];

        // the length prefix makes it 7 + len(hostname) in total
        assert_eq!(handshake.len(), 7 + hostname.len());
        assert_eq!(handshake[0] as usize, 6 + hostname.len());
        // the rest is the bare layout shifted by one
        assert_eq!(handshake[1], 0x00);
        assert_eq!(handshake[2], 0x00);
        assert_eq!(handshake[3] as usize, hostname.len());
    }

    fn framed_response(json: &str) -> Vec<u8> {
        let mut packet = Vec::new();
        write_varint(&mut packet, 0x00);
        write_varint(&mut packet, json.len() as i32);
        packet.extend_from_slice(json.as_bytes());

        let mut buf = Vec::new();
        write_varint(&mut buf, packet.len() as i32);
        buf.extend_from_slice(&packet);
        buf
    }

    #[test]
    fn test_parse_framed_response() {
        let json = r#"{"version":{"name":"1.20.4","protocol":765},"players":{"online":25,"max":100},"description":{"text":"Welcome"}}"#;
        let value = parse_status_response(&framed_response(json)).unwrap();
        assert_eq!(value["version"]["name"], "1.20.4");
        assert_eq!(value["players"]["online"], 25);
    }

    #[test]
    fn test_parse_fallback_brace_window() {
        let buf = b"\x00\x00\x00garbage{\"players\":{\"online\":0,\"max\":10}}trailing";
        let value = parse_status_response(buf).unwrap();
        assert_eq!(value["players"]["max"], 10);
    }

    #[test]
    fn test_parse_empty_is_no_response() {
        assert_eq!(parse_status_response(&[]), Err(ResponseError::Empty));
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        assert_eq!(
            parse_status_response(b"not a status response"),
            Err(ResponseError::Malformed)
        );
        assert_eq!(
            parse_status_response(b"{ not json }"),
            Err(ResponseError::Malformed)
        );
    }

    #[test]
    fn test_response_complete() {
        let json = r#"{"players":{"online":1,"max":2}}"#;
        let buf = framed_response(json);
        assert!(response_complete(&buf));
        assert!(!response_complete(&buf[..buf.len() - 1]));
        assert!(!response_complete(&[]));
    }
}
