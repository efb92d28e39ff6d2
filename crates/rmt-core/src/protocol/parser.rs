//! RESP protocol parser
//!
//! Streaming parser for RESP2 replies. A frame is only consumed from the
//! buffer once it is complete; a partial frame leaves the buffer untouched.

use bytes::{Buf, Bytes, BytesMut};

use super::Frame;

/// Largest bulk reply accepted (matches Redis' `proto-max-bulk-len`)
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest array reply accepted
const MAX_ARRAY_LEN: usize = 1 << 20;

/// Deepest array nesting accepted
const MAX_DEPTH: usize = 64;

/// Parse error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// Invalid protocol format
    #[error("invalid protocol: {0}")]
    Invalid(String),

    /// Invalid UTF-8 in a numeric line
    #[error("invalid UTF-8")]
    InvalidUtf8,

    /// Frame exceeds the size limits
    #[error("frame too large: {0}")]
    FrameTooLarge(String),
}

type Parsed = Result<Option<(Frame, usize)>, ParseError>;

/// Parse one reply from the front of `buf`.
///
/// Returns `Ok(None)` while the reply is incomplete.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    match parse_at(buf, 0, 0)? {
        Some((frame, end)) => {
            buf.advance(end);
            Ok(Some(frame))
        }
        None => Ok(None),
    }
}

/// Parse the frame starting at `pos`; on success also returns where it ends.
fn parse_at(buf: &[u8], pos: usize, depth: usize) -> Parsed {
    let Some(&marker) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, body)) = line_at(buf, pos + 1) else {
        return Ok(None);
    };

    match marker {
        b'+' => Ok(Some((Frame::Simple(Bytes::copy_from_slice(line)), body))),
        b'-' => Ok(Some((Frame::Error(Bytes::copy_from_slice(line)), body))),
        b':' => Ok(Some((Frame::Integer(decimal(line)?), body))),
        b'$' => {
            let Some(len) = length(line, MAX_BULK_LEN, "bulk string")? else {
                return Ok(Some((Frame::null(), body)));
            };
            let end = body + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(ParseError::Invalid("expected CRLF after bulk data".into()));
            }
            let data = Bytes::copy_from_slice(&buf[body..end]);
            Ok(Some((Frame::Bulk(Some(data)), end + 2)))
        }
        b'*' => {
            if depth >= MAX_DEPTH {
                return Err(ParseError::FrameTooLarge(format!(
                    "nesting deeper than {}",
                    MAX_DEPTH
                )));
            }
            let Some(count) = length(line, MAX_ARRAY_LEN, "array")? else {
                return Ok(Some((Frame::Array(None), body)));
            };
            let mut items = Vec::with_capacity(count.min(1024));
            let mut next = body;
            for _ in 0..count {
                match parse_at(buf, next, depth + 1)? {
                    Some((item, end)) => {
                        items.push(item);
                        next = end;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(Some(items)), next)))
        }
        other => Err(ParseError::Invalid(format!("unexpected byte: {:02x}", other))),
    }
}

/// The line starting at `start`, without its CRLF, and the offset after it.
fn line_at(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let at = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..at], start + at + 2))
}

fn decimal(line: &[u8]) -> Result<i64, ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidUtf8)?;
    text.parse()
        .map_err(|_| ParseError::Invalid(format!("invalid integer: {}", text)))
}

/// A length header; `-1` is the null marker.
fn length(line: &[u8], max: usize, what: &str) -> Result<Option<usize>, ParseError> {
    match decimal(line)? {
        -1 => Ok(None),
        n if n < 0 => Err(ParseError::Invalid(format!("negative {} length", what))),
        n if n as u64 > max as u64 => Err(ParseError::FrameTooLarge(format!(
            "{} length {} exceeds {}",
            what, n, max
        ))),
        n => Ok(Some(n as usize)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_parse_simple_ok() {
        let mut buf = BytesMut::from("+OK\r\n");
        let frame = parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::simple("OK"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_error_reply() {
        let mut buf = BytesMut::from("-BUSYKEY Target key name already exists.\r\n");
        let frame = parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame.error_message().as_deref(),
            Some("BUSYKEY Target key name already exists.")
        );
    }

    #[test]
    fn test_parse_bulk_sha() {
        let sha = "a42059b356c875f0717db19a51f6aaca9ae659ea";
        let mut buf = BytesMut::from(format!("${}\r\n{}\r\n", sha.len(), sha).as_str());
        let frame = parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.into_bytes(), Some(Bytes::from(sha)));
    }

    #[test]
    fn test_parse_incomplete_leaves_buffer() {
        for partial in ["$6\r\nfoo", "+O", "*2\r\n:1\r\n", "$3\r\nfoo\r"] {
            let mut buf = BytesMut::from(partial);
            assert!(parse_frame(&mut buf).unwrap().is_none());
            assert_eq!(&buf[..], partial.as_bytes());
        }
    }

    #[test]
    fn test_parse_pipelined_replies() {
        let mut buf = BytesMut::from("+OK\r\n:1\r\n$-1\r\n");
        assert_eq!(parse_frame(&mut buf).unwrap(), Some(Frame::simple("OK")));
        assert_eq!(parse_frame(&mut buf).unwrap(), Some(Frame::Integer(1)));
        assert_eq!(parse_frame(&mut buf).unwrap(), Some(Frame::null()));
        assert_eq!(parse_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_parse_nested_array() {
        let mut buf = BytesMut::from("*2\r\n$3\r\nfoo\r\n*1\r\n:7\r\n*-1\r\n");
        let frame = parse_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::array(vec![
                Frame::bulk("foo"),
                Frame::array(vec![Frame::Integer(7)])
            ])
        );
        assert_eq!(parse_frame(&mut buf).unwrap(), Some(Frame::Array(None)));
    }

    #[test]
    fn test_parse_invalid_type_byte() {
        let mut buf = BytesMut::from("?what\r\n");
        assert!(matches!(parse_frame(&mut buf), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn test_bulk_without_crlf_rejected() {
        let mut buf = BytesMut::from("$3\r\nfooXY");
        assert!(matches!(parse_frame(&mut buf), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn test_oversized_lengths_rejected() {
        let mut buf = BytesMut::from("$536870913\r\n");
        assert!(matches!(
            parse_frame(&mut buf),
            Err(ParseError::FrameTooLarge(_))
        ));
        let mut buf = BytesMut::from("*-5\r\n");
        assert!(matches!(parse_frame(&mut buf), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn test_nesting_limit() {
        let mut buf = BytesMut::from("*1\r\n".repeat(MAX_DEPTH + 1).as_str());
        assert!(matches!(
            parse_frame(&mut buf),
            Err(ParseError::FrameTooLarge(_))
        ));
    }
}
