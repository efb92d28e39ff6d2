//! RESP frame types
//!
//! The migration client only speaks RESP2: requests are arrays of bulk
//! strings, replies are any of the five RESP2 types.

use bytes::Bytes;

/// RESP2 protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(Bytes),

    /// Error: -ERR message\r\n
    Error(Bytes),

    /// Integer: :1000\r\n
    Integer(i64),

    /// Bulk string: $5\r\nhello\r\n or $-1\r\n for null
    Bulk(Option<Bytes>),

    /// Array: *2\r\n... or *-1\r\n for null
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Create a simple string frame
    #[inline]
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Frame::Simple(s.into())
    }

    /// Create an error frame
    #[cold]
    #[inline]
    pub fn error(s: impl Into<Bytes>) -> Self {
        Frame::Error(s.into())
    }

    /// Create a bulk string frame
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Create a null bulk string frame
    #[inline]
    pub fn null() -> Self {
        Frame::Bulk(None)
    }

    /// Create an array frame
    #[inline]
    pub fn array(frames: Vec<Frame>) -> Self {
        Frame::Array(Some(frames))
    }

    /// Error message of an error frame, lossily decoded
    pub fn error_message(&self) -> Option<String> {
        match self {
            Frame::Error(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    /// Convert to owned array if this is an Array frame
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Frame::Array(Some(arr)) => Some(arr),
            _ => None,
        }
    }

    /// Convert to owned bytes if this is a Simple or Bulk frame
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Simple(b) | Frame::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        assert_eq!(Frame::simple("OK"), Frame::Simple(Bytes::from("OK")));
        assert_eq!(Frame::error("ERR"), Frame::Error(Bytes::from("ERR")));
        assert_eq!(Frame::bulk("hello"), Frame::Bulk(Some(Bytes::from("hello"))));
        assert_eq!(Frame::null(), Frame::Bulk(None));
        assert_eq!(Frame::array(vec![]), Frame::Array(Some(vec![])));
    }

    #[test]
    fn test_error_message() {
        let frame = Frame::error("NOSCRIPT No matching script");
        assert_eq!(
            frame.error_message().as_deref(),
            Some("NOSCRIPT No matching script")
        );
        assert_eq!(Frame::simple("OK").error_message(), None);
    }

    #[test]
    fn test_into_bytes_accepts_simple_and_bulk() {
        assert_eq!(Frame::simple("OK").into_bytes(), Some(Bytes::from("OK")));
        assert_eq!(Frame::bulk("abc").into_bytes(), Some(Bytes::from("abc")));
        assert_eq!(Frame::null().into_bytes(), None);
        assert_eq!(Frame::Integer(1).into_bytes(), None);
    }
}
