//! RESP protocol encoder

use bytes::{BufMut, BytesMut};

use super::Frame;

/// Encode a frame into the buffer
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Simple(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Error(s) => {
            buf.put_u8(b'-');
            buf.put_slice(s);
            buf.put_slice(b"\r\n");
        }
        Frame::Integer(n) => {
            buf.put_u8(b':');
            buf.put_slice(n.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        Frame::Bulk(None) => {
            buf.put_slice(b"$-1\r\n");
        }
        Frame::Bulk(Some(data)) => {
            encode_bulk(data, buf);
        }
        Frame::Array(None) => {
            buf.put_slice(b"*-1\r\n");
        }
        Frame::Array(Some(frames)) => {
            buf.put_u8(b'*');
            buf.put_slice(frames.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for frame in frames {
                encode_frame(frame, buf);
            }
        }
    }
}

/// Encode a request directly from its arguments, without building a
/// [`Frame`] tree first. Payloads can be large, so avoiding the copy matters.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        encode_bulk(arg.as_ref(), buf);
    }
}

#[inline]
fn encode_bulk(data: &[u8], buf: &mut BytesMut) {
    buf.reserve(data.len() + 16);
    buf.put_u8(b'$');
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_encode_simple_and_error() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::simple("OK"), &mut buf);
        encode_frame(&Frame::error("ERR bad"), &mut buf);
        assert_eq!(&buf[..], b"+OK\r\n-ERR bad\r\n");
    }

    #[test]
    fn test_encode_null_bulk() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::null(), &mut buf);
        assert_eq!(&buf[..], b"$-1\r\n");
    }

    #[test]
    fn test_encode_command_matches_frame_encoding() {
        let args = [
            Bytes::from_static(b"RESTORE"),
            Bytes::from_static(b"k1"),
            Bytes::from_static(b"0"),
            Bytes::from_static(b"\x00\x01v\x06\x00"),
        ];
        let mut direct = BytesMut::new();
        encode_command(&args, &mut direct);

        let mut via_frame = BytesMut::new();
        let request = Frame::array(args.iter().cloned().map(Frame::bulk).collect());
        encode_frame(&request, &mut via_frame);

        assert_eq!(direct, via_frame);
        assert!(direct.starts_with(b"*4\r\n$7\r\nRESTORE\r\n"));
    }
}
