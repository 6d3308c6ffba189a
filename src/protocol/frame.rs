//! Frame definitions
//!
//! A parsed protocol value and its encoder.

use thiserror::Error;

/// A single protocol-level message
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Line-delimited string, e.g. `+OK`
    Simple(String),

    /// Error line, e.g. `-ERR unknown command`
    Error(String),

    /// Integer line, e.g. `:42`
    Integer(i64),

    /// Length-prefixed binary string
    Bulk(Vec<u8>),

    /// The absent bulk string (`$-1`)
    NullBulk,

    /// Array of nested values
    Array(Vec<Frame>),
}

/// Framing rejection, kept allocation-free for the parse hot path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid type prefix 0x{0:02x}")]
    BadPrefix(u8),

    #[error("invalid length field")]
    BadLength,

    #[error("missing line terminator")]
    BadTerminator,

    #[error("invalid integer line")]
    BadInteger,
}

impl Frame {
    /// Append the wire encoding of this frame to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Integer(v) => {
                out.push(b':');
                out.extend_from_slice(v.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Frame::NullBulk => {
                out.extend_from_slice(b"$-1\r\n");
            }
            Frame::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    /// Wire encoding as an owned buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Build an array-of-bulks frame, the shape every command takes
    pub fn array_of_bulks<I, B>(parts: I) -> Frame
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Frame::Array(parts.into_iter().map(|p| Frame::Bulk(p.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalar_frames() {
        assert_eq!(Frame::Simple("OK".into()).to_bytes(), b"+OK\r\n");
        assert_eq!(Frame::Error("ERR boom".into()).to_bytes(), b"-ERR boom\r\n");
        assert_eq!(Frame::Integer(-7).to_bytes(), b":-7\r\n");
        assert_eq!(Frame::Bulk(b"hello".to_vec()).to_bytes(), b"$5\r\nhello\r\n");
        assert_eq!(Frame::NullBulk.to_bytes(), b"$-1\r\n");
    }

    #[test]
    fn test_encode_array() {
        let frame = Frame::array_of_bulks([&b"GET"[..], b"k"]);
        assert_eq!(frame.to_bytes(), b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    }
}
