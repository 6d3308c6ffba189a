//! Restartable frame parser
//!
//! Callers append arbitrary byte chunks and ask for one frame at a time.
//! An incomplete frame leaves the buffer untouched so more bytes can
//! arrive; a malformed frame surfaces a [`FrameError`].

use super::{Frame, FrameError};

/// Upper bound on a single binary string, matching what a reasonable client
/// would ever send; larger declared lengths are malformed framing
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Array nesting bound; the command protocol itself never nests
const MAX_DEPTH: usize = 32;

/// Incremental parser over an internal byte buffer
#[derive(Default)]
pub struct Parser {
    buf: Vec<u8>,
}

impl Parser {
    pub fn new() -> Self {
        Parser { buf: Vec::new() }
    }

    /// Append newly received bytes
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Try to parse one frame, consuming its bytes on success.
    ///
    /// Returns `Ok(None)` when the buffer holds only a prefix of a frame.
    pub fn try_parse_one(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut pos = 0;
        match parse_value(&self.buf, &mut pos, 0)? {
            Some(frame) => {
                self.buf.drain(..pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Like [`try_parse_one`](Self::try_parse_one) but also returns the
    /// exact raw bytes consumed, needed to forward frames unmodified to the
    /// append log and to replicas.
    pub fn try_parse_one_with_raw(&mut self) -> Result<Option<(Frame, Vec<u8>)>, FrameError> {
        let mut pos = 0;
        match parse_value(&self.buf, &mut pos, 0)? {
            Some(frame) => {
                let raw = self.buf[..pos].to_vec();
                self.buf.drain(..pos);
                Ok(Some((frame, raw)))
            }
            None => Ok(None),
        }
    }
}

/// Parse one value starting at `*pos`, advancing it past the value.
/// `Ok(None)` means more bytes are needed; `pos` is then meaningless.
fn parse_value(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Option<Frame>, FrameError> {
    if depth > MAX_DEPTH {
        return Err(FrameError::BadLength);
    }
    let Some(&prefix) = buf.get(*pos) else {
        return Ok(None);
    };
    let line_start = *pos + 1;
    let Some(line_end) = find_crlf(buf, line_start) else {
        return Ok(None);
    };
    let line = &buf[line_start..line_end];
    let after_line = line_end + 2;

    match prefix {
        b'+' => {
            *pos = after_line;
            Ok(Some(Frame::Simple(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
        b'-' => {
            *pos = after_line;
            Ok(Some(Frame::Error(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
        b':' => {
            let value = parse_i64(line).ok_or(FrameError::BadInteger)?;
            *pos = after_line;
            Ok(Some(Frame::Integer(value)))
        }
        b'$' => {
            let len = parse_i64(line).ok_or(FrameError::BadLength)?;
            if len == -1 {
                *pos = after_line;
                return Ok(Some(Frame::NullBulk));
            }
            if len < 0 || len > MAX_BULK_LEN {
                return Err(FrameError::BadLength);
            }
            let len = len as usize;
            let content_end = after_line + len;
            if buf.len() < content_end + 2 {
                return Ok(None);
            }
            if &buf[content_end..content_end + 2] != b"\r\n" {
                return Err(FrameError::BadTerminator);
            }
            let data = buf[after_line..content_end].to_vec();
            *pos = content_end + 2;
            Ok(Some(Frame::Bulk(data)))
        }
        b'*' => {
            let count = parse_i64(line).ok_or(FrameError::BadLength)?;
            if count < 0 {
                return Err(FrameError::BadLength);
            }
            let mut cursor = after_line;
            // capacity from untrusted input is capped; the vec still grows
            let mut items = Vec::with_capacity((count as usize).min(1024));
            for _ in 0..count {
                match parse_value(buf, &mut cursor, depth + 1)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            *pos = cursor;
            Ok(Some(Frame::Array(items)))
        }
        other => Err(FrameError::BadPrefix(other)),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + 2 {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_i64(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_frames() {
        let mut parser = Parser::new();
        parser.append(b"+OK\r\n:12\r\n$3\r\nabc\r\n$-1\r\n");

        assert_eq!(
            parser.try_parse_one().unwrap(),
            Some(Frame::Simple("OK".into()))
        );
        assert_eq!(parser.try_parse_one().unwrap(), Some(Frame::Integer(12)));
        assert_eq!(
            parser.try_parse_one().unwrap(),
            Some(Frame::Bulk(b"abc".to_vec()))
        );
        assert_eq!(parser.try_parse_one().unwrap(), Some(Frame::NullBulk));
        assert_eq!(parser.try_parse_one().unwrap(), None);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_parse_survives_arbitrary_fragmentation() {
        let wire = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n";
        let expected = Frame::array_of_bulks([&b"SET"[..], b"k", b"hello"]);

        // feed one byte at a time; a frame must appear exactly once, at the end
        let mut parser = Parser::new();
        for (i, byte) in wire.iter().enumerate() {
            parser.append(std::slice::from_ref(byte));
            let parsed = parser.try_parse_one().unwrap();
            if i + 1 < wire.len() {
                assert!(parsed.is_none(), "complete frame before byte {}", i);
            } else {
                assert_eq!(parsed, Some(expected.clone()));
            }
        }
    }

    #[test]
    fn test_incomplete_leaves_buffer_untouched() {
        let mut parser = Parser::new();
        parser.append(b"$10\r\nhello");
        assert_eq!(parser.try_parse_one().unwrap(), None);
        assert_eq!(parser.buffered_len(), 10);

        parser.append(b"world\r\n");
        assert_eq!(
            parser.try_parse_one().unwrap(),
            Some(Frame::Bulk(b"helloworld".to_vec()))
        );
    }

    #[test]
    fn test_raw_bytes_match_consumed_input() {
        let wire = b"*2\r\n$4\r\nPING\r\n$2\r\nhi\r\n";
        let mut parser = Parser::new();
        parser.append(wire);
        parser.append(b"+trailing\r\n");

        let (_, raw) = parser.try_parse_one_with_raw().unwrap().unwrap();
        assert_eq!(raw, wire);
    }

    #[test]
    fn test_malformed_framing_is_rejected() {
        let mut parser = Parser::new();
        parser.append(b"@bogus\r\n");
        assert_eq!(parser.try_parse_one(), Err(FrameError::BadPrefix(b'@')));

        let mut parser = Parser::new();
        parser.append(b"$3\r\nabcX\r\n");
        assert_eq!(parser.try_parse_one(), Err(FrameError::BadTerminator));

        let mut parser = Parser::new();
        parser.append(b":4x\r\n");
        assert_eq!(parser.try_parse_one(), Err(FrameError::BadInteger));

        let mut parser = Parser::new();
        parser.append(b"$-2\r\n");
        assert_eq!(parser.try_parse_one(), Err(FrameError::BadLength));
    }

    #[test]
    fn test_nested_array() {
        let mut parser = Parser::new();
        parser.append(b"*2\r\n*1\r\n:1\r\n$1\r\na\r\n");
        assert_eq!(
            parser.try_parse_one().unwrap(),
            Some(Frame::Array(vec![
                Frame::Array(vec![Frame::Integer(1)]),
                Frame::Bulk(b"a".to_vec()),
            ]))
        );
    }
}
