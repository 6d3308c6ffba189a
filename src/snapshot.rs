//! Snapshot codec
//!
//! A framed text format used for cold start and replica bootstrap. The file
//! opens with a magic line (`MRDB2`), then three sections in order (scalar,
//! field-map, ordered-set), each introduced by `TAG count`. Variable-width
//! fields are length-prefixed (`len SP bytes`) so the reader consumes by
//! count and arbitrary binary keys, values and members survive. Expiry is a
//! signed integer, negative meaning persistent. The legacy `MRDB1` header
//! (scalar section only, no tag) is still accepted on load.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::engine::Engine;
use crate::error::{OrionError, Result};
use crate::protocol::format_score;

const MAGIC_V2: &str = "MRDB2";
const MAGIC_V1: &str = "MRDB1";

/// Serialize the full engine state into a buffer.
///
/// The three family snapshots are taken under a single engine acquisition;
/// encoding then runs on the copies without holding the lock.
pub fn serialize(engine: &Engine) -> Vec<u8> {
    let (scalars, hashes, zsets) = {
        let store = engine.lock();
        (
            store.snapshot_scalars(),
            store.snapshot_hashes(),
            store.snapshot_zsets(),
        )
    };

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC_V2.as_bytes());
    out.push(b'\n');

    out.extend_from_slice(format!("STR {}\n", scalars.len()).as_bytes());
    for rec in &scalars {
        push_len_prefixed(&mut out, &rec.key);
        out.push(b' ');
        push_len_prefixed(&mut out, &rec.value);
        out.extend_from_slice(format!(" {}\n", rec.expire_at_ms).as_bytes());
    }

    out.extend_from_slice(format!("HASH {}\n", hashes.len()).as_bytes());
    for rec in &hashes {
        push_len_prefixed(&mut out, &rec.key);
        out.extend_from_slice(format!(" {} {}\n", rec.expire_at_ms, rec.fields.len()).as_bytes());
        for (field, value) in &rec.fields {
            push_len_prefixed(&mut out, field);
            out.push(b' ');
            push_len_prefixed(&mut out, value);
            out.push(b'\n');
        }
    }

    out.extend_from_slice(format!("ZSET {}\n", zsets.len()).as_bytes());
    for rec in &zsets {
        push_len_prefixed(&mut out, &rec.key);
        out.extend_from_slice(format!(" {} {}\n", rec.expire_at_ms, rec.items.len()).as_bytes());
        for (score, member) in &rec.items {
            out.extend_from_slice(format_score(*score).as_bytes());
            out.push(b' ');
            push_len_prefixed(&mut out, member);
            out.push(b'\n');
        }
    }

    out
}

/// Write the engine state to `path`, creating the parent directory if
/// absent and fsyncing before close.
pub fn save(engine: &Engine, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let data = serialize(engine);

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&data)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    tracing::debug!("snapshot saved: {} bytes to {}", data.len(), path.display());
    Ok(())
}

/// Load a snapshot file into the engine. A missing file is a clean cold
/// start, not an error. Loading merges into current state; callers wanting
/// replacement semantics clear the engine first.
pub fn load(engine: &Engine, path: &Path) -> Result<()> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    load_bytes(engine, &data)
}

/// Load snapshot bytes (replica bootstrap payloads arrive in memory)
pub fn load_bytes(engine: &Engine, data: &[u8]) -> Result<()> {
    let mut reader = Reader { buf: data, pos: 0 };

    let magic = reader.token("magic")?;
    match magic.as_str() {
        MAGIC_V1 => load_v1_body(engine, &mut reader),
        MAGIC_V2 => load_v2_body(engine, &mut reader),
        other => Err(OrionError::Snapshot(format!("bad magic '{}'", other))),
    }
}

fn load_v1_body(engine: &Engine, reader: &mut Reader) -> Result<()> {
    let count: usize = reader.number("scalar count")?;
    for _ in 0..count {
        load_scalar_record(engine, reader)?;
    }
    Ok(())
}

fn load_v2_body(engine: &Engine, reader: &mut Reader) -> Result<()> {
    reader.expect_tag("STR")?;
    let count: usize = reader.number("scalar count")?;
    for _ in 0..count {
        load_scalar_record(engine, reader)?;
    }

    reader.expect_tag("HASH")?;
    let count: usize = reader.number("hash count")?;
    for _ in 0..count {
        let key = reader.len_prefixed("hash key")?;
        let expire_at_ms: i64 = reader.number("hash expire")?;
        let nfields: usize = reader.number("hash field count")?;
        for _ in 0..nfields {
            let field = reader.len_prefixed("hash field")?;
            let value = reader.len_prefixed("hash value")?;
            engine.hset(&key, &field, &value);
        }
        if nfields > 0 && expire_at_ms >= 0 {
            engine.set_hash_expire_at(&key, expire_at_ms);
        }
    }

    reader.expect_tag("ZSET")?;
    let count: usize = reader.number("zset count")?;
    for _ in 0..count {
        let key = reader.len_prefixed("zset key")?;
        let expire_at_ms: i64 = reader.number("zset expire")?;
        let nitems: usize = reader.number("zset item count")?;
        for _ in 0..nitems {
            let score: f64 = reader.number("zset score")?;
            let member = reader.len_prefixed("zset member")?;
            engine.zadd(&key, score, &member);
        }
        if nitems > 0 && expire_at_ms >= 0 {
            engine.set_zset_expire_at(&key, expire_at_ms);
        }
    }
    Ok(())
}

fn load_scalar_record(engine: &Engine, reader: &mut Reader) -> Result<()> {
    let key = reader.len_prefixed("scalar key")?;
    let value = reader.len_prefixed("scalar value")?;
    let expire_at_ms: i64 = reader.number("scalar expire")?;
    engine.set_with_expire_at(&key, &value, expire_at_ms);
    Ok(())
}

fn push_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(bytes);
}

/// Cursor over the snapshot bytes. Tokens are delimited by a single space
/// or newline; length-prefixed fields are consumed by count.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Read up to the next delimiter and consume it
    fn token(&mut self, what: &str) -> Result<String> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != b' ' && self.buf[self.pos] != b'\n'
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(truncated(what));
        }
        let token = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
        if self.pos < self.buf.len() {
            self.pos += 1; // consume the delimiter
        }
        Ok(token)
    }

    fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.token(what)?;
        token
            .parse()
            .map_err(|_| OrionError::Snapshot(format!("bad {} '{}'", what, token)))
    }

    fn expect_tag(&mut self, tag: &str) -> Result<()> {
        let token = self.token(tag)?;
        if token != tag {
            return Err(OrionError::Snapshot(format!(
                "expected section '{}', found '{}'",
                tag, token
            )));
        }
        Ok(())
    }

    /// `len SP bytes` followed by one delimiter byte
    fn len_prefixed(&mut self, what: &str) -> Result<Vec<u8>> {
        let len: usize = self.number(what)?;
        let end = self.pos.checked_add(len).ok_or_else(|| truncated(what))?;
        if self.buf.len() < end {
            return Err(truncated(what));
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        if self.pos < self.buf.len() {
            self.pos += 1; // delimiter after the payload
        }
        Ok(bytes)
    }
}

fn truncated(what: &str) -> OrionError {
    OrionError::Snapshot(format!("truncated while reading {}", what))
}
