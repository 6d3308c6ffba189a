//! Replica client
//!
//! Background thread on a follower node. Connects to the primary, sends
//! `SYNC` (or `PSYNC <offset>` when resuming), and then consumes the reply
//! stream: a bulk-string frame is a bootstrap snapshot, written to the
//! local snapshot path and loaded in place of current state; array frames
//! are commands applied straight to the engine (no log enqueue, no
//! re-broadcast); and `+OFFSET <n>` markers advance the resume offset.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::Config;
use crate::engine::Engine;
use crate::protocol::{apply, frame_to_argv, Command, Frame, Parser};
use crate::snapshot;

/// Delay between reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Read timeout so the stop flag is observed while idle
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Handle to the replication thread
pub struct ReplicaClient {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReplicaClient {
    /// Spawn the replication thread when replication is configured.
    pub fn start(config: &Config, engine: Arc<Engine>) -> Option<ReplicaClient> {
        if !config.replica.enabled {
            return None;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let master_addr = format!(
            "{}:{}",
            config.replica.master_host, config.replica.master_port
        );
        let rdb_path = config.rdb_path();

        let handle = std::thread::Builder::new()
            .name("orionkv-replica".to_string())
            .spawn(move || replica_loop(master_addr, rdb_path, engine, thread_stop))
            .ok()?;

        Some(ReplicaClient {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplicaClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn replica_loop(master_addr: String, rdb_path: PathBuf, engine: Arc<Engine>, stop: Arc<AtomicBool>) {
    let mut last_offset: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        match follow_once(&master_addr, &rdb_path, &engine, &stop, &mut last_offset) {
            Ok(()) => tracing::info!("primary connection ended, reconnecting"),
            Err(e) => tracing::warn!("replication error: {}", e),
        }
        if stop.load(Ordering::Relaxed) {
            break;
        }
        std::thread::sleep(RECONNECT_DELAY);
    }
}

/// One connection lifetime: handshake, then stream until EOF or stop
fn follow_once(
    master_addr: &str,
    rdb_path: &Path,
    engine: &Engine,
    stop: &AtomicBool,
    last_offset: &mut u64,
) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(master_addr)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let handshake = if *last_offset > 0 {
        Frame::array_of_bulks([b"PSYNC".to_vec(), last_offset.to_string().into_bytes()])
    } else {
        Frame::array_of_bulks([b"SYNC".to_vec()])
    };
    stream.write_all(&handshake.to_bytes())?;
    tracing::info!("following {} from offset {}", master_addr, last_offset);

    let mut parser = Parser::new();
    let mut buf = [0u8; 8192];
    while !stop.load(Ordering::Relaxed) {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => parser.append(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => return Err(e),
        }

        loop {
            match parser.try_parse_one() {
                Ok(Some(frame)) => handle_frame(engine, rdb_path, &frame, last_offset),
                Ok(None) => break,
                Err(e) => {
                    return Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        format!("malformed frame from primary: {}", e),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Dispatch one frame from the primary. Every frame type is handled at this
/// level: bulk = bootstrap snapshot, array = streamed command, simple
/// string = offset marker.
fn handle_frame(engine: &Engine, rdb_path: &Path, frame: &Frame, last_offset: &mut u64) {
    match frame {
        Frame::Bulk(payload) => {
            if let Some(dir) = rdb_path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(e) = std::fs::write(rdb_path, payload) {
                tracing::warn!("cannot persist bootstrap snapshot: {}", e);
            }
            engine.clear_all();
            match snapshot::load_bytes(engine, payload) {
                Ok(()) => tracing::info!("bootstrap snapshot applied, {} bytes", payload.len()),
                Err(e) => tracing::error!("bootstrap snapshot rejected: {}", e),
            }
        }
        Frame::Array(_) => {
            let Some(argv) = frame_to_argv(frame) else {
                tracing::warn!("ignoring non-bulk array from primary");
                return;
            };
            match Command::parse(&argv) {
                Ok(cmd) => {
                    let mut store = engine.lock();
                    apply(&mut store, &cmd);
                }
                Err(e) => tracing::warn!("ignoring streamed command: {}", e),
            }
        }
        Frame::Simple(line) => {
            if let Some(rest) = line.strip_prefix("OFFSET ") {
                match rest.parse::<u64>() {
                    Ok(offset) => *last_offset = offset,
                    Err(_) => tracing::warn!("bad offset marker '{}'", line),
                }
            }
        }
        Frame::Error(message) => tracing::warn!("primary reported: {}", message),
        Frame::Integer(_) | Frame::NullBulk => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_offset_marker_handled_at_outer_level() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new();
        let mut last_offset = 0;

        handle_frame(
            &engine,
            &dir.path().join("dump.mrdb"),
            &Frame::Simple("OFFSET 4242".into()),
            &mut last_offset,
        );
        assert_eq!(last_offset, 4242);

        // a garbled marker leaves the offset alone
        handle_frame(
            &engine,
            &dir.path().join("dump.mrdb"),
            &Frame::Simple("OFFSET soon".into()),
            &mut last_offset,
        );
        assert_eq!(last_offset, 4242);
    }

    #[test]
    fn test_streamed_commands_apply_to_engine() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new();
        let mut last_offset = 0;

        let set = Frame::array_of_bulks([b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        handle_frame(&engine, &dir.path().join("dump.mrdb"), &set, &mut last_offset);
        assert_eq!(engine.get(b"k"), Some(b"v".to_vec()));

        let del = Frame::array_of_bulks([b"DEL".to_vec(), b"k".to_vec()]);
        handle_frame(&engine, &dir.path().join("dump.mrdb"), &del, &mut last_offset);
        assert_eq!(engine.get(b"k"), None);
    }

    #[test]
    fn test_bulk_snapshot_replaces_state() {
        let dir = TempDir::new().unwrap();
        let rdb_path = dir.path().join("dump.mrdb");

        let primary = Engine::new();
        primary.set(b"a", b"1", None);
        primary.zadd(b"z", 2.5, b"m");
        let payload = snapshot::serialize(&primary);

        let replica = Engine::new();
        replica.set(b"stale", b"x", None);
        let mut last_offset = 0;
        handle_frame(&replica, &rdb_path, &Frame::Bulk(payload), &mut last_offset);

        assert_eq!(replica.get(b"stale"), None, "prior state must be replaced");
        assert_eq!(replica.fingerprint(), primary.fingerprint());
        assert!(rdb_path.exists(), "snapshot payload must be persisted");
    }
}
