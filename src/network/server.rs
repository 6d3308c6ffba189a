//! Single-reactor server
//!
//! One thread owns the listener and every client socket. Readiness is
//! discovered by attempting nonblocking reads and writes; a pass with no
//! progress sleeps briefly so the loop stays cooperative without spinning.
//! A 100 ms tick drives expiry sampling, the log's every-second fsync
//! check, snapshot save intervals, and replica offset markers.
//!
//! ## Dispatch contract
//! A parsed command frame maps to one engine call made under the engine
//! exclusion. While that exclusion is held, a mutating command's raw frame
//! is also enqueued to the append log and broadcast into every attached
//! replica's outbound buffer, so log order and replica order both equal
//! engine order. In always-fsync mode the response is queued only after the
//! record is durable.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{AofMode, Config};
use crate::engine::Engine;
use crate::error::{OrionError, Result};
use crate::protocol::{apply, frame_to_argv, Command, Frame};
use crate::snapshot;
use crate::wal::Wal;

use super::connection::{Connection, ReadOutcome};

/// Periodic tick interval
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Expiry-index entries examined per tick
const EXPIRE_SCAN_STEPS: usize = 20;

/// Idle sleep when a full pass made no progress
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Minimum spacing between size-triggered rewrite attempts
const REWRITE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// The reactor: acceptor, connection table, dispatch, periodic tick
pub struct Server {
    config: Config,
    engine: Arc<Engine>,
    wal: Option<Arc<Wal>>,
    listener: Option<TcpListener>,
    connections: HashMap<u64, Connection>,
    next_conn_id: u64,
    stop: Arc<AtomicBool>,
    /// Bytes of serialized mutations emitted since this primary started
    repl_offset: u64,
    /// Offset value last announced to replicas
    last_marker_offset: u64,
    last_rewrite_attempt: Instant,
}

impl Server {
    pub fn new(config: Config, engine: Arc<Engine>, wal: Option<Arc<Wal>>) -> Self {
        Server {
            config,
            engine,
            wal,
            listener: None,
            connections: HashMap::new(),
            next_conn_id: 1,
            stop: Arc::new(AtomicBool::new(false)),
            repl_offset: 0,
            last_marker_offset: 0,
            last_rewrite_attempt: Instant::now(),
        }
    }

    /// Flag that makes `run` wind down at its next pass
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Bound address once `run` has bound the listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind and serve until the stop flag is raised (blocking)
    pub fn bind(&mut self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .map_err(|e| OrionError::Network(format!("cannot bind {}: {}", addr, e)))?;
        listener.set_nonblocking(true)?;
        tracing::info!("listening on {}", addr);
        self.listener = Some(listener);
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind()?;
        }

        let mut last_tick = Instant::now();
        let mut last_save = Instant::now();

        while !self.stop.load(Ordering::Relaxed) {
            let mut progress = self.accept_pass();
            progress |= self.io_pass();

            if last_tick.elapsed() >= TICK_INTERVAL {
                last_tick = Instant::now();
                self.tick(&mut last_save);
            }

            if !progress {
                std::thread::sleep(IDLE_SLEEP);
            }
        }

        self.shutdown_pass();
        Ok(())
    }

    /// Accept every pending connection
    fn accept_pass(&mut self) -> bool {
        let Some(listener) = self.listener.as_ref() else {
            return false;
        };
        let mut accepted = false;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => match Connection::new(stream, peer) {
                    Ok(conn) => {
                        let id = self.next_conn_id;
                        self.next_conn_id += 1;
                        tracing::debug!("accepted connection from {}", peer);
                        self.connections.insert(id, conn);
                        accepted = true;
                    }
                    Err(e) => tracing::warn!("cannot set up connection from {}: {}", peer, e),
                },
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if !self.stop.load(Ordering::Relaxed) {
                        tracing::error!("accept error: {}", e);
                    }
                    break;
                }
            }
        }
        accepted
    }

    /// One read/dispatch/write pass over every connection
    fn io_pass(&mut self) -> bool {
        let mut progress = false;
        let ids: Vec<u64> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(mut conn) = self.connections.remove(&id) else {
                continue;
            };

            match conn.read_ready() {
                Ok(ReadOutcome::Closed) => {
                    // partial parse buffer is discarded with the connection
                    tracing::debug!("connection {} closed by peer", conn.peer_addr());
                    continue;
                }
                Ok(ReadOutcome::Progress) => progress = true,
                Ok(ReadOutcome::Idle) => {}
                Err(e) => {
                    tracing::debug!("connection {} read error: {}", conn.peer_addr(), e);
                    continue;
                }
            }

            if !conn.close_after_flush {
                self.drain_frames(&mut conn);
            }

            match conn.flush() {
                Ok(true) => {
                    if conn.close_after_flush {
                        tracing::debug!("connection {} closed after error", conn.peer_addr());
                    } else {
                        self.connections.insert(id, conn);
                    }
                }
                Ok(false) => {
                    progress = true;
                    self.connections.insert(id, conn);
                }
                Err(e) => {
                    tracing::debug!("connection {} write error: {}", conn.peer_addr(), e);
                }
            }
        }
        progress
    }

    /// Parse and dispatch every complete frame buffered on the connection
    fn drain_frames(&mut self, conn: &mut Connection) {
        loop {
            match conn.parser.try_parse_one_with_raw() {
                Ok(Some((frame, raw))) => self.dispatch(conn, &frame, &raw),
                Ok(None) => break,
                Err(e) => {
                    // malformed framing: say why, then drop the connection
                    conn.queue_frame(&Frame::Error(format!("ERR protocol error: {}", e)));
                    conn.close_after_flush = true;
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, conn: &mut Connection, frame: &Frame, raw: &[u8]) {
        let Some(argv) = frame_to_argv(frame) else {
            conn.queue_frame(&Frame::Error(
                "ERR protocol error: expected array of bulk strings".into(),
            ));
            conn.close_after_flush = true;
            return;
        };

        let cmd = match Command::parse(&argv) {
            Ok(cmd) => cmd,
            Err(e) => {
                conn.queue_frame(&Frame::Error(format!("ERR {}", e)));
                return;
            }
        };

        match cmd {
            Command::Sync => self.attach_replica(conn, None),
            Command::Psync { offset } => self.attach_replica(conn, Some(offset)),
            cmd => {
                let mutating = cmd.is_mutating();

                if mutating {
                    if let Some(wal) = &self.wal {
                        if wal.is_failed() {
                            conn.queue_frame(&Frame::Error(
                                "ERR log writer failed, mutations disabled".into(),
                            ));
                            self.stop.store(true, Ordering::Relaxed);
                            return;
                        }
                    }
                }

                // apply + log enqueue + replica broadcast under one engine
                // acquisition: log and replica order equal engine order
                let engine = Arc::clone(&self.engine);
                let (response, seq) = {
                    let mut store = engine.lock();
                    let response = apply(&mut store, &cmd);
                    let mut seq = None;
                    if mutating {
                        if let Some(wal) = &self.wal {
                            seq = Some(wal.enqueue(raw));
                        }
                        self.repl_offset += raw.len() as u64;
                        for other in self.connections.values_mut() {
                            if other.is_replica {
                                other.queue_bytes(raw);
                            }
                        }
                    }
                    (response, seq)
                };

                if let (Some(seq), Some(wal)) = (seq, &self.wal) {
                    if wal.mode() == AofMode::Always {
                        if let Err(e) = wal.wait_durable(seq) {
                            tracing::error!("durability wait failed: {}", e);
                            conn.queue_frame(&Frame::Error(
                                "ERR log writer failed, mutations disabled".into(),
                            ));
                            self.stop.store(true, Ordering::Relaxed);
                            return;
                        }
                    }
                }

                conn.queue_frame(&response);
            }
        }
    }

    /// Answer SYNC/PSYNC: bulk snapshot (unless the follower is already at
    /// the current offset), an offset marker, and follower registration.
    fn attach_replica(&mut self, conn: &mut Connection, offset: Option<u64>) {
        if offset != Some(self.repl_offset) {
            let bytes = snapshot::serialize(&self.engine);
            tracing::info!(
                "replica {} bootstrapping with {} byte snapshot",
                conn.peer_addr(),
                bytes.len()
            );
            conn.queue_frame(&Frame::Bulk(bytes));
        } else {
            tracing::info!("replica {} resuming at offset {}", conn.peer_addr(), self.repl_offset);
        }
        conn.queue_bytes(format!("+OFFSET {}\r\n", self.repl_offset).as_bytes());
        conn.is_replica = true;
    }

    /// 100 ms duties: expiry sampling, log sync check, size-triggered
    /// rewrite, timed snapshot, offset markers.
    fn tick(&mut self, last_save: &mut Instant) {
        let evicted = self.engine.expire_scan_step(EXPIRE_SCAN_STEPS);
        if evicted > 0 {
            tracing::debug!("expiry scan evicted {} keys", evicted);
        }

        if let Some(wal) = &self.wal {
            wal.request_sync();

            if wal.file_size() > self.config.aof.rewrite_threshold_bytes
                && self.last_rewrite_attempt.elapsed() >= REWRITE_RETRY_INTERVAL
            {
                self.last_rewrite_attempt = Instant::now();
                if wal.start_rewrite(Arc::clone(&self.engine)) {
                    tracing::info!("log passed {} bytes, rewrite started", wal.file_size());
                }
            }
        }

        let interval = self.config.rdb.save_interval_seconds;
        if self.config.rdb.enabled
            && interval > 0
            && last_save.elapsed() >= Duration::from_secs(interval)
        {
            *last_save = Instant::now();
            if let Err(e) = snapshot::save(&self.engine, &self.config.rdb_path()) {
                tracing::error!("timed snapshot failed: {}", e);
            }
        }

        if self.repl_offset != self.last_marker_offset {
            self.last_marker_offset = self.repl_offset;
            let marker = format!("+OFFSET {}\r\n", self.repl_offset);
            for conn in self.connections.values_mut() {
                if conn.is_replica {
                    conn.queue_bytes(marker.as_bytes());
                }
            }
        }
    }

    /// Best-effort wind-down: flush what we can, final log fsync, final
    /// snapshot when snapshots are on.
    fn shutdown_pass(&mut self) {
        tracing::info!("shutting down, flushing {} connections", self.connections.len());
        for conn in self.connections.values_mut() {
            let _ = conn.flush();
        }
        self.connections.clear();

        if let Some(wal) = &self.wal {
            wal.shutdown();
        }

        if self.config.rdb.enabled {
            if let Err(e) = snapshot::save(&self.engine, &self.config.rdb_path()) {
                tracing::error!("final snapshot failed: {}", e);
            }
        }
        tracing::info!("server stopped");
    }
}
