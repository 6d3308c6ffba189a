//! Log writer thread
//!
//! Drains the record queue, appends bytes, and applies the fsync policy.
//! Durability progress is published through the shared condvar so enqueuers
//! in always mode can block until their sequence number is on disk. The
//! rewriter can ask the writer to pause: the writer drains what is already
//! queued, signals "paused", and waits; on resume it reopens the (now
//! swapped) file and continues.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::config::AofMode;

use super::{WalMsg, WalShared};

/// How long the writer sleeps between queue checks while idle; bounds how
/// quickly it notices pause requests and shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Every-second policy interval
const SYNC_INTERVAL: Duration = Duration::from_millis(1000);

pub(super) fn writer_loop(shared: Arc<WalShared>, receiver: Receiver<WalMsg>, file: File) {
    let mut writer = Writer {
        shared,
        file,
        pending_bytes: 0,
        last_written_seq: 0,
        last_sync: Instant::now(),
    };
    writer.run(receiver);
}

struct Writer {
    shared: Arc<WalShared>,
    file: File,
    /// Bytes written since the last fsync
    pending_bytes: u64,
    /// Highest sequence number written to the file
    last_written_seq: u64,
    last_sync: Instant,
}

impl Writer {
    fn run(&mut self, receiver: Receiver<WalMsg>) {
        loop {
            if self.pause_point(&receiver).is_err() {
                return;
            }
            match receiver.recv_timeout(IDLE_WAIT) {
                Ok(WalMsg::Record { seq, bytes }) => {
                    if self.write_record(seq, &bytes).is_err() {
                        self.fail();
                        return;
                    }
                }
                Ok(WalMsg::SyncRequest) | Err(RecvTimeoutError::Timeout) => {
                    if self.sync_if_due().is_err() {
                        self.fail();
                        return;
                    }
                }
                Ok(WalMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    // drain whatever is still queued, then a final fsync
                    while let Ok(WalMsg::Record { seq, bytes }) = receiver.try_recv() {
                        if self.write_record(seq, &bytes).is_err() {
                            self.fail();
                            return;
                        }
                    }
                    if self.pending_bytes > 0 && self.sync().is_err() {
                        self.fail();
                    }
                    tracing::debug!("log writer stopped at seq {}", self.last_written_seq);
                    return;
                }
            }
        }
    }

    fn write_record(&mut self, seq: u64, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes)?;
        self.pending_bytes += bytes.len() as u64;
        self.last_written_seq = seq;

        match self.shared.mode {
            AofMode::Always => self.sync()?,
            AofMode::EverySecond => {
                if self.last_sync.elapsed() >= SYNC_INTERVAL
                    || self.pending_bytes >= self.shared.sync_pressure_bytes
                {
                    self.sync()?;
                }
            }
            AofMode::NoFsync => {
                // the OS flushes on its own; still report progress so a
                // stray durability wait cannot hang forever
                self.publish_durable();
            }
        }
        Ok(())
    }

    fn sync_if_due(&mut self) -> std::io::Result<()> {
        if self.shared.mode == AofMode::EverySecond
            && self.pending_bytes > 0
            && self.last_sync.elapsed() >= SYNC_INTERVAL
        {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()?;
        self.pending_bytes = 0;
        self.last_sync = Instant::now();
        self.publish_durable();
        Ok(())
    }

    fn publish_durable(&self) {
        let mut state = self.shared.durable.lock();
        if self.last_written_seq > state.last_synced_seq {
            state.last_synced_seq = self.last_written_seq;
        }
        drop(state);
        self.shared.durable_cv.notify_all();
    }

    /// Honor a pause request from the rewriter: drain the queue into the
    /// current file, signal paused, wait for resume, then reopen the file
    /// the rewriter renamed into place.
    fn pause_point(&mut self, receiver: &Receiver<WalMsg>) -> Result<(), ()> {
        if !self.shared.pause.lock().requested {
            return Ok(());
        }

        let mut shutdown_seen = false;
        while let Ok(msg) = receiver.try_recv() {
            match msg {
                WalMsg::Record { seq, bytes } => {
                    if self.write_record(seq, &bytes).is_err() {
                        self.fail();
                        return Err(());
                    }
                }
                WalMsg::SyncRequest => {}
                // honored once the pause cycle completes
                WalMsg::Shutdown => shutdown_seen = true,
            }
        }
        if self.pending_bytes > 0 && self.sync().is_err() {
            self.fail();
            return Err(());
        }

        let mut pause = self.shared.pause.lock();
        pause.paused = true;
        self.shared.pause_cv.notify_all();
        while pause.requested {
            self.shared.pause_cv.wait(&mut pause);
        }
        pause.paused = false;
        drop(pause);

        match OpenOptions::new().create(true).append(true).open(&self.shared.path) {
            Ok(file) => {
                self.file = file;
                self.pending_bytes = 0;
                tracing::debug!("log writer resumed on rewritten file");
                if shutdown_seen {
                    tracing::debug!("log writer stopped at seq {}", self.last_written_seq);
                    return Err(());
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!("cannot reopen log after rewrite: {}", e);
                self.fail();
                Err(())
            }
        }
    }

    /// An I/O failure is fatal to durability: flag it, wake every waiter,
    /// and let the thread exit.
    fn fail(&self) {
        self.shared.failed.store(true, Ordering::SeqCst);
        let mut state = self.shared.durable.lock();
        state.failed = true;
        drop(state);
        self.shared.durable_cv.notify_all();
        tracing::error!("log writer shutting down after I/O failure");
    }
}
