//! Background log rewrite
//!
//! Compacts the log to the minimal command sequence that reconstructs the
//! current engine state, then appends whatever arrived while the base was
//! being written. The swap protocol with the writer thread:
//!
//! 1. under one engine acquisition, turn on incremental buffering and take
//!    the three family snapshots; every mutation is now either in the
//!    snapshot or in the buffer, never both and never neither;
//! 2. serialize the snapshots as commands into a sibling temp file;
//! 3. holding the buffer mutex (which the enqueue path shares, so no record
//!    can slip between steps), ask the writer to pause and wait for its
//!    signal, append the buffered tail, rename the temp file over the log,
//!    and resume the writer, which reopens the new file.

use std::fs::{self, File};
use std::io::Write;

use crate::engine::{now_ms, Engine, HashSnapshot, ScalarSnapshot, ZSetSnapshot};
use crate::error::{OrionError, Result};
use crate::protocol::{format_score, Frame};

use super::WalShared;

pub(super) fn run(shared: &WalShared, engine: &Engine) -> Result<()> {
    let started = std::time::Instant::now();

    // buffering on and snapshots taken under the same engine acquisition
    let (scalars, hashes, zsets) = {
        let store = engine.lock();
        shared.incr.lock().active = true;
        (
            store.snapshot_scalars(),
            store.snapshot_hashes(),
            store.snapshot_zsets(),
        )
    };

    let result = write_and_swap(shared, scalars, hashes, zsets);
    if result.is_err() {
        // never leave buffering on after a failed attempt
        let mut incr = shared.incr.lock();
        incr.active = false;
        incr.records.clear();
    }
    if result.is_ok() {
        tracing::info!(
            "log rewrite complete in {} ms, new size {} bytes",
            started.elapsed().as_millis(),
            fs::metadata(&shared.path).map(|m| m.len()).unwrap_or(0)
        );
    }
    result
}

fn write_and_swap(
    shared: &WalShared,
    scalars: Vec<ScalarSnapshot>,
    hashes: Vec<HashSnapshot>,
    zsets: Vec<ZSetSnapshot>,
) -> Result<()> {
    let tmp_path = shared.path.with_extension("rewrite");
    let mut file = File::create(&tmp_path)
        .map_err(|e| OrionError::Wal(format!("cannot create rewrite file: {}", e)))?;

    let now = now_ms();
    let mut base = Vec::new();
    encode_base_commands(&mut base, &scalars, &hashes, &zsets, now);
    file.write_all(&base)?;

    // seal the incremental buffer and swap files with the writer parked
    let mut incr = shared.incr.lock();
    shared.pause.lock().requested = true;
    {
        let mut pause = shared.pause.lock();
        while !pause.paused {
            if shared.failed.load(std::sync::atomic::Ordering::SeqCst) {
                pause.requested = false;
                return Err(OrionError::Wal("writer failed during rewrite".into()));
            }
            let _ = shared
                .pause_cv
                .wait_for(&mut pause, std::time::Duration::from_millis(200));
        }
    }

    let swap = (|| -> Result<()> {
        for record in incr.records.drain(..) {
            file.write_all(&record)?;
        }
        incr.active = false;
        file.sync_all()?;
        fs::rename(&tmp_path, &shared.path)?;
        Ok(())
    })();

    let mut pause = shared.pause.lock();
    pause.requested = false;
    shared.pause_cv.notify_all();
    drop(pause);

    swap
}

fn encode_base_commands(
    out: &mut Vec<u8>,
    scalars: &[ScalarSnapshot],
    hashes: &[HashSnapshot],
    zsets: &[ZSetSnapshot],
    now: i64,
) {
    for rec in scalars {
        if is_dead(rec.expire_at_ms, now) {
            continue;
        }
        push_command(out, [b"SET".to_vec(), rec.key.clone(), rec.value.clone()]);
        push_expire(out, &rec.key, rec.expire_at_ms, now);
    }
    for rec in hashes {
        if is_dead(rec.expire_at_ms, now) {
            continue;
        }
        for (field, value) in &rec.fields {
            push_command(
                out,
                [
                    b"HSET".to_vec(),
                    rec.key.clone(),
                    field.clone(),
                    value.clone(),
                ],
            );
        }
        push_expire(out, &rec.key, rec.expire_at_ms, now);
    }
    for rec in zsets {
        if is_dead(rec.expire_at_ms, now) {
            continue;
        }
        for (score, member) in &rec.items {
            push_command(
                out,
                [
                    b"ZADD".to_vec(),
                    rec.key.clone(),
                    format_score(*score).into_bytes(),
                    member.clone(),
                ],
            );
        }
        push_expire(out, &rec.key, rec.expire_at_ms, now);
    }
}

fn is_dead(expire_at_ms: i64, now: i64) -> bool {
    expire_at_ms >= 0 && expire_at_ms <= now
}

fn push_command<const N: usize>(out: &mut Vec<u8>, parts: [Vec<u8>; N]) {
    Frame::array_of_bulks(parts).encode(out);
}

fn push_expire(out: &mut Vec<u8>, key: &[u8], expire_at_ms: i64, now: i64) {
    if expire_at_ms < 0 {
        return;
    }
    // round up so a replay never expires a key earlier than the original
    let seconds = (expire_at_ms - now + 999) / 1000;
    push_command(
        out,
        [
            b"EXPIRE".to_vec(),
            key.to_vec(),
            seconds.max(1).to_string().into_bytes(),
        ],
    );
}
