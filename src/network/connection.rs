//! Connection state
//!
//! One client socket with its inbound parse buffer, outbound byte buffer
//! (with partial-write position), and the replica-follower flag. All I/O is
//! nonblocking; `WouldBlock` is the readiness signal the reactor polls on.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};

use crate::protocol::{Frame, Parser};

/// What one read pass observed on a socket
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// New bytes were appended to the parse buffer
    Progress,
    /// Nothing to read right now
    Idle,
    /// Peer closed its end
    Closed,
}

/// A single client connection owned by the reactor
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// Inbound bytes and in-progress parse position
    pub parser: Parser,
    outbound: Vec<u8>,
    /// How much of `outbound` has already reached the socket
    written: usize,
    /// Set once the peer issues SYNC/PSYNC; mutating commands are then
    /// streamed into this connection's outbound buffer
    pub is_replica: bool,
    /// Close once the outbound buffer drains (post-error farewells)
    pub close_after_flush: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Connection {
            stream,
            peer,
            parser: Parser::new(),
            outbound: Vec::new(),
            written: 0,
            is_replica: false,
            close_after_flush: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Drain whatever the socket has into the parse buffer
    pub fn read_ready(&mut self) -> std::io::Result<ReadOutcome> {
        let mut buf = [0u8; 4096];
        let mut any = false;
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    self.parser.append(&buf[..n]);
                    any = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(if any {
            ReadOutcome::Progress
        } else {
            ReadOutcome::Idle
        })
    }

    pub fn queue_frame(&mut self, frame: &Frame) {
        frame.encode(&mut self.outbound);
    }

    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    pub fn has_pending_output(&self) -> bool {
        self.written < self.outbound.len()
    }

    /// Push buffered output to the socket; returns true once the buffer is
    /// fully drained. `WouldBlock` leaves the remainder for the next pass.
    pub fn flush(&mut self) -> std::io::Result<bool> {
        while self.written < self.outbound.len() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "peer stopped accepting bytes",
                    ))
                }
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.outbound.clear();
        self.written = 0;
        Ok(true)
    }
}
