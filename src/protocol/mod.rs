//! Wire protocol
//!
//! Frames messages as one of five types, each introduced by a one-byte
//! prefix and terminated by CRLF:
//!
//! ```text
//! +OK\r\n                      simple string
//! -ERR something\r\n           error
//! :42\r\n                      integer
//! $5\r\nhello\r\n              length-prefixed binary string
//! *2\r\n$3\r\nGET\r\n$1\r\nk\r\n   array of nested values
//! ```
//!
//! The parser is restartable: bytes are appended as they arrive and a
//! complete frame is only consumed once all of it is buffered.

mod codec;
mod command;
mod frame;

pub use codec::Parser;
pub use command::{apply, format_score, frame_to_argv, Command};
pub use frame::{Frame, FrameError};
