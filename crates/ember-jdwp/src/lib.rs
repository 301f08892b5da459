//! JDWP (Java Debug Wire Protocol) agent embedded in the Ember runtime.
//!
//! This crate owns the debugger session lifecycle inside a runtime process:
//! parsing the `-agentlib`-style debug option string, bringing up the
//! transport (accepting a debugger or dialing out to one), running the
//! dedicated `JDWP` worker thread that frames and dispatches packets, and
//! coordinating shutdown and per-session reset.
//!
//! Command decoding, the event-request registry, and the rest of the runtime
//! are reached exclusively through the injected [`RuntimeHooks`] trait; the
//! crate holds no process-global state. The wire-level rules implemented here
//! are the JDWP transport ones only: the 14-byte `JDWP-Handshake` exchange
//! and the 4-byte big-endian length framing of every subsequent packet.

use std::fmt;
use std::io;

use thiserror::Error;

pub mod codec;
pub mod options;
pub mod runtime;
pub mod session;

mod net;
mod poison;
mod transport;

pub use codec::{PacketBuf, Request};
pub use options::{parse_jdwp_options, JdwpOptions, JdwpTransport};
pub use runtime::{ReplyAction, RuntimeHooks, ThreadState};
pub use session::{AttachState, JdwpState};

pub type ObjectId = u64;
pub type ThreadId = u64;
pub type RefTypeId = u64;
pub type MethodId = u64;

/// A code location as exchanged with the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpLocation {
    pub type_tag: u8,
    pub class_id: RefTypeId,
    pub method_id: MethodId,
    pub dex_pc: u64,
}

impl fmt::Display for JdwpLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JdwpLocation[{:#x}.{:#x}@{:#x} {}]",
            self.class_id, self.method_id, self.dex_pc, self.type_tag
        )
    }
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("invalid JDWP options: {0}")]
    InvalidOptions(String),

    /// The option string was the literal `help`; usage has been logged.
    #[error("JDWP usage help requested")]
    Usage,

    #[error("transport bring-up failed: {0}")]
    Transport(String),

    #[error("connection with debugger is closed")]
    NotConnected,

    #[error("JDWP connection failed")]
    AttachFailed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, JdwpError>;
