//! The seam between the JDWP session core and the rest of the runtime.
//!
//! The session controller never reaches for runtime globals; everything it
//! needs from the embedding VM (thread attachment, command dispatch, the
//! event-request registry, DDM notifications) is injected through
//! [`RuntimeHooks`] at construction time.

use crate::codec::{PacketBuf, Request};
use crate::ThreadId;

/// Runtime-visible state of the debug worker thread.
///
/// While the worker sits in its main loop it reports
/// [`ThreadState::WaitingInMainDebuggerLoop`] so the garbage collector does
/// not wait on it; outside the loop it is a plain native thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Native,
    WaitingInMainDebuggerLoop,
}

/// What the command dispatcher wants done with the reply buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    /// Write the reply packet to the debugger.
    Send,
    /// No reply for this packet (e.g. a DDM chunk with no answer). The reply
    /// buffer must be empty.
    Skip,
}

/// Capabilities the session controller borrows from the embedding runtime.
///
/// The methods with default bodies are conveniences for embedders (and test
/// doubles) that do not care about the corresponding runtime feature; the
/// required ones are the contract the core cannot function without.
pub trait RuntimeHooks: Send + Sync {
    /// Attach the calling thread to the runtime as a system thread.
    fn attach_current_thread(&self, _name: &str) {}

    fn detach_current_thread(&self) {}

    fn set_thread_state(&self, _state: ThreadState) {}

    /// Identity of the calling thread as the debugger sees it.
    fn current_thread_id(&self) -> ThreadId;

    /// A debugger connection has been established (handshake may still be
    /// outstanding).
    fn connected(&self) {}

    /// The debugger is gone; the rest of the runtime should stop treating the
    /// process as debugged.
    fn disconnected(&self) {}

    /// True once the debugger subsystem has been disposed; the worker stops
    /// reading when this flips.
    fn is_disposed(&self) -> bool {
        false
    }

    /// Whether a debugger is currently attached and active.
    fn is_debugger_active(&self) -> bool;

    /// Re-resume any threads the debugger left suspended.
    fn undo_debugger_suspensions(&self) {}

    /// Decode and execute one command packet, filling `reply`.
    ///
    /// The reply buffer is written to the wire verbatim when the outcome is
    /// [`ReplyAction::Send`]; for [`ReplyAction::Skip`] it must stay empty.
    fn process_request(&self, request: &Request<'_>, reply: &mut PacketBuf) -> ReplyAction;

    /// Drop every registered event request (session reset).
    fn unregister_all_events(&self) {}

    /// True while the event-request registry is non-empty. Checked (debug
    /// builds only) after [`RuntimeHooks::unregister_all_events`].
    fn has_registered_events(&self) -> bool {
        false
    }

    fn ddm_connected(&self) {}

    fn ddm_disconnected(&self) {}

    /// Terminate the process with `status`.
    ///
    /// Expected not to return; if a test double returns anyway, the debug
    /// worker shuts down instead.
    fn exit(&self, status: i32) {
        std::process::exit(status);
    }
}
