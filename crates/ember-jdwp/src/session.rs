//! The JDWP session controller.
//!
//! [`JdwpState::create`] brings up the transport, spawns the dedicated `JDWP`
//! worker thread, and (for `suspend=y`) blocks the caller until a debugger is
//! attached or the attempt has definitively failed. The worker owns all
//! blocking I/O: it waits for a connection, pumps bytes through the net
//! state, and answers each framed packet via the runtime's command
//! dispatcher. Dropping the state quiesces in-flight packet handling, wakes
//! the worker, joins it, and resets per-session debugger state.
//!
//! Each cross-thread handshake (worker startup, debugger attach, packet
//! quiescence, the single-in-flight token) is its own mutex/condvar pair;
//! none of them is ever held across socket I/O, and they never nest.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::codec::{PacketBuf, Request};
use crate::net::{NetShared, NetState};
use crate::options::JdwpOptions;
use crate::poison;
use crate::runtime::{ReplyAction, RuntimeHooks, ThreadState};
use crate::transport;
use crate::{JdwpError, Result, ThreadId};

/// First serial used for runtime-initiated request packets.
const REQUEST_SERIAL_START: u32 = 0x1000_0000;
/// First serial used in replies to `EventRequest.Set`.
const EVENT_SERIAL_START: u32 = 0x2000_0000;

/// Token owner id meaning "free".
const TOKEN_FREE: ThreadId = 0;

/// Progress of the debugger attach, observed by `suspend=y` callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    NotAttached,
    /// Dialing out to the debugger failed; the session will never attach.
    Failed,
    Attached(ThreadId),
}

/// The embedded JDWP agent.
///
/// Owning handle over the shared session state; dropping it quiesces and
/// joins the worker.
pub struct JdwpState {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    options: JdwpOptions,
    runtime: Arc<dyn RuntimeHooks>,

    /// Shared half of the net state; `None` once the session is torn down.
    net: Mutex<Option<Arc<NetShared>>>,

    /// Anchor for the monotonic millisecond clock.
    clock: Instant,

    thread_start_lock: Mutex<bool>,
    thread_start_cond: Condvar,

    attach_lock: Mutex<AttachState>,
    attach_cond: Condvar,

    token_lock: Mutex<ThreadId>,
    token_cond: Condvar,

    shutdown_lock: Mutex<bool>,
    shutdown_cond: Condvar,

    run: AtomicBool,
    ddm_active: AtomicBool,
    should_exit: AtomicBool,
    exit_status: AtomicI32,
    last_activity_time_ms: AtomicI64,
    request_serial: AtomicU32,
    event_serial: AtomicU32,

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JdwpState {
    /// Bring up the agent: transport init, worker spawn, and (for
    /// `suspend=y`) the attach wait.
    ///
    /// Does not return until the worker is running; with `suspend=y` it also
    /// waits until a debugger is attached or the attempt failed, so the
    /// runtime never executes user code undebugged.
    pub fn create(options: JdwpOptions, runtime: Arc<dyn RuntimeHooks>) -> Result<JdwpState> {
        let shared = Arc::new(NetShared::new());
        let net_state = transport::init(&options, &shared)?;

        let inner = Arc::new(SessionInner {
            options,
            runtime,
            net: Mutex::new(Some(shared)),
            clock: Instant::now(),
            thread_start_lock: Mutex::new(false),
            thread_start_cond: Condvar::new(),
            attach_lock: Mutex::new(AttachState::NotAttached),
            attach_cond: Condvar::new(),
            token_lock: Mutex::new(TOKEN_FREE),
            token_cond: Condvar::new(),
            shutdown_lock: Mutex::new(false),
            shutdown_cond: Condvar::new(),
            run: AtomicBool::new(false),
            ddm_active: AtomicBool::new(false),
            should_exit: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            last_activity_time_ms: AtomicI64::new(0),
            request_serial: AtomicU32::new(REQUEST_SERIAL_START),
            event_serial: AtomicU32::new(EVENT_SERIAL_START),
            worker: Mutex::new(None),
        });

        {
            // Hold the start lock while spawning so the worker cannot signal
            // before we are waiting.
            let mut started = poison::lock(&inner.thread_start_lock, "jdwp thread start");
            let worker_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("JDWP".to_owned())
                .spawn(move || worker_inner.run_worker(net_state))?;
            *poison::lock(&inner.worker, "jdwp worker handle") = Some(handle);
            while !*started {
                started = poison::wait(&inner.thread_start_cond, started, "jdwp thread start");
            }
        }

        let state = JdwpState { inner };

        if state.inner.options.suspend {
            {
                let mut attach = poison::lock(&state.inner.attach_lock, "jdwp attach");
                while *attach == AttachState::NotAttached {
                    attach = poison::wait(&state.inner.attach_cond, attach, "jdwp attach");
                }
            }
            if !state.is_active() {
                tracing::error!(target = "ember.jdwp", "JDWP connection failed");
                return Err(JdwpError::AttachFailed);
            }
            tracing::info!(target = "ember.jdwp", "JDWP connected");
        }

        Ok(state)
    }

    /// Whether a debugger is talking to us.
    pub fn is_active(&self) -> bool {
        self.is_connected()
    }

    pub fn is_connected(&self) -> bool {
        poison::lock(&self.inner.net, "jdwp net state")
            .as_ref()
            .is_some_and(|shared| shared.is_connected())
    }

    /// Bound listen address in `server=y` mode, once the transport is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        poison::lock(&self.inner.net, "jdwp net state")
            .as_ref()
            .and_then(|shared| shared.listen_addr())
    }

    pub fn attach_state(&self) -> AttachState {
        *poison::lock(&self.inner.attach_lock, "jdwp attach")
    }

    /// Identity of the debug worker thread, once a debugger has attached.
    pub fn debug_thread_id(&self) -> Option<ThreadId> {
        match self.attach_state() {
            AttachState::Attached(id) => Some(id),
            AttachState::NotAttached | AttachState::Failed => None,
        }
    }

    /// Milliseconds since the debugger was last heard from.
    ///
    /// Returns -1 when no debugger is active and 0 while a request is being
    /// processed (or before the first one completes).
    pub fn last_debugger_activity(&self) -> i64 {
        if !self.inner.runtime.is_debugger_active() {
            tracing::warn!(target = "ember.jdwp", "no active debugger");
            return -1;
        }
        let last = self.inner.last_activity_time_ms.load(Ordering::SeqCst);
        if last == 0 {
            tracing::debug!(target = "ember.jdwp", "debugger is busy");
            return 0;
        }
        let now = self.inner.milli_time();
        debug_assert!(now >= last);
        now - last
    }

    /// Ask the worker to terminate the process once the in-flight reply has
    /// been written.
    pub fn exit_after_replying(&self, status: i32) {
        tracing::warn!(target = "ember.jdwp", status, "debugger told the runtime to exit");
        self.inner.exit_status.store(status, Ordering::SeqCst);
        self.inner.should_exit.store(true, Ordering::SeqCst);
    }

    /// Record that DDM is in use so disconnects notify the DDM subsystem.
    pub fn notify_ddms_active(&self) {
        if !self.inner.ddm_active.swap(true, Ordering::SeqCst) {
            self.inner.runtime.ddm_connected();
        }
    }

    pub fn next_request_serial(&self) -> u32 {
        self.inner.request_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_event_serial(&self) -> u32 {
        self.inner.event_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a complete runtime-initiated packet to the debugger.
    pub fn send_request(&self, packet: &[u8]) {
        let Some(shared) = self.inner.net_shared() else {
            tracing::debug!(target = "ember.jdwp", "not sending JDWP packet: no debugger attached");
            return;
        };
        if !shared.is_connected() {
            tracing::debug!(target = "ember.jdwp", "not sending JDWP packet: no debugger attached");
            return;
        }
        match shared.write_packet(packet) {
            Ok(written) if written == packet.len() => {}
            Ok(written) => {
                tracing::error!(
                    target = "ember.jdwp",
                    written,
                    expected = packet.len(),
                    "failed to send JDWP packet to debugger"
                );
            }
            Err(err) => {
                tracing::error!(
                    target = "ember.jdwp",
                    error = %err,
                    "failed to send JDWP packet to debugger"
                );
            }
        }
    }

    /// Scatter-gather variant of [`JdwpState::send_request`], used by DDM
    /// chunk forwarding. `kind` is the 4CC chunk type, used for diagnostics
    /// only.
    pub fn send_buffered_request(&self, kind: u32, bufs: &[IoSlice<'_>]) {
        let Some(shared) = self.inner.net_shared() else {
            tracing::debug!(target = "ember.jdwp", "not sending JDWP packet: no debugger attached");
            return;
        };
        if !shared.is_connected() {
            tracing::debug!(target = "ember.jdwp", "not sending JDWP packet: no debugger attached");
            return;
        }
        let expected: usize = bufs.iter().map(|buf| buf.len()).sum();
        let kind = four_cc(kind);
        match shared.write_vectored_packet(bufs) {
            Ok(written) if written == expected => {}
            Ok(written) => {
                tracing::error!(
                    target = "ember.jdwp",
                    kind = %kind,
                    written,
                    expected,
                    "failed to send JDWP packet to debugger"
                );
            }
            Err(err) => {
                tracing::error!(
                    target = "ember.jdwp",
                    kind = %kind,
                    error = %err,
                    "failed to send JDWP packet to debugger"
                );
            }
        }
    }

    /// Claim the wire for the command the worker is processing, blocking
    /// while an event holder has it.
    pub fn acquire_token_for_command(&self) {
        self.inner
            .set_wait_for_token(self.inner.runtime.current_thread_id());
    }

    /// Release the wire after the command reply has been written.
    pub fn release_token_for_command(&self) {
        self.inner.clear_wait_for_token();
    }

    /// Claim the wire for an event emitted on behalf of `thread_id`,
    /// blocking while another thread (or an in-flight command) has it.
    pub fn acquire_token_for_event(&self, thread_id: ThreadId) {
        self.inner.set_wait_for_token(thread_id);
    }

    /// Release the wire after the event has been written.
    pub fn release_token_for_event(&self) {
        self.inner.clear_wait_for_token();
    }
}

impl Drop for JdwpState {
    fn drop(&mut self) {
        let inner = &self.inner;
        let have_net = poison::lock(&inner.net, "jdwp net state").is_some();
        if have_net {
            {
                // If a request is in flight, wait for it to finish before
                // pulling the socket out from under it.
                let mut processing = poison::lock(&inner.shutdown_lock, "jdwp shutdown");
                while *processing {
                    tracing::debug!(
                        target = "ember.jdwp",
                        "JDWP command in progress: waiting for it to finish"
                    );
                    processing =
                        poison::wait(&inner.shutdown_cond, processing, "jdwp shutdown");
                }
                tracing::debug!(target = "ember.jdwp", "shutting down JDWP net");
                // Clear the run flag before waking the worker: a server-mode
                // worker that consumes the wake during session teardown would
                // otherwise loop back into accept with nothing left to rouse
                // it.
                inner.run.store(false, Ordering::SeqCst);
                if let Some(shared) = poison::lock(&inner.net, "jdwp net state").as_ref() {
                    shared.shutdown();
                }
            }

            let handle = poison::lock(&inner.worker, "jdwp worker handle").take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::warn!(target = "ember.jdwp", "JDWP worker join failed");
                }
            }

            tracing::debug!(target = "ember.jdwp", "freeing JDWP net state");
            *poison::lock(&inner.net, "jdwp net state") = None;
        }

        inner.reset_state();
    }
}

impl SessionInner {
    fn net_shared(&self) -> Option<Arc<NetShared>> {
        poison::lock(&self.net, "jdwp net state").clone()
    }

    fn milli_time(&self) -> i64 {
        self.clock.elapsed().as_millis() as i64
    }

    /// Worker entry point.
    fn run_worker(&self, mut net: NetState) {
        self.runtime.attach_current_thread("JDWP");
        tracing::debug!(target = "ember.jdwp", "JDWP worker running");

        self.run.store(true, Ordering::SeqCst);
        {
            let mut started = poison::lock(&self.thread_start_lock, "jdwp thread start");
            *started = true;
            self.thread_start_cond.notify_all();
        }

        // Report the debugger-loop state so the GC does not wait on us while
        // we block in poll.
        self.runtime
            .set_thread_state(ThreadState::WaitingInMainDebuggerLoop);

        while self.run.load(Ordering::SeqCst) {
            if self.options.server {
                if !net.accept() {
                    break;
                }
            } else if !net.establish(&self.options) {
                // Wake anybody waiting for the attach to resolve.
                let mut attach = poison::lock(&self.attach_lock, "jdwp attach");
                *attach = AttachState::Failed;
                self.attach_cond.notify_all();
                break;
            }

            self.runtime.connected();

            let mut first = true;
            while !self.runtime.is_disposed() {
                if !net.process_incoming(self) {
                    break;
                }

                if self.should_exit.load(Ordering::SeqCst) {
                    self.runtime.exit(self.exit_status.load(Ordering::SeqCst));
                    // Only reachable when a test double declined to exit.
                    return;
                }

                if first && !net.awaiting_handshake() {
                    // The handshake worked; anybody blocked in create can go.
                    first = false;
                    let id = self.runtime.current_thread_id();
                    let mut attach = poison::lock(&self.attach_lock, "jdwp attach");
                    *attach = AttachState::Attached(id);
                    self.attach_cond.notify_all();
                }
            }

            net.close();

            if self.ddm_active.swap(false, Ordering::SeqCst) {
                self.runtime.ddm_disconnected();
            }

            // Release session state, e.g. deregistered breakpoints, before
            // telling the rest of the runtime the debugger is gone.
            self.reset_state();
            self.runtime.disconnected();
            self.runtime.undo_debugger_suspensions();

            // Connecting out is a one-shot deal.
            if !self.options.server {
                self.run.store(false, Ordering::SeqCst);
            }
        }

        self.runtime.set_thread_state(ThreadState::Native);
        tracing::debug!(target = "ember.jdwp", "JDWP worker detaching and exiting");
        self.runtime.detach_current_thread();
    }

    /// Answer one fully buffered packet. Returns false on a connection-fatal
    /// condition.
    pub(crate) fn handle_packet(&self, net: &mut NetState) -> bool {
        {
            let mut processing = poison::lock(&self.shutdown_lock, "jdwp shutdown");
            *processing = true;
        }

        let ok = self.dispatch_packet(net);

        {
            let mut processing = poison::lock(&self.shutdown_lock, "jdwp shutdown");
            *processing = false;
            self.shutdown_cond.notify_all();
        }
        ok
    }

    fn dispatch_packet(&self, net: &mut NetState) -> bool {
        let consumed;
        {
            let request = match Request::parse(net.input_bytes()) {
                Ok(request) => request,
                Err(err) => {
                    tracing::error!(target = "ember.jdwp", error = %err, "bad packet from debugger");
                    return false;
                }
            };
            consumed = request.total_length();

            self.last_activity_time_ms.store(0, Ordering::SeqCst);

            let mut reply = PacketBuf::new();
            let action = self.runtime.process_request(&request, &mut reply);

            let mut wrote_reply = true;
            match action {
                ReplyAction::Send => match net.shared().write_packet(reply.as_slice()) {
                    Ok(written) if written == reply.len() => {}
                    Ok(written) => {
                        tracing::error!(
                            target = "ember.jdwp",
                            written,
                            expected = reply.len(),
                            "failed sending reply to debugger"
                        );
                        wrote_reply = false;
                    }
                    Err(err) => {
                        tracing::error!(
                            target = "ember.jdwp",
                            error = %err,
                            "failed sending reply to debugger"
                        );
                        wrote_reply = false;
                    }
                },
                ReplyAction::Skip => {
                    debug_assert!(reply.is_empty(), "skipped reply must be empty");
                }
            }

            // The request is answered; events may take the wire again.
            self.clear_wait_for_token();

            if !wrote_reply {
                return false;
            }
        }

        net.consume_bytes(consumed);
        self.last_activity_time_ms
            .store(self.milli_time(), Ordering::SeqCst);
        true
    }

    /// Block until the token is free (or already ours), then take it.
    fn set_wait_for_token(&self, desired: ThreadId) {
        debug_assert_ne!(desired, TOKEN_FREE);
        let mut owner = poison::lock(&self.token_lock, "jdwp token");
        while *owner != TOKEN_FREE && *owner != desired {
            tracing::debug!(target = "ember.jdwp", holder = *owner, "waiting for JDWP token");
            owner = poison::wait(&self.token_cond, owner, "jdwp token");
        }
        *owner = desired;
    }

    fn clear_wait_for_token(&self) {
        let mut owner = poison::lock(&self.token_lock, "jdwp token");
        *owner = TOKEN_FREE;
        self.token_cond.notify_all();
    }

    /// Tear down per-session debugger state after a disconnect. The rest of
    /// the runtime may still believe a debugger is attached.
    pub(crate) fn reset_state(&self) {
        self.runtime.unregister_all_events();
        debug_assert!(
            !self.runtime.has_registered_events(),
            "event requests survived unregister_all_events"
        );

        // A session cannot be reset while somebody holds the token; if the
        // debugger vanished mid-request we may see it anyway.
        let owner = *poison::lock(&self.token_lock, "jdwp token");
        if owner != TOKEN_FREE {
            tracing::warn!(
                target = "ember.jdwp",
                holder = owner,
                "resetting state while an event is in progress"
            );
            debug_assert_eq!(owner, TOKEN_FREE, "reset with the JDWP token held");
        }
    }
}

/// Render a DDM chunk type for diagnostics (`MPSE`, `HELO`, ...).
fn four_cc(kind: u32) -> String {
    kind.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}
