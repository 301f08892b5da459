//! Connection state shared between the debug worker and the rest of the
//! runtime.
//!
//! The worker thread owns all blocking I/O and the input buffer; other
//! threads only ever write packets, trip the wake pipe, or half-close the
//! socket. That split is reflected in the types: [`NetShared`] (behind an
//! `Arc`) carries everything reachable from any thread, [`NetState`] is
//! confined to the worker.

use std::io::{ErrorKind, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, RwLock};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::codec::{get4_be, HANDSHAKE};
use crate::poison;
use crate::session::SessionInner;
use crate::transport::Transport;
use crate::{JdwpError, Result};

/// Large enough for the biggest packet the runtime accepts from a debugger.
pub(crate) const INPUT_BUFFER_SIZE: usize = 8192;

/// The any-thread half of the connection.
pub(crate) struct NetShared {
    /// `None` is the disconnected sentinel; no read or write is issued then.
    client: RwLock<Option<TcpStream>>,
    /// Serializes every write path so packets never byte-interleave.
    socket_lock: Mutex<()>,
    /// Write end of the self-pipe; installed by [`NetState::new`].
    wake_tx: Mutex<Option<OwnedFd>>,
    /// Bound listen address in server mode.
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl NetShared {
    pub(crate) fn new() -> Self {
        Self {
            client: RwLock::new(None),
            socket_lock: Mutex::new(()),
            wake_tx: Mutex::new(None),
            listen_addr: Mutex::new(None),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        poison::read(&self.client, "jdwp client socket").is_some()
    }

    pub(crate) fn set_listen_addr(&self, addr: SocketAddr) {
        *poison::lock(&self.listen_addr, "jdwp listen addr") = Some(addr);
    }

    pub(crate) fn listen_addr(&self) -> Option<SocketAddr> {
        *poison::lock(&self.listen_addr, "jdwp listen addr")
    }

    fn install_wake(&self, fd: OwnedFd) {
        *poison::lock(&self.wake_tx, "jdwp wake pipe") = Some(fd);
    }

    /// Kick a worker sitting in `poll` loose. Idempotent, any-thread.
    pub(crate) fn wake(&self) {
        let wake_tx = poison::lock(&self.wake_tx, "jdwp wake pipe");
        if let Some(fd) = wake_tx.as_ref() {
            tracing::trace!(target = "ember.jdwp", "writing to wake pipe");
            loop {
                match nix::unistd::write(fd, &[0u8]) {
                    Err(Errno::EINTR) => continue,
                    _ => break,
                }
            }
        }
    }

    /// Half-close the connection and wake the worker. Callable from any
    /// thread; the worker does the actual close.
    pub(crate) fn shutdown(&self) {
        if let Some(stream) = poison::read(&self.client, "jdwp client socket").as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.wake();
    }

    /// Write one packet with a single restart-on-EINTR write.
    ///
    /// Returns the number of bytes the kernel took; the caller treats a short
    /// write as connection-fatal.
    pub(crate) fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        let _ordering = poison::lock(&self.socket_lock, "jdwp socket write");
        let client = poison::read(&self.client, "jdwp client socket");
        let Some(stream) = client.as_ref() else {
            tracing::warn!(target = "ember.jdwp", "connection with debugger is closed");
            return Err(JdwpError::NotConnected);
        };
        let mut writer: &TcpStream = stream;
        loop {
            match writer.write(buf) {
                Ok(written) => return Ok(written),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Scatter-gather variant of [`NetShared::write_packet`].
    pub(crate) fn write_vectored_packet(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let _ordering = poison::lock(&self.socket_lock, "jdwp socket write");
        let client = poison::read(&self.client, "jdwp client socket");
        let Some(stream) = client.as_ref() else {
            tracing::warn!(target = "ember.jdwp", "connection with debugger is closed");
            return Err(JdwpError::NotConnected);
        };
        let mut writer: &TcpStream = stream;
        loop {
            match writer.write_vectored(bufs) {
                Ok(written) => return Ok(written),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

pub(crate) enum PollOutcome {
    Ready,
    Woken,
    TimedOut,
    Failed,
}

enum ReadOutcome {
    Data,
    Eof,
    Woken,
    Failed,
}

/// The worker-confined half of the connection.
pub(crate) struct NetState {
    shared: Arc<NetShared>,
    pub(crate) transport: Transport,
    /// Read end of the self-pipe, polled next to the socket.
    wake_rx: OwnedFd,
    input: Box<[u8]>,
    input_count: usize,
    awaiting_handshake: bool,
}

impl NetState {
    /// Build the worker half and install the wake pipe into `shared`.
    pub(crate) fn new(shared: Arc<NetShared>, transport: Transport) -> Result<Self> {
        let (wake_rx, wake_tx) =
            nix::unistd::pipe().map_err(|errno| JdwpError::Io(errno.into()))?;
        shared.install_wake(wake_tx);
        Ok(Self {
            shared,
            transport,
            wake_rx,
            input: vec![0u8; INPUT_BUFFER_SIZE].into_boxed_slice(),
            input_count: 0,
            awaiting_handshake: false,
        })
    }

    pub(crate) fn shared(&self) -> &Arc<NetShared> {
        &self.shared
    }

    pub(crate) fn awaiting_handshake(&self) -> bool {
        self.awaiting_handshake
    }

    /// The valid prefix of the input buffer.
    pub(crate) fn input_bytes(&self) -> &[u8] {
        &self.input[..self.input_count]
    }

    /// True when a complete message is buffered: the 14 handshake bytes while
    /// the handshake is outstanding, a full length-framed packet afterwards.
    pub(crate) fn have_full_packet(&self) -> bool {
        if self.awaiting_handshake {
            return self.input_count >= HANDSHAKE.len();
        }
        if self.input_count < 4 {
            return false;
        }
        let length = get4_be(&self.input) as usize;
        self.input_count >= length
    }

    /// Discard `count` processed bytes, shifting the unprocessed suffix to
    /// the front of the buffer.
    pub(crate) fn consume_bytes(&mut self, count: usize) {
        assert!(count > 0);
        assert!(count <= self.input_count);
        if count == self.input_count {
            self.input_count = 0;
            return;
        }
        self.input.copy_within(count..self.input_count, 0);
        self.input_count -= count;
    }

    /// Install a freshly established connection and reset per-session
    /// buffering.
    pub(crate) fn on_connected(&mut self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        self.input_count = 0;
        self.awaiting_handshake = true;
        *poison::write(&self.shared.client, "jdwp client socket") = Some(stream);
    }

    /// Drop the connection back to the disconnected sentinel. Idempotent;
    /// only called from the worker.
    pub(crate) fn close(&mut self) {
        let mut client = poison::write(&self.shared.client, "jdwp client socket");
        if client.take().is_some() {
            tracing::debug!(target = "ember.jdwp", "closing connection to debugger");
        }
    }

    /// Block until `fd` is readable or the wake pipe trips.
    pub(crate) fn wait_readable(&self, fd: BorrowedFd<'_>, timeout: PollTimeout) -> PollOutcome {
        loop {
            let mut fds = [
                PollFd::new(fd, PollFlags::POLLIN),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(0) => return PollOutcome::TimedOut,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::error!(target = "ember.jdwp", error = %errno, "poll failed");
                    return PollOutcome::Failed;
                }
            }
            if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                self.drain_wake_pipe();
                return PollOutcome::Woken;
            }
            if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                return PollOutcome::Ready;
            }
        }
    }

    /// Block until the wake pipe trips or `timeout` elapses.
    pub(crate) fn wait_wake(&self, timeout: PollTimeout) -> PollOutcome {
        loop {
            let mut fds = [PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return PollOutcome::TimedOut,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::error!(target = "ember.jdwp", error = %errno, "poll failed");
                    return PollOutcome::Failed;
                }
            }
            if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                self.drain_wake_pipe();
                return PollOutcome::Woken;
            }
        }
    }

    /// Any number of buffered wake bytes collapse into one wakeup.
    fn drain_wake_pipe(&self) {
        let mut scratch = [0u8; 16];
        loop {
            match nix::unistd::read(self.wake_rx.as_raw_fd(), &mut scratch) {
                Err(Errno::EINTR) => continue,
                _ => break,
            }
        }
    }

    /// One blocking step of the session: at most one read into the input
    /// buffer, the handshake exchange once it is fully buffered, then
    /// dispatch of every fully buffered packet. Returns false on any
    /// connection-fatal condition.
    ///
    /// A partial packet returns true without blocking again; the worker loop
    /// re-checks its deferred-exit flag between calls, so this must not sit
    /// in a read loop waiting for the remainder.
    pub(crate) fn process_incoming(&mut self, session: &SessionInner) -> bool {
        if !self.shared.is_connected() {
            tracing::error!(target = "ember.jdwp", "process_incoming without a connection");
            return false;
        }

        if !self.have_full_packet() {
            if self.input_count == self.input.len() {
                tracing::error!(
                    target = "ember.jdwp",
                    capacity = self.input.len(),
                    "packet from debugger exceeds the input buffer"
                );
                return false;
            }
            match self.read_more() {
                ReadOutcome::Data => {}
                ReadOutcome::Eof => {
                    tracing::debug!(target = "ember.jdwp", "debugger closed the connection");
                    return false;
                }
                ReadOutcome::Woken => {
                    tracing::debug!(target = "ember.jdwp", "wake pipe tripped, abandoning the read");
                    return false;
                }
                ReadOutcome::Failed => return false,
            }
        }

        if self.awaiting_handshake {
            if !self.have_full_packet() {
                return true;
            }
            if &self.input[..HANDSHAKE.len()] != HANDSHAKE {
                tracing::error!(target = "ember.jdwp", "bad handshake from debugger");
                return false;
            }
            match self.shared.write_packet(HANDSHAKE) {
                Ok(written) if written == HANDSHAKE.len() => {}
                Ok(written) => {
                    tracing::error!(target = "ember.jdwp", written, "partial handshake write");
                    return false;
                }
                Err(err) => {
                    tracing::error!(target = "ember.jdwp", error = %err, "failed to echo handshake");
                    return false;
                }
            }
            self.consume_bytes(HANDSHAKE.len());
            self.awaiting_handshake = false;
        }

        while self.have_full_packet() {
            if !session.handle_packet(self) {
                return false;
            }
        }
        true
    }

    fn read_more(&mut self) -> ReadOutcome {
        let shared = Arc::clone(&self.shared);
        let client = poison::read(&shared.client, "jdwp client socket");
        let Some(stream) = client.as_ref() else {
            return ReadOutcome::Failed;
        };

        match self.wait_readable(stream.as_fd(), PollTimeout::NONE) {
            PollOutcome::Ready => {}
            PollOutcome::Woken => return ReadOutcome::Woken,
            PollOutcome::TimedOut | PollOutcome::Failed => return ReadOutcome::Failed,
        }

        let mut reader: &TcpStream = stream;
        loop {
            match reader.read(&mut self.input[self.input_count..]) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(read) => {
                    self.input_count += read;
                    return ReadOutcome::Data;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(target = "ember.jdwp", error = %err, "read from debugger failed");
                    return ReadOutcome::Failed;
                }
            }
        }
    }
}
