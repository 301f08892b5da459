//! Shared fixtures: a scripted debugger peer over a real TCP socket and a
//! mock runtime standing in for the embedding VM.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ember_jdwp::codec::HANDSHAKE;
use ember_jdwp::{
    JdwpOptions, JdwpState, JdwpTransport, PacketBuf, ReplyAction, Request, RuntimeHooks,
};

/// Thread identity the mock hands out for every caller.
pub const DEBUG_THREAD_ID: u64 = 0x1000;

/// A `RuntimeHooks` double that records every collaborator call and answers
/// each command packet by echoing its payload back in the reply.
#[derive(Default)]
pub struct MockRuntime {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub requests: AtomicUsize,
    pub resets: AtomicUsize,
    pub undone_suspensions: AtomicUsize,
    pub disposed: AtomicBool,
    /// When set, `process_request` skips the reply (DDM-style no-answer).
    pub skip_replies: AtomicBool,
    pub exit_status: Mutex<Option<i32>>,
    pub ddm_connects: AtomicUsize,
    pub ddm_disconnects: AtomicUsize,
}

impl RuntimeHooks for MockRuntime {
    fn current_thread_id(&self) -> u64 {
        DEBUG_THREAD_ID
    }

    fn is_debugger_active(&self) -> bool {
        true
    }

    fn connected(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn undo_debugger_suspensions(&self) {
        self.undone_suspensions.fetch_add(1, Ordering::SeqCst);
    }

    fn unregister_all_events(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn process_request(&self, request: &Request<'_>, reply: &mut PacketBuf) -> ReplyAction {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.skip_replies.load(Ordering::SeqCst) {
            return ReplyAction::Skip;
        }
        reply.begin_reply(request.id(), 0);
        reply.write_bytes(request.payload());
        reply.finish();
        ReplyAction::Send
    }

    fn ddm_connected(&self) {
        self.ddm_connects.fetch_add(1, Ordering::SeqCst);
    }

    fn ddm_disconnected(&self) {
        self.ddm_disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self, status: i32) {
        *self.exit_status.lock().unwrap() = Some(status);
    }
}

pub fn server_options() -> JdwpOptions {
    JdwpOptions {
        transport: JdwpTransport::Socket,
        server: true,
        suspend: false,
        host: String::new(),
        port: 0,
    }
}

pub fn client_options(port: u16, suspend: bool) -> JdwpOptions {
    JdwpOptions {
        transport: JdwpTransport::Socket,
        server: false,
        suspend,
        host: "127.0.0.1".to_owned(),
        port,
    }
}

/// Bring up a server-mode agent on an ephemeral port.
pub fn create_server(runtime: Arc<MockRuntime>) -> JdwpState {
    JdwpState::create(server_options(), runtime).expect("agent should start")
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// The debugger side of the wire: connects, handshakes, and exchanges framed
/// packets with the agent under test.
pub struct FakeDebugger {
    pub stream: TcpStream,
}

impl FakeDebugger {
    /// Connect to `addr` and complete the 14-byte handshake exchange.
    pub fn attach(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).expect("debugger should connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        stream.write_all(HANDSHAKE).expect("handshake write");
        let mut echo = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut echo).expect("handshake echo");
        assert_eq!(&echo, HANDSHAKE, "agent must echo the handshake verbatim");
        Self { stream }
    }

    pub fn send_command(&mut self, id: u32, command_set: u8, command: u8, payload: &[u8]) {
        let mut packet = PacketBuf::new();
        packet.begin_command(id, command_set, command);
        packet.write_bytes(payload);
        packet.finish();
        self.send_raw(packet.as_slice());
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("packet write");
    }

    /// Read one length-framed packet, header included.
    pub fn read_packet(&mut self) -> Vec<u8> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).expect("packet length");
        let length = u32::from_be_bytes(header) as usize;
        assert!(length >= 4, "bogus packet length {length}");
        let mut packet = vec![0u8; length];
        packet[..4].copy_from_slice(&header);
        self.stream
            .read_exact(&mut packet[4..])
            .expect("packet body");
        packet
    }
}
