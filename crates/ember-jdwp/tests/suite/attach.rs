//! Attach semantics: `suspend=y` blocking, dial failure, one-shot client
//! sessions, and server re-accept after a disconnect.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ember_jdwp::codec::HANDSHAKE;
use ember_jdwp::{JdwpError, JdwpState, RuntimeHooks};
use pretty_assertions::assert_eq;

use crate::harness::{client_options, create_server, wait_until, FakeDebugger, MockRuntime};

#[test]
fn suspend_create_blocks_until_the_debugger_attaches() {
    // The debugger side listens; the agent dials out (`server=n`).
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().unwrap().port();

    let debugger = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("agent should dial in");
        // The debugger initiates the handshake; the agent echoes it.
        stream.write_all(HANDSHAKE).expect("handshake write");
        let mut echo = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut echo).expect("handshake echo");
        assert_eq!(&echo, HANDSHAKE);
        stream
    });

    let runtime = Arc::new(MockRuntime::default());
    let state = JdwpState::create(client_options(port, true), Arc::clone(&runtime) as Arc<dyn RuntimeHooks>)
        .expect("create must not return before the debugger is attached");

    // `suspend=y` only returns once attached.
    assert!(state.is_active());
    assert!(state.debug_thread_id().is_some());
    assert_eq!(runtime.connects.load(Ordering::SeqCst), 1);

    let stream = debugger.join().expect("debugger thread");
    drop(stream);
    drop(state);
}

#[test]
fn suspend_create_fails_when_the_dial_fails() {
    // Grab a port with nothing listening behind it.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
        listener.local_addr().unwrap().port()
    };

    let runtime = Arc::new(MockRuntime::default());
    let err = JdwpState::create(client_options(port, true), runtime)
        .err()
        .expect("create must fail when the debugger is unreachable");
    assert!(matches!(err, JdwpError::AttachFailed), "got {err:?}");
}

#[test]
fn client_sessions_are_one_shot() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener");
    let port = listener.local_addr().unwrap().port();

    let debugger = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("agent should dial in");
        stream.write_all(HANDSHAKE).expect("handshake write");
        let mut echo = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut echo).expect("handshake echo");
        // Hang up immediately.
        drop(stream);
    });

    let runtime = Arc::new(MockRuntime::default());
    let state = JdwpState::create(client_options(port, true), Arc::clone(&runtime) as Arc<dyn RuntimeHooks>)
        .expect("attach should succeed");
    debugger.join().expect("debugger thread");

    // The peer hung up; the one-shot worker tears the session down and does
    // not reconnect.
    assert!(wait_until(Duration::from_secs(5), || {
        runtime.disconnects.load(Ordering::SeqCst) == 1
            && runtime.undone_suspensions.load(Ordering::SeqCst) == 1
            && !state.is_active()
    }));
    assert!(runtime.resets.load(Ordering::SeqCst) >= 1);
}

#[test]
fn server_accepts_a_new_debugger_after_a_disconnect() {
    let runtime = Arc::new(MockRuntime::default());
    let state = create_server(Arc::clone(&runtime));
    let addr = state.local_addr().unwrap();

    let mut first = FakeDebugger::attach(addr);
    first.send_command(1, 1, 1, b"one");
    let _ = first.read_packet();
    drop(first);

    assert!(wait_until(Duration::from_secs(5), || {
        runtime.disconnects.load(Ordering::SeqCst) == 1
    }));
    assert!(runtime.resets.load(Ordering::SeqCst) >= 1);

    // A second session gets a fresh handshake and working dispatch.
    let mut second = FakeDebugger::attach(addr);
    second.send_command(7, 1, 1, b"two");
    let reply = second.read_packet();
    assert_eq!(&reply[4..8], &[0, 0, 0, 7]);
    assert_eq!(runtime.connects.load(Ordering::SeqCst), 2);
}
