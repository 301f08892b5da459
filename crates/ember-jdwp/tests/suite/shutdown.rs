//! Teardown: dropping the agent must always unblock and join the worker.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::harness::{create_server, wait_until, FakeDebugger, MockRuntime};

#[test]
fn shutdown_while_idle_processes_no_packets() {
    let runtime = Arc::new(MockRuntime::default());
    let state = create_server(Arc::clone(&runtime));
    let debugger = FakeDebugger::attach(state.local_addr().unwrap());

    assert!(wait_until(Duration::from_secs(5), || {
        state.debug_thread_id().is_some()
    }));

    // The worker is parked in its blocking read. Dropping the state trips
    // the wake pipe, the worker unblocks, and the join completes.
    drop(state);

    assert_eq!(runtime.requests.load(Ordering::SeqCst), 0);
    assert_eq!(runtime.disconnects.load(Ordering::SeqCst), 1);
    drop(debugger);
}

#[test]
fn shutdown_before_any_debugger_connects() {
    let runtime = Arc::new(MockRuntime::default());
    let state = create_server(Arc::clone(&runtime));

    // The worker is parked in accept. Drop must still wake and join it.
    drop(state);

    assert_eq!(runtime.connects.load(Ordering::SeqCst), 0);
    assert!(runtime.resets.load(Ordering::SeqCst) >= 1);
}

#[test]
fn ddm_is_notified_on_activation_and_disconnect() {
    let runtime = Arc::new(MockRuntime::default());
    let state = create_server(Arc::clone(&runtime));
    let _debugger = FakeDebugger::attach(state.local_addr().unwrap());

    state.notify_ddms_active();
    state.notify_ddms_active();
    assert_eq!(runtime.ddm_connects.load(Ordering::SeqCst), 1);

    drop(state);

    assert_eq!(runtime.ddm_disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn session_state_is_reset_on_teardown() {
    let runtime = Arc::new(MockRuntime::default());
    let state = create_server(Arc::clone(&runtime));
    let _debugger = FakeDebugger::attach(state.local_addr().unwrap());

    assert!(wait_until(Duration::from_secs(5), || {
        runtime.connects.load(Ordering::SeqCst) == 1
    }));

    drop(state);

    // Worker-side teardown and the destructor both reset session state.
    assert!(runtime.resets.load(Ordering::SeqCst) >= 2);
    assert_eq!(runtime.undone_suspensions.load(Ordering::SeqCst), 1);
}
