//! End-to-end tests against real Go debugees.
//!
//! Ignored by default: they need a Go toolchain, ptrace rights and
//! pre-built fixtures. Build each fixture with `go build -gcflags "-N -l"`
//! and point `GANDER_FIXTURES` at the directory holding the binaries.

use gander::debugger::{Debugger, StopReason};
use serial_test::serial;

fn fixture(name: &str) -> String {
    let dir = std::env::var("GANDER_FIXTURES").expect("GANDER_FIXTURES must point at fixtures");
    format!("{dir}/{name}")
}

fn launch(name: &str) -> Debugger {
    let (_out_r, out_w) = os_pipe::pipe().unwrap();
    let (_err_r, err_w) = os_pipe::pipe().unwrap();
    Debugger::launch(&fixture(name), Vec::<String>::new(), out_w, err_w)
        .expect("launch debugee")
}

#[test]
#[serial]
#[ignore = "requires a go toolchain, fixtures and ptrace rights"]
fn test_exit_clean() {
    let mut debugger = launch("continuetestprog");
    let reason = debugger.continue_execution().unwrap();
    assert!(matches!(reason, StopReason::DebugeeExit(0)));
    assert!(debugger.exited());
}

#[test]
#[serial]
#[ignore = "requires a go toolchain, fixtures and ptrace rights"]
fn test_breakpoint_on_function() {
    let mut debugger = launch("testprog");
    let addr = debugger
        .find_function_location("main.helloworld", true)
        .unwrap();
    debugger.set_breakpoint(addr).unwrap();

    let reason = debugger.continue_execution().unwrap();
    assert!(matches!(reason, StopReason::Breakpoint(_, a) if a == addr));
    assert_eq!(debugger.current_location().unwrap().pc, addr);
    assert_eq!(debugger.current_breakpoint().unwrap().total_hit_count(), 1);

    debugger.kill().unwrap();
}

#[test]
#[serial]
#[ignore = "requires a go toolchain, fixtures and ptrace rights"]
fn test_goroutines_info() {
    let mut debugger = launch("goroutinestackprog");
    let addr = debugger
        .find_function_location("main.stacktraceme", true)
        .unwrap();
    debugger.set_breakpoint(addr).unwrap();
    debugger.continue_execution().unwrap();

    let goroutines = debugger.goroutines_info().unwrap();
    assert!(goroutines.len() > 10);

    debugger.kill().unwrap();
}
