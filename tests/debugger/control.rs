use crate::common::{prepare_debugger, FixtureInfo, ScriptedTarget, MAIN_TID};
use gander::debugger::address::RelocatedAddress;
use gander::debugger::error::Error;
use gander::debugger::StopReason;
use nix::unistd::Pid;

#[test]
fn test_exit_clean() {
    let target = ScriptedTarget::new(vec![0x100, 0x104, 0x108]);
    let info = FixtureInfo::default().function("main.main", 0x100, 0x140);

    let (mut debugger, _target) = prepare_debugger(target, info);
    let reason = debugger.continue_execution().unwrap();

    assert_eq!(reason, StopReason::DebugeeExit(0));
    assert!(debugger.exited());
    assert_eq!(debugger.exit_status(), Some(0));

    // every operation on a dead target reports the exit
    let err = debugger.continue_execution().unwrap_err();
    assert!(matches!(err, Error::ProcessExited { status: 0, .. }));
}

#[test]
fn test_manual_stop() {
    let target = ScriptedTarget::new(vec![0x100, 0x104, 0x108]);
    target.loop_main(0);
    let info = FixtureInfo::default().function("main.loop", 0x100, 0x140);

    let (mut debugger, _target) = prepare_debugger(target, info);

    // the request is pending, the outstanding continue consumes it silently
    debugger.request_manual_stop().unwrap();
    let reason = debugger.continue_execution().unwrap();
    assert!(matches!(reason, StopReason::ManualStop(_)));

    let threads = debugger.thread_state().unwrap();
    assert!(!threads.is_empty());
    for snapshot in threads {
        assert!(snapshot.thread.is_stopped());
    }
}

#[test]
fn test_kill() {
    let target = ScriptedTarget::new(vec![0x100, 0x104]);
    target.loop_main(0);
    let info = FixtureInfo::default().function("main.main", 0x100, 0x140);

    let (mut debugger, _target) = prepare_debugger(target, info);
    debugger.kill().unwrap();
    assert!(debugger.exited());
}

#[test]
fn test_switch_thread() {
    let target = ScriptedTarget::new(vec![0x100, 0x104, 0x200, 0x108]);
    target.add_thread(50, vec![0x300, 0x304, 0x308], Some(1));
    let info = FixtureInfo::default()
        .function("main.main", 0x100, 0x140)
        .function("main.worker", 0x300, 0x340);

    let (mut debugger, _target) = prepare_debugger(target, info);

    debugger
        .set_breakpoint(RelocatedAddress::from(0x200usize))
        .unwrap();
    let reason = debugger.continue_execution().unwrap();
    assert!(matches!(reason, StopReason::Breakpoint(_, _)));

    // with invalid thread id
    let err = debugger.switch_thread(Pid::from_raw(-1)).unwrap_err();
    assert!(matches!(err, Error::InvalidThread(_)));

    // with valid thread id
    debugger.switch_thread(Pid::from_raw(50)).unwrap();
    let threads = debugger.thread_state().unwrap();
    let in_focus = threads.iter().find(|t| t.in_focus).unwrap();
    assert_eq!(in_focus.thread.pid, Pid::from_raw(50));

    debugger.switch_thread(Pid::from_raw(MAIN_TID)).unwrap();
}

#[test]
fn test_step_instruction() {
    let target = ScriptedTarget::new(vec![0x100, 0x200, 0x208, 0x210]);
    let info = FixtureInfo::default().function("main.helloworld", 0x200, 0x240);

    let (mut debugger, _target) = prepare_debugger(target, info);
    debugger
        .set_breakpoint(RelocatedAddress::from(0x200usize))
        .unwrap();
    debugger.continue_execution().unwrap();

    let pc_before = debugger.current_location().unwrap().pc;
    assert_eq!(pc_before, RelocatedAddress::from(0x200usize));

    debugger.step().unwrap();

    let pc_after = debugger.current_location().unwrap().pc;
    assert!(
        pc_after > pc_before,
        "expected {pc_after} to be greater than {pc_before}"
    );
}
