use crate::common::{prepare_debugger, FixtureInfo, ScriptedTarget, TRAP};
use gander::debugger::address::RelocatedAddress;
use gander::debugger::error::Error;
use gander::debugger::StopReason;

fn hello_fixture() -> FixtureInfo {
    FixtureInfo::default()
        .function("main.main", 0x100, 0x180)
        .function("main.helloworld", 0x200, 0x240)
        .place("testprog.go", 17, 0x100)
        .place("testprog.go", 5, 0x200)
        .place("testprog.go", 6, 0x210)
}

#[test]
fn test_breakpoint_hit_once() {
    let target = ScriptedTarget::new(vec![0x100, 0x110, 0x200, 0x210, 0x120]);
    let (mut debugger, target) = prepare_debugger(target, hello_fixture());

    let addr = RelocatedAddress::from(0x200usize);
    debugger.set_breakpoint(addr).unwrap();
    assert_eq!(target.byte_at(0x200), TRAP);

    let reason = debugger.continue_execution().unwrap();
    assert!(matches!(reason, StopReason::Breakpoint(_, a) if a == addr));

    // PC is rewound onto the breakpoint, the trap byte stays installed
    assert_eq!(debugger.current_location().unwrap().pc, addr);
    assert_eq!(target.byte_at(0x200), TRAP);

    let brkpt = debugger.current_breakpoint().expect("stopped at breakpoint");
    assert_eq!(brkpt.addr, addr);
    assert_eq!(brkpt.total_hit_count(), 1);

    // run to the natural end, stepping over the installed trap
    let reason = debugger.continue_execution().unwrap();
    assert_eq!(reason, StopReason::DebugeeExit(0));
}

#[test]
fn test_clear_breakpoint() {
    let target = ScriptedTarget::new(vec![0x100, 0x200, 0x210]);
    let (mut debugger, target) = prepare_debugger(target, hello_fixture());

    let addr = RelocatedAddress::from(0x200usize);
    debugger.set_breakpoint(addr).unwrap();
    assert_eq!(debugger.breakpoints().len(), 1);

    debugger.clear_breakpoint(addr).unwrap();
    assert_eq!(debugger.breakpoints().len(), 0);
    assert!(!target.any_trap_in_memory());

    // cleared breakpoint does not trigger
    let reason = debugger.continue_execution().unwrap();
    assert_eq!(reason, StopReason::DebugeeExit(0));
}

#[test]
fn test_breakpoint_at_invalid_address() {
    let target = ScriptedTarget::new(vec![0x100]);
    let (mut debugger, _target) = prepare_debugger(target, hello_fixture());

    let err = debugger
        .set_breakpoint(RelocatedAddress::from(0usize))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
}

#[test]
fn test_breakpoint_at_function() {
    let target = ScriptedTarget::new(vec![0x100, 0x200, 0x210, 0x220]);
    let (mut debugger, _target) = prepare_debugger(target, hello_fixture());

    // the function location skips the prologue to the next statement
    let brkpt_addr = debugger
        .find_function_location("main.helloworld", true)
        .unwrap();
    assert_eq!(brkpt_addr, RelocatedAddress::from(0x210usize));

    debugger.set_breakpoint_at_fn("main.helloworld").unwrap();
    let reason = debugger.continue_execution().unwrap();
    assert!(matches!(reason, StopReason::Breakpoint(_, a) if a == brkpt_addr));

    let place = debugger
        .pc_to_line(debugger.current_location().unwrap().pc)
        .unwrap();
    assert_eq!(place.line_number, 6);

    let err = debugger
        .find_function_location("main.nonexistent", true)
        .unwrap_err();
    assert!(matches!(err, Error::FunctionNotFound(_)));
}

#[test]
fn test_breakpoint_at_line() {
    let target = ScriptedTarget::new(vec![0x100, 0x200, 0x210]);
    let (mut debugger, _target) = prepare_debugger(target, hello_fixture());

    debugger.set_breakpoint_at_line("testprog.go", 5).unwrap();
    let reason = debugger.continue_execution().unwrap();
    assert!(
        matches!(reason, StopReason::Breakpoint(_, a) if a == RelocatedAddress::from(0x200usize))
    );
}

#[test]
fn test_continue_multi() {
    // main.sayhi runs three times, main.main once
    let target = ScriptedTarget::new(vec![
        0x50, 0x100, 0x300, 0x310, 0x300, 0x310, 0x300, 0x310, 0x120,
    ]);
    let info = hello_fixture().function("main.sayhi", 0x300, 0x340);
    let (mut debugger, _target) = prepare_debugger(target, info);

    let bp1 = debugger
        .set_breakpoint(RelocatedAddress::from(0x100usize))
        .unwrap()
        .number;
    let bp2 = debugger
        .set_breakpoint(RelocatedAddress::from(0x300usize))
        .unwrap()
        .number;

    let mut main_count = 0;
    let mut sayhi_count = 0;
    loop {
        let reason = debugger.continue_execution().unwrap();
        if matches!(reason, StopReason::DebugeeExit(_)) {
            break;
        }
        let current = debugger.current_breakpoint().expect("breakpoint stop");
        if current.number == bp1 {
            main_count += 1;
        }
        if current.number == bp2 {
            sayhi_count += 1;
        }
    }

    assert_eq!(main_count, 1, "main breakpoint hit wrong number of times");
    assert_eq!(sayhi_count, 3, "sayhi breakpoint hit wrong number of times");

    let total = debugger
        .breakpoints()
        .iter()
        .find(|b| b.number == bp2)
        .unwrap()
        .total_hit_count();
    assert_eq!(total, 3);
}

#[test]
fn test_conditional_breakpoint() {
    let target = ScriptedTarget::new(vec![0x100, 0x200, 0x210, 0x200, 0x210, 0x120]);
    let (mut debugger, _target) = prepare_debugger(target, hello_fixture());

    let addr = RelocatedAddress::from(0x200usize);
    debugger.set_breakpoint(addr).unwrap();
    debugger
        .breakpoints()
        .first()
        .unwrap()
        .set_condition(Some("1 == 2".to_string()));

    // the condition never holds, the stop is swallowed until process end
    let reason = debugger.continue_execution().unwrap();
    assert_eq!(reason, StopReason::DebugeeExit(0));
}
