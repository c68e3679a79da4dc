use crate::common::{
    prepare_debugger, with_runtime_types, write_g, FixtureInfo, ScriptedTarget, MAIN_TID,
};
use gander::debugger::address::RelocatedAddress;
use gander::debugger::{Debugger, StopReason};

fn current_line(debugger: &Debugger) -> u64 {
    let location = debugger.current_location().unwrap();
    debugger
        .pc_to_line(location.pc)
        .expect("must stop on a source line")
        .line_number
}

fn addr_of_line(line: u64) -> usize {
    0x1000 + (line as usize - 19) * 0x10
}

/// Line table of the stepping fixture: one statement per line inside
/// `main.testnext`.
fn testnext_fixture() -> FixtureInfo {
    let mut info = FixtureInfo::default().function("main.testnext", 0x1000, 0x2000);
    for line in [19u64, 20, 23, 24, 26, 27, 31, 34] {
        info = info.place("testnextprog.go", line, addr_of_line(line) as u64);
    }
    info
}

#[test]
fn test_next_general() {
    let testcases = [
        (19, 20),
        (20, 23),
        (23, 24),
        (24, 26),
        (26, 31),
        (31, 23),
        (23, 24),
        (24, 26),
        (26, 31),
        (31, 23),
        (23, 24),
        (24, 26),
        (26, 27),
        (27, 34),
    ];

    // execution path through the loop of main.testnext
    let path = [
        19u64, 20, 23, 24, 26, 31, 23, 24, 26, 31, 23, 24, 26, 27, 34,
    ];
    let mut trace = vec![0xFF0];
    trace.extend(path.iter().map(|&l| addr_of_line(l)));

    let target = ScriptedTarget::new(trace);
    let (mut debugger, target) = prepare_debugger(target, testnext_fixture());

    let start = RelocatedAddress::from(addr_of_line(19));
    debugger.set_breakpoint(start).unwrap();
    debugger.continue_execution().unwrap();
    debugger.clear_breakpoint(start).unwrap();

    for (begin, end) in testcases {
        assert_eq!(
            current_line(&debugger),
            begin,
            "program not stopped at the expected spot"
        );

        debugger.next().unwrap();

        assert_eq!(
            current_line(&debugger),
            end,
            "program did not continue to the correct next location"
        );
        // no temporaries survive a step
        assert_eq!(debugger.breakpoints().len(), 0);
        assert!(!target.any_trap_in_memory());
    }
}

#[test]
fn test_next_function_return() {
    // main.helloworld has a single line, stepping over it lands on the
    // caller's next line
    let info = FixtureInfo::default()
        .function("main.helloworld", 0x700, 0x720)
        .function("main.main", 0x800, 0x900)
        .place("testnextprog.go", 14, 0x700)
        .place("testnextprog.go", 35, 0x810)
        .cfa_offset(0x700..0x720, 16);

    let target = ScriptedTarget::new(vec![0x6F0, 0x700, 0x810, 0x820]);
    // return address of the helloworld frame: cfa - 8 = sp + 16 - 8
    target.write_word(0x7FF0_0000 + 8, 0x810);

    let (mut debugger, target) = prepare_debugger(target, info);

    let start = RelocatedAddress::from(0x700usize);
    debugger.set_breakpoint(start).unwrap();
    debugger.continue_execution().unwrap();
    debugger.clear_breakpoint(start).unwrap();

    assert_eq!(current_line(&debugger), 14);
    debugger.next().unwrap();
    assert_eq!(current_line(&debugger), 35);
    assert!(!target.any_trap_in_memory());
}

#[test]
fn test_next_function_return_defer() {
    // stepping over the last statement of a function with a pending
    // deferred call stops inside the deferred body first
    let info = with_runtime_types(
        FixtureInfo::default()
            .function("main.main", 0x900, 0x980)
            .function("main.main.func1", 0x9F0, 0xA20)
            .place("testnextdefer.go", 9, 0x900)
            .place("testnextdefer.go", 10, 0x960)
            .place("testnextdefer.go", 6, 0x9F0)
            .place("testnextdefer.go", 7, 0xA00)
            .cfa_offset(0x9F0..0xA20, 16),
    );

    let target = ScriptedTarget::new(vec![0x8F0, 0x900, 0x9F0, 0xA00, 0x960, 0x970]);

    // the main goroutine has a deferred call pending:
    //   g._defer -> _defer.fn -> funcval.fn = main.main.func1
    write_g(&target, 0xA000, 1, 2, 0x900, 0x7FF0_0000);
    target.write_word(0xA000 + 0x20, 0xB000);
    target.write_word(0xB000 + 8, 0xB100);
    target.write_word(0xB100, 0x9F0);
    target.set_fs_base(MAIN_TID, 0xC000);
    target.write_word(0xC000 - 8, 0xA000);

    // return site of the deferred body is the post-defer epilogue
    target.write_word(0x7FF0_0000 + 8, 0x960);

    let (mut debugger, target) = prepare_debugger(target, info);

    let start = RelocatedAddress::from(0x900usize);
    debugger.set_breakpoint(start).unwrap();
    debugger.continue_execution().unwrap();
    debugger.clear_breakpoint(start).unwrap();

    assert_eq!(current_line(&debugger), 9);
    debugger.next().unwrap();
    assert_eq!(current_line(&debugger), 6);
    debugger.next().unwrap();
    assert_eq!(current_line(&debugger), 7);
    debugger.next().unwrap();
    assert_eq!(current_line(&debugger), 10);
    assert!(!target.any_trap_in_memory());
}

#[test]
fn test_next_stays_on_goroutine() {
    // two goroutines execute main.sayhi concurrently, stepping must follow
    // the goroutine that was selected when the step started
    let info = with_runtime_types(
        FixtureInfo::default()
            .function("main.sayhi", 0x500, 0x600)
            .place("parallel_next.go", 9, 0x500)
            .place("parallel_next.go", 10, 0x510)
            .place("parallel_next.go", 11, 0x520),
    );

    let target = ScriptedTarget::new(vec![0x4F0, 0x500, 0x510, 0x520, 0x530]);
    // the foreign worker runs the same lines slightly behind the stepped
    // goroutine, then parks in scheduler code
    target.add_thread(
        50,
        vec![0x50C, 0x50D, 0x50E, 0x510, 0x520, 0x5F0, 0x5F4],
        Some(5),
    );

    // goroutine structs and per-thread TLS slots
    write_g(&target, 0xA000, 1, 2, 0x500, 0x7FF0_0000);
    write_g(&target, 0xA100, 2, 2, 0x510, 0x7FE0_0000);
    target.set_fs_base(MAIN_TID, 0xC000);
    target.write_word(0xC000 - 8, 0xA000);
    target.set_fs_base(50, 0xC100);
    target.write_word(0xC100 - 8, 0xA100);

    let (mut debugger, target) = prepare_debugger(target, info);

    let start = RelocatedAddress::from(0x500usize);
    debugger.set_breakpoint(start).unwrap();
    let reason = debugger.continue_execution().unwrap();
    assert!(matches!(reason, StopReason::Breakpoint(tid, _) if tid.as_raw() == MAIN_TID));
    debugger.clear_breakpoint(start).unwrap();

    assert_eq!(debugger.selected_goroutine(), Some(1));
    assert_eq!(current_line(&debugger), 9);

    debugger.next().unwrap();

    // the foreign goroutine hit the step traps first and was absorbed
    assert_eq!(current_line(&debugger), 10);
    assert_eq!(debugger.selected_goroutine(), Some(1));
    let location = debugger.current_location().unwrap();
    assert_eq!(location.pid.as_raw(), MAIN_TID);
    assert!(!target.any_trap_in_memory());
}
