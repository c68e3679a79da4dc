use crate::common::{
    prepare_debugger, with_runtime_types, write_g, FixtureInfo, ScriptedTarget, MAIN_TID,
};
use gander::debugger::unwind::Backtrace;

fn stack_match(bt: &Backtrace, expected: &[&str]) -> bool {
    if bt.len() < expected.len() {
        return false;
    }
    expected
        .iter()
        .zip(bt.iter())
        .all(|(name, frame)| frame.func_name.as_deref() == Some(*name))
}

/// Ten background goroutines parked in a channel send, the main goroutine
/// stopped inside `main.stacktraceme`.
#[test]
fn test_stacktrace_goroutine() {
    let info = with_runtime_types(
        FixtureInfo::default()
            .function("main.stacktraceme", 0x1000, 0x1100)
            .function("main.main", 0x2000, 0x2100)
            .function("runtime.goexit", 0x3000, 0x3010)
            .function("runtime.gopark", 0x4000, 0x4080)
            .function("runtime.goparkunlock", 0x4100, 0x4180)
            .function("runtime.chansend", 0x4200, 0x4280)
            .function("runtime.chansend1", 0x4300, 0x4380)
            .function("main.agoroutine", 0x4400, 0x4480)
            .place("goroutinestackprog.go", 12, 0x1000)
            .place("goroutinestackprog.go", 21, 0x2010)
            .place("goroutinestackprog.go", 8, 0x4410)
            .cfa_offset(0x1000..0x1100, 0x20)
            .cfa_offset(0x2000..0x2100, 0x20)
            .cfa_offset(0x3000..0x3010, 0x20)
            .cfa_offset(0x4000..0x4080, 0x20)
            .cfa_offset(0x4100..0x4180, 0x20)
            .cfa_offset(0x4200..0x4280, 0x20)
            .cfa_offset(0x4300..0x4380, 0x20)
            .cfa_offset(0x4400..0x4480, 0x20)
            .symbol("runtime.allgs", 0x9000),
    );

    let target = ScriptedTarget::new(vec![0x1010, 0x1014]);
    target.set_sp(MAIN_TID, 0x7F00);
    target.set_fs_base(MAIN_TID, 0xC000);

    // all-goroutines slice: the main goroutine plus ten parked workers
    target.write_word(0x9000, 0x9100);
    target.write_word(0x9008, 11);

    // main goroutine, running on the main thread
    target.write_word(0x9100, 0xA000);
    target.write_word(0xC000 - 8, 0xA000);
    write_g(&target, 0xA000, 1, 2, 0x1010, 0x7F00);
    // stack of main: stacktraceme <- main.main <- goexit
    target.write_word(0x7F20 - 8, 0x2010);
    target.write_word(0x7F40 - 8, 0x3005);
    target.write_word(0x7F60 - 8, 0);

    for i in 1..=10usize {
        let g_addr = 0xA000 + i * 0x100;
        let stack_base = 0x60000 + i * 0x1000;
        target.write_word(0x9100 + i * 8, g_addr as u64);
        // parked in runtime.gopark, waiting status
        write_g(&target, g_addr, 1 + i as u64, 4, 0x4010, stack_base as u64);
        // gopark <- goparkunlock <- chansend <- chansend1 <- agoroutine <- goexit
        target.write_word(stack_base + 0x18, 0x4110);
        target.write_word(stack_base + 0x38, 0x4210);
        target.write_word(stack_base + 0x58, 0x4310);
        target.write_word(stack_base + 0x78, 0x4410);
        target.write_word(stack_base + 0x98, 0x3005);
        target.write_word(stack_base + 0xB8, 0);
    }

    let (debugger, _target) = prepare_debugger(target, info);

    let goroutines = debugger.goroutines_info().unwrap();
    assert_eq!(goroutines.len(), 11);

    let main_stack = ["main.stacktraceme", "main.main"];
    let agoroutine_stack = [
        "runtime.gopark",
        "runtime.goparkunlock",
        "runtime.chansend",
        "runtime.chansend1",
        "main.agoroutine",
    ];

    let mut main_count = 0;
    let mut agoroutine_count = 0;
    for g in &goroutines {
        let bt = debugger.goroutine_stacktrace(g.id, 40).unwrap();
        if stack_match(&bt, &main_stack) {
            main_count += 1;
        }
        if stack_match(&bt, &agoroutine_stack) {
            agoroutine_count += 1;
        }
        // every goroutine stack terminates at the runtime sentinel
        assert_eq!(
            bt.last().unwrap().func_name.as_deref(),
            Some("runtime.goexit"),
            "goroutine {} stack does not reach the stack bottom",
            g.id
        );
    }

    assert_eq!(main_count, 1, "main goroutine stack not found");
    assert_eq!(agoroutine_count, 10, "goroutine stacks not found");
}

/// The goroutine scheduled on an OS thread carries its thread id and the
/// live thread position.
#[test]
fn test_goroutine_thread_binding() {
    let info = with_runtime_types(
        FixtureInfo::default()
            .function("main.main", 0x1000, 0x1100)
            .cfa_offset(0x1000..0x1100, 0x20)
            .symbol("runtime.allgs", 0x9000),
    );

    let target = ScriptedTarget::new(vec![0x1010, 0x1014]);
    target.set_fs_base(MAIN_TID, 0xC000);
    target.write_word(0x9000, 0x9100);
    target.write_word(0x9008, 1);
    target.write_word(0x9100, 0xA000);
    target.write_word(0xC000 - 8, 0xA000);
    // the saved scheduling site is stale on purpose
    write_g(&target, 0xA000, 1, 2, 0xDEAD, 0xBEEF);

    let (debugger, _target) = prepare_debugger(target, info);

    let goroutines = debugger.goroutines_info().unwrap();
    assert_eq!(goroutines.len(), 1);
    let g = &goroutines[0];
    assert_eq!(g.id, 1);
    assert_eq!(g.thread.map(|t| t.as_raw()), Some(MAIN_TID));
    // live registers shadow the stale scheduling site
    assert_eq!(g.pc.as_usize(), 0x1010);
}
