//! End-to-end scenarios: hand-built `BcProgram`s serialized through
//! [`lstf::serialize`], reloaded through [`lstf::loader`], and run to
//! completion on [`lstf::Vm`] — the same round trip a compiled `.lstf`
//! script takes, minus the (nonexistent) surface-syntax front end.

use lstf::bytecode::{CaptureDescriptor, ClosureDescriptor};
use lstf::loader::VmProgram;
use lstf::{BcFunction, BcProgram, Json, Op, VmStatus};

fn run(program: &BcProgram) -> (VmStatus, String) {
    let mut buf = Vec::new();
    lstf::serialize::serialize(program, &mut buf).expect("serialize");
    let loaded: VmProgram = lstf::loader::load(&buf).expect("load");
    let mut out = Vec::new();
    let mut vm = lstf::Vm::new(loaded, &mut out, false);
    let status = vm.run();
    (status, String::from_utf8(out).expect("utf8 output"))
}

/// Total byte length a run of instructions would occupy, for hand-computing
/// local jump offsets the way the assembler does in [`lstf::assembler`].
fn len_of(ops: &[Op]) -> u64 {
    ops.iter().map(|op| op.encoded_size() as u64).sum()
}

#[test]
fn test_hello_world_prints_once_and_exits_zero() {
    let mut program = BcProgram::new();
    let mut main = BcFunction::new("main");
    main.push(Op::LoadExpr(Json::string("hello, world")), Default::default());
    main.push(Op::Print, Default::default());
    main.push(Op::Exit(0), Default::default());
    program.add_function(main);

    let (status, out) = run(&program);
    assert_eq!(status, VmStatus::Exited);
    assert_eq!(out, "hello, world\n");
}

#[test]
fn test_recursive_factorial_of_ten_is_3628800() {
    // factorial(n): params 1; if n <= 1, return 1; else return n * factorial(n - 1).
    let prefix = vec![
        Op::LoadFrame(0),
        Op::LoadExpr(Json::int(1)),
        Op::LessThanEqual,
    ];
    let base_case = vec![Op::LoadExpr(Json::int(1)), Op::Return];
    let else_size = Op::Else(lstf::bytecode::JumpTarget::Resolved(0)).encoded_size() as u64;
    let recurse_offset = len_of(&[Op::Params(1)]) + len_of(&prefix) + else_size + len_of(&base_case);

    let mut factorial = BcFunction::new("factorial");
    factorial.push(Op::Params(1), Default::default());
    for op in prefix {
        factorial.push(op, Default::default());
    }
    factorial.push(Op::Else(lstf::bytecode::JumpTarget::Resolved(recurse_offset)), Default::default());
    for op in base_case {
        factorial.push(op, Default::default());
    }
    // Recursive case: n * factorial(n - 1).
    factorial.push(Op::LoadFrame(0), Default::default());
    factorial.push(Op::LoadFrame(0), Default::default());
    factorial.push(Op::LoadExpr(Json::int(1)), Default::default());
    factorial.push(Op::Sub, Default::default());
    factorial.push(Op::Call(1), Default::default()); // resolved below: function index 1 is `factorial`.
    factorial.push(Op::Mul, Default::default());
    factorial.push(Op::Return, Default::default());

    let mut program = BcProgram::new();
    let mut main = BcFunction::new("main");
    main.push(Op::LoadExpr(Json::int(10)), Default::default());
    main.push(Op::Call(1), Default::default());
    main.push(Op::Print, Default::default());
    main.push(Op::Exit(0), Default::default());
    program.add_function(main);
    program.add_function(factorial);

    let (status, out) = run(&program);
    assert_eq!(status, VmStatus::Exited);
    assert_eq!(out, "3628800\n");
}

#[test]
fn test_closure_identity_shares_captured_state() {
    // main allocates a local, builds two closures over it (`set42` and
    // `get`), writes through one, then reads back through the other — the
    // two closures must resolve to the same upvalue, not independent
    // snapshots of the captured slot.
    let mut set42 = BcFunction::new("set42");
    set42.push(Op::Params(0), Default::default());
    set42.push(Op::LoadExpr(Json::int(42)), Default::default());
    set42.push(Op::Upset(0), Default::default());
    set42.push(Op::Return, Default::default());

    let mut get = BcFunction::new("get");
    get.push(Op::Params(0), Default::default());
    get.push(Op::Upget(0), Default::default());
    get.push(Op::Return, Default::default());

    let mut main = BcFunction::new("main");
    main.push(Op::LoadExpr(Json::int(0)), Default::default()); // slot 0: captured local
    main.push(
        Op::Closure(ClosureDescriptor { func_address: 1, captures: vec![CaptureDescriptor { is_local: true, index: 0 }] }),
        Default::default(),
    ); // slot 1: closure over `set42`
    main.push(
        Op::Closure(ClosureDescriptor { func_address: 2, captures: vec![CaptureDescriptor { is_local: true, index: 0 }] }),
        Default::default(),
    ); // slot 2: closure over `get`
    main.push(Op::LoadFrame(1), Default::default());
    main.push(Op::Calli, Default::default());
    main.push(Op::LoadFrame(2), Default::default());
    main.push(Op::Calli, Default::default());
    main.push(Op::Print, Default::default());
    main.push(Op::Exit(0), Default::default());

    let mut program = BcProgram::new();
    program.add_function(main);
    program.add_function(set42);
    program.add_function(get);

    let (status, out) = run(&program);
    assert_eq!(status, VmStatus::Exited);
    assert_eq!(out, "42\n");
}

#[test]
fn test_pattern_array_with_ellipsis_matches_either_direction() {
    let mut main = BcFunction::new("main");
    let pattern = Json::pattern_array(vec![Json::int(1), Json::ellipsis()]);
    let value = Json::array(vec![Json::int(1), Json::int(2), Json::int(3)]);
    main.push(Op::LoadExpr(pattern.clone()), Default::default());
    main.push(Op::LoadExpr(value.clone()), Default::default());
    main.push(Op::Equal, Default::default());
    main.push(Op::Print, Default::default());
    // Commutativity: (value ≡ pattern) must agree with (pattern ≡ value).
    main.push(Op::LoadExpr(value), Default::default());
    main.push(Op::LoadExpr(pattern), Default::default());
    main.push(Op::Equal, Default::default());
    main.push(Op::Print, Default::default());
    main.push(Op::Exit(0), Default::default());

    let mut program = BcProgram::new();
    program.add_function(main);

    let (status, out) = run(&program);
    assert_eq!(status, VmStatus::Exited);
    assert_eq!(out, "true\ntrue\n");
}

#[test]
fn test_coroutine_interleaving_both_ids_appear_exactly_once() {
    // main spawns two coroutines against a shared array, each appending its
    // own id, then returns without an explicit `exit` — the VM only halts
    // once the run queue and suspended list are both empty. The second
    // coroutine prints once both have had a chance to append: scheduling is
    // FIFO and each worker is far short of a `CONTEXT_SWITCH_CYCLES` (64)
    // preemption, so they run to completion in the order they were spawned.
    let mut main = BcFunction::new("main");
    main.push(Op::LoadExpr(Json::array(vec![])), Default::default());
    main.push(Op::LoadFrame(0), Default::default());
    main.push(Op::Schedule(1, 1), Default::default()); // worker_a
    main.push(Op::LoadFrame(0), Default::default());
    main.push(Op::Schedule(2, 1), Default::default()); // worker_b
    main.push(Op::Return, Default::default());

    let mut worker_a = BcFunction::new("worker_a");
    worker_a.push(Op::LoadFrame(0), Default::default());
    worker_a.push(Op::LoadExpr(Json::int(10)), Default::default());
    worker_a.push(Op::Append, Default::default());
    worker_a.push(Op::Return, Default::default());

    let mut worker_b = BcFunction::new("worker_b");
    worker_b.push(Op::LoadFrame(0), Default::default());
    worker_b.push(Op::LoadExpr(Json::int(20)), Default::default());
    worker_b.push(Op::Append, Default::default());
    worker_b.push(Op::LoadFrame(0), Default::default());
    worker_b.push(Op::Print, Default::default());
    worker_b.push(Op::Return, Default::default());

    let mut program = BcProgram::new();
    program.add_function(main);
    program.add_function(worker_a);
    program.add_function(worker_b);

    let (status, out) = run(&program);
    assert_eq!(status, VmStatus::Exited);
    assert_eq!(out, "[\n  10,\n  20\n]\n");
}

#[test]
fn test_jsonrpc_initialize_handshake_reads_server_info() {
    use std::io::Write;

    let script_path = std::env::temp_dir().join(format!("lstf-fake-server-{}.sh", std::process::id()));
    {
        let mut f = std::fs::File::create(&script_path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "read line").unwrap();
        writeln!(
            f,
            r#"printf '{{"jsonrpc":"2.0","id":1,"result":{{"serverInfo":{{"name":"LSTF test server"}}}}}}\n'"#
        )
        .unwrap();
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut client = lstf::jsonrpc::JsonRpcClient::spawn(script_path.to_str().unwrap()).unwrap();
    let result = client.call("initialize", serde_json::json!({})).unwrap();
    assert_eq!(result["serverInfo"]["name"], "LSTF test server");

    let _ = std::fs::remove_file(&script_path);
}
