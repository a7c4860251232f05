//! Fetch-decode-execute loop and cooperative coroutine scheduler (C9).
//!
//! Mirrors `original_source/src/vm/lstf-virtualmachine.c`'s `lstf_virtualmachine_run`:
//! one run queue, one suspended list, a lazily-materialized main coroutine,
//! and a context switch every [`CONTEXT_SWITCH_CYCLES`] instructions (or
//! sooner, if the run queue empties out). Bytecode is decoded directly from
//! the loaded program's raw `code` bytes at each coroutine's `pc`, the same
//! byte-pointer-as-program-counter design the original uses, rather than
//! from a pre-decoded instruction vector.

use std::collections::VecDeque;
use std::io::Write;
use std::rc::Rc;

use crate::bytecode::{CaptureDescriptor, ClosureDescriptor, JumpTarget, Op, VmCallCode};
use crate::event_loop::EventLoop;
use crate::json::{Json, JsonValue};
use crate::loader::VmProgram;
use crate::serialize::{opcode_from_byte, vmcall_from_u8, OpcodeTag};
use crate::stack::VmStack;
use crate::status::VmStatus;
use crate::value::{Closure, VmValue};

/// Instructions executed before a coroutine yields to the scheduler, absent
/// any I/O. Named after the constant of the same value in
/// `original_source/src/vm/lstf-virtualmachine.c`.
pub const CONTEXT_SWITCH_CYCLES: u32 = 64;

/// A single cooperative thread of execution: its own value/frame stack and
/// program counter. `pc == None` means the coroutine has returned from its
/// outermost frame (or never had one set up) and is finished.
pub struct Coroutine {
    id: u64,
    pub stack: VmStack,
    pub pc: Option<usize>,
    /// Number of in-flight `vmcall`s; nonzero keeps this coroutine off the
    /// run queue even when `pc` is still runnable.
    pub outstanding_io: u32,
}

impl Coroutine {
    fn new(id: u64, pc: usize) -> Self {
        Coroutine { id, stack: VmStack::new(), pc: Some(pc), outstanding_io: 0 }
    }
}

/// The virtual machine: a loaded program, its output sink, the scheduler
/// state, and the event loop backing `vmcall`.
pub struct Vm<W: Write> {
    program: VmProgram,
    ostream: W,
    run_queue: VecDeque<Coroutine>,
    suspended_list: Vec<Coroutine>,
    main_coroutine: Option<u64>,
    event_loop: EventLoop,
    breakpoints: std::collections::HashSet<u64>,
    debug: bool,
    instructions_executed: u32,
    last_status: VmStatus,
    last_pc: Option<usize>,
    next_coroutine_id: u64,
    return_code: u8,
}

impl<W: Write> Vm<W> {
    pub fn new(program: VmProgram, ostream: W, debug: bool) -> Self {
        Vm {
            program,
            ostream,
            run_queue: VecDeque::new(),
            suspended_list: Vec::new(),
            main_coroutine: None,
            event_loop: EventLoop::new(),
            breakpoints: std::collections::HashSet::new(),
            debug,
            instructions_executed: 0,
            last_status: VmStatus::Continue,
            last_pc: None,
            next_coroutine_id: 0,
            return_code: 0,
        }
    }

    pub fn last_pc(&self) -> Option<usize> {
        self.last_pc
    }

    pub fn return_code(&self) -> u8 {
        self.return_code
    }

    /// Adds a breakpoint at an absolute code-section byte offset. Returns
    /// `false` if out of bounds.
    pub fn add_breakpoint(&mut self, code_offset: u64) -> bool {
        if code_offset as usize >= self.program.code.len() {
            return false;
        }
        self.breakpoints.insert(code_offset);
        true
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_coroutine_id;
        self.next_coroutine_id += 1;
        id
    }

    /// Runs until the program exits, halts with a fatal status, or (in
    /// debug mode) stops at a breakpoint. Calling `run` again after a
    /// breakpoint resumes from where it stopped.
    pub fn run(&mut self) -> VmStatus {
        loop {
            if !matches!(self.last_status, VmStatus::Continue | VmStatus::HitBreakpoint) {
                return self.last_status;
            }

            if self.main_coroutine.is_none() {
                let mut cr = Coroutine::new(self.next_id(), self.program.entry_point_offset as usize);
                cr.stack.setup_frame(None, None);
                self.main_coroutine = Some(cr.id);
                self.run_queue.push_back(cr);
            }

            if self.run_queue.is_empty() && self.suspended_list.is_empty() {
                if self.last_status == VmStatus::Continue {
                    self.last_status = VmStatus::Exited;
                }
                return self.last_status;
            }

            if self.instructions_executed >= CONTEXT_SWITCH_CYCLES {
                self.instructions_executed = 0;
                self.event_loop.process(!self.run_queue.is_empty());
            } else if self.run_queue.is_empty() {
                self.event_loop.process(false);
            }

            let Some(front) = self.run_queue.front() else {
                // Nothing became runnable; since vmcalls in this
                // implementation complete synchronously (see event_loop),
                // a non-empty suspended_list with an empty run_queue can't
                // actually happen, but loop rather than panic if it did.
                continue;
            };
            self.last_pc = front.pc;

            if self.last_status != VmStatus::HitBreakpoint
                && self.debug
                && front.pc.is_some_and(|pc| self.breakpoints.contains(&(pc as u64)))
            {
                self.last_status = VmStatus::HitBreakpoint;
                return self.last_status;
            }

            let mut cr = self.run_queue.pop_front().expect("checked above");

            let status = self.step(&mut cr);
            self.last_status = status;
            self.instructions_executed += 1;

            if cr.pc.is_some() {
                if cr.outstanding_io == 0 {
                    if self.instructions_executed >= CONTEXT_SWITCH_CYCLES {
                        self.run_queue.push_back(cr);
                    } else {
                        self.run_queue.push_front(cr);
                    }
                } else {
                    self.suspended_list.push(cr);
                }
            }
        }
    }

    /// Fetches, decodes, and executes one instruction for `cr`.
    fn step(&mut self, cr: &mut Coroutine) -> VmStatus {
        let Some(mut pc) = cr.pc else { return VmStatus::InvalidCodeOffset };
        if pc >= self.program.code.len() {
            cr.pc = None;
            return VmStatus::InvalidCodeOffset;
        }
        let op = match decode_op(&self.program.code, &mut pc) {
            Ok(op) => op,
            Err(status) => {
                cr.pc = None;
                return status;
            }
        };
        cr.pc = Some(pc);
        self.execute(cr, op)
    }

    fn execute(&mut self, cr: &mut Coroutine, op: Op) -> VmStatus {
        match op {
            Op::LoadFrame(n) => match cr.stack.get(n) {
                Ok(value) => {
                    let value = value.clone();
                    push(cr, value)
                }
                Err(status) => status,
            },
            Op::LoadData(offset) => {
                let Some(text) = read_cstr_at(&self.program.data, offset as usize) else {
                    return VmStatus::InvalidDataOffset;
                };
                let Ok(node) = Json::parse(text) else { return VmStatus::InvalidExpression };
                push(cr, value_from_json(&node))
            }
            Op::LoadAddress(offset) => {
                if offset as usize >= self.program.code.len() {
                    return VmStatus::InvalidCodeOffset;
                }
                push(cr, VmValue::CodeAddress(offset as usize))
            }
            Op::LoadExpr(json) => push(cr, value_from_json(&json)),
            Op::Store(n) => match cr.stack.pop() {
                Ok(value) => match cr.stack.set(n, value) {
                    Ok(()) => VmStatus::Continue,
                    Err(status) => status,
                },
                Err(status) => status,
            },
            Op::Pop => match cr.stack.pop() {
                Ok(_) => VmStatus::Continue,
                Err(status) => status,
            },
            Op::Get => self.op_get(cr),
            Op::Set => self.op_set(cr),
            Op::Append => self.op_append(cr),
            Op::In => self.op_in(cr),
            Op::Params(n) => self.op_params(cr, n),
            Op::Call(addr) => {
                let return_address = cr.pc;
                cr.stack.setup_frame(return_address, None);
                cr.pc = Some(addr as usize);
                VmStatus::Continue
            }
            Op::Calli => self.op_calli(cr),
            Op::Schedule(addr, n) => self.schedule_new_coroutine(cr, n, addr as usize, None),
            Op::Schedulei(n) => self.op_schedulei(cr, n),
            Op::Return => match cr.stack.teardown_frame() {
                Ok(return_address) => {
                    cr.pc = return_address;
                    VmStatus::Continue
                }
                Err(status) => status,
            },
            Op::Closure(desc) => self.op_closure(cr, desc),
            Op::Upget(id) => self.op_upget(cr, id),
            Op::Upset(id) => self.op_upset(cr, id),
            Op::Vmcall(code) => self.op_vmcall(cr, code),
            Op::Else(target) => self.op_else(cr, target),
            Op::Jump(target) => self.op_jump(cr, target),
            Op::Bool => self.op_bool(cr),
            Op::Land => self.binary_bool(cr, |a, b| a && b),
            Op::Lor => self.binary_bool(cr, |a, b| a || b),
            Op::Lnot => self.unary_bool(cr, |a| !a),
            Op::LessThan => self.comparison(cr, |o| o == std::cmp::Ordering::Less),
            Op::LessThanEqual => self.comparison(cr, |o| o != std::cmp::Ordering::Greater),
            Op::Equal => self.op_equal(cr),
            Op::GreaterThan => self.comparison(cr, |o| o == std::cmp::Ordering::Greater),
            Op::GreaterThanEqual => self.comparison(cr, |o| o != std::cmp::Ordering::Less),
            Op::Add => self.arithmetic(cr, |a, b| a + b, |a, b| a + b),
            Op::Sub => self.arithmetic(cr, |a, b| a - b, |a, b| a - b),
            Op::Mul => self.arithmetic(cr, |a, b| a * b, |a, b| a * b),
            Op::Div => self.arithmetic(cr, |a, b| a / b, |a, b| a / b),
            Op::Pow => self.op_pow(cr),
            Op::Mod => self.arithmetic(cr, |a, b| a % b, f64::rem_euclid),
            Op::Neg => self.op_neg(cr),
            Op::And => self.bitwise(cr, |a, b| a & b),
            Op::Or => self.bitwise(cr, |a, b| a | b),
            Op::Xor => self.bitwise(cr, |a, b| a ^ b),
            Op::Lshift => self.bitwise(cr, |a, b| ((a as u64) << (b as u64)) as i64),
            Op::Rshift => self.bitwise(cr, |a, b| ((a as u64) >> (b as u64)) as i64),
            Op::Not => self.op_not(cr),
            Op::Print => self.op_print(cr),
            Op::Exit(code) => {
                self.return_code = code;
                VmStatus::Exited
            }
            Op::Assert => match cr.stack.pop() {
                Ok(value) => {
                    if value.truthy() {
                        VmStatus::Continue
                    } else {
                        VmStatus::AssertionFailed
                    }
                }
                Err(status) => status,
            },
        }
    }

    fn op_get(&mut self, cr: &mut Coroutine) -> VmStatus {
        let index = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let container = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let VmValue::Json(node) = container else { return VmStatus::InvalidOperandType };
        if node.is_object() {
            let Some(key) = index.as_string_ref() else { return VmStatus::InvalidOperandType };
            match node.get_member(&key) {
                Some(member) => push(cr, value_from_json(&member)),
                None => VmStatus::InvalidMemberAccess,
            }
        } else if node.is_array() {
            let VmValue::Integer(i) = index else { return VmStatus::InvalidOperandType };
            match node.array_get(i as usize) {
                Some(elem) => push(cr, value_from_json(&elem)),
                None => VmStatus::InvalidMemberAccess,
            }
        } else {
            VmStatus::InvalidOperandType
        }
    }

    fn op_set(&mut self, cr: &mut Coroutine) -> VmStatus {
        let value = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let index = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let container = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let VmValue::Json(node) = container else { return VmStatus::InvalidOperandType };
        if node.is_object() {
            let Some(key) = index.as_string_ref() else { return VmStatus::InvalidOperandType };
            node.object_set_member(&key, value.to_json());
            VmStatus::Continue
        } else if node.is_array() {
            let VmValue::Integer(i) = index else { return VmStatus::InvalidOperandType };
            if i < 0 || node.array_len().is_none_or(|len| i as usize >= len) {
                return VmStatus::IndexOutOfBounds;
            }
            node.array_set(i as usize, value.to_json());
            VmStatus::Continue
        } else {
            VmStatus::InvalidOperandType
        }
    }

    fn op_append(&mut self, cr: &mut Coroutine) -> VmStatus {
        let value = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let array = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let VmValue::Json(node) = array else { return VmStatus::InvalidOperandType };
        match node.array_push(value.to_json()) {
            Ok(()) => VmStatus::Continue,
            Err(_) => VmStatus::InvalidOperandType,
        }
    }

    /// `in` - pop needle then haystack; push whether the haystack (object or
    /// array) contains it. Not part of the original opcode set's
    /// `virtualmachine_calls` table; added alongside `Match` in the IR.
    fn op_in(&mut self, cr: &mut Coroutine) -> VmStatus {
        let needle = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let haystack = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let VmValue::Json(node) = haystack else { return VmStatus::InvalidOperandType };
        let found = if node.is_object() {
            match needle.as_string_ref() {
                Some(key) => node.get_member(&key).is_some(),
                None => return VmStatus::InvalidOperandType,
            }
        } else if node.is_array() {
            let needle_json = needle.to_json();
            node.as_array().into_iter().flatten().any(|elem| Json::json_eq(&elem, &needle_json))
        } else {
            return VmStatus::InvalidOperandType;
        };
        push(cr, VmValue::Boolean(found))
    }

    fn op_params(&mut self, cr: &mut Coroutine, num_params: u8) -> VmStatus {
        let return_address = match cr.stack.current_frame() {
            Ok(frame) => frame.return_address,
            Err(status) => return status,
        };
        if return_address.is_some() {
            for i in 0..num_params {
                let fp_offset = -(i64::from(num_params) - i64::from(i));
                let value = match cr.stack.get(fp_offset) {
                    Ok(v) => v.clone(),
                    Err(status) => return status,
                };
                push(cr, value);
            }
        }
        match cr.stack.set_params(num_params) {
            Ok(()) => VmStatus::Continue,
            Err(status) => status,
        }
    }

    fn op_calli(&mut self, cr: &mut Coroutine) -> VmStatus {
        let callee = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let (address, closure) = match callee {
            VmValue::CodeAddress(addr) => (addr, None),
            VmValue::Closure(c) => (c.code_address, Some(c)),
            _ => return VmStatus::InvalidOperandType,
        };
        let return_address = cr.pc;
        cr.stack.setup_frame(return_address, closure);
        cr.pc = Some(address);
        VmStatus::Continue
    }

    fn op_schedulei(&mut self, cr: &mut Coroutine, num_params: u8) -> VmStatus {
        let callee = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let (address, closure) = match callee {
            VmValue::CodeAddress(addr) => (addr, None),
            VmValue::Closure(c) => (c.code_address, Some(c)),
            _ => return VmStatus::InvalidOperandType,
        };
        self.schedule_new_coroutine(cr, num_params, address, closure)
    }

    fn schedule_new_coroutine(
        &mut self,
        cr: &mut Coroutine,
        num_params: u8,
        code_address: usize,
        closure: Option<Rc<Closure>>,
    ) -> VmStatus {
        if code_address >= self.program.code.len() {
            return VmStatus::InvalidCodeOffset;
        }
        let mut new_cr = Coroutine::new(self.next_id(), code_address);
        new_cr.stack.setup_frame(None, closure);

        let mut params = Vec::with_capacity(num_params as usize);
        for _ in 0..num_params {
            match cr.stack.pop() {
                Ok(v) => params.push(v),
                Err(status) => return status,
            }
        }
        params.reverse();
        for value in params {
            new_cr.stack.push(value);
        }
        self.run_queue.push_back(new_cr);
        VmStatus::Continue
    }

    fn op_closure(&mut self, cr: &mut Coroutine, desc: ClosureDescriptor) -> VmStatus {
        if desc.func_address as usize >= self.program.code.len() {
            return VmStatus::InvalidCodeOffset;
        }
        let mut upvalues = Vec::with_capacity(desc.captures.len());
        for cap in &desc.captures {
            let handle = if cap.is_local {
                match cr.stack.get_or_track_upvalue(cap.index as i64) {
                    Ok(h) => h,
                    Err(status) => return status,
                }
            } else {
                match cr.stack.upvalue(cap.index) {
                    Ok(h) => h,
                    Err(status) => return status,
                }
            };
            upvalues.push(handle);
        }
        let closure = Rc::new(Closure::new(desc.func_address as usize, upvalues));
        push(cr, VmValue::Closure(closure))
    }

    fn op_upget(&mut self, cr: &mut Coroutine, id: u8) -> VmStatus {
        let handle = match cr.stack.upvalue(id as u64) {
            Ok(h) => h,
            Err(status) => return status,
        };
        let value = cr.stack.read_upvalue(&handle);
        push(cr, value)
    }

    fn op_upset(&mut self, cr: &mut Coroutine, id: u8) -> VmStatus {
        let handle = match cr.stack.upvalue(id as u64) {
            Ok(h) => h,
            Err(status) => return status,
        };
        let value = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        cr.stack.write_upvalue(&handle, value);
        VmStatus::Continue
    }

    fn op_vmcall(&mut self, cr: &mut Coroutine, code: VmCallCode) -> VmStatus {
        cr.outstanding_io += 1;
        let result = match code {
            VmCallCode::Connect => self.vmcall_connect(cr),
            VmCallCode::TdOpen => self.vmcall_td_open(cr),
            VmCallCode::Diagnostics => self.vmcall_diagnostics(cr),
            VmCallCode::OpenBuffer => self.vmcall_open_buffer(cr),
        };
        cr.outstanding_io -= 1;
        result
    }

    fn vmcall_connect(&mut self, cr: &mut Coroutine) -> VmStatus {
        let path = match pop_string(cr) {
            Ok(s) => s,
            Err(status) => return status,
        };
        tracing::debug!(server = %path, "vmcall: connect");
        match self.event_loop.connect(&path) {
            Ok(_) => VmStatus::Continue,
            Err(status) => status,
        }
    }

    fn vmcall_td_open(&mut self, cr: &mut Coroutine) -> VmStatus {
        let filename = match pop_string(cr) {
            Ok(s) => s,
            Err(status) => return status,
        };
        let Ok(text) = std::fs::read_to_string(&filename) else {
            return VmStatus::CouldNotCommunicate;
        };
        let uri = format!("file://{filename}");
        tracing::debug!(%uri, "vmcall: td_open");
        match self.event_loop.notify(
            "textDocument/didOpen",
            serde_json::json!({"textDocument": {"uri": uri, "text": text}}),
        ) {
            Ok(()) => VmStatus::Continue,
            Err(status) => status,
        }
    }

    fn vmcall_open_buffer(&mut self, cr: &mut Coroutine) -> VmStatus {
        let text = match pop_string(cr) {
            Ok(s) => s,
            Err(status) => return status,
        };
        let filename = match pop_string(cr) {
            Ok(s) => s,
            Err(status) => return status,
        };
        let uri = format!("buffer://{filename}");
        tracing::debug!(%uri, "vmcall: open_buffer");
        match self.event_loop.notify(
            "textDocument/didOpen",
            serde_json::json!({"textDocument": {"uri": uri, "text": text}}),
        ) {
            Ok(()) => VmStatus::Continue,
            Err(status) => status,
        }
    }

    fn vmcall_diagnostics(&mut self, cr: &mut Coroutine) -> VmStatus {
        let filename = match pop_string(cr) {
            Ok(s) => s,
            Err(status) => return status,
        };
        let uri = format!("file://{filename}");
        tracing::debug!(%uri, "vmcall: diagnostics");
        match self.event_loop.call(
            "textDocument/diagnostics",
            serde_json::json!({"textDocument": {"uri": uri}}),
        ) {
            Ok(result) => push(cr, value_from_json(&json_from_serde(&result))),
            Err(status) => status,
        }
    }

    fn op_else(&mut self, cr: &mut Coroutine, target: JumpTarget) -> VmStatus {
        let value = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        if value.truthy() {
            VmStatus::Continue
        } else {
            self.op_jump(cr, target)
        }
    }

    fn op_jump(&mut self, cr: &mut Coroutine, target: JumpTarget) -> VmStatus {
        let Some(offset) = target.offset() else { return VmStatus::InvalidCodeOffset };
        if offset as usize > self.program.code.len() {
            return VmStatus::InvalidCodeOffset;
        }
        cr.pc = Some(offset as usize);
        VmStatus::Continue
    }

    fn op_bool(&mut self, cr: &mut Coroutine) -> VmStatus {
        match cr.stack.pop() {
            Ok(value) => push(cr, VmValue::Boolean(value.truthy())),
            Err(status) => status,
        }
    }

    fn binary_bool(&mut self, cr: &mut Coroutine, f: impl FnOnce(bool, bool) -> bool) -> VmStatus {
        let b = match pop_bool(cr) {
            Ok(v) => v,
            Err(status) => return status,
        };
        let a = match pop_bool(cr) {
            Ok(v) => v,
            Err(status) => return status,
        };
        push(cr, VmValue::Boolean(f(a, b)))
    }

    fn unary_bool(&mut self, cr: &mut Coroutine, f: impl FnOnce(bool) -> bool) -> VmStatus {
        let a = match pop_bool(cr) {
            Ok(v) => v,
            Err(status) => return status,
        };
        push(cr, VmValue::Boolean(f(a)))
    }

    fn comparison(&mut self, cr: &mut Coroutine, accept: impl FnOnce(std::cmp::Ordering) -> bool) -> VmStatus {
        let (a, b) = match pop_numeric_pair(cr) {
            Ok(pair) => pair,
            Err(status) => return status,
        };
        let Some(ordering) = a.partial_cmp(b) else { return VmStatus::InvalidOperandType };
        push(cr, VmValue::Boolean(accept(ordering)))
    }

    fn op_equal(&mut self, cr: &mut Coroutine) -> VmStatus {
        let b = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let a = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let equal = match (&a, &b) {
            (VmValue::Null, VmValue::Null) => true,
            (VmValue::Boolean(x), VmValue::Boolean(y)) => x == y,
            (VmValue::CodeAddress(x), VmValue::CodeAddress(y)) => x == y,
            (VmValue::String(x), VmValue::String(y)) => x == y,
            (VmValue::Integer(x), VmValue::Integer(y)) => x == y,
            (VmValue::Double(x), VmValue::Double(y)) => x == y,
            (VmValue::Integer(x), VmValue::Double(y)) | (VmValue::Double(y), VmValue::Integer(x)) => {
                *x as f64 == *y
            }
            (VmValue::Json(x), VmValue::Json(y)) => Json::json_eq(x, y),
            (VmValue::Closure(x), VmValue::Closure(y)) => Rc::ptr_eq(x, y),
            _ => false,
        };
        push(cr, VmValue::Boolean(equal))
    }

    fn arithmetic(
        &mut self,
        cr: &mut Coroutine,
        int_op: impl FnOnce(i64, i64) -> i64,
        float_op: impl FnOnce(f64, f64) -> f64,
    ) -> VmStatus {
        let b = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        let a = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        match (a, b) {
            (VmValue::Integer(x), VmValue::Integer(y)) => push(cr, VmValue::Integer(int_op(x, y))),
            (VmValue::Integer(x), VmValue::Double(y)) => push(cr, VmValue::Double(float_op(x as f64, y))),
            (VmValue::Double(x), VmValue::Integer(y)) => push(cr, VmValue::Double(float_op(x, y as f64))),
            (VmValue::Double(x), VmValue::Double(y)) => push(cr, VmValue::Double(float_op(x, y))),
            _ => VmStatus::InvalidOperandType,
        }
    }

    fn op_pow(&mut self, cr: &mut Coroutine) -> VmStatus {
        let (a, b) = match pop_numeric_pair(cr) {
            Ok(pair) => pair,
            Err(status) => return status,
        };
        match (a, b) {
            (Numeric::Int(x), Numeric::Int(y)) if y >= 0 => push(cr, VmValue::Integer(x.pow(y as u32))),
            _ => push(cr, VmValue::Double(a.as_f64().powf(b.as_f64()))),
        }
    }

    fn op_neg(&mut self, cr: &mut Coroutine) -> VmStatus {
        match cr.stack.pop() {
            Ok(VmValue::Integer(i)) => push(cr, VmValue::Integer(-i)),
            Ok(VmValue::Double(d)) => push(cr, VmValue::Double(-d)),
            Ok(_) => VmStatus::InvalidOperandType,
            Err(status) => status,
        }
    }

    fn bitwise(&mut self, cr: &mut Coroutine, f: impl FnOnce(i64, i64) -> i64) -> VmStatus {
        let b = match pop_int(cr) {
            Ok(v) => v,
            Err(status) => return status,
        };
        let a = match pop_int(cr) {
            Ok(v) => v,
            Err(status) => return status,
        };
        push(cr, VmValue::Integer(f(a, b)))
    }

    fn op_not(&mut self, cr: &mut Coroutine) -> VmStatus {
        match pop_int(cr) {
            Ok(a) => push(cr, VmValue::Integer(!a)),
            Err(status) => status,
        }
    }

    fn op_print(&mut self, cr: &mut Coroutine) -> VmStatus {
        let value = match cr.stack.pop() {
            Ok(v) => v,
            Err(status) => return status,
        };
        match &value {
            VmValue::Json(node) => {
                let _ = writeln!(self.ostream, "{}", node.to_json_string(true));
            }
            VmValue::CodeAddress(addr) => {
                let _ = writeln!(self.ostream, "[VM code @ {addr:#x}]");
            }
            VmValue::Closure(c) => {
                let _ = writeln!(self.ostream, "[closure [VM code @ {:#x}] [{} up-values]]", c.code_address, c.upvalues.len());
            }
            other => {
                let _ = writeln!(self.ostream, "{other}");
            }
        }
        VmStatus::Continue
    }
}

fn push(cr: &mut Coroutine, value: VmValue) -> VmStatus {
    cr.stack.push(value)
}

impl VmValue {
    fn as_string_ref(&self) -> Option<String> {
        match self {
            VmValue::String(s) => Some(s.to_string()),
            _ => None,
        }
    }
}

fn pop_string(cr: &mut Coroutine) -> Result<String, VmStatus> {
    match cr.stack.pop()? {
        VmValue::String(s) => Ok(s.to_string()),
        _ => Err(VmStatus::InvalidOperandType),
    }
}

fn pop_bool(cr: &mut Coroutine) -> Result<bool, VmStatus> {
    match cr.stack.pop()? {
        VmValue::Boolean(b) => Ok(b),
        _ => Err(VmStatus::InvalidOperandType),
    }
}

fn pop_int(cr: &mut Coroutine) -> Result<i64, VmStatus> {
    match cr.stack.pop()? {
        VmValue::Integer(i) => Ok(i),
        _ => Err(VmStatus::InvalidOperandType),
    }
}

#[derive(Clone, Copy)]
enum Numeric {
    Int(i64),
    Double(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Double(d) => d,
        }
    }

    fn partial_cmp(self, other: Numeric) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => Some(a.cmp(&b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

fn as_numeric(value: VmValue) -> Result<Numeric, VmStatus> {
    match value {
        VmValue::Integer(i) => Ok(Numeric::Int(i)),
        VmValue::Double(d) => Ok(Numeric::Double(d)),
        _ => Err(VmStatus::InvalidOperandType),
    }
}

fn pop_numeric_pair(cr: &mut Coroutine) -> Result<(Numeric, Numeric), VmStatus> {
    let b = as_numeric(cr.stack.pop()?)?;
    let a = as_numeric(cr.stack.pop()?)?;
    Ok((a, b))
}

/// Converts a loaded JSON literal (data section, `loadexpr`) into a runtime
/// value, unwrapping scalars the way
/// `lstf_vm_value_from_json_node` does so `print`/arithmetic don't need to
/// go through the JSON layer for plain numbers and strings.
fn value_from_json(node: &Json) -> VmValue {
    node.with_value(|v| match v {
        JsonValue::Null => VmValue::Null,
        JsonValue::Bool(b) => VmValue::Boolean(*b),
        JsonValue::Int(i) => VmValue::Integer(*i),
        JsonValue::Double(d) => VmValue::Double(*d),
        JsonValue::String(s) => VmValue::String(Rc::from(s.as_str())),
        JsonValue::Array(_) | JsonValue::Object(_) | JsonValue::Ellipsis => VmValue::Json(node.clone()),
    })
}

fn json_from_serde(value: &serde_json::Value) -> Json {
    match value {
        serde_json::Value::Null => Json::null(),
        serde_json::Value::Bool(b) => Json::bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Json::int(i)
            } else {
                Json::double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Json::string(s.clone()),
        serde_json::Value::Array(items) => Json::array(items.iter().map(json_from_serde).collect()),
        serde_json::Value::Object(members) => {
            Json::object(members.iter().map(|(k, v)| (k.clone(), json_from_serde(v))).collect())
        }
    }
}

fn read_cstr_at(bytes: &[u8], offset: usize) -> Option<&str> {
    let rest = bytes.get(offset..)?;
    let end = rest.iter().position(|b| *b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

fn read_byte(code: &[u8], pc: &mut usize) -> Result<u8, VmStatus> {
    let b = *code.get(*pc).ok_or(VmStatus::InvalidCodeOffset)?;
    *pc += 1;
    Ok(b)
}

fn read_u64(code: &[u8], pc: &mut usize) -> Result<u64, VmStatus> {
    let end = *pc + 8;
    let bytes = code.get(*pc..end).ok_or(VmStatus::InvalidCodeOffset)?;
    *pc = end;
    Ok(u64::from_be_bytes(bytes.try_into().expect("slice is 8 bytes")))
}

fn read_i64(code: &[u8], pc: &mut usize) -> Result<i64, VmStatus> {
    Ok(read_u64(code, pc)? as i64)
}

fn read_cstr<'a>(code: &'a [u8], pc: &mut usize) -> Result<&'a str, VmStatus> {
    let start = *pc;
    loop {
        let b = read_byte(code, pc)?;
        if b == 0 {
            break;
        }
    }
    std::str::from_utf8(&code[start..*pc - 1]).map_err(|_| VmStatus::InvalidExpression)
}

/// Decodes one [`Op`] at `pc`, advancing it past the instruction. Shared by
/// the VM's fetch step and `lstf-cli`'s `-d` disassembler.
pub fn decode_op(code: &[u8], pc: &mut usize) -> Result<Op, VmStatus> {
    let opcode = read_byte(code, pc)?;
    let tag = opcode_from_byte(opcode).ok_or(VmStatus::InvalidInstruction)?;
    Ok(match tag {
        OpcodeTag::LoadFrame => Op::LoadFrame(read_i64(code, pc)?),
        OpcodeTag::LoadData => Op::LoadData(read_u64(code, pc)?),
        OpcodeTag::LoadAddress => Op::LoadAddress(read_u64(code, pc)?),
        OpcodeTag::LoadExpr => {
            let text = read_cstr(code, pc)?;
            Op::LoadExpr(Json::parse(text).map_err(|_| VmStatus::InvalidExpression)?)
        }
        OpcodeTag::Store => Op::Store(read_i64(code, pc)?),
        OpcodeTag::Pop => Op::Pop,
        OpcodeTag::Get => Op::Get,
        OpcodeTag::Set => Op::Set,
        OpcodeTag::Append => Op::Append,
        OpcodeTag::In => Op::In,
        OpcodeTag::Params => Op::Params(read_byte(code, pc)?),
        OpcodeTag::Call => Op::Call(read_u64(code, pc)?),
        OpcodeTag::Calli => Op::Calli,
        OpcodeTag::Schedule => {
            let addr = read_u64(code, pc)?;
            let n = read_byte(code, pc)?;
            Op::Schedule(addr, n)
        }
        OpcodeTag::Schedulei => Op::Schedulei(read_byte(code, pc)?),
        OpcodeTag::Return => Op::Return,
        OpcodeTag::Closure => {
            let n = read_byte(code, pc)?;
            let func_address = read_u64(code, pc)?;
            let mut captures = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let is_local = read_byte(code, pc)? != 0;
                let index = read_u64(code, pc)?;
                captures.push(CaptureDescriptor { is_local, index });
            }
            Op::Closure(ClosureDescriptor { func_address, captures })
        }
        OpcodeTag::Upget => Op::Upget(read_byte(code, pc)?),
        OpcodeTag::Upset => Op::Upset(read_byte(code, pc)?),
        OpcodeTag::Vmcall => {
            let byte = read_byte(code, pc)?;
            Op::Vmcall(vmcall_from_u8(byte).ok_or(VmStatus::InvalidVmCall)?)
        }
        OpcodeTag::Else => Op::Else(JumpTarget::Resolved(read_u64(code, pc)?)),
        OpcodeTag::Jump => Op::Jump(JumpTarget::Resolved(read_u64(code, pc)?)),
        OpcodeTag::Bool => Op::Bool,
        OpcodeTag::Land => Op::Land,
        OpcodeTag::Lor => Op::Lor,
        OpcodeTag::Lnot => Op::Lnot,
        OpcodeTag::LessThan => Op::LessThan,
        OpcodeTag::LessThanEqual => Op::LessThanEqual,
        OpcodeTag::Equal => Op::Equal,
        OpcodeTag::GreaterThan => Op::GreaterThan,
        OpcodeTag::GreaterThanEqual => Op::GreaterThanEqual,
        OpcodeTag::Add => Op::Add,
        OpcodeTag::Sub => Op::Sub,
        OpcodeTag::Mul => Op::Mul,
        OpcodeTag::Div => Op::Div,
        OpcodeTag::Pow => Op::Pow,
        OpcodeTag::Mod => Op::Mod,
        OpcodeTag::Neg => Op::Neg,
        OpcodeTag::And => Op::And,
        OpcodeTag::Or => Op::Or,
        OpcodeTag::Xor => Op::Xor,
        OpcodeTag::Lshift => Op::Lshift,
        OpcodeTag::Rshift => Op::Rshift,
        OpcodeTag::Not => Op::Not,
        OpcodeTag::Print => Op::Print,
        OpcodeTag::Exit => Op::Exit(read_byte(code, pc)?),
        OpcodeTag::Assert => Op::Assert,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BcFunction;
    use crate::bytecode::BcProgram;

    fn load(program: &BcProgram) -> VmProgram {
        let mut buf = Vec::new();
        crate::serialize::serialize(program, &mut buf).unwrap();
        crate::loader::load(&buf).unwrap()
    }

    #[test]
    fn hello_world_exits_zero_and_prints_once() {
        let mut program = BcProgram::new();
        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::string("hello")), Default::default());
        main.push(Op::Print, Default::default());
        main.push(Op::Exit(0), Default::default());
        program.add_function(main);

        let loaded = load(&program);
        let mut out = Vec::new();
        let mut vm = Vm::new(loaded, &mut out, false);
        let status = vm.run();
        assert_eq!(status, VmStatus::Exited);
        assert_eq!(vm.return_code(), 0);
        assert_eq!(String::from_utf8(out).unwrap(), "hello\n");
    }

    #[test]
    fn arithmetic_and_comparison_round_trip() {
        let mut program = BcProgram::new();
        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::int(2)), Default::default());
        main.push(Op::LoadExpr(Json::int(3)), Default::default());
        main.push(Op::Add, Default::default());
        main.push(Op::Print, Default::default()); // 5
        main.push(Op::LoadExpr(Json::int(5)), Default::default());
        main.push(Op::LoadExpr(Json::int(5)), Default::default());
        main.push(Op::Equal, Default::default());
        main.push(Op::Print, Default::default()); // true
        main.push(Op::Exit(0), Default::default());
        program.add_function(main);

        let loaded = load(&program);
        let mut out = Vec::new();
        let mut vm = Vm::new(loaded, &mut out, false);
        assert_eq!(vm.run(), VmStatus::Exited);
        assert_eq!(String::from_utf8(out).unwrap(), "5\ntrue\n");
    }

    #[test]
    fn assertion_failure_halts_but_is_not_vm_fatal() {
        let mut program = BcProgram::new();
        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::bool(false)), Default::default());
        main.push(Op::Assert, Default::default());
        main.push(Op::Exit(0), Default::default());
        program.add_function(main);

        let loaded = load(&program);
        let mut out = Vec::new();
        let mut vm = Vm::new(loaded, &mut out, false);
        let status = vm.run();
        assert_eq!(status, VmStatus::AssertionFailed);
        assert!(!status.is_fatal_for_vm());
    }

    #[test]
    fn call_returns_value_and_caller_args_are_cleaned_up() {
        // main calls add_one(41) and prints the result; verifies the
        // callee-cleans-args convention: add_one's `params` duplicates the
        // argument into its own frame, and tearing down its frame on
        // `return` must both hand the return value back to main and drop
        // the original argument main pushed, leaving main's stack exactly
        // where it was plus the one pushed value.
        let mut program = BcProgram::new();

        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::int(41)), Default::default());
        main.push(Op::Call(1), Default::default());
        main.push(Op::Print, Default::default());
        main.push(Op::Exit(0), Default::default());
        program.add_function(main);

        let mut add_one = BcFunction::new("add_one");
        add_one.push(Op::Params(1), Default::default());
        add_one.push(Op::LoadFrame(0), Default::default());
        add_one.push(Op::LoadExpr(Json::int(1)), Default::default());
        add_one.push(Op::Add, Default::default());
        add_one.push(Op::Return, Default::default());
        program.add_function(add_one);

        let loaded = load(&program);
        let mut out = Vec::new();
        let mut vm = Vm::new(loaded, &mut out, false);
        assert_eq!(vm.run(), VmStatus::Exited);
        assert_eq!(String::from_utf8(out).unwrap(), "42\n");
    }

    #[test]
    fn scheduled_coroutine_runs_after_its_parent_finishes() {
        // main builds a shared array, schedules `worker` with it as the
        // sole parameter, appends 1 itself, then returns without an
        // explicit `exit` - the VM only exits once both the run queue and
        // suspended list are empty, so `worker` still gets to run and
        // append 2 before the program halts.
        let mut program = BcProgram::new();

        let mut main = BcFunction::new("main");
        main.push(Op::LoadExpr(Json::array(vec![])), Default::default()); // slot 0: shared array
        main.push(Op::LoadFrame(0), Default::default());
        main.push(Op::Schedule(1, 1), Default::default());
        main.push(Op::LoadFrame(0), Default::default());
        main.push(Op::LoadExpr(Json::int(1)), Default::default());
        main.push(Op::Append, Default::default());
        main.push(Op::LoadFrame(0), Default::default());
        main.push(Op::Print, Default::default());
        main.push(Op::Return, Default::default());
        program.add_function(main);

        let mut worker = BcFunction::new("worker");
        worker.push(Op::LoadFrame(0), Default::default());
        worker.push(Op::LoadExpr(Json::int(2)), Default::default());
        worker.push(Op::Append, Default::default());
        worker.push(Op::Return, Default::default());
        program.add_function(worker);

        let loaded = load(&program);
        let mut out = Vec::new();
        let mut vm = Vm::new(loaded, &mut out, false);
        assert_eq!(vm.run(), VmStatus::Exited);
        assert_eq!(String::from_utf8(out).unwrap(), "[\n  1\n]\n");
    }
}
