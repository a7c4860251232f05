//! Runtime values that live on the VM stack: scalars, JSON/pattern
//! references, code addresses, closures, and upvalues.
//!
//! The original C runtime tags every value with a `takes_ownership` bit and
//! threads floating references through `lstf_vm_value_to_json_node` /
//! `json_node_unref`. Rust's ownership model already prevents a `Json` node
//! from being read after it is freed, so [`VmValue`] drops that bit entirely
//! (see `DESIGN.md`): a `VmValue::Object`/`Array`/`Pattern` variant simply
//! holds the `Json` handle it refers to.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::json::Json;

/// A value on the VM's operand stack or in a stack frame slot.
#[derive(Debug, Clone)]
pub enum VmValue {
    Null,
    Integer(i64),
    Double(f64),
    Boolean(bool),
    String(Rc<str>),
    /// Reference to a JSON object, array, or pattern node.
    Json(Json),
    /// A jump target or call target inside the owning program's code section.
    CodeAddress(usize),
    Closure(Rc<Closure>),
}

impl VmValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            VmValue::Null => "null",
            VmValue::Integer(_) => "integer",
            VmValue::Double(_) => "double",
            VmValue::Boolean(_) => "boolean",
            VmValue::String(_) => "string",
            VmValue::Json(_) => "object",
            VmValue::CodeAddress(_) => "code address",
            VmValue::Closure(_) => "closure",
        }
    }

    /// Converts to a [`Json`] node, the way the bytecode `get`/`set`/builtin
    /// opcodes need in order to treat scalars uniformly with JSON values.
    pub fn to_json(&self) -> Json {
        match self {
            VmValue::Null => Json::null(),
            VmValue::Integer(i) => Json::int(*i),
            VmValue::Double(d) => Json::double(*d),
            VmValue::Boolean(b) => Json::bool(*b),
            VmValue::String(s) => Json::string(s.as_ref()),
            VmValue::Json(node) => node.clone(),
            VmValue::CodeAddress(addr) => Json::int(*addr as i64),
            VmValue::Closure(_) => Json::null(),
        }
    }

    pub fn as_code_address(&self) -> Option<usize> {
        match self {
            VmValue::CodeAddress(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<Rc<Closure>> {
        match self {
            VmValue::Closure(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            VmValue::Null => false,
            VmValue::Boolean(b) => *b,
            VmValue::Integer(i) => *i != 0,
            VmValue::Double(d) => *d != 0.0,
            VmValue::String(s) => !s.is_empty(),
            VmValue::Json(node) => !node.with_value(|v| matches!(v, crate::json::JsonValue::Null)),
            VmValue::CodeAddress(_) | VmValue::Closure(_) => true,
        }
    }
}

impl fmt::Display for VmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmValue::Null => write!(f, "null"),
            VmValue::Integer(i) => write!(f, "{i}"),
            VmValue::Double(d) => write!(f, "{d}"),
            VmValue::Boolean(b) => write!(f, "{b}"),
            VmValue::String(s) => write!(f, "{s}"),
            VmValue::Json(node) => write!(f, "{}", node.to_json_string(false)),
            VmValue::CodeAddress(addr) => write!(f, "<code +{addr:#x}>"),
            VmValue::Closure(c) => write!(f, "<closure +{:#x}>", c.code_address),
        }
    }
}

/// An upvalue captured by a closure. Starts "open" (an index into the frame
/// that created it, i.e. it is still a live local); becomes "closed" (an
/// owned copy of the value) once that frame is torn down.
///
/// Two closures that capture the *same* local share one `Upvalue` instance,
/// so mutating it through one closure is visible through the other — this
/// is the sharing invariant the capture model requires (`DESIGN.md`, Open
/// Question "capture ambiguity"). [`crate::stack::StackFrame::tracked_upvalues`]
/// is what enforces that two captures of the same frame offset return the
/// same `Rc<RefCell<Upvalue>>`.
#[derive(Debug)]
pub enum Upvalue {
    Open { frame_offset: usize },
    Closed(VmValue),
}

pub type UpvalueHandle = Rc<RefCell<Upvalue>>;

/// A function value: a code address plus whatever upvalues its body
/// captures from enclosing scopes.
#[derive(Debug)]
pub struct Closure {
    pub code_address: usize,
    pub upvalues: Vec<UpvalueHandle>,
}

impl Closure {
    pub fn new(code_address: usize, upvalues: Vec<UpvalueHandle>) -> Self {
        Closure { code_address, upvalues }
    }
}

/// Execution state of a [`crate::vm::Coroutine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Queued to run, or currently running.
    Runnable,
    /// Waiting on an outstanding JSON-RPC call; not in the run queue.
    Suspended,
    /// Finished (returned, exited, or raised an uncaught exception).
    Finished,
}
