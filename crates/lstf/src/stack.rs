//! VM value stack and call-frame stack (C8).
//!
//! Two parallel growable structures per §3.7: a flat `values` stack and a
//! `frames` stack recording where each call's locals begin. A frame also
//! owns the closure it is executing (if any, for `upget`/`upset`) and a map
//! from stack offset to the upvalue that has captured it, so a second
//! `closure` instruction capturing the same local reuses the existing
//! [`Upvalue`] rather than creating a second one (the sharing invariant).

use std::collections::HashMap;
use std::rc::Rc;

use crate::status::VmStatus;
use crate::value::{Closure, Upvalue, UpvalueHandle, VmValue};

#[derive(Debug)]
pub struct StackFrame {
    /// Absolute index into `values` where this frame's locals begin.
    pub base: usize,
    /// Set by the `params` instruction.
    pub num_params: u8,
    /// `None` for the outermost frame of a coroutine (returning exits it).
    pub return_address: Option<usize>,
    pub closure: Option<Rc<Closure>>,
    /// Stack offsets (relative to `base`) captured by an open upvalue.
    tracked_upvalues: HashMap<i64, UpvalueHandle>,
}

#[derive(Debug, Default)]
pub struct VmStack {
    values: Vec<VmValue>,
    frames: Vec<StackFrame>,
}

impl VmStack {
    pub fn new() -> Self {
        VmStack::default()
    }

    pub fn depth(&self) -> usize {
        self.values.len()
    }

    pub fn push(&mut self, value: VmValue) -> VmStatus {
        self.values.push(value);
        VmStatus::Continue
    }

    pub fn pop(&mut self) -> Result<VmValue, VmStatus> {
        let base = self.frames.last().map(|f| f.base).unwrap_or(0);
        if self.values.len() <= base {
            return Err(VmStatus::InvalidStackOffset);
        }
        Ok(self.values.pop().expect("checked non-empty above"))
    }

    /// Absolute index for a signed offset relative to the current frame's
    /// base (or the stack base, for the outermost frame).
    fn absolute_index(&self, fp_offset: i64) -> Result<usize, VmStatus> {
        let base = self.frames.last().map(|f| f.base).unwrap_or(0) as i64;
        let idx = base + fp_offset;
        if idx < 0 || idx as usize >= self.values.len() {
            return Err(VmStatus::InvalidStackOffset);
        }
        Ok(idx as usize)
    }

    pub fn get(&self, fp_offset: i64) -> Result<&VmValue, VmStatus> {
        let idx = self.absolute_index(fp_offset)?;
        Ok(&self.values[idx])
    }

    pub fn set(&mut self, fp_offset: i64, value: VmValue) -> Result<(), VmStatus> {
        let idx = self.absolute_index(fp_offset)?;
        self.values[idx] = value;
        Ok(())
    }

    /// Pushes a new frame pointing past the last value on the stack, owning
    /// `closure` if the call was indirect through one.
    pub fn setup_frame(&mut self, return_address: Option<usize>, closure: Option<Rc<Closure>>) -> VmStatus {
        self.frames.push(StackFrame {
            base: self.values.len(),
            num_params: 0,
            return_address,
            closure,
            tracked_upvalues: HashMap::new(),
        });
        VmStatus::Continue
    }

    /// Pops the current frame. The caller (the `return` opcode handler) is
    /// responsible for having left exactly 0 or 1 values above the frame's
    /// declared parameters; any captured slots still open over this frame
    /// are closed (their value copied into the `Upvalue`) before the
    /// frame's locals are discarded.
    ///
    /// Implements the callee-cleans-args convention of §4.8: the caller
    /// pushed `num_params` argument values onto its own frame before the
    /// call, which `params` then duplicated into this frame's slots 0..n;
    /// tearing down pops this frame's copies, then reaches one level down
    /// to discard the caller's originals too, and finally hands the return
    /// value (if any) across that gap onto the caller's frame.
    pub fn teardown_frame(&mut self) -> Result<Option<usize>, VmStatus> {
        let frame = self.frames.pop().ok_or(VmStatus::FrameUnderflow)?;
        for (offset, upvalue) in frame.tracked_upvalues {
            let idx = (frame.base as i64 + offset) as usize;
            if let Some(value) = self.values.get(idx).cloned() {
                *upvalue.borrow_mut() = Upvalue::Closed(value);
            }
        }
        let n = frame.num_params as usize;
        let return_value = if self.values.len() > frame.base + n { self.values.pop() } else { None };
        self.values.truncate(frame.base);
        let cleaned = self.values.len().saturating_sub(n);
        self.values.truncate(cleaned);
        if let Some(value) = return_value {
            self.values.push(value);
        }
        Ok(frame.return_address)
    }

    pub fn current_frame(&self) -> Result<&StackFrame, VmStatus> {
        self.frames.last().ok_or(VmStatus::FrameUnderflow)
    }

    pub fn current_frame_mut(&mut self) -> Result<&mut StackFrame, VmStatus> {
        self.frames.last_mut().ok_or(VmStatus::FrameUnderflow)
    }

    pub fn set_params(&mut self, num_params: u8) -> Result<(), VmStatus> {
        self.current_frame_mut()?.num_params = num_params;
        Ok(())
    }

    /// Returns the open upvalue tracking `frame_offset` in the current
    /// frame, creating one if this is the first capture of that slot.
    pub fn get_or_track_upvalue(&mut self, frame_offset: i64) -> Result<UpvalueHandle, VmStatus> {
        let frame = self.current_frame_mut()?;
        if let Some(existing) = frame.tracked_upvalues.get(&frame_offset) {
            return Ok(existing.clone());
        }
        let handle: UpvalueHandle = Rc::new(std::cell::RefCell::new(Upvalue::Open { frame_offset: frame_offset as usize }));
        frame.tracked_upvalues.insert(frame_offset, handle.clone());
        Ok(handle)
    }

    pub fn upvalue(&self, id: u64) -> Result<UpvalueHandle, VmStatus> {
        let frame = self.frames.last().ok_or(VmStatus::FrameUnderflow)?;
        let closure = frame.closure.as_ref().ok_or(VmStatus::InvalidUpvalue)?;
        closure.upvalues.get(id as usize).cloned().ok_or(VmStatus::InvalidUpvalue)
    }

    /// Reads an upvalue's current value, resolving through the owning
    /// coroutine's stack if it is still open.
    pub fn read_upvalue(&self, handle: &UpvalueHandle) -> VmValue {
        match &*handle.borrow() {
            Upvalue::Closed(value) => value.clone(),
            Upvalue::Open { frame_offset } => self.values.get(*frame_offset).cloned().unwrap_or(VmValue::Null),
        }
    }

    pub fn write_upvalue(&mut self, handle: &UpvalueHandle, value: VmValue) {
        let frame_offset = match &*handle.borrow() {
            Upvalue::Open { frame_offset } => Some(*frame_offset),
            Upvalue::Closed(_) => None,
        };
        match frame_offset {
            Some(offset) => {
                if let Some(slot) = self.values.get_mut(offset) {
                    *slot = value;
                }
            }
            None => *handle.borrow_mut() = Upvalue::Closed(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_below_frame_base_is_invalid_stack_offset() {
        let mut stack = VmStack::new();
        stack.setup_frame(None, None);
        assert_eq!(stack.pop().unwrap_err(), VmStatus::InvalidStackOffset);
    }

    #[test]
    fn teardown_closes_tracked_upvalues() {
        let mut stack = VmStack::new();
        stack.setup_frame(None, None);
        stack.push(VmValue::Integer(7));
        let handle = stack.get_or_track_upvalue(0).unwrap();
        stack.teardown_frame().unwrap();
        match &*handle.borrow() {
            Upvalue::Closed(VmValue::Integer(7)) => {}
            other => panic!("expected closed upvalue with 7, got {other:?}"),
        }
    }

    #[test]
    fn repeated_capture_of_same_offset_shares_identity() {
        let mut stack = VmStack::new();
        stack.setup_frame(None, None);
        stack.push(VmValue::Integer(1));
        let a = stack.get_or_track_upvalue(0).unwrap();
        let b = stack.get_or_track_upvalue(0).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
