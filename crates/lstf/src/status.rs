//! VM status and loader error taxonomy.
//!
//! Every non-[`VmStatus::Continue`] value ends execution of the coroutine
//! that produced it; whether it also ends the whole [`crate::vm::Vm`] is
//! answered by [`VmStatus::is_fatal_for_vm`].

use thiserror::Error;

/// Outcome of executing a single opcode, or of a whole `run` loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmStatus {
    /// No error; keep running.
    #[error("continue")]
    Continue,
    /// `exit` was executed.
    #[error("exited")]
    Exited,
    /// Hit a breakpoint in debug mode.
    #[error("hit breakpoint")]
    HitBreakpoint,

    #[error("invalid stack offset")]
    InvalidStackOffset,
    #[error("frame underflow")]
    FrameUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("invalid push: no active frame")]
    InvalidPush,
    #[error("invalid return: no frame to tear down")]
    InvalidReturn,
    #[error("invalid parameter count")]
    InvalidParams,

    #[error("invalid operand type")]
    InvalidOperandType,

    #[error("invalid code offset")]
    InvalidCodeOffset,
    #[error("invalid data offset")]
    InvalidDataOffset,
    #[error("invalid expression")]
    InvalidExpression,
    #[error("invalid member access")]
    InvalidMemberAccess,
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error("invalid upvalue")]
    InvalidUpvalue,
    #[error("invalid vmcall code")]
    InvalidVmCall,
    #[error("invalid instruction")]
    InvalidInstruction,

    #[error("already connected to a language server")]
    AlreadyConnected,
    #[error("not connected to a language server")]
    NotConnected,
    #[error("could not connect to language server")]
    CouldNotConnect,
    #[error("language server initialize failed")]
    InitializeFailed,
    #[error("could not communicate with language server")]
    CouldNotCommunicate,

    #[error("assertion failed")]
    AssertionFailed,
}

impl VmStatus {
    /// Whether this status ends the coroutine that produced it.
    ///
    /// Every status other than [`VmStatus::Continue`] is fatal for the
    /// coroutine that raised it (spec.md §7).
    pub fn is_fatal_for_coroutine(self) -> bool {
        self != VmStatus::Continue
    }

    /// Whether this status should also stop the whole VM.
    ///
    /// `Exited`, `HitBreakpoint`, and `AssertionFailed` (a user-raised
    /// exception) are fatal only to the coroutine that raised them; every
    /// other non-continuable status is fatal for the entire VM.
    pub fn is_fatal_for_vm(self) -> bool {
        !matches!(
            self,
            VmStatus::Continue | VmStatus::Exited | VmStatus::HitBreakpoint | VmStatus::AssertionFailed
        )
    }
}

/// Errors surfaced by [`crate::loader`] when parsing a binary program.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid magic header")]
    InvalidMagic,
    #[error("section name exceeds 128 bytes")]
    TooLongSectionName,
    #[error("unknown section name `{0}`")]
    InvalidSectionName(String),
    #[error("section declared with size zero")]
    ZeroSectionSize,
    #[error("entry point offset is out of bounds of the code section")]
    InvalidEntryPoint,
    #[error("malformed debug info section")]
    InvalidDebugInfo,
    #[error("read past end of input")]
    Read,
    #[error("section size does not match available input")]
    InvalidSectionSize,
    #[error("allocation failure")]
    OutOfMemory,
    #[error("program has no code section")]
    NoCodeSection,
}

/// Errors surfaced by [`crate::serialize`] when writing a binary program.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("program has no `main` function, or `main` is empty")]
    MissingMain,
    #[error("function `{0}` contains an unresolved jump")]
    UnresolvedJump(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced while lowering IR to bytecode ([`crate::assembler`]).
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("phi instruction arguments disagree on frame offset")]
    PhiFrameOffsetMismatch,
    #[error("alloc-with-initializer does not immediately follow its initializer")]
    MisalignedInitializer,
    #[error("branch instruction is not the last instruction of its block")]
    MisplacedBranch,
    #[error("function `{0}` has no entry point")]
    EmptyFunction(String),
}

/// Errors surfaced while parsing JSON literal text.
#[derive(Debug, Error, PartialEq)]
pub enum JsonError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected character `{0}` at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid number literal")]
    InvalidNumber,
    #[error("invalid escape sequence")]
    InvalidEscape,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("trailing characters after JSON value")]
    TrailingCharacters,
}
