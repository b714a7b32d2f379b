//! Compiled programs.

use crate::value::ScriptError;

/// A single VM instruction.
///
/// The VM is a stack machine. Jump targets are absolute instruction indices;
/// symbol operands index the program's own symbol table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push `nil`.
    Nil,
    /// Push `true`.
    True,
    /// Push `false`.
    False,
    /// Push an integer immediate.
    Int(i64),
    /// Push a constant from the pool.
    Const(u32),
    /// Push a local variable.
    GetLocal(u16),
    /// Store the top of the stack into a local, leaving it on the stack.
    SetLocal(u16),
    /// Discard the top of the stack.
    Pop,
    /// Duplicate the top of the stack.
    Dup,
    /// Binary `+`.
    Add,
    /// Binary `-`.
    Sub,
    /// Binary `*`.
    Mul,
    /// Binary `/` (floor division for integers).
    Div,
    /// Binary `%` (sign follows the divisor).
    Mod,
    /// `==`.
    Eq,
    /// `!=`.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
    /// Unary minus.
    Neg,
    /// Logical not.
    Not,
    /// Unconditional jump.
    Jump(u32),
    /// Pop; jump if falsy.
    JumpIfFalse(u32),
    /// Pop; jump if truthy.
    JumpIfTrue(u32),
    /// Yield to the scheduler; pushes `nil` once resumed.
    Suspend,
    /// Pop a message and raise an error whose class is the given symbol.
    Raise(u32),
    /// Raise `NameError` for the undefined name in the given symbol.
    Undefined(u32),
    /// Finish the task with the top of the stack.
    Return,
}

/// An entry in a program's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// String literal.
    Str(String),
    /// Float literal.
    Float(f64),
}

/// Symbol table state of a program.
///
/// Freshly compiled programs refer to symbols interned in the compiler
/// context that produced them; resolution copies the names into the program
/// so it no longer depends on that context.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Symbols {
    Deferred { context: u64, ids: Vec<u32> },
    Resolved(Vec<String>),
}

impl Symbols {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Deferred { ids, .. } => ids.len(),
            Self::Resolved(names) => names.len(),
        }
    }
}

/// An executable program.
///
/// Produced by [`CompilerContext::load`](crate::CompilerContext::load) or by
/// decoding a bytecode image with [`bytecode::decode`](crate::bytecode::decode).
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub(crate) code: Vec<Op>,
    pub(crate) constants: Vec<Constant>,
    pub(crate) symbols: Symbols,
    pub(crate) nlocals: u16,
    /// Symbol index naming each local slot; `None` once stripped.
    pub(crate) local_names: Option<Vec<u32>>,
}

impl Program {
    /// Build a program that immediately raises `error` when run.
    ///
    /// Used in place of a bytecode image that failed to decode, so the
    /// failure surfaces as the task's error rather than a host error.
    #[must_use]
    pub fn raising(error: ScriptError) -> Self {
        Self {
            code: vec![Op::Const(0), Op::Raise(0), Op::Return],
            constants: vec![Constant::Str(error.message)],
            symbols: Symbols::Resolved(vec![error.class]),
            nlocals: 0,
            local_names: None,
        }
    }

    /// The instruction stream.
    #[must_use]
    pub fn code(&self) -> &[Op] {
        &self.code
    }

    /// The constant pool.
    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Number of local variable slots.
    #[must_use]
    pub fn nlocals(&self) -> u16 {
        self.nlocals
    }

    /// Whether the program's symbols have been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.symbols, Symbols::Resolved(_))
    }

    /// Id of the compiler context whose symbols this program still refers to.
    #[must_use]
    pub fn pending_context(&self) -> Option<u64> {
        match &self.symbols {
            Symbols::Deferred { context, .. } => Some(*context),
            Symbols::Resolved(_) => None,
        }
    }

    /// Name of the symbol at `index`, once resolved.
    #[must_use]
    pub fn symbol(&self, index: u32) -> Option<&str> {
        match &self.symbols {
            Symbols::Resolved(names) => names.get(index as usize).map(String::as_str),
            Symbols::Deferred { .. } => None,
        }
    }

    /// Resolved symbol names.
    #[must_use]
    pub fn symbols(&self) -> &[String] {
        match &self.symbols {
            Symbols::Resolved(names) => names,
            Symbols::Deferred { .. } => &[],
        }
    }

    /// Whether local variable names are still attached.
    #[must_use]
    pub fn has_local_names(&self) -> bool {
        self.local_names.is_some()
    }

    /// Names of the local slots, if present and resolved.
    #[must_use]
    pub fn local_names(&self) -> Option<Vec<&str>> {
        let names = self.local_names.as_ref()?;
        names.iter().map(|&sym| self.symbol(sym)).collect()
    }

    /// Drop local variable names. Only recompiling brings them back.
    pub fn strip_local_names(&mut self) {
        self.local_names = None;
    }
}
