//! Lowering of the statement tree to stack-machine instructions.

use std::collections::HashMap;

use super::parser::{BinOp, Expr};
use super::{CompileError, Pos, SymbolTable};
use crate::program::{Constant, Op};

#[derive(Debug)]
pub(crate) struct Generated {
    pub code: Vec<Op>,
    pub constants: Vec<Constant>,
    /// Context symbol id for each program symbol index.
    pub symbol_ids: Vec<u32>,
    pub nlocals: u16,
    /// Program symbol index naming each local slot.
    pub local_names: Vec<u32>,
    pub warnings: Vec<String>,
}

pub(crate) fn generate(body: &[Expr], symbols: &mut SymbolTable) -> Result<Generated, CompileError> {
    let mut generator = Codegen {
        symbols,
        code: Vec::new(),
        constants: Vec::new(),
        symbol_ids: Vec::new(),
        symbol_slots: HashMap::new(),
        constant_slots: HashMap::new(),
        locals: HashMap::new(),
        local_names: Vec::new(),
        local_read: Vec::new(),
    };
    generator.block(body)?;
    generator.emit(Op::Return);

    let warnings = generator
        .local_names
        .iter()
        .zip(&generator.local_read)
        .filter(|(_, read)| !**read)
        .filter_map(|(&sym, _)| generator.symbol_name(sym))
        .filter(|name| !name.starts_with('_'))
        .map(|name| format!("assigned but unused variable - {name}"))
        .collect();

    // `declare` keeps the slot count within u16.
    let nlocals = u16::try_from(generator.local_names.len()).unwrap_or(u16::MAX);
    Ok(Generated {
        nlocals,
        code: generator.code,
        constants: generator.constants,
        symbol_ids: generator.symbol_ids,
        local_names: generator.local_names,
        warnings,
    })
}

/// Constant pool key. Floats compare by bit pattern so `0.0` and `-0.0`
/// get separate entries.
#[derive(PartialEq, Eq, Hash)]
enum ConstKey {
    Str(String),
    Float(u64),
}

impl From<&Constant> for ConstKey {
    fn from(constant: &Constant) -> Self {
        match constant {
            Constant::Str(s) => Self::Str(s.clone()),
            Constant::Float(x) => Self::Float(x.to_bits()),
        }
    }
}

struct Codegen<'a> {
    symbols: &'a mut SymbolTable,
    code: Vec<Op>,
    constants: Vec<Constant>,
    symbol_ids: Vec<u32>,
    symbol_slots: HashMap<u32, u32>,
    constant_slots: HashMap<ConstKey, u32>,
    locals: HashMap<String, u16>,
    local_names: Vec<u32>,
    local_read: Vec<bool>,
}

impl Codegen<'_> {
    fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Point the jump at `at` to the next instruction.
    fn patch(&mut self, at: usize) {
        let target = self.here();
        match &mut self.code[at] {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) => *t = target,
            _ => {}
        }
    }

    fn symbol(&mut self, name: &str) -> u32 {
        let id = self.symbols.intern(name);
        if let Some(&slot) = self.symbol_slots.get(&id) {
            return slot;
        }
        let slot = self.symbol_ids.len() as u32;
        self.symbol_ids.push(id);
        self.symbol_slots.insert(id, slot);
        slot
    }

    fn symbol_name(&self, slot: u32) -> Option<&str> {
        let id = *self.symbol_ids.get(slot as usize)?;
        self.symbols.name(id)
    }

    fn constant(&mut self, constant: Constant) -> u32 {
        let key = ConstKey::from(&constant);
        if let Some(&index) = self.constant_slots.get(&key) {
            return index;
        }
        let index = self.constants.len() as u32;
        self.constants.push(constant);
        self.constant_slots.insert(key, index);
        index
    }

    /// Slot for `name`, allocating one on first assignment.
    ///
    /// At most `u16::MAX` slots exist, so the count itself fits in a `u16`.
    fn declare(&mut self, name: &str, pos: Pos) -> Result<u16, CompileError> {
        if let Some(&slot) = self.locals.get(name) {
            return Ok(slot);
        }
        let slot = u16::try_from(self.local_names.len())
            .ok()
            .filter(|&slot| slot < u16::MAX)
            .ok_or_else(|| {
                CompileError::at(
                    pos,
                    format!("too many local variables (limit {})", u16::MAX),
                )
            })?;
        let sym = self.symbol(name);
        self.locals.insert(name.to_string(), slot);
        self.local_names.push(sym);
        self.local_read.push(false);
        Ok(slot)
    }

    /// A statement list leaves exactly one value: its last statement's.
    fn block(&mut self, body: &[Expr]) -> Result<(), CompileError> {
        if body.is_empty() {
            self.emit(Op::Nil);
            return Ok(());
        }
        for (i, expr) in body.iter().enumerate() {
            if i > 0 {
                self.emit(Op::Pop);
            }
            self.expr(expr)?;
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Nil => {
                self.emit(Op::Nil);
            }
            Expr::Bool(true) => {
                self.emit(Op::True);
            }
            Expr::Bool(false) => {
                self.emit(Op::False);
            }
            Expr::Int(n) => {
                self.emit(Op::Int(*n));
            }
            Expr::Float(x) => {
                let index = self.constant(Constant::Float(*x));
                self.emit(Op::Const(index));
            }
            Expr::Str(s) => {
                let index = self.constant(Constant::Str(s.clone()));
                self.emit(Op::Const(index));
            }
            Expr::Var(name) => match self.locals.get(name) {
                Some(&slot) => {
                    self.local_read[slot as usize] = true;
                    self.emit(Op::GetLocal(slot));
                }
                None => {
                    let sym = self.symbol(name);
                    self.emit(Op::Undefined(sym));
                }
            },
            Expr::Assign { name, value, pos } => {
                // The variable exists (as nil) from this point on, so
                // `x = x` reads nil rather than failing.
                let slot = self.declare(name, *pos)?;
                self.expr(value)?;
                self.emit(Op::SetLocal(slot));
            }
            Expr::Binary(op, lhs, rhs) => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.emit(match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    BinOp::Eq => Op::Eq,
                    BinOp::Ne => Op::Ne,
                    BinOp::Lt => Op::Lt,
                    BinOp::Le => Op::Le,
                    BinOp::Gt => Op::Gt,
                    BinOp::Ge => Op::Ge,
                });
            }
            Expr::Neg(inner) => {
                self.expr(inner)?;
                self.emit(Op::Neg);
            }
            Expr::Not(inner) => {
                self.expr(inner)?;
                self.emit(Op::Not);
            }
            Expr::And(lhs, rhs) => {
                self.expr(lhs)?;
                self.emit(Op::Dup);
                let skip = self.emit(Op::JumpIfFalse(0));
                self.emit(Op::Pop);
                self.expr(rhs)?;
                self.patch(skip);
            }
            Expr::Or(lhs, rhs) => {
                self.expr(lhs)?;
                self.emit(Op::Dup);
                let skip = self.emit(Op::JumpIfTrue(0));
                self.emit(Op::Pop);
                self.expr(rhs)?;
                self.patch(skip);
            }
            Expr::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr(cond)?;
                let to_else = self.emit(Op::JumpIfFalse(0));
                self.block(then_body)?;
                let to_end = self.emit(Op::Jump(0));
                self.patch(to_else);
                match else_body {
                    Some(body) => self.block(body)?,
                    None => {
                        self.emit(Op::Nil);
                    }
                }
                self.patch(to_end);
            }
            Expr::While { cond, body } => {
                let top = self.here();
                self.expr(cond)?;
                let exit = self.emit(Op::JumpIfFalse(0));
                self.block(body)?;
                self.emit(Op::Pop);
                self.emit(Op::Jump(top));
                self.patch(exit);
                self.emit(Op::Nil);
            }
            Expr::Raise { class, message } => {
                match (class, message) {
                    (_, Some(message)) => self.expr(message)?,
                    (None, None) => {
                        let index = self.constant(Constant::Str("unhandled exception".to_string()));
                        self.emit(Op::Const(index));
                    }
                    (Some(_), None) => {
                        self.emit(Op::Nil);
                    }
                }
                let class = self.symbol(class.as_deref().unwrap_or("RuntimeError"));
                self.emit(Op::Raise(class));
            }
            Expr::Suspend => {
                self.emit(Op::Suspend);
            }
        }
        Ok(())
    }
}
