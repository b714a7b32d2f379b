//! Binary bytecode images.
//!
//! An image is a fixed header followed by a body:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 4    | magic `CNDR` |
//! | 4      | 1    | format version |
//! | 5      | 1    | flags (bit 0: local names present) |
//! | 6      | 2    | reserved, zero |
//! | 8      | 4    | total image length, little-endian |
//! | 12     | 32   | SHA-256 of the body |
//!
//! The body holds the local slot count, the constant pool, the symbol table,
//! the optional local names and the instruction stream. [`decode`] checks the
//! digest and every operand, so a decoded program can only fail at run time
//! with a script-level error.

use sha2::{Digest, Sha256};

use crate::program::{Constant, Op, Program, Symbols};

/// Image magic.
pub const MAGIC: [u8; 4] = *b"CNDR";

/// Current image format version.
pub const VERSION: u8 = 1;

/// Length of the fixed header.
pub const HEADER_LEN: usize = 44;

const FLAG_LOCAL_NAMES: u8 = 0b0000_0001;

const TAG_STR: u8 = 0;
const TAG_FLOAT: u8 = 1;

/// Errors from encoding or decoding a bytecode image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BytecodeError {
    /// The image does not start with the expected magic.
    #[error("bad magic {0}, not a cinder bytecode image")]
    BadMagic(String),

    /// The image was produced by an incompatible format version.
    #[error("unsupported bytecode version {0} (expected {VERSION})")]
    UnsupportedVersion(u8),

    /// The image ends before a field it declares.
    #[error("truncated image: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// The body does not hash to the digest in the header.
    #[error("checksum mismatch: header says {expected}, body hashes to {actual}")]
    ChecksumMismatch {
        /// Hex digest from the header.
        expected: String,
        /// Hex digest of the body.
        actual: String,
    },

    /// Unknown opcode byte.
    #[error("invalid opcode 0x{byte:02x} at body offset {offset}")]
    InvalidOpcode {
        /// The offending byte.
        byte: u8,
        /// Offset within the body.
        offset: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Unknown constant pool tag.
    #[error("invalid constant tag {0}")]
    InvalidConstTag(u8),

    /// A jump leaves the instruction stream.
    #[error("jump target {target} out of range (program has {len} instructions)")]
    JumpOutOfRange {
        /// Jump target.
        target: u32,
        /// Instruction count.
        len: usize,
    },

    /// A constant operand indexes past the pool.
    #[error("constant index {0} out of range")]
    ConstantOutOfRange(u32),

    /// A symbol operand indexes past the symbol table.
    #[error("symbol index {0} out of range")]
    SymbolOutOfRange(u32),

    /// A local operand indexes past the declared slots.
    #[error("local slot {0} out of range")]
    LocalOutOfRange(u16),

    /// Bytes remain after the instruction stream.
    #[error("{0} trailing bytes after instruction stream")]
    TrailingData(usize),

    /// The program still refers to compiler-context symbols.
    #[error("program symbols must be resolved before encoding")]
    Unresolved,

    /// A section does not fit the format's length fields.
    #[error("program too large to encode")]
    TooLarge,
}

mod opcode {
    pub const NIL: u8 = 0x00;
    pub const TRUE: u8 = 0x01;
    pub const FALSE: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const CONST: u8 = 0x04;
    pub const GET_LOCAL: u8 = 0x05;
    pub const SET_LOCAL: u8 = 0x06;
    pub const POP: u8 = 0x07;
    pub const DUP: u8 = 0x08;
    pub const ADD: u8 = 0x10;
    pub const SUB: u8 = 0x11;
    pub const MUL: u8 = 0x12;
    pub const DIV: u8 = 0x13;
    pub const MOD: u8 = 0x14;
    pub const EQ: u8 = 0x15;
    pub const NE: u8 = 0x16;
    pub const LT: u8 = 0x17;
    pub const LE: u8 = 0x18;
    pub const GT: u8 = 0x19;
    pub const GE: u8 = 0x1a;
    pub const NEG: u8 = 0x1b;
    pub const NOT: u8 = 0x1c;
    pub const JUMP: u8 = 0x20;
    pub const JUMP_IF_FALSE: u8 = 0x21;
    pub const JUMP_IF_TRUE: u8 = 0x22;
    pub const SUSPEND: u8 = 0x30;
    pub const RAISE: u8 = 0x31;
    pub const UNDEFINED: u8 = 0x32;
    pub const RETURN: u8 = 0x33;
}

/// Encode a resolved program as a bytecode image.
///
/// # Errors
///
/// [`BytecodeError::Unresolved`] if the program's symbols are still
/// deferred to a compiler context.
pub fn encode(program: &Program) -> Result<Vec<u8>, BytecodeError> {
    let Symbols::Resolved(symbols) = &program.symbols else {
        return Err(BytecodeError::Unresolved);
    };

    let mut body = Vec::new();
    body.extend_from_slice(&program.nlocals.to_le_bytes());

    put_len(&mut body, program.constants.len())?;
    for constant in &program.constants {
        match constant {
            Constant::Str(s) => {
                body.push(TAG_STR);
                put_bytes(&mut body, s.as_bytes())?;
            }
            Constant::Float(x) => {
                body.push(TAG_FLOAT);
                body.extend_from_slice(&x.to_bits().to_le_bytes());
            }
        }
    }

    put_len(&mut body, symbols.len())?;
    for name in symbols {
        put_bytes(&mut body, name.as_bytes())?;
    }

    let mut flags = 0;
    if let Some(names) = &program.local_names {
        flags |= FLAG_LOCAL_NAMES;
        for sym in names {
            body.extend_from_slice(&sym.to_le_bytes());
        }
    }

    put_len(&mut body, program.code.len())?;
    for op in &program.code {
        encode_op(&mut body, *op);
    }

    let total = u32::try_from(HEADER_LEN + body.len()).map_err(|_| BytecodeError::TooLarge)?;
    let digest: [u8; 32] = Sha256::digest(&body).into();

    let mut image = Vec::with_capacity(HEADER_LEN + body.len());
    image.extend_from_slice(&MAGIC);
    image.push(VERSION);
    image.push(flags);
    image.extend_from_slice(&[0, 0]);
    image.extend_from_slice(&total.to_le_bytes());
    image.extend_from_slice(&digest);
    image.extend_from_slice(&body);
    Ok(image)
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), BytecodeError> {
    let len = u32::try_from(len).map_err(|_| BytecodeError::TooLarge)?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), BytecodeError> {
    put_len(out, bytes.len())?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn encode_op(out: &mut Vec<u8>, op: Op) {
    out.push(opcode_of(op));
    match op {
        Op::Int(n) => out.extend_from_slice(&n.to_le_bytes()),
        Op::GetLocal(slot) | Op::SetLocal(slot) => out.extend_from_slice(&slot.to_le_bytes()),
        Op::Const(operand)
        | Op::Jump(operand)
        | Op::JumpIfFalse(operand)
        | Op::JumpIfTrue(operand)
        | Op::Raise(operand)
        | Op::Undefined(operand) => out.extend_from_slice(&operand.to_le_bytes()),
        _ => {}
    }
}

fn opcode_of(op: Op) -> u8 {
    match op {
        Op::Nil => opcode::NIL,
        Op::True => opcode::TRUE,
        Op::False => opcode::FALSE,
        Op::Int(_) => opcode::INT,
        Op::Const(_) => opcode::CONST,
        Op::GetLocal(_) => opcode::GET_LOCAL,
        Op::SetLocal(_) => opcode::SET_LOCAL,
        Op::Pop => opcode::POP,
        Op::Dup => opcode::DUP,
        Op::Add => opcode::ADD,
        Op::Sub => opcode::SUB,
        Op::Mul => opcode::MUL,
        Op::Div => opcode::DIV,
        Op::Mod => opcode::MOD,
        Op::Eq => opcode::EQ,
        Op::Ne => opcode::NE,
        Op::Lt => opcode::LT,
        Op::Le => opcode::LE,
        Op::Gt => opcode::GT,
        Op::Ge => opcode::GE,
        Op::Neg => opcode::NEG,
        Op::Not => opcode::NOT,
        Op::Jump(_) => opcode::JUMP,
        Op::JumpIfFalse(_) => opcode::JUMP_IF_FALSE,
        Op::JumpIfTrue(_) => opcode::JUMP_IF_TRUE,
        Op::Suspend => opcode::SUSPEND,
        Op::Raise(_) => opcode::RAISE,
        Op::Undefined(_) => opcode::UNDEFINED,
        Op::Return => opcode::RETURN,
    }
}

/// Total length declared by an image header.
///
/// # Errors
///
/// Fails if `data` is shorter than the header or does not carry the magic.
pub fn image_len(data: &[u8]) -> Result<usize, BytecodeError> {
    let header = header(data)?;
    Ok(header.total)
}

/// Hex digest recorded in an image header.
///
/// # Errors
///
/// Fails if `data` is shorter than the header or does not carry the magic.
pub fn digest_hex(data: &[u8]) -> Result<String, BytecodeError> {
    header(data)?;
    Ok(hex::encode(&data[12..HEADER_LEN]))
}

struct Header {
    flags: u8,
    total: usize,
}

fn header(data: &[u8]) -> Result<Header, BytecodeError> {
    if data.len() < HEADER_LEN {
        // Report a bad magic first if we have enough to see it.
        if data.len() >= MAGIC.len() && data[..MAGIC.len()] != MAGIC {
            return Err(BytecodeError::BadMagic(hex::encode(&data[..MAGIC.len()])));
        }
        return Err(BytecodeError::Truncated {
            needed: HEADER_LEN,
            available: data.len(),
        });
    }
    if data[..4] != MAGIC {
        return Err(BytecodeError::BadMagic(hex::encode(&data[..4])));
    }
    if data[4] != VERSION {
        return Err(BytecodeError::UnsupportedVersion(data[4]));
    }
    let total = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
    Ok(Header {
        flags: data[5],
        total,
    })
}

/// Decode and validate a bytecode image.
///
/// Bytes past the declared total length are ignored, so an image may be
/// read from a larger buffer.
///
/// # Errors
///
/// Returns a [`BytecodeError`] describing the first problem found.
pub fn decode(data: &[u8]) -> Result<Program, BytecodeError> {
    let header = header(data)?;
    if header.total < HEADER_LEN || header.total > data.len() {
        return Err(BytecodeError::Truncated {
            needed: header.total.max(HEADER_LEN),
            available: data.len(),
        });
    }

    let body = &data[HEADER_LEN..header.total];
    let actual: [u8; 32] = Sha256::digest(body).into();
    if actual[..] != data[12..HEADER_LEN] {
        return Err(BytecodeError::ChecksumMismatch {
            expected: hex::encode(&data[12..HEADER_LEN]),
            actual: hex::encode(actual),
        });
    }

    let mut reader = Reader { data: body, pos: 0 };
    let nlocals = reader.u16()?;

    let nconsts = reader.u32()?;
    let mut constants = Vec::new();
    for _ in 0..nconsts {
        constants.push(match reader.u8()? {
            TAG_STR => Constant::Str(reader.string()?),
            TAG_FLOAT => Constant::Float(f64::from_bits(reader.u64()?)),
            tag => return Err(BytecodeError::InvalidConstTag(tag)),
        });
    }

    let nsyms = reader.u32()?;
    let mut symbols = Vec::new();
    for _ in 0..nsyms {
        symbols.push(reader.string()?);
    }

    let local_names = if header.flags & FLAG_LOCAL_NAMES != 0 {
        let mut names = Vec::with_capacity(usize::from(nlocals));
        for _ in 0..nlocals {
            let sym = reader.u32()?;
            if sym as usize >= symbols.len() {
                return Err(BytecodeError::SymbolOutOfRange(sym));
            }
            names.push(sym);
        }
        Some(names)
    } else {
        None
    };

    let nops = reader.u32()?;
    let mut code = Vec::new();
    for _ in 0..nops {
        code.push(reader.op()?);
    }
    if reader.pos != body.len() {
        return Err(BytecodeError::TrailingData(body.len() - reader.pos));
    }

    for op in &code {
        validate(*op, code.len(), constants.len(), symbols.len(), nlocals)?;
    }

    Ok(Program {
        code,
        constants,
        symbols: Symbols::Resolved(symbols),
        nlocals,
        local_names,
    })
}

fn validate(op: Op, len: usize, nconsts: usize, nsyms: usize, nlocals: u16) -> Result<(), BytecodeError> {
    match op {
        Op::Jump(target) | Op::JumpIfFalse(target) | Op::JumpIfTrue(target)
            if target as usize > len =>
        {
            Err(BytecodeError::JumpOutOfRange { target, len })
        }
        Op::Const(i) if i as usize >= nconsts => Err(BytecodeError::ConstantOutOfRange(i)),
        Op::Raise(sym) | Op::Undefined(sym) if sym as usize >= nsyms => {
            Err(BytecodeError::SymbolOutOfRange(sym))
        }
        Op::GetLocal(slot) | Op::SetLocal(slot) if slot >= nlocals => {
            Err(BytecodeError::LocalOutOfRange(slot))
        }
        _ => Ok(()),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BytecodeError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(BytecodeError::Truncated {
                needed: HEADER_LEN + self.pos.saturating_add(n),
                available: HEADER_LEN + self.data.len(),
            });
        };
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BytecodeError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BytecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BytecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, BytecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, BytecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, BytecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BytecodeError::InvalidUtf8)
    }

    fn op(&mut self) -> Result<Op, BytecodeError> {
        let offset = self.pos;
        let byte = self.u8()?;
        Ok(match byte {
            opcode::NIL => Op::Nil,
            opcode::TRUE => Op::True,
            opcode::FALSE => Op::False,
            opcode::INT => Op::Int(i64::from_le_bytes(self.array()?)),
            opcode::CONST => Op::Const(self.u32()?),
            opcode::GET_LOCAL => Op::GetLocal(self.u16()?),
            opcode::SET_LOCAL => Op::SetLocal(self.u16()?),
            opcode::POP => Op::Pop,
            opcode::DUP => Op::Dup,
            opcode::ADD => Op::Add,
            opcode::SUB => Op::Sub,
            opcode::MUL => Op::Mul,
            opcode::DIV => Op::Div,
            opcode::MOD => Op::Mod,
            opcode::EQ => Op::Eq,
            opcode::NE => Op::Ne,
            opcode::LT => Op::Lt,
            opcode::LE => Op::Le,
            opcode::GT => Op::Gt,
            opcode::GE => Op::Ge,
            opcode::NEG => Op::Neg,
            opcode::NOT => Op::Not,
            opcode::JUMP => Op::Jump(self.u32()?),
            opcode::JUMP_IF_FALSE => Op::JumpIfFalse(self.u32()?),
            opcode::JUMP_IF_TRUE => Op::JumpIfTrue(self.u32()?),
            opcode::SUSPEND => Op::Suspend,
            opcode::RAISE => Op::Raise(self.u32()?),
            opcode::UNDEFINED => Op::Undefined(self.u32()?),
            opcode::RETURN => Op::Return,
            byte => return Err(BytecodeError::InvalidOpcode { byte, offset }),
        })
    }
}
