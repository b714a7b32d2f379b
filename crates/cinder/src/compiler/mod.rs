//! Compiler front-end: script text to [`Program`].
//!
//! A [`CompilerContext`] owns the symbol table that freshly compiled programs
//! refer to. Programs leave [`CompilerContext::load`] with their symbols
//! still deferred; [`CompilerContext::resolve_symbols`] copies the names into
//! the program so it can outlive the context.

mod codegen;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::program::{Program, Symbols};

/// Source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pos {
    pub line: u32,
    pub column: u32,
}

/// A syntax or semantic error found while compiling script text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{filename}:{line}:{column}: {message}")]
pub struct CompileError {
    /// Name the script was compiled under.
    pub filename: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
    /// What went wrong.
    pub message: String,
}

impl CompileError {
    pub(crate) fn at(pos: Pos, message: impl Into<String>) -> Self {
        Self {
            filename: String::new(),
            line: pos.line,
            column: pos.column,
            message: message.into(),
        }
    }

    fn in_file(mut self, filename: &str) -> Self {
        self.filename = filename.to_string();
        self
    }
}

/// Compiler configuration persisted by a sandbox across recompilations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// File name reported in compile errors.
    pub filename: String,
    /// Maximum expression nesting depth accepted by the parser.
    pub max_depth: usize,
    /// Warnings produced by the most recent compile.
    pub warnings: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            filename: "(sandbox)".to_string(),
            max_depth: 64,
            warnings: Vec::new(),
        }
    }
}

impl CompilerOptions {
    /// Set the file name reported in compile errors.
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Set the parser nesting limit.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// Per-call compile options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Remove local variable names from the compiled program.
    pub strip_locals: bool,
}

impl CompileOptions {
    /// Request that local variable names be stripped.
    #[must_use]
    pub fn with_strip_locals(mut self, strip_locals: bool) -> Self {
        self.strip_locals = strip_locals;
        self
    }
}

/// Interned names owned by a compiler context.
#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl SymbolTable {
    pub(crate) fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub(crate) fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.names.len()
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A compiler context.
///
/// Each context has a process-unique id; programs it compiles remember that
/// id until their symbols are resolved.
pub struct CompilerContext {
    id: u64,
    options: CompilerOptions,
    symbols: SymbolTable,
}

impl CompilerContext {
    /// Create a context carrying `options`.
    #[must_use]
    pub fn new(options: CompilerOptions) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, filename = %options.filename, "compiler context created");
        Self {
            id,
            options,
            symbols: SymbolTable::default(),
        }
    }

    /// This context's id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current options, including the warnings of the last compile.
    #[must_use]
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Compile script bytes into a program.
    ///
    /// The returned program's symbols are deferred to this context. Warnings
    /// replace those of the previous compile.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] if the bytes are not UTF-8 or do not parse.
    pub fn load(&mut self, source: &[u8]) -> Result<Program, CompileError> {
        self.options.warnings.clear();
        match self.compile(source) {
            Ok((program, warnings)) => {
                tracing::debug!(
                    context = self.id,
                    ops = program.code.len(),
                    warnings = warnings.len(),
                    "compiled script"
                );
                self.options.warnings = warnings;
                Ok(program)
            }
            Err(err) => {
                let err = err.in_file(&self.options.filename);
                tracing::debug!(context = self.id, error = %err, "compile failed");
                Err(err)
            }
        }
    }

    fn compile(&mut self, source: &[u8]) -> Result<(Program, Vec<String>), CompileError> {
        let text = std::str::from_utf8(source).map_err(|e| {
            let prefix = &source[..e.valid_up_to()];
            let line = prefix.iter().filter(|&&b| b == b'\n').count() as u32 + 1;
            let column = prefix.iter().rev().take_while(|&&b| b != b'\n').count() as u32 + 1;
            CompileError::at(Pos { line, column }, "invalid UTF-8 in script")
        })?;
        let tokens = lexer::tokenize(text)?;
        let body = parser::parse(tokens, self.options.max_depth)?;
        let generated = codegen::generate(&body, &mut self.symbols)?;
        let program = Program {
            code: generated.code,
            constants: generated.constants,
            symbols: Symbols::Deferred {
                context: self.id,
                ids: generated.symbol_ids,
            },
            nlocals: generated.nlocals,
            local_names: Some(generated.local_names),
        };
        Ok((program, generated.warnings))
    }

    /// Remove local variable names from `program`.
    pub fn strip_locals(&self, program: &mut Program) {
        program.strip_local_names();
    }

    /// Copy the names of `program`'s deferred symbols into the program.
    ///
    /// Already resolved programs are left alone.
    ///
    /// # Errors
    ///
    /// [`Error::ContextMismatch`] if the program was compiled by another
    /// context; [`Error::UnresolvedSymbols`] if it refers to a symbol this
    /// context does not hold.
    pub fn resolve_symbols(&self, program: &mut Program) -> Result<(), Error> {
        let names = match &program.symbols {
            Symbols::Resolved(_) => return Ok(()),
            Symbols::Deferred { context, .. } if *context != self.id => {
                return Err(Error::ContextMismatch {
                    expected: *context,
                    found: self.id,
                });
            }
            Symbols::Deferred { ids, .. } => ids
                .iter()
                .map(|&id| {
                    self.symbols
                        .name(id)
                        .map(str::to_string)
                        .ok_or(Error::UnresolvedSymbols)
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        program.symbols = Symbols::Resolved(names);
        Ok(())
    }
}

impl Drop for CompilerContext {
    fn drop(&mut self) {
        tracing::debug!(context = self.id, "compiler context dropped");
    }
}

impl fmt::Debug for CompilerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerContext")
            .field("id", &self.id)
            .field("filename", &self.options.filename)
            .field("symbols", &self.symbols.len())
            .finish_non_exhaustive()
    }
}
