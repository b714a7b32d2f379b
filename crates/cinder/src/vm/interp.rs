//! Stack-machine interpreter.
//!
//! Runs one scheduler slice of a task: at most `budget` instructions, or
//! until the task suspends, finishes or raises.

use std::cmp::Ordering;

use super::interrupt::Interrupt;
use super::task::ExecContext;
use crate::program::{Constant, Op, Program};
use crate::value::{ScriptError, Value};

/// Instructions between interrupt checks.
const INTERRUPT_CHECK_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub budget: u64,
    pub max_stack_depth: usize,
    pub max_string_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SliceOutcome {
    Suspended,
    Finished(Value),
    Raised(ScriptError),
    /// The instruction budget ran out; the task stays runnable.
    Preempted,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Slice {
    pub outcome: SliceOutcome,
    pub executed: u64,
}

enum Control {
    Continue,
    Suspend,
    Finish(Value),
}

pub(crate) fn run(program: &Program, ctx: &mut ExecContext, limits: Limits, interrupt: &Interrupt) -> Slice {
    let mut machine = Machine {
        program,
        ctx,
        limits,
    };
    let mut executed = 0;
    let outcome = loop {
        if executed % INTERRUPT_CHECK_INTERVAL == 0 && interrupt.take() {
            break SliceOutcome::Raised(ScriptError::new("Interrupt", "interrupted"));
        }
        if executed >= limits.budget.max(1) {
            break SliceOutcome::Preempted;
        }
        executed += 1;
        match machine.step() {
            Ok(Control::Continue) => {}
            Ok(Control::Suspend) => break SliceOutcome::Suspended,
            Ok(Control::Finish(value)) => break SliceOutcome::Finished(value),
            Err(err) => break SliceOutcome::Raised(err),
        }
    };
    Slice { outcome, executed }
}

fn vm_error(message: impl Into<String>) -> ScriptError {
    ScriptError::new("VMError", message)
}

fn integer_overflow() -> ScriptError {
    ScriptError::new("RangeError", "integer overflow")
}

fn no_method(method: &str, receiver: &Value) -> ScriptError {
    let receiver = match receiver {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("an instance of {}", other.class_name()),
    };
    ScriptError::new("NoMethodError", format!("undefined method '{method}' for {receiver}"))
}

fn not_coercible(lhs: &Value, rhs: &Value) -> ScriptError {
    ScriptError::new(
        "TypeError",
        format!("{} can't be coerced into {}", rhs.class_name(), lhs.class_name()),
    )
}

struct Machine<'a> {
    program: &'a Program,
    ctx: &'a mut ExecContext,
    limits: Limits,
}

impl Machine<'_> {
    fn push(&mut self, value: Value) -> Result<(), ScriptError> {
        if self.ctx.stack.len() >= self.limits.max_stack_depth {
            return Err(ScriptError::new("SystemStackError", "stack level too deep"));
        }
        self.ctx.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, ScriptError> {
        self.ctx
            .stack
            .pop()
            .ok_or_else(|| vm_error("stack underflow"))
    }

    fn top(&self) -> Result<&Value, ScriptError> {
        self.ctx.stack.last().ok_or_else(|| vm_error("stack underflow"))
    }

    fn symbol(&self, index: u32) -> Result<&str, ScriptError> {
        self.program
            .symbol(index)
            .ok_or_else(|| vm_error(format!("symbol {index} out of range")))
    }

    fn jump(&mut self, target: u32) -> Result<(), ScriptError> {
        let target = target as usize;
        if target > self.program.code.len() {
            return Err(vm_error(format!("jump target {target} out of range")));
        }
        self.ctx.pc = target;
        Ok(())
    }

    fn step(&mut self) -> Result<Control, ScriptError> {
        let Some(&op) = self.program.code.get(self.ctx.pc) else {
            // Running off the end returns the last value.
            let value = self.ctx.stack.pop().unwrap_or_default();
            return Ok(Control::Finish(value));
        };
        self.ctx.pc += 1;

        match op {
            Op::Nil => self.push(Value::Nil)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Int(n) => self.push(Value::Int(n))?,
            Op::Const(index) => {
                let value = match self.program.constants.get(index as usize) {
                    Some(Constant::Str(s)) => Value::Str(s.clone()),
                    Some(Constant::Float(x)) => Value::Float(*x),
                    None => return Err(vm_error(format!("constant {index} out of range"))),
                };
                self.push(value)?;
            }
            Op::GetLocal(slot) => {
                let value = self
                    .ctx
                    .locals
                    .get(usize::from(slot))
                    .cloned()
                    .ok_or_else(|| vm_error(format!("local slot {slot} out of range")))?;
                self.push(value)?;
            }
            Op::SetLocal(slot) => {
                let value = self.top()?.clone();
                let local = self
                    .ctx
                    .locals
                    .get_mut(usize::from(slot))
                    .ok_or_else(|| vm_error(format!("local slot {slot} out of range")))?;
                *local = value;
            }
            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let value = self.top()?.clone();
                self.push(value)?;
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let value = self.arithmetic(op, lhs, rhs)?;
                self.push(value)?;
            }
            Op::Eq | Op::Ne => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.push(Value::Bool((lhs == rhs) == (op == Op::Eq)))?;
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = compare(&lhs, &rhs)?.is_some_and(|ordering| match op {
                    Op::Lt => ordering == Ordering::Less,
                    Op::Le => ordering != Ordering::Greater,
                    Op::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                });
                self.push(Value::Bool(result))?;
            }
            Op::Neg => {
                let value = match self.pop()? {
                    Value::Int(n) => Value::Int(n.checked_neg().ok_or_else(integer_overflow)?),
                    Value::Float(x) => Value::Float(-x),
                    other => return Err(no_method("-@", &other)),
                };
                self.push(value)?;
            }
            Op::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()))?;
            }
            Op::Jump(target) => self.jump(target)?,
            Op::JumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    self.jump(target)?;
                }
            }
            Op::JumpIfTrue(target) => {
                if self.pop()?.is_truthy() {
                    self.jump(target)?;
                }
            }
            Op::Suspend => {
                // `suspend` evaluates to nil once the task is resumed.
                self.push(Value::Nil)?;
                return Ok(Control::Suspend);
            }
            Op::Raise(sym) => {
                let class = self.symbol(sym)?.to_string();
                let message = match self.pop()? {
                    Value::Nil => class.clone(),
                    Value::Str(s) => s,
                    other => other.to_string(),
                };
                return Err(ScriptError::new(class, message));
            }
            Op::Undefined(sym) => {
                let name = self.symbol(sym)?;
                return Err(ScriptError::new(
                    "NameError",
                    format!("undefined local variable or method '{name}' for main"),
                ));
            }
            Op::Return => {
                let value = self.ctx.stack.pop().unwrap_or_default();
                return Ok(Control::Finish(value));
            }
        }
        Ok(Control::Continue)
    }

    fn arithmetic(&self, op: Op, lhs: Value, rhs: Value) -> Result<Value, ScriptError> {
        match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => int_arithmetic(op, *a, *b).map(Value::Int),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                Ok(Value::Float(float_arithmetic(op, as_f64(&lhs), as_f64(&rhs))))
            }
            (Value::Int(_) | Value::Float(_), _) => Err(not_coercible(&lhs, &rhs)),
            (Value::Str(a), Value::Str(b)) if op == Op::Add => {
                self.check_string_len(a.len() + b.len())?;
                Ok(Value::Str(format!("{a}{b}")))
            }
            (Value::Str(s), Value::Int(n)) if op == Op::Mul => {
                let count = usize::try_from(*n)
                    .map_err(|_| ScriptError::new("ArgumentError", "negative argument"))?;
                let len = s
                    .len()
                    .checked_mul(count)
                    .ok_or_else(|| ScriptError::new("ArgumentError", "argument too big"))?;
                self.check_string_len(len)?;
                Ok(Value::Str(s.repeat(count)))
            }
            (Value::Str(_), _) if matches!(op, Op::Add | Op::Mul) => Err(ScriptError::new(
                "TypeError",
                format!("no implicit conversion of {} into {}", rhs.class_name(), match op {
                    Op::Add => "String",
                    _ => "Integer",
                }),
            )),
            _ => Err(no_method(operator_name(op), &lhs)),
        }
    }

    fn check_string_len(&self, len: usize) -> Result<(), ScriptError> {
        if len > self.limits.max_string_len {
            return Err(ScriptError::new("ArgumentError", "string size too big"));
        }
        Ok(())
    }
}

fn operator_name(op: Op) -> &'static str {
    match op {
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mul => "*",
        Op::Div => "/",
        Op::Mod => "%",
        Op::Lt => "<",
        Op::Le => "<=",
        Op::Gt => ">",
        Op::Ge => ">=",
        _ => "?",
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(n) => *n as f64,
        Value::Float(x) => *x,
        _ => f64::NAN,
    }
}

fn int_arithmetic(op: Op, a: i64, b: i64) -> Result<i64, ScriptError> {
    let divided_by_zero = || ScriptError::new("ZeroDivisionError", "divided by 0");
    match op {
        Op::Add => a.checked_add(b).ok_or_else(integer_overflow),
        Op::Sub => a.checked_sub(b).ok_or_else(integer_overflow),
        Op::Mul => a.checked_mul(b).ok_or_else(integer_overflow),
        Op::Div => {
            if b == 0 {
                return Err(divided_by_zero());
            }
            let quotient = a.checked_div(b).ok_or_else(integer_overflow)?;
            // Round toward negative infinity.
            if a % b != 0 && (a < 0) != (b < 0) {
                Ok(quotient - 1)
            } else {
                Ok(quotient)
            }
        }
        Op::Mod => {
            if b == 0 {
                return Err(divided_by_zero());
            }
            // The result takes the divisor's sign.
            let rem = a.checked_rem(b).unwrap_or(0);
            if rem != 0 && (rem < 0) != (b < 0) {
                Ok(rem + b)
            } else {
                Ok(rem)
            }
        }
        _ => Err(vm_error("not an arithmetic instruction")),
    }
}

fn float_arithmetic(op: Op, a: f64, b: f64) -> f64 {
    match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => a / b,
        Op::Mod => {
            let rem = a % b;
            if rem != 0.0 && (rem < 0.0) != (b < 0.0) {
                rem + b
            } else {
                rem
            }
        }
        _ => f64::NAN,
    }
}

/// Order two values; `None` when either side is NaN.
fn compare(lhs: &Value, rhs: &Value) -> Result<Option<Ordering>, ScriptError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(b))),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Ok(as_f64(lhs).partial_cmp(&as_f64(rhs)))
        }
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        _ => Err(ScriptError::new(
            "ArgumentError",
            format!(
                "comparison of {} with {} failed",
                lhs.class_name(),
                rhs.inspect()
            ),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::compiler::{CompilerContext, CompilerOptions};

    const LIMITS: Limits = Limits {
        budget: 10_000,
        max_stack_depth: 64,
        max_string_len: 32,
    };

    fn program(source: &str) -> Program {
        let mut ctx = CompilerContext::new(CompilerOptions::default());
        let mut program = ctx.load(source.as_bytes()).expect("compile");
        ctx.resolve_symbols(&mut program).expect("resolve");
        program
    }

    fn eval(source: &str) -> SliceOutcome {
        let program = program(source);
        let mut ctx = ExecContext::new(program.nlocals());
        run(&program, &mut ctx, LIMITS, &Interrupt::new()).outcome
    }

    fn raised(source: &str) -> ScriptError {
        match eval(source) {
            SliceOutcome::Raised(err) => err,
            other => panic!("expected a raise, got {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("40 + 2"), SliceOutcome::Finished(Value::Int(42)));
        assert_eq!(eval("2 + 3 * 4 - 1"), SliceOutcome::Finished(Value::Int(13)));
        assert_eq!(eval("1 + 0.5"), SliceOutcome::Finished(Value::Float(1.5)));
        assert_eq!(eval("\"ab\" * 2 + \"c\""), SliceOutcome::Finished(Value::from("ababc")));
    }

    #[test]
    fn test_floor_division_and_modulo() {
        assert_eq!(eval("-7 / 2"), SliceOutcome::Finished(Value::Int(-4)));
        assert_eq!(eval("7 / -2"), SliceOutcome::Finished(Value::Int(-4)));
        assert_eq!(eval("-7 % 3"), SliceOutcome::Finished(Value::Int(2)));
        assert_eq!(eval("7 % -3"), SliceOutcome::Finished(Value::Int(-2)));
        assert_eq!(eval("-7.5 % 2"), SliceOutcome::Finished(Value::Float(0.5)));
    }

    #[test]
    fn test_loop_with_locals() {
        let source = "i = 0\nsum = 0\nwhile i < 5\n  sum = sum + i\n  i = i + 1\nend\nsum";
        assert_eq!(eval(source), SliceOutcome::Finished(Value::Int(10)));
    }

    #[test]
    fn test_short_circuit() {
        assert_eq!(eval("nil && undefined_name"), SliceOutcome::Finished(Value::Nil));
        assert_eq!(eval("1 || undefined_name"), SliceOutcome::Finished(Value::Int(1)));
        assert_eq!(eval("false || \"x\""), SliceOutcome::Finished(Value::from("x")));
    }

    #[test]
    fn test_script_errors() {
        let err = raised("1 / 0");
        assert_eq!((err.class.as_str(), err.message.as_str()), ("ZeroDivisionError", "divided by 0"));

        assert!(raised("1 + \"a\"").is_a("TypeError"));
        assert!(raised("\"a\" + 1").is_a("TypeError"));
        assert!(raised("nil + 1").is_a("NoMethodError"));
        assert!(raised("1 < \"a\"").is_a("ArgumentError"));
        assert!(raised("9223372036854775807 + 1").is_a("RangeError"));
        assert!(raised("\"abcdefgh\" * 5").is_a("ArgumentError"));

        let err = raised("y + 1");
        assert_eq!(err.class, "NameError");
        assert!(err.message.contains("'y'"));
    }

    #[test]
    fn test_raise_forms() {
        assert_eq!(raised("raise \"boom\""), ScriptError::runtime("boom"));
        assert_eq!(raised("raise"), ScriptError::runtime("unhandled exception"));
        assert_eq!(
            raised("raise ArgumentError"),
            ScriptError::new("ArgumentError", "ArgumentError")
        );
        assert_eq!(
            raised("raise IOError, \"closed\""),
            ScriptError::new("IOError", "closed")
        );
    }

    #[test]
    fn test_suspend_then_continue() {
        let program = program("a = 1\nsuspend\na + 1");
        let mut ctx = ExecContext::new(program.nlocals());
        let interrupt = Interrupt::new();
        assert_eq!(run(&program, &mut ctx, LIMITS, &interrupt).outcome, SliceOutcome::Suspended);
        assert_eq!(
            run(&program, &mut ctx, LIMITS, &interrupt).outcome,
            SliceOutcome::Finished(Value::Int(2))
        );
    }

    #[test]
    fn test_budget_preempts() {
        let program = program("while true\nend");
        let mut ctx = ExecContext::new(0);
        let limits = Limits { budget: 100, ..LIMITS };
        let slice = run(&program, &mut ctx, limits, &Interrupt::new());
        assert_eq!(slice.outcome, SliceOutcome::Preempted);
        assert_eq!(slice.executed, 100);
    }

    #[test]
    fn test_interrupt_raises() {
        let program = program("while true\nend");
        let mut ctx = ExecContext::new(0);
        let interrupt = Interrupt::new();
        interrupt.signal();
        let slice = run(&program, &mut ctx, LIMITS, &interrupt);
        assert!(matches!(slice.outcome, SliceOutcome::Raised(ref e) if e.is_a("Interrupt")));
        assert!(!interrupt.is_pending());
    }

    #[test]
    fn test_corrupt_program_raises_vm_error() {
        let program = Program {
            code: vec![Op::Add],
            ..Program::raising(ScriptError::runtime("unused"))
        };
        let mut ctx = ExecContext::new(0);
        let slice = run(&program, &mut ctx, LIMITS, &Interrupt::new());
        assert!(matches!(slice.outcome, SliceOutcome::Raised(ref e) if e.is_a("VMError")));
    }

    #[test]
    fn test_stack_depth_limit() {
        let program = Program {
            code: vec![Op::Nil, Op::Jump(0)],
            ..Program::raising(ScriptError::runtime("unused"))
        };
        let mut ctx = ExecContext::new(0);
        let slice = run(&program, &mut ctx, LIMITS, &Interrupt::new());
        assert!(matches!(slice.outcome, SliceOutcome::Raised(ref e) if e.is_a("SystemStackError")));
    }
}
