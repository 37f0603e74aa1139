//! A small integer expression interpreter.
//!
//! Just enough language for exercising kernel sessions end to end:
//! integer arithmetic with variables, `print(...)` writing to the
//! stdout stream, and `sleep_ms(n)` for timeout scenarios. Interpreter
//! state persists across executions until the process restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Set by the SIGINT handler; checked between statements and during
/// sleeps so a stuck execution can be aborted without killing state.
pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Evaluation error in Jupyter error shape.
#[derive(Debug, PartialEq)]
pub struct EvalError {
    pub ename: String,
    pub evalue: String,
}

impl EvalError {
    fn new(ename: &str, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.to_string(),
            evalue: evalue.into(),
        }
    }

    fn syntax(evalue: impl Into<String>) -> Self {
        Self::new("SyntaxError", evalue)
    }
}

pub struct Interpreter {
    variables: HashMap<String, i64>,
    interrupt: &'static AtomicBool,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_interrupt_flag(&INTERRUPTED)
    }

    /// Tests substitute their own flag to avoid the process-global one.
    pub fn with_interrupt_flag(interrupt: &'static AtomicBool) -> Self {
        Self {
            variables: HashMap::new(),
            interrupt,
        }
    }

    /// Run a code block: statements separated by newlines or `;`.
    /// Printed text goes to `on_stdout` as it is produced, so output
    /// streams out before any later statement blocks. Returns the
    /// value of a trailing bare expression, if any.
    pub fn eval_block(
        &mut self,
        code: &str,
        on_stdout: &mut dyn FnMut(String),
    ) -> Result<Option<i64>, EvalError> {
        let mut value = None;

        for statement in code.split(['\n', ';']) {
            if self.interrupt.load(Ordering::SeqCst) {
                return Err(EvalError::new("KeyboardInterrupt", "execution interrupted"));
            }
            let statement = statement.trim();
            if statement.is_empty() || statement.starts_with('#') {
                continue;
            }
            value = self.eval_statement(statement, on_stdout)?;
        }

        Ok(value)
    }

    fn eval_statement(
        &mut self,
        statement: &str,
        on_stdout: &mut dyn FnMut(String),
    ) -> Result<Option<i64>, EvalError> {
        if let Some(args) = call_args(statement, "print") {
            let mut rendered = Vec::new();
            for arg in split_args(args) {
                rendered.push(self.eval_expr(arg)?.to_string());
            }
            on_stdout(format!("{}\n", rendered.join(" ")));
            return Ok(None);
        }

        if let Some(arg) = call_args(statement, "sleep_ms") {
            let total = self.eval_expr(arg)?;
            if total < 0 {
                return Err(EvalError::new("ValueError", "sleep_ms expects a non-negative value"));
            }
            interruptible_sleep(Duration::from_millis(total as u64), self.interrupt)?;
            return Ok(None);
        }

        // Assignment, rejecting comparison operators as assignments.
        if let Some(eq) = statement.find('=')
            && !matches!(statement.as_bytes().get(eq + 1), Some(b'='))
            && eq > 0
            && !matches!(statement.as_bytes()[eq - 1], b'!' | b'<' | b'>')
        {
            let name = statement[..eq].trim();
            if !is_identifier(name) {
                return Err(EvalError::syntax(format!("cannot assign to '{}'", name)));
            }
            let value = self.eval_expr(statement[eq + 1..].trim())?;
            self.variables.insert(name.to_string(), value);
            return Ok(None);
        }

        self.eval_expr(statement).map(Some)
    }

    fn eval_expr(&self, expr: &str) -> Result<i64, EvalError> {
        let mut parser = Parser {
            interpreter: self,
            input: expr.as_bytes(),
            pos: 0,
        };
        let value = parser.expr()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(EvalError::syntax(format!(
                "unexpected input at '{}'",
                &expr[parser.pos..]
            )));
        }
        Ok(value)
    }
}

/// Sleep in small slices so an interrupt lands promptly.
fn interruptible_sleep(total: Duration, interrupt: &AtomicBool) -> Result<(), EvalError> {
    const SLICE: Duration = Duration::from_millis(10);
    let mut remaining = total;
    while !remaining.is_zero() {
        if interrupt.load(Ordering::SeqCst) {
            return Err(EvalError::new("KeyboardInterrupt", "execution interrupted"));
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    Ok(())
}

/// `call_args("print(1, 2)", "print")` -> `Some("1, 2")`.
fn call_args<'a>(statement: &'a str, name: &str) -> Option<&'a str> {
    let rest = statement.strip_prefix(name)?.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner)
}

/// Split on top-level commas only.
fn split_args(args: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, b) in args.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                out.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = args[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Recursive-descent parser over `+ - * / %`, parens, unary minus,
/// integer literals, and variables.
struct Parser<'a> {
    interpreter: &'a Interpreter,
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn expr(&mut self) -> Result<i64, EvalError> {
        let mut value = self.term()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    value = value.wrapping_add(self.term()?);
                }
                Some(b'-') => {
                    self.pos += 1;
                    value = value.wrapping_sub(self.term()?);
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<i64, EvalError> {
        let mut value = self.factor()?;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    value = value.wrapping_mul(self.factor()?);
                }
                Some(op @ (b'/' | b'%')) => {
                    self.pos += 1;
                    let rhs = self.factor()?;
                    if rhs == 0 {
                        return Err(EvalError::new("ZeroDivisionError", "division by zero"));
                    }
                    value = if op == b'/' { value / rhs } else { value % rhs };
                }
                _ => return Ok(value),
            }
        }
    }

    fn factor(&mut self) -> Result<i64, EvalError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(self.factor()?.wrapping_neg())
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr()?;
                self.skip_whitespace();
                if self.peek() != Some(b')') {
                    return Err(EvalError::syntax("missing closing parenthesis"));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(b) if b.is_ascii_digit() => self.number(),
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.variable(),
            Some(b) => Err(EvalError::syntax(format!(
                "unexpected character '{}'",
                b as char
            ))),
            None => Err(EvalError::syntax("unexpected end of expression")),
        }
    }

    fn number(&mut self) -> Result<i64, EvalError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        text.parse()
            .map_err(|_| EvalError::syntax(format!("invalid number '{}'", text)))
    }

    fn variable(&mut self) -> Result<i64, EvalError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        self.interpreter
            .variables
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::new("NameError", format!("name '{}' is not defined", name)))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(code: &str) -> Result<Option<i64>, EvalError> {
        Interpreter::new().eval_block(code, &mut |_| {})
    }

    #[test]
    fn arithmetic_with_precedence() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Some(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Some(9));
        assert_eq!(eval("10 / 3").unwrap(), Some(3));
        assert_eq!(eval("10 % 3").unwrap(), Some(1));
        assert_eq!(eval("-4 + 1").unwrap(), Some(-3));
    }

    #[test]
    fn variables_persist_across_executions() {
        let mut interp = Interpreter::new();
        let mut sink = |_| {};
        assert_eq!(interp.eval_block("x = 40", &mut sink).unwrap(), None);
        assert_eq!(interp.eval_block("x + 2", &mut sink).unwrap(), Some(42));
    }

    #[test]
    fn print_streams_stdout_lines() {
        let mut lines = Vec::new();
        let value = Interpreter::new()
            .eval_block("print(1, 2)\nprint(3 * 3)", &mut |s| lines.push(s))
            .unwrap();
        assert_eq!(lines, vec!["1 2\n", "9\n"]);
        assert_eq!(value, None);
    }

    #[test]
    fn only_trailing_expression_yields_a_value() {
        assert_eq!(eval("a = 1; b = 2; a + b").unwrap(), Some(3));
    }

    #[test]
    fn undefined_name_is_a_name_error() {
        assert_eq!(eval("ghost + 1").unwrap_err().ename, "NameError");
    }

    #[test]
    fn division_by_zero_is_reported() {
        assert_eq!(eval("1 / 0").unwrap_err().ename, "ZeroDivisionError");
    }

    #[test]
    fn garbage_is_a_syntax_error() {
        assert_eq!(eval("1 +* 2").unwrap_err().ename, "SyntaxError");
        assert_eq!(eval("2 = x").unwrap_err().ename, "SyntaxError");
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        assert_eq!(eval("# setup\n\nx = 1\n# done\nx").unwrap(), Some(1));
    }

    #[test]
    fn interrupt_aborts_a_sleep() {
        let flag: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(true)));
        let mut interp = Interpreter::with_interrupt_flag(flag);
        let err = interp.eval_block("sleep_ms(10000)", &mut |_| {}).unwrap_err();
        assert_eq!(err.ename, "KeyboardInterrupt");
    }
}
