//! Expression evaluation
//!
//! Pure evaluation over the context bindings. Call expressions are handed to
//! `calls`, which is where side effects and their gating live.

use super::calls;
use super::context::ExecutionContext;
use super::errors::{self, EngineError};
use super::types::{BinaryOp, CmpOp, Expr, MapEntry, UnaryOp, Val};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub type EvalResult = Result<Val, EngineError>;

pub fn eval(ctx: &mut ExecutionContext<'_>, expr: &Expr) -> EvalResult {
    match expr {
        Expr::Lit { v } => Ok(v.clone()),

        Expr::Var { name } => ctx.lookup(name).ok_or_else(|| unknown_variable(name)),

        Expr::Attr { base, path } => {
            let value = ctx.lookup(base).ok_or_else(|| unknown_variable(base))?;
            // Missing attributes read as null
            Ok(value.get_path(path).cloned().unwrap_or(Val::Null))
        }

        Expr::State { path } => Ok(ctx.state.get_path(path).cloned().unwrap_or(Val::Null)),

        Expr::Unary { op, operand } => {
            let value = eval(ctx, operand)?;
            match (op, value) {
                (UnaryOp::Not, v) => Ok(Val::Bool(!v.is_truthy())),
                (UnaryOp::Neg, Val::Num(n)) => Ok(Val::Num(-n)),
                (UnaryOp::Neg, other) => Err(type_error(format!("Cannot negate a {} value", other.kind()))),
            }
        }

        Expr::Binary { op, left, right } => eval_binary(ctx, *op, left, right),

        Expr::Compare { op, left, right } => {
            let left = eval(ctx, left)?;
            let right = eval(ctx, right)?;
            compare_values(*op, &left, &right).map(Val::Bool)
        }

        Expr::List { items } => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(ctx, item)?);
            }
            Ok(Val::List(values))
        }

        Expr::Map { entries } => eval_entries(ctx, entries),

        Expr::CallTool { name, args } => {
            let args = eval_entries(ctx, args)?;
            calls::call_tool(ctx, name, args)
        }

        Expr::CallAi { profile, input } => {
            let input = eval(ctx, input)?;
            calls::call_ai(ctx, profile, input)
        }

        Expr::CallFlow { name, args } => {
            let args = eval_entries(ctx, args)?;
            calls::call_flow(ctx, name, args)
        }

        Expr::CallPipeline { name, input } => {
            let input = eval(ctx, input)?;
            calls::call_pipeline(ctx, name, input)
        }

        Expr::CallFunction { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(ctx, arg)?);
            }
            calls::call_function(ctx, name, values)
        }
    }
}

/// Evaluate `key: expr` entries into an object, in declaration order
pub fn eval_entries(ctx: &mut ExecutionContext<'_>, entries: &[MapEntry]) -> EvalResult {
    let mut map = BTreeMap::new();
    for entry in entries {
        let value = eval(ctx, &entry.value)?;
        map.insert(entry.key.clone(), value);
    }
    Ok(Val::Obj(map))
}

fn eval_binary(ctx: &mut ExecutionContext<'_>, op: BinaryOp, left: &Expr, right: &Expr) -> EvalResult {
    // Logical operators short-circuit
    match op {
        BinaryOp::And => {
            let l = eval(ctx, left)?;
            if !l.is_truthy() {
                return Ok(Val::Bool(false));
            }
            return Ok(Val::Bool(eval(ctx, right)?.is_truthy()));
        }
        BinaryOp::Or => {
            let l = eval(ctx, left)?;
            if l.is_truthy() {
                return Ok(Val::Bool(true));
            }
            return Ok(Val::Bool(eval(ctx, right)?.is_truthy()));
        }
        _ => {}
    }

    let l = eval(ctx, left)?;
    let r = eval(ctx, right)?;
    match (op, l, r) {
        (BinaryOp::Add, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a + b)),
        (BinaryOp::Add, Val::Str(a), b) => Ok(Val::Str(format!("{}{}", a, b))),
        (BinaryOp::Add, a, Val::Str(b)) => Ok(Val::Str(format!("{}{}", a, b))),
        (BinaryOp::Add, Val::List(mut a), Val::List(b)) => {
            a.extend(b);
            Ok(Val::List(a))
        }
        (BinaryOp::Sub, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a - b)),
        (BinaryOp::Mul, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a * b)),
        (BinaryOp::Div, Val::Num(_), Val::Num(b)) if b == 0.0 => {
            Err(EngineError::runtime(errors::DIVISION_BY_ZERO, "Division by zero"))
        }
        (BinaryOp::Div, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a / b)),
        (op, a, b) => Err(type_error(format!(
            "Operator {:?} is not defined for {} and {}",
            op,
            a.kind(),
            b.kind()
        ))),
    }
}

/// Structural equality for `==`/`!=`; ordering only between scalars of one kind
pub fn compare_values(op: CmpOp, left: &Val, right: &Val) -> Result<bool, EngineError> {
    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::Ne => Ok(left != right),
        _ => {
            let ordering = left.partial_cmp_scalar(right).ok_or_else(|| {
                type_error(format!("Cannot order {} against {}", left.kind(), right.kind()))
            })?;
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Ge => ordering != Ordering::Less,
                CmpOp::Eq | CmpOp::Ne => false,
            })
        }
    }
}

fn unknown_variable(name: &str) -> EngineError {
    EngineError::runtime(errors::UNKNOWN_VARIABLE, format!("Unknown variable '{}'", name))
}

pub fn type_error(message: String) -> EngineError {
    EngineError::runtime(errors::TYPE_ERROR, message)
}
