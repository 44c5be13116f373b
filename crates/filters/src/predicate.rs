//! CEL-backed predicates over a resource's `metadata`, `spec` and `status`.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use cel_interpreter::{Context, Program, Value};
use cel_parser::{Atom, Expression, Member, UnaryOp};
use karchive_core::ResourceView;

/// The only free variables an expression may reference.
pub const SECTIONS: [&str; 3] = ["metadata", "spec", "status"];

// Functions registered by `Context::default()`; anything else is undeclared.
const BOOL_FUNCTIONS: &[&str] = &["has", "contains", "startsWith", "endsWith", "matches", "all", "exists", "exists_one"];
const VALUE_FUNCTIONS: &[&str] = &[
    "size",
    "string",
    "int",
    "uint",
    "double",
    "bytes",
    "max",
    "map",
    "filter",
    "duration",
    "timestamp",
    "getFullYear",
    "getMonth",
    "getDayOfYear",
    "getDayOfMonth",
    "getDate",
    "getDayOfWeek",
    "getHours",
    "getMinutes",
    "getSeconds",
    "getMilliseconds",
];
const COMPREHENSIONS: &[&str] = &["all", "exists", "exists_one", "map", "filter"];

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("syntax error in `{expr}`: {message}")]
    Syntax { expr: String, message: String },
    #[error("type error in `{expr}`: {message}")]
    Type { expr: String, message: String },
    #[error("cannot build program for `{expr}`: {message}")]
    Backend { expr: String, message: String },
}

/// Compiled, reusable boolean predicate.
pub struct CompiledPredicate {
    source: String,
    program: Program,
}

impl fmt::Debug for CompiledPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPredicate").field("source", &self.source).finish()
    }
}

impl CompiledPredicate {
    pub fn source(&self) -> &str { &self.source }

    /// Evaluate against a resource. Runtime errors and non-bool results are `false`.
    pub fn evaluate(&self, resource: &ResourceView) -> bool {
        let empty = serde_json::Value::Object(Default::default());
        let mut ctx = Context::default();
        for name in SECTIONS {
            let section = resource.section(name).unwrap_or(&empty);
            if ctx.add_variable(name, section).is_err() {
                return false;
            }
        }
        // interpreter panics collapse to false as well
        let out = catch_unwind(AssertUnwindSafe(|| self.program.execute(&ctx)));
        matches!(out, Ok(Ok(Value::Bool(true))))
    }
}

/// Compile an expression into a predicate. The expression must parse, only
/// reference [`SECTIONS`] (plus comprehension variables) and must not
/// statically resolve to a non-bool value.
pub fn compile(expr: &str) -> Result<CompiledPredicate, CompileError> {
    let ast = cel_parser::parse(expr)
        .map_err(|e| CompileError::Syntax { expr: expr.to_string(), message: e.to_string() })?;
    let mut bound = Vec::new();
    match infer(&ast, &mut bound) {
        Ok(Ty::NonBool) => {
            return Err(CompileError::Type {
                expr: expr.to_string(),
                message: "expression does not evaluate to bool".to_string(),
            })
        }
        Ok(_) => {}
        Err(message) => return Err(CompileError::Type { expr: expr.to_string(), message }),
    }
    let program = Program::compile(expr)
        .map_err(|e| CompileError::Backend { expr: expr.to_string(), message: e.to_string() })?;
    Ok(CompiledPredicate { source: expr.to_string(), program })
}

/// Coarse static type used by the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Bool,
    NonBool,
    Dyn,
}

fn expect_bool(expr: &Expression, bound: &mut Vec<String>, what: &str) -> Result<(), String> {
    match infer(expr, bound)? {
        Ty::NonBool => Err(format!("{what} must be bool")),
        _ => Ok(()),
    }
}

fn infer(expr: &Expression, bound: &mut Vec<String>) -> Result<Ty, String> {
    match expr {
        Expression::Atom(Atom::Bool(_)) => Ok(Ty::Bool),
        Expression::Atom(_) => Ok(Ty::NonBool),
        Expression::Ident(name) => {
            let name = name.as_str();
            if SECTIONS.contains(&name) {
                Ok(Ty::NonBool)
            } else if bound.iter().any(|b| b == name) {
                Ok(Ty::Dyn)
            } else {
                Err(format!("undeclared reference to '{name}'"))
            }
        }
        Expression::Relation(l, _, r) => {
            infer(l, bound)?;
            infer(r, bound)?;
            Ok(Ty::Bool)
        }
        Expression::Arithmetic(l, _, r) => {
            infer(l, bound)?;
            infer(r, bound)?;
            Ok(Ty::NonBool)
        }
        Expression::And(l, r) | Expression::Or(l, r) => {
            expect_bool(l, bound, "logical operand")?;
            expect_bool(r, bound, "logical operand")?;
            Ok(Ty::Bool)
        }
        Expression::Unary(op, e) => match op {
            UnaryOp::Not | UnaryOp::DoubleNot => {
                expect_bool(e, bound, "negated operand")?;
                Ok(Ty::Bool)
            }
            _ => {
                infer(e, bound)?;
                Ok(Ty::NonBool)
            }
        },
        Expression::Ternary(cond, a, b) => {
            expect_bool(cond, bound, "ternary condition")?;
            Ok(match (infer(a, bound)?, infer(b, bound)?) {
                (Ty::Bool, Ty::Bool) => Ty::Bool,
                (Ty::NonBool, Ty::NonBool) => Ty::NonBool,
                _ => Ty::Dyn,
            })
        }
        Expression::List(items) => {
            for item in items {
                infer(item, bound)?;
            }
            Ok(Ty::NonBool)
        }
        Expression::Map(entries) => {
            for (k, v) in entries {
                infer(k, bound)?;
                infer(v, bound)?;
            }
            Ok(Ty::NonBool)
        }
        Expression::Member(target, member) => match member.as_ref() {
            Member::Attribute(_) => {
                infer(target, bound)?;
                Ok(Ty::Dyn)
            }
            Member::Index(idx) => {
                infer(target, bound)?;
                infer(idx, bound)?;
                Ok(Ty::Dyn)
            }
            Member::Fields(fields) => {
                for (_, value) in fields {
                    infer(value, bound)?;
                }
                Err("message construction is not supported".to_string())
            }
            #[allow(unreachable_patterns)]
            _ => Err("unsupported member expression".to_string()),
        },
        Expression::FunctionCall(func, target, args) => infer_call(func, target.as_deref(), args, bound),
        #[allow(unreachable_patterns)]
        _ => Err("unsupported expression".to_string()),
    }
}

fn infer_call(func: &Expression, target: Option<&Expression>, args: &[Expression], bound: &mut Vec<String>) -> Result<Ty, String> {
    let name = match func {
        Expression::Ident(n) => n.as_str().to_string(),
        _ => return Err("unsupported call target".to_string()),
    };
    if !BOOL_FUNCTIONS.contains(&name.as_str()) && !VALUE_FUNCTIONS.contains(&name.as_str()) {
        return Err(format!("undeclared reference to '{name}'"));
    }
    if let Some(t) = target {
        infer(t, bound)?;
    }
    // comprehension macros bind their first argument inside the body
    if COMPREHENSIONS.contains(&name.as_str()) {
        if let [Expression::Ident(var), body] = args {
            bound.push(var.as_str().to_string());
            let body_ty = infer(body, bound);
            bound.pop();
            let body_ty = body_ty?;
            if name != "map" && body_ty == Ty::NonBool {
                return Err(format!("{name} predicate must be bool"));
            }
            return Ok(if name == "map" || name == "filter" { Ty::NonBool } else { Ty::Bool });
        }
    }
    for a in args {
        infer(a, bound)?;
    }
    if BOOL_FUNCTIONS.contains(&name.as_str()) {
        Ok(Ty::Bool)
    } else {
        Ok(Ty::NonBool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(v: serde_json::Value) -> ResourceView {
        ResourceView::from_value(v).unwrap()
    }

    fn sample() -> ResourceView {
        pod(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": "ns", "labels": {"app": "web"}},
            "spec": {"containers": [{"name": "c"}]},
            "status": {"phase": "Succeeded"}
        }))
    }

    #[test]
    fn literal_true_and_false() {
        assert!(compile("true").unwrap().evaluate(&sample()));
        assert!(!compile("false").unwrap().evaluate(&sample()));
    }

    #[test]
    fn reads_sections() {
        let p = compile("status.phase == 'Succeeded' && metadata.labels.app == 'web'").unwrap();
        assert!(p.evaluate(&sample()));
        let p = compile("size(spec.containers) > 1").unwrap();
        assert!(!p.evaluate(&sample()));
    }

    #[test]
    fn missing_fields_evaluate_to_false() {
        let p = compile("status.completionTime == 'x'").unwrap();
        assert!(!p.evaluate(&sample()));
        let bare = pod(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}}));
        assert!(!compile("status.phase == 'Failed'").unwrap().evaluate(&bare));
        assert!(!compile("has(status.phase)").unwrap().evaluate(&bare));
    }

    #[test]
    fn comprehension_variables_are_bound() {
        let p = compile("spec.containers.exists(c, c.name == 'c')").unwrap();
        assert!(p.evaluate(&sample()));
    }

    #[test]
    fn rejects_syntax_errors() {
        assert!(matches!(compile("status.phase ==").unwrap_err(), CompileError::Syntax { .. }));
    }

    #[test]
    fn rejects_non_bool_expressions() {
        for expr in ["1 + 2", "'text'", "metadata", "[true]", "-1", "size(spec)"] {
            assert!(matches!(compile(expr).unwrap_err(), CompileError::Type { .. }), "{expr}");
        }
    }

    #[test]
    fn rejects_unknown_variables() {
        let err = compile("object.metadata.name == 'x'").unwrap_err();
        assert!(err.to_string().contains("object"), "{err}");
        assert!(compile("true || foo").is_err());
    }

    #[test]
    fn rejects_undeclared_functions() {
        for expr in ["metadata.name.startswith('x')", "isDone(status)", "size(spec) > 0 && bogus(metadata)"] {
            let err = compile(expr).unwrap_err();
            assert!(matches!(err, CompileError::Type { .. }), "{expr}: {err}");
            assert!(err.to_string().contains("undeclared reference"), "{err}");
        }
        assert!(compile("metadata.name.startsWith('x')").is_ok());
        assert!(compile("timestamp(metadata.creationTimestamp).getFullYear() > 2020").is_ok());
    }

    #[test]
    fn free_variables_are_checked_everywhere() {
        // message construction fields are walked before the form is rejected
        let err = compile("Foo{a: object.x}").unwrap_err();
        assert!(!matches!(err, CompileError::Backend { .. }), "{err}");
        assert!(compile("spec.containers[object.idx].name == 'c'").is_err());
        assert!(compile("spec.containers.exists(c, c.name == other)").is_err());
    }

    #[test]
    fn dynamic_results_that_are_not_bool_are_false() {
        // field access type-checks as dynamic; at runtime it yields a string
        let p = compile("status.phase").unwrap();
        assert!(!p.evaluate(&sample()));
    }
}
