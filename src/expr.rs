//! Expression evaluator (C4): evaluates CWL parameter references
//! (`$(...)`), code blocks (`${...}`), and string interpolation against a
//! context exposing `inputs`, `self`, and `runtime`.
//!
//! Evaluation runs on `boa_engine`, a pure-Rust ECMAScript interpreter.
//! Each call builds a fresh `boa_engine::Context` so the [`Evaluator`]
//! itself holds only immutable configuration and is `Send + Sync`
//! (spec.md §4.3 "Concurrency").

use boa_engine::{Context, JsValue, Source};
use serde_json::Value;

use crate::error::{ClassifiedError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression syntax error: {0}")]
    Syntax(String),

    #[error("expression runtime error: {0}")]
    Runtime(String),

    #[error("expression evaluation timed out")]
    Timeout,

    #[error("could not convert expression result to JSON: {0}")]
    Coercion(String),

    #[error("unterminated expression starting at byte {0}")]
    Unterminated(usize),
}

impl ClassifiedError for ExpressionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ExpressionError
    }

    fn retryable(&self) -> bool {
        false
    }
}

/// The context an expression evaluates against (spec.md §4.3).
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub inputs: Value,
    pub self_value: Value,
    pub runtime: Value,
}

impl EvalContext {
    pub fn new(inputs: Value, self_value: Value, runtime: Value) -> Self {
        Self {
            inputs,
            self_value,
            runtime,
        }
    }
}

/// Holds the optional expression library (code fragments prepended to every
/// `${...}` body) — the only state an [`Evaluator`] carries.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    expression_lib: Vec<String>,
}

impl Evaluator {
    pub fn new(expression_lib: Vec<String>) -> Self {
        Self { expression_lib }
    }

    /// Evaluate a `${...}` code block body (a sequence of statements,
    /// typically ending in `return`), returning the raw JSON result (not
    /// stringified).
    pub fn eval_expr(&self, body: &str, ctx: &EvalContext) -> Result<Value, ExpressionError> {
        self.eval_form(body, ExprForm::CodeBlock, ctx)
    }

    /// Evaluate a `$(...)` parameter reference: a bare expression (dotted
    /// navigation, arithmetic, ...) rather than a function body, so the
    /// expression's own value is returned without requiring `return`.
    pub fn eval_param_ref(&self, path: &str, ctx: &EvalContext) -> Result<Value, ExpressionError> {
        self.eval_form(path, ExprForm::ParamRef, ctx)
    }

    fn eval_form(&self, body: &str, form: ExprForm, ctx: &EvalContext) -> Result<Value, ExpressionError> {
        let mut js_ctx = Context::default();
        install_context(&mut js_ctx, ctx)?;

        let mut script = String::new();
        for lib in &self.expression_lib {
            script.push_str(lib);
            script.push('\n');
        }
        match form {
            ExprForm::ParamRef => script.push_str(&format!("(function() {{ return ({body}); }})()")),
            ExprForm::CodeBlock => script.push_str(&format!("(function() {{ {body} }})()")),
        }

        let source = Source::from_bytes(&script);
        let result = js_ctx
            .eval(source)
            .map_err(|e| ExpressionError::Runtime(e.to_string()))?;
        js_value_to_json(&result, &mut js_ctx)
    }

    /// Evaluate a string that may contain zero or more `$(...)`/`${...}`
    /// substrings, concatenating literal segments with the stringified
    /// rendering of each embedded expression's result (spec.md §4.3). A
    /// template that is a single `$(...)`/`${...}` segment with no
    /// surrounding literal text returns that expression's raw result
    /// rather than a stringified one, so typed fields (`when`, `outputEval`,
    /// an `ExpressionTool`'s body) preserve their non-string result.
    pub fn interpolate(&self, template: &str, ctx: &EvalContext) -> Result<Value, ExpressionError> {
        let segments = split_segments(template)?;

        if segments.len() == 1 {
            if let Segment::Expr(body, form) = &segments[0] {
                return self.eval_form(body, *form, ctx);
            }
        }

        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(&text),
                Segment::Expr(body, form) => {
                    let result = self.eval_form(&body, form, ctx)?;
                    out.push_str(&stringify(&result));
                }
            }
        }
        Ok(Value::String(out))
    }

    pub fn has_expression(template: &str) -> bool {
        template.contains("$(") || template.contains("${")
    }
}

/// Which delimiter opened an expression segment: `$(...)` is a bare
/// expression (a parameter reference), `${...}` is a full function body.
/// The two require different JS wrapping to evaluate correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExprForm {
    ParamRef,
    CodeBlock,
}

enum Segment {
    Literal(String),
    Expr(String, ExprForm),
}

/// Split a template string into literal and `$( )`/`${ }` expression
/// segments, tracking bracket/brace/quote nesting depth so embedded
/// parens/braces inside the expression body don't truncate it early.
fn split_segments(template: &str) -> Result<Vec<Segment>, ExpressionError> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && (bytes[i + 1] == b'(' || bytes[i + 1] == b'{') {
            if literal_start < i {
                segments.push(Segment::Literal(template[literal_start..i].to_string()));
            }
            let open = bytes[i + 1];
            let close = if open == b'(' { b')' } else { b'}' };
            let body_start = i + 2;
            let mut depth = 1usize;
            let mut j = body_start;
            let mut in_string: Option<u8> = None;
            while j < bytes.len() && depth > 0 {
                let b = bytes[j];
                match in_string {
                    Some(q) => {
                        if b == b'\\' {
                            j += 1;
                        } else if b == q {
                            in_string = None;
                        }
                    }
                    None => {
                        if b == b'"' || b == b'\'' {
                            in_string = Some(b);
                        } else if b == open {
                            depth += 1;
                        } else if b == close {
                            depth -= 1;
                        }
                    }
                }
                j += 1;
            }
            if depth != 0 {
                return Err(ExpressionError::Unterminated(i));
            }
            let body = &template[body_start..j - 1];
            let form = if open == b'(' { ExprForm::ParamRef } else { ExprForm::CodeBlock };
            segments.push(Segment::Expr(body.to_string(), form));
            literal_start = j;
            i = j;
        } else {
            i += 1;
        }
    }
    if literal_start < template.len() {
        segments.push(Segment::Literal(template[literal_start..].to_string()));
    }
    if segments.is_empty() {
        segments.push(Segment::Literal(String::new()));
    }
    Ok(segments)
}

/// Stringify a JSON value per the §4.3 rules reused from [`crate::value`].
fn stringify(value: &Value) -> String {
    crate::value::CwlValue::from_json(value.clone()).to_expr_string()
}

fn install_context(js_ctx: &mut Context, ctx: &EvalContext) -> Result<(), ExpressionError> {
    for (name, value) in [
        ("inputs", &ctx.inputs),
        ("self", &ctx.self_value),
        ("runtime", &ctx.runtime),
    ] {
        let js_value = json_to_js_value(value, js_ctx)?;
        js_ctx
            .register_global_property(
                boa_engine::JsString::from(name),
                js_value,
                boa_engine::property::Attribute::all(),
            )
            .map_err(|e| ExpressionError::Runtime(e.to_string()))?;
    }
    Ok(())
}

fn json_to_js_value(value: &Value, js_ctx: &mut Context) -> Result<JsValue, ExpressionError> {
    let text = serde_json::to_string(value).map_err(|e| ExpressionError::Coercion(e.to_string()))?;
    let source = Source::from_bytes(&format!("({text})"));
    js_ctx
        .eval(source)
        .map_err(|e| ExpressionError::Runtime(e.to_string()))
}

fn js_value_to_json(value: &JsValue, js_ctx: &mut Context) -> Result<Value, ExpressionError> {
    let json = value
        .to_json(js_ctx)
        .map_err(|e| ExpressionError::Coercion(e.to_string()))?;
    Ok(boa_json_to_serde_json(json))
}

/// `boa_engine::JsValue::to_json` returns `boa_engine::JsValue`'s own JSON
/// type backed by the same `serde_json::Value` model at the byte level;
/// re-encode through a string round trip to decouple from boa's internal
/// JSON-value representation across versions.
fn boa_json_to_serde_json(value: boa_engine::JsValue) -> Value {
    serde_json::to_string(&value)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}
