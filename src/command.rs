//! Command builder (C5): constructs argv and stdin/stdout/stderr paths from
//! a [`crate::parser::NormalizedTool`] plus resolved inputs.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{ClassifiedError, ErrorKind};
use crate::expr::{EvalContext, Evaluator, ExpressionError};
use crate::parser::NormalizedTool;
use crate::value::CwlValue;

#[derive(Debug, thiserror::Error)]
pub enum CommandBuildError {
    #[error("expression error while building command: {0}")]
    Expression(#[from] ExpressionError),

    #[error("input {0} has no resolved value")]
    MissingInput(String),
}

impl ClassifiedError for CommandBuildError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ExpressionError
    }

    fn retryable(&self) -> bool {
        false
    }
}

/// The built command, ready to be launched by the executor (spec.md §4.4).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildResult {
    pub command: Vec<String>,
    pub shell_quote: Vec<bool>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Clone)]
struct Part {
    position: i64,
    is_argument: bool,
    name: String,
    tokens: Vec<String>,
    shell_quote: bool,
}

/// An input binding as declared on a `CommandLineTool` input (a subset of
/// the normalized input's `inputBinding`, passed in alongside the resolved
/// value since the parser doesn't retain the raw binding object).
#[derive(Debug, Clone, Default)]
pub struct InputBinding {
    pub position: i64,
    pub prefix: Option<String>,
    pub separate: bool,
    pub shell_quote: bool,
    pub item_separator: Option<String>,
    pub value_from: Option<String>,
    pub has_binding: bool,
}

impl From<&crate::value::ParamBinding> for InputBinding {
    fn from(b: &crate::value::ParamBinding) -> Self {
        Self {
            position: b.position,
            prefix: b.prefix.clone(),
            separate: b.separate,
            shell_quote: b.shell_quote,
            item_separator: b.item_separator.clone(),
            value_from: b.value_from.clone(),
            has_binding: true,
        }
    }
}

/// Collect the `inputBinding`s carried on a tool's normalized inputs into
/// the map [`build_command`] expects. Inputs with no `inputBinding` (e.g.
/// ones only referenced from an expression) are omitted.
pub fn bindings_from_tool(tool: &NormalizedTool) -> HashMap<String, InputBinding> {
    tool.inputs
        .iter()
        .filter_map(|p| p.binding.as_ref().map(|b| (p.id.clone(), InputBinding::from(b))))
        .collect()
}

pub fn build_command(
    tool: &NormalizedTool,
    inputs: &HashMap<String, CwlValue>,
    bindings: &HashMap<String, InputBinding>,
    runtime: &Value,
    evaluator: &Evaluator,
) -> Result<BuildResult, CommandBuildError> {
    let mut command: Vec<String> = tool.base_command.clone();
    let mut parts: Vec<Part> = Vec::new();

    for (i, arg) in tool.arguments.iter().enumerate() {
        parts.push(build_argument_part(i, arg, inputs, runtime, evaluator)?);
    }

    let mut ids: Vec<&String> = bindings.keys().collect();
    ids.sort();
    for id in ids {
        let binding = &bindings[id];
        if !binding.has_binding {
            continue;
        }
        let value = inputs.get(id).cloned().unwrap_or(CwlValue::Null);
        if value.is_null() {
            continue;
        }
        if let Some(part) = build_input_part(id, binding, &value, runtime, evaluator)? {
            parts.push(part);
        }
    }

    parts.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then_with(|| b.is_argument.cmp(&a.is_argument))
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut shell_quote = vec![true; command.len()];
    for part in parts {
        for token in part.tokens {
            command.push(token);
            shell_quote.push(part.shell_quote);
        }
    }

    let ctx = EvalContext::new(inputs_to_json(inputs), Value::Null, runtime.clone());
    let stdin = eval_optional_stream(&tool.stdin, &ctx, evaluator)?;
    let stdout = eval_optional_stream(&tool.stdout, &ctx, evaluator)?;
    let stderr = eval_optional_stream(&tool.stderr, &ctx, evaluator)?;

    Ok(BuildResult {
        command,
        shell_quote,
        stdin,
        stdout,
        stderr,
    })
}

fn eval_optional_stream(
    field: &Option<String>,
    ctx: &EvalContext,
    evaluator: &Evaluator,
) -> Result<Option<String>, CommandBuildError> {
    match field {
        None => Ok(None),
        Some(text) if Evaluator::has_expression(text) => {
            let result = evaluator.interpolate(text, ctx)?;
            Ok(result.as_str().map(str::to_string))
        }
        Some(text) => Ok(Some(text.clone())),
    }
}

fn build_argument_part(
    index: usize,
    arg: &Value,
    inputs: &HashMap<String, CwlValue>,
    runtime: &Value,
    evaluator: &Evaluator,
) -> Result<Part, CommandBuildError> {
    let ctx = EvalContext::new(inputs_to_json(inputs), Value::Null, runtime.clone());
    let name = format!("arg_{index}");

    if let Some(text) = arg.as_str() {
        let rendered = if Evaluator::has_expression(text) {
            let result = evaluator.interpolate(text, &ctx)?;
            stringify(&result)
        } else {
            text.to_string()
        };
        return Ok(Part {
            position: 0,
            is_argument: true,
            name,
            tokens: vec![rendered],
            shell_quote: true,
        });
    }

    let position = arg.get("position").and_then(Value::as_i64).unwrap_or(0);
    let prefix = arg.get("prefix").and_then(Value::as_str).map(str::to_string);
    let separate = arg.get("separate").and_then(Value::as_bool).unwrap_or(true);
    let shell_quote = arg.get("shellQuote").and_then(Value::as_bool).unwrap_or(true);
    let value_from = arg.get("valueFrom").and_then(Value::as_str).unwrap_or_default();

    let mut self_ctx = ctx.clone();
    self_ctx.self_value = Value::Null;
    let rendered = if Evaluator::has_expression(value_from) {
        stringify(&evaluator.interpolate(value_from, &self_ctx)?)
    } else {
        value_from.to_string()
    };

    let tokens = combine_prefix(prefix.as_deref(), separate, &[rendered]);
    Ok(Part {
        position,
        is_argument: true,
        name,
        tokens,
        shell_quote,
    })
}

fn build_input_part(
    id: &str,
    binding: &InputBinding,
    value: &CwlValue,
    runtime: &Value,
    evaluator: &Evaluator,
) -> Result<Option<Part>, CommandBuildError> {
    let resolved = if let Some(expr) = &binding.value_from {
        let ctx = EvalContext::new(Value::Null, value.to_json(), runtime.clone());
        CwlValue::from_json(if Evaluator::has_expression(expr) {
            evaluator.interpolate(expr, &ctx)?
        } else {
            Value::String(expr.clone())
        })
    } else {
        value.clone()
    };

    if let CwlValue::Bool(b) = resolved {
        if !b {
            return Ok(None);
        }
        let tokens = binding
            .prefix
            .clone()
            .map(|p| vec![p])
            .unwrap_or_default();
        if tokens.is_empty() {
            return Ok(None);
        }
        return Ok(Some(Part {
            position: binding.position,
            is_argument: false,
            name: id.to_string(),
            tokens,
            shell_quote: binding.shell_quote,
        }));
    }

    let tokens = if let CwlValue::Array(items) = &resolved {
        build_array_tokens(binding, items)
    } else {
        combine_prefix(
            binding.prefix.as_deref(),
            binding.separate,
            &[resolved.to_expr_string()],
        )
    };

    Ok(Some(Part {
        position: binding.position,
        is_argument: false,
        name: id.to_string(),
        tokens,
        shell_quote: binding.shell_quote,
    }))
}

/// Array rule from spec.md §4.4 step 4: `itemSeparator` joins items into a
/// single scalar token; otherwise emit the outer prefix once, then each
/// item's bare rendering.
fn build_array_tokens(binding: &InputBinding, items: &[CwlValue]) -> Vec<String> {
    if let Some(sep) = &binding.item_separator {
        let joined = items.iter().map(CwlValue::to_expr_string).collect::<Vec<_>>().join(sep);
        return combine_prefix(binding.prefix.as_deref(), binding.separate, &[joined]);
    }

    let mut tokens = Vec::new();
    if let Some(prefix) = &binding.prefix {
        tokens.push(prefix.clone());
    }
    for item in items {
        tokens.push(item.to_expr_string());
    }
    tokens
}

fn combine_prefix(prefix: Option<&str>, separate: bool, values: &[String]) -> Vec<String> {
    match prefix {
        None => values.to_vec(),
        Some(prefix) if separate => {
            let mut out = vec![prefix.to_string()];
            out.extend(values.iter().cloned());
            out
        }
        Some(prefix) => {
            let joined = format!("{prefix}{}", values.join(""));
            vec![joined]
        }
    }
}

fn stringify(value: &Value) -> String {
    CwlValue::from_json(value.clone()).to_expr_string()
}

fn inputs_to_json(inputs: &HashMap<String, CwlValue>) -> Value {
    let map: serde_json::Map<String, Value> = inputs
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    Value::Object(map)
}

/// Quote each argument using POSIX single-quote escaping, passing simple
/// alphanumeric/`_-./:` tokens through unquoted (spec.md §4.4
/// `join_for_shell`).
pub fn join_for_shell(command: &[String], shell_quote: &[bool]) -> String {
    command
        .iter()
        .zip(shell_quote.iter())
        .map(|(token, quote)| {
            if *quote && !is_simple_token(token) {
                quote_single(token)
            } else {
                token.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_simple_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'))
}

fn quote_single(token: &str) -> String {
    format!("'{}'", token.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{NormalizedTool, ToolOutput};
    use crate::parser::RequirementsBag;
    use crate::value::ProcessClass;

    fn tool(base_command: &[&str]) -> NormalizedTool {
        NormalizedTool {
            id: "t".into(),
            class: ProcessClass::CommandLineTool,
            base_command: base_command.iter().map(|s| s.to_string()).collect(),
            arguments: vec![],
            inputs: vec![],
            outputs: vec![],
            requirements: RequirementsBag::default(),
            hints: RequirementsBag::default(),
            stdin: None,
            stdout: None,
            stderr: None,
            success_codes: vec![0],
            temporary_fail_codes: vec![],
            expression: None,
        }
    }

    fn positioned(position: i64) -> InputBinding {
        InputBinding {
            position,
            prefix: None,
            separate: true,
            shell_quote: true,
            item_separator: None,
            value_from: None,
            has_binding: true,
        }
    }

    #[test]
    fn echo_tool_builds_expected_command() {
        let t = tool(&["echo"]);
        let mut inputs = HashMap::new();
        inputs.insert("message".to_string(), CwlValue::String("hello world".into()));
        let mut bindings = HashMap::new();
        bindings.insert("message".to_string(), positioned(1));
        let evaluator = Evaluator::default();
        let result = build_command(&t, &inputs, &bindings, &serde_json::json!({}), &evaluator).unwrap();
        assert_eq!(result.command, vec!["echo".to_string(), "hello world".to_string()]);
    }

    #[test]
    fn boolean_true_emits_only_prefix() {
        let t = tool(&["tool"]);
        let mut inputs = HashMap::new();
        inputs.insert("verbose".to_string(), CwlValue::Bool(true));
        let mut binding = positioned(1);
        binding.prefix = Some("-v".to_string());
        let mut bindings = HashMap::new();
        bindings.insert("verbose".to_string(), binding);
        let evaluator = Evaluator::default();
        let result = build_command(&t, &inputs, &bindings, &serde_json::json!({}), &evaluator).unwrap();
        assert_eq!(result.command, vec!["tool".to_string(), "-v".to_string()]);
    }

    #[test]
    fn boolean_false_never_appears() {
        let t = tool(&["tool"]);
        let mut inputs = HashMap::new();
        inputs.insert("verbose".to_string(), CwlValue::Bool(false));
        let mut binding = positioned(1);
        binding.prefix = Some("-v".to_string());
        let mut bindings = HashMap::new();
        bindings.insert("verbose".to_string(), binding);
        let evaluator = Evaluator::default();
        let result = build_command(&t, &inputs, &bindings, &serde_json::json!({}), &evaluator).unwrap();
        assert_eq!(result.command, vec!["tool".to_string()]);
    }

    #[test]
    fn arguments_precede_inputs_at_equal_position() {
        let mut t = tool(&["tool"]);
        t.arguments.push(Value::String("fixed-arg".to_string()));
        let mut inputs = HashMap::new();
        inputs.insert("x".to_string(), CwlValue::String("val".into()));
        let mut bindings = HashMap::new();
        bindings.insert("x".to_string(), positioned(0));
        let evaluator = Evaluator::default();
        let result = build_command(&t, &inputs, &bindings, &serde_json::json!({}), &evaluator).unwrap();
        assert_eq!(result.command, vec!["tool".to_string(), "fixed-arg".to_string(), "val".to_string()]);
    }

    #[test]
    fn array_input_without_item_separator_emits_prefix_once() {
        let t = tool(&["tool"]);
        let mut inputs = HashMap::new();
        inputs.insert(
            "items".to_string(),
            CwlValue::Array(vec![CwlValue::String("a".into()), CwlValue::String("b".into())]),
        );
        let mut binding = positioned(1);
        binding.prefix = Some("-I".to_string());
        let mut bindings = HashMap::new();
        bindings.insert("items".to_string(), binding);
        let evaluator = Evaluator::default();
        let result = build_command(&t, &inputs, &bindings, &serde_json::json!({}), &evaluator).unwrap();
        assert_eq!(
            result.command,
            vec!["tool".to_string(), "-I".to_string(), "a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn join_for_shell_quotes_only_when_needed() {
        let command = vec!["echo".to_string(), "hello world".to_string(), "plain".to_string()];
        let shell_quote = vec![true, true, true];
        assert_eq!(join_for_shell(&command, &shell_quote), "echo 'hello world' plain");
    }

    #[test]
    fn command_build_is_deterministic() {
        let t = tool(&["tool"]);
        let mut inputs = HashMap::new();
        inputs.insert("a".to_string(), CwlValue::String("1".into()));
        inputs.insert("b".to_string(), CwlValue::String("2".into()));
        let mut bindings = HashMap::new();
        bindings.insert("a".to_string(), positioned(1));
        bindings.insert("b".to_string(), positioned(1));
        let evaluator = Evaluator::default();
        let r1 = build_command(&t, &inputs, &bindings, &serde_json::json!({}), &evaluator).unwrap();
        let r2 = build_command(&t, &inputs, &bindings, &serde_json::json!({}), &evaluator).unwrap();
        assert_eq!(r1, r2);
    }
}
