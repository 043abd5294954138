//! Hand-rolled template engine for `{{ expr }}` / `{% if %}` document text.
//!
//! No external templating crate is used: the grammar is narrow (a single
//! filter pipeline, dotted/indexed paths, `if/elif/else/endif` blocks) and a
//! small lexer/parser/evaluator triple is easier to keep correct than
//! bending a general-purpose engine to fit.

mod ast;
mod eval;
mod filters;
mod lexer;
mod parser;

pub use ast::{BinOp, Expr, PathSegment, Template, TemplateNode, UnaryOp};
pub use eval::{truthy, EvalError, Lookup};
pub use lexer::LexError;
pub use parser::{parse_expr, parse_template, TemplateParseError};

use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Parse(#[from] TemplateParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Render a raw document string (containing zero or more `{{ }}` / `{% %}`
/// tags) against `env`.
///
/// Per §4.2: if the whole template is exactly one `{{ expr }}` tag with no
/// surrounding text, the expression's native JSON type is preserved.
/// Otherwise the result is a string: each `{{ expr }}` tag is stringified
/// and spliced into the surrounding text.
pub fn render(src: &str, env: &dyn Lookup) -> Result<JsonValue, RenderError> {
    let template = parse_template(src)?;
    render_parsed(&template, env)
}

pub fn render_parsed(template: &Template, env: &dyn Lookup) -> Result<JsonValue, RenderError> {
    if let Some(expr) = ast::as_bare_expr(template) {
        return Ok(eval::eval(expr, env)?);
    }

    let mut out = String::new();
    render_nodes(template, env, &mut out)?;
    Ok(JsonValue::String(out))
}

fn render_nodes(nodes: &[TemplateNode], env: &dyn Lookup, out: &mut String) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            TemplateNode::Text(text) => out.push_str(text),
            TemplateNode::Expr(expr) => {
                let value = eval::eval(expr, env)?;
                out.push_str(&stringify(&value));
            }
            TemplateNode::If(branches, else_body) => {
                let mut matched = false;
                for (cond, body) in branches {
                    let value = eval::eval(cond, env)?;
                    if truthy(&value) {
                        render_nodes(body, env, out)?;
                        matched = true;
                        break;
                    }
                }
                if !matched {
                    if let Some(body) = else_body {
                        render_nodes(body, env, out)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Stringify a JSON value for splicing into mixed text. `null` becomes the
/// empty string (the undefined-value rule, §4.2); strings pass through
/// unquoted; everything else uses its compact JSON form.
pub fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
