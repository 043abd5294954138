//! Pre-flight validation and the topologically ordered [`Plan`] the
//! executor runs against.
//!
//! Mirrors the teacher's `config::validate` shape: every pass collects its
//! own errors into a shared `Vec` rather than failing on the first one
//! (§4.1), and the ordering step generalizes `WorkflowEngine::resolve_order`'s
//! level-by-level topological sort to the richer edge set this engine needs
//! (explicit `depends_on` plus the implicit edges a node's `config`
//! templates induce by referencing another node's output).

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::document::{Document, InputType, NodeDecl, NodeKind};
use crate::template::{self, Expr, PathSegment, Template, TemplateNode};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("node '{node}' depends on unknown node '{depends_on}'")]
    UnknownDependency { node: String, depends_on: String },

    #[error("node '{node}' depends on itself")]
    SelfDependency { node: String },

    #[error("node '{node}' field '{field}' references unknown name '{reference}'")]
    UnknownReference {
        node: String,
        field: String,
        reference: String,
    },

    #[error("node '{node}' field '{field}' has an invalid template: {message}")]
    TemplateSyntax {
        node: String,
        field: String,
        message: String,
    },

    #[error("dependency cycle among nodes: {}", .nodes.join(" -> "))]
    Cycle { nodes: Vec<String> },

    #[error("node '{node}' ({kind}) is missing required config field '{field}'")]
    MissingConfigField {
        node: String,
        kind: &'static str,
        field: &'static str,
    },

    #[error("node '{node}' ({kind}) field '{field}': {message}")]
    InvalidConfigField {
        node: String,
        kind: &'static str,
        field: &'static str,
        message: String,
    },

    #[error("input '{input}' default value does not match declared type '{expected}'")]
    InputDefaultTypeMismatch { input: String, expected: &'static str },
}

/// A topologically validated, orderable view of a [`Document`].
#[derive(Debug, Clone)]
pub struct Plan {
    pub document: Document,
    /// Declaration-order-tie-broken topological order over the combined
    /// (explicit + implicit reference) dependency graph.
    pub order: Vec<String>,
    /// node -> nodes it depends on (explicit `depends_on` union implicit
    /// template-reference edges to other node names).
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// node -> nodes that depend on it (reverse of `dependencies`).
    pub dependents: BTreeMap<String, Vec<String>>,
    /// Item-binding name each `split`/`foreach` node introduces into scope
    /// for its fan-out group (defaulting to `"item"`), keyed by that
    /// node's id. Consulted by [`crate::dataflow`] when materializing
    /// fan-out groups.
    pub loop_binders: BTreeMap<String, String>,
}

impl Plan {
    pub fn node(&self, id: &str) -> Option<&NodeDecl> {
        self.document.node(id)
    }
}

/// Validate `document` and, if it is well-formed, build its [`Plan`].
///
/// All validation passes run to completion and collect every error found;
/// this never fail-fasts on the first problem.
pub fn validate(document: Document) -> Result<Plan, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let node_ids: HashSet<&str> = document.node_names().collect();

    let loop_binders = collect_loop_binders(&document);
    let mut known_names: HashSet<String> = loop_binders.values().cloned().collect();
    known_names.insert("item".to_string());
    known_names.insert("loop".to_string());

    // Pass 1: depends_on reference resolution + self-dependency.
    for node in &document.nodes {
        for dep in &node.depends_on {
            if dep == &node.id {
                errors.push(ValidationError::SelfDependency { node: node.id.clone() });
            } else if !node_ids.contains(dep.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    node: node.id.clone(),
                    depends_on: dep.clone(),
                });
            }
        }
    }

    // Pass 1 (continued): template references inside `config`.
    let mut implicit_edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for node in &document.nodes {
        let mut heads: BTreeSet<String> = BTreeSet::new();
        walk_config_templates(&node.id, &node.config, String::new(), &mut |field, text| {
            match template::parse_template(text) {
                Ok(tpl) => collect_template_heads(&tpl, &mut heads),
                Err(e) => errors.push(ValidationError::TemplateSyntax {
                    node: node.id.clone(),
                    field: field.to_string(),
                    message: e.to_string(),
                }),
            }
        });

        for head in &heads {
            if head == "env" || head == "inputs" || known_names.contains(head) {
                continue;
            }
            if node_ids.contains(head.as_str()) {
                if head != &node.id {
                    implicit_edges
                        .entry(node.id.clone())
                        .or_default()
                        .insert(head.clone());
                }
                continue;
            }
            errors.push(ValidationError::UnknownReference {
                node: node.id.clone(),
                field: "config".to_string(),
                reference: head.clone(),
            });
        }
    }

    // Pass 2: cycle detection over the combined edge set.
    let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for node in &document.nodes {
        let mut deps: BTreeSet<String> = node.depends_on.iter().cloned().collect();
        if let Some(implicit) = implicit_edges.get(&node.id) {
            deps.extend(implicit.iter().cloned());
        }
        dependencies.insert(node.id.clone(), deps.into_iter().collect());
    }

    if let Some(cycle) = find_cycle(&document, &dependencies) {
        errors.push(ValidationError::Cycle { nodes: cycle });
    }

    // Pass 3: kind-specific config shape checks.
    for node in &document.nodes {
        errors.extend(check_shape(node));
    }

    // Pass 4: input default type checks.
    for (name, decl) in &document.inputs {
        if !decl.required {
            if let Some(default) = &decl.default {
                if !decl.type_.matches(default) {
                    errors.push(ValidationError::InputDefaultTypeMismatch {
                        input: name.clone(),
                        expected: decl.type_.label(),
                    });
                }
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let order = topological_order(&document, &dependencies);
    let mut dependents: BTreeMap<String, Vec<String>> =
        document.node_names().map(|n| (n.to_string(), Vec::new())).collect();
    for (node, deps) in &dependencies {
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(node.clone());
        }
    }

    Ok(Plan {
        document,
        order,
        dependencies,
        dependents,
        loop_binders,
    })
}

fn collect_loop_binders(document: &Document) -> BTreeMap<String, String> {
    let mut binders = BTreeMap::new();
    for node in &document.nodes {
        if matches!(node.kind, NodeKind::Split | NodeKind::Foreach) {
            let item_name = node
                .config
                .get("item_name")
                .and_then(JsonValue::as_str)
                .unwrap_or("item")
                .to_string();
            binders.insert(node.id.clone(), item_name);
        }
    }
    binders
}

/// Walk every string leaf in a node's `config` JSON value, invoking `f`
/// with a dotted path describing where it was found (for error messages)
/// and the raw string (a candidate template source).
fn walk_config_templates(
    _node_id: &str,
    value: &JsonValue,
    path: String,
    f: &mut impl FnMut(&str, &str),
) {
    match value {
        JsonValue::String(s) => f(&path, s),
        JsonValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let child_path = if path.is_empty() {
                    format!("[{i}]")
                } else {
                    format!("{path}[{i}]")
                };
                walk_config_templates(_node_id, item, child_path, f);
            }
        }
        JsonValue::Object(map) => {
            for (k, v) in map {
                let child_path = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                walk_config_templates(_node_id, v, child_path, f);
            }
        }
        _ => {}
    }
}

fn collect_template_heads(template: &Template, out: &mut BTreeSet<String>) {
    for node in template {
        match node {
            TemplateNode::Text(_) => {}
            TemplateNode::Expr(expr) => collect_expr_heads(expr, out),
            TemplateNode::If(branches, else_body) => {
                for (cond, body) in branches {
                    collect_expr_heads(cond, out);
                    collect_template_heads(body, out);
                }
                if let Some(body) = else_body {
                    collect_template_heads(body, out);
                }
            }
        }
    }
}

fn collect_expr_heads(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::Str(_) => {}
        Expr::Path(segments) => {
            if let Some(PathSegment::Ident(head)) = segments.first() {
                out.insert(head.clone());
            }
        }
        Expr::Unary(_, inner) => collect_expr_heads(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_expr_heads(lhs, out);
            collect_expr_heads(rhs, out);
        }
        Expr::Filter(inner, _, args) => {
            collect_expr_heads(inner, out);
            for arg in args {
                collect_expr_heads(arg, out);
            }
        }
    }
}

fn find_cycle(document: &Document, dependencies: &BTreeMap<String, Vec<String>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = document
        .node_names()
        .map(|n| (n, Mark::Unvisited))
        .collect();
    let mut stack: Vec<String> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        dependencies: &'a BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].to_vec();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            _ => {}
        }

        marks.insert(node, Mark::InProgress);
        stack.push(node.to_string());

        if let Some(deps) = dependencies.get(node) {
            for dep in deps {
                if let Some(cycle) = visit(dep, dependencies, marks, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    for id in document.node_names() {
        if let Some(cycle) = visit(id, dependencies, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Kahn's algorithm, breaking ties among simultaneously-ready nodes by
/// declaration order (§4.6).
fn topological_order(
    document: &Document,
    dependencies: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let declaration_index: BTreeMap<&str, usize> = document
        .node_names()
        .enumerate()
        .map(|(i, n)| (n, i))
        .collect();

    let mut indegree: BTreeMap<&str, usize> = document
        .node_names()
        .map(|n| (n, dependencies.get(n).map(|d| d.len()).unwrap_or(0)))
        .collect();

    let mut dependents: BTreeMap<&str, Vec<&str>> =
        document.node_names().map(|n| (n, Vec::new())).collect();
    for (node, deps) in dependencies {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut order = Vec::with_capacity(document.nodes.len());
    loop {
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(n, count)| **count == 0 && !order.contains(&n.to_string()))
            .map(|(n, _)| *n)
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort_by_key(|n| declaration_index[n]);
        let next = ready[0];
        order.push(next.to_string());
        indegree.insert(next, usize::MAX);
        if let Some(succs) = dependents.get(next) {
            for succ in succs.clone() {
                if let Some(count) = indegree.get_mut(succ) {
                    if *count != usize::MAX && *count > 0 {
                        *count -= 1;
                    }
                }
            }
        }
    }

    order
}

fn get_str<'a>(config: &'a JsonValue, field: &str) -> Option<&'a str> {
    config.get(field).and_then(JsonValue::as_str)
}

fn missing(node: &str, kind: &'static str, field: &'static str) -> ValidationError {
    ValidationError::MissingConfigField {
        node: node.to_string(),
        kind,
        field,
    }
}

fn invalid(node: &str, kind: &'static str, field: &'static str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfigField {
        node: node.to_string(),
        kind,
        field,
        message: message.into(),
    }
}

const HTTP_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];
const AUTH_KINDS: [&str; 3] = ["bearer", "basic", "none"];
const FILE_FORMATS: [&str; 4] = ["json", "yaml", "text", "bytes"];
const AGGREGATE_MODES: [&str; 4] = ["array", "object", "concat", "sum"];

/// Whether a literal-typed string field is "actually a template" and so
/// exempt from enum-literal checking until render time.
fn looks_like_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

fn check_shape(node: &NodeDecl) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let cfg = &node.config;
    let kind = node.kind.label();

    match node.kind {
        NodeKind::Llm => {
            if cfg.get("prompt").is_none() && cfg.get("prompt_template").is_none() {
                errors.push(missing(&node.id, kind, "prompt"));
            }
            if get_str(cfg, "model").is_none() {
                errors.push(missing(&node.id, kind, "model"));
            }
            if let Some(schema) = cfg.get("schema") {
                if !schema.is_object() {
                    errors.push(invalid(&node.id, kind, "schema", "must be an object"));
                }
            }
        }
        NodeKind::Http => {
            match get_str(cfg, "url") {
                None => errors.push(missing(&node.id, kind, "url")),
                Some(url) if !looks_like_template(url) && !url.starts_with("http://") && !url.starts_with("https://") => {
                    errors.push(invalid(&node.id, kind, "url", "must start with http:// or https://"));
                }
                Some(_) => {}
            }
            if let Some(method) = get_str(cfg, "method") {
                if !looks_like_template(method) && !HTTP_METHODS.contains(&method) {
                    errors.push(invalid(
                        &node.id,
                        kind,
                        "method",
                        format!("must be one of {HTTP_METHODS:?}"),
                    ));
                }
            }
            if let Some(auth) = get_str(cfg, "auth") {
                if !looks_like_template(auth) && !AUTH_KINDS.contains(&auth) {
                    errors.push(invalid(
                        &node.id,
                        kind,
                        "auth",
                        format!("must be one of {AUTH_KINDS:?}"),
                    ));
                }
            }
        }
        NodeKind::Route => match cfg.get("routes").and_then(JsonValue::as_array) {
            None => errors.push(missing(&node.id, kind, "routes")),
            Some(routes) if routes.is_empty() => {
                errors.push(invalid(&node.id, kind, "routes", "must be non-empty"))
            }
            Some(routes) => {
                for (i, route) in routes.iter().enumerate() {
                    let has_when = route.get("when").is_some();
                    let is_default = route
                        .get("is_default")
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(false);
                    if has_when == is_default {
                        errors.push(invalid(
                            &node.id,
                            kind,
                            "routes",
                            format!("routes[{i}] must set exactly one of 'when'/'is_default'"),
                        ));
                    }
                    if route.get("to").is_none() && route.get("then").is_none() {
                        errors.push(invalid(
                            &node.id,
                            kind,
                            "routes",
                            format!("routes[{i}] is missing a 'to' target"),
                        ));
                    }
                }
            }
        },
        NodeKind::File => {
            if cfg.get("path").is_none() && cfg.get("pattern").is_none() {
                errors.push(missing(&node.id, kind, "path"));
            }
            match get_str(cfg, "format") {
                None => errors.push(missing(&node.id, kind, "format")),
                Some(fmt) if !looks_like_template(fmt) && !FILE_FORMATS.contains(&fmt) => errors
                    .push(invalid(
                        &node.id,
                        kind,
                        "format",
                        format!("must be one of {FILE_FORMATS:?}"),
                    )),
                _ => {}
            }
            if let Some(mode) = get_str(cfg, "mode") {
                if !looks_like_template(mode) && mode != "read" && mode != "write" {
                    errors.push(invalid(&node.id, kind, "mode", "must be 'read' or 'write'"));
                }
                if mode == "write" && cfg.get("content").is_none() {
                    errors.push(missing(&node.id, kind, "content"));
                }
            }
        }
        NodeKind::Script => {
            if cfg.get("code").is_none() && cfg.get("file").is_none() {
                errors.push(missing(&node.id, kind, "code"));
            }
        }
        NodeKind::Split => {
            if cfg.get("field").is_none() {
                errors.push(missing(&node.id, kind, "field"));
            }
        }
        NodeKind::Filter => {
            if cfg.get("condition").is_none() {
                errors.push(missing(&node.id, kind, "condition"));
            }
        }
        NodeKind::Transform => {
            if cfg.get("template").is_none() {
                errors.push(missing(&node.id, kind, "template"));
            }
        }
        NodeKind::Aggregate => match get_str(cfg, "mode") {
            None => errors.push(missing(&node.id, kind, "mode")),
            Some(mode) if !looks_like_template(mode) && !AGGREGATE_MODES.contains(&mode) => errors
                .push(invalid(
                    &node.id,
                    kind,
                    "mode",
                    format!("must be one of {AGGREGATE_MODES:?}"),
                )),
            Some("object") if cfg.get("key").is_none() => {
                errors.push(missing(&node.id, kind, "key"))
            }
            _ => {}
        },
        NodeKind::Join => match cfg.get("sources").and_then(JsonValue::as_array) {
            None => errors.push(missing(&node.id, kind, "sources")),
            Some(sources) if sources.is_empty() => {
                errors.push(invalid(&node.id, kind, "sources", "must be non-empty"))
            }
            _ => {}
        },
        NodeKind::Foreach => {
            if cfg.get("field").is_none() {
                errors.push(missing(&node.id, kind, "field"));
            }
            if cfg.get("template").is_none() {
                errors.push(missing(&node.id, kind, "template"));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;

    fn doc(text: &str) -> Document {
        document::parse(text).unwrap()
    }

    #[test]
    fn valid_document_produces_declaration_order_plan() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "transform"
[nodes.config]
template = "1"

[[nodes]]
id = "b"
kind = "transform"
depends_on = ["a"]
[nodes.config]
template = "{{ a }}"
"#,
        );
        let plan = validate(d).unwrap();
        assert_eq!(plan.order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn unknown_depends_on_is_reported() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "transform"
depends_on = ["missing"]
[nodes.config]
template = "1"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownDependency { .. })));
    }

    #[test]
    fn self_dependency_is_reported() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "transform"
depends_on = ["a"]
[nodes.config]
template = "1"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::SelfDependency { .. })));
    }

    #[test]
    fn cycle_via_implicit_template_reference_is_detected() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "transform"
[nodes.config]
template = "{{ b }}"

[[nodes]]
id = "b"
kind = "transform"
[nodes.config]
template = "{{ a }}"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Cycle { .. })));
    }

    #[test]
    fn unknown_reference_in_template_is_reported() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "transform"
[nodes.config]
template = "{{ nonexistent_thing }}"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownReference { .. })));
    }

    #[test]
    fn http_missing_url_is_reported() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "http"
[nodes.config]
method = "GET"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::MissingConfigField { field: "url", .. })));
    }

    #[test]
    fn http_invalid_method_literal_is_reported() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "http"
[nodes.config]
url = "https://example.com"
method = "NOPE"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidConfigField { field: "method", .. })));
    }

    #[test]
    fn http_non_http_scheme_literal_is_reported() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "http"
[nodes.config]
url = "ftp://example.com"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidConfigField { field: "url", .. })));
    }

    #[test]
    fn http_templated_url_skips_scheme_check() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[inputs.endpoint]
type = "string"
required = true

[[nodes]]
id = "a"
kind = "http"
[nodes.config]
url = "{{ inputs.endpoint }}"
"#,
        );
        assert!(validate(d).is_ok());
    }

    #[test]
    fn route_requires_exactly_one_of_when_or_default() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "a"
kind = "route"

[[nodes.config.routes]]
to = "x"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidConfigField { field: "routes", .. })));
    }

    #[test]
    fn input_default_type_mismatch_is_reported() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[inputs.count]
type = "number"
default = "not a number"

[[nodes]]
id = "a"
kind = "transform"
[nodes.config]
template = "1"
"#,
        );
        let errors = validate(d).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InputDefaultTypeMismatch { .. })));
    }

    #[test]
    fn loop_binding_reference_inside_split_group_is_accepted() {
        let d = doc(
            r#"
name = "demo"
version = "1.0.0"

[inputs.companies]
type = "array"
required = true

[[nodes]]
id = "split_companies"
kind = "split"
[nodes.config]
field = "{{ inputs.companies }}"
item_name = "company"

[[nodes]]
id = "use_item"
kind = "transform"
depends_on = ["split_companies"]
[nodes.config]
template = "{{ company.name }}"
"#,
        );
        assert!(validate(d).is_ok());
    }
}
