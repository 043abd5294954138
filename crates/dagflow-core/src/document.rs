//! The parsed, static shape of a workflow document.
//!
//! Documents are authored as TOML. Nodes are declared as an array of
//! tables (`[[nodes]]`), the same ordered-array-of-tables idiom TOML
//! itself uses for e.g. Cargo's `[[bin]]` — this keeps declaration order
//! available to the executor (§4.6 tie-breaking) without reaching for an
//! order-preserving map type the rest of the crate's dependency stack
//! doesn't otherwise need. `inputs` and `outputs` stay ordinary TOML
//! tables since the spec does not attach meaning to their order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Errors produced while parsing a document's text into a [`Document`].
///
/// Distinct from [`crate::plan::ValidationError`]: parse errors mean the
/// text itself is malformed; validation errors mean a well-formed document
/// does not satisfy the engine's semantic invariants.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to parse document: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("duplicate output name '{0}'")]
    DuplicateOutput(String),

    #[error("{0}")]
    Invalid(String),
}

/// Declared type of a workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl InputType {
    /// Whether a JSON value's runtime shape matches this declared type.
    pub fn matches(&self, value: &JsonValue) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Object => value.is_object(),
            InputType::Array => value.is_array(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Object => "object",
            InputType::Array => "array",
        }
    }
}

/// Declaration of a single workflow input.
///
/// Invariant: if `required` is true, `default` is ignored; otherwise
/// `default`'s JSON shape must match `type` (checked by the validator,
/// §4.1 pass 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDecl {
    #[serde(rename = "type")]
    pub type_: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The kind of operation a node performs.
///
/// Accepts the spec's documented aliases (`conditional` for `route`,
/// `python` for `script`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Llm,
    Http,
    #[serde(alias = "conditional")]
    Route,
    File,
    #[serde(alias = "python")]
    Script,
    Split,
    Filter,
    Transform,
    Aggregate,
    Join,
    Foreach,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Llm => "llm",
            NodeKind::Http => "http",
            NodeKind::Route => "route",
            NodeKind::File => "file",
            NodeKind::Script => "script",
            NodeKind::Split => "split",
            NodeKind::Filter => "filter",
            NodeKind::Transform => "transform",
            NodeKind::Aggregate => "aggregate",
            NodeKind::Join => "join",
            NodeKind::Foreach => "foreach",
        }
    }

    /// Whether this kind is one of the data-flow operators of §4.5.
    pub fn is_dataflow(&self) -> bool {
        matches!(
            self,
            NodeKind::Split
                | NodeKind::Filter
                | NodeKind::Transform
                | NodeKind::Aggregate
                | NodeKind::Join
                | NodeKind::Foreach
        )
    }
}

/// Declaration of a single workflow node.
///
/// Invariant: every name in `depends_on` refers to another declared node;
/// self-reference is forbidden (checked by the validator, §4.1 pass 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDecl {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form kind-specific configuration, projected into a typed
    /// parameter record at plan time (§9).
    #[serde(default = "empty_object")]
    pub config: JsonValue,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub skip_errors: bool,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(serde_json::Map::new())
}

/// A named, versioned workflow document.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub inputs: BTreeMap<String, InputDecl>,
    /// Declaration order preserved; used by the executor for deterministic
    /// tie-breaking among simultaneously-ready nodes (§4.6).
    pub nodes: Vec<NodeDecl>,
    pub outputs: BTreeMap<String, String>,
}

impl Document {
    pub fn node(&self, id: &str) -> Option<&NodeDecl> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    inputs: BTreeMap<String, InputDecl>,
    #[serde(default)]
    nodes: Vec<NodeDecl>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
}

/// Parse a document's TOML text into a [`Document`].
///
/// This is a purely syntactic step: name uniqueness among `nodes` and
/// `outputs` is checked here (TOML tables already reject duplicate keys
/// for `inputs`/`outputs` at the parser level, but `nodes` is an array so
/// duplicate `id`s must be checked explicitly). All semantic checks
/// (reference resolution, cycles, shapes) belong to [`crate::plan::validate`].
pub fn parse(text: &str) -> Result<Document, ParseError> {
    let raw: RawDocument = toml::from_str(text)?;

    let mut seen_nodes = std::collections::HashSet::new();
    for node in &raw.nodes {
        if !seen_nodes.insert(node.id.clone()) {
            return Err(ParseError::DuplicateNode(node.id.clone()));
        }
    }

    Ok(Document {
        name: raw.name,
        version: raw.version,
        description: raw.description,
        inputs: raw.inputs,
        nodes: raw.nodes,
        outputs: raw.outputs,
    })
}
