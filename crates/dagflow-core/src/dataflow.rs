//! Fan-out group materialization (§4.5).
//!
//! A `split` opens a group; the executor replays every node between the
//! opener and its closing `aggregate` once per surviving array element. This
//! module resolves that nesting once, at plan time, the same "resolve
//! structure once, replay per unit at execution time" split the teacher
//! uses between `WorkflowEngine::resolve_order` (computed once) and
//! per-node dispatch (replayed every run). `foreach` is sugar handled
//! entirely inside its own handler and never opens a stack-tracked group.

use std::collections::BTreeMap;

use crate::document::NodeKind;
use crate::plan::Plan;

#[derive(Debug, Clone)]
pub struct FanOutGroup {
    pub id: usize,
    pub opener: String,
    pub item_name: String,
    pub parent: Option<usize>,
    /// Node ids belonging directly to this group, in topological order.
    /// Nested groups' openers appear here too; their own members do not.
    pub members: Vec<String>,
    pub closer: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DataflowPlan {
    pub groups: Vec<FanOutGroup>,
    /// node id -> id of the innermost group it is a direct member of.
    pub member_group: BTreeMap<String, usize>,
}

impl DataflowPlan {
    pub fn group(&self, id: usize) -> &FanOutGroup {
        &self.groups[id]
    }

    pub fn top_level_nodes<'a>(&self, plan: &'a Plan) -> Vec<&'a str> {
        plan.order
            .iter()
            .map(String::as_str)
            .filter(|n| !self.member_group.contains_key(*n))
            .collect()
    }
}

/// Build the fan-out group structure for `plan` by walking its declaration-
/// ordered topological order with a stack: a `split` pushes a new group, an
/// `aggregate` pops the innermost open one. Every other node is recorded
/// against the currently open group, if any.
pub fn build(plan: &Plan) -> DataflowPlan {
    let mut groups: Vec<FanOutGroup> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut member_group: BTreeMap<String, usize> = BTreeMap::new();

    for node_id in &plan.order {
        let node = match plan.node(node_id) {
            Some(n) => n,
            None => continue,
        };

        if node.kind == NodeKind::Split {
            let parent = stack.last().copied();
            if let Some(parent_id) = parent {
                groups[parent_id].members.push(node_id.clone());
                member_group.insert(node_id.clone(), parent_id);
            }
            let item_name = plan
                .loop_binders
                .get(node_id)
                .cloned()
                .unwrap_or_else(|| "item".to_string());
            let group_id = groups.len();
            groups.push(FanOutGroup {
                id: group_id,
                opener: node_id.clone(),
                item_name,
                parent,
                members: Vec::new(),
                closer: None,
            });
            stack.push(group_id);
            continue;
        }

        if node.kind == NodeKind::Aggregate {
            if let Some(group_id) = stack.pop() {
                groups[group_id].closer = Some(node_id.clone());
                if let Some(parent_id) = stack.last().copied() {
                    groups[parent_id].members.push(node_id.clone());
                    member_group.insert(node_id.clone(), parent_id);
                }
                continue;
            }
        }

        if let Some(group_id) = stack.last().copied() {
            groups[group_id].members.push(node_id.clone());
            member_group.insert(node_id.clone(), group_id);
        }
    }

    DataflowPlan { groups, member_group }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use crate::plan;

    fn build_plan(text: &str) -> Plan {
        plan::validate(document::parse(text).unwrap()).unwrap()
    }

    #[test]
    fn split_and_aggregate_form_one_group() {
        let plan = build_plan(
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
id = "score"
kind = "transform"
depends_on = ["split_companies"]
[nodes.config]
template = "{{ company.rev }}"

[[nodes]]
id = "collect"
kind = "aggregate"
depends_on = ["score"]
[nodes.config]
mode = "array"
"#,
        );
        let dataflow = build(&plan);
        assert_eq!(dataflow.groups.len(), 1);
        let group = &dataflow.groups[0];
        assert_eq!(group.opener, "split_companies");
        assert_eq!(group.closer.as_deref(), Some("collect"));
        assert_eq!(group.members, vec!["score".to_string()]);
        assert_eq!(dataflow.member_group.get("score"), Some(&0));
    }

    #[test]
    fn nested_groups_track_parent() {
        let plan = build_plan(
            r#"
name = "demo"
version = "1.0.0"

[[nodes]]
id = "outer_split"
kind = "split"
[nodes.config]
field = "{{ inputs.a }}"

[[nodes]]
id = "inner_split"
kind = "split"
depends_on = ["outer_split"]
[nodes.config]
field = "{{ outer_split }}"

[[nodes]]
id = "inner_agg"
kind = "aggregate"
depends_on = ["inner_split"]
[nodes.config]
mode = "array"

[[nodes]]
id = "outer_agg"
kind = "aggregate"
depends_on = ["inner_agg"]
[nodes.config]
mode = "array"

[inputs.a]
type = "array"
required = true
"#,
        );
        let dataflow = build(&plan);
        assert_eq!(dataflow.groups.len(), 2);
        let inner = dataflow.groups.iter().find(|g| g.opener == "inner_split").unwrap();
        assert_eq!(inner.parent, Some(0));
        assert_eq!(inner.closer.as_deref(), Some("inner_agg"));
    }
}
