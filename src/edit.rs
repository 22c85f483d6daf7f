//! Source-to-source rewrites.
//!
//! Every operation parses the current text, rewrites the tree and serialises it
//! again. A failed precondition is reported as a [`Rejection`]; the caller's
//! buffer is never touched in that case.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diagram::{Diagram, Edge, Header, LinkFate, NodeRef, ParseError, Statement, Subgraph};
use crate::utils::sanitize_id_stem;
use crate::{EdgeKind, NodeKind, NodeShape};

pub const NODE_ID_STEM: &str = "node";
pub const GROUP_ID_STEM: &str = "group";
pub const MIN_GROUP_SIZE: usize = 2;

/// A successfully applied rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edit {
    pub source: String,
    /// Ids introduced by the operation (new nodes, new subgraph).
    pub created: Vec<String>,
    /// Links left pointing at ids that no longer have a declaration.
    pub dangling: Vec<Edge>,
}

pub type EditResult = Result<Edit, Rejection>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("diagram source could not be parsed: {0}")]
    Parse(#[from] ParseError),
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    #[error("subgraph '{0}' not found")]
    SubgraphNotFound(String),
    #[error("node '{0}' has no declaration to rewrite")]
    NoDeclaration(String),
    #[error("select at least {required} nodes (got {got})")]
    TooFewNodes { required: usize, got: usize },
    #[error("selected nodes are not all in the same subgraph")]
    MixedScopes,
    #[error("name must not be empty")]
    EmptyName,
    #[error("a split needs at least one part")]
    EmptySplit,
    #[error("invalid split: {0}")]
    InvalidSplit(String),
    #[error("connection {0} already exists")]
    DuplicateConnection(Edge),
    #[error("connection {0} not found")]
    ConnectionNotFound(Edge),
}

/// Where a child node created by a drag ends up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Placement {
    /// Same scope as the parent node.
    #[default]
    WithParent,
    Root,
    Subgraph(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitPart {
    pub name: String,
    #[serde(default)]
    pub receives_input: bool,
    #[serde(default)]
    pub provides_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitLink {
    pub from_index: usize,
    pub to_index: usize,
    #[serde(default)]
    pub kind: EdgeKind,
}

/// Ordered replacement for one node. Without explicit links the parts are
/// chained in order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitPlan {
    pub parts: Vec<SplitPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<SplitLink>>,
}

impl SplitPlan {
    pub fn sequential<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: names
                .into_iter()
                .map(|name| SplitPart {
                    name: name.into(),
                    receives_input: false,
                    provides_output: false,
                })
                .collect(),
            links: None,
        }
    }

    /// Part that takes over the node's incoming links.
    pub fn input_index(&self) -> usize {
        self.parts
            .iter()
            .position(|part| part.receives_input)
            .unwrap_or(0)
    }

    pub fn output_index(&self) -> usize {
        self.parts
            .iter()
            .position(|part| part.provides_output)
            .unwrap_or(self.parts.len().saturating_sub(1))
    }
}

pub trait IdGenerator {
    fn next_id(&mut self, stem: &str) -> String;
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// `<stem>_<unix millis>`, never repeating a value within the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampIds;

impl IdGenerator for TimestampIds {
    fn next_id(&mut self, stem: &str) -> String {
        let now = Utc::now().timestamp_millis();
        let previous = LAST_TIMESTAMP
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        format!("{stem}_{}", now.max(previous + 1))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequentialIds {
    counter: usize,
}

impl IdGenerator for SequentialIds {
    fn next_id(&mut self, stem: &str) -> String {
        self.counter += 1;
        format!("{stem}_{}", self.counter)
    }
}

/// Collapses a result to the bare text, the caller's buffer on rejection.
pub fn or_unchanged(source: &str, result: EditResult) -> String {
    match result {
        Ok(edit) => edit.source,
        Err(_) => source.to_string(),
    }
}

pub fn add_node(source: &str, kind: NodeKind, ids: &mut dyn IdGenerator) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    if diagram.header.is_none() {
        diagram.header = Some(Header::default());
    }

    let mut taken = taken_ids(&diagram);
    let id = fresh_id(ids, NODE_ID_STEM, &mut taken);
    diagram.statements.push(Statement::Node(NodeRef::declared(
        &id,
        kind.default_label(),
        kind.shape(),
    )));

    Ok(finish(&diagram, vec![id]))
}

pub fn remove_node(source: &str, id: &str) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    require_node(&diagram, id)?;

    let dropped: HashSet<String> = HashSet::from([id.to_string()]);
    diagram.partition_links(
        |edge| {
            if edge.from == id || edge.to == id {
                LinkFate::Drop
            } else {
                LinkFate::Keep
            }
        },
        &dropped,
    );
    diagram.remove_node_lines(&dropped);

    Ok(finish(&diagram, Vec::new()))
}

/// Removes the first plain `from --> to` link, or appends one when there is none.
pub fn toggle_connection(source: &str, from: &str, to: &str) -> EditResult {
    let diagram = Diagram::parse(source)?;
    let edge = Edge::new(from, to, EdgeKind::Plain);
    if diagram.edges().iter().any(|existing| same_link(existing, &edge)) {
        remove_connection(source, from, to, EdgeKind::Plain)
    } else {
        add_connection(source, from, to, EdgeKind::Plain)
    }
}

pub fn add_connection(source: &str, from: &str, to: &str, kind: EdgeKind) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    require_node(&diagram, from)?;
    require_node(&diagram, to)?;

    let edge = Edge::new(from, to, kind);
    if diagram.edges().iter().any(|existing| same_link(existing, &edge)) {
        return Err(Rejection::DuplicateConnection(edge));
    }

    diagram.statements.push(Statement::chain(from, kind, to));
    Ok(finish(&diagram, Vec::new()))
}

pub fn remove_connection(source: &str, from: &str, to: &str, kind: EdgeKind) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    let target = Edge::new(from, to, kind);

    let mut matched = false;
    diagram.partition_links(
        |edge| {
            if !matched && same_link(edge, &target) {
                matched = true;
                LinkFate::Drop
            } else {
                LinkFate::Keep
            }
        },
        &HashSet::new(),
    );

    if !matched {
        return Err(Rejection::ConnectionNotFound(target));
    }
    Ok(finish(&diagram, Vec::new()))
}

/// Adds a process node linked from `parent`.
pub fn create_child_node(
    source: &str,
    parent: &str,
    placement: &Placement,
    ids: &mut dyn IdGenerator,
) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    let parent_info = diagram
        .find_node(parent)
        .ok_or_else(|| Rejection::NodeNotFound(parent.to_string()))?;

    let target_path = match placement {
        Placement::WithParent => parent_info.path.clone(),
        Placement::Root => Vec::new(),
        Placement::Subgraph(subgraph) => {
            let (mut path, _) = diagram
                .subgraph_position(subgraph)
                .ok_or_else(|| Rejection::SubgraphNotFound(subgraph.clone()))?;
            path.push(subgraph.clone());
            path
        }
    };

    let mut taken = taken_ids(&diagram);
    let child = fresh_id(ids, NODE_ID_STEM, &mut taken);
    let kind = NodeKind::Process;
    let link = Statement::chain(parent, EdgeKind::Plain, &child);
    let same_scope = target_path == parent_info.path;

    let scope = diagram
        .scope_mut(&target_path)
        .ok_or_else(|| Rejection::SubgraphNotFound(target_path.join("/")))?;
    scope.push(Statement::Node(NodeRef::declared(
        &child,
        kind.default_label(),
        kind.shape(),
    )));
    if same_scope {
        scope.push(link);
    } else {
        diagram.statements.push(link);
    }

    Ok(finish(&diagram, vec![child]))
}

pub fn change_node_shape(source: &str, id: &str, shape: NodeShape) -> EditResult {
    rewrite_declaration(source, id, |spec| spec.shape = shape, |id| NodeRef::declared(id, id, shape))
}

pub fn relabel_node(source: &str, id: &str, label: &str) -> EditResult {
    let label = label.trim();
    if label.is_empty() {
        return Err(Rejection::EmptyName);
    }
    let text = node_label(label);
    rewrite_declaration(
        source,
        id,
        |spec| spec.label = text.clone(),
        |id| NodeRef::declared(id, &text, NodeShape::Rect),
    )
}

fn rewrite_declaration(
    source: &str,
    id: &str,
    mut update: impl FnMut(&mut crate::diagram::NodeSpec),
    promote: impl Fn(&str) -> NodeRef,
) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    require_node(&diagram, id)?;

    let mut rewritten = 0;
    diagram.for_each_ref_mut(&mut |node| {
        if node.id == id {
            if let Some(spec) = node.spec.as_mut() {
                update(spec);
                rewritten += 1;
            }
        }
    });

    if rewritten == 0 {
        // A bare standalone line is a declaration without brackets.
        let location = diagram
            .locate(id)
            .filter(|location| location.standalone)
            .ok_or_else(|| Rejection::NoDeclaration(id.to_string()))?;
        if let Some(Statement::Node(node)) = diagram
            .scope_mut(&location.path)
            .and_then(|scope| scope.get_mut(location.index))
        {
            *node = promote(id);
        }
    }

    Ok(finish(&diagram, Vec::new()))
}

/// Moves the selected nodes and the links among them into a new subgraph.
pub fn wrap_in_subgraph(
    source: &str,
    node_ids: &[String],
    name: &str,
    ids: &mut dyn IdGenerator,
) -> EditResult {
    let mut diagram = Diagram::parse(source)?;

    let mut selected: Vec<&str> = Vec::new();
    for id in node_ids {
        if !selected.contains(&id.as_str()) {
            selected.push(id);
        }
    }
    if selected.len() < MIN_GROUP_SIZE {
        return Err(Rejection::TooFewNodes {
            required: MIN_GROUP_SIZE,
            got: selected.len(),
        });
    }

    let name = name.trim();
    if name.is_empty() {
        return Err(Rejection::EmptyName);
    }

    let mut paths = Vec::with_capacity(selected.len());
    for id in &selected {
        let location = diagram
            .locate(id)
            .ok_or_else(|| Rejection::NodeNotFound(id.to_string()))?;
        paths.push(location.path);
    }
    if paths.iter().any(|path| *path != paths[0]) {
        return Err(Rejection::MixedScopes);
    }
    let common_path = paths.swap_remove(0);

    let mut taken = taken_ids(&diagram);
    let stem = match sanitize_id_stem(name) {
        stem if stem.is_empty() => GROUP_ID_STEM.to_string(),
        stem => stem,
    };
    let group_id = fresh_id(ids, &stem, &mut taken);

    let mut block = Vec::new();
    for id in &selected {
        let spec = diagram.take_spec(id);
        block.push(Statement::Node(NodeRef {
            id: id.to_string(),
            spec,
        }));
    }

    let members: HashSet<String> = selected.iter().map(|id| id.to_string()).collect();
    diagram.remove_node_lines(&members);
    let inner = diagram.partition_links(
        |edge| {
            if members.contains(&edge.from) && members.contains(&edge.to) {
                LinkFate::Take
            } else {
                LinkFate::Keep
            }
        },
        &HashSet::new(),
    );
    block.extend(inner.into_iter().map(Statement::Chain));

    let subgraph = Statement::Subgraph(Subgraph {
        id: group_id.clone(),
        name: Some(subgraph_name(name)),
        statements: block,
    });

    let scope = diagram
        .scope_mut(&common_path)
        .ok_or_else(|| Rejection::SubgraphNotFound(common_path.join("/")))?;
    if common_path.is_empty() {
        let at = scope
            .iter()
            .position(|statement| !matches!(statement, Statement::Raw(_)))
            .unwrap_or(scope.len());
        scope.insert(at, subgraph);
    } else {
        scope.push(subgraph);
    }

    Ok(finish(&diagram, vec![group_id]))
}

/// Dissolves a subgraph, keeping its content in place one level up.
pub fn ungroup_subgraph(source: &str, subgraph_id: &str) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    let (path, index) = diagram
        .subgraph_position(subgraph_id)
        .ok_or_else(|| Rejection::SubgraphNotFound(subgraph_id.to_string()))?;

    let scope = diagram
        .scope_mut(&path)
        .ok_or_else(|| Rejection::SubgraphNotFound(subgraph_id.to_string()))?;
    if let Statement::Subgraph(subgraph) = scope.remove(index) {
        scope.splice(index..index, subgraph.statements);
    }

    Ok(finish(&diagram, Vec::new()))
}

/// Removes a subgraph with everything inside it. Links outside the block that
/// mention removed nodes are kept and reported as dangling.
pub fn delete_subgraph(source: &str, subgraph_id: &str) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    let (path, index) = diagram
        .subgraph_position(subgraph_id)
        .ok_or_else(|| Rejection::SubgraphNotFound(subgraph_id.to_string()))?;
    let members: HashSet<String> = diagram.subgraph_members(subgraph_id).into_iter().collect();

    if let Some(scope) = diagram.scope_mut(&path) {
        scope.remove(index);
    }

    let declared = diagram.declared_ids();
    let orphaned = |id: &String| members.contains(id) && !declared.contains(id);
    let dangling = diagram
        .edges()
        .into_iter()
        .filter(|edge| orphaned(&edge.from) || orphaned(&edge.to))
        .collect();

    let mut edit = finish(&diagram, Vec::new());
    edit.dangling = dangling;
    Ok(edit)
}

pub fn rename_subgraph(source: &str, subgraph_id: &str, name: &str) -> EditResult {
    let name = name.trim();
    if name.is_empty() {
        return Err(Rejection::EmptyName);
    }
    let mut diagram = Diagram::parse(source)?;
    let subgraph = diagram
        .subgraph_mut(subgraph_id)
        .ok_or_else(|| Rejection::SubgraphNotFound(subgraph_id.to_string()))?;
    subgraph.name = Some(subgraph_name(name));

    Ok(finish(&diagram, Vec::new()))
}

/// Replaces a node with the parts of `plan`. Incoming links move to the input
/// part, outgoing links leave from the output part.
pub fn split_node(
    source: &str,
    id: &str,
    plan: &SplitPlan,
    ids: &mut dyn IdGenerator,
) -> EditResult {
    let mut diagram = Diagram::parse(source)?;
    let location = diagram
        .locate(id)
        .ok_or_else(|| Rejection::NodeNotFound(id.to_string()))?;
    validate_plan(plan)?;

    let mut taken = taken_ids(&diagram);
    let stem = sanitize_id_stem(id);
    let part_ids: Vec<String> = plan
        .parts
        .iter()
        .map(|_| fresh_id(ids, &stem, &mut taken))
        .collect();

    let mut inserted: Vec<Statement> = plan
        .parts
        .iter()
        .zip(&part_ids)
        .map(|(part, part_id)| {
            Statement::Node(NodeRef::declared(
                part_id,
                &node_label(part.name.trim()),
                NodeShape::Rect,
            ))
        })
        .collect();

    match &plan.links {
        Some(links) => inserted.extend(links.iter().map(|link| {
            Statement::chain(&part_ids[link.from_index], link.kind, &part_ids[link.to_index])
        })),
        None => inserted.extend(
            part_ids
                .windows(2)
                .map(|pair| Statement::chain(&pair[0], EdgeKind::Plain, &pair[1])),
        ),
    }

    let scope = diagram
        .scope_mut(&location.path)
        .ok_or_else(|| Rejection::NodeNotFound(id.to_string()))?;
    let at = location.index.min(scope.len());
    scope.splice(at..at, inserted);

    diagram.reroute_node(
        id,
        &part_ids[plan.input_index()],
        &part_ids[plan.output_index()],
    );
    diagram.remove_node_lines(&HashSet::from([id.to_string()]));

    Ok(finish(&diagram, part_ids))
}

fn validate_plan(plan: &SplitPlan) -> Result<(), Rejection> {
    if plan.parts.is_empty() {
        return Err(Rejection::EmptySplit);
    }
    if let Some(index) = plan.parts.iter().position(|part| part.name.trim().is_empty()) {
        return Err(Rejection::InvalidSplit(format!("part {index} has no name")));
    }
    let count = plan.parts.len();
    for link in plan.links.iter().flatten() {
        if link.from_index >= count || link.to_index >= count {
            return Err(Rejection::InvalidSplit(format!(
                "link {} -> {} is out of range for {count} parts",
                link.from_index, link.to_index
            )));
        }
    }
    Ok(())
}

fn finish(diagram: &Diagram, created: Vec<String>) -> Edit {
    Edit {
        source: diagram.to_source(),
        created,
        dangling: Vec::new(),
    }
}

fn require_node(diagram: &Diagram, id: &str) -> Result<(), Rejection> {
    if diagram.contains_node(id) {
        Ok(())
    } else {
        Err(Rejection::NodeNotFound(id.to_string()))
    }
}

fn same_link(existing: &Edge, wanted: &Edge) -> bool {
    existing.from == wanted.from && existing.to == wanted.to && existing.kind == wanted.kind
}

fn taken_ids(diagram: &Diagram) -> HashSet<String> {
    diagram
        .node_ids()
        .map(str::to_string)
        .chain(diagram.subgraphs().into_iter().map(|info| info.id))
        .collect()
}

fn fresh_id(ids: &mut dyn IdGenerator, stem: &str, taken: &mut HashSet<String>) -> String {
    loop {
        let candidate = ids.next_id(stem);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
    }
}

/// Quotes labels that would otherwise close the bracket early.
fn node_label(label: &str) -> String {
    if label.contains(['[', ']', '(', ')', '{', '}', '|', '"']) {
        format!("\"{}\"", label.replace('"', "#quot;"))
    } else {
        label.to_string()
    }
}

fn subgraph_name(name: &str) -> String {
    name.replace('"', "#quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "graph LR\n    A[Start] --> B[Mid]\n    B --> C[End]\n";

    fn parsed(source: &str) -> Diagram {
        Diagram::parse(source).unwrap()
    }

    #[test]
    fn add_node_synthesises_header() {
        let edit = add_node("", NodeKind::Decision, &mut SequentialIds::default()).unwrap();
        assert_eq!(edit.source, "graph TD\n    node_1{判定}\n");
        assert_eq!(edit.created, vec!["node_1"]);
    }

    #[test]
    fn add_node_skips_taken_ids() {
        let source = "graph TD\n    node_1[taken]\n";
        let edit = add_node(source, NodeKind::Start, &mut SequentialIds::default()).unwrap();
        assert_eq!(edit.created, vec!["node_2"]);
        assert!(edit.source.ends_with("node_2(開始)\n"));
    }

    #[test]
    fn remove_node_drops_links_and_declaration() {
        let edit = remove_node(SAMPLE, "B").unwrap();
        assert_eq!(edit.source, "graph LR\n    A[Start]\n    C[End]\n");
    }

    #[test]
    fn remove_missing_node_is_rejected() {
        assert_eq!(
            remove_node(SAMPLE, "Z"),
            Err(Rejection::NodeNotFound("Z".into()))
        );
        assert_eq!(or_unchanged(SAMPLE, remove_node(SAMPLE, "Z")), SAMPLE);
    }

    #[test]
    fn remove_node_leaves_empty_subgraph() {
        let source = "graph TD\n    subgraph S [\"Only\"]\n        X[x]\n    end\n";
        let edit = remove_node(source, "X").unwrap();
        assert_eq!(edit.source, "graph TD\n    subgraph S [\"Only\"]\n    end\n");
    }

    #[test]
    fn toggle_does_not_match_through_chains() {
        let source = "graph TD\n    A --> B --> C\n";
        let edit = toggle_connection(source, "A", "C").unwrap();
        assert_eq!(edit.source, "graph TD\n    A --> B --> C\n    A --> C\n");
    }

    #[test]
    fn toggle_removes_only_first_match() {
        let source = "graph TD\n    A --> B\n    A --> B\n";
        let edit = toggle_connection(source, "A", "B").unwrap();
        assert_eq!(parsed(&edit.source).edges().len(), 1);
    }

    #[test]
    fn duplicate_connection_is_rejected() {
        assert!(matches!(
            add_connection(SAMPLE, "A", "B", EdgeKind::Plain),
            Err(Rejection::DuplicateConnection(_))
        ));
        assert!(add_connection(SAMPLE, "A", "B", EdgeKind::Conditional).is_ok());
    }

    #[test]
    fn child_lands_in_target_subgraph_with_cross_scope_link() {
        let source = "graph TD\n    P[parent]\n    subgraph S [\"Side\"]\n        Q[q]\n    end\n";
        let edit = create_child_node(
            source,
            "P",
            &Placement::Subgraph("S".into()),
            &mut SequentialIds::default(),
        )
        .unwrap();
        assert_eq!(
            edit.source,
            "graph TD\n    P[parent]\n    subgraph S [\"Side\"]\n        Q[q]\n        node_1[処理]\n    end\n    P --> node_1\n"
        );
    }

    #[test]
    fn child_follows_parent_scope_by_default() {
        let source = "graph TD\n    subgraph S\n        P[parent]\n    end\n";
        let edit =
            create_child_node(source, "P", &Placement::WithParent, &mut SequentialIds::default())
                .unwrap();
        let diagram = parsed(&edit.source);
        assert_eq!(diagram.find_node("node_1").unwrap().path, vec!["S"]);
        assert_eq!(diagram.connections("P").outgoing, vec!["node_1"]);
    }

    #[test]
    fn change_shape_keeps_label() {
        let edit = change_node_shape(SAMPLE, "B", NodeShape::Diamond).unwrap();
        assert_eq!(
            edit.source,
            "graph LR\n    A[Start] --> B{Mid}\n    B --> C[End]\n"
        );
    }

    #[test]
    fn change_shape_without_declaration_is_rejected() {
        let source = "graph TD\n    A --> B\n";
        assert_eq!(
            change_node_shape(source, "A", NodeShape::Round),
            Err(Rejection::NoDeclaration("A".into()))
        );
        let promoted = change_node_shape("graph TD\n    A\n", "A", NodeShape::Round).unwrap();
        assert_eq!(promoted.source, "graph TD\n    A(A)\n");
    }

    #[test]
    fn relabel_quotes_brackets() {
        let edit = relabel_node(SAMPLE, "A", "Begin (now)").unwrap();
        assert!(edit.source.contains("A[\"Begin (now)\"] --> B[Mid]"));
        assert_eq!(parsed(&edit.source).node_count(), 3);
    }

    #[test]
    fn wrap_moves_declarations_and_internal_links() {
        let edit = wrap_in_subgraph(
            SAMPLE,
            &["A".to_string(), "B".to_string()],
            "Intro",
            &mut SequentialIds::default(),
        )
        .unwrap();
        assert_eq!(
            edit.source,
            "graph LR\n    subgraph Intro_1 [\"Intro\"]\n        A[Start]\n        B[Mid]\n        A --> B\n    end\n    B --> C[End]\n"
        );
        assert_eq!(edit.created, vec!["Intro_1"]);
    }

    #[test]
    fn wrap_refuses_mixed_scopes() {
        let source = "graph TD\n    A[a]\n    subgraph S\n        B[b]\n    end\n";
        assert_eq!(
            wrap_in_subgraph(
                source,
                &["A".to_string(), "B".to_string()],
                "G",
                &mut SequentialIds::default()
            ),
            Err(Rejection::MixedScopes)
        );
    }

    #[test]
    fn wrap_needs_two_nodes_and_a_name() {
        let mut ids = SequentialIds::default();
        assert!(matches!(
            wrap_in_subgraph(SAMPLE, &["A".to_string(), "A".to_string()], "G", &mut ids),
            Err(Rejection::TooFewNodes { got: 1, .. })
        ));
        assert_eq!(
            wrap_in_subgraph(SAMPLE, &["A".to_string(), "B".to_string()], "  ", &mut ids),
            Err(Rejection::EmptyName)
        );
    }

    #[test]
    fn wrap_inside_subgraph_nests_before_end() {
        let source = "graph TD\n    subgraph S\n        A[a] --> B[b]\n        C[c]\n    end\n";
        let edit = wrap_in_subgraph(
            source,
            &["A".to_string(), "B".to_string()],
            "新しい",
            &mut SequentialIds::default(),
        )
        .unwrap();
        assert_eq!(
            edit.source,
            "graph TD\n    subgraph S\n        C[c]\n        subgraph group_1 [\"新しい\"]\n            A[a]\n            B[b]\n            A --> B\n        end\n    end\n"
        );
    }

    #[test]
    fn ungroup_splices_content_in_place() {
        let source = "graph TD\n    X\n    subgraph G [\"g\"]\n        A[a] --> B[b]\n    end\n    Y\n";
        let edit = ungroup_subgraph(source, "G").unwrap();
        assert_eq!(edit.source, "graph TD\n    X\n    A[a] --> B[b]\n    Y\n");
    }

    #[test]
    fn delete_subgraph_reports_dangling_links() {
        let source = "graph TD\n    subgraph G\n        A[a]\n    end\n    A --> B[b]\n";
        let edit = delete_subgraph(source, "G").unwrap();
        assert_eq!(edit.source, "graph TD\n    A --> B[b]\n");
        assert_eq!(edit.dangling, vec![Edge::new("A", "B", EdgeKind::Plain)]);
    }

    #[test]
    fn rename_only_touches_the_name() {
        let source = "graph TD\n    subgraph G [\"old\"]\n        A\n    end\n";
        let edit = rename_subgraph(source, "G", " new ").unwrap();
        assert_eq!(edit.source, "graph TD\n    subgraph G [\"new\"]\n        A\n    end\n");
        assert_eq!(
            rename_subgraph(source, "H", "x"),
            Err(Rejection::SubgraphNotFound("H".into()))
        );
    }

    #[test]
    fn renaming_a_hyphenated_subgraph_keeps_its_id() {
        let source = "graph TD\n    subgraph my-group\n        A[a]\n    end\n";
        let first = rename_subgraph(source, "my-group", "New").unwrap();
        assert_eq!(
            first.source,
            "graph TD\n    subgraph my-group [\"New\"]\n        A[a]\n    end\n"
        );

        let second = rename_subgraph(&first.source, "my-group", "Newer").unwrap();
        let diagram = Diagram::parse(&second.source).unwrap();
        assert_eq!(
            diagram
                .subgraphs()
                .into_iter()
                .map(|info| (info.id, info.name))
                .collect::<Vec<_>>(),
            vec![("my-group".to_string(), Some("Newer".to_string()))]
        );
        assert!(ungroup_subgraph(&second.source, "my-group").is_ok());
    }

    #[test]
    fn split_reroutes_links_through_parts() {
        let source = "graph TD\n    A[a] --> X[work] --> B[b]\n    C[c] -.-> X\n";
        let plan = SplitPlan::sequential(["prepare", "run", "report"]);
        let edit = split_node(source, "X", &plan, &mut SequentialIds::default()).unwrap();
        let diagram = parsed(&edit.source);

        assert!(diagram.find_node("X").is_none());
        assert_eq!(edit.created, vec!["X_1", "X_2", "X_3"]);
        assert_eq!(diagram.connections("X_1").incoming, vec!["A", "C"]);
        assert_eq!(diagram.connections("X_3").outgoing, vec!["B"]);
        assert_eq!(diagram.connections("X_2").incoming, vec!["X_1"]);
        assert_eq!(diagram.find_node("A").unwrap().label, "a");
    }

    #[test]
    fn split_honours_flags_and_explicit_links() {
        let source = "graph TD\n    subgraph S\n        X[x]\n    end\n    A --> X\n";
        let plan = SplitPlan {
            parts: vec![
                SplitPart { name: "check".into(), receives_input: false, provides_output: true },
                SplitPart { name: "load".into(), receives_input: true, provides_output: false },
            ],
            links: Some(vec![SplitLink { from_index: 1, to_index: 0, kind: EdgeKind::Conditional }]),
        };
        let edit = split_node(source, "X", &plan, &mut SequentialIds::default()).unwrap();
        let diagram = parsed(&edit.source);
        assert_eq!(diagram.find_node("X_1").unwrap().path, vec!["S"]);
        assert_eq!(diagram.connections("X_2").incoming, vec!["A"]);
        assert!(diagram.edges().contains(&Edge::new("X_2", "X_1", EdgeKind::Conditional)));
    }

    #[test]
    fn split_rejects_bad_plans() {
        let mut ids = SequentialIds::default();
        assert_eq!(
            split_node(SAMPLE, "B", &SplitPlan::default(), &mut ids),
            Err(Rejection::EmptySplit)
        );
        let plan = SplitPlan {
            links: Some(vec![SplitLink { from_index: 0, to_index: 5, kind: EdgeKind::Plain }]),
            ..SplitPlan::sequential(["a", "b"])
        };
        assert!(matches!(
            split_node(SAMPLE, "B", &plan, &mut ids),
            Err(Rejection::InvalidSplit(_))
        ));
    }

    #[test]
    fn timestamp_ids_are_strictly_increasing() {
        let mut ids = TimestampIds;
        let first = ids.next_id("node");
        let second = ids.next_id("node");
        assert_ne!(first, second);
        let stamp = |id: &str| id.trim_start_matches("node_").parse::<i64>().unwrap();
        assert!(stamp(&second) > stamp(&first));
    }
}
