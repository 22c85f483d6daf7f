use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as FmtWrite};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Direction, EdgeKind, INDENT, NodeShape};

static GRAPH_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(graph|flowchart)(?:\s+(\S+))?\s*;?$").expect("header pattern is valid")
});

static SUBGRAPH_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^subgraph\s+([A-Za-z0-9_]+)\s*(?:\[\s*"?(.*?)"?\s*\])?\s*$"#)
        .expect("subgraph pattern is valid")
});

// Free-form ids such as `my-group` or `My Group`, followed by a bracketed name.
static SUBGRAPH_FREEFORM_NAMED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^subgraph\s+(.+?)\s*\[\s*"?(.*?)"?\s*\]\s*$"#)
        .expect("subgraph pattern is valid")
});

const DIRECTIVE_PREFIXES: [&str; 6] = ["classDef", "class", "style", "linkStyle", "click", "direction"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line_no}: unsupported direction '{direction}' (expected TD, TB, BT, LR or RL)")]
    InvalidDirection { line_no: usize, direction: String },
    #[error("line {line_no}: 'end' without an open subgraph")]
    UnmatchedEnd { line_no: usize },
    #[error("subgraph '{id}' opened on line {line_no} is never closed")]
    UnclosedSubgraph { id: String, line_no: usize },
    #[error("line {line_no}: unsupported statement '{line}'")]
    Unsupported { line_no: usize, line: String },
}

/// How unrecognised lines are treated while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Keep them verbatim as raw lines.
    #[default]
    Lenient,
    /// Reject anything that is not a node, link, subgraph, comment or style directive.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// `graph` or `flowchart`, as written.
    pub keyword: String,
    pub direction: Direction,
    /// Direction as written (`TB` and `TD` both mean top-down); `None` for a bare keyword.
    pub token: Option<String>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            keyword: "graph".to_string(),
            direction: Direction::TopDown,
            token: Some(Direction::TopDown.as_token().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagram {
    /// Comment lines that precede the header.
    pub preamble: Vec<String>,
    pub header: Option<Header>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Node(NodeRef),
    Chain(Chain),
    Subgraph(Subgraph),
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub id: String,
    pub spec: Option<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub label: String,
    pub shape: NodeShape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub kind: EdgeKind,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub link: Link,
    pub target: NodeRef,
}

/// `A --> B -.-> C` on one line. Always has at least one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub head: NodeRef,
    pub hops: Vec<Hop>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subgraph {
    pub id: String,
    pub name: Option<String>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connections {
    pub incoming: Vec<String>,
    pub outgoing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    pub label: String,
    pub shape: NodeShape,
    /// Ancestor subgraph ids, outermost first.
    pub path: Vec<String>,
    /// False when the node only appears as a link endpoint.
    pub declared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphInfo {
    pub id: String,
    pub name: Option<String>,
    pub level: usize,
    pub parent: Option<String>,
}

/// Where a node's declaration lives: the enclosing scope and the statement index in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: Vec<String>,
    pub index: usize,
    pub standalone: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkFate {
    Keep,
    Drop,
    Take,
}

impl Diagram {
    pub fn empty() -> Self {
        Self {
            preamble: Vec::new(),
            header: Some(Header::default()),
            statements: Vec::new(),
        }
    }

    pub fn parse(definition: &str) -> Result<Self, ParseError> {
        Self::parse_with(definition, ParseMode::Lenient)
    }

    pub fn parse_with(definition: &str, mode: ParseMode) -> Result<Self, ParseError> {
        let mut preamble = Vec::new();
        let mut header = None;
        let mut root = Vec::new();
        let mut open: Vec<(Subgraph, usize)> = Vec::new();
        let mut seen_content = false;

        for (idx, raw_line) in definition.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if !seen_content {
                if line.is_empty() {
                    continue;
                }
                if line.starts_with("%%") {
                    preamble.push(line.to_string());
                    continue;
                }
                seen_content = true;
                if let Some(parsed) = parse_graph_header(line, line_no)? {
                    header = Some(parsed);
                    continue;
                }
            }

            if line == "end" {
                let Some((closed, _)) = open.pop() else {
                    return Err(ParseError::UnmatchedEnd { line_no });
                };
                current_scope(&mut root, &mut open).push(Statement::Subgraph(closed));
                continue;
            }

            if let Some(subgraph) = parse_subgraph_header(line) {
                open.push((subgraph, line_no));
                continue;
            }

            let statement = match parse_statement(line) {
                Some(statement) => statement,
                None => {
                    if mode == ParseMode::Strict && !is_passthrough(line) {
                        return Err(ParseError::Unsupported {
                            line_no,
                            line: line.to_string(),
                        });
                    }
                    Statement::Raw(line.to_string())
                }
            };
            current_scope(&mut root, &mut open).push(statement);
        }

        if let Some((subgraph, line_no)) = open.pop() {
            return Err(ParseError::UnclosedSubgraph {
                id: subgraph.id,
                line_no,
            });
        }

        while matches!(root.last(), Some(Statement::Raw(text)) if text.is_empty()) {
            root.pop();
        }

        Ok(Self {
            preamble,
            header,
            statements: root,
        })
    }

    pub fn to_source(&self) -> String {
        let mut output = String::new();
        for line in &self.preamble {
            output.push_str(line);
            output.push('\n');
        }

        let depth = match &self.header {
            Some(header) => {
                match &header.token {
                    Some(token) => {
                        let _ = writeln!(output, "{} {}", header.keyword, token);
                    }
                    None => {
                        let _ = writeln!(output, "{}", header.keyword);
                    }
                }
                1
            }
            None => 0,
        };

        write_statements(&mut output, &self.statements, depth);
        output
    }

    pub fn direction(&self) -> Direction {
        self.header
            .as_ref()
            .map(|header| header.direction)
            .unwrap_or_default()
    }

    /// Looks a node up by id. Bracketed declarations win over bare mentions.
    pub fn find_node(&self, id: &str) -> Option<NodeInfo> {
        let mut found = Occurrences::default();
        visit(&self.statements, &mut Vec::new(), &mut |statement, path, index| {
            found.record(statement, path, index, id);
        });

        if let Some((path, _, spec)) = found.bracketed {
            return Some(NodeInfo {
                id: id.to_string(),
                label: display_label(&spec.label),
                shape: spec.shape,
                path,
                declared: true,
            });
        }

        let (path, declared) = match (found.standalone, found.mentioned) {
            (Some((path, _)), _) => (path, true),
            (None, Some((path, _))) => (path, false),
            (None, None) => return None,
        };

        Some(NodeInfo {
            id: id.to_string(),
            label: id.to_string(),
            shape: NodeShape::Rect,
            path,
            declared,
        })
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node_ids().any(|candidate| candidate == id)
    }

    /// Declaration site of a node: first bracketed mention, else first standalone line,
    /// else the first link that mentions it.
    pub fn locate(&self, id: &str) -> Option<Location> {
        let mut found = Occurrences::default();
        visit(&self.statements, &mut Vec::new(), &mut |statement, path, index| {
            found.record(statement, path, index, id);
        });

        if let Some((path, index, _)) = found.bracketed {
            let standalone = matches!(
                self.scope(&path).and_then(|scope| scope.get(index)),
                Some(Statement::Node(_))
            );
            return Some(Location {
                path,
                index,
                standalone,
            });
        }
        if let Some((path, index)) = found.standalone {
            return Some(Location {
                path,
                index,
                standalone: true,
            });
        }
        found.mentioned.map(|(path, index)| Location {
            path,
            index,
            standalone: false,
        })
    }

    pub fn connections(&self, id: &str) -> Connections {
        let mut connections = Connections::default();
        for edge in self.edges() {
            if edge.to == id {
                connections.incoming.push(edge.from.clone());
            }
            if edge.from == id {
                connections.outgoing.push(edge.to.clone());
            }
        }
        connections
    }

    pub fn subgraph_path(&self, id: &str) -> Vec<SubgraphInfo> {
        let Some(location) = self.locate(id) else {
            return Vec::new();
        };
        let subgraphs = self.subgraphs();
        location
            .path
            .iter()
            .filter_map(|sg_id| subgraphs.iter().find(|info| &info.id == sg_id).cloned())
            .collect()
    }

    /// Every distinct node id in document order. Lazy; walks the tree as it is consumed.
    pub fn node_ids(&self) -> NodeIds<'_> {
        NodeIds {
            stack: vec![self.statements.iter()],
            pending: Vec::new().into_iter(),
            seen: HashSet::new(),
        }
    }

    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        visit(&self.statements, &mut Vec::new(), &mut |statement, _, _| {
            if let Statement::Chain(chain) = statement {
                edges.extend(chain.edges());
            }
        });
        edges
    }

    pub fn subgraphs(&self) -> Vec<SubgraphInfo> {
        let mut subgraphs = Vec::new();
        visit(&self.statements, &mut Vec::new(), &mut |statement, path, _| {
            if let Statement::Subgraph(subgraph) = statement {
                subgraphs.push(SubgraphInfo {
                    id: subgraph.id.clone(),
                    name: subgraph.name.clone(),
                    level: path.len(),
                    parent: path.last().cloned(),
                });
            }
        });
        subgraphs
    }

    pub fn find_subgraph(&self, id: &str) -> Option<SubgraphInfo> {
        self.subgraphs().into_iter().find(|info| info.id == id)
    }

    /// Ids of every node mentioned inside the subgraph, nested blocks included.
    pub fn subgraph_members(&self, id: &str) -> Vec<String> {
        let Some((path, index)) = self.subgraph_position(id) else {
            return Vec::new();
        };
        let Some(Statement::Subgraph(subgraph)) = self.scope(&path).and_then(|s| s.get(index))
        else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut members = Vec::new();
        visit(&subgraph.statements, &mut Vec::new(), &mut |statement, _, _| {
            for node in statement_refs(statement) {
                if seen.insert(node.id.clone()) {
                    members.push(node.id.clone());
                }
            }
        });
        members
    }

    /// Links whose endpoints have no declaration line anywhere in the document.
    pub fn undeclared_references(&self) -> Vec<Edge> {
        let declared = self.declared_ids();
        self.edges()
            .into_iter()
            .filter(|edge| !declared.contains(&edge.from) || !declared.contains(&edge.to))
            .collect()
    }

    /// Ids with a standalone line or a bracketed mention.
    pub fn declared_ids(&self) -> HashSet<String> {
        let mut declared = HashSet::new();
        visit(&self.statements, &mut Vec::new(), &mut |statement, _, _| match statement {
            Statement::Node(node) => {
                declared.insert(node.id.clone());
            }
            Statement::Chain(chain) => {
                for node in chain.refs().filter(|node| node.spec.is_some()) {
                    declared.insert(node.id.clone());
                }
            }
            _ => {}
        });
        declared
    }

    pub fn node_count(&self) -> usize {
        self.node_ids().count()
    }

    pub fn scope(&self, path: &[String]) -> Option<&Vec<Statement>> {
        let mut statements = &self.statements;
        for id in path {
            statements = statements.iter().find_map(|statement| match statement {
                Statement::Subgraph(subgraph) if &subgraph.id == id => Some(&subgraph.statements),
                _ => None,
            })?;
        }
        Some(statements)
    }

    pub fn scope_mut(&mut self, path: &[String]) -> Option<&mut Vec<Statement>> {
        let mut statements = &mut self.statements;
        for id in path {
            statements = statements.iter_mut().find_map(|statement| match statement {
                Statement::Subgraph(subgraph) if &subgraph.id == id => {
                    Some(&mut subgraph.statements)
                }
                _ => None,
            })?;
        }
        Some(statements)
    }

    /// Parent scope path and index of a subgraph block.
    pub fn subgraph_position(&self, id: &str) -> Option<(Vec<String>, usize)> {
        let mut position = None;
        visit(&self.statements, &mut Vec::new(), &mut |statement, path, index| {
            if position.is_some() {
                return;
            }
            if let Statement::Subgraph(subgraph) = statement {
                if subgraph.id == id {
                    position = Some((path.to_vec(), index));
                }
            }
        });
        position
    }

    pub(crate) fn subgraph_mut(&mut self, id: &str) -> Option<&mut Subgraph> {
        let (path, index) = self.subgraph_position(id)?;
        match self.scope_mut(&path)?.get_mut(index)? {
            Statement::Subgraph(subgraph) => Some(subgraph),
            _ => None,
        }
    }

    /// Removes every standalone node line for the given ids, at any depth.
    pub(crate) fn remove_node_lines(&mut self, ids: &HashSet<String>) -> usize {
        remove_node_lines_in(&mut self.statements, ids)
    }

    /// Detaches the first bracketed declaration of `id`, leaving a bare mention behind.
    pub(crate) fn take_spec(&mut self, id: &str) -> Option<NodeSpec> {
        let mut taken = None;
        for_each_ref_mut(&mut self.statements, &mut |node| {
            if taken.is_none() && node.id == id && node.spec.is_some() {
                taken = node.spec.take();
            }
        });
        taken
    }

    pub(crate) fn for_each_ref_mut(&mut self, f: &mut impl FnMut(&mut NodeRef)) {
        for_each_ref_mut(&mut self.statements, f);
    }

    /// Decides the fate of every link, rewriting chains so that dropped links disappear
    /// and taken links are returned. Bracketed declarations that lose their line are
    /// re-emitted as standalone lines, as is any surviving node that would otherwise
    /// vanish from the document.
    pub(crate) fn partition_links(
        &mut self,
        mut fate: impl FnMut(&Edge) -> LinkFate,
        dropped_ids: &HashSet<String>,
    ) -> Vec<Chain> {
        let mut fates = Vec::new();
        let mut surviving = HashMap::new();
        collect_fates(&self.statements, &mut fate, &mut fates, &mut surviving, dropped_ids);

        let mut rewrite = LinkRewrite {
            fates: fates.into_iter(),
            surviving,
            dropped_ids,
            taken: Vec::new(),
        };
        rewrite.apply(&mut self.statements);
        rewrite.taken
    }

    /// Replaces every link endpoint `id` with `input` (incoming side) or `output`
    /// (outgoing side), splitting chains that pass through it.
    pub(crate) fn reroute_node(&mut self, id: &str, input: &str, output: &str) {
        reroute_in(&mut self.statements, id, input, output);
    }
}

impl Statement {
    pub fn chain(from: &str, kind: EdgeKind, to: &str) -> Self {
        Statement::Chain(Chain {
            head: NodeRef::bare(from),
            hops: vec![Hop {
                link: Link { kind, label: None },
                target: NodeRef::bare(to),
            }],
        })
    }
}

impl NodeRef {
    pub fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            spec: None,
        }
    }

    pub fn declared(id: &str, label: &str, shape: NodeShape) -> Self {
        Self {
            id: id.to_string(),
            spec: Some(NodeSpec {
                label: label.to_string(),
                shape,
            }),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.spec {
            Some(spec) => f.write_str(&spec.shape.format_spec(&self.id, &spec.label)),
            None => f.write_str(&self.id),
        }
    }
}

impl Chain {
    pub fn refs(&self) -> impl Iterator<Item = &NodeRef> {
        std::iter::once(&self.head).chain(self.hops.iter().map(|hop| &hop.target))
    }

    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        let sources = std::iter::once(&self.head).chain(self.hops.iter().map(|hop| &hop.target));
        sources.zip(self.hops.iter()).map(|(from, hop)| Edge {
            from: from.id.clone(),
            to: hop.target.id.clone(),
            kind: hop.link.kind,
            label: hop.link.label.clone(),
        })
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.head)?;
        for hop in &self.hops {
            match &hop.link.label {
                Some(label) => write!(f, " {}|{}| {}", hop.link.kind.arrow_token(), label, hop.target)?,
                None => write!(f, " {} {}", hop.link.kind.arrow_token(), hop.target)?,
            }
        }
        Ok(())
    }
}

impl Subgraph {
    fn header_line(&self) -> String {
        match &self.name {
            Some(name) => format!("subgraph {} [\"{}\"]", self.id, name),
            None => format!("subgraph {}", self.id),
        }
    }
}

impl Edge {
    pub fn new(from: &str, to: &str, kind: EdgeKind) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            label: None,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.from, self.kind.arrow_token(), self.to)
    }
}

pub struct NodeIds<'a> {
    stack: Vec<std::slice::Iter<'a, Statement>>,
    pending: std::vec::IntoIter<&'a str>,
    seen: HashSet<&'a str>,
}

impl<'a> Iterator for NodeIds<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for id in self.pending.by_ref() {
                if self.seen.insert(id) {
                    return Some(id);
                }
            }

            let statement = loop {
                let iter = self.stack.last_mut()?;
                match iter.next() {
                    Some(statement) => break statement,
                    None => {
                        self.stack.pop();
                    }
                }
            };

            match statement {
                Statement::Node(node) => self.pending = vec![node.id.as_str()].into_iter(),
                Statement::Chain(chain) => {
                    self.pending = chain
                        .refs()
                        .map(|node| node.id.as_str())
                        .collect::<Vec<_>>()
                        .into_iter();
                }
                Statement::Subgraph(subgraph) => self.stack.push(subgraph.statements.iter()),
                Statement::Raw(_) => {}
            }
        }
    }
}

#[derive(Default)]
struct Occurrences {
    bracketed: Option<(Vec<String>, usize, NodeSpec)>,
    standalone: Option<(Vec<String>, usize)>,
    mentioned: Option<(Vec<String>, usize)>,
}

impl Occurrences {
    fn record(&mut self, statement: &Statement, path: &[String], index: usize, id: &str) {
        for node in statement_refs(statement).filter(|node| node.id == id) {
            if self.bracketed.is_none() {
                if let Some(spec) = &node.spec {
                    self.bracketed = Some((path.to_vec(), index, spec.clone()));
                }
            }
            if self.standalone.is_none() && matches!(statement, Statement::Node(_)) {
                self.standalone = Some((path.to_vec(), index));
            }
            if self.mentioned.is_none() {
                self.mentioned = Some((path.to_vec(), index));
            }
        }
    }
}

/// Label as a reader sees it: surrounding quotes dropped, `#quot;` decoded.
fn display_label(raw: &str) -> String {
    let inner = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(raw);
    inner.replace("#quot;", "\"")
}

fn statement_refs(statement: &Statement) -> Box<dyn Iterator<Item = &NodeRef> + '_> {
    match statement {
        Statement::Node(node) => Box::new(std::iter::once(node)),
        Statement::Chain(chain) => Box::new(chain.refs()),
        Statement::Subgraph(_) | Statement::Raw(_) => Box::new(std::iter::empty()),
    }
}

/// Depth-first walk; the callback sees each statement with its scope path and index.
fn visit<'a>(
    statements: &'a [Statement],
    path: &mut Vec<String>,
    f: &mut impl FnMut(&'a Statement, &[String], usize),
) {
    for (index, statement) in statements.iter().enumerate() {
        f(statement, path, index);
        if let Statement::Subgraph(subgraph) = statement {
            path.push(subgraph.id.clone());
            visit(&subgraph.statements, path, f);
            path.pop();
        }
    }
}

fn for_each_ref_mut(statements: &mut [Statement], f: &mut impl FnMut(&mut NodeRef)) {
    for statement in statements {
        match statement {
            Statement::Node(node) => f(node),
            Statement::Chain(chain) => {
                f(&mut chain.head);
                for hop in &mut chain.hops {
                    f(&mut hop.target);
                }
            }
            Statement::Subgraph(subgraph) => for_each_ref_mut(&mut subgraph.statements, f),
            Statement::Raw(_) => {}
        }
    }
}

fn remove_node_lines_in(statements: &mut Vec<Statement>, ids: &HashSet<String>) -> usize {
    let before = statements.len();
    statements.retain(|statement| !matches!(statement, Statement::Node(node) if ids.contains(&node.id)));
    let mut removed = before - statements.len();
    for statement in statements.iter_mut() {
        if let Statement::Subgraph(subgraph) = statement {
            removed += remove_node_lines_in(&mut subgraph.statements, ids);
        }
    }
    removed
}

fn current_scope<'a>(
    root: &'a mut Vec<Statement>,
    open: &'a mut [(Subgraph, usize)],
) -> &'a mut Vec<Statement> {
    match open.last_mut() {
        Some((subgraph, _)) => &mut subgraph.statements,
        None => root,
    }
}

fn write_statements(output: &mut String, statements: &[Statement], depth: usize) {
    let indent = INDENT.repeat(depth);
    for statement in statements {
        match statement {
            Statement::Raw(text) if text.is_empty() => output.push('\n'),
            Statement::Raw(text) => {
                let _ = writeln!(output, "{indent}{text}");
            }
            Statement::Node(node) => {
                let _ = writeln!(output, "{indent}{node}");
            }
            Statement::Chain(chain) => {
                let _ = writeln!(output, "{indent}{chain}");
            }
            Statement::Subgraph(subgraph) => {
                let _ = writeln!(output, "{indent}{}", subgraph.header_line());
                write_statements(output, &subgraph.statements, depth + 1);
                let _ = writeln!(output, "{indent}end");
            }
        }
    }
}

fn parse_graph_header(line: &str, line_no: usize) -> Result<Option<Header>, ParseError> {
    let Some(captures) = GRAPH_HEADER.captures(line) else {
        return Ok(None);
    };
    let keyword = captures[1].to_string();
    let token = captures.get(2).map(|token| token.as_str().to_string());
    let direction = match &token {
        Some(token) => token
            .parse::<Direction>()
            .map_err(|_| ParseError::InvalidDirection {
                line_no,
                direction: token.clone(),
            })?,
        None => Direction::TopDown,
    };
    Ok(Some(Header {
        keyword,
        direction,
        token,
    }))
}

fn parse_subgraph_header(line: &str) -> Option<Subgraph> {
    if let Some(captures) = SUBGRAPH_HEADER.captures(line) {
        return Some(Subgraph {
            id: captures[1].to_string(),
            name: captures.get(2).map(|name| name.as_str().to_string()),
            statements: Vec::new(),
        });
    }

    if let Some(captures) = SUBGRAPH_FREEFORM_NAMED.captures(line) {
        return Some(Subgraph {
            id: captures[1].to_string(),
            name: Some(captures[2].to_string()),
            statements: Vec::new(),
        });
    }

    let rest = line.strip_prefix("subgraph ")?.trim();
    if rest.is_empty() {
        return None;
    }
    Some(Subgraph {
        id: rest.to_string(),
        name: None,
        statements: Vec::new(),
    })
}

fn is_passthrough(line: &str) -> bool {
    line.is_empty()
        || line.starts_with("%%")
        || DIRECTIVE_PREFIXES
            .iter()
            .any(|prefix| line.split_whitespace().next() == Some(*prefix))
}

fn parse_statement(line: &str) -> Option<Statement> {
    let line = line.trim_end_matches(';').trim();
    let (segments, links) = split_links(line)?;

    if links.is_empty() {
        return parse_node_ref(segments.first()?).map(Statement::Node);
    }

    let mut refs = segments.into_iter().map(parse_node_ref);
    let head = refs.next()??;
    let mut hops = Vec::with_capacity(links.len());
    for link in links {
        let target = refs.next()??;
        hops.push(Hop { link, target });
    }
    Some(Statement::Chain(Chain { head, hops }))
}

/// Splits a statement on arrows that sit outside brackets and quotes.
fn split_links(line: &str) -> Option<(Vec<&str>, Vec<Link>)> {
    let mut segments = Vec::new();
    let mut links = Vec::new();
    // Only the bracket kind that opened the label counts; `A[Step 1)]` is one rect.
    let mut opener: Option<(char, char)> = None;
    let mut depth = 0_usize;
    let mut in_quote = false;
    let mut segment_start = 0;
    let mut cursor = 0;

    while cursor < line.len() {
        let rest = &line[cursor..];
        let ch = rest.chars().next()?;

        if ch == '"' {
            in_quote = !in_quote;
        } else if !in_quote {
            match opener {
                None => {
                    let close = match ch {
                        '[' => Some(']'),
                        '(' => Some(')'),
                        '{' => Some('}'),
                        ']' | ')' | '}' => return None,
                        _ => None,
                    };
                    if let Some(close) = close {
                        opener = Some((ch, close));
                        depth = 1;
                    }
                }
                Some((open, close)) => {
                    if ch == open {
                        depth += 1;
                    } else if ch == close {
                        depth -= 1;
                        if depth == 0 {
                            opener = None;
                        }
                    }
                }
            }
        }

        if opener.is_none() && !in_quote {
            let arrow = [EdgeKind::Conditional, EdgeKind::Plain]
                .into_iter()
                .find(|kind| rest.starts_with(kind.arrow_token()));
            if let Some(kind) = arrow {
                segments.push(line[segment_start..cursor].trim());
                cursor += kind.arrow_token().len();

                let after = &line[cursor..];
                let trimmed = after.trim_start();
                let mut label = None;
                if let Some(inner) = trimmed.strip_prefix('|') {
                    let end = inner.find('|')?;
                    label = Some(inner[..end].trim().to_string());
                    cursor += (after.len() - trimmed.len()) + 1 + end + 1;
                }
                links.push(Link { kind, label });
                segment_start = cursor;
                continue;
            }
        }

        cursor += ch.len_utf8();
    }

    if opener.is_some() || in_quote {
        return None;
    }
    segments.push(line[segment_start..].trim());
    Some((segments, links))
}

fn parse_node_ref(raw: &str) -> Option<NodeRef> {
    let trimmed = raw.trim();
    let id_end = trimmed
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .unwrap_or(trimmed.len());
    if id_end == 0 {
        return None;
    }

    let id = &trimmed[..id_end];
    let remainder = &trimmed[id_end..];
    if remainder.is_empty() {
        return Some(NodeRef::bare(id));
    }

    // `[[` has to be tried before `[`, otherwise a hexagon reads as a rect.
    for shape in [
        NodeShape::Hexagon,
        NodeShape::Rect,
        NodeShape::Round,
        NodeShape::Diamond,
    ] {
        let (open, close) = shape.delimiters();
        if remainder.len() >= open.len() + close.len()
            && remainder.starts_with(open)
            && remainder.ends_with(close)
        {
            let label = remainder[open.len()..remainder.len() - close.len()].trim();
            return Some(NodeRef::declared(id, label, shape));
        }
    }

    None
}

fn collect_fates(
    statements: &[Statement],
    fate: &mut impl FnMut(&Edge) -> LinkFate,
    fates: &mut Vec<LinkFate>,
    surviving: &mut HashMap<String, usize>,
    dropped_ids: &HashSet<String>,
) {
    for statement in statements {
        match statement {
            Statement::Node(node) => *surviving.entry(node.id.clone()).or_default() += 1,
            Statement::Chain(chain) => {
                let start = fates.len();
                for edge in chain.edges() {
                    fates.push(fate(&edge));
                }
                let local = &fates[start..];
                for (idx, node) in chain.refs().enumerate() {
                    let attached = idx
                        .checked_sub(1)
                        .and_then(|before| local.get(before))
                        .into_iter()
                        .chain(local.get(idx))
                        .any(|fate| *fate != LinkFate::Drop);
                    let hoisted = node.spec.is_some() && !dropped_ids.contains(&node.id);
                    if attached || hoisted {
                        *surviving.entry(node.id.clone()).or_default() += 1;
                    }
                }
            }
            Statement::Subgraph(subgraph) => {
                collect_fates(&subgraph.statements, fate, fates, surviving, dropped_ids)
            }
            Statement::Raw(_) => {}
        }
    }
}

struct LinkRewrite<'a> {
    fates: std::vec::IntoIter<LinkFate>,
    surviving: HashMap<String, usize>,
    dropped_ids: &'a HashSet<String>,
    taken: Vec<Chain>,
}

impl LinkRewrite<'_> {
    fn apply(&mut self, statements: &mut Vec<Statement>) {
        for statement in std::mem::take(statements) {
            match statement {
                Statement::Chain(chain) => self.rewrite_chain(chain, statements),
                Statement::Subgraph(mut subgraph) => {
                    self.apply(&mut subgraph.statements);
                    statements.push(Statement::Subgraph(subgraph));
                }
                other => statements.push(other),
            }
        }
    }

    fn rewrite_chain(&mut self, chain: Chain, out: &mut Vec<Statement>) {
        let fates: Vec<LinkFate> = chain
            .hops
            .iter()
            .map(|_| self.fates.next().unwrap_or(LinkFate::Keep))
            .collect();
        if fates.iter().all(|fate| *fate == LinkFate::Keep) {
            out.push(Statement::Chain(chain));
            return;
        }

        let Chain { head, hops } = chain;
        let mut links = Vec::with_capacity(hops.len());
        let mut refs = vec![head];
        for hop in hops {
            links.push(hop.link);
            refs.push(hop.target);
        }

        let mut run: Option<(LinkFate, Chain)> = None;
        for (idx, mut node) in refs.into_iter().enumerate() {
            let before = idx.checked_sub(1).map(|i| fates[i]).filter(|f| *f != LinkFate::Drop);
            let after = fates.get(idx).copied().filter(|f| *f != LinkFate::Drop);

            if before.is_none() && after.is_none() {
                self.hoist(node, out);
                continue;
            }

            if let Some((_, chain)) = run.as_mut() {
                if before.is_some() {
                    chain.hops.push(Hop {
                        link: links[idx - 1].clone(),
                        target: NodeRef {
                            id: node.id.clone(),
                            spec: node.spec.take(),
                        },
                    });
                }
            }

            if before != after || after.is_none() {
                if let Some((fate, chain)) = run.take() {
                    self.flush(fate, chain, out);
                }
            }

            if let Some(fate) = after {
                if run.is_none() {
                    run = Some((
                        fate,
                        Chain {
                            head: node,
                            hops: Vec::new(),
                        },
                    ));
                }
            }
        }

        if let Some((fate, chain)) = run.take() {
            self.flush(fate, chain, out);
        }
    }

    fn flush(&mut self, fate: LinkFate, chain: Chain, out: &mut Vec<Statement>) {
        if chain.hops.is_empty() {
            return;
        }
        match fate {
            LinkFate::Take => self.taken.push(chain),
            _ => out.push(Statement::Chain(chain)),
        }
    }

    fn hoist(&mut self, node: NodeRef, out: &mut Vec<Statement>) {
        if self.dropped_ids.contains(&node.id) {
            return;
        }
        if node.spec.is_some() {
            out.push(Statement::Node(node));
            return;
        }
        let count = self.surviving.entry(node.id.clone()).or_default();
        if *count == 0 {
            *count = 1;
            out.push(Statement::Node(node));
        }
    }
}

fn reroute_in(statements: &mut Vec<Statement>, id: &str, input: &str, output: &str) {
    for statement in std::mem::take(statements) {
        match statement {
            Statement::Chain(chain) if chain.refs().any(|node| node.id == id) => {
                for segment in reroute_chain(chain, id, input, output) {
                    statements.push(Statement::Chain(segment));
                }
            }
            Statement::Subgraph(mut subgraph) => {
                reroute_in(&mut subgraph.statements, id, input, output);
                statements.push(Statement::Subgraph(subgraph));
            }
            other => statements.push(other),
        }
    }
}

fn reroute_chain(chain: Chain, id: &str, input: &str, output: &str) -> Vec<Chain> {
    let Chain { head, hops } = chain;
    let mut links = Vec::with_capacity(hops.len());
    let mut refs = vec![head];
    for hop in hops {
        links.push(hop.link);
        refs.push(hop.target);
    }

    let mut segments = Vec::new();
    let mut current: Option<Chain> = None;
    for (idx, node) in refs.into_iter().enumerate() {
        if node.id == id {
            if let Some(mut chain) = current.take() {
                chain.hops.push(Hop {
                    link: links[idx - 1].clone(),
                    target: NodeRef::bare(input),
                });
                segments.push(chain);
            }
            if idx < links.len() {
                current = Some(Chain {
                    head: NodeRef::bare(output),
                    hops: Vec::new(),
                });
            }
            continue;
        }

        match current.as_mut() {
            Some(chain) => chain.hops.push(Hop {
                link: links[idx - 1].clone(),
                target: node,
            }),
            None => {
                current = Some(Chain {
                    head: node,
                    hops: Vec::new(),
                })
            }
        }
    }

    if let Some(chain) = current {
        if !chain.hops.is_empty() {
            segments.push(chain);
        }
    }
    segments
}
