use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diagram::{Diagram, ParseError};
use crate::selection::{Point, Rect};
use crate::{
    Direction, NODE_HEIGHT, NODE_SPACING, NODE_WIDTH, START_OFFSET, SUBGRAPH_LABEL_HEIGHT,
    SUBGRAPH_PADDING,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("diagram has no 'graph' or 'flowchart' header")]
    MissingHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBox {
    pub id: String,
    pub rect: Rect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphBox {
    pub id: String,
    pub rect: Rect,
    /// Nesting level, 0 for top-level blocks.
    pub depth: usize,
}

/// Bounding boxes of the last successful render.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutGeometry {
    pub nodes: Vec<NodeBox>,
    pub subgraphs: Vec<SubgraphBox>,
    pub width: f32,
    pub height: f32,
}

impl LayoutGeometry {
    pub fn node(&self, id: &str) -> Option<&NodeBox> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn subgraph(&self, id: &str) -> Option<&SubgraphBox> {
        self.subgraphs.iter().find(|subgraph| subgraph.id == id)
    }
}

/// Turns diagram text into geometry. Clients that draw with Mermaid itself can
/// skip this and push their own geometry into the editor.
pub trait Renderer {
    fn render(&self, source: &str) -> Result<LayoutGeometry, RenderError>;
}

/// Longest-path layered layout with fixed node boxes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayeredLayout;

impl Renderer for LayeredLayout {
    fn render(&self, source: &str) -> Result<LayoutGeometry, RenderError> {
        let diagram = Diagram::parse(source)?;
        if diagram.header.is_none() {
            return Err(RenderError::MissingHeader);
        }
        Ok(layout(&diagram))
    }
}

pub fn layout(diagram: &Diagram) -> LayoutGeometry {
    let order: Vec<String> = diagram.node_ids().map(str::to_string).collect();
    let (positions, mut width, mut height) = layered_positions(diagram, &order);

    let nodes: Vec<NodeBox> = order
        .iter()
        .filter_map(|id| {
            positions.get(id).map(|center| NodeBox {
                id: id.clone(),
                rect: Rect::from_center(*center, NODE_WIDTH, NODE_HEIGHT),
            })
        })
        .collect();

    let subgraphs = subgraph_boxes(diagram, &nodes);
    for subgraph in &subgraphs {
        width = width.max(subgraph.rect.right() + SUBGRAPH_PADDING);
        height = height.max(subgraph.rect.bottom() + SUBGRAPH_PADDING);
    }

    LayoutGeometry {
        nodes,
        subgraphs,
        width,
        height,
    }
}

fn layered_positions(diagram: &Diagram, order: &[String]) -> (HashMap<String, Point>, f32, f32) {
    if order.is_empty() {
        return (
            HashMap::new(),
            START_OFFSET * 2.0 + NODE_WIDTH,
            START_OFFSET * 2.0 + NODE_HEIGHT,
        );
    }

    let edges = diagram.edges();
    let mut levels: HashMap<&str, usize> = order.iter().map(|id| (id.as_str(), 0)).collect();
    let mut indegree: HashMap<&str, usize> = order.iter().map(|id| (id.as_str(), 0)).collect();
    for edge in &edges {
        *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = order
        .iter()
        .map(String::as_str)
        .filter(|id| indegree.get(id).copied().unwrap_or(0) == 0)
        .collect();
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(node_id) = queue.pop_front() {
        visited.insert(node_id);
        let node_level = levels.get(node_id).copied().unwrap_or(0);

        for edge in edges.iter().filter(|edge| edge.from == node_id) {
            let target = edge.to.as_str();
            let entry = levels.entry(target).or_insert(0);
            *entry = (*entry).max(node_level + 1);

            if let Some(degree) = indegree.get_mut(target) {
                if *degree > 0 {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }
    }

    // Nodes on a cycle never reach indegree zero; put them just below their parents.
    if visited.len() != order.len() {
        for id in order.iter().map(String::as_str) {
            if visited.contains(id) {
                continue;
            }
            let level = edges
                .iter()
                .filter(|edge| edge.to == id && edge.from != id)
                .map(|edge| levels.get(edge.from.as_str()).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            levels.insert(id, level);
        }
    }

    let mut layers_map: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
    for id in order {
        let level = levels.get(id.as_str()).copied().unwrap_or(0);
        layers_map.entry(level).or_default().push(id);
    }

    let layers: Vec<Vec<&str>> = layers_map.into_values().collect();
    let level_count = layers.len().max(1);
    let max_per_level = layers.iter().map(Vec::len).max().unwrap_or(1).max(1);
    let direction = diagram.direction();

    let mut positions = HashMap::new();
    let (width, height) = match direction {
        Direction::TopDown | Direction::BottomTop => {
            let inner_width = NODE_WIDTH + NODE_SPACING * ((max_per_level - 1) as f32);
            let inner_height = NODE_HEIGHT + NODE_SPACING * ((level_count - 1) as f32);
            let start_y = START_OFFSET + NODE_HEIGHT / 2.0;

            for (idx, nodes) in layers.iter().enumerate() {
                let row = if direction == Direction::BottomTop {
                    level_count - 1 - idx
                } else {
                    idx
                } as f32;
                let y = start_y + row * NODE_SPACING;
                let span = NODE_SPACING * (nodes.len().saturating_sub(1) as f32);
                let start_x = START_OFFSET + (inner_width - span) / 2.0;
                for (col, id) in nodes.iter().enumerate() {
                    let x = start_x + col as f32 * NODE_SPACING;
                    positions.insert(id.to_string(), Point::new(x, y));
                }
            }

            (
                inner_width + START_OFFSET * 2.0,
                inner_height + START_OFFSET * 2.0,
            )
        }
        Direction::LeftRight | Direction::RightLeft => {
            let inner_width = NODE_WIDTH + NODE_SPACING * ((level_count - 1) as f32);
            let inner_height = NODE_HEIGHT + NODE_SPACING * ((max_per_level - 1) as f32);
            let start_x = START_OFFSET + NODE_WIDTH / 2.0;

            for (idx, nodes) in layers.iter().enumerate() {
                let column = if direction == Direction::RightLeft {
                    level_count - 1 - idx
                } else {
                    idx
                } as f32;
                let x = start_x + column * NODE_SPACING;
                let span = NODE_SPACING * (nodes.len().saturating_sub(1) as f32);
                let start_y = START_OFFSET + (inner_height - span) / 2.0;
                for (row, id) in nodes.iter().enumerate() {
                    let y = start_y + row as f32 * NODE_SPACING;
                    positions.insert(id.to_string(), Point::new(x, y));
                }
            }

            (
                inner_width + START_OFFSET * 2.0,
                inner_height + START_OFFSET * 2.0,
            )
        }
    };

    (positions, width, height)
}

/// Padded union of member boxes and nested blocks, with room for the title band.
fn subgraph_boxes(diagram: &Diagram, nodes: &[NodeBox]) -> Vec<SubgraphBox> {
    let infos = diagram.subgraphs();
    let paths: HashMap<&str, Vec<String>> = nodes
        .iter()
        .filter_map(|node| {
            diagram
                .find_node(&node.id)
                .map(|info| (node.id.as_str(), info.path))
        })
        .collect();

    let mut deepest_first: Vec<_> = infos.iter().collect();
    deepest_first.sort_by(|a, b| b.level.cmp(&a.level));

    let mut bounds: HashMap<&str, Rect> = HashMap::new();
    for info in deepest_first {
        let members = nodes
            .iter()
            .filter(|node| {
                paths
                    .get(node.id.as_str())
                    .is_some_and(|path| path.contains(&info.id))
            })
            .map(|node| node.rect);
        let children = infos
            .iter()
            .filter(|child| child.parent.as_deref() == Some(info.id.as_str()))
            .filter_map(|child| bounds.get(child.id.as_str()).copied());

        let Some(union) = members.chain(children).reduce(|acc, rect| acc.union(&rect)) else {
            continue;
        };
        bounds.insert(
            info.id.as_str(),
            union.inflate(
                SUBGRAPH_PADDING,
                SUBGRAPH_PADDING + SUBGRAPH_LABEL_HEIGHT,
                SUBGRAPH_PADDING,
                SUBGRAPH_PADDING,
            ),
        );
    }

    infos
        .iter()
        .filter_map(|info| {
            bounds.get(info.id.as_str()).map(|rect| SubgraphBox {
                id: info.id.clone(),
                rect: *rect,
                depth: info.level,
            })
        })
        .collect()
}
