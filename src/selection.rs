use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::diagram::Diagram;
use crate::render::LayoutGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned box; `x`/`y` is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn from_center(center: Point, width: f32, height: f32) -> Self {
        Self {
            x: center.x - width / 2.0,
            y: center.y - height / 2.0,
            width,
            height,
        }
    }

    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x && point.x <= self.right() && point.y >= self.y && point.y <= self.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    pub fn inflate(&self, left: f32, top: f32, right: f32, bottom: f32) -> Rect {
        Rect {
            x: self.x - left,
            y: self.y - top,
            width: self.width + left + right,
            height: self.height + top + bottom,
        }
    }
}

/// Innermost node box under the point.
pub fn node_at(geometry: &LayoutGeometry, point: Point) -> Option<&str> {
    geometry
        .nodes
        .iter()
        .filter(|node| node.rect.contains(point))
        .min_by(|a, b| a.rect.area().total_cmp(&b.rect.area()))
        .map(|node| node.id.as_str())
}

/// Deepest subgraph whose body is under the point. A point on a node never
/// counts as a subgraph-body hit.
pub fn subgraph_at(geometry: &LayoutGeometry, point: Point) -> Option<&str> {
    if node_at(geometry, point).is_some() {
        return None;
    }
    geometry
        .subgraphs
        .iter()
        .filter(|subgraph| subgraph.rect.contains(point))
        .min_by(|a, b| {
            b.depth
                .cmp(&a.depth)
                .then(a.rect.area().total_cmp(&b.rect.area()))
        })
        .map(|subgraph| subgraph.id.as_str())
}

pub fn nodes_within(geometry: &LayoutGeometry, area: &Rect) -> Vec<String> {
    geometry
        .nodes
        .iter()
        .filter(|node| node.rect.intersects(area))
        .map(|node| node.id.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marquee {
    pub start: Point,
    pub current: Point,
}

impl Marquee {
    pub fn rect(&self) -> Rect {
        Rect::from_corners(self.start, self.current)
    }
}

/// Selected node ids in the order they were picked, plus an optional focused subgraph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub subgraph: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marquee: Option<Marquee>,
}

impl Selection {
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|selected| selected == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.subgraph.is_none()
    }

    pub fn select_only(&mut self, id: &str) {
        self.nodes = vec![id.to_string()];
        self.subgraph = None;
    }

    pub fn add(&mut self, id: &str) {
        if !self.contains(id) {
            self.nodes.push(id.to_string());
        }
    }

    pub fn toggle(&mut self, id: &str) {
        if self.contains(id) {
            self.nodes.retain(|selected| selected != id);
        } else {
            self.nodes.push(id.to_string());
        }
    }

    pub fn focus_subgraph(&mut self, id: Option<&str>) {
        self.subgraph = id.map(str::to_string);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.subgraph = None;
        self.marquee = None;
    }

    pub fn begin_marquee(&mut self, start: Point) {
        self.marquee = Some(Marquee {
            start,
            current: start,
        });
    }

    pub fn update_marquee(&mut self, current: Point) {
        if let Some(marquee) = self.marquee.as_mut() {
            marquee.current = current;
        }
    }

    /// Ends the rectangle gesture and selects every node box it touches.
    pub fn finish_marquee(&mut self, geometry: &LayoutGeometry, additive: bool) -> Vec<String> {
        let Some(marquee) = self.marquee.take() else {
            return Vec::new();
        };
        let hits = nodes_within(geometry, &marquee.rect());
        if !additive {
            self.nodes.clear();
        }
        for id in &hits {
            self.add(id);
        }
        hits
    }

    /// Drops ids that no longer exist in the diagram.
    pub fn prune(&mut self, diagram: &Diagram) {
        let live: HashSet<&str> = diagram.node_ids().collect();
        self.nodes.retain(|id| live.contains(id.as_str()));
        if let Some(subgraph) = &self.subgraph {
            if diagram.find_subgraph(subgraph).is_none() {
                self.subgraph = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{NodeBox, SubgraphBox};

    fn geometry() -> LayoutGeometry {
        LayoutGeometry {
            nodes: vec![
                NodeBox { id: "A".into(), rect: Rect { x: 10.0, y: 10.0, width: 40.0, height: 20.0 } },
                NodeBox { id: "B".into(), rect: Rect { x: 100.0, y: 10.0, width: 40.0, height: 20.0 } },
            ],
            subgraphs: vec![
                SubgraphBox { id: "outer".into(), rect: Rect { x: 0.0, y: 0.0, width: 200.0, height: 200.0 }, depth: 0 },
                SubgraphBox { id: "inner".into(), rect: Rect { x: 90.0, y: 0.0, width: 100.0, height: 100.0 }, depth: 1 },
            ],
            width: 200.0,
            height: 200.0,
        }
    }

    #[test]
    fn node_hit_excludes_subgraph_hit() {
        let geometry = geometry();
        let on_b = Point::new(110.0, 20.0);
        assert_eq!(node_at(&geometry, on_b), Some("B"));
        assert_eq!(subgraph_at(&geometry, on_b), None);
    }

    #[test]
    fn innermost_subgraph_wins() {
        let geometry = geometry();
        assert_eq!(subgraph_at(&geometry, Point::new(150.0, 80.0)), Some("inner"));
        assert_eq!(subgraph_at(&geometry, Point::new(20.0, 150.0)), Some("outer"));
        assert_eq!(subgraph_at(&geometry, Point::new(500.0, 500.0)), None);
    }

    #[test]
    fn marquee_selects_intersecting_nodes() {
        let geometry = geometry();
        let mut selection = Selection::default();
        selection.select_only("B");
        selection.begin_marquee(Point::new(0.0, 0.0));
        selection.update_marquee(Point::new(30.0, 30.0));
        assert_eq!(selection.finish_marquee(&geometry, false), vec!["A"]);
        assert_eq!(selection.nodes, vec!["A"]);
        assert!(selection.marquee.is_none());
    }

    #[test]
    fn prune_drops_missing_ids() {
        let diagram = Diagram::parse("graph TD\n    A --> B\n").unwrap();
        let mut selection = Selection::default();
        selection.toggle("A");
        selection.toggle("Z");
        selection.focus_subgraph(Some("gone"));
        selection.prune(&diagram);
        assert_eq!(selection.nodes, vec!["A"]);
        assert_eq!(selection.subgraph, None);
    }
}
