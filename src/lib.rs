//! Editing core for Mermaid flowcharts.
//!
//! The diagram source text is the only state that matters. Every operation
//! parses it into a small AST ([`diagram::Diagram`]), rewrites the tree and
//! serialises it back, so the text stays the storage and wire format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod assist;
pub mod config;
pub mod diagram;
pub mod edit;
pub mod editor;
pub mod envelope;
pub mod history;
pub mod render;
pub mod selection;
pub mod utils;

#[cfg(feature = "server")]
pub mod serve;

pub use diagram::{Connections, Diagram, Edge, NodeInfo, ParseMode, SubgraphInfo};
pub use edit::{Edit, EditResult, Placement, Rejection, SplitLink, SplitPart, SplitPlan};
pub use editor::{AssistTicket, EditRequest, Editor, EditorError, EditorState};
pub use history::History;
pub use render::{LayeredLayout, LayoutGeometry, Renderer};
pub use selection::{Point, Rect, Selection};

pub const NODE_WIDTH: f32 = 140.0;
pub const NODE_HEIGHT: f32 = 60.0;
pub const NODE_SPACING: f32 = 160.0;
pub const START_OFFSET: f32 = 120.0;
pub const SUBGRAPH_PADDING: f32 = 24.0;
pub const SUBGRAPH_LABEL_HEIGHT: f32 = 28.0;

/// Indentation unit used by the serializer.
pub const INDENT: &str = "    ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    TopDown,
    LeftRight,
    BottomTop,
    RightLeft,
}

impl Direction {
    pub fn as_token(&self) -> &'static str {
        match self {
            Direction::TopDown => "TD",
            Direction::LeftRight => "LR",
            Direction::BottomTop => "BT",
            Direction::RightLeft => "RL",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TD" | "TB" => Ok(Direction::TopDown),
            "BT" => Ok(Direction::BottomTop),
            "LR" => Ok(Direction::LeftRight),
            "RL" => Ok(Direction::RightLeft),
            other => Err(format!(
                "unsupported direction '{other}'; supported values are TD, TB, BT, LR, RL"
            )),
        }
    }
}

/// Node shape, encoded in the source by the bracket style around the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeShape {
    #[default]
    Rect,
    Round,
    Diamond,
    Hexagon,
}

impl NodeShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeShape::Rect => "rect",
            NodeShape::Round => "round",
            NodeShape::Diamond => "diamond",
            NodeShape::Hexagon => "hexagon",
        }
    }

    pub fn delimiters(&self) -> (&'static str, &'static str) {
        match self {
            NodeShape::Rect => ("[", "]"),
            NodeShape::Round => ("(", ")"),
            NodeShape::Diamond => ("{", "}"),
            NodeShape::Hexagon => ("[[", "]]"),
        }
    }

    pub fn format_spec(&self, id: &str, label: &str) -> String {
        let (open, close) = self.delimiters();
        format!("{id}{open}{label}{close}")
    }
}

impl FromStr for NodeShape {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rect" | "rectangle" => Ok(NodeShape::Rect),
            "round" | "rounded" => Ok(NodeShape::Round),
            "diamond" | "rhombus" => Ok(NodeShape::Diamond),
            "hexagon" => Ok(NodeShape::Hexagon),
            other => Err(format!(
                "unknown shape '{other}'; expected rect, round, diamond or hexagon"
            )),
        }
    }
}

impl fmt::Display for NodeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection kind. `Plain` is `-->`, `Conditional` is the dotted `-.->`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    #[default]
    Plain,
    Conditional,
}

impl EdgeKind {
    pub fn arrow_token(&self) -> &'static str {
        match self {
            EdgeKind::Plain => "-->",
            EdgeKind::Conditional => "-.->",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Plain => "plain",
            EdgeKind::Conditional => "conditional",
        }
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "plain" | "solid" | "normal" => Ok(EdgeKind::Plain),
            "conditional" | "dashed" | "dotted" => Ok(EdgeKind::Conditional),
            other => Err(format!(
                "unknown connection kind '{other}'; expected plain or conditional"
            )),
        }
    }
}

/// Palette entries offered by "add node".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    End,
    Process,
    Decision,
    Subprocess,
}

impl NodeKind {
    pub fn default_label(&self) -> &'static str {
        match self {
            NodeKind::Start => "開始",
            NodeKind::End => "終了",
            NodeKind::Process => "処理",
            NodeKind::Decision => "判定",
            NodeKind::Subprocess => "サブプロセス",
        }
    }

    pub fn shape(&self) -> NodeShape {
        match self {
            NodeKind::Start | NodeKind::End => NodeShape::Round,
            NodeKind::Process => NodeShape::Rect,
            NodeKind::Decision => NodeShape::Diamond,
            NodeKind::Subprocess => NodeShape::Hexagon,
        }
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(NodeKind::Start),
            "end" => Ok(NodeKind::End),
            "process" => Ok(NodeKind::Process),
            "decision" => Ok(NodeKind::Decision),
            "subprocess" => Ok(NodeKind::Subprocess),
            other => Err(format!(
                "unknown node type '{other}'; expected start, end, process, decision or subprocess"
            )),
        }
    }
}
