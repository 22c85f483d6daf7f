use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::assist::SplitContext;
use crate::config::EditorConfig;
use crate::diagram::{Diagram, Edge};
use crate::edit::{self, Edit, IdGenerator, Placement, Rejection, SplitPlan, TimestampIds};
use crate::envelope::{Envelope, EnvelopeError};
use crate::history::{History, HistoryEntry, HistoryError};
use crate::render::{LayeredLayout, LayoutGeometry, Renderer};
use crate::selection::{self, Point, Selection};
use crate::{EdgeKind, NodeKind, NodeShape};

#[derive(Debug, Error)]
pub enum EditorError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("another AI operation is still running")]
    Busy,
    #[error("the diagram changed while the AI request was running")]
    Stale,
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// One mutation, in the shape clients send it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditRequest {
    AddNode {
        kind: NodeKind,
    },
    RemoveNode {
        id: String,
    },
    ToggleConnection {
        from: String,
        to: String,
    },
    AddConnection {
        from: String,
        to: String,
        #[serde(default)]
        kind: EdgeKind,
    },
    RemoveConnection {
        from: String,
        to: String,
        #[serde(default)]
        kind: EdgeKind,
    },
    CreateChildNode {
        parent: String,
        /// Canvas point the drag ended on; resolved to a subgraph through the last layout.
        #[serde(default)]
        drop: Option<Point>,
        #[serde(default)]
        placement: Option<Placement>,
    },
    ChangeNodeShape {
        id: String,
        shape: NodeShape,
    },
    RelabelNode {
        id: String,
        label: String,
    },
    WrapInSubgraph {
        nodes: Vec<String>,
        name: String,
    },
    UngroupSubgraph {
        id: String,
    },
    DeleteSubgraph {
        id: String,
    },
    RenameSubgraph {
        id: String,
        name: String,
    },
    SplitNode {
        id: String,
        plan: SplitPlan,
    },
}

impl EditRequest {
    /// Text stored with the history entry.
    pub fn describe(&self) -> String {
        match self {
            EditRequest::AddNode { kind } => format!("Add {} node", kind_name(*kind)),
            EditRequest::RemoveNode { id } => format!("Remove node {id}"),
            EditRequest::ToggleConnection { from, to } => format!("Toggle {from} --> {to}"),
            EditRequest::AddConnection { from, to, kind } => {
                format!("Connect {from} {} {to}", kind.arrow_token())
            }
            EditRequest::RemoveConnection { from, to, kind } => {
                format!("Disconnect {from} {} {to}", kind.arrow_token())
            }
            EditRequest::CreateChildNode { parent, .. } => format!("Add child of {parent}"),
            EditRequest::ChangeNodeShape { id, shape } => format!("Change {id} to {shape}"),
            EditRequest::RelabelNode { id, .. } => format!("Relabel {id}"),
            EditRequest::WrapInSubgraph { nodes, name } => {
                format!("Group {} nodes as \"{name}\"", nodes.len())
            }
            EditRequest::UngroupSubgraph { id } => format!("Ungroup {id}"),
            EditRequest::DeleteSubgraph { id } => format!("Delete subgraph {id}"),
            EditRequest::RenameSubgraph { id, name } => format!("Rename {id} to \"{name}\""),
            EditRequest::SplitNode { id, plan } => {
                format!("Split {id} into {} steps", plan.parts.len())
            }
        }
    }
}

fn kind_name(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Start => "start",
        NodeKind::End => "end",
        NodeKind::Process => "process",
        NodeKind::Decision => "decision",
        NodeKind::Subprocess => "subprocess",
    }
}

/// Issued when an AI request starts; carries the buffer version it was based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistTicket {
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum Drag {
    Edge { from: String, start: Point },
    Marquee { start: Point },
}

/// Everything a client needs to redraw.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorState {
    pub title: String,
    pub source: String,
    pub version: u64,
    pub selection: Selection,
    pub geometry: Option<LayoutGeometry>,
    pub render_error: Option<String>,
    pub can_undo: bool,
    pub can_redo: bool,
    pub history_len: usize,
    pub assist_in_flight: bool,
    pub undeclared: Vec<Edge>,
}

/// Interaction state around one chart. All text changes go through the
/// functions in [`crate::edit`]; this type only sequences them.
pub struct Editor<R: Renderer = LayeredLayout> {
    title: String,
    source: String,
    history: History,
    selection: Selection,
    geometry: Option<LayoutGeometry>,
    render_error: Option<String>,
    version: u64,
    drag: Option<Drag>,
    assist_in_flight: bool,
    config: EditorConfig,
    renderer: R,
    ids: Box<dyn IdGenerator + Send + Sync>,
}

impl Editor<LayeredLayout> {
    pub fn new(title: &str, source: &str, config: EditorConfig) -> Self {
        Self::with_renderer(title, source, config, LayeredLayout)
    }
}

impl<R: Renderer> Editor<R> {
    pub fn with_renderer(title: &str, source: &str, config: EditorConfig, renderer: R) -> Self {
        let mut history = History::new(config.max_history);
        history.record(title, source, "Open");

        let mut editor = Self {
            title: title.to_string(),
            source: source.to_string(),
            history,
            selection: Selection::default(),
            geometry: None,
            render_error: None,
            version: 0,
            drag: None,
            assist_in_flight: false,
            config,
            renderer,
            ids: Box::new(TimestampIds),
        };
        editor.render();
        editor
    }

    pub fn with_ids(mut self, ids: impl IdGenerator + Send + Sync + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut Selection {
        &mut self.selection
    }

    pub fn geometry(&self) -> Option<&LayoutGeometry> {
        self.geometry.as_ref()
    }

    pub fn render_error(&self) -> Option<&str> {
        self.render_error.as_deref()
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn is_assist_in_flight(&self) -> bool {
        self.assist_in_flight
    }

    pub fn diagram(&self) -> Result<Diagram, Rejection> {
        Ok(Diagram::parse_with(&self.source, self.config.parse_mode())?)
    }

    pub fn state(&self) -> EditorState {
        EditorState {
            title: self.title.clone(),
            source: self.source.clone(),
            version: self.version,
            selection: self.selection.clone(),
            geometry: self.geometry.clone(),
            render_error: self.render_error.clone(),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
            history_len: self.history.len(),
            assist_in_flight: self.assist_in_flight,
            undeclared: Diagram::parse(&self.source)
                .map(|diagram| diagram.undeclared_references())
                .unwrap_or_default(),
        }
    }

    /// Runs one mutation and commits it to history.
    pub fn apply(&mut self, request: EditRequest) -> Result<Edit, EditorError> {
        if self.config.strict_parsing {
            self.diagram()?;
        }

        let source = self.source.clone();
        let ids = self.ids.as_mut();
        let result = match &request {
            EditRequest::AddNode { kind } => edit::add_node(&source, *kind, ids),
            EditRequest::RemoveNode { id } => edit::remove_node(&source, id),
            EditRequest::ToggleConnection { from, to } => {
                edit::toggle_connection(&source, from, to)
            }
            EditRequest::AddConnection { from, to, kind } => {
                edit::add_connection(&source, from, to, *kind)
            }
            EditRequest::RemoveConnection { from, to, kind } => {
                edit::remove_connection(&source, from, to, *kind)
            }
            EditRequest::CreateChildNode {
                parent,
                drop,
                placement,
            } => {
                let placement =
                    resolve_placement(self.geometry.as_ref(), *drop, placement.clone());
                edit::create_child_node(&source, parent, &placement, ids)
            }
            EditRequest::ChangeNodeShape { id, shape } => {
                edit::change_node_shape(&source, id, *shape)
            }
            EditRequest::RelabelNode { id, label } => edit::relabel_node(&source, id, label),
            EditRequest::WrapInSubgraph { nodes, name } => {
                edit::wrap_in_subgraph(&source, nodes, name, ids)
            }
            EditRequest::UngroupSubgraph { id } => edit::ungroup_subgraph(&source, id),
            EditRequest::DeleteSubgraph { id } => edit::delete_subgraph(&source, id),
            EditRequest::RenameSubgraph { id, name } => edit::rename_subgraph(&source, id, name),
            EditRequest::SplitNode { id, plan } => edit::split_node(&source, id, plan, ids),
        };

        let edit = result?;
        let description = request.describe();
        debug!(description = %description, created = ?edit.created, "applied edit");
        if !edit.dangling.is_empty() {
            warn!(count = edit.dangling.len(), "edit left dangling connections");
        }
        self.commit(edit.source.clone(), description);
        Ok(edit)
    }

    /// Replaces the buffer with hand-edited text. Returns false when nothing changed.
    pub fn replace_source(&mut self, source: &str) -> bool {
        if source == self.source {
            return false;
        }
        self.commit(source.to_string(), "Edit source".to_string());
        true
    }

    pub fn set_title(&mut self, title: &str) -> bool {
        let title = title.trim();
        if title == self.title {
            return false;
        }
        self.title = title.to_string();
        let source = self.source.clone();
        self.commit(source, format!("Rename chart to \"{title}\""));
        true
    }

    pub fn undo(&mut self) -> Result<HistoryEntry, EditorError> {
        let entry = self.history.undo()?.clone();
        self.restore(&entry);
        Ok(entry)
    }

    pub fn redo(&mut self) -> Result<HistoryEntry, EditorError> {
        let entry = self.history.redo()?.clone();
        self.restore(&entry);
        Ok(entry)
    }

    /// Geometry measured by a client-side renderer replaces the built-in layout.
    pub fn set_geometry(&mut self, geometry: LayoutGeometry) {
        self.geometry = Some(geometry);
        self.render_error = None;
    }

    pub fn click(&mut self, point: Point, additive: bool) {
        let Some(geometry) = self.geometry.as_ref() else {
            return;
        };
        if let Some(id) = selection::node_at(geometry, point) {
            if additive {
                self.selection.toggle(id);
            } else {
                self.selection.select_only(id);
            }
        } else if let Some(subgraph) = selection::subgraph_at(geometry, point) {
            self.selection.focus_subgraph(Some(subgraph));
        } else if !additive {
            self.selection.clear();
        }
    }

    /// Pointer down: on a node this starts a link drag, elsewhere a marquee.
    pub fn press(&mut self, point: Point) {
        let hit = self
            .geometry
            .as_ref()
            .and_then(|geometry| selection::node_at(geometry, point))
            .map(str::to_string);
        self.drag = Some(match hit {
            Some(from) => Drag::Edge { from, start: point },
            None => {
                self.selection.begin_marquee(point);
                Drag::Marquee { start: point }
            }
        });
    }

    pub fn drag_to(&mut self, point: Point) {
        if matches!(self.drag, Some(Drag::Marquee { .. })) {
            self.selection.update_marquee(point);
        }
    }

    /// Pointer up. A short travel is a click; a link drag ending on another node
    /// toggles the connection, ending on empty canvas creates a child there.
    pub fn release(&mut self, point: Point, additive: bool) -> Result<Option<Edit>, EditorError> {
        let Some(drag) = self.drag.take() else {
            return Ok(None);
        };
        let threshold = self.config.drag_threshold;

        match drag {
            Drag::Edge { from, start } => {
                if start.distance(point) < threshold {
                    self.click(point, additive);
                    return Ok(None);
                }
                let target = self
                    .geometry
                    .as_ref()
                    .and_then(|geometry| selection::node_at(geometry, point))
                    .map(str::to_string);
                match target {
                    Some(to) if to == from => Ok(None),
                    Some(to) => self.apply(EditRequest::ToggleConnection { from, to }).map(Some),
                    None => self
                        .apply(EditRequest::CreateChildNode {
                            parent: from,
                            drop: Some(point),
                            placement: None,
                        })
                        .map(Some),
                }
            }
            Drag::Marquee { start } => {
                if start.distance(point) < threshold {
                    self.selection.marquee = None;
                    self.click(point, additive);
                    return Ok(None);
                }
                self.selection.update_marquee(point);
                if let Some(geometry) = self.geometry.as_ref() {
                    self.selection.finish_marquee(geometry, additive);
                } else {
                    self.selection.marquee = None;
                }
                Ok(None)
            }
        }
    }

    /// Claims the single AI slot.
    pub fn begin_assist(&mut self) -> Result<AssistTicket, EditorError> {
        if self.assist_in_flight {
            return Err(EditorError::Busy);
        }
        self.assist_in_flight = true;
        Ok(AssistTicket {
            version: self.version,
        })
    }

    /// Applies an AI-produced request if the buffer has not moved on since the ticket.
    pub fn apply_assisted(
        &mut self,
        ticket: AssistTicket,
        request: EditRequest,
    ) -> Result<Edit, EditorError> {
        if ticket.version != self.version {
            warn!(
                ticket = ticket.version,
                current = self.version,
                "discarding stale AI result"
            );
            return Err(EditorError::Stale);
        }
        self.apply(request)
    }

    pub fn end_assist(&mut self) {
        self.assist_in_flight = false;
    }

    /// Labels of the selected nodes, in selection order.
    pub fn selected_labels(&self) -> Vec<String> {
        let Ok(diagram) = Diagram::parse(&self.source) else {
            return Vec::new();
        };
        self.selection
            .nodes
            .iter()
            .filter_map(|id| diagram.find_node(id).map(|info| info.label))
            .collect()
    }

    /// Node label plus the labels of its neighbours, for a split request.
    pub fn split_input(&self, id: &str) -> Result<(String, SplitContext), Rejection> {
        let diagram = Diagram::parse(&self.source)?;
        let node = diagram
            .find_node(id)
            .ok_or_else(|| Rejection::NodeNotFound(id.to_string()))?;
        let connections = diagram.connections(id);
        let label_of = |other: &String| {
            diagram
                .find_node(other)
                .map(|info| info.label)
                .unwrap_or_else(|| other.clone())
        };
        let context = SplitContext {
            incoming: connections.incoming.iter().map(label_of).collect(),
            outgoing: connections.outgoing.iter().map(label_of).collect(),
        };
        Ok((node.label, context))
    }

    pub fn export_envelope(&self) -> Result<String, EditorError> {
        Ok(Envelope::new(&self.title, &self.source).to_json()?)
    }

    /// Loads an exported chart. Nothing changes unless the envelope is complete.
    pub fn import_envelope(&mut self, json: &str) -> Result<(), EditorError> {
        if self.assist_in_flight {
            return Err(EditorError::Busy);
        }
        let envelope = Envelope::from_json(json)?;
        self.title = envelope.title;
        self.selection.clear();
        self.commit(envelope.mermaid_code, "Import".to_string());
        Ok(())
    }

    fn commit(&mut self, source: String, description: String) {
        self.source = source;
        self.history.record(&self.title, &self.source, description);
        self.after_change();
    }

    fn restore(&mut self, entry: &HistoryEntry) {
        self.title = entry.title.clone();
        self.source = entry.source.clone();
        self.after_change();
    }

    fn after_change(&mut self) {
        self.version += 1;
        if let Ok(diagram) = Diagram::parse(&self.source) {
            self.selection.prune(&diagram);
        }
        self.render();
    }

    /// Render failures are recorded; the text is never rolled back.
    fn render(&mut self) {
        match self.renderer.render(&self.source) {
            Ok(geometry) => {
                self.geometry = Some(geometry);
                self.render_error = None;
            }
            Err(err) => {
                warn!(error = %err, "render failed");
                self.render_error = Some(err.to_string());
            }
        }
    }
}

fn resolve_placement(
    geometry: Option<&LayoutGeometry>,
    drop: Option<Point>,
    placement: Option<Placement>,
) -> Placement {
    if let Some(placement) = placement {
        return placement;
    }
    match (geometry, drop) {
        (Some(geometry), Some(point)) => match selection::subgraph_at(geometry, point) {
            Some(subgraph) => Placement::Subgraph(subgraph.to_string()),
            None => Placement::Root,
        },
        _ => Placement::WithParent,
    }
}
