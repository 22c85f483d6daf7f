use std::collections::HashSet;

use anyhow::Result;
use flowpad::config::EditorConfig;
use flowpad::edit::{self, SequentialIds, SplitPlan, TimestampIds};
use flowpad::history::History;
use flowpad::{Diagram, Edge, EditRequest, Editor, EditorError, NodeKind, NodeShape, Rejection};
use pretty_assertions::assert_eq;

const SAMPLE: &str = "graph LR\n    A[Start] --> B[Mid]\n    B --> C[End]\n";

fn edge_set(diagram: &Diagram) -> HashSet<Edge> {
    diagram.edges().into_iter().collect()
}

fn labelled_nodes(diagram: &Diagram) -> HashSet<(String, String)> {
    diagram
        .node_ids()
        .filter_map(|id| diagram.find_node(id))
        .map(|info| (info.id, info.label))
        .collect()
}

#[test]
fn removing_a_missing_node_changes_nothing() -> Result<()> {
    let charts = [
        SAMPLE,
        "graph TD\n",
        "flowchart TB\n    subgraph S [\"Box\"]\n        X[x]\n    end\n    X --> Y\n",
    ];
    for chart in charts {
        let result = edit::remove_node(chart, "Missing");
        assert_eq!(result, Err(Rejection::NodeNotFound("Missing".into())));
        assert_eq!(edit::or_unchanged(chart, result), chart);
    }

    let mut editor = Editor::new("Flow", SAMPLE, EditorConfig::default());
    let err = editor
        .apply(EditRequest::RemoveNode {
            id: "Missing".into(),
        })
        .unwrap_err();
    assert!(matches!(err, EditorError::Rejected(Rejection::NodeNotFound(_))));
    assert_eq!(editor.source(), SAMPLE);
    assert_eq!(editor.history().len(), 1);
    Ok(())
}

#[test]
fn toggling_twice_restores_the_connection_set() -> Result<()> {
    let original = Diagram::parse(SAMPLE)?;

    let once = edit::toggle_connection(SAMPLE, "A", "B")?;
    let after_once = Diagram::parse(&once.source)?;
    assert_eq!(after_once.edges(), vec![Edge::new("B", "C", flowpad::EdgeKind::Plain)]);
    assert_eq!(labelled_nodes(&after_once), labelled_nodes(&original));

    let twice = edit::toggle_connection(&once.source, "A", "B")?;
    let after_twice = Diagram::parse(&twice.source)?;
    assert_eq!(edge_set(&after_twice), edge_set(&original));
    assert_eq!(labelled_nodes(&after_twice), labelled_nodes(&original));
    Ok(())
}

#[test]
fn wrap_then_ungroup_restores_structure() -> Result<()> {
    let chart = "graph TD\n    A[a] --> B[b]\n    B --> C[c]\n    subgraph Old [\"Old\"]\n        D[d]\n    end\n    C --> D\n";
    let original = Diagram::parse(chart)?;
    let nodes = vec!["A".to_string(), "B".to_string(), "C".to_string()];

    let wrapped = edit::wrap_in_subgraph(chart, &nodes, "Group", &mut SequentialIds::default())?;
    let group_id = wrapped.created[0].clone();
    let grouped = Diagram::parse(&wrapped.source)?;
    assert_eq!(grouped.subgraphs().len(), original.subgraphs().len() + 1);
    assert_eq!(grouped.subgraph_members(&group_id).len(), 3);

    let ungrouped = edit::ungroup_subgraph(&wrapped.source, &group_id)?;
    let restored = Diagram::parse(&ungrouped.source)?;
    assert_eq!(restored.subgraphs().len(), original.subgraphs().len());
    assert_eq!(labelled_nodes(&restored), labelled_nodes(&original));
    assert_eq!(edge_set(&restored), edge_set(&original));
    Ok(())
}

#[test]
fn split_moves_incoming_and_outgoing_edges() -> Result<()> {
    let chart = "graph TD\n    P[p] --> X[Work]\n    Q[q] --> X\n    X --> R[r]\n";
    let plan = SplitPlan::sequential(["Prepare", "Execute", "Review"]);
    let edit = edit::split_node(chart, "X", &plan, &mut SequentialIds::default())?;
    let diagram = Diagram::parse(&edit.source)?;

    assert_eq!(edit.created.len(), 3);
    for id in &edit.created {
        assert!(diagram.find_node(id).is_some_and(|info| info.declared));
    }
    let input = &edit.created[0];
    let output = &edit.created[2];
    assert_eq!(diagram.connections(input).incoming.len(), 2);
    assert_eq!(diagram.connections(output).outgoing.len(), 1);
    assert!(diagram.find_node("X").is_none());
    Ok(())
}

#[test]
fn history_drops_the_oldest_snapshot_past_capacity() {
    let mut history = History::new(3);
    for step in 0..4 {
        history.record("Flow", &format!("graph TD\n    N{step}\n"), format!("step {step}"));
    }
    assert_eq!(history.len(), 3);

    let mut reached = Vec::new();
    while let Ok(entry) = history.undo() {
        reached.push(entry.description.clone());
    }
    assert_eq!(reached, vec!["step 2", "step 1"]);
}

#[test]
fn editor_history_is_capped() -> Result<()> {
    let config = EditorConfig {
        max_history: 3,
        ..EditorConfig::default()
    };
    let mut editor = Editor::new("Flow", "graph TD\n", config).with_ids(SequentialIds::default());
    for _ in 0..3 {
        editor.apply(EditRequest::AddNode {
            kind: NodeKind::Process,
        })?;
    }
    assert_eq!(editor.history().len(), 3);

    editor.undo()?;
    editor.undo()?;
    assert!(matches!(editor.undo(), Err(EditorError::History(_))));
    assert_ne!(editor.source(), "graph TD\n");
    Ok(())
}

#[test]
fn wrapping_the_selection_into_intro() -> Result<()> {
    let mut editor = Editor::new("Flow", SAMPLE, EditorConfig::default());
    editor.selection_mut().add("A");
    editor.selection_mut().add("B");
    let nodes = editor.selection().nodes.clone();

    let edit = editor.apply(EditRequest::WrapInSubgraph {
        nodes,
        name: "Intro".into(),
    })?;

    let group_id = &edit.created[0];
    assert!(group_id.starts_with("Intro_"));
    assert!(edit.source.contains(&format!("subgraph {group_id} [\"Intro\"]")));
    assert!(edit.source.contains("\n    B --> C[End]\n"));

    let diagram = Diagram::parse(&edit.source)?;
    assert_eq!(diagram.find_node("A").map(|info| info.path), Some(vec![group_id.clone()]));
    assert_eq!(diagram.find_node("B").map(|info| info.path), Some(vec![group_id.clone()]));
    assert_eq!(diagram.find_node("C").map(|info| info.path), Some(Vec::new()));

    editor.undo()?;
    assert_eq!(editor.source(), SAMPLE);
    Ok(())
}

#[test]
fn adding_a_decision_to_an_empty_chart() -> Result<()> {
    let edit = edit::add_node("", NodeKind::Decision, &mut TimestampIds)?;
    let diagram = Diagram::parse(&edit.source)?;

    assert!(diagram.header.is_some());
    assert_eq!(diagram.node_count(), 1);
    let id = &edit.created[0];
    let suffix = id.strip_prefix("node_").unwrap_or_default();
    assert!(!suffix.is_empty() && suffix.chars().all(|ch| ch.is_ascii_digit()));

    let node = diagram.find_node(id).expect("new node should resolve");
    assert_eq!(node.shape, NodeShape::Diamond);
    assert_eq!(node.label, NodeKind::Decision.default_label());
    Ok(())
}
