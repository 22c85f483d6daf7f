#![cfg(feature = "server")]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use flowpad::assist::{AssistError, Assistant, GeminiAssistant, SplitContext};
use flowpad::config::AssistConfig;
use flowpad::edit::{self, SequentialIds};
use flowpad::{Diagram, EdgeKind};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Seen {
    call: String,
    key: Option<String>,
    prompt: String,
}

struct MockGemini {
    status: StatusCode,
    reply: Value,
    seen: Mutex<Vec<Seen>>,
}

async fn generate_content(
    State(mock): State<Arc<MockGemini>>,
    Path(call): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let prompt = body["contents"][0]["parts"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    mock.seen.lock().await.push(Seen {
        call,
        key: query.get("key").cloned(),
        prompt,
    });
    (mock.status, Json(mock.reply.clone()))
}

async fn spawn_mock(status: StatusCode, reply: Value) -> Result<(GeminiAssistant, Arc<MockGemini>)> {
    let mock = Arc::new(MockGemini {
        status,
        reply,
        seen: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/models/:call", post(generate_content))
        .with_state(mock.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let config = AssistConfig {
        api_key: Some("test-key".into()),
        model: "mock-model".into(),
        base_url: format!("http://{addr}/"),
        timeout_secs: 5,
    };
    Ok((GeminiAssistant::new(&config)?, mock))
}

fn candidate(text: &str, finish_reason: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"parts": [{"text": text}]},
            "finishReason": finish_reason
        }]
    })
}

#[tokio::test]
async fn group_name_comes_back_from_the_model() -> Result<()> {
    let (assistant, mock) = spawn_mock(
        StatusCode::OK,
        candidate("```json\n{\"groupName\": \"Onboarding\"}\n```", "STOP"),
    )
    .await?;

    let name = assistant
        .request_group_name(&["Sign up".to_string(), "Verify email".to_string()])
        .await?;
    assert_eq!(name, "Onboarding");

    let seen = mock.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].call, "mock-model:generateContent");
    assert_eq!(seen[0].key.as_deref(), Some("test-key"));
    assert!(seen[0].prompt.contains("- Sign up\n- Verify email"));
    Ok(())
}

#[tokio::test]
async fn unfinished_reply_is_a_failure() -> Result<()> {
    let (assistant, _mock) = spawn_mock(
        StatusCode::OK,
        candidate("{\"groupName\": \"Onboa", "MAX_TOKENS"),
    )
    .await?;

    let err = assistant
        .request_group_name(&["Sign up".to_string(), "Verify email".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AssistError::Truncated(reason) if reason == "MAX_TOKENS"));
    Ok(())
}

#[tokio::test]
async fn error_status_is_reported() -> Result<()> {
    let (assistant, _mock) = spawn_mock(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "quota"}}),
    )
    .await?;

    let err = assistant
        .request_group_name(&["Sign up".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AssistError::Status { status: 429, ref body } if body.contains("quota")));
    Ok(())
}

#[tokio::test]
async fn empty_labels_never_reach_the_network() -> Result<()> {
    let (assistant, mock) = spawn_mock(StatusCode::OK, candidate("{}", "STOP")).await?;

    let err = assistant
        .request_group_name(&["  ".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AssistError::EmptyInput(_)));
    assert!(mock.seen.lock().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn split_plan_is_ordered_and_applied() -> Result<()> {
    let reply = json!({
        "canSplit": true,
        "splits": [
            {"name": "Ship", "sequenceOrder": 3, "providesOutput": true},
            {"name": "Collect", "sequenceOrder": 1, "receivesInput": true},
            {"name": "Review", "sequenceOrder": 2}
        ],
        "internalConnections": [
            {"fromIndex": 1, "toIndex": 2, "kind": "plain"},
            {"fromIndex": 2, "toIndex": 0, "kind": "dashed"}
        ]
    });
    let (assistant, mock) =
        spawn_mock(StatusCode::OK, candidate(&reply.to_string(), "STOP")).await?;

    let context = SplitContext {
        incoming: vec!["Request".into()],
        outgoing: vec!["Done".into()],
    };
    let suggestion = assistant.request_node_split("Collect, review and ship", &context).await?;
    let plan = suggestion.into_plan()?;

    let names: Vec<&str> = plan.parts.iter().map(|part| part.name.as_str()).collect();
    assert_eq!(names, vec!["Collect", "Review", "Ship"]);
    assert_eq!(plan.input_index(), 0);
    assert_eq!(plan.output_index(), 2);
    let links = plan.links.clone().unwrap_or_default();
    assert_eq!(
        links
            .iter()
            .map(|link| (link.from_index, link.to_index, link.kind))
            .collect::<Vec<_>>(),
        vec![(0, 1, EdgeKind::Plain), (1, 2, EdgeKind::Conditional)]
    );
    assert!(mock.seen.lock().await[0].prompt.contains("Preceding steps: Request"));

    let chart = "graph TD\n    R[Request] --> W[Collect, review and ship] --> D[Done]\n";
    let edit = edit::split_node(chart, "W", &plan, &mut SequentialIds::default())?;
    let diagram = Diagram::parse(&edit.source)?;
    assert_eq!(diagram.connections(&edit.created[0]).incoming, vec!["R"]);
    assert_eq!(diagram.connections(&edit.created[2]).outgoing, vec!["D"]);
    Ok(())
}

#[tokio::test]
async fn declined_split_becomes_cannot_split() -> Result<()> {
    let (assistant, _mock) =
        spawn_mock(StatusCode::OK, candidate("{\"canSplit\": false}", "STOP")).await?;

    let suggestion = assistant
        .request_node_split("Sign up", &SplitContext::default())
        .await?;
    assert!(matches!(suggestion.into_plan(), Err(AssistError::CannotSplit)));
    Ok(())
}
