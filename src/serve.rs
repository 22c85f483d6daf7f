use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower::ServiceExt;
use tower::service_fn;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

use crate::assist::{AssistError, Assistant, GeminiAssistant};
use crate::config::{AssistConfig, EditorConfig};
use crate::edit::{Edit, MIN_GROUP_SIZE, Rejection};
use crate::editor::{EditRequest, Editor, EditorError, EditorState};
use crate::render::LayoutGeometry;
use crate::selection::{Point, Selection};
use crate::utils::{merge_title, split_title};

type ApiError = (StatusCode, String);

/// Arguments for running the flowpad edit-sync server
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Chart file (.mmd) to edit.
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 5151)]
    pub port: u16,

    /// Directory with a built web UI to serve for non-API paths.
    #[arg(long = "ui-dir")]
    pub ui_dir: Option<PathBuf>,
}

/// Saves happen while the editor write lock is held, so the file always ends
/// with the latest committed buffer.
pub struct ServeState {
    source_path: PathBuf,
    editor: RwLock<Editor>,
    assistant: Option<GeminiAssistant>,
}

impl ServeState {
    pub fn new(source_path: PathBuf, editor: Editor, assistant: Option<GeminiAssistant>) -> Self {
        Self {
            source_path,
            editor: RwLock::new(editor),
            assistant,
        }
    }

    async fn persist(&self, editor: &Editor) -> Result<()> {
        let contents = merge_title(editor.title(), editor.source());
        tokio::fs::write(&self.source_path, contents.as_bytes())
            .await
            .with_context(|| format!("failed to write '{}'", self.source_path.display()))?;
        info!(path = %self.source_path.display(), "saved chart");
        Ok(())
    }

    /// Runs `action` under the editor lock, saves the result and returns the new state.
    async fn mutate<T>(
        &self,
        action: impl FnOnce(&mut Editor) -> Result<T, EditorError>,
    ) -> Result<(T, EditorState), ApiError> {
        let mut editor = self.editor.write().await;
        let value = action(&mut *editor).map_err(editor_error)?;
        self.persist(&editor).await.map_err(internal_error)?;
        Ok((value, editor.state()))
    }

    fn assistant(&self) -> Result<&GeminiAssistant, ApiError> {
        self.assistant
            .as_ref()
            .ok_or_else(|| assist_error(AssistError::Disabled))
    }
}

#[derive(Debug, Deserialize)]
struct SourceUpdateRequest {
    source: String,
}

#[derive(Debug, Deserialize)]
struct TitleUpdateRequest {
    title: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EditPayload {
    edit: Option<Edit>,
    state: EditorState,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum GestureRequest {
    Click {
        x: f32,
        y: f32,
        #[serde(default)]
        additive: bool,
    },
    Press {
        x: f32,
        y: f32,
    },
    Drag {
        x: f32,
        y: f32,
    },
    Release {
        x: f32,
        y: f32,
        #[serde(default)]
        additive: bool,
    },
}

#[derive(Debug, Default, Deserialize)]
struct GroupAssistRequest {
    /// Defaults to the current selection.
    #[serde(default)]
    nodes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SplitAssistRequest {
    id: String,
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let contents = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("failed to read '{}'", args.input.display()))?;
    let (title, definition) = split_title(&contents);
    let title = title.unwrap_or_else(|| default_title(&args.input));

    let editor = Editor::new(&title, &definition, EditorConfig::default());
    if let Some(err) = editor.render_error() {
        warn!(error = err, "chart does not render yet");
    }

    let assistant = match GeminiAssistant::new(&AssistConfig::default()) {
        Ok(assistant) => {
            info!(model = assistant.model(), "AI assistance enabled");
            Some(assistant)
        }
        Err(AssistError::Disabled) => {
            info!("GEMINI_API_KEY not set; AI assistance disabled");
            None
        }
        Err(err) => return Err(err).context("failed to initialise AI assistant"),
    };

    let state = Arc::new(ServeState::new(args.input.clone(), editor, assistant));
    let mut app = router(state);

    if let Some(root) = args.ui_dir {
        let static_dir = ServeDir::new(root.clone())
            .append_index_html_on_directories(true)
            .fallback(ServeFile::new(root.join("index.html")));

        let static_service = service_fn(move |req| {
            let svc = static_dir.clone();
            async move {
                match svc.oneshot(req).await {
                    Ok(response) => Ok(response.map(axum::body::Body::new)),
                    Err(error) => {
                        let message = format!("Static file error: {error}");
                        Ok((StatusCode::INTERNAL_SERVER_ERROR, message).into_response())
                    }
                }
            }
        });

        app = app.fallback_service(static_service);
    }

    let app = app.layer(CorsLayer::permissive());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP server to {addr}"))?;

    info!(%addr, path = %args.input.display(), "server started");
    println!("flowpad server listening on http://{addr}");
    println!("Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server error")?;

    info!("server stopped");
    Ok(())
}

pub fn router(state: Arc<ServeState>) -> Router {
    Router::new()
        .route("/api/diagram", get(get_diagram))
        .route("/api/diagram/source", put(put_source))
        .route("/api/diagram/title", put(put_title))
        .route("/api/diagram/geometry", put(put_geometry))
        .route("/api/diagram/edit", post(post_edit))
        .route("/api/diagram/undo", post(post_undo))
        .route("/api/diagram/redo", post(post_redo))
        .route("/api/selection", put(put_selection))
        .route("/api/gesture", post(post_gesture))
        .route("/api/assist/group", post(post_assist_group))
        .route("/api/assist/split", post(post_assist_split))
        .route("/api/export", get(get_export))
        .route("/api/import", post(post_import))
        .with_state(state)
}

fn default_title(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled".to_string())
}

async fn get_diagram(State(state): State<Arc<ServeState>>) -> Json<EditorState> {
    Json(state.editor.read().await.state())
}

async fn put_source(
    State(state): State<Arc<ServeState>>,
    Json(payload): Json<SourceUpdateRequest>,
) -> Result<Json<EditorState>, ApiError> {
    let (_, snapshot) = state
        .mutate(|editor| Ok(editor.replace_source(&payload.source)))
        .await?;
    Ok(Json(snapshot))
}

async fn put_title(
    State(state): State<Arc<ServeState>>,
    Json(payload): Json<TitleUpdateRequest>,
) -> Result<Json<EditorState>, ApiError> {
    let (_, snapshot) = state
        .mutate(|editor| Ok(editor.set_title(&payload.title)))
        .await?;
    Ok(Json(snapshot))
}

async fn put_geometry(
    State(state): State<Arc<ServeState>>,
    Json(geometry): Json<LayoutGeometry>,
) -> StatusCode {
    state.editor.write().await.set_geometry(geometry);
    StatusCode::NO_CONTENT
}

async fn post_edit(
    State(state): State<Arc<ServeState>>,
    Json(request): Json<EditRequest>,
) -> Result<Json<EditPayload>, ApiError> {
    let (edit, snapshot) = state.mutate(|editor| editor.apply(request)).await?;
    Ok(Json(EditPayload {
        edit: Some(edit),
        state: snapshot,
    }))
}

async fn post_undo(State(state): State<Arc<ServeState>>) -> Result<Json<EditorState>, ApiError> {
    let (_, snapshot) = state.mutate(|editor| editor.undo()).await?;
    Ok(Json(snapshot))
}

async fn post_redo(State(state): State<Arc<ServeState>>) -> Result<Json<EditorState>, ApiError> {
    let (_, snapshot) = state.mutate(|editor| editor.redo()).await?;
    Ok(Json(snapshot))
}

async fn put_selection(
    State(state): State<Arc<ServeState>>,
    Json(selection): Json<Selection>,
) -> Result<Json<EditorState>, ApiError> {
    let mut editor = state.editor.write().await;
    let diagram = editor.diagram().map_err(|err| editor_error(err.into()))?;
    let selected = editor.selection_mut();
    *selected = selection;
    selected.prune(&diagram);
    Ok(Json(editor.state()))
}

async fn post_gesture(
    State(state): State<Arc<ServeState>>,
    Json(gesture): Json<GestureRequest>,
) -> Result<Json<EditPayload>, ApiError> {
    let mut editor = state.editor.write().await;
    let edit = match gesture {
        GestureRequest::Click { x, y, additive } => {
            editor.click(Point::new(x, y), additive);
            None
        }
        GestureRequest::Press { x, y } => {
            editor.press(Point::new(x, y));
            None
        }
        GestureRequest::Drag { x, y } => {
            editor.drag_to(Point::new(x, y));
            None
        }
        GestureRequest::Release { x, y, additive } => editor
            .release(Point::new(x, y), additive)
            .map_err(editor_error)?,
    };

    if edit.is_some() {
        state.persist(&editor).await.map_err(internal_error)?;
    }
    Ok(Json(EditPayload {
        edit,
        state: editor.state(),
    }))
}

async fn post_assist_group(
    State(state): State<Arc<ServeState>>,
    payload: Option<Json<GroupAssistRequest>>,
) -> Result<Json<EditPayload>, ApiError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();

    let (assistant, ticket, nodes, labels) = {
        let mut editor = state.editor.write().await;
        if editor.is_assist_in_flight() {
            return Err(editor_error(EditorError::Busy));
        }

        let mut selection = editor.selection().clone();
        if let Some(nodes) = request.nodes {
            selection.nodes.clear();
            for id in &nodes {
                selection.add(id);
            }
        }
        if selection.nodes.len() < MIN_GROUP_SIZE {
            let rejection = Rejection::TooFewNodes {
                required: MIN_GROUP_SIZE,
                got: selection.nodes.len(),
            };
            return Err(editor_error(rejection.into()));
        }
        let assistant = state.assistant()?;

        let ticket = editor.begin_assist().map_err(editor_error)?;
        let nodes = selection.nodes.clone();
        *editor.selection_mut() = selection;
        (assistant, ticket, nodes, editor.selected_labels())
    };

    let reply = assistant.request_group_name(&labels).await;
    let mut editor = state.editor.write().await;
    editor.end_assist();
    let name = reply.map_err(assist_error)?;
    let edit = editor
        .apply_assisted(ticket, EditRequest::WrapInSubgraph { nodes, name })
        .map_err(editor_error)?;
    state.persist(&editor).await.map_err(internal_error)?;
    Ok(Json(EditPayload {
        edit: Some(edit),
        state: editor.state(),
    }))
}

async fn post_assist_split(
    State(state): State<Arc<ServeState>>,
    Json(request): Json<SplitAssistRequest>,
) -> Result<Json<EditPayload>, ApiError> {
    let assistant = state.assistant()?;

    let (ticket, text, context) = {
        let mut editor = state.editor.write().await;
        let (text, context) = editor
            .split_input(&request.id)
            .map_err(|err| editor_error(err.into()))?;
        let ticket = editor.begin_assist().map_err(editor_error)?;
        (ticket, text, context)
    };

    let reply = assistant.request_node_split(&text, &context).await;
    let mut editor = state.editor.write().await;
    editor.end_assist();
    let plan = reply
        .and_then(|suggestion| suggestion.into_plan())
        .map_err(assist_error)?;
    let edit = editor
        .apply_assisted(
            ticket,
            EditRequest::SplitNode {
                id: request.id,
                plan,
            },
        )
        .map_err(editor_error)?;
    state.persist(&editor).await.map_err(internal_error)?;
    Ok(Json(EditPayload {
        edit: Some(edit),
        state: editor.state(),
    }))
}

async fn get_export(State(state): State<Arc<ServeState>>) -> Result<Response, ApiError> {
    let json = state
        .editor
        .read()
        .await
        .export_envelope()
        .map_err(editor_error)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], json).into_response())
}

async fn post_import(
    State(state): State<Arc<ServeState>>,
    body: String,
) -> Result<Json<EditorState>, ApiError> {
    let (_, snapshot) = state
        .mutate(|editor| editor.import_envelope(&body))
        .await?;
    Ok(Json(snapshot))
}

fn editor_error(err: EditorError) -> ApiError {
    let status = match &err {
        EditorError::Rejected(_) | EditorError::Envelope(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EditorError::Busy | EditorError::Stale | EditorError::History(_) => StatusCode::CONFLICT,
    };
    (status, err.to_string())
}

fn assist_error(err: AssistError) -> ApiError {
    let status = match &err {
        AssistError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
        AssistError::EmptyInput(_) | AssistError::CannotSplit => StatusCode::UNPROCESSABLE_ENTITY,
        AssistError::Transport(_)
        | AssistError::Status { .. }
        | AssistError::Truncated(_)
        | AssistError::Malformed(_) => StatusCode::BAD_GATEWAY,
    };
    warn!(error = %err, "AI request failed");
    (status, err.to_string())
}

fn internal_error(err: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::SequentialIds;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};

    fn test_state(dir: &tempfile::TempDir) -> Arc<ServeState> {
        let path = dir.path().join("chart.mmd");
        let editor = Editor::new(
            "Chart",
            "graph LR\n    A[Start] --> B[Mid]\n    B --> C[End]\n",
            EditorConfig {
                max_history: 50,
                strict_parsing: false,
                drag_threshold: 5.0,
            },
        )
        .with_ids(SequentialIds::default());
        Arc::new(ServeState::new(path, editor, None))
    }

    async fn send(app: Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn edit_is_applied_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = router(state.clone());

        let (status, body) = send(
            app,
            "POST",
            "/api/diagram/edit",
            json!({"op": "toggle_connection", "from": "A", "to": "B"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["version"], 1);

        let saved = std::fs::read_to_string(dir.path().join("chart.mmd")).unwrap();
        assert!(saved.starts_with("%% title: Chart\ngraph LR\n"));
        assert!(!saved.contains("A[Start] --> B[Mid]"));
    }

    #[tokio::test]
    async fn rejections_and_empty_history_map_to_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let (status, _) = send(
            router(state.clone()),
            "POST",
            "/api/diagram/edit",
            json!({"op": "remove_node", "id": "Z"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(router(state.clone()), "POST", "/api/diagram/undo", json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            router(state),
            "POST",
            "/api/assist/group",
            json!({"nodes": ["A", "B"]}),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_edits_leave_the_latest_buffer_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let mut requests = Vec::new();
        for _ in 0..16 {
            let app = router(state.clone());
            requests.push(tokio::spawn(async move {
                send(
                    app,
                    "POST",
                    "/api/diagram/edit",
                    json!({"op": "add_node", "kind": "process"}),
                )
                .await
                .0
            }));
        }
        for request in requests {
            assert_eq!(request.await.unwrap(), StatusCode::OK);
        }

        let editor = state.editor.read().await;
        assert_eq!(editor.version(), 16);
        let saved = std::fs::read_to_string(dir.path().join("chart.mmd")).unwrap();
        assert_eq!(saved, merge_title(editor.title(), editor.source()));
    }

    #[tokio::test]
    async fn group_assist_checks_preconditions_before_calling_out() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let (status, _) = send(
            router(state.clone()),
            "POST",
            "/api/assist/group",
            json!({"nodes": ["A"]}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        state.editor.write().await.begin_assist().unwrap();
        let (status, _) = send(
            router(state.clone()),
            "POST",
            "/api/assist/group",
            json!({"nodes": ["B", "C"]}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let editor = state.editor.read().await;
        assert!(editor.selection().nodes.is_empty());
        assert_eq!(editor.version(), 0);
    }
}
