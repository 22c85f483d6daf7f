use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use flowpad::assist::{Assistant, GeminiAssistant};
use flowpad::config::{AssistConfig, EditorConfig};
use flowpad::diagram::{Diagram, Edge, NodeInfo, ParseMode, SubgraphInfo};
use flowpad::edit::{Edit, Placement, SplitPlan};
use flowpad::envelope::Envelope;
use flowpad::render;
use flowpad::utils::{merge_title, split_title};
use flowpad::{Direction, EdgeKind, EditRequest, Editor, NodeKind, NodeShape};
#[cfg(feature = "server")]
use flowpad::serve::{ServeArgs, run_serve};

const DEFAULT_NEW_DIAGRAM_NAME: &str = "diagram.mmd";

#[derive(Debug, Parser)]
#[command(
    name = "flowpad",
    version,
    about = "Edit Mermaid flowcharts from the command line or a local editor server."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty chart file.
    New(NewArgs),
    /// Print the nodes, connections and subgraphs of a chart.
    Show(ShowArgs),
    /// Parse a chart and report problems.
    Check(CheckArgs),
    /// Print the computed node and subgraph boxes as JSON.
    Layout(InputArgs),
    /// Write a chart as a JSON export envelope.
    Export(ExportArgs),
    /// Turn a JSON export envelope back into a chart file.
    Import(ImportArgs),
    /// Apply one structural edit to a chart file.
    Edit(EditArgs),
    /// Start the editor server.
    #[cfg(feature = "server")]
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Path to the chart. Use '-' to read from stdin.
    #[arg(short = 'i', long = "input")]
    input: Option<String>,
}

#[derive(Debug, Args)]
struct NewArgs {
    /// Target file; a numeric suffix is added if it already exists.
    path: Option<PathBuf>,

    #[arg(long)]
    title: Option<String>,

    #[arg(short = 'd', long, default_value = "TD")]
    direction: Direction,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Reject lines the parser would otherwise pass through untouched.
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Destination file. Use '-' (the default) for stdout.
    #[arg(short = 'o', long = "output")]
    output: Option<String>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Export envelope to read. Use '-' for stdin.
    envelope: String,

    /// Destination chart file. Use '-' (the default) for stdout.
    #[arg(short = 'o', long = "output")]
    output: Option<String>,
}

#[derive(Debug, Args)]
struct EditArgs {
    /// Chart file to rewrite in place.
    file: PathBuf,

    /// Print the result instead of saving it.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: EditCommand,
}

#[derive(Debug, Subcommand)]
enum EditCommand {
    /// Append a node of the given kind (start, process, decision, end).
    AddNode {
        #[arg(default_value = "process")]
        kind: NodeKind,
    },
    /// Remove a node and every connection touching it.
    RemoveNode { id: String },
    /// Add a connection.
    Connect {
        from: String,
        to: String,
        #[arg(long, default_value = "solid")]
        kind: EdgeKind,
    },
    /// Remove a connection.
    Disconnect {
        from: String,
        to: String,
        #[arg(long, default_value = "solid")]
        kind: EdgeKind,
    },
    /// Add the solid connection if it is missing, remove it otherwise.
    Toggle { from: String, to: String },
    /// Create a process node linked from a parent.
    Child {
        parent: String,
        /// Put the child at the top level instead of next to its parent.
        #[arg(long, conflicts_with = "subgraph")]
        root: bool,
        /// Put the child inside this subgraph.
        #[arg(long)]
        subgraph: Option<String>,
    },
    /// Change a node's shape (rect, round, diamond, hexagon).
    Shape { id: String, shape: NodeShape },
    /// Change a node's label.
    Relabel { id: String, label: String },
    /// Wrap nodes into a new subgraph.
    Group {
        #[arg(required = true, num_args = 2..)]
        nodes: Vec<String>,
        #[arg(long, required_unless_present = "ai", conflicts_with = "ai")]
        name: Option<String>,
        /// Ask the generative API for the subgraph name.
        #[arg(long)]
        ai: bool,
    },
    /// Dissolve a subgraph, keeping its contents.
    Ungroup { id: String },
    /// Delete a subgraph together with the nodes declared in it.
    DeleteSubgraph { id: String },
    /// Rename a subgraph.
    RenameSubgraph { id: String, name: String },
    /// Replace a node with a sequence of new nodes.
    Split {
        id: String,
        /// Part names in order. The first receives input, the last provides output.
        #[arg(long = "part", required_unless_present = "ai", conflicts_with = "ai")]
        parts: Vec<String>,
        /// Ask the generative API for the parts.
        #[arg(long)]
        ai: bool,
    },
}

#[derive(Debug)]
enum InputSource {
    Stdin,
    File(PathBuf),
}

#[derive(Debug)]
enum OutputDestination {
    Stdout,
    File(PathBuf),
}

#[derive(Debug, Serialize)]
struct ChartSummary {
    title: Option<String>,
    direction: Direction,
    nodes: Vec<NodeInfo>,
    edges: Vec<Edge>,
    subgraphs: Vec<SubgraphInfo>,
}

pub async fn dispatch() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::New(args) => run_new(args),
        Command::Show(args) => run_show(args),
        Command::Check(args) => run_check(args),
        Command::Layout(args) => run_layout(args),
        Command::Export(args) => run_export(args),
        Command::Import(args) => run_import(args),
        Command::Edit(args) => run_edit(args).await,
        #[cfg(feature = "server")]
        Command::Serve(args) => run_serve(args).await,
    }
}

fn run_new(args: NewArgs) -> Result<()> {
    let mut target_path = args
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_NEW_DIAGRAM_NAME));
    if target_path.extension().is_none() {
        target_path.set_extension("mmd");
    }

    if let Some(parent) = target_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory '{}'", parent.display()))?;
        }
    }

    let target_path = ensure_unique_path(target_path);
    let title = args.title.unwrap_or_else(|| title_from_path(&target_path));
    let definition = format!("graph {}\n", args.direction.as_token());
    fs::write(&target_path, merge_title(&title, &definition))
        .with_context(|| format!("failed to write '{}'", target_path.display()))?;

    println!("Created {}", target_path.display());
    Ok(())
}

fn run_show(args: ShowArgs) -> Result<()> {
    let source = parse_input(args.input.input.as_deref())?;
    let (title, definition) = split_title(&load_definition(&source)?);
    let diagram = Diagram::parse(&definition).context("failed to parse chart")?;

    let summary = ChartSummary {
        title,
        direction: diagram.direction(),
        nodes: diagram
            .node_ids()
            .filter_map(|id| diagram.find_node(id))
            .collect(),
        edges: diagram.edges(),
        subgraphs: diagram.subgraphs(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    if let Some(title) = &summary.title {
        println!("{title}");
    }
    println!("direction {}", summary.direction.as_token());
    println!("nodes ({})", summary.nodes.len());
    for node in &summary.nodes {
        let scope = if node.path.is_empty() {
            String::new()
        } else {
            format!("  in {}", node.path.join("/"))
        };
        println!("  {} [{}] \"{}\"{scope}", node.id, node.shape, node.label);
    }
    println!("connections ({})", summary.edges.len());
    for edge in &summary.edges {
        println!("  {edge}");
    }
    if !summary.subgraphs.is_empty() {
        println!("subgraphs ({})", summary.subgraphs.len());
        for subgraph in &summary.subgraphs {
            let indent = "  ".repeat(subgraph.level + 1);
            match &subgraph.name {
                Some(name) => println!("{indent}{} \"{name}\"", subgraph.id),
                None => println!("{indent}{}", subgraph.id),
            }
        }
    }
    Ok(())
}

fn run_check(args: CheckArgs) -> Result<()> {
    let source = parse_input(args.input.input.as_deref())?;
    let (_, definition) = split_title(&load_definition(&source)?);
    let mode = if args.strict {
        ParseMode::Strict
    } else {
        EditorConfig::default().parse_mode()
    };
    let diagram = Diagram::parse_with(&definition, mode).context("chart does not parse")?;

    let undeclared = diagram.undeclared_references();
    if undeclared.is_empty() {
        println!(
            "ok: {} nodes, {} connections, {} subgraphs",
            diagram.node_count(),
            diagram.edges().len(),
            diagram.subgraphs().len()
        );
        return Ok(());
    }

    for edge in &undeclared {
        println!("undeclared endpoint: {edge}");
    }
    bail!("{} connection(s) refer to undeclared nodes", undeclared.len())
}

fn run_layout(args: InputArgs) -> Result<()> {
    let source = parse_input(args.input.as_deref())?;
    let (_, definition) = split_title(&load_definition(&source)?);
    let diagram = Diagram::parse(&definition).context("failed to parse chart")?;
    if diagram.header.is_none() {
        bail!("chart has no 'graph' or 'flowchart' header");
    }
    let geometry = render::layout(&diagram);
    println!("{}", serde_json::to_string_pretty(&geometry)?);
    Ok(())
}

fn run_export(args: ExportArgs) -> Result<()> {
    let source = parse_input(args.input.input.as_deref())?;
    let (title, definition) = split_title(&load_definition(&source)?);
    let title = title.unwrap_or_else(|| match &source {
        InputSource::File(path) => title_from_path(path),
        InputSource::Stdin => "Untitled".to_string(),
    });

    let json = Envelope::new(&title, &definition).to_json()?;
    let destination = parse_output(args.output.as_deref())?;
    write_output(destination, format!("{json}\n").as_bytes())
}

fn run_import(args: ImportArgs) -> Result<()> {
    let source = parse_input(Some(&args.envelope))?;
    let envelope = Envelope::from_json(&load_definition(&source)?)
        .context("failed to read export envelope")?;
    let chart = merge_title(&envelope.title, &envelope.mermaid_code);
    let destination = parse_output(args.output.as_deref())?;
    write_output(destination, chart.as_bytes())
}

async fn run_edit(args: EditArgs) -> Result<()> {
    let path = args.file;
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read '{}'", path.display()))?;
    let (title, definition) = split_title(&contents);
    let title = title.unwrap_or_else(|| title_from_path(&path));
    let mut editor: Editor = Editor::new(&title, &definition, EditorConfig::default());

    let request = match args.command {
        EditCommand::AddNode { kind } => EditRequest::AddNode { kind },
        EditCommand::RemoveNode { id } => EditRequest::RemoveNode { id },
        EditCommand::Connect { from, to, kind } => EditRequest::AddConnection { from, to, kind },
        EditCommand::Disconnect { from, to, kind } => {
            EditRequest::RemoveConnection { from, to, kind }
        }
        EditCommand::Toggle { from, to } => EditRequest::ToggleConnection { from, to },
        EditCommand::Child {
            parent,
            root,
            subgraph,
        } => {
            let placement = match (root, subgraph) {
                (true, _) => Placement::Root,
                (false, Some(id)) => Placement::Subgraph(id),
                (false, None) => Placement::WithParent,
            };
            EditRequest::CreateChildNode {
                parent,
                drop: None,
                placement: Some(placement),
            }
        }
        EditCommand::Shape { id, shape } => EditRequest::ChangeNodeShape { id, shape },
        EditCommand::Relabel { id, label } => EditRequest::RelabelNode { id, label },
        EditCommand::Group { nodes, name, ai } => {
            let name = match name {
                Some(name) if !ai => name,
                _ => suggest_group_name(&mut editor, &nodes).await?,
            };
            EditRequest::WrapInSubgraph { nodes, name }
        }
        EditCommand::Ungroup { id } => EditRequest::UngroupSubgraph { id },
        EditCommand::DeleteSubgraph { id } => EditRequest::DeleteSubgraph { id },
        EditCommand::RenameSubgraph { id, name } => EditRequest::RenameSubgraph { id, name },
        EditCommand::Split { id, parts, ai } => {
            let plan = if ai {
                suggest_split(&editor, &id).await?
            } else {
                SplitPlan::sequential(parts)
            };
            EditRequest::SplitNode { id, plan }
        }
    };

    let description = request.describe();
    let edit = editor
        .apply(request)
        .map_err(|err| anyhow!("{description} rejected: {err}"))?;

    let output = merge_title(editor.title(), &edit.source);
    if args.dry_run {
        print!("{output}");
        io::stdout().flush()?;
    } else {
        fs::write(&path, &output)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        info!(path = %path.display(), "saved chart");
        println!("{description} -> {}", path.display());
    }
    report_edit(&edit);
    Ok(())
}

fn report_edit(edit: &Edit) {
    for id in &edit.created {
        println!("created {id}");
    }
    for edge in &edit.dangling {
        println!("dangling connection: {edge}");
    }
}

async fn suggest_group_name(editor: &mut Editor, nodes: &[String]) -> Result<String> {
    let assistant = GeminiAssistant::new(&AssistConfig::default())?;
    for id in nodes {
        editor.selection_mut().add(id);
    }
    let labels = editor.selected_labels();
    let name = assistant
        .request_group_name(&labels)
        .await
        .context("failed to get a subgraph name")?;
    println!("suggested name: {name}");
    Ok(name)
}

async fn suggest_split(editor: &Editor, id: &str) -> Result<SplitPlan> {
    let assistant = GeminiAssistant::new(&AssistConfig::default())?;
    let (label, context) = editor.split_input(id)?;
    let plan = assistant
        .request_node_split(&label, &context)
        .await
        .and_then(|suggestion| suggestion.into_plan())
        .context("failed to get a split plan")?;
    let names: Vec<&str> = plan.parts.iter().map(|part| part.name.as_str()).collect();
    println!("suggested parts: {}", names.join(", "));
    Ok(plan)
}

fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled".to_string())
}

fn ensure_unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "diagram".to_string());
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(String::from);

    let mut counter = 1;
    loop {
        let mut candidate = path.clone();
        let name = match &extension {
            Some(ext) => format!("{stem}{counter}.{ext}"),
            None => format!("{stem}{counter}"),
        };
        candidate.set_file_name(&name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn parse_input(input: Option<&str>) -> Result<InputSource> {
    match input {
        Some("-") | None => Ok(InputSource::Stdin),
        Some(path_str) => {
            let path = PathBuf::from(path_str);
            if !path.exists() {
                return Err(anyhow!("input file '{path_str}' does not exist"));
            }
            Ok(InputSource::File(path))
        }
    }
}

fn parse_output(output: Option<&str>) -> Result<OutputDestination> {
    match output {
        Some("-") | None => Ok(OutputDestination::Stdout),
        Some(path_str) => {
            let path = PathBuf::from(path_str);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(anyhow!(
                        "output directory '{}' does not exist",
                        parent.display()
                    ));
                }
            }
            Ok(OutputDestination::File(path))
        }
    }
}

fn load_definition(source: &InputSource) -> Result<String> {
    match source {
        InputSource::Stdin => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            if buffer.trim().is_empty() {
                Err(anyhow!("no chart supplied on stdin"))
            } else {
                Ok(buffer)
            }
        }
        InputSource::File(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read '{}'", path.display()))?;
            if contents.trim().is_empty() {
                Err(anyhow!("input file '{}' was empty", path.display()))
            } else {
                Ok(contents)
            }
        }
    }
}

fn write_output(dest: OutputDestination, bytes: &[u8]) -> Result<()> {
    match dest {
        OutputDestination::Stdout => {
            let mut stdout = io::stdout();
            stdout.write_all(bytes)?;
            stdout.flush()?;
        }
        OutputDestination::File(path) => {
            fs::write(&path, bytes)
                .with_context(|| format!("failed to write '{}'", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
