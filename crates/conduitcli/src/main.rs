use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conduitcore::{Execution, Flow, NodeInstance, Schedule, Trigger, Value};
use conduitruntime::{
    BroadcastMessage, CompatibilityLevel, ExecutionGraph, FlowRuntime, MessageKind,
    ObserverHandle, Room, RuntimeConfig,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit flow engine CLI", long_about = None)]
struct Cli {
    /// Runtime configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file and stream its progress
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Retries per node after the first attempt
        #[arg(long)]
        retries: Option<u32>,

        /// Fixed wait between node retries
        #[arg(long, default_value_t = 1000)]
        retry_delay_ms: u64,

        /// Deadline for the whole execution
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print each broadcast message as raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a flow's structure and the compatibility of its connections
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes {
        /// Print full descriptors including schemas
        #[arg(long)]
        json: bool,
    },

    /// Compatibility matrix across node types
    Compat {
        /// Node types to include; all registered types when omitted
        types: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Suggest how to connect one node type's output to another's input
    Suggest { source: String, target: String },

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::Run {
            file,
            input,
            retries,
            retry_delay_ms,
            timeout_ms,
            json,
        } => {
            let execution = run_flow(RunArgs {
                file,
                input,
                retries,
                retry_delay_ms,
                timeout_ms,
                json,
                config,
            })
            .await?;
            if execution.status != conduitcore::ExecutionStatus::Success {
                std::process::exit(1);
            }
        }
        Commands::Validate { file } => validate_flow(&file, config).await?,
        Commands::Nodes { json } => list_nodes(json)?,
        Commands::Compat { types, json } => print_matrix(types, json, config).await?,
        Commands::Suggest { source, target } => suggest(&source, &target, config).await?,
        Commands::Init { output } => create_example_flow(&output)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_runtime(config: RuntimeConfig) -> FlowRuntime {
    FlowRuntime::with_config(conduitnodes::standard_registry(), config)
}

fn load_flow(file: &Path) -> Result<Flow> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading flow file {}", file.display()))?;
    let flow: Flow = serde_json::from_str(&raw)
        .with_context(|| format!("parsing flow file {}", file.display()))?;
    Ok(flow)
}

/// Plain JSON object into trigger inputs
fn parse_inputs(input: Option<String>) -> Result<HashMap<String, Value>> {
    let Some(input) = input else {
        return Ok(HashMap::new());
    };
    match serde_json::from_str(&input)? {
        serde_json::Value::Object(obj) => Ok(obj
            .into_iter()
            .map(|(k, v)| (k, Value::from_plain_json(v)))
            .collect()),
        _ => bail!("Input must be a JSON object"),
    }
}

struct RunArgs {
    file: PathBuf,
    input: Option<String>,
    retries: Option<u32>,
    retry_delay_ms: u64,
    timeout_ms: Option<u64>,
    json: bool,
    config: RuntimeConfig,
}

async fn run_flow(args: RunArgs) -> Result<Execution> {
    println!("🚀 Loading flow from: {}", args.file.display());

    let flow = load_flow(&args.file)?;
    println!("📋 Flow: {}", flow.name);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Connections: {}", flow.connections.len());
    println!();

    let mut trigger = Trigger::manual().with_inputs(parse_inputs(args.input)?);
    if args.retries.is_some() || args.timeout_ms.is_some() {
        let mut schedule = Schedule::new(flow.id)
            .with_retry(args.retries.unwrap_or(0), args.retry_delay_ms);
        if let Some(ms) = args.timeout_ms {
            schedule = schedule.with_timeout(ms);
        }
        trigger = Trigger {
            kind: conduitcore::TriggerKind::Manual,
            ..Trigger::scheduled(schedule)
        }
        .with_inputs(trigger.inputs);
    }

    let runtime = build_runtime(args.config);
    let observer = runtime.observe(None, [Room::Flow(flow.id)]);
    let printer = tokio::spawn(print_messages(observer, args.json));

    let handle = runtime.execute(&flow, trigger).await?;
    let execution_id = handle.execution_id;
    let execution = handle.wait().await?;

    // The printer stops at the terminal update; don't hang if it was lagged away.
    if tokio::time::timeout(Duration::from_secs(2), printer).await.is_err() {
        tracing::warn!(execution_id = %execution_id, "Timed out waiting for final messages");
    }
    runtime.shutdown().await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {}", execution.status);
    println!("   Records processed: {}", execution.records_processed);
    if let Some(ms) = execution.duration_ms {
        println!("   Duration: {}ms", ms);
    }
    if let Some(error) = &execution.error_message {
        println!("   Error: {}", error);
    }

    let records = runtime.orchestrator().node_executions(execution.id).await?;
    if !records.is_empty() {
        println!();
        println!("🧩 Nodes:");
        for record in records {
            println!(
                "   {} ({}) {} after {} attempt(s)",
                record.node_id,
                record.node_type,
                record.status.as_str(),
                record.attempts
            );
        }
    }

    Ok(execution)
}

async fn print_messages(mut observer: ObserverHandle, json: bool) {
    while let Some(message) = observer.recv().await {
        if json {
            match serde_json::to_string(&message) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Unprintable message"),
            }
        } else {
            print_message(&message);
        }

        let terminal = message.kind == MessageKind::ExecutionUpdate
            && matches!(
                message.status.as_deref(),
                Some("success" | "failed" | "cancelled" | "timeout")
            );
        if terminal {
            break;
        }
    }
}

fn print_message(message: &BroadcastMessage) {
    let node = message.node_id.as_deref().unwrap_or("-");
    let status = message.status.as_deref().unwrap_or("");
    match message.kind {
        MessageKind::ExecutionUpdate => match status {
            "running" => println!("▶️  Execution {} running", message.execution_id),
            "success" => println!("✨ Execution completed successfully"),
            "paused" => println!("⏸️  Execution paused"),
            other => println!(
                "💥 Execution {}: {}",
                other,
                message.error.as_deref().unwrap_or("")
            ),
        },
        MessageKind::NodeUpdate => match status {
            "running" => println!("  ⚡ Starting node: {}", node),
            "success" => println!("  ✅ Node {} completed", node),
            "retrying" => println!(
                "  🔁 Node {} failed, retrying: {}",
                node,
                message.error.as_deref().unwrap_or("")
            ),
            _ => println!(
                "  ❌ Node {} failed: {}",
                node,
                message.error.as_deref().unwrap_or("")
            ),
        },
        MessageKind::DataFlow => {
            if status == "error" {
                println!("  ⚠️  {} {}", node, message.error.as_deref().unwrap_or(""));
            }
        }
        MessageKind::NodeProgress => {
            if let Some(data) = &message.data {
                let text = data
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| data.to_string());
                println!("     ℹ️  [{}] {}", node, text);
            }
        }
    }
}

async fn validate_flow(file: &Path, config: RuntimeConfig) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let flow = load_flow(file)?;
    let graph = ExecutionGraph::build(&flow)?;
    let runtime = build_runtime(config);

    let unknown: Vec<&str> = flow
        .nodes
        .iter()
        .filter(|n| !runtime.registry().contains(&n.node_type))
        .map(|n| n.node_type.as_str())
        .collect();
    if !unknown.is_empty() {
        runtime.shutdown().await;
        bail!("Unknown node types: {}", unknown.join(", "));
    }

    println!("✅ Flow structure is valid:");
    println!("   Name: {}", flow.name);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Connections: {}", flow.connections.len());
    println!("   Order: {}", graph.order().join(" -> "));

    let reports = runtime.check_flow(&flow)?;
    let mut errors = 0;
    if !reports.is_empty() {
        println!();
        println!("🔗 Connections:");
    }
    for report in &reports {
        let conn = &report.connection;
        println!(
            "   {}.{} -> {}.{}: {:?} ({})",
            conn.from_node_id,
            conn.from_output,
            conn.to_node_id,
            conn.to_input,
            report.result.level,
            report.result.score
        );
        for issue in report.port_issues.iter().chain(&report.result.issues) {
            println!("      {:?}: {}", issue.severity, issue.message);
        }
        if report.has_errors() {
            errors += 1;
        }
    }
    runtime.shutdown().await;

    if errors > 0 {
        bail!("{} connection(s) have errors", errors);
    }
    Ok(())
}

fn list_nodes(json: bool) -> Result<()> {
    let registry = conduitnodes::standard_registry();

    if json {
        let definitions: Vec<_> = registry
            .list_types()
            .iter()
            .filter_map(|t| registry.definition(t).cloned())
            .collect();
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }

    println!("📦 Available Node Types:");
    println!();
    for node_type in registry.list_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} v{} ({})", node_type, metadata.version, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
    Ok(())
}

async fn print_matrix(types: Vec<String>, json: bool, config: RuntimeConfig) -> Result<()> {
    let runtime = build_runtime(config);
    let types = if types.is_empty() {
        runtime.registry().list_types()
    } else {
        types
    };
    let matrix = runtime.validator().generate_matrix(&types);
    runtime.shutdown().await;
    let matrix = matrix?;

    if json {
        println!("{}", serde_json::to_string_pretty(&matrix)?);
        return Ok(());
    }

    println!(
        "🧮 {} node types, {} pairs: {} full, {} partial, {} incompatible",
        matrix.metadata.total_nodes,
        matrix.metadata.total_pairs,
        matrix.metadata.full,
        matrix.metadata.partial,
        matrix.metadata.incompatible
    );
    for (source, row) in &matrix.matrix {
        for (target, result) in row {
            let mark = match result.level {
                CompatibilityLevel::Full => "✅",
                CompatibilityLevel::Partial => "🟡",
                CompatibilityLevel::Incompatible => "❌",
            };
            println!("  {} {} -> {} ({})", mark, source, target, result.score);
        }
    }
    Ok(())
}

async fn suggest(source: &str, target: &str, config: RuntimeConfig) -> Result<()> {
    let runtime = build_runtime(config);
    let result = runtime.validator().check(source, target);
    let suggestions = runtime.validator().suggest_transformations(source, target);
    runtime.shutdown().await;
    let (result, suggestions) = (result?, suggestions?);

    println!(
        "🔗 {} -> {}: {:?} (score {})",
        source, target, result.level, result.score
    );
    if suggestions.is_empty() {
        println!("   No transformations needed");
    }
    for suggestion in suggestions {
        println!("   • {}", suggestion.description);
    }
    Ok(())
}

fn create_example_flow(output: &Path) -> Result<()> {
    let mut flow = Flow::new("Example Filter Flow");
    flow.description = Some("Parses a JSON array, keeps active users and logs them".to_string());

    let parse = flow.add_node(NodeInstance::new("parse", "transform.json_parse").with_name("Parse Users"));
    let filter = flow.add_node(
        NodeInstance::new("active", "data.filter")
            .with_name("Active Users")
            .with_config("field", "active")
            .with_config("equals", true),
    );
    let log = flow.add_node(NodeInstance::new("log", "debug.log").with_name("Log Result"));

    flow.connect(&parse, "parsed", &filter, "items");
    flow.connect(&filter, "items", &log, "value");

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  conduit run --file {} --input '{{\"json\": \"[{{\\\"name\\\": \\\"ada\\\", \\\"active\\\": true}}]\"}}'",
        output.display()
    );
    Ok(())
}
