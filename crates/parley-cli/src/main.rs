//! CLI binary for validating flow definitions and running conversations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use parley_engine::{
    spawn_sweeper, validate, ActionRegistry, EngineConfig, FlowCatalog, FlowDefinition,
    FlowEngine, InMemoryServices, Severity, StateStore,
};
use parley_types::{Contact, InboundEvent, MediaRef, OutboundMessage, OutputAction};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "parley", version, about = "Conversational flow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of steps one event may run
    #[arg(long, global = true)]
    max_steps: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Lint flow definitions (a .json file or a directory of them)
    Validate {
        /// Flow file or directory
        flows: PathBuf,
    },

    /// Show the flows, triggers and steps in a definition set
    Info {
        /// Flow file or directory
        flows: PathBuf,
    },

    /// Talk to the flows interactively on stdin
    Chat {
        /// Flow file or directory
        flows: PathBuf,

        /// Contact id to converse as
        #[arg(long, default_value = "console")]
        contact: String,

        /// First name stored in the contact profile
        #[arg(long)]
        name: Option<String>,
    },

    /// Feed a JSON-lines file of inbound events and print the resulting actions
    Replay {
        /// Flow file or directory
        flows: PathBuf,

        /// One inbound event per line; an optional "contact" field picks the contact
        script: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(max_steps) = cli.max_steps {
        config.max_steps_per_cycle = max_steps;
    }

    match cli.command {
        Commands::Validate { flows } => cmd_validate(&flows)?,
        Commands::Info { flows } => cmd_info(&flows)?,
        Commands::Chat {
            flows,
            contact,
            name,
        } => cmd_chat(&flows, config, &contact, name).await?,
        Commands::Replay { flows, script } => cmd_replay(&flows, config, &script).await?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn flow_files(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if path.is_dir() {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let file = entry?.path();
            if file.extension().is_some_and(|ext| ext == "json") {
                files.push(file);
            }
        }
        files.sort();
        Ok(files)
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

/// Parse definitions without linting them, so `validate` can report on
/// broken flows instead of refusing them.
fn read_definitions(path: &Path) -> anyhow::Result<Vec<FlowDefinition>> {
    let mut definitions = Vec::new();
    for file in flow_files(path)? {
        let raw = std::fs::read_to_string(&file)
            .with_context(|| format!("reading {}", file.display()))?;
        definitions.extend(
            FlowDefinition::parse_many(&raw).with_context(|| format!("parsing {}", file.display()))?,
        );
    }
    Ok(definitions)
}

fn load_catalog(path: &Path) -> anyhow::Result<FlowCatalog> {
    let mut catalog = FlowCatalog::new();
    if path.is_dir() {
        catalog.load_dir(path)?;
    } else {
        catalog.load_file(path)?;
    }
    if catalog.is_empty() {
        anyhow::bail!("no flows found in {}", path.display());
    }
    Ok(catalog)
}

fn build_engine(
    path: &Path,
    config: EngineConfig,
) -> anyhow::Result<(Arc<FlowEngine>, InMemoryServices)> {
    let catalog = load_catalog(path)?;
    let mem = InMemoryServices::new();
    let engine = FlowEngine::new(catalog, mem.services(), ActionRegistry::new(), config);
    Ok((Arc::new(engine), mem))
}

// ---------------------------------------------------------------------------
// validate / info
// ---------------------------------------------------------------------------

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let definitions = read_definitions(path)?;
    let mut has_error = false;
    let mut valid = Vec::new();

    for definition in definitions {
        let diagnostics = validate(&definition);
        let errors = diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count();
        if diagnostics.is_empty() {
            println!("{}: ok", definition.name);
        }
        for diag in &diagnostics {
            let severity = match diag.severity {
                Severity::Error => "ERROR",
                Severity::Warning => "WARN",
            };
            let location = diag.step.as_deref().map(|s| format!(" ({s})")).unwrap_or_default();
            println!("[{severity}] {}{location} {}: {}", definition.name, diag.rule, diag.message);
            if let Some(fix) = &diag.fix {
                println!("        fix: {fix}");
            }
        }
        if errors > 0 {
            has_error = true;
        } else {
            valid.push(definition);
        }
    }

    let catalog = FlowCatalog::from_definitions(valid)?;
    for diag in catalog.validate_links() {
        println!("[WARN] {}: {}", diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let catalog = load_catalog(path)?;

    for flow in catalog.flows() {
        let def = flow.definition();
        println!("Flow: {}{}", def.name, if def.active { "" } else { " (inactive)" });
        if let Some(description) = &def.description {
            println!("  {description}");
        }
        if !def.trigger_keywords.is_empty() {
            println!("  Keywords: {}", def.trigger_keywords.join(", "));
        }
        if let Some(pattern) = &def.trigger_pattern {
            let capture = def.capture_variable.as_deref().unwrap_or("-");
            println!("  Pattern: {pattern} (captures into {capture})");
        }
        println!("  Steps:");
        for step in flow.steps() {
            let entry = if step.is_entry_point { " *" } else { "" };
            println!("    {} [{}]{entry}", step.name, step.kind);
            for t in &step.transitions {
                let condition = t
                    .condition
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "always".into());
                println!("      -> {} (priority {}, {condition})", t.next_step, t.priority);
            }
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------------

enum Input {
    Event(InboundEvent),
    State,
    Help,
    Quit,
}

const CHAT_HELP: &str = "\
Type a message, or:
  /reply <id> [title]    choose an interactive option
  /location <lat> <lon>  share a location
  /image <id> [url]      send an image
  /form <json>           submit a form
  /state                 show the stored flow state
  /quit                  leave";

fn parse_input(line: &str) -> anyhow::Result<Input> {
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Event(InboundEvent::text(line)));
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    let input = match name {
        "reply" => {
            let (id, title) = rest.split_once(' ').unwrap_or((rest, rest));
            if id.is_empty() {
                anyhow::bail!("usage: /reply <id> [title]");
            }
            Input::Event(InboundEvent::reply(id, title.trim()))
        }
        "location" => {
            let mut parts = rest.split_whitespace();
            let (Some(lat), Some(lon)) = (parts.next(), parts.next()) else {
                anyhow::bail!("usage: /location <lat> <lon>");
            };
            Input::Event(InboundEvent::location(lat.parse()?, lon.parse()?))
        }
        "image" => {
            let mut parts = rest.split_whitespace();
            let Some(id) = parts.next() else {
                anyhow::bail!("usage: /image <id> [url]");
            };
            Input::Event(InboundEvent::image(MediaRef {
                id: id.to_string(),
                url: parts.next().map(String::from),
                mime_type: None,
            }))
        }
        "form" => Input::Event(InboundEvent::form(
            serde_json::from_str(rest).context("form payload must be JSON")?,
        )),
        "state" => Input::State,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => anyhow::bail!("unknown command /{other}, try /help"),
    };
    Ok(input)
}

fn print_message(message: &OutboundMessage) {
    match message.body() {
        Some(body) => println!("bot> {body}"),
        None => println!(
            "bot> [{:?}] {}",
            message.kind,
            serde_json::to_string_pretty(&message.payload).unwrap_or_default()
        ),
    }
}

fn print_actions(actions: &[OutputAction]) {
    for action in actions {
        match action {
            OutputAction::SendMessage(message) => print_message(message),
            OutputAction::ClearState => println!("-- conversation ended --"),
            OutputAction::SwitchFlow { flow, .. } => println!("-- switched to {flow} --"),
        }
    }
}

async fn cmd_chat(
    path: &Path,
    config: EngineConfig,
    contact_id: &str,
    name: Option<String>,
) -> anyhow::Result<()> {
    let sweep_every = Duration::from_secs(config.inactivity_timeout_secs.clamp(1, 60));
    let (engine, mem) = build_engine(path, config)?;
    let mut contact = Contact::new(contact_id);
    if let Some(name) = name {
        contact = contact.with_profile("first_name", serde_json::Value::String(name));
    }
    mem.contacts.insert(contact).await;
    let sweeper = spawn_sweeper(engine.clone(), sweep_every);

    println!("Flows: {}", engine.catalog().names().join(", "));
    println!("{CHAT_HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_input(line) {
            Ok(Input::Event(event)) => {
                let actions = engine.process_event(contact_id, event).await;
                if actions.is_empty() {
                    println!("(no reply)");
                }
                print_actions(&actions);
            }
            Ok(Input::State) => match mem.store.load_state(contact_id).await? {
                Some(state) => println!(
                    "{} / {} (v{})\n{}",
                    state.flow,
                    state.step,
                    state.version,
                    serde_json::to_string_pretty(&state.context)?
                ),
                None => println!("(no active flow)"),
            },
            Ok(Input::Help) => println!("{CHAT_HELP}"),
            Ok(Input::Quit) => break,
            Err(err) => println!("error: {err}"),
        }
    }

    sweeper.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

fn default_contact() -> String {
    "replay".into()
}

#[derive(Deserialize)]
struct ScriptLine {
    #[serde(default = "default_contact")]
    contact: String,
    #[serde(flatten)]
    event: InboundEvent,
}

#[derive(Serialize)]
struct ReplayRecord<'a> {
    line: usize,
    contact: &'a str,
    actions: &'a [OutputAction],
}

async fn cmd_replay(path: &Path, config: EngineConfig, script: &Path) -> anyhow::Result<()> {
    let (engine, mem) = build_engine(path, config)?;
    let raw = std::fs::read_to_string(script)
        .with_context(|| format!("reading {}", script.display()))?;

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry: ScriptLine = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid event", script.display(), index + 1))?;
        if mem.contacts.get(&entry.contact).await.is_none() {
            mem.contacts.insert(Contact::new(entry.contact.clone())).await;
        }
        let actions = engine.process_event(&entry.contact, entry.event).await;
        tracing::debug!(line = index + 1, contact = %entry.contact, actions = actions.len(), "Replayed event");
        let record = ReplayRecord {
            line: index + 1,
            contact: &entry.contact,
            actions: &actions,
        };
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
