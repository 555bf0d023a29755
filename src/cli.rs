//! Thin CLI surface over the element engine.
//!
//! Commands map one-to-one onto store operations; formatting stays here and
//! semantics stay in `core`. Every command supports `--format json` for
//! machine consumers, which prints a single envelope object per invocation.

use crate::core::config::{self, Config};
use crate::core::db::DbConfig;
use crate::core::error::{ElementalError, ErrorKind};
use crate::core::graph::{Direction, NewDependency};
use crate::core::model::{
    ChannelPayload, ChannelVisibility, DependencyType, DocumentPayload, ElementFilter, ElementId,
    ElementType, EntityPayload, EntityType, LibraryPayload, MessagePayload, Payload,
    PlaybookPayload, TaskPayload, TaskStatus, TaskType, TeamPayload, WorkflowPayload,
    WorkflowStatus,
};
use crate::core::pour::PourOptions;
use crate::core::queries::ReadyFilter;
use crate::core::store::{
    DeleteOptions, ElementPatch, GcOptions, GetOptions, NewElement, Store, UpdateOptions,
};
use crate::core::time;
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(
    name = "elemental",
    version = env!("CARGO_PKG_VERSION"),
    about = "Local-first coordination substrate for agents and their work."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Database file override (defaults to the configured path).
    #[clap(long, global = true)]
    pub database: Option<String>,
    /// Acting entity recorded on mutations.
    #[clap(long, global = true)]
    pub actor: Option<String>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, inspect, and mutate elements.
    Element {
        #[clap(subcommand)]
        command: ElementCommand,
    },
    /// Manage typed dependencies between elements.
    Dep {
        #[clap(subcommand)]
        command: DepCommand,
    },
    /// Document version history and rollback.
    Doc {
        #[clap(subcommand)]
        command: DocCommand,
    },
    /// Tasks that can be picked up now.
    Ready(ReadyArgs),
    /// Tasks that are blocked, with their representative blocker.
    Blocked(ReadyArgs),
    /// Tasks parked in the backlog.
    Backlog(ReadyArgs),
    /// Workflow-scoped operations.
    Workflow {
        #[clap(subcommand)]
        command: WorkflowCommand,
    },
    /// Expand a playbook into a workflow with tasks and edges.
    Pour {
        /// Playbook element ID.
        #[clap(value_name = "PLAYBOOK_ID")]
        playbook_id: String,
        /// Template variables as key=value pairs.
        #[clap(long = "var")]
        vars: Vec<String>,
        #[clap(long)]
        ephemeral: bool,
        #[clap(long, default_value = "")]
        tags: String,
    },
    /// Database maintenance and diagnostics.
    Admin {
        #[clap(subcommand)]
        command: AdminCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ElementCommand {
    /// Create an element of any type.
    Create(CreateArgs),
    /// Fetch one element by ID.
    Get {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long)]
        include_deleted: bool,
        /// Join referenced document content into the view.
        #[clap(long)]
        hydrate: bool,
    },
    /// List elements with filters.
    List {
        #[clap(long, value_name = "TYPE")]
        r#type: Option<String>,
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        assignee: Option<String>,
        #[clap(long)]
        tag: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
        #[clap(long)]
        offset: Option<usize>,
        #[clap(long)]
        include_deleted: bool,
        #[clap(long)]
        include_ephemeral: bool,
    },
    /// Patch an element (shallow payload merge; tags replace wholesale).
    Update {
        #[clap(value_name = "ID")]
        id: String,
        /// Payload fields as key=value pairs (JSON values accepted).
        #[clap(long = "set")]
        sets: Vec<String>,
        /// Replace the tag set.
        #[clap(long)]
        tags: Option<String>,
        /// Optimistic concurrency guard (ISO-8601 updatedAt).
        #[clap(long)]
        expected_updated_at: Option<String>,
    },
    /// Soft-delete an element (tombstone).
    Delete {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Team and channel membership.
    AddMember {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long)]
        entity: String,
    },
    RemoveMember {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long)]
        entity: String,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Element type (task, workflow, document, entity, channel, message,
    /// team, library, playbook).
    #[clap(long, value_name = "TYPE")]
    pub r#type: String,
    /// Explicit ID (generated when omitted).
    #[clap(long)]
    pub id: Option<String>,
    #[clap(long)]
    pub title: Option<String>,
    #[clap(long)]
    pub name: Option<String>,
    #[clap(long)]
    pub content: Option<String>,
    #[clap(long, default_value = "markdown")]
    pub content_type: String,
    #[clap(long, default_value_t = 3)]
    pub priority: u8,
    #[clap(long, default_value_t = 3)]
    pub complexity: u8,
    #[clap(long, default_value = "task")]
    pub task_type: String,
    #[clap(long)]
    pub assignee: Option<String>,
    #[clap(long)]
    pub scheduled_for: Option<String>,
    #[clap(long)]
    pub description_ref: Option<String>,
    #[clap(long)]
    pub entity_type: Option<String>,
    #[clap(long)]
    pub public_key: Option<String>,
    #[clap(long)]
    pub channel: Option<String>,
    #[clap(long)]
    pub content_ref: Option<String>,
    #[clap(long)]
    pub thread: Option<String>,
    #[clap(long)]
    pub visibility: Option<String>,
    #[clap(long)]
    pub ephemeral: bool,
    /// Playbook definition as a JSON file (steps + variables).
    #[clap(long)]
    pub from_file: Option<PathBuf>,
    #[clap(long, default_value = "")]
    pub tags: String,
}

#[derive(Args, Debug)]
pub struct ReadyArgs {
    #[clap(long)]
    pub assignee: Option<String>,
    #[clap(long)]
    pub priority: Option<u8>,
    #[clap(long)]
    pub task_type: Option<String>,
    #[clap(long)]
    pub limit: Option<usize>,
    #[clap(long)]
    pub include_ephemeral: bool,
}

#[derive(Subcommand, Debug)]
pub enum DepCommand {
    Add {
        #[clap(long)]
        source: String,
        #[clap(long)]
        target: String,
        #[clap(long, value_name = "TYPE")]
        r#type: String,
    },
    Remove {
        #[clap(long)]
        source: String,
        #[clap(long)]
        target: String,
        #[clap(long, value_name = "TYPE")]
        r#type: String,
    },
    /// Edges incident to an element.
    List {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long, default_value = "both")]
        direction: String,
        #[clap(long, value_name = "TYPE")]
        r#type: Option<String>,
    },
    /// Bounded BFS around an element.
    Tree {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long, default_value = "both")]
        direction: String,
        #[clap(long)]
        max_depth: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum DocCommand {
    History {
        #[clap(value_name = "ID")]
        id: String,
    },
    Get {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long)]
        version: i64,
    },
    Rollback {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long)]
        version: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommand {
    /// Tasks attached to a workflow.
    Tasks {
        #[clap(value_name = "ID")]
        id: String,
        #[clap(long)]
        status: Option<String>,
        #[clap(long)]
        ready: bool,
    },
    /// Progress counters for a workflow.
    Progress {
        #[clap(value_name = "ID")]
        id: String,
    },
    /// Open workload for one entity.
    Workload {
        #[clap(value_name = "ENTITY_ID")]
        entity: String,
    },
    /// Hard-delete a workflow, its child tasks, and their edges.
    Burn {
        #[clap(value_name = "ID")]
        id: String,
    },
    /// Garbage-collect finished ephemeral workflows.
    Gc {
        #[clap(long, default_value_t = 24 * 60 * 60 * 1000)]
        max_age_ms: i64,
        #[clap(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AdminCommand {
    /// Database statistics.
    Stats,
    /// Run the engine integrity check.
    Integrity,
    /// Issue the maintenance pragma.
    Optimize,
    /// Apply pending schema migrations.
    Migrate,
    /// Show (or clear) the dirty set consumed by the sync layer.
    Dirty {
        #[clap(long)]
        clear: bool,
    },
}

fn envelope(cmd: &str, extra: Value) -> Value {
    let mut base = json!({
        "ts": time::now_iso(),
        "eventId": time::new_event_id(),
        "cmd": cmd,
        "status": "ok",
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

fn emit(format: OutputFormat, cmd: &str, extra: Value, text: impl FnOnce() -> String) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&envelope(cmd, extra)).unwrap_or_default()
            );
        }
        OutputFormat::Text => println!("{}", text()),
    }
}

fn parse_kv_pairs(pairs: &[String]) -> Result<Map<String, Value>, ElementalError> {
    let mut out = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(ElementalError::validation(format!(
                "expected key=value, got {pair:?}"
            )));
        };
        let value = serde_json::from_str::<Value>(raw).unwrap_or(Value::String(raw.to_string()));
        out.insert(key.trim().to_string(), value);
    }
    Ok(out)
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn effective_actor(cli_actor: &Option<String>, config: &Config) -> String {
    cli_actor
        .clone()
        .or_else(|| config.actor.clone())
        .unwrap_or_else(|| "el-cli".to_string())
}

/// Resolve configuration, open the store, and dispatch one command.
pub fn run(cli: Cli) -> Result<(), ElementalError> {
    let loaded = match &cli.config {
        Some(path) => config::load(path)?,
        None => {
            let default_path = PathBuf::from("elemental.toml");
            if default_path.exists() {
                config::load(&default_path)?
            } else {
                config::LoadedConfig {
                    config: Config::default(),
                    warnings: Vec::new(),
                }
            }
        }
    };
    for warning in &loaded.warnings {
        eprintln!("{} {warning}", "warning:".yellow());
    }

    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| loaded.config.database.clone());
    let store = Store::open(&DbConfig::file(database))?;
    let actor = effective_actor(&cli.actor, &loaded.config);
    dispatch(&store, &actor, cli)
}

fn dispatch(store: &Store, actor: &str, cli: Cli) -> Result<(), ElementalError> {
    let format = cli.format;
    match cli.command {
        Command::Element { command } => run_element(store, actor, format, command),
        Command::Dep { command } => run_dep(store, actor, format, command),
        Command::Doc { command } => run_doc(store, actor, format, command),
        Command::Ready(args) => {
            let ready = store.ready(&ready_filter(&args)?)?;
            let items: Vec<Value> = ready.iter().map(|e| e.to_json()).collect();
            emit(format, "ready", json!({ "tasks": items }), || {
                render_task_lines(&ready)
            });
            Ok(())
        }
        Command::Blocked(args) => {
            let blocked = store.blocked(&ready_filter(&args)?)?;
            let items: Vec<Value> = blocked
                .iter()
                .map(|b| {
                    json!({
                        "task": b.task.to_json(),
                        "blockedBy": b.blocked_by,
                        "blockReason": b.block_reason.as_str(),
                    })
                })
                .collect();
            emit(format, "blocked", json!({ "tasks": items }), || {
                blocked
                    .iter()
                    .map(|b| {
                        format!(
                            "{}  {}  {}",
                            b.task.id.to_string().cyan(),
                            b.block_reason.as_str().red(),
                            b.blocked_by.as_deref().unwrap_or("-")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            Ok(())
        }
        Command::Backlog(args) => {
            let backlog = store.backlog(&ready_filter(&args)?)?;
            let items: Vec<Value> = backlog.iter().map(|e| e.to_json()).collect();
            emit(format, "backlog", json!({ "tasks": items }), || {
                render_task_lines(&backlog)
            });
            Ok(())
        }
        Command::Workflow { command } => run_workflow(store, format, command),
        Command::Pour {
            playbook_id,
            vars,
            ephemeral,
            tags,
        } => {
            let variables = parse_kv_pairs(&vars)?;
            let receipt = store.pour(
                &playbook_id,
                &variables,
                PourOptions {
                    created_by: actor.to_string(),
                    ephemeral,
                    tags: split_tags(&tags),
                    metadata: Map::new(),
                },
            )?;
            emit(
                format,
                "pour",
                json!({
                    "workflowId": receipt.workflow_id,
                    "tasks": receipt.task_ids,
                    "skippedSteps": receipt.skipped_steps,
                }),
                || {
                    format!(
                        "poured {} -> {} ({} tasks, {} skipped)",
                        playbook_id,
                        receipt.workflow_id.green(),
                        receipt.task_ids.len(),
                        receipt.skipped_steps.len()
                    )
                },
            );
            Ok(())
        }
        Command::Admin { command } => run_admin(store, format, command),
    }
}

fn render_task_lines(elements: &[crate::core::model::Element]) -> String {
    elements
        .iter()
        .map(|e| {
            let task = e.payload.as_task();
            format!(
                "{}  P{}  {}",
                e.id.to_string().cyan(),
                task.map(|t| t.priority).unwrap_or_default(),
                task.map(|t| t.title.as_str()).unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn ready_filter(args: &ReadyArgs) -> Result<ReadyFilter, ElementalError> {
    Ok(ReadyFilter {
        assignee: args.assignee.clone(),
        priority: args.priority,
        task_type: args.task_type.as_deref().map(TaskType::from_str).transpose()?,
        limit: args.limit,
        include_ephemeral: args.include_ephemeral,
    })
}

fn run_element(
    store: &Store,
    actor: &str,
    format: OutputFormat,
    command: ElementCommand,
) -> Result<(), ElementalError> {
    match command {
        ElementCommand::Create(args) => {
            let payload = build_payload(&args)?;
            let mut request = NewElement::new(actor, payload).with_tags(split_tags(&args.tags));
            request.id = args.id.clone();
            let element = store.create(request)?;
            emit(
                format,
                "element.create",
                json!({ "element": element.to_json() }),
                || format!("created {} ({})", element.id.to_string().green(), element.element_type),
            );
            Ok(())
        }
        ElementCommand::Get {
            id,
            include_deleted,
            hydrate,
        } => {
            let view = store.get_with(
                &id,
                &GetOptions {
                    include_deleted,
                    hydrate_content: hydrate,
                },
            )?;
            match view {
                Some(view) => {
                    let mut body = json!({ "element": view.element.to_json() });
                    if let Some(content) = &view.content {
                        body["content"] = json!(content);
                    }
                    emit(format, "element.get", body, || {
                        serde_json::to_string_pretty(&view.element.to_json()).unwrap_or_default()
                    });
                    Ok(())
                }
                None => Err(ElementalError::not_found(format!("element not found: {id}"))),
            }
        }
        ElementCommand::List {
            r#type,
            status,
            assignee,
            tag,
            limit,
            offset,
            include_deleted,
            include_ephemeral,
        } => {
            let filter = ElementFilter {
                element_type: r#type.as_deref().map(ElementType::from_str).transpose()?,
                status,
                assignee,
                priority: None,
                task_type: None,
                tag,
                limit,
                offset,
                include_deleted,
                include_ephemeral,
            };
            let page = store.list_paginated(&filter)?;
            let items: Vec<Value> = page.items.iter().map(|e| e.to_json()).collect();
            emit(
                format,
                "element.list",
                json!({ "elements": items, "total": page.total }),
                || {
                    page.items
                        .iter()
                        .map(|e| format!("{}  {}", e.id.to_string().cyan(), e.element_type))
                        .collect::<Vec<_>>()
                        .join("\n")
                },
            );
            Ok(())
        }
        ElementCommand::Update {
            id,
            sets,
            tags,
            expected_updated_at,
        } => {
            let payload = parse_kv_pairs(&sets)?;
            let expected = expected_updated_at
                .as_deref()
                .map(|raw| {
                    time::parse_iso(raw).ok_or_else(|| {
                        ElementalError::validation(format!(
                            "expected-updated-at is not an ISO-8601 timestamp: {raw}"
                        ))
                    })
                })
                .transpose()?;
            let element = store.update(
                &id,
                ElementPatch {
                    tags: tags.as_deref().map(split_tags),
                    metadata: None,
                    payload: (!payload.is_empty()).then_some(payload),
                },
                UpdateOptions {
                    actor: actor.to_string(),
                    expected_updated_at: expected,
                },
            )?;
            emit(
                format,
                "element.update",
                json!({ "element": element.to_json() }),
                || format!("updated {}", element.id.to_string().green()),
            );
            Ok(())
        }
        ElementCommand::Delete { id, reason } => {
            store.delete(
                &id,
                DeleteOptions {
                    actor: actor.to_string(),
                    reason,
                },
            )?;
            emit(format, "element.delete", json!({ "id": id }), || {
                format!("deleted {id}")
            });
            Ok(())
        }
        ElementCommand::AddMember { id, entity } => {
            let element = store
                .get(&id)?
                .ok_or_else(|| ElementalError::not_found(format!("element not found: {id}")))?;
            let changed = match element.element_type {
                ElementType::Channel => store.add_channel_member(&id, &entity, actor)?,
                _ => store.add_team_member(&id, &entity, actor)?,
            };
            emit(
                format,
                "element.add-member",
                json!({ "id": id, "entity": entity, "changed": changed }),
                || format!("{} {entity}", if changed { "added" } else { "already present:" }),
            );
            Ok(())
        }
        ElementCommand::RemoveMember { id, entity } => {
            let element = store
                .get(&id)?
                .ok_or_else(|| ElementalError::not_found(format!("element not found: {id}")))?;
            let changed = match element.element_type {
                ElementType::Channel => store.remove_channel_member(&id, &entity, actor)?,
                _ => store.remove_team_member(&id, &entity, actor)?,
            };
            emit(
                format,
                "element.remove-member",
                json!({ "id": id, "entity": entity, "changed": changed }),
                || format!("{} {entity}", if changed { "removed" } else { "not a member:" }),
            );
            Ok(())
        }
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String, ElementalError> {
    value.clone().ok_or_else(|| {
        ElementalError::new(
            ErrorKind::MissingRequiredField,
            format!("--{field} is required for this element type"),
        )
        .with_detail("field", json!(field))
    })
}

fn build_payload(args: &CreateArgs) -> Result<Payload, ElementalError> {
    let element_type: ElementType = args.r#type.parse()?;
    Ok(match element_type {
        ElementType::Task => Payload::Task(TaskPayload {
            title: required(&args.title, "title")?,
            status: TaskStatus::Open,
            priority: args.priority,
            complexity: args.complexity,
            task_type: args.task_type.parse()?,
            assignee: args.assignee.clone(),
            scheduled_for: args
                .scheduled_for
                .as_deref()
                .map(|raw| {
                    time::parse_iso(raw).ok_or_else(|| {
                        ElementalError::validation(format!(
                            "scheduled-for is not an ISO-8601 timestamp: {raw}"
                        ))
                    })
                })
                .transpose()?,
            close_reason: None,
            description_ref: args
                .description_ref
                .as_deref()
                .map(ElementId::new)
                .transpose()?,
            closed_at: None,
        }),
        ElementType::Workflow => Payload::Workflow(WorkflowPayload {
            title: required(&args.title, "title")?,
            status: WorkflowStatus::Pending,
            ephemeral: args.ephemeral,
            variables: Map::new(),
            finished_at: None,
        }),
        ElementType::Document => Payload::Document(DocumentPayload {
            content_type: args.content_type.parse()?,
            content: required(&args.content, "content")?,
            version: 1,
            previous_version_id: None,
        }),
        ElementType::Entity => Payload::Entity(EntityPayload {
            name: required(&args.name, "name")?,
            entity_type: args
                .entity_type
                .as_deref()
                .unwrap_or("agent")
                .parse::<EntityType>()?,
            public_key: args.public_key.clone(),
        }),
        ElementType::Channel => Payload::Channel(ChannelPayload {
            name: required(&args.name, "name")?,
            members: Vec::new(),
            visibility: match args.visibility.as_deref() {
                Some("private") => ChannelVisibility::Private,
                _ => ChannelVisibility::Public,
            },
        }),
        ElementType::Message => Payload::Message(MessagePayload {
            channel_id: ElementId::new(required(&args.channel, "channel")?)?,
            sender: args
                .assignee
                .clone()
                .unwrap_or_else(|| "el-cli".to_string()),
            content_ref: ElementId::new(required(&args.content_ref, "content-ref")?)?,
            thread_id: args.thread.as_deref().map(ElementId::new).transpose()?,
        }),
        ElementType::Team => Payload::Team(TeamPayload {
            name: required(&args.name, "name")?,
            members: Vec::new(),
        }),
        ElementType::Library => Payload::Library(LibraryPayload {
            name: required(&args.name, "name")?,
            description_ref: args
                .description_ref
                .as_deref()
                .map(ElementId::new)
                .transpose()?,
        }),
        ElementType::Playbook => {
            let path = args.from_file.as_ref().ok_or_else(|| {
                ElementalError::new(
                    ErrorKind::MissingRequiredField,
                    "--from-file is required for playbooks",
                )
            })?;
            let raw = std::fs::read_to_string(path)?;
            let playbook: PlaybookPayload = serde_json::from_value(
                serde_json::from_str::<Value>(&raw).map_err(|err| {
                    ElementalError::new(
                        ErrorKind::InvalidJson,
                        format!("playbook file is not valid JSON: {err}"),
                    )
                })?,
            )
            .map_err(|err| {
                ElementalError::validation(format!("malformed playbook definition: {err}"))
            })?;
            Payload::Playbook(playbook)
        }
    })
}

fn run_dep(
    store: &Store,
    actor: &str,
    format: OutputFormat,
    command: DepCommand,
) -> Result<(), ElementalError> {
    match command {
        DepCommand::Add {
            source,
            target,
            r#type,
        } => {
            let dep_type: DependencyType = r#type.parse()?;
            let dependency = store.add_dependency(NewDependency {
                source_id: source,
                target_id: target,
                dep_type,
                created_by: actor.to_string(),
                metadata: Map::new(),
            })?;
            emit(
                format,
                "dep.add",
                serde_json::to_value(&dependency)
                    .map(|d| json!({ "dependency": d }))
                    .unwrap_or_default(),
                || {
                    format!(
                        "{} -{}-> {}",
                        dependency.source_id, dependency.dep_type, dependency.target_id
                    )
                },
            );
            Ok(())
        }
        DepCommand::Remove {
            source,
            target,
            r#type,
        } => {
            let dep_type: DependencyType = r#type.parse()?;
            store.remove_dependency(&source, &target, dep_type)?;
            emit(
                format,
                "dep.remove",
                json!({ "sourceId": source, "targetId": target, "type": dep_type.as_str() }),
                || "removed".to_string(),
            );
            Ok(())
        }
        DepCommand::List {
            id,
            direction,
            r#type,
        } => {
            let direction: Direction = direction.parse()?;
            let type_filter = r#type.as_deref().map(DependencyType::from_str).transpose()?;
            let deps = store.get_dependencies(&id, direction, type_filter)?;
            emit(
                format,
                "dep.list",
                json!({ "dependencies": serde_json::to_value(&deps).unwrap_or_default() }),
                || {
                    deps.iter()
                        .map(|d| format!("{} -{}-> {}", d.source_id, d.dep_type, d.target_id))
                        .collect::<Vec<_>>()
                        .join("\n")
                },
            );
            Ok(())
        }
        DepCommand::Tree {
            id,
            direction,
            max_depth,
        } => {
            let direction: Direction = direction.parse()?;
            let tree = store.get_dependency_tree(&id, direction, max_depth)?;
            emit(
                format,
                "dep.tree",
                serde_json::to_value(&tree)
                    .map(|t| json!({ "tree": t }))
                    .unwrap_or_default(),
                || {
                    format!(
                        "{}: {} nodes, {} down, {} up",
                        tree.root, tree.node_count, tree.dependency_depth, tree.dependent_depth
                    )
                },
            );
            Ok(())
        }
    }
}

fn run_doc(
    store: &Store,
    actor: &str,
    format: OutputFormat,
    command: DocCommand,
) -> Result<(), ElementalError> {
    match command {
        DocCommand::History { id } => {
            let versions = store.get_document_history(&id)?;
            emit(
                format,
                "doc.history",
                json!({ "versions": serde_json::to_value(&versions).unwrap_or_default() }),
                || {
                    versions
                        .iter()
                        .map(|v| format!("v{}  {}", v.version, time::to_iso(v.created_at)))
                        .collect::<Vec<_>>()
                        .join("\n")
                },
            );
            Ok(())
        }
        DocCommand::Get { id, version } => {
            let found = store.get_document_version(&id, version)?;
            match found {
                Some(v) => {
                    emit(
                        format,
                        "doc.get",
                        json!({ "version": serde_json::to_value(&v).unwrap_or_default() }),
                        || v.content.clone(),
                    );
                    Ok(())
                }
                None => Err(ElementalError::not_found(format!(
                    "document {id} has no version {version}"
                ))),
            }
        }
        DocCommand::Rollback { id, version } => {
            let element = store.rollback_document(&id, version, actor)?;
            let current = element
                .payload
                .as_document()
                .map(|d| d.version)
                .unwrap_or_default();
            emit(
                format,
                "doc.rollback",
                json!({ "id": id, "restoredFrom": version, "currentVersion": current }),
                || format!("rolled {id} back to v{version} as v{current}"),
            );
            Ok(())
        }
    }
}

fn run_workflow(
    store: &Store,
    format: OutputFormat,
    command: WorkflowCommand,
) -> Result<(), ElementalError> {
    match command {
        WorkflowCommand::Tasks { id, status, ready } => {
            let tasks = if ready {
                store.get_ready_tasks_in_workflow(&id, &ReadyFilter {
                    include_ephemeral: true,
                    ..Default::default()
                })?
            } else {
                store.get_tasks_in_workflow(
                    &id,
                    &ElementFilter {
                        status,
                        ..Default::default()
                    },
                )?
            };
            let items: Vec<Value> = tasks.iter().map(|e| e.to_json()).collect();
            emit(format, "workflow.tasks", json!({ "tasks": items }), || {
                render_task_lines(&tasks)
            });
            Ok(())
        }
        WorkflowCommand::Progress { id } => {
            let progress = store.get_workflow_progress(&id)?;
            emit(
                format,
                "workflow.progress",
                serde_json::to_value(&progress)
                    .map(|p| json!({ "progress": p }))
                    .unwrap_or_default(),
                || {
                    format!(
                        "{}: {}% ({} tasks, {} ready, {} blocked)",
                        progress.workflow_id,
                        progress.completion_percentage,
                        progress.total_tasks,
                        progress.ready_tasks,
                        progress.blocked_tasks
                    )
                },
            );
            Ok(())
        }
        WorkflowCommand::Workload { entity } => {
            let workload = store.get_agent_workload(&entity)?;
            emit(
                format,
                "workflow.workload",
                serde_json::to_value(&workload)
                    .map(|w| json!({ "workload": w }))
                    .unwrap_or_default(),
                || format!("{entity}: {} open tasks", workload.total_tasks),
            );
            Ok(())
        }
        WorkflowCommand::Burn { id } => {
            let report = store.burn_workflow(&id)?;
            emit(
                format,
                "workflow.burn",
                serde_json::to_value(&report)
                    .map(|r| json!({ "burned": r }))
                    .unwrap_or_default(),
                || {
                    format!(
                        "burned {} ({} tasks, {} edges)",
                        report.workflow_id, report.tasks_deleted, report.dependencies_deleted
                    )
                },
            );
            Ok(())
        }
        WorkflowCommand::Gc { max_age_ms, dry_run } => {
            let report = store.garbage_collect_workflows(GcOptions { max_age_ms, dry_run })?;
            emit(
                format,
                "workflow.gc",
                serde_json::to_value(&report)
                    .map(|r| json!({ "gc": r }))
                    .unwrap_or_default(),
                || {
                    format!(
                        "{} candidates, {} burned{}",
                        report.examined,
                        report.burned.len(),
                        if report.dry_run { " (dry run)" } else { "" }
                    )
                },
            );
            Ok(())
        }
    }
}

fn run_admin(
    store: &Store,
    format: OutputFormat,
    command: AdminCommand,
) -> Result<(), ElementalError> {
    match command {
        AdminCommand::Stats => {
            let stats = store.stats()?;
            emit(
                format,
                "admin.stats",
                serde_json::to_value(&stats)
                    .map(|s| json!({ "stats": s }))
                    .unwrap_or_default(),
                || {
                    format!(
                        "{} elements, schema v{}, {} dirty, wal={}",
                        stats.element_count, stats.schema_version, stats.dirty_count, stats.wal_mode
                    )
                },
            );
            Ok(())
        }
        AdminCommand::Integrity => {
            let ok = store.integrity_check()?;
            emit(format, "admin.integrity", json!({ "ok": ok }), || {
                if ok {
                    "ok".green().to_string()
                } else {
                    "corrupt".red().to_string()
                }
            });
            Ok(())
        }
        AdminCommand::Optimize => {
            store.optimize()?;
            emit(format, "admin.optimize", json!({}), || "optimized".to_string());
            Ok(())
        }
        AdminCommand::Migrate => {
            let report = store.migrate()?;
            emit(
                format,
                "admin.migrate",
                json!({
                    "fromVersion": report.from_version,
                    "toVersion": report.to_version,
                    "applied": report.applied,
                }),
                || format!("schema v{} -> v{}", report.from_version, report.to_version),
            );
            Ok(())
        }
        AdminCommand::Dirty { clear } => {
            let dirty = store.get_dirty()?;
            if clear {
                store.clear_all_dirty()?;
            }
            emit(
                format,
                "admin.dirty",
                json!({ "elements": dirty, "cleared": clear }),
                || dirty.join("\n"),
            );
            Ok(())
        }
    }
}
