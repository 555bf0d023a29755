//! Core data types for the element engine.
//!
//! Every stored row shares the [`Element`] envelope; the type-specific
//! payload is a tagged variant ([`Payload`]) selected by [`ElementType`].
//! Validation lives next to the types so the store and the pour planner
//! enforce the same rules.

use crate::core::error::{ElementalError, ErrorKind};
use crate::core::ids;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Maximum task/workflow title length in characters.
pub const MAX_TITLE_LEN: usize = 500;
/// Maximum document content size in bytes (10 MiB).
pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024;
/// Maximum library name length.
pub const MAX_LIBRARY_NAME_LEN: usize = 100;
/// Entity names an element may never claim.
pub const RESERVED_ENTITY_NAMES: [&str; 3] = ["system", "anonymous", "unknown"];

fn entity_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]{0,99}$").expect("entity regex"))
}

fn public_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // 32-byte key, standard base64: 43 payload chars plus one pad char.
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/]{43}=$").expect("public key regex"))
}

/// Opaque, validated element identifier.
///
/// Wraps the underlying string; conversions are explicit so task IDs,
/// document refs, and entity refs do not silently mix with arbitrary text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ElementalError> {
        let raw = raw.into();
        ids::parse(&raw)?;
        Ok(Self(raw))
    }

    /// Wrap a string the engine itself derived; skips re-validation.
    pub(crate) fn trusted(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ElementId {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// First-class element kinds managed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Task,
    Workflow,
    Document,
    Entity,
    Channel,
    Message,
    Team,
    Library,
    Playbook,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Workflow => "workflow",
            Self::Document => "document",
            Self::Entity => "entity",
            Self::Channel => "channel",
            Self::Message => "message",
            Self::Team => "team",
            Self::Library => "library",
            Self::Playbook => "playbook",
        }
    }

    pub const ALL: [ElementType; 9] = [
        Self::Task,
        Self::Workflow,
        Self::Document,
        Self::Entity,
        Self::Channel,
        Self::Message,
        Self::Team,
        Self::Library,
        Self::Playbook,
    ];
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementType {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "workflow" => Ok(Self::Workflow),
            "document" => Ok(Self::Document),
            "entity" => Ok(Self::Entity),
            "channel" => Ok(Self::Channel),
            "message" => Ok(Self::Message),
            "team" => Ok(Self::Team),
            "library" => Ok(Self::Library),
            "playbook" => Ok(Self::Playbook),
            other => Err(ElementalError::validation(format!(
                "unknown element type: {other}"
            ))
            .with_detail("type", json!(other))),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
    Tombstone,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
            Self::Tombstone => "tombstone",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Tombstone)
    }

    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }

    /// The task status machine. Same-status writes are permitted no-ops;
    /// `blocked` and `deferred` can resume since they are observational
    /// holds, not terminal states.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if from == to {
            return true;
        }
        match (from, to) {
            (Backlog, Open) => true,
            (Open, InProgress) | (InProgress, Open) => true,
            (Open | InProgress, Blocked) => true,
            (Blocked, Open | InProgress) => true,
            (Open | InProgress | Blocked, Deferred) => true,
            (Deferred, Open) => true,
            (Open | InProgress | Blocked, Closed) => true,
            (Closed, Open) => true,
            (from, Tombstone) => from != Tombstone,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backlog" => Ok(Self::Backlog),
            "open" => Ok(Self::Open),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "deferred" => Ok(Self::Deferred),
            "closed" => Ok(Self::Closed),
            "tombstone" => Ok(Self::Tombstone),
            other => Err(ElementalError::new(
                ErrorKind::InvalidStatus,
                format!("unknown task status: {other}"),
            )
            .with_detail("status", json!(other))),
        }
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for WorkflowStatus {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ElementalError::new(
                ErrorKind::InvalidStatus,
                format!("unknown workflow status: {other}"),
            )
            .with_detail("status", json!(other))),
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Bug,
    Feature,
    #[default]
    Task,
    Chore,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Task => "task",
            Self::Chore => "chore",
        }
    }
}

impl FromStr for TaskType {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            "task" => Ok(Self::Task),
            "chore" => Ok(Self::Chore),
            other => Err(
                ElementalError::validation(format!("unknown task type: {other}"))
                    .with_detail("taskType", json!(other)),
            ),
        }
    }
}

/// Document content flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    #[default]
    Markdown,
    Json,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Json => "json",
        }
    }
}

impl FromStr for ContentType {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(ElementalError::new(
                ErrorKind::InvalidContentType,
                format!("unknown content type: {other}"),
            )
            .with_detail("contentType", json!(other))),
        }
    }
}

/// Entity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Agent,
    Human,
    System,
}

impl FromStr for EntityType {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(Self::Agent),
            "human" => Ok(Self::Human),
            "system" => Ok(Self::System),
            other => Err(
                ElementalError::validation(format!("unknown entity type: {other}"))
                    .with_detail("entityType", json!(other)),
            ),
        }
    }
}

/// Channel visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelVisibility {
    #[default]
    Public,
    Private,
}

// --- Typed payloads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default = "default_scale")]
    pub priority: u8,
    #[serde(default = "default_scale")]
    pub complexity: u8,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_ref: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

fn default_scale() -> u8 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPayload {
    pub title: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    #[serde(default)]
    pub content_type: ContentType,
    pub content: String,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version_id: Option<String>,
}

fn default_version() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPayload {
    pub name: String,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayload {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub visibility: ChannelVisibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub channel_id: ElementId,
    pub sender: String,
    pub content_ref: ElementId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ElementId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamPayload {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_ref: Option<ElementId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookStep {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookPayload {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<PlaybookStep>,
    #[serde(default)]
    pub variables: Vec<PlaybookVariable>,
}

/// Type-specific payload, discriminated by the envelope's [`ElementType`].
#[derive(Debug, Clone)]
pub enum Payload {
    Task(TaskPayload),
    Workflow(WorkflowPayload),
    Document(DocumentPayload),
    Entity(EntityPayload),
    Channel(ChannelPayload),
    Message(MessagePayload),
    Team(TeamPayload),
    Library(LibraryPayload),
    Playbook(PlaybookPayload),
}

impl Payload {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Task(_) => ElementType::Task,
            Self::Workflow(_) => ElementType::Workflow,
            Self::Document(_) => ElementType::Document,
            Self::Entity(_) => ElementType::Entity,
            Self::Channel(_) => ElementType::Channel,
            Self::Message(_) => ElementType::Message,
            Self::Team(_) => ElementType::Team,
            Self::Library(_) => ElementType::Library,
            Self::Playbook(_) => ElementType::Playbook,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Task(p) => serde_json::to_value(p),
            Self::Workflow(p) => serde_json::to_value(p),
            Self::Document(p) => serde_json::to_value(p),
            Self::Entity(p) => serde_json::to_value(p),
            Self::Channel(p) => serde_json::to_value(p),
            Self::Message(p) => serde_json::to_value(p),
            Self::Team(p) => serde_json::to_value(p),
            Self::Library(p) => serde_json::to_value(p),
            Self::Playbook(p) => serde_json::to_value(p),
        }
        .unwrap_or(Value::Null)
    }

    pub fn from_json(element_type: ElementType, value: Value) -> Result<Self, ElementalError> {
        let wrap = |err: serde_json::Error| {
            ElementalError::validation(format!("malformed {element_type} payload: {err}"))
                .with_cause(err)
        };
        Ok(match element_type {
            ElementType::Task => Self::Task(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Workflow => Self::Workflow(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Document => Self::Document(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Entity => Self::Entity(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Channel => Self::Channel(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Message => Self::Message(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Team => Self::Team(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Library => Self::Library(serde_json::from_value(value).map_err(wrap)?),
            ElementType::Playbook => Self::Playbook(serde_json::from_value(value).map_err(wrap)?),
        })
    }

    pub fn as_task(&self) -> Option<&TaskPayload> {
        match self {
            Self::Task(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_workflow(&self) -> Option<&WorkflowPayload> {
        match self {
            Self::Workflow(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&DocumentPayload> {
        match self {
            Self::Document(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_playbook(&self) -> Option<&PlaybookPayload> {
        match self {
            Self::Playbook(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessagePayload> {
        match self {
            Self::Message(p) => Some(p),
            _ => None,
        }
    }
}

/// Common envelope shared by every stored element.
#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub element_type: ElementType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub payload: Payload,
}

impl Element {
    /// Whether this element is soft-deleted: tasks use the `tombstone`
    /// status, every other type a `deleted` metadata flag.
    pub fn is_deleted(&self) -> bool {
        if let Payload::Task(task) = &self.payload {
            if task.status == TaskStatus::Tombstone {
                return true;
            }
        }
        self.metadata
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn status_str(&self) -> Option<&'static str> {
        match &self.payload {
            Payload::Task(t) => Some(t.status.as_str()),
            Payload::Workflow(w) => Some(w.status.as_str()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id.as_str(),
            "type": self.element_type.as_str(),
            "createdAt": crate::core::time::to_iso(self.created_at),
            "updatedAt": crate::core::time::to_iso(self.updated_at),
            "createdBy": self.created_by,
            "tags": self.tags,
            "metadata": Value::Object(self.metadata.clone()),
            "payload": self.payload.to_json(),
        })
    }
}

/// Typed directed edge categories.
///
/// Enumeration order is the deterministic tie-break order for traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    ParentChild,
    RelatesTo,
    References,
    Awaits,
    Validates,
    AuthoredBy,
    AssignedTo,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::ParentChild => "parent-child",
            Self::RelatesTo => "relates-to",
            Self::References => "references",
            Self::Awaits => "awaits",
            Self::Validates => "validates",
            Self::AuthoredBy => "authored-by",
            Self::AssignedTo => "assigned-to",
        }
    }

    /// Types whose same-type subgraph must stay acyclic.
    pub const fn is_cycle_checked(&self) -> bool {
        matches!(self, Self::Blocks | Self::ParentChild)
    }

    pub const ALL: [DependencyType; 8] = [
        Self::Blocks,
        Self::ParentChild,
        Self::RelatesTo,
        Self::References,
        Self::Awaits,
        Self::Validates,
        Self::AuthoredBy,
        Self::AssignedTo,
    ];
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocks" => Ok(Self::Blocks),
            "parent-child" => Ok(Self::ParentChild),
            "relates-to" => Ok(Self::RelatesTo),
            "references" => Ok(Self::References),
            "awaits" => Ok(Self::Awaits),
            "validates" => Ok(Self::Validates),
            "authored-by" => Ok(Self::AuthoredBy),
            "assigned-to" => Ok(Self::AssignedTo),
            other => Err(ElementalError::validation(format!(
                "unknown dependency type: {other}"
            ))
            .with_detail("type", json!(other))),
        }
    }
}

/// A typed directed edge. For `blocks`, `source` is the blocked element and
/// `target` the blocker; for `parent-child`, `source` is the child.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub source_id: ElementId,
    pub target_id: ElementId,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Filter for list/count queries over elements.
#[derive(Debug, Clone, Default)]
pub struct ElementFilter {
    pub element_type: Option<ElementType>,
    pub status: Option<String>,
    pub assignee: Option<String>,
    pub priority: Option<u8>,
    pub task_type: Option<TaskType>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include_deleted: bool,
    pub include_ephemeral: bool,
}

// --- Payload validation ---

/// Validate a payload against its type-specific rules. Called on create and
/// on every update.
pub fn validate_payload(payload: &Payload) -> Result<(), ElementalError> {
    match payload {
        Payload::Task(task) => {
            validate_title(&task.title)?;
            validate_scale("priority", task.priority)?;
            validate_scale("complexity", task.complexity)?;
            Ok(())
        }
        Payload::Workflow(workflow) => validate_title(&workflow.title),
        Payload::Document(doc) => validate_document_content(doc.content_type, &doc.content),
        Payload::Entity(entity) => {
            validate_entity_name(&entity.name)?;
            if let Some(key) = &entity.public_key {
                if !public_key_regex().is_match(key) {
                    return Err(ElementalError::validation(
                        "publicKey must be a 44-character base64 string",
                    )
                    .with_detail("publicKey", json!(key)));
                }
            }
            Ok(())
        }
        Payload::Channel(channel) => validate_name_present("channel", &channel.name),
        Payload::Message(_) => Ok(()),
        Payload::Team(team) => validate_name_present("team", &team.name),
        Payload::Library(library) => {
            if library.name.is_empty() || library.name.len() > MAX_LIBRARY_NAME_LEN {
                return Err(ElementalError::validation(format!(
                    "library name must be 1..{MAX_LIBRARY_NAME_LEN} characters"
                ))
                .with_detail("name", json!(library.name)));
            }
            Ok(())
        }
        Payload::Playbook(playbook) => validate_playbook(playbook),
    }
}

pub fn validate_title(title: &str) -> Result<(), ElementalError> {
    if title.trim().is_empty() {
        return Err(ElementalError::new(
            ErrorKind::MissingRequiredField,
            "title must not be empty",
        )
        .with_detail("field", json!("title")));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ElementalError::new(
            ErrorKind::TitleTooLong,
            format!("title exceeds {MAX_TITLE_LEN} characters"),
        )
        .with_detail("length", json!(title.chars().count()))
        .with_detail("max", json!(MAX_TITLE_LEN)));
    }
    Ok(())
}

fn validate_scale(field: &str, value: u8) -> Result<(), ElementalError> {
    if !(1..=5).contains(&value) {
        return Err(ElementalError::validation(format!(
            "{field} must be between 1 and 5, got {value}"
        ))
        .with_detail("field", json!(field))
        .with_detail("value", json!(value)));
    }
    Ok(())
}

fn validate_name_present(kind: &str, name: &str) -> Result<(), ElementalError> {
    if name.trim().is_empty() {
        return Err(ElementalError::new(
            ErrorKind::MissingRequiredField,
            format!("{kind} name must not be empty"),
        )
        .with_detail("field", json!("name")));
    }
    Ok(())
}

pub fn validate_entity_name(name: &str) -> Result<(), ElementalError> {
    if !entity_name_regex().is_match(name) {
        return Err(ElementalError::validation(format!(
            "entity name must match ^[a-zA-Z][a-zA-Z0-9_-]{{0,99}}$: {name}"
        ))
        .with_detail("name", json!(name)));
    }
    if RESERVED_ENTITY_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
    {
        return Err(
            ElementalError::validation(format!("entity name is reserved: {name}"))
                .with_detail("name", json!(name)),
        );
    }
    Ok(())
}

pub fn validate_document_content(
    content_type: ContentType,
    content: &str,
) -> Result<(), ElementalError> {
    if content.len() > MAX_CONTENT_SIZE {
        return Err(ElementalError::validation(format!(
            "document content exceeds {MAX_CONTENT_SIZE} bytes"
        ))
        .with_detail("size", json!(content.len()))
        .with_detail("max", json!(MAX_CONTENT_SIZE)));
    }
    if content_type == ContentType::Json {
        serde_json::from_str::<Value>(content).map_err(|err| {
            ElementalError::new(
                ErrorKind::InvalidJson,
                format!("document content is not valid JSON: {err}"),
            )
            .with_cause(err)
        })?;
    }
    Ok(())
}

fn validate_playbook(playbook: &PlaybookPayload) -> Result<(), ElementalError> {
    validate_name_present("playbook", &playbook.name)?;
    let mut seen = std::collections::HashSet::new();
    for step in &playbook.steps {
        if step.id.trim().is_empty() {
            return Err(ElementalError::new(
                ErrorKind::MissingRequiredField,
                "playbook step id must not be empty",
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ElementalError::validation(format!(
                "duplicate playbook step id: {}",
                step.id
            ))
            .with_detail("stepId", json!(step.id)));
        }
        validate_title(&step.title)?;
        if let Some(priority) = step.priority {
            validate_scale("priority", priority)?;
        }
        if let Some(complexity) = step.complexity {
            validate_scale("complexity", complexity)?;
        }
    }
    for step in &playbook.steps {
        for dep in &step.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(ElementalError::validation(format!(
                    "step {} depends on unknown step {dep}",
                    step.id
                ))
                .with_detail("stepId", json!(step.id))
                .with_detail("dependsOn", json!(dep)));
            }
            if dep == &step.id {
                return Err(ElementalError::new(
                    ErrorKind::CycleDetected,
                    format!("step {} depends on itself", step.id),
                )
                .with_detail("stepId", json!(step.id)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(TaskStatus::can_transition(Backlog, Open));
        assert!(TaskStatus::can_transition(Open, InProgress));
        assert!(TaskStatus::can_transition(InProgress, Open));
        assert!(TaskStatus::can_transition(Open, Blocked));
        assert!(TaskStatus::can_transition(Blocked, InProgress));
        assert!(TaskStatus::can_transition(Blocked, Closed));
        assert!(TaskStatus::can_transition(Closed, Open));
        assert!(TaskStatus::can_transition(Deferred, Tombstone));
        assert!(!TaskStatus::can_transition(Backlog, InProgress));
        assert!(!TaskStatus::can_transition(Backlog, Closed));
        assert!(!TaskStatus::can_transition(Closed, InProgress));
        assert!(!TaskStatus::can_transition(Tombstone, Open));
        assert!(!TaskStatus::can_transition(Deferred, Closed));
    }

    #[test]
    fn test_entity_name_rules() {
        assert!(validate_entity_name("ada").is_ok());
        assert!(validate_entity_name("Agent_7-builder").is_ok());
        assert!(validate_entity_name("1agent").is_err());
        assert!(validate_entity_name("-lead").is_err());
        assert!(validate_entity_name("").is_err());
        for reserved in RESERVED_ENTITY_NAMES {
            assert!(validate_entity_name(reserved).is_err());
            assert!(validate_entity_name(&reserved.to_uppercase()).is_err());
        }
        let long = "a".repeat(100);
        assert!(validate_entity_name(&long).is_ok());
        let too_long = "a".repeat(101);
        assert!(validate_entity_name(&too_long).is_err());
    }

    #[test]
    fn test_public_key_format_check() {
        let good = format!("{}=", "A".repeat(43));
        let entity = Payload::Entity(EntityPayload {
            name: "ada".to_string(),
            entity_type: EntityType::Agent,
            public_key: Some(good),
        });
        assert!(validate_payload(&entity).is_ok());

        let bad = Payload::Entity(EntityPayload {
            name: "ada".to_string(),
            entity_type: EntityType::Agent,
            public_key: Some("too-short".to_string()),
        });
        assert!(validate_payload(&bad).is_err());
    }

    #[test]
    fn test_document_content_bounds() {
        let at_limit = "x".repeat(MAX_CONTENT_SIZE);
        assert!(validate_document_content(ContentType::Text, &at_limit).is_ok());
        let over = "x".repeat(MAX_CONTENT_SIZE + 1);
        assert!(validate_document_content(ContentType::Text, &over).is_err());
        assert!(validate_document_content(ContentType::Json, "{\"a\":1}").is_ok());
        let err = validate_document_content(ContentType::Json, "{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidJson);
    }

    #[test]
    fn test_title_bounds() {
        assert!(validate_title("fix the parser").is_ok());
        let err = validate_title("").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingRequiredField);
        let err = validate_title(&"x".repeat(MAX_TITLE_LEN + 1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TitleTooLong);
    }

    #[test]
    fn test_payload_round_trip_preserves_camel_case() {
        let payload = Payload::Task(TaskPayload {
            title: "Wire the exporter".to_string(),
            status: TaskStatus::Open,
            priority: 2,
            complexity: 3,
            task_type: TaskType::Feature,
            assignee: Some("el-ada".to_string()),
            scheduled_for: None,
            close_reason: None,
            description_ref: None,
            closed_at: None,
        });
        let value = payload.to_json();
        assert_eq!(value["taskType"], "feature");
        assert_eq!(value["status"], "open");
        let back = Payload::from_json(ElementType::Task, value).unwrap();
        assert_eq!(back.as_task().unwrap().priority, 2);
    }

    #[test]
    fn test_playbook_validation() {
        let playbook = PlaybookPayload {
            name: "release".to_string(),
            steps: vec![
                PlaybookStep {
                    id: "build".to_string(),
                    title: "Build".to_string(),
                    depends_on: vec![],
                    condition: None,
                    priority: None,
                    complexity: None,
                    assignee: None,
                },
                PlaybookStep {
                    id: "deploy".to_string(),
                    title: "Deploy".to_string(),
                    depends_on: vec!["build".to_string()],
                    condition: None,
                    priority: Some(1),
                    complexity: Some(2),
                    assignee: None,
                },
            ],
            variables: vec![],
        };
        assert!(validate_payload(&Payload::Playbook(playbook.clone())).is_ok());

        let mut unknown_dep = playbook.clone();
        unknown_dep.steps[1].depends_on = vec!["missing".to_string()];
        assert!(validate_payload(&Payload::Playbook(unknown_dep)).is_err());

        let mut duplicate = playbook;
        duplicate.steps[1].id = "build".to_string();
        assert!(validate_payload(&Payload::Playbook(duplicate)).is_err());
    }

    #[test]
    fn test_element_id_validates() {
        assert!(ElementId::new("el-abc").is_ok());
        assert!(ElementId::new("el-abc.2").is_ok());
        assert!(ElementId::new("abc").is_err());
    }

    #[test]
    fn test_deleted_detection() {
        let mut metadata = Map::new();
        metadata.insert("deleted".to_string(), json!(true));
        let element = Element {
            id: ElementId::trusted("el-doc"),
            element_type: ElementType::Document,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: "el-sys".to_string(),
            tags: vec![],
            metadata,
            payload: Payload::Document(DocumentPayload {
                content_type: ContentType::Text,
                content: "hello".to_string(),
                version: 1,
                previous_version_id: None,
            }),
        };
        assert!(element.is_deleted());
    }
}
