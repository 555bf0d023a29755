//! The element store: typed CRUD, tombstones, members, burn, GC.
//!
//! The store exclusively owns the storage backend. Every public operation
//! acquires the store mutex for its full duration, so no two mutating calls
//! interleave SQL against the connection. Mutations run in one transaction
//! and emit their events only after a successful commit.

use crate::core::db::{Database, DbConfig, DbStats, Isolation, MigrationReport};
use crate::core::documents::{self, DocumentVersion};
use crate::core::error::{self, ElementalError, ErrorKind};
use crate::core::events::{EventBus, StoreEvent, SubscriberId};
use crate::core::graph::{self, Direction, NewDependency};
use crate::core::ids::{self, IdSeed};
use crate::core::model::{
    self, Dependency, DependencyType, Element, ElementFilter, ElementId, ElementType, Payload,
    TaskStatus, WorkflowStatus,
};
use crate::core::pour::{self, PourOptions, PourReceipt};
use crate::core::queries::{self, AgentWorkload, BlockedTask, ReadyFilter, WorkflowProgress};
use crate::core::time;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cooperative cancellation flag checked before SQL dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Creation request for [`Store::create`].
#[derive(Debug, Clone)]
pub struct NewElement {
    /// Explicit ID; generated from the payload's identifier when absent.
    pub id: Option<String>,
    pub created_by: String,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub payload: Payload,
}

impl NewElement {
    pub fn new(created_by: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: None,
            created_by: created_by.into(),
            tags: Vec::new(),
            metadata: Map::new(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Options for [`Store::get_with`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub include_deleted: bool,
    /// Join the referenced document's current content into the view
    /// (tasks: `descriptionRef`; messages: `contentRef`).
    pub hydrate_content: bool,
}

/// Element plus optionally hydrated referenced content.
#[derive(Debug, Clone)]
pub struct ElementView {
    pub element: Element,
    pub content: Option<String>,
}

/// Patch for [`Store::update`]. `tags` and `metadata` are replaced wholesale
/// when supplied; `payload` is a shallow field merge over the typed payload.
#[derive(Debug, Clone, Default)]
pub struct ElementPatch {
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Map<String, Value>>,
    pub payload: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub actor: String,
    /// Optimistic concurrency: the stored `updatedAt` must match exactly.
    pub expected_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub actor: String,
    pub reason: Option<String>,
}

/// Result of [`Store::burn_workflow`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnReport {
    pub workflow_id: String,
    pub was_ephemeral: bool,
    pub tasks_deleted: usize,
    pub dependencies_deleted: usize,
}

#[derive(Debug, Clone)]
pub struct GcOptions {
    pub max_age_ms: i64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub examined: usize,
    pub candidates: Vec<String>,
    pub burned: Vec<BurnReport>,
    pub dry_run: bool,
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Element>,
    pub total: i64,
    pub limit: Option<usize>,
    pub offset: usize,
}

struct Inner {
    db: Database,
    bus: EventBus,
    cancel: Option<CancelToken>,
}

/// Handle to the element engine. Cheap to share behind an `Arc`; all
/// operations serialize on the internal mutex.
pub struct Store {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (and migrate) a store for the given configuration.
    pub fn open(config: &DbConfig) -> Result<Self, ElementalError> {
        let db = Database::open(config)?;
        db.migrate()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                db,
                bus: EventBus::new(),
                cancel: None,
            }),
        })
    }

    pub fn open_in_memory() -> Result<Self, ElementalError> {
        Self::open(&DbConfig::memory())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, ElementalError> {
        self.inner
            .lock()
            .map_err(|_| ElementalError::database("store mutex poisoned"))
    }

    // --- Events & cancellation ---

    pub fn subscribe<F>(&self, subscriber: F) -> Result<SubscriberId, ElementalError>
    where
        F: Fn(&StoreEvent) + Send + 'static,
    {
        Ok(self.lock()?.bus.subscribe(subscriber))
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> Result<bool, ElementalError> {
        Ok(self.lock()?.bus.unsubscribe(id))
    }

    pub fn set_error_sink<F>(&self, sink: F) -> Result<(), ElementalError>
    where
        F: Fn(&str) + Send + 'static,
    {
        self.lock()?.bus.set_error_sink(sink);
        Ok(())
    }

    pub fn set_cancel_token(&self, token: Option<CancelToken>) -> Result<(), ElementalError> {
        self.lock()?.cancel = token;
        Ok(())
    }

    // --- Element CRUD ---

    pub fn create(&self, request: NewElement) -> Result<Element, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let element = inner.create(request)?;
        inner.bus.emit(&StoreEvent::ElementCreated {
            id: element.id.as_str().to_string(),
            element_type: element.element_type,
            actor: element.created_by.clone(),
        });
        Ok(element)
    }

    pub fn get(&self, id: &str) -> Result<Option<Element>, ElementalError> {
        Ok(self
            .get_with(id, &GetOptions::default())?
            .map(|view| view.element))
    }

    pub fn get_with(
        &self,
        id: &str,
        options: &GetOptions,
    ) -> Result<Option<ElementView>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let Some(element) = fetch_element(&inner.db, id)? else {
            return Ok(None);
        };
        if element.is_deleted() && !options.include_deleted {
            return Ok(None);
        }
        let content = if options.hydrate_content {
            hydrate_content(&inner.db, &element)?
        } else {
            None
        };
        Ok(Some(ElementView { element, content }))
    }

    /// Batched fetch preserving input order; missing and deleted rows are
    /// skipped.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Element>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(element) = fetch_element(&inner.db, id)? {
                if !element.is_deleted() {
                    out.push(element);
                }
            }
        }
        Ok(out)
    }

    pub fn list(&self, filter: &ElementFilter) -> Result<Vec<Element>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        select_elements(&inner.db, filter)
    }

    pub fn list_paginated(&self, filter: &ElementFilter) -> Result<Page, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let items = select_elements(&inner.db, filter)?;
        let total = count_elements(&inner.db, filter)?;
        Ok(Page {
            items,
            total,
            limit: filter.limit,
            offset: filter.offset.unwrap_or(0),
        })
    }

    pub fn count(&self, filter: &ElementFilter) -> Result<i64, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        count_elements(&inner.db, filter)
    }

    pub fn update(
        &self,
        id: &str,
        patch: ElementPatch,
        options: UpdateOptions,
    ) -> Result<Element, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let (element, version_created) = inner.update(id, patch, &options)?;
        if let Some(version) = version_created {
            inner.bus.emit(&StoreEvent::DocumentVersionCreated {
                document_id: element.id.as_str().to_string(),
                version,
            });
        }
        inner.bus.emit(&StoreEvent::ElementUpdated {
            id: element.id.as_str().to_string(),
            element_type: element.element_type,
            actor: options.actor,
        });
        Ok(element)
    }

    pub fn delete(&self, id: &str, options: DeleteOptions) -> Result<(), ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let element_type = inner.delete(id, &options)?;
        inner.bus.emit(&StoreEvent::ElementDeleted {
            id: id.to_string(),
            element_type,
            actor: options.actor,
            reason: options.reason,
        });
        Ok(())
    }

    // --- Collection mutations ---

    pub fn add_team_member(
        &self,
        team_id: &str,
        entity_id: &str,
        actor: &str,
    ) -> Result<bool, ElementalError> {
        self.mutate_members(team_id, entity_id, actor, ElementType::Team, true)
    }

    pub fn remove_team_member(
        &self,
        team_id: &str,
        entity_id: &str,
        actor: &str,
    ) -> Result<bool, ElementalError> {
        self.mutate_members(team_id, entity_id, actor, ElementType::Team, false)
    }

    pub fn add_channel_member(
        &self,
        channel_id: &str,
        entity_id: &str,
        actor: &str,
    ) -> Result<bool, ElementalError> {
        self.mutate_members(channel_id, entity_id, actor, ElementType::Channel, true)
    }

    pub fn remove_channel_member(
        &self,
        channel_id: &str,
        entity_id: &str,
        actor: &str,
    ) -> Result<bool, ElementalError> {
        self.mutate_members(channel_id, entity_id, actor, ElementType::Channel, false)
    }

    fn mutate_members(
        &self,
        id: &str,
        entity_id: &str,
        actor: &str,
        expected: ElementType,
        add: bool,
    ) -> Result<bool, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let changed = inner.mutate_members(id, entity_id, expected, add)?;
        if changed {
            inner.bus.emit(&StoreEvent::ElementUpdated {
                id: id.to_string(),
                element_type: expected,
                actor: actor.to_string(),
            });
        }
        Ok(changed)
    }

    // --- Workflow-scoped mutations ---

    pub fn burn_workflow(&self, workflow_id: &str) -> Result<BurnReport, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let report = inner.burn_workflow(workflow_id)?;
        inner.bus.emit(&StoreEvent::WorkflowBurned {
            workflow_id: report.workflow_id.clone(),
            tasks_deleted: report.tasks_deleted,
            dependencies_deleted: report.dependencies_deleted,
        });
        Ok(report)
    }

    pub fn garbage_collect_workflows(
        &self,
        options: GcOptions,
    ) -> Result<GcReport, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let candidates = inner.gc_candidates(options.max_age_ms)?;
        let mut burned = Vec::new();
        if !options.dry_run {
            for workflow_id in &candidates {
                let report = inner.burn_workflow(workflow_id)?;
                inner.bus.emit(&StoreEvent::WorkflowBurned {
                    workflow_id: report.workflow_id.clone(),
                    tasks_deleted: report.tasks_deleted,
                    dependencies_deleted: report.dependencies_deleted,
                });
                burned.push(report);
            }
        }
        Ok(GcReport {
            examined: candidates.len(),
            candidates,
            burned,
            dry_run: options.dry_run,
        })
    }

    // --- Dependency graph ---

    pub fn add_dependency(&self, request: NewDependency) -> Result<Dependency, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let dependency = graph::add_dependency(&inner.db, &request)?;
        for id in [&request.source_id, &request.target_id] {
            inner.db.mark_dirty(id)?;
        }
        inner.bus.emit(&StoreEvent::DependencyAdded {
            source_id: request.source_id,
            target_id: request.target_id,
            dep_type: request.dep_type,
        });
        Ok(dependency)
    }

    pub fn remove_dependency(
        &self,
        source_id: &str,
        target_id: &str,
        dep_type: DependencyType,
    ) -> Result<(), ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        graph::remove_dependency(&inner.db, source_id, target_id, dep_type)?;
        for id in [source_id, target_id] {
            inner.db.mark_dirty(id)?;
        }
        inner.bus.emit(&StoreEvent::DependencyRemoved {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            dep_type,
        });
        Ok(())
    }

    pub fn get_dependencies(
        &self,
        id: &str,
        direction: Direction,
        type_filter: Option<DependencyType>,
    ) -> Result<Vec<Dependency>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        graph::get_dependencies(&inner.db, id, direction, type_filter)
    }

    pub fn get_dependency_tree(
        &self,
        id: &str,
        direction: Direction,
        max_depth: Option<usize>,
    ) -> Result<graph::DependencyTree, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        graph::get_dependency_tree(&inner.db, id, direction, max_depth)
    }

    pub fn has_cycle(&self, dep_type: DependencyType) -> Result<bool, ElementalError> {
        let inner = self.lock()?;
        graph::has_cycle(&inner.db, dep_type)
    }

    // --- Documents ---

    pub fn get_document_history(
        &self,
        document_id: &str,
    ) -> Result<Vec<DocumentVersion>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        documents::history(&inner.db, document_id)
    }

    pub fn get_document_version(
        &self,
        document_id: &str,
        version: i64,
    ) -> Result<Option<DocumentVersion>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        documents::get_version(&inner.db, document_id, version)
    }

    /// Roll a document back to `version` by writing a new head with that
    /// version's content. History is preserved.
    pub fn rollback_document(
        &self,
        document_id: &str,
        version: i64,
        actor: &str,
    ) -> Result<Element, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let element = inner.rollback_document(document_id, version, actor)?;
        let new_version = element
            .payload
            .as_document()
            .map(|doc| doc.version)
            .unwrap_or_default();
        inner.bus.emit(&StoreEvent::DocumentVersionCreated {
            document_id: document_id.to_string(),
            version: new_version,
        });
        inner.bus.emit(&StoreEvent::ElementUpdated {
            id: document_id.to_string(),
            element_type: ElementType::Document,
            actor: actor.to_string(),
        });
        Ok(element)
    }

    // --- Query layer ---

    pub fn ready(&self, filter: &ReadyFilter) -> Result<Vec<Element>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        queries::ready(&inner.db, filter)
    }

    pub fn blocked(&self, filter: &ReadyFilter) -> Result<Vec<BlockedTask>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        queries::blocked(&inner.db, filter)
    }

    pub fn backlog(&self, filter: &ReadyFilter) -> Result<Vec<Element>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        queries::backlog(&inner.db, filter)
    }

    pub fn get_tasks_in_workflow(
        &self,
        workflow_id: &str,
        filter: &ElementFilter,
    ) -> Result<Vec<Element>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        queries::tasks_in_workflow(&inner.db, workflow_id, filter)
    }

    pub fn get_ready_tasks_in_workflow(
        &self,
        workflow_id: &str,
        filter: &ReadyFilter,
    ) -> Result<Vec<Element>, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        queries::ready_tasks_in_workflow(&inner.db, workflow_id, filter)
    }

    pub fn get_workflow_progress(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowProgress, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        queries::workflow_progress(&inner.db, workflow_id)
    }

    pub fn get_agent_workload(&self, entity_id: &str) -> Result<AgentWorkload, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        queries::agent_workload(&inner.db, entity_id)
    }

    // --- Workflow pour ---

    /// Expand a stored playbook into a workflow with tasks and edges,
    /// persisted atomically.
    pub fn pour(
        &self,
        playbook_id: &str,
        variables: &Map<String, Value>,
        options: PourOptions,
    ) -> Result<PourReceipt, ElementalError> {
        let inner = self.lock()?;
        inner.check_cancelled()?;
        let Some(playbook_element) = fetch_element(&inner.db, playbook_id)? else {
            return Err(ElementalError::new(
                ErrorKind::PlaybookNotFound,
                format!("playbook not found: {playbook_id}"),
            )
            .with_detail("id", json!(playbook_id)));
        };
        if playbook_element.is_deleted() {
            return Err(ElementalError::new(
                ErrorKind::PlaybookNotFound,
                format!("playbook is deleted: {playbook_id}"),
            ));
        }
        let Some(playbook) = playbook_element.payload.as_playbook() else {
            return Err(ElementalError::validation(format!(
                "{playbook_id} is not a playbook"
            )));
        };
        let receipt = pour::pour(&inner.db, playbook, variables, &options)?;
        for task in &receipt.task_ids {
            inner.bus.emit(&StoreEvent::ElementCreated {
                id: task.clone(),
                element_type: ElementType::Task,
                actor: options.created_by.clone(),
            });
        }
        inner.bus.emit(&StoreEvent::ElementCreated {
            id: receipt.workflow_id.clone(),
            element_type: ElementType::Workflow,
            actor: options.created_by.clone(),
        });
        for (source, target, dep_type) in &receipt.edges {
            inner.bus.emit(&StoreEvent::DependencyAdded {
                source_id: source.clone(),
                target_id: target.clone(),
                dep_type: *dep_type,
            });
        }
        Ok(receipt)
    }

    // --- Maintenance passthroughs ---

    pub fn stats(&self) -> Result<DbStats, ElementalError> {
        self.lock()?.db.stats()
    }

    pub fn integrity_check(&self) -> Result<bool, ElementalError> {
        self.lock()?.db.integrity_check()
    }

    pub fn optimize(&self) -> Result<(), ElementalError> {
        self.lock()?.db.optimize()
    }

    pub fn migrate(&self) -> Result<MigrationReport, ElementalError> {
        self.lock()?.db.migrate()
    }

    pub fn get_dirty(&self) -> Result<Vec<String>, ElementalError> {
        self.lock()?.db.get_dirty()
    }

    pub fn clear_dirty(&self, ids: &[String]) -> Result<usize, ElementalError> {
        self.lock()?.db.clear_dirty(ids)
    }

    pub fn clear_all_dirty(&self) -> Result<usize, ElementalError> {
        self.lock()?.db.clear_all_dirty()
    }

    /// Run `f` against the backend under the store lock. Escape hatch for
    /// diagnostics and tests; mutations should use the typed operations.
    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, ElementalError>,
    ) -> Result<T, ElementalError> {
        let inner = self.lock()?;
        f(&inner.db)
    }
}

impl Inner {
    fn check_cancelled(&self) -> Result<(), ElementalError> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(ElementalError::validation("operation cancelled")
                    .with_detail("code", json!("CANCELLED")));
            }
        }
        Ok(())
    }

    fn create(&self, request: NewElement) -> Result<Element, ElementalError> {
        model::validate_payload(&request.payload)?;
        let tags = normalize_tags(request.tags);
        let now = time::now_utc();
        let now_iso = time::to_iso(now);

        self.db.transaction(Isolation::Immediate, |db| {
            check_references(db, &request.payload, None)?;

            let id = match &request.id {
                Some(explicit) => {
                    ids::parse(explicit)?;
                    let taken: Option<i64> = db.query_one(
                        "SELECT 1 FROM elements WHERE id = ?1",
                        [explicit.as_str()],
                        |row| row.get(0),
                    )?;
                    if taken.is_some() {
                        return Err(ElementalError::new(
                            ErrorKind::AlreadyExists,
                            format!("element already exists: {explicit}"),
                        )
                        .with_detail("id", json!(explicit)));
                    }
                    explicit.clone()
                }
                None => {
                    let element_count: i64 = db
                        .query_one("SELECT COUNT(*) FROM elements", [], |row| row.get(0))?
                        .unwrap_or(0);
                    let identifier = payload_identifier(&request.payload);
                    let seed = IdSeed {
                        identifier,
                        created_by: &request.created_by,
                        timestamp_ns: time::now_ns(),
                    };
                    ids::generate(&seed, element_count.max(0) as u64, |candidate| {
                        let taken: Option<i64> = db.query_one(
                            "SELECT 1 FROM elements WHERE id = ?1",
                            [candidate],
                            |row| row.get(0),
                        )?;
                        Ok(taken.is_some())
                    })?
                }
            };

            // Documents always start their chain at version 1.
            let payload = match request.payload.clone() {
                Payload::Document(mut doc) => {
                    doc.version = 1;
                    doc.previous_version_id = None;
                    Payload::Document(doc)
                }
                other => other,
            };

            let element = Element {
                id: ElementId::trusted(id.clone()),
                element_type: payload.element_type(),
                created_at: now,
                updated_at: now,
                created_by: request.created_by.clone(),
                tags: tags.clone(),
                metadata: request.metadata.clone(),
                payload,
            };

            insert_element(db, &element)?;
            if let Payload::Document(doc) = &element.payload {
                documents::record_version(db, &id, doc, &request.created_by, &now_iso)?;
            }
            db.mark_dirty(&id)?;
            Ok(element)
        })
    }

    fn update(
        &self,
        id: &str,
        patch: ElementPatch,
        options: &UpdateOptions,
    ) -> Result<(Element, Option<i64>), ElementalError> {
        self.db.transaction(Isolation::Immediate, |db| {
            let Some(mut element) = fetch_element(db, id)? else {
                return Err(
                    ElementalError::not_found(format!("element not found: {id}"))
                        .with_detail("id", json!(id)),
                );
            };
            if element.is_deleted() {
                return Err(ElementalError::validation(format!(
                    "cannot update deleted element: {id}"
                ))
                .with_detail("id", json!(id)));
            }
            if let Some(expected) = options.expected_updated_at {
                if expected != element.updated_at {
                    return Err(ElementalError::new(
                        ErrorKind::Conflict,
                        format!("element {id} was modified concurrently"),
                    )
                    .with_detail("expected", json!(time::to_iso(expected)))
                    .with_detail("actual", json!(time::to_iso(element.updated_at))));
                }
            }

            let mut version_created = None;
            if let Some(payload_patch) = &patch.payload {
                let (payload, created) = apply_payload_patch(&element, payload_patch)?;
                element.payload = payload;
                version_created = created;
            }
            if let Some(tags) = patch.tags {
                element.tags = normalize_tags(tags);
            }
            if let Some(metadata) = patch.metadata {
                element.metadata = metadata;
            }

            model::validate_payload(&element.payload)?;
            check_references(db, &element.payload, Some(id))?;

            // Clock skew must never violate updatedAt >= createdAt.
            element.updated_at = bump_updated_at(&element);
            if let Some(doc) = element.payload.as_document() {
                if version_created.is_some() {
                    documents::record_version(
                        db,
                        id,
                        doc,
                        &options.actor,
                        &time::to_iso(element.updated_at),
                    )?;
                }
            }
            update_element_row(db, &element)?;
            db.mark_dirty(id)?;
            Ok((element, version_created))
        })
    }

    fn delete(&self, id: &str, options: &DeleteOptions) -> Result<ElementType, ElementalError> {
        self.db.transaction(Isolation::Immediate, |db| {
            let Some(mut element) = fetch_element(db, id)? else {
                return Err(
                    ElementalError::not_found(format!("element not found: {id}"))
                        .with_detail("id", json!(id)),
                );
            };
            if element.is_deleted() {
                return Err(ElementalError::validation(format!(
                    "element already deleted: {id}"
                ))
                .with_detail("code", json!("already-deleted"))
                .with_detail("id", json!(id)));
            }

            let now = time::now_utc();
            match &mut element.payload {
                Payload::Task(task) => {
                    task.status = TaskStatus::Tombstone;
                }
                _ => {
                    element.metadata.insert("deleted".to_string(), json!(true));
                    element
                        .metadata
                        .insert("deletedAt".to_string(), json!(time::to_iso(now)));
                    element
                        .metadata
                        .insert("deletedBy".to_string(), json!(options.actor));
                    if let Some(reason) = &options.reason {
                        element
                            .metadata
                            .insert("deleteReason".to_string(), json!(reason));
                    }
                }
            }
            element.updated_at = bump_updated_at(&element);
            update_element_row(db, &element)?;
            db.mark_dirty(id)?;
            Ok(element.element_type)
        })
    }

    fn mutate_members(
        &self,
        id: &str,
        entity_id: &str,
        expected: ElementType,
        add: bool,
    ) -> Result<bool, ElementalError> {
        self.db.transaction(Isolation::Immediate, |db| {
            let Some(mut element) = fetch_element(db, id)? else {
                let kind = match expected {
                    ElementType::Channel => ErrorKind::ChannelNotFound,
                    _ => ErrorKind::NotFound,
                };
                return Err(ElementalError::new(
                    kind,
                    format!("{expected} not found: {id}"),
                )
                .with_detail("id", json!(id)));
            };
            if element.is_deleted() {
                return Err(ElementalError::validation(format!(
                    "{expected} is deleted: {id}"
                )));
            }
            if element.element_type != expected {
                return Err(ElementalError::validation(format!(
                    "{id} is a {}, expected a {expected}",
                    element.element_type
                ))
                .with_detail("id", json!(id))
                .with_detail("type", json!(element.element_type.as_str())));
            }

            let members = match &mut element.payload {
                Payload::Team(team) => &mut team.members,
                Payload::Channel(channel) => &mut channel.members,
                _ => unreachable!("member mutation only reaches teams and channels"),
            };
            let present = members.iter().any(|m| m == entity_id);
            let changed = if add && !present {
                members.push(entity_id.to_string());
                members.sort();
                true
            } else if !add && present {
                members.retain(|m| m != entity_id);
                true
            } else {
                false
            };
            if !changed {
                return Ok(false);
            }

            element.updated_at = bump_updated_at(&element);
            update_element_row(db, &element)?;
            db.mark_dirty(id)?;
            Ok(true)
        })
    }

    fn burn_workflow(&self, workflow_id: &str) -> Result<BurnReport, ElementalError> {
        self.db.transaction(Isolation::Immediate, |db| {
            let Some(element) = fetch_element(db, workflow_id)? else {
                return Err(ElementalError::not_found(format!(
                    "workflow not found: {workflow_id}"
                ))
                .with_detail("id", json!(workflow_id)));
            };
            let Some(workflow) = element.payload.as_workflow() else {
                return Err(ElementalError::validation(format!(
                    "{workflow_id} is not a workflow"
                ))
                .with_detail("type", json!(element.element_type.as_str())));
            };
            let was_ephemeral = workflow.ephemeral;

            // Transitive parent-child descendants of the workflow.
            let mut burn_set = vec![workflow_id.to_string()];
            let mut frontier = vec![workflow_id.to_string()];
            while let Some(parent) = frontier.pop() {
                let children: Vec<String> = db.query(
                    "SELECT source_id FROM dependencies WHERE target_id = ?1 AND type = 'parent-child'",
                    [parent.as_str()],
                    |row| row.get(0),
                )?;
                for child in children {
                    if !burn_set.contains(&child) {
                        burn_set.push(child.clone());
                        frontier.push(child);
                    }
                }
            }

            let mut dependencies_deleted = 0;
            let mut elements_deleted = 0;
            for id in &burn_set {
                dependencies_deleted += db
                    .run(
                        "DELETE FROM dependencies WHERE source_id = ?1 OR target_id = ?1",
                        [id.as_str()],
                    )?
                    .changes;
            }
            for id in &burn_set {
                db.run("DELETE FROM document_versions WHERE document_id = ?1", [id.as_str()])?;
                db.run("DELETE FROM child_counters WHERE parent_id = ?1", [id.as_str()])?;
                elements_deleted += db
                    .run("DELETE FROM elements WHERE id = ?1", [id.as_str()])?
                    .changes;
                db.mark_dirty(id)?;
            }

            Ok(BurnReport {
                workflow_id: workflow_id.to_string(),
                was_ephemeral,
                tasks_deleted: elements_deleted.saturating_sub(1),
                dependencies_deleted,
            })
        })
    }

    /// Ephemeral workflows in a terminal status whose `finishedAt` is older
    /// than the cutoff.
    fn gc_candidates(&self, max_age_ms: i64) -> Result<Vec<String>, ElementalError> {
        let cutoff = Utc::now() - Duration::milliseconds(max_age_ms.max(0));
        let rows: Vec<(String, String)> = self.db.query(
            "SELECT id, payload FROM elements
             WHERE type = 'workflow'
               AND COALESCE(json_extract(payload, '$.ephemeral'), 0) IN (1)
               AND json_extract(payload, '$.status') IN ('completed', 'failed', 'cancelled')
             ORDER BY id",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut out = Vec::new();
        for (id, payload) in rows {
            let finished_at = serde_json::from_str::<Value>(&payload)
                .ok()
                .and_then(|p| {
                    p.get("finishedAt")
                        .and_then(Value::as_str)
                        .and_then(time::parse_iso)
                });
            if let Some(finished) = finished_at {
                if finished < cutoff {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    fn rollback_document(
        &self,
        document_id: &str,
        version: i64,
        actor: &str,
    ) -> Result<Element, ElementalError> {
        self.db.transaction(Isolation::Immediate, |db| {
            let Some(mut element) = fetch_element(db, document_id)? else {
                return Err(ElementalError::new(
                    ErrorKind::DocumentNotFound,
                    format!("document not found: {document_id}"),
                )
                .with_detail("id", json!(document_id)));
            };
            let Some(current) = element.payload.as_document().cloned() else {
                return Err(ElementalError::validation(format!(
                    "{document_id} is not a document"
                )));
            };
            if element.is_deleted() {
                return Err(ElementalError::validation(format!(
                    "cannot roll back deleted document: {document_id}"
                )));
            }

            let next = documents::rollback_payload(db, document_id, &current, version)?;
            element.updated_at = bump_updated_at(&element);
            documents::record_version(
                db,
                document_id,
                &next,
                actor,
                &time::to_iso(element.updated_at),
            )?;
            element.payload = Payload::Document(next);
            update_element_row(db, &element)?;
            db.mark_dirty(document_id)?;
            Ok(element)
        })
    }
}

// --- Shared row plumbing (also used by the query layer) ---

const ELEMENT_COLUMNS: &str =
    "id, type, created_at, updated_at, created_by, tags, metadata, payload";

type RawElement = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

pub(crate) fn read_element_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawElement> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

pub(crate) fn parse_element_row(raw: RawElement) -> Result<Element, ElementalError> {
    let (id, element_type, created_at, updated_at, created_by, tags, metadata, payload) = raw;
    let corrupt = |what: &str| {
        ElementalError::database(format!("corrupt element row {id}: bad {what}"))
    };
    let element_type: ElementType = element_type.parse().map_err(|_| corrupt("type"))?;
    Ok(Element {
        created_at: time::parse_iso(&created_at).ok_or_else(|| corrupt("created_at"))?,
        updated_at: time::parse_iso(&updated_at).ok_or_else(|| corrupt("updated_at"))?,
        tags: serde_json::from_str(&tags).map_err(|_| corrupt("tags"))?,
        metadata: serde_json::from_str::<Value>(&metadata)
            .map_err(|_| corrupt("metadata"))?
            .as_object()
            .cloned()
            .unwrap_or_default(),
        payload: Payload::from_json(
            element_type,
            serde_json::from_str(&payload).map_err(|_| corrupt("payload"))?,
        )?,
        id: ElementId::trusted(id),
        element_type,
        created_by,
    })
}

pub(crate) fn fetch_element(
    db: &Database,
    id: &str,
) -> Result<Option<Element>, ElementalError> {
    let raw = db.query_one(
        &format!("SELECT {ELEMENT_COLUMNS} FROM elements WHERE id = ?1"),
        [id],
        read_element_row,
    )?;
    raw.map(parse_element_row).transpose()
}

pub(crate) fn insert_element(db: &Database, element: &Element) -> Result<(), ElementalError> {
    let result = db.run(
        "INSERT INTO elements(id, type, created_at, updated_at, created_by, tags, metadata, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            element.id.as_str(),
            element.element_type.as_str(),
            time::to_iso(element.created_at),
            time::to_iso(element.updated_at),
            element.created_by,
            serde_json::to_string(&element.tags).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&Value::Object(element.metadata.clone()))
                .unwrap_or_else(|_| "{}".to_string()),
            element.payload.to_json().to_string(),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(err) => {
            if let Some(cause) = err
                .cause
                .as_ref()
                .and_then(|c| c.downcast_ref::<rusqlite::Error>())
            {
                if error::is_unique_violation(cause) {
                    let target = error::unique_violation_target(cause)
                        .unwrap_or_else(|| "elements.id".to_string());
                    return Err(ElementalError::new(
                        ErrorKind::AlreadyExists,
                        format!("element already exists: {}", element.id),
                    )
                    .with_detail("id", json!(element.id.as_str()))
                    .with_detail("constraint", json!(target)));
                }
            }
            Err(err)
        }
    }
}

fn update_element_row(db: &Database, element: &Element) -> Result<(), ElementalError> {
    db.run(
        "UPDATE elements SET updated_at = ?2, tags = ?3, metadata = ?4, payload = ?5 WHERE id = ?1",
        params![
            element.id.as_str(),
            time::to_iso(element.updated_at),
            serde_json::to_string(&element.tags).unwrap_or_else(|_| "[]".to_string()),
            serde_json::to_string(&Value::Object(element.metadata.clone()))
                .unwrap_or_else(|_| "{}".to_string()),
            element.payload.to_json().to_string(),
        ],
    )?;
    Ok(())
}

/// SQL predicate excluding soft-deleted rows.
pub(crate) const NOT_DELETED: &str = "(COALESCE(status, '') != 'tombstone' \
     AND COALESCE(json_extract(metadata, '$.deleted'), 0) NOT IN (1))";

/// SQL predicate excluding ephemeral-flagged rows.
pub(crate) const NOT_EPHEMERAL: &str =
    "COALESCE(json_extract(payload, '$.ephemeral'), 0) NOT IN (1)";

pub(crate) fn filter_conditions(
    filter: &ElementFilter,
) -> (Vec<String>, Vec<rusqlite::types::Value>) {
    let mut conditions = Vec::new();
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(element_type) = filter.element_type {
        conditions.push("type = ?".to_string());
        params.push(element_type.as_str().to_string().into());
    }
    if let Some(status) = &filter.status {
        conditions.push("status = ?".to_string());
        params.push(status.clone().into());
    }
    if let Some(assignee) = &filter.assignee {
        conditions.push("assignee = ?".to_string());
        params.push(assignee.clone().into());
    }
    if let Some(priority) = filter.priority {
        conditions.push("CAST(json_extract(payload, '$.priority') AS INTEGER) = ?".to_string());
        params.push(i64::from(priority).into());
    }
    if let Some(task_type) = filter.task_type {
        conditions.push("json_extract(payload, '$.taskType') = ?".to_string());
        params.push(task_type.as_str().to_string().into());
    }
    if let Some(tag) = &filter.tag {
        conditions.push(
            "EXISTS (SELECT 1 FROM json_each(elements.tags) WHERE json_each.value = ?)"
                .to_string(),
        );
        params.push(tag.clone().into());
    }
    if !filter.include_deleted {
        conditions.push(NOT_DELETED.to_string());
    }
    if !filter.include_ephemeral {
        conditions.push(NOT_EPHEMERAL.to_string());
    }
    (conditions, params)
}

pub(crate) fn select_elements(
    db: &Database,
    filter: &ElementFilter,
) -> Result<Vec<Element>, ElementalError> {
    let (conditions, params) = filter_conditions(filter);
    let mut sql = format!("SELECT {ELEMENT_COLUMNS} FROM elements");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    // Tasks list in scheduling order; everything else newest-first.
    if filter.element_type == Some(ElementType::Task) {
        sql.push_str(
            " ORDER BY CAST(json_extract(payload, '$.priority') AS INTEGER) ASC, created_at ASC, id ASC",
        );
    } else {
        sql.push_str(" ORDER BY created_at DESC, id ASC");
    }
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    } else if let Some(offset) = filter.offset {
        sql.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
    }

    let raw = db.query(&sql, rusqlite::params_from_iter(params), read_element_row)?;
    raw.into_iter().map(parse_element_row).collect()
}

pub(crate) fn count_elements(
    db: &Database,
    filter: &ElementFilter,
) -> Result<i64, ElementalError> {
    let (conditions, params) = filter_conditions(filter);
    let mut sql = "SELECT COUNT(*) FROM elements".to_string();
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    Ok(db
        .query_one(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?
        .unwrap_or(0))
}

/// Next `updatedAt` stamp for an element: the current instant, bumped by a
/// microsecond if the clock has not advanced past the stored stamp. Keeps
/// optimistic-concurrency comparisons exact even for back-to-back writes.
fn bump_updated_at(element: &Element) -> DateTime<Utc> {
    let now = time::now_utc();
    if now > element.updated_at {
        now
    } else {
        element.updated_at + Duration::microseconds(1)
    }
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// The human identifier hashed into a generated ID.
fn payload_identifier(payload: &Payload) -> &str {
    match payload {
        Payload::Task(p) => &p.title,
        Payload::Workflow(p) => &p.title,
        Payload::Document(p) => &p.content,
        Payload::Entity(p) => &p.name,
        Payload::Channel(p) => &p.name,
        Payload::Message(p) => p.content_ref.as_str(),
        Payload::Team(p) => &p.name,
        Payload::Library(p) => &p.name,
        Payload::Playbook(p) => &p.name,
    }
}

/// Referential checks that hold at create and update time. `own_id` is the
/// element being written, so it never clashes with itself.
fn check_references(
    db: &Database,
    payload: &Payload,
    own_id: Option<&str>,
) -> Result<(), ElementalError> {
    match payload {
        Payload::Entity(entity) => {
            let clash: Option<String> = db.query_one(
                &format!(
                    "SELECT id FROM elements WHERE type = 'entity'
                       AND json_extract(payload, '$.name') = ?1 AND {NOT_DELETED}"
                ),
                [entity.name.as_str()],
                |row| row.get(0),
            )?;
            if let Some(existing) = clash {
                if own_id != Some(existing.as_str()) {
                    return Err(ElementalError::new(
                        ErrorKind::AlreadyExists,
                        format!("entity name already taken: {}", entity.name),
                    )
                    .with_detail("name", json!(entity.name))
                    .with_detail("existingId", json!(existing)));
                }
            }
            Ok(())
        }
        Payload::Message(message) => {
            let channel = fetch_element(db, message.channel_id.as_str())?;
            match channel {
                Some(c) if c.element_type == ElementType::Channel && !c.is_deleted() => {}
                _ => {
                    return Err(ElementalError::new(
                        ErrorKind::ChannelNotFound,
                        format!("channel not found: {}", message.channel_id),
                    )
                    .with_detail("channelId", json!(message.channel_id.as_str())));
                }
            }
            require_document_ref(db, message.content_ref.as_str())?;
            if let Some(thread_id) = &message.thread_id {
                let thread = fetch_element(db, thread_id.as_str())?;
                let same_channel = thread.as_ref().is_some_and(|t| {
                    t.payload
                        .as_message()
                        .is_some_and(|m| m.channel_id == message.channel_id)
                });
                if !same_channel {
                    return Err(ElementalError::validation(format!(
                        "threadId must reference a message in the same channel: {thread_id}"
                    ))
                    .with_detail("threadId", json!(thread_id.as_str())));
                }
            }
            Ok(())
        }
        Payload::Task(task) => {
            if let Some(doc) = &task.description_ref {
                require_document_ref(db, doc.as_str())?;
            }
            Ok(())
        }
        Payload::Library(library) => {
            if let Some(doc) = &library.description_ref {
                require_document_ref(db, doc.as_str())?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn require_document_ref(db: &Database, id: &str) -> Result<(), ElementalError> {
    let referent: Option<String> =
        db.query_one("SELECT type FROM elements WHERE id = ?1", [id], |row| {
            row.get(0)
        })?;
    match referent.as_deref() {
        Some("document") => Ok(()),
        _ => Err(ElementalError::new(
            ErrorKind::DocumentNotFound,
            format!("referenced document not found: {id}"),
        )
        .with_detail("documentId", json!(id))),
    }
}

/// Current content of the document a task or message references.
fn hydrate_content(db: &Database, element: &Element) -> Result<Option<String>, ElementalError> {
    let doc_id = match &element.payload {
        Payload::Task(task) => task.description_ref.as_ref(),
        Payload::Message(message) => Some(&message.content_ref),
        _ => None,
    };
    let Some(doc_id) = doc_id else {
        return Ok(None);
    };
    let Some(doc) = fetch_element(db, doc_id.as_str())? else {
        return Ok(None);
    };
    // Deleted referents resolve to nothing, not to stale content.
    if doc.is_deleted() {
        return Ok(None);
    }
    Ok(doc.payload.as_document().map(|d| d.content.clone()))
}

/// Merge a shallow payload patch onto an element, routing document content
/// changes through the version chain and enforcing the task status machine.
fn apply_payload_patch(
    element: &Element,
    patch: &Map<String, Value>,
) -> Result<(Payload, Option<i64>), ElementalError> {
    if element.element_type == ElementType::Message {
        return Err(ElementalError::new(
            ErrorKind::Immutable,
            format!("messages are immutable after create: {}", element.id),
        )
        .with_detail("id", json!(element.id.as_str())));
    }

    if element.element_type == ElementType::Document {
        for forbidden in ["version", "previousVersionId"] {
            if patch.contains_key(forbidden) {
                return Err(ElementalError::new(
                    ErrorKind::Immutable,
                    format!("document field {forbidden} is maintained by the version chain"),
                )
                .with_detail("field", json!(forbidden)));
            }
        }
        let current = element
            .payload
            .as_document()
            .expect("document element carries document payload");
        if patch.contains_key("content") || patch.contains_key("contentType") {
            let content = match patch.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => {
                    return Err(ElementalError::validation(format!(
                        "content must be a string, got {other}"
                    )))
                }
                None => current.content.clone(),
            };
            let content_type = match patch.get("contentType") {
                Some(Value::String(s)) => Some(s.parse()?),
                Some(other) => {
                    return Err(ElementalError::new(
                        ErrorKind::InvalidContentType,
                        format!("contentType must be a string, got {other}"),
                    ))
                }
                None => None,
            };
            let next =
                documents::next_version(element.id.as_str(), current, content, content_type)?;
            let version = next.version;
            return Ok((Payload::Document(next), Some(version)));
        }
        return Ok((element.payload.clone(), None));
    }

    // Shallow merge over the serialized payload, then re-type.
    let mut merged = element
        .payload
        .to_json()
        .as_object()
        .cloned()
        .unwrap_or_default();
    for (key, value) in patch {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    let next = Payload::from_json(element.element_type, Value::Object(merged))?;

    match (&element.payload, &next) {
        (Payload::Task(old), Payload::Task(_)) => {
            let mut task = match next {
                Payload::Task(t) => t,
                _ => unreachable!(),
            };
            if task.status != old.status {
                if task.status == TaskStatus::Tombstone {
                    return Err(ElementalError::validation(
                        "tasks are tombstoned through delete, not status updates",
                    ));
                }
                if !TaskStatus::can_transition(old.status, task.status) {
                    return Err(ElementalError::new(
                        ErrorKind::InvalidStatus,
                        format!(
                            "invalid task transition {} -> {}",
                            old.status, task.status
                        ),
                    )
                    .with_detail("from", json!(old.status.as_str()))
                    .with_detail("to", json!(task.status.as_str())));
                }
                if task.status == TaskStatus::Closed {
                    task.closed_at = Some(time::now_utc());
                } else if old.status == TaskStatus::Closed {
                    task.closed_at = None;
                    task.close_reason = None;
                }
            }
            Ok((Payload::Task(task), None))
        }
        (Payload::Workflow(old), Payload::Workflow(_)) => {
            let mut workflow = match next {
                Payload::Workflow(w) => w,
                _ => unreachable!(),
            };
            if workflow.status != old.status
                && workflow.status.is_terminal()
                && workflow.finished_at.is_none()
            {
                workflow.finished_at = Some(time::now_utc());
            }
            if workflow.status != old.status && !workflow.status.is_terminal() {
                workflow.finished_at = None;
            }
            Ok((Payload::Workflow(workflow), None))
        }
        _ => Ok((next, None)),
    }
}

/// Convenience constructors shared by the CLI and tests.
impl Store {
    /// Create a task with defaults, returning its element.
    pub fn create_task(
        &self,
        title: &str,
        created_by: &str,
    ) -> Result<Element, ElementalError> {
        self.create(NewElement::new(
            created_by,
            Payload::Task(model::TaskPayload {
                title: title.to_string(),
                status: TaskStatus::Open,
                priority: 3,
                complexity: 3,
                task_type: model::TaskType::Task,
                assignee: None,
                scheduled_for: None,
                close_reason: None,
                description_ref: None,
                closed_at: None,
            }),
        ))
    }

    /// Create a workflow shell with defaults.
    pub fn create_workflow(
        &self,
        title: &str,
        created_by: &str,
        ephemeral: bool,
    ) -> Result<Element, ElementalError> {
        self.create(NewElement::new(
            created_by,
            Payload::Workflow(model::WorkflowPayload {
                title: title.to_string(),
                status: WorkflowStatus::Pending,
                ephemeral,
                variables: Map::new(),
                finished_at: None,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DocumentPayload, TaskPayload, TaskType};
    use std::sync::atomic::AtomicUsize;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn task_payload(title: &str) -> Payload {
        Payload::Task(TaskPayload {
            title: title.to_string(),
            status: TaskStatus::Open,
            priority: 3,
            complexity: 3,
            task_type: TaskType::Task,
            assignee: None,
            scheduled_for: None,
            close_reason: None,
            description_ref: None,
            closed_at: None,
        })
    }

    fn doc_payload(content: &str) -> Payload {
        Payload::Document(DocumentPayload {
            content_type: model::ContentType::Text,
            content: content.to_string(),
            version: 1,
            previous_version_id: None,
        })
    }

    #[test]
    fn test_create_get_round_trip() {
        let store = store();
        let created = store
            .create(
                NewElement::new("el-sys", task_payload("Review the graph layer"))
                    .with_tags(vec!["graph".to_string(), "review".to_string(), "graph".to_string()]),
            )
            .unwrap();
        assert!(created.id.as_str().starts_with("el-"));
        assert_eq!(created.tags, vec!["graph".to_string(), "review".to_string()]);
        assert_eq!(created.created_at, created.updated_at);

        let fetched = store.get(created.id.as_str()).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.payload.as_task().unwrap().title, "Review the graph layer");
    }

    #[test]
    fn test_explicit_duplicate_id_fails() {
        let store = store();
        store
            .create(NewElement::new("el-sys", task_payload("a")).with_id("el-fixed"))
            .unwrap();
        let err = store
            .create(NewElement::new("el-sys", task_payload("b")).with_id("el-fixed"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_update_replaces_tags_and_merges_payload() {
        let store = store();
        let created = store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
        let mut patch_payload = Map::new();
        patch_payload.insert("priority".to_string(), json!(1));
        let updated = store
            .update(
                created.id.as_str(),
                ElementPatch {
                    tags: Some(vec!["urgent".to_string()]),
                    metadata: None,
                    payload: Some(patch_payload),
                },
                UpdateOptions {
                    actor: "el-sys".to_string(),
                    expected_updated_at: None,
                },
            )
            .unwrap();
        assert_eq!(updated.tags, vec!["urgent".to_string()]);
        let task = updated.payload.as_task().unwrap();
        assert_eq!(task.priority, 1);
        assert_eq!(task.title, "t");
        assert!(updated.updated_at >= updated.created_at);
    }

    #[test]
    fn test_optimistic_concurrency_conflict() {
        let store = store();
        let created = store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
        let stale = created.updated_at;

        let mut patch = Map::new();
        patch.insert("priority".to_string(), json!(2));
        let current = store
            .update(
                created.id.as_str(),
                ElementPatch {
                    payload: Some(patch.clone()),
                    ..Default::default()
                },
                UpdateOptions {
                    actor: "writer-b".to_string(),
                    expected_updated_at: None,
                },
            )
            .unwrap();

        let err = store
            .update(
                created.id.as_str(),
                ElementPatch {
                    payload: Some(patch.clone()),
                    ..Default::default()
                },
                UpdateOptions {
                    actor: "writer-a".to_string(),
                    expected_updated_at: Some(stale),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        store
            .update(
                created.id.as_str(),
                ElementPatch {
                    payload: Some(patch),
                    ..Default::default()
                },
                UpdateOptions {
                    actor: "writer-a".to_string(),
                    expected_updated_at: Some(current.updated_at),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_invalid_status_transition_rejected() {
        let store = store();
        let created = store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
        let mut patch = Map::new();
        patch.insert("status".to_string(), json!("backlog"));
        let err = store
            .update(
                created.id.as_str(),
                ElementPatch {
                    payload: Some(patch),
                    ..Default::default()
                },
                UpdateOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidStatus);
    }

    #[test]
    fn test_close_sets_closed_at_and_reopen_clears() {
        let store = store();
        let created = store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
        let mut close = Map::new();
        close.insert("status".to_string(), json!("closed"));
        close.insert("closeReason".to_string(), json!("done"));
        let closed = store
            .update(
                created.id.as_str(),
                ElementPatch { payload: Some(close), ..Default::default() },
                UpdateOptions::default(),
            )
            .unwrap();
        let task = closed.payload.as_task().unwrap();
        assert!(task.closed_at.is_some());
        assert_eq!(task.close_reason.as_deref(), Some("done"));

        let mut reopen = Map::new();
        reopen.insert("status".to_string(), json!("open"));
        let reopened = store
            .update(
                created.id.as_str(),
                ElementPatch { payload: Some(reopen), ..Default::default() },
                UpdateOptions::default(),
            )
            .unwrap();
        let task = reopened.payload.as_task().unwrap();
        assert!(task.closed_at.is_none());
        assert!(task.close_reason.is_none());
    }

    #[test]
    fn test_soft_delete_and_already_deleted() {
        let store = store();
        let created = store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
        store
            .delete(
                created.id.as_str(),
                DeleteOptions { actor: "el-sys".to_string(), reason: None },
            )
            .unwrap();

        assert!(store.get(created.id.as_str()).unwrap().is_none());
        let view = store
            .get_with(
                created.id.as_str(),
                &GetOptions { include_deleted: true, hydrate_content: false },
            )
            .unwrap()
            .unwrap();
        assert_eq!(
            view.element.payload.as_task().unwrap().status,
            TaskStatus::Tombstone
        );

        let err = store
            .delete(
                created.id.as_str(),
                DeleteOptions { actor: "el-sys".to_string(), reason: None },
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.details["code"], "already-deleted");
    }

    #[test]
    fn test_non_task_delete_sets_metadata() {
        let store = store();
        let doc = store.create(NewElement::new("el-sys", doc_payload("body"))).unwrap();
        store
            .delete(
                doc.id.as_str(),
                DeleteOptions {
                    actor: "el-ada".to_string(),
                    reason: Some("superseded".to_string()),
                },
            )
            .unwrap();
        let view = store
            .get_with(
                doc.id.as_str(),
                &GetOptions { include_deleted: true, hydrate_content: false },
            )
            .unwrap()
            .unwrap();
        assert_eq!(view.element.metadata["deleted"], json!(true));
        assert_eq!(view.element.metadata["deletedBy"], json!("el-ada"));
        assert_eq!(view.element.metadata["deleteReason"], json!("superseded"));
        assert!(view.element.metadata.contains_key("deletedAt"));
    }

    #[test]
    fn test_entity_name_uniqueness() {
        let store = store();
        let entity = Payload::Entity(model::EntityPayload {
            name: "ada".to_string(),
            entity_type: model::EntityType::Agent,
            public_key: None,
        });
        store.create(NewElement::new("el-sys", entity.clone())).unwrap();
        let err = store.create(NewElement::new("el-sys", entity)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_message_requires_channel_and_document() {
        let store = store();
        let doc = store.create(NewElement::new("el-sys", doc_payload("hi"))).unwrap();
        let message = Payload::Message(model::MessagePayload {
            channel_id: ElementId::trusted("el-nochan"),
            sender: "el-ada".to_string(),
            content_ref: doc.id.clone(),
            thread_id: None,
        });
        let err = store.create(NewElement::new("el-ada", message)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChannelNotFound);

        let channel = store
            .create(NewElement::new(
                "el-sys",
                Payload::Channel(model::ChannelPayload {
                    name: "general".to_string(),
                    members: vec![],
                    visibility: model::ChannelVisibility::Public,
                }),
            ))
            .unwrap();
        let message = store
            .create(NewElement::new(
                "el-ada",
                Payload::Message(model::MessagePayload {
                    channel_id: channel.id.clone(),
                    sender: "el-ada".to_string(),
                    content_ref: doc.id.clone(),
                    thread_id: None,
                }),
            ))
            .unwrap();

        // Messages are immutable.
        let mut patch = Map::new();
        patch.insert("sender".to_string(), json!("el-eve"));
        let err = store
            .update(
                message.id.as_str(),
                ElementPatch { payload: Some(patch), ..Default::default() },
                UpdateOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Immutable);

        // Hydration pulls the referenced document content.
        let view = store
            .get_with(
                message.id.as_str(),
                &GetOptions { include_deleted: false, hydrate_content: true },
            )
            .unwrap()
            .unwrap();
        assert_eq!(view.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_member_mutations_are_idempotent() {
        let store = store();
        let team = store
            .create(NewElement::new(
                "el-sys",
                Payload::Team(model::TeamPayload { name: "core".to_string(), members: vec![] }),
            ))
            .unwrap();
        assert!(store.add_team_member(team.id.as_str(), "el-ada", "el-sys").unwrap());
        assert!(!store.add_team_member(team.id.as_str(), "el-ada", "el-sys").unwrap());
        assert!(store.remove_team_member(team.id.as_str(), "el-ada", "el-sys").unwrap());
        assert!(!store.remove_team_member(team.id.as_str(), "el-ada", "el-sys").unwrap());

        let err = store
            .add_channel_member(team.id.as_str(), "el-ada", "el-sys")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_events_fire_in_commit_order() {
        let store = store();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            store
                .subscribe(move |event| events.lock().unwrap().push(event.name().to_string()))
                .unwrap();
        }
        let task = store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
        store
            .delete(task.id.as_str(), DeleteOptions { actor: "el-sys".to_string(), reason: None })
            .unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["element.created".to_string(), "element.deleted".to_string()]
        );
    }

    #[test]
    fn test_failed_mutation_emits_nothing() {
        let store = store();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            store
                .subscribe(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let err = store
            .create(NewElement::new("el-sys", task_payload("")))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingRequiredField);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_token_blocks_dispatch() {
        let store = store();
        let token = CancelToken::new();
        store.set_cancel_token(Some(token.clone())).unwrap();
        token.cancel();
        let err = store
            .create(NewElement::new("el-sys", task_payload("t")))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.details["code"], "CANCELLED");
        store.set_cancel_token(None).unwrap();
        store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
    }

    #[test]
    fn test_list_filters_and_order() {
        let store = store();
        let mut low = task_payload("low priority");
        if let Payload::Task(t) = &mut low {
            t.priority = 4;
        }
        let mut high = task_payload("high priority");
        if let Payload::Task(t) = &mut high {
            t.priority = 1;
            t.assignee = Some("el-ada".to_string());
        }
        store.create(NewElement::new("el-sys", low)).unwrap();
        store.create(NewElement::new("el-sys", high)).unwrap();
        store
            .create(NewElement::new("el-sys", doc_payload("not a task")))
            .unwrap();

        let tasks = store
            .list(&ElementFilter {
                element_type: Some(ElementType::Task),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].payload.as_task().unwrap().priority, 1);

        let assigned = store
            .list(&ElementFilter {
                element_type: Some(ElementType::Task),
                assignee: Some("el-ada".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(assigned.len(), 1);

        let page = store
            .list_paginated(&ElementFilter {
                element_type: Some(ElementType::Task),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn test_dirty_marks_accumulate() {
        let store = store();
        let task = store.create(NewElement::new("el-sys", task_payload("t"))).unwrap();
        let mut patch = Map::new();
        patch.insert("priority".to_string(), json!(1));
        store
            .update(
                task.id.as_str(),
                ElementPatch { payload: Some(patch), ..Default::default() },
                UpdateOptions::default(),
            )
            .unwrap();
        let dirty = store.get_dirty().unwrap();
        assert_eq!(dirty, vec![task.id.as_str().to_string()]);
        store.clear_all_dirty().unwrap();
        assert!(store.get_dirty().unwrap().is_empty());
    }
}
