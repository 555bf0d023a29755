//! Readiness, blocking, and workload queries.
//!
//! A task is derived-blocked when it has a live blocker over a `blocks`
//! edge, an unfinished parent over a `parent-child` edge, or a
//! `scheduledFor` instant in the future. `ready` and `blocked` partition
//! the active tasks: no task appears in both, and an active task with no
//! future schedule appears in exactly one.

use crate::core::db::Database;
use crate::core::error::ElementalError;
#[cfg(test)]
use crate::core::error::ErrorKind;
use crate::core::model::{Element, ElementFilter, ElementType, TaskStatus, TaskType};
use crate::core::store::{fetch_element, select_elements};
use crate::core::time;
use chrono::Utc;
use rustc_hash::FxHashSet;
use serde_json::json;
use std::collections::BTreeMap;

/// Filter for the readiness queries.
#[derive(Debug, Clone, Default)]
pub struct ReadyFilter {
    pub assignee: Option<String>,
    pub priority: Option<u8>,
    pub task_type: Option<TaskType>,
    pub limit: Option<usize>,
    pub include_ephemeral: bool,
}

/// One blocked task with its deterministic representative blocker.
#[derive(Debug, Clone)]
pub struct BlockedTask {
    pub task: Element,
    pub blocked_by: Option<String>,
    pub block_reason: BlockReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    BlockedByTask,
    ParentIncomplete,
    ScheduledFuture,
    StatusBlocked,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockedByTask => "blocked-by-task",
            Self::ParentIncomplete => "parent-incomplete",
            Self::ScheduledFuture => "scheduled-future",
            Self::StatusBlocked => "status-blocked",
        }
    }
}

/// Aggregate progress for one workflow.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowProgress {
    pub workflow_id: String,
    pub total_tasks: i64,
    pub completion_percentage: i64,
    pub ready_tasks: i64,
    pub blocked_tasks: i64,
    pub status_counts: BTreeMap<String, i64>,
}

/// Open work assigned to one entity.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentWorkload {
    pub total_tasks: i64,
    pub by_status: BTreeMap<String, i64>,
}

fn ready_candidates_filter(filter: &ReadyFilter) -> ElementFilter {
    ElementFilter {
        element_type: Some(ElementType::Task),
        status: None,
        assignee: filter.assignee.clone(),
        priority: filter.priority,
        task_type: filter.task_type,
        tag: None,
        limit: None,
        offset: None,
        include_deleted: false,
        include_ephemeral: true,
    }
}

/// Tasks that can be picked up right now: active status, not derived-blocked,
/// not scheduled into the future, and (by default) not owned by an ephemeral
/// workflow. Sorted by priority, then age.
pub fn ready(db: &Database, filter: &ReadyFilter) -> Result<Vec<Element>, ElementalError> {
    let candidates = select_elements(db, &ready_candidates_filter(filter))?;
    let now = Utc::now();
    let mut out = Vec::new();
    for element in candidates {
        let Some(task) = element.payload.as_task() else {
            continue;
        };
        if !task.status.is_active() {
            continue;
        }
        if task.scheduled_for.is_some_and(|at| at > now) {
            continue;
        }
        if derived_blocker(db, &element)?.is_some() {
            continue;
        }
        if !filter.include_ephemeral && under_ephemeral_workflow(db, element.id.as_str())? {
            continue;
        }
        out.push(element);
        if filter.limit.is_some_and(|limit| out.len() >= limit) {
            break;
        }
    }
    Ok(out)
}

/// Tasks meeting the derived-blocked condition (or explicitly parked in the
/// `blocked` status), each with one representative blocker.
pub fn blocked(db: &Database, filter: &ReadyFilter) -> Result<Vec<BlockedTask>, ElementalError> {
    let candidates = select_elements(db, &ready_candidates_filter(filter))?;
    let mut out = Vec::new();
    for element in candidates {
        let Some(task) = element.payload.as_task() else {
            continue;
        };
        if !matches!(
            task.status,
            TaskStatus::Open | TaskStatus::InProgress | TaskStatus::Blocked
        ) {
            continue;
        }
        if !filter.include_ephemeral && under_ephemeral_workflow(db, element.id.as_str())? {
            continue;
        }
        let explicitly_blocked = task.status == TaskStatus::Blocked;
        let entry = match derived_blocker(db, &element)? {
            Some((blocker, reason)) => BlockedTask {
                task: element,
                blocked_by: blocker,
                block_reason: reason,
            },
            None if explicitly_blocked => BlockedTask {
                task: element,
                blocked_by: None,
                block_reason: BlockReason::StatusBlocked,
            },
            None => continue,
        };
        out.push(entry);
        if filter.limit.is_some_and(|limit| out.len() >= limit) {
            break;
        }
    }
    Ok(out)
}

/// Tasks waiting in the backlog status.
pub fn backlog(db: &Database, filter: &ReadyFilter) -> Result<Vec<Element>, ElementalError> {
    let mut element_filter = ready_candidates_filter(filter);
    element_filter.status = Some("backlog".to_string());
    element_filter.limit = filter.limit;
    element_filter.include_ephemeral = filter.include_ephemeral;
    select_elements(db, &element_filter)
}

/// The edge-derived blocker for a task, if any, chosen deterministically:
/// the smallest blocker ID in lexicographic order, `blocks` edges
/// considered before parents on ties.
fn derived_blocker(
    db: &Database,
    element: &Element,
) -> Result<Option<(Option<String>, BlockReason)>, ElementalError> {
    let id = element.id.as_str();
    let mut blockers: Vec<(String, BlockReason)> = Vec::new();

    let blocks: Vec<(String, Option<String>, String, String)> = db.query(
        "SELECT e.id, e.status, e.metadata, e.type
         FROM dependencies d JOIN elements e ON e.id = d.target_id
         WHERE d.source_id = ?1 AND d.type = 'blocks'
         ORDER BY e.id",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;
    for (blocker_id, status, metadata, _type) in blocks {
        if is_live_blocker(status.as_deref(), &metadata) {
            blockers.push((blocker_id, BlockReason::BlockedByTask));
        }
    }

    let parents: Vec<(String, Option<String>, String, String)> = db.query(
        "SELECT e.id, e.status, e.metadata, e.type
         FROM dependencies d JOIN elements e ON e.id = d.target_id
         WHERE d.source_id = ?1 AND d.type = 'parent-child'
         ORDER BY e.id",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;
    for (parent_id, status, metadata, element_type) in parents {
        if is_unfinished_parent(status.as_deref(), &metadata, &element_type) {
            blockers.push((parent_id, BlockReason::ParentIncomplete));
        }
    }

    blockers.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));
    if let Some((blocker, reason)) = blockers.into_iter().next() {
        return Ok(Some((Some(blocker), reason)));
    }

    if element
        .payload
        .as_task()
        .and_then(|t| t.scheduled_for)
        .is_some_and(|at| at > Utc::now())
    {
        return Ok(Some((None, BlockReason::ScheduledFuture)));
    }
    Ok(None)
}

fn metadata_deleted(metadata: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(metadata)
        .ok()
        .and_then(|m| m.get("deleted").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

/// A blocker holds while it is neither finished nor deleted.
fn is_live_blocker(status: Option<&str>, metadata: &str) -> bool {
    if metadata_deleted(metadata) {
        return false;
    }
    !matches!(
        status,
        Some("closed") | Some("tombstone") | Some("completed") | Some("failed") | Some("cancelled")
    )
}

/// A parent releases its children once it reaches a terminal state.
fn is_unfinished_parent(status: Option<&str>, metadata: &str, element_type: &str) -> bool {
    if metadata_deleted(metadata) {
        return false;
    }
    match element_type {
        "workflow" => !matches!(status, Some("completed") | Some("failed") | Some("cancelled")),
        "task" => !matches!(status, Some("closed") | Some("tombstone")),
        _ => false,
    }
}

/// Walk `parent-child` edges upward; true when the nearest ancestor workflow
/// is flagged ephemeral. Ancestors are visited breadth-first in ID order so
/// "nearest" is deterministic.
fn under_ephemeral_workflow(db: &Database, task_id: &str) -> Result<bool, ElementalError> {
    let mut visited: FxHashSet<String> = FxHashSet::default();
    visited.insert(task_id.to_string());
    let mut frontier = vec![task_id.to_string()];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for node in &frontier {
            let parents: Vec<(String, String, String)> = db.query(
                "SELECT e.id, e.type, e.payload
                 FROM dependencies d JOIN elements e ON e.id = d.target_id
                 WHERE d.source_id = ?1 AND d.type = 'parent-child'
                 ORDER BY e.id",
                [node.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            for (parent_id, element_type, payload) in parents {
                if element_type == "workflow" {
                    let ephemeral = serde_json::from_str::<serde_json::Value>(&payload)
                        .ok()
                        .and_then(|p| p.get("ephemeral").and_then(serde_json::Value::as_bool))
                        .unwrap_or(false);
                    return Ok(ephemeral);
                }
                if visited.insert(parent_id.clone()) {
                    next.push(parent_id);
                }
            }
        }
        next.sort();
        frontier = next;
    }
    Ok(false)
}

fn require_workflow(db: &Database, workflow_id: &str) -> Result<Element, ElementalError> {
    let Some(element) = fetch_element(db, workflow_id)? else {
        return Err(
            ElementalError::not_found(format!("workflow not found: {workflow_id}"))
                .with_detail("id", json!(workflow_id)),
        );
    };
    if element.element_type != ElementType::Workflow {
        return Err(ElementalError::validation(format!(
            "{workflow_id} is a {}, not a workflow",
            element.element_type
        ))
        .with_detail("id", json!(workflow_id))
        .with_detail("type", json!(element.element_type.as_str())));
    }
    Ok(element)
}

/// All tasks attached to a workflow through `parent-child` edges.
pub fn tasks_in_workflow(
    db: &Database,
    workflow_id: &str,
    filter: &ElementFilter,
) -> Result<Vec<Element>, ElementalError> {
    require_workflow(db, workflow_id)?;
    let child_ids: Vec<String> = db.query(
        "SELECT source_id FROM dependencies WHERE target_id = ?1 AND type = 'parent-child'
         ORDER BY source_id",
        [workflow_id],
        |row| row.get(0),
    )?;
    let mut tasks = Vec::new();
    for child_id in child_ids {
        let Some(element) = fetch_element(db, &child_id)? else {
            continue;
        };
        if element.element_type != ElementType::Task {
            continue;
        }
        let Some(task) = element.payload.as_task() else {
            continue;
        };
        if !filter.include_deleted && element.is_deleted() {
            continue;
        }
        if let Some(status) = &filter.status {
            if task.status.as_str() != status {
                continue;
            }
        }
        if let Some(priority) = filter.priority {
            if task.priority != priority {
                continue;
            }
        }
        if let Some(assignee) = &filter.assignee {
            if task.assignee.as_deref() != Some(assignee.as_str()) {
                continue;
            }
        }
        tasks.push(element);
    }
    tasks.sort_by(|a, b| {
        let pa = a.payload.as_task().map(|t| t.priority).unwrap_or(3);
        let pb = b.payload.as_task().map(|t| t.priority).unwrap_or(3);
        pa.cmp(&pb)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    if let Some(limit) = filter.limit {
        tasks.truncate(limit);
    }
    Ok(tasks)
}

/// Tasks in the workflow that are also ready.
pub fn ready_tasks_in_workflow(
    db: &Database,
    workflow_id: &str,
    filter: &ReadyFilter,
) -> Result<Vec<Element>, ElementalError> {
    let members = tasks_in_workflow(db, workflow_id, &ElementFilter::default())?;
    let member_ids: FxHashSet<&str> = members.iter().map(|e| e.id.as_str()).collect();
    let ready = ready(db, filter)?;
    Ok(ready
        .into_iter()
        .filter(|e| member_ids.contains(e.id.as_str()))
        .collect())
}

/// Progress counters for a workflow. `completionPercentage` is
/// `floor(100 * closed / total)` and 0 for an empty workflow.
pub fn workflow_progress(
    db: &Database,
    workflow_id: &str,
) -> Result<WorkflowProgress, ElementalError> {
    require_workflow(db, workflow_id)?;
    let tasks = tasks_in_workflow(db, workflow_id, &ElementFilter::default())?;
    let mut status_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut closed = 0i64;
    let mut blocked_tasks = 0i64;
    let mut ready_tasks = 0i64;
    let now = Utc::now();
    for element in &tasks {
        let Some(task) = element.payload.as_task() else {
            continue;
        };
        *status_counts.entry(task.status.as_str().to_string()).or_insert(0) += 1;
        if task.status == TaskStatus::Closed {
            closed += 1;
        }
        let scheduled_future = task.scheduled_for.is_some_and(|at| at > now);
        let derived = derived_blocker(db, element)?;
        if matches!(
            task.status,
            TaskStatus::Open | TaskStatus::InProgress | TaskStatus::Blocked
        ) && (derived.is_some() || task.status == TaskStatus::Blocked)
        {
            blocked_tasks += 1;
        } else if task.status.is_active() && !scheduled_future && derived.is_none() {
            ready_tasks += 1;
        }
    }
    let total_tasks = tasks.len() as i64;
    let completion_percentage = if total_tasks == 0 {
        0
    } else {
        (100 * closed) / total_tasks
    };
    Ok(WorkflowProgress {
        workflow_id: workflow_id.to_string(),
        total_tasks,
        completion_percentage,
        ready_tasks,
        blocked_tasks,
        status_counts,
    })
}

/// Open assignment counters for one entity.
pub fn agent_workload(db: &Database, entity_id: &str) -> Result<AgentWorkload, ElementalError> {
    let rows: Vec<String> = db.query(
        "SELECT status FROM elements
         WHERE type = 'task' AND assignee = ?1
           AND COALESCE(status, '') NOT IN ('closed', 'tombstone')",
        [entity_id],
        |row| row.get(0),
    )?;
    let mut by_status: BTreeMap<String, i64> = BTreeMap::new();
    for status in &rows {
        *by_status.entry(status.clone()).or_insert(0) += 1;
    }
    Ok(AgentWorkload {
        total_tasks: rows.len() as i64,
        by_status,
    })
}

/// Compact readiness summary used by diagnostics surfaces.
pub fn readiness_snapshot(db: &Database) -> Result<serde_json::Value, ElementalError> {
    let filter = ReadyFilter::default();
    let ready = ready(db, &filter)?;
    let blocked = blocked(db, &filter)?;
    let backlog = backlog(db, &filter)?;
    Ok(json!({
        "ts": time::now_iso(),
        "ready": ready.len(),
        "blocked": blocked.len(),
        "backlog": backlog.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::NewDependency;
    use crate::core::model::{Payload, TaskPayload, WorkflowPayload, WorkflowStatus};
    use crate::core::store::{NewElement, Store};
    use serde_json::Map;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn new_task(store: &Store, title: &str, status: TaskStatus) -> Element {
        store
            .create(NewElement::new(
                "el-sys",
                Payload::Task(TaskPayload {
                    title: title.to_string(),
                    status,
                    priority: 3,
                    complexity: 3,
                    task_type: TaskType::Task,
                    assignee: None,
                    scheduled_for: None,
                    close_reason: None,
                    description_ref: None,
                    closed_at: None,
                }),
            ))
            .unwrap()
    }

    fn link(store: &Store, source: &str, target: &str, dep_type: crate::core::model::DependencyType) {
        store
            .add_dependency(NewDependency {
                source_id: source.to_string(),
                target_id: target.to_string(),
                dep_type,
                created_by: "el-sys".to_string(),
                metadata: Map::new(),
            })
            .unwrap();
    }

    #[test]
    fn test_ready_excludes_blocked_and_partitions() {
        use crate::core::model::DependencyType::Blocks;
        let store = store();
        let a = new_task(&store, "a", TaskStatus::Open);
        let b = new_task(&store, "b", TaskStatus::Open);
        link(&store, a.id.as_str(), b.id.as_str(), Blocks);

        store
            .with_db(|db| {
                let ready = ready(db, &ReadyFilter::default())?;
                let ready_ids: Vec<&str> = ready.iter().map(|e| e.id.as_str()).collect();
                assert_eq!(ready_ids, vec![b.id.as_str()]);

                let blocked = blocked(db, &ReadyFilter::default())?;
                assert_eq!(blocked.len(), 1);
                assert_eq!(blocked[0].task.id.as_str(), a.id.as_str());
                assert_eq!(blocked[0].blocked_by.as_deref(), Some(b.id.as_str()));
                assert_eq!(blocked[0].block_reason, BlockReason::BlockedByTask);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_closed_blocker_releases() {
        use crate::core::model::DependencyType::Blocks;
        let store = store();
        let a = new_task(&store, "a", TaskStatus::Open);
        let b = new_task(&store, "b", TaskStatus::Open);
        link(&store, a.id.as_str(), b.id.as_str(), Blocks);

        let mut patch = Map::new();
        patch.insert("status".to_string(), json!("closed"));
        store
            .update(
                b.id.as_str(),
                crate::core::store::ElementPatch { payload: Some(patch), ..Default::default() },
                Default::default(),
            )
            .unwrap();

        store
            .with_db(|db| {
                let ready = ready(db, &ReadyFilter::default())?;
                let ids: Vec<&str> = ready.iter().map(|e| e.id.as_str()).collect();
                assert_eq!(ids, vec![a.id.as_str()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_scheduled_future_blocks() {
        let store = store();
        let task = new_task(&store, "later", TaskStatus::Open);
        let mut patch = Map::new();
        patch.insert(
            "scheduledFor".to_string(),
            json!(time::to_iso(Utc::now() + chrono::Duration::hours(2))),
        );
        store
            .update(
                task.id.as_str(),
                crate::core::store::ElementPatch { payload: Some(patch), ..Default::default() },
                Default::default(),
            )
            .unwrap();

        store
            .with_db(|db| {
                assert!(ready(db, &ReadyFilter::default())?.is_empty());
                let blocked = blocked(db, &ReadyFilter::default())?;
                assert_eq!(blocked.len(), 1);
                assert_eq!(blocked[0].block_reason, BlockReason::ScheduledFuture);
                assert!(blocked[0].blocked_by.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_representative_blocker_is_smallest_id() {
        use crate::core::model::DependencyType::Blocks;
        let store = store();
        let task = new_task(&store, "t", TaskStatus::Open);
        let z = store
            .create(
                NewElement::new(
                    "el-sys",
                    Payload::Task(TaskPayload {
                        title: "z".to_string(),
                        status: TaskStatus::Open,
                        priority: 3,
                        complexity: 3,
                        task_type: TaskType::Task,
                        assignee: None,
                        scheduled_for: None,
                        close_reason: None,
                        description_ref: None,
                        closed_at: None,
                    }),
                )
                .with_id("el-zzz"),
            )
            .unwrap();
        let a = store
            .create(
                NewElement::new(
                    "el-sys",
                    Payload::Task(TaskPayload {
                        title: "a".to_string(),
                        status: TaskStatus::Open,
                        priority: 3,
                        complexity: 3,
                        task_type: TaskType::Task,
                        assignee: None,
                        scheduled_for: None,
                        close_reason: None,
                        description_ref: None,
                        closed_at: None,
                    }),
                )
                .with_id("el-aab"),
            )
            .unwrap();
        link(&store, task.id.as_str(), z.id.as_str(), Blocks);
        link(&store, task.id.as_str(), a.id.as_str(), Blocks);

        store
            .with_db(|db| {
                let blocked = blocked(db, &ReadyFilter::default())?;
                let entry = blocked
                    .iter()
                    .find(|b| b.task.id.as_str() == task.id.as_str())
                    .unwrap();
                assert_eq!(entry.blocked_by.as_deref(), Some("el-aab"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_workflow_progress_counts() {
        use crate::core::model::DependencyType::{Blocks, ParentChild};
        let store = store();
        let workflow = store
            .create(NewElement::new(
                "el-sys",
                Payload::Workflow(WorkflowPayload {
                    title: "release".to_string(),
                    status: WorkflowStatus::Completed,
                    ephemeral: false,
                    variables: Map::new(),
                    finished_at: None,
                }),
            ))
            .unwrap();
        let t1 = new_task(&store, "t1", TaskStatus::Open);
        let t2 = new_task(&store, "t2", TaskStatus::Open);
        let t3 = new_task(&store, "t3", TaskStatus::Open);
        for t in [&t1, &t2, &t3] {
            link(&store, t.id.as_str(), workflow.id.as_str(), ParentChild);
        }
        link(&store, t1.id.as_str(), t2.id.as_str(), Blocks);
        let mut patch = Map::new();
        patch.insert("status".to_string(), json!("closed"));
        store
            .update(
                t3.id.as_str(),
                crate::core::store::ElementPatch { payload: Some(patch), ..Default::default() },
                Default::default(),
            )
            .unwrap();

        store
            .with_db(|db| {
                let progress = workflow_progress(db, workflow.id.as_str())?;
                assert_eq!(progress.total_tasks, 3);
                assert_eq!(progress.completion_percentage, 33);
                assert_eq!(progress.ready_tasks, 1); // t2
                assert_eq!(progress.blocked_tasks, 1); // t1 blocked by t2
                assert_eq!(progress.status_counts.get("open"), Some(&2));
                assert_eq!(progress.status_counts.get("closed"), Some(&1));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_workflow_progress_errors() {
        let store = store();
        let task = new_task(&store, "t", TaskStatus::Open);
        store
            .with_db(|db| {
                let err = workflow_progress(db, "el-none").unwrap_err();
                assert_eq!(err.kind, ErrorKind::NotFound);
                let err = workflow_progress(db, task.id.as_str()).unwrap_err();
                assert_eq!(err.kind, ErrorKind::Validation);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_agent_workload_excludes_finished() {
        let store = store();
        for (title, status) in [
            ("one", TaskStatus::Open),
            ("two", TaskStatus::InProgress),
            ("three", TaskStatus::Closed),
        ] {
            let element = store
                .create(NewElement::new(
                    "el-sys",
                    Payload::Task(TaskPayload {
                        title: title.to_string(),
                        status,
                        priority: 3,
                        complexity: 3,
                        task_type: TaskType::Task,
                        assignee: Some("el-ada".to_string()),
                        scheduled_for: None,
                        close_reason: None,
                        description_ref: None,
                        closed_at: if status == TaskStatus::Closed {
                            Some(Utc::now())
                        } else {
                            None
                        },
                    }),
                ))
                .unwrap();
            let _ = element;
        }
        store
            .with_db(|db| {
                let workload = agent_workload(db, "el-ada")?;
                assert_eq!(workload.total_tasks, 2);
                assert_eq!(workload.by_status.get("open"), Some(&1));
                assert_eq!(workload.by_status.get("in_progress"), Some(&1));
                assert_eq!(workload.by_status.get("closed"), None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_backlog_listing() {
        let store = store();
        new_task(&store, "parked", TaskStatus::Backlog);
        new_task(&store, "active", TaskStatus::Open);
        store
            .with_db(|db| {
                let parked = backlog(db, &ReadyFilter::default())?;
                assert_eq!(parked.len(), 1);
                assert_eq!(parked[0].payload.as_task().unwrap().title, "parked");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_ephemeral_ancestor_filtering() {
        use crate::core::model::DependencyType::ParentChild;
        let store = store();
        let durable = store.create_workflow("durable", "el-sys", false).unwrap();
        let ephemeral = store.create_workflow("ephemeral", "el-sys", true).unwrap();
        let td = new_task(&store, "td", TaskStatus::Open);
        let te = new_task(&store, "te", TaskStatus::Open);
        link(&store, td.id.as_str(), durable.id.as_str(), ParentChild);
        link(&store, te.id.as_str(), ephemeral.id.as_str(), ParentChild);

        for workflow in [&durable, &ephemeral] {
            let mut patch = Map::new();
            patch.insert("status".to_string(), json!("completed"));
            store
                .update(
                    workflow.id.as_str(),
                    crate::core::store::ElementPatch { payload: Some(patch), ..Default::default() },
                    Default::default(),
                )
                .unwrap();
        }

        store
            .with_db(|db| {
                let default_ready = ready(db, &ReadyFilter::default())?;
                let ids: Vec<&str> = default_ready.iter().map(|e| e.id.as_str()).collect();
                assert_eq!(ids, vec![td.id.as_str()]);

                let all_ready = ready(
                    db,
                    &ReadyFilter { include_ephemeral: true, ..Default::default() },
                )?;
                assert_eq!(all_ready.len(), 2);
                Ok(())
            })
            .unwrap();
    }
}
