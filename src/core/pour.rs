//! Pouring: expanding a playbook into a workflow with tasks and edges.
//!
//! Planning is pure: variable merging, `{{name}}` substitution, condition
//! evaluation, skip rewiring, and hierarchical task-ID assignment produce a
//! [`PourPlan`] without touching the store. Persistence happens afterwards
//! in one transaction.

use crate::core::db::{Database, Isolation};
use crate::core::error::{ElementalError, ErrorKind};
use crate::core::graph::{self, NewDependency};
use crate::core::ids::{self, IdSeed};
use crate::core::model::{
    self, DependencyType, Element, ElementId, Payload, PlaybookPayload, PlaybookStep, TaskPayload,
    TaskStatus, TaskType, WorkflowPayload, WorkflowStatus,
};
use crate::core::store::insert_element;
use crate::core::time;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("placeholder regex"))
}

/// Options accepted when pouring a playbook.
#[derive(Debug, Clone, Default)]
pub struct PourOptions {
    pub created_by: String,
    pub ephemeral: bool,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// One planned task, bound to the playbook step it came from.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub step_id: String,
    pub task_id: String,
    pub task: TaskPayload,
}

/// Pure expansion result. Edge pairs use the dependency-graph convention:
/// for `blocks`, the first ID is the blocked task.
#[derive(Debug, Clone)]
pub struct PourPlan {
    pub workflow_id: String,
    pub workflow: WorkflowPayload,
    pub tasks: Vec<PlannedTask>,
    pub parent_child_dependencies: Vec<(String, String)>,
    pub blocks_dependencies: Vec<(String, String)>,
    pub skipped_steps: Vec<String>,
}

/// Persisted outcome of a pour.
#[derive(Debug, Clone)]
pub struct PourReceipt {
    pub workflow_id: String,
    pub task_ids: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub edges: Vec<(String, String, DependencyType)>,
    pub workflow: Element,
}

/// Merge caller variables with declared defaults. A declared required
/// variable with no value fails; optional variables fall back to their
/// defaults when present.
pub fn merge_variables(
    playbook: &PlaybookPayload,
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>, ElementalError> {
    let mut merged = provided.clone();
    for variable in &playbook.variables {
        if merged.contains_key(&variable.name) {
            continue;
        }
        if variable.required {
            return Err(ElementalError::new(
                ErrorKind::MissingRequiredField,
                format!("missing required variable: {}", variable.name),
            )
            .with_detail("variable", json!(variable.name)));
        }
        if let Some(default) = &variable.default {
            merged.insert(variable.name.clone(), default.clone());
        }
    }
    Ok(merged)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Replace every `{{name}}` by literal key lookup. Unknown names fail.
pub fn substitute(
    template: &str,
    variables: &Map<String, Value>,
) -> Result<String, ElementalError> {
    let mut missing: Option<String> = None;
    let replaced = placeholder_regex().replace_all(template, |captures: &regex::Captures<'_>| {
        let key = captures[1].trim().to_string();
        match variables.get(&key) {
            Some(value) => value_to_text(value),
            None => {
                missing.get_or_insert(key);
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(
            ElementalError::validation(format!("unknown template variable: {name}"))
                .with_detail("variable", json!(name))
                .with_detail("template", json!(template)),
        );
    }
    Ok(replaced.into_owned())
}

/// Boolean condition after substitution. Recognized literals only; no
/// expression language.
fn eval_condition(substituted: &str) -> Result<bool, ElementalError> {
    match substituted.trim().to_ascii_lowercase().as_str() {
        "" | "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ElementalError::validation(format!(
            "condition must evaluate to a boolean literal, got: {other}"
        ))
        .with_detail("condition", json!(substituted))),
    }
}

/// Reject cyclic `dependsOn` declarations before planning.
fn check_step_cycles(playbook: &PlaybookPayload) -> Result<(), ElementalError> {
    let steps: FxHashMap<&str, &PlaybookStep> =
        playbook.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut done: FxHashSet<&str> = FxHashSet::default();
    for start in playbook.steps.iter() {
        if done.contains(start.id.as_str()) {
            continue;
        }
        let mut on_path: FxHashSet<&str> = FxHashSet::default();
        let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
        on_path.insert(start.id.as_str());
        while let Some((node, child_idx)) = stack.pop() {
            let deps = steps
                .get(node)
                .map(|s| s.depends_on.as_slice())
                .unwrap_or(&[]);
            if child_idx < deps.len() {
                stack.push((node, child_idx + 1));
                let dep = deps[child_idx].as_str();
                if on_path.contains(dep) {
                    return Err(ElementalError::new(
                        ErrorKind::CycleDetected,
                        format!("playbook dependsOn cycle through step {dep}"),
                    )
                    .with_detail("stepId", json!(dep)));
                }
                if !done.contains(dep) {
                    on_path.insert(dep);
                    stack.push((dep, 0));
                }
            } else {
                on_path.remove(node);
                done.insert(node);
            }
        }
    }
    Ok(())
}

/// Resolve a step's dependencies through skipped steps, transitively, so
/// ordering survives the skips (if X depends on skipped Y which depended on
/// Z, X ends up depending on Z).
fn resolve_through_skips<'a>(
    dep: &'a str,
    steps: &FxHashMap<&'a str, &'a PlaybookStep>,
    surviving: &FxHashSet<&'a str>,
    seen: &mut FxHashSet<&'a str>,
    out: &mut Vec<&'a str>,
) {
    if !seen.insert(dep) {
        return;
    }
    if surviving.contains(dep) {
        if !out.contains(&dep) {
            out.push(dep);
        }
        return;
    }
    if let Some(step) = steps.get(dep) {
        for upstream in &step.depends_on {
            resolve_through_skips(upstream.as_str(), steps, surviving, seen, out);
        }
    }
}

/// Pure pour planning. `workflow_id` is pre-allocated by the caller; task
/// IDs are its hierarchical children `workflow_id.1..n` in step order.
pub fn plan(
    playbook: &PlaybookPayload,
    variables: &Map<String, Value>,
    workflow_id: &str,
    options: &PourOptions,
) -> Result<PourPlan, ElementalError> {
    model::validate_payload(&Payload::Playbook(playbook.clone()))?;
    check_step_cycles(playbook)?;
    let merged = merge_variables(playbook, variables)?;

    let workflow_title = substitute(&playbook.name, &merged)?;
    model::validate_title(&workflow_title)?;

    let mut surviving: Vec<&PlaybookStep> = Vec::new();
    let mut skipped_steps: Vec<String> = Vec::new();
    for step in &playbook.steps {
        let keep = match &step.condition {
            Some(condition) => eval_condition(&substitute(condition, &merged)?)?,
            None => true,
        };
        if keep {
            surviving.push(step);
        } else {
            skipped_steps.push(step.id.clone());
        }
    }

    let steps_by_id: FxHashMap<&str, &PlaybookStep> =
        playbook.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let surviving_ids: FxHashSet<&str> = surviving.iter().map(|s| s.id.as_str()).collect();

    let mut tasks = Vec::with_capacity(surviving.len());
    let mut task_id_by_step: FxHashMap<&str, String> = FxHashMap::default();
    for (ordinal, step) in surviving.iter().enumerate() {
        let task_id = ids::child_of(workflow_id, (ordinal + 1) as i64)?;
        let title = substitute(&step.title, &merged)?;
        model::validate_title(&title)?;
        let assignee = step
            .assignee
            .as_deref()
            .map(|raw| substitute(raw, &merged))
            .transpose()?
            .filter(|s| !s.trim().is_empty());
        tasks.push(PlannedTask {
            step_id: step.id.clone(),
            task_id: task_id.clone(),
            task: TaskPayload {
                title,
                status: TaskStatus::Open,
                priority: step.priority.unwrap_or(3),
                complexity: step.complexity.unwrap_or(3),
                task_type: TaskType::Task,
                assignee,
                scheduled_for: None,
                close_reason: None,
                description_ref: None,
                closed_at: None,
            },
        });
        task_id_by_step.insert(step.id.as_str(), task_id);
    }

    let mut parent_child = Vec::with_capacity(tasks.len());
    for task in &tasks {
        parent_child.push((task.task_id.clone(), workflow_id.to_string()));
    }

    let mut blocks = Vec::new();
    for step in &surviving {
        let mut effective: Vec<&str> = Vec::new();
        for dep in &step.depends_on {
            let mut seen = FxHashSet::default();
            resolve_through_skips(dep.as_str(), &steps_by_id, &surviving_ids, &mut seen, &mut effective);
        }
        for dep in effective {
            if dep == step.id.as_str() {
                continue;
            }
            let blocked = task_id_by_step[step.id.as_str()].clone();
            let blocker = task_id_by_step[dep].clone();
            if !blocks.contains(&(blocked.clone(), blocker.clone())) {
                blocks.push((blocked, blocker));
            }
        }
    }

    Ok(PourPlan {
        workflow_id: workflow_id.to_string(),
        workflow: WorkflowPayload {
            title: workflow_title,
            status: WorkflowStatus::Pending,
            ephemeral: options.ephemeral,
            variables: merged,
            finished_at: None,
        },
        tasks,
        parent_child_dependencies: parent_child,
        blocks_dependencies: blocks,
        skipped_steps,
    })
}

/// Plan and persist in one transaction: workflow element, child tasks with
/// hierarchical IDs, `parent-child` edges, and rewired `blocks` edges.
pub fn pour(
    db: &Database,
    playbook: &PlaybookPayload,
    variables: &Map<String, Value>,
    options: &PourOptions,
) -> Result<PourReceipt, ElementalError> {
    db.transaction(Isolation::Immediate, |db| {
        let element_count: i64 = db
            .query_one("SELECT COUNT(*) FROM elements", [], |row| row.get(0))?
            .unwrap_or(0);
        let merged = merge_variables(playbook, variables)?;
        let title_preview = substitute(&playbook.name, &merged)?;
        let seed = IdSeed {
            identifier: &title_preview,
            created_by: &options.created_by,
            timestamp_ns: time::now_ns(),
        };
        let workflow_id = ids::generate(&seed, element_count.max(0) as u64, |candidate| {
            let taken: Option<i64> =
                db.query_one("SELECT 1 FROM elements WHERE id = ?1", [candidate], |row| {
                    row.get(0)
                })?;
            Ok(taken.is_some())
        })?;

        let plan = plan(playbook, variables, &workflow_id, options)?;
        let now = time::now_utc();

        let workflow = Element {
            id: ElementId::trusted(plan.workflow_id.clone()),
            element_type: crate::core::model::ElementType::Workflow,
            created_at: now,
            updated_at: now,
            created_by: options.created_by.clone(),
            tags: options.tags.clone(),
            metadata: options.metadata.clone(),
            payload: Payload::Workflow(plan.workflow.clone()),
        };
        insert_element(db, &workflow)?;
        db.mark_dirty(workflow.id.as_str())?;

        let mut task_ids = Vec::with_capacity(plan.tasks.len());
        for planned in &plan.tasks {
            let ordinal = db.next_child(&plan.workflow_id)?;
            let expected = ids::child_of(&plan.workflow_id, ordinal)?;
            debug_assert_eq!(expected, planned.task_id);
            let task = Element {
                id: ElementId::trusted(planned.task_id.clone()),
                element_type: crate::core::model::ElementType::Task,
                created_at: now,
                updated_at: now,
                created_by: options.created_by.clone(),
                tags: options.tags.clone(),
                metadata: Map::new(),
                payload: Payload::Task(planned.task.clone()),
            };
            insert_element(db, &task)?;
            db.mark_dirty(task.id.as_str())?;
            task_ids.push(planned.task_id.clone());
        }

        let mut edges = Vec::new();
        for (child, parent) in &plan.parent_child_dependencies {
            graph::add_dependency(
                db,
                &NewDependency {
                    source_id: child.clone(),
                    target_id: parent.clone(),
                    dep_type: DependencyType::ParentChild,
                    created_by: options.created_by.clone(),
                    metadata: Map::new(),
                },
            )?;
            edges.push((child.clone(), parent.clone(), DependencyType::ParentChild));
        }
        for (blocked, blocker) in &plan.blocks_dependencies {
            graph::add_dependency(
                db,
                &NewDependency {
                    source_id: blocked.clone(),
                    target_id: blocker.clone(),
                    dep_type: DependencyType::Blocks,
                    created_by: options.created_by.clone(),
                    metadata: Map::new(),
                },
            )?;
            edges.push((blocked.clone(), blocker.clone(), DependencyType::Blocks));
        }

        Ok(PourReceipt {
            workflow_id: plan.workflow_id,
            task_ids,
            skipped_steps: plan.skipped_steps,
            edges,
            workflow,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::PlaybookVariable;

    fn step(id: &str, title: &str, depends_on: &[&str], condition: Option<&str>) -> PlaybookStep {
        PlaybookStep {
            id: id.to_string(),
            title: title.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            condition: condition.map(|s| s.to_string()),
            priority: None,
            complexity: None,
            assignee: None,
        }
    }

    fn release_playbook() -> PlaybookPayload {
        PlaybookPayload {
            name: "Release {{version}}".to_string(),
            steps: vec![
                step("build", "Build {{version}}", &[], None),
                step("test", "Test", &["build"], Some("{{runTests}}")),
                step("lint", "Lint", &["build"], Some("{{runLint}}")),
                step("deploy", "Deploy", &["test", "lint"], None),
            ],
            variables: vec![
                PlaybookVariable {
                    name: "version".to_string(),
                    var_type: "string".to_string(),
                    required: true,
                    default: None,
                },
                PlaybookVariable {
                    name: "runTests".to_string(),
                    var_type: "bool".to_string(),
                    required: false,
                    default: Some(json!(true)),
                },
                PlaybookVariable {
                    name: "runLint".to_string(),
                    var_type: "bool".to_string(),
                    required: false,
                    default: Some(json!(true)),
                },
            ],
        }
    }

    fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_substitute_literal_lookup() {
        let variables = vars(&[("name", json!("core")), ("count", json!(3))]);
        assert_eq!(
            substitute("pour {{name}} x{{count}}", &variables).unwrap(),
            "pour core x3"
        );
        let err = substitute("hello {{missing}}", &variables).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.details["variable"], "missing");
    }

    #[test]
    fn test_required_variable_enforced() {
        let playbook = release_playbook();
        let err = merge_variables(&playbook, &Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingRequiredField);
        let merged =
            merge_variables(&playbook, &vars(&[("version", json!("1.2.0"))])).unwrap();
        assert_eq!(merged["runTests"], json!(true));
        assert_eq!(merged["version"], json!("1.2.0"));
    }

    #[test]
    fn test_plan_condition_skip_and_ordinals() {
        let playbook = release_playbook();
        let variables = vars(&[
            ("version", json!("2.0.0")),
            ("runTests", json!(true)),
            ("runLint", json!(false)),
        ]);
        let plan = plan(&playbook, &variables, "el-wf01", &PourOptions::default()).unwrap();

        assert_eq!(plan.workflow.title, "Release 2.0.0");
        assert_eq!(plan.skipped_steps, vec!["lint".to_string()]);
        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["el-wf01.1", "el-wf01.2", "el-wf01.3"]);
        let steps: Vec<&str> = plan.tasks.iter().map(|t| t.step_id.as_str()).collect();
        assert_eq!(steps, vec!["build", "test", "deploy"]);
        assert_eq!(plan.tasks[0].task.title, "Build 2.0.0");

        // parent-child edge per surviving step.
        assert_eq!(plan.parent_child_dependencies.len(), 3);
        assert!(plan
            .parent_child_dependencies
            .iter()
            .all(|(_, parent)| parent == "el-wf01"));

        // deploy depended on test + lint; lint was skipped and had build as
        // its upstream, so deploy now depends on test and build.
        let deploy_deps: Vec<&str> = plan
            .blocks_dependencies
            .iter()
            .filter(|(blocked, _)| blocked == "el-wf01.3")
            .map(|(_, blocker)| blocker.as_str())
            .collect();
        assert_eq!(deploy_deps, vec!["el-wf01.2", "el-wf01.1"]);
    }

    #[test]
    fn test_plan_skip_chain_rewires_transitively() {
        let playbook = PlaybookPayload {
            name: "chain".to_string(),
            steps: vec![
                step("a", "A", &[], None),
                step("b", "B", &["a"], Some("false")),
                step("c", "C", &["b"], Some("false")),
                step("d", "D", &["c"], None),
            ],
            variables: vec![],
        };
        let plan = plan(&playbook, &Map::new(), "el-wf02", &PourOptions::default()).unwrap();
        assert_eq!(plan.skipped_steps, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(
            plan.blocks_dependencies,
            vec![("el-wf02.2".to_string(), "el-wf02.1".to_string())]
        );
    }

    #[test]
    fn test_plan_rejects_unknown_condition_literal() {
        let playbook = PlaybookPayload {
            name: "bad".to_string(),
            steps: vec![step("a", "A", &[], Some("maybe"))],
            variables: vec![],
        };
        let err = plan(&playbook, &Map::new(), "el-wf03", &PourOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_step_cycle_rejected() {
        let playbook = PlaybookPayload {
            name: "cyclic".to_string(),
            steps: vec![
                step("a", "A", &["b"], None),
                step("b", "B", &["a"], None),
            ],
            variables: vec![],
        };
        let err = plan(&playbook, &Map::new(), "el-wf04", &PourOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CycleDetected);
    }

    #[test]
    fn test_diamond_dependencies_survive() {
        let playbook = PlaybookPayload {
            name: "diamond".to_string(),
            steps: vec![
                step("root", "Root", &[], None),
                step("left", "Left", &["root"], None),
                step("right", "Right", &["root"], None),
                step("join", "Join", &["left", "right"], None),
            ],
            variables: vec![],
        };
        let plan = plan(&playbook, &Map::new(), "el-wf05", &PourOptions::default()).unwrap();
        assert!(plan.skipped_steps.is_empty());
        assert_eq!(plan.tasks.len(), 4);
        assert_eq!(plan.blocks_dependencies.len(), 4);
    }

    #[test]
    fn test_pour_persists_atomically() {
        let db = Database::open_in_memory().unwrap();
        let playbook = release_playbook();
        let variables = vars(&[
            ("version", json!("3.1.4")),
            ("runLint", json!(false)),
        ]);
        let receipt = pour(
            &db,
            &playbook,
            &variables,
            &PourOptions {
                created_by: "el-sys".to_string(),
                ephemeral: true,
                tags: vec!["release".to_string()],
                metadata: Map::new(),
            },
        )
        .unwrap();

        assert_eq!(receipt.task_ids.len(), 3);
        assert_eq!(receipt.skipped_steps, vec!["lint".to_string()]);
        let stored_tasks: i64 = db
            .query_one(
                "SELECT COUNT(*) FROM elements WHERE type = 'task'",
                [],
                |row| row.get(0),
            )
            .unwrap()
            .unwrap();
        assert_eq!(stored_tasks, 3);
        let edge_count: i64 = db
            .query_one("SELECT COUNT(*) FROM dependencies", [], |row| row.get(0))
            .unwrap()
            .unwrap();
        assert_eq!(edge_count as usize, receipt.edges.len());
        // The child counter advanced with the hierarchical IDs.
        assert_eq!(db.peek_child(&receipt.workflow_id).unwrap(), 3);
        // Workflow stores its merged variables.
        let payload: String = db
            .query_one(
                "SELECT payload FROM elements WHERE id = ?1",
                [receipt.workflow_id.as_str()],
                |row| row.get(0),
            )
            .unwrap()
            .unwrap();
        let payload: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(payload["variables"]["version"], "3.1.4");
        assert_eq!(payload["ephemeral"], json!(true));
    }

    #[test]
    fn test_pour_missing_variable_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let playbook = release_playbook();
        let err = pour(
            &db,
            &playbook,
            &Map::new(),
            &PourOptions {
                created_by: "el-sys".to_string(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingRequiredField);
        let elements: i64 = db
            .query_one("SELECT COUNT(*) FROM elements", [], |row| row.get(0))
            .unwrap()
            .unwrap();
        assert_eq!(elements, 0);
    }
}
