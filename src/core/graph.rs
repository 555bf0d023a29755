//! Typed dependency graph: edges, cycle prevention, bounded traversal.
//!
//! Edges are rows in `dependencies` keyed by `(source_id, target_id, type)`.
//! For the blocking types (`blocks`, `parent-child`) insertion refuses to
//! create a directed cycle within the same-type subgraph; cross-type cycles
//! are permitted. Traversals visit neighbors in ascending lexicographic
//! order of the far endpoint, then in dependency-type enumeration order, so
//! results are deterministic for a given store state.

use crate::core::db::{Database, Isolation};
use crate::core::error::{self, ElementalError, ErrorKind};
use crate::core::model::{Dependency, DependencyType, ElementId};
use crate::core::time;
use rusqlite::params;
use rustc_hash::FxHashSet;
use serde_json::{json, Map, Value};
use std::str::FromStr;

/// Insertion request for [`add_dependency`].
#[derive(Debug, Clone)]
pub struct NewDependency {
    pub source_id: String,
    pub target_id: String,
    pub dep_type: DependencyType,
    pub created_by: String,
    pub metadata: Map<String, Value>,
}

/// Edge direction relative to the queried element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    Both,
}

impl FromStr for Direction {
    type Err = ElementalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "out" => Ok(Self::Out),
            "in" => Ok(Self::In),
            "both" => Ok(Self::Both),
            other => Err(ElementalError::validation(format!(
                "unknown direction: {other}"
            ))),
        }
    }
}

/// One visited node in a traversal result.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    pub depth: usize,
}

/// Bounded BFS result around a root element.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyTree {
    pub root: String,
    pub node_count: usize,
    pub dependency_depth: usize,
    pub dependent_depth: usize,
    pub dependencies: Vec<TreeNode>,
    pub dependents: Vec<TreeNode>,
}

/// Existence/liveness probe used before touching an endpoint.
fn require_live_endpoint(db: &Database, id: &str, role: &str) -> Result<(), ElementalError> {
    let row: Option<(Option<String>, String)> = db.query_one(
        "SELECT status, metadata FROM elements WHERE id = ?1",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let Some((status, metadata)) = row else {
        return Err(
            ElementalError::not_found(format!("{role} element not found: {id}"))
                .with_detail(role, json!(id)),
        );
    };
    let tombstoned = status.as_deref() == Some("tombstone");
    let flagged = serde_json::from_str::<Value>(&metadata)
        .ok()
        .and_then(|m| m.get("deleted").and_then(Value::as_bool))
        .unwrap_or(false);
    if tombstoned || flagged {
        return Err(ElementalError::validation(format!(
            "{role} element is deleted: {id}"
        ))
        .with_detail(role, json!(id)));
    }
    Ok(())
}

/// Add a typed edge. Enforces endpoint liveness, self-edge rejection,
/// triple uniqueness, and same-type acyclicity for the blocking types.
pub fn add_dependency(db: &Database, req: &NewDependency) -> Result<Dependency, ElementalError> {
    if req.source_id == req.target_id {
        return Err(ElementalError::validation(format!(
            "dependency cannot point at itself: {}",
            req.source_id
        ))
        .with_detail("sourceId", json!(req.source_id)));
    }

    db.transaction(Isolation::Immediate, |db| {
        require_live_endpoint(db, &req.source_id, "sourceId")?;
        require_live_endpoint(db, &req.target_id, "targetId")?;

        let exists: Option<i64> = db.query_one(
            "SELECT 1 FROM dependencies WHERE source_id = ?1 AND target_id = ?2 AND type = ?3",
            params![req.source_id, req.target_id, req.dep_type.as_str()],
            |row| row.get(0),
        )?;
        if exists.is_some() {
            return Err(ElementalError::new(
                ErrorKind::DuplicateDependency,
                format!(
                    "dependency already exists: {} -> {} ({})",
                    req.source_id, req.target_id, req.dep_type
                ),
            )
            .with_detail("sourceId", json!(req.source_id))
            .with_detail("targetId", json!(req.target_id))
            .with_detail("type", json!(req.dep_type.as_str())));
        }

        if req.dep_type.is_cycle_checked()
            && path_exists(db, &req.target_id, &req.source_id, req.dep_type)?
        {
            return Err(ElementalError::new(
                ErrorKind::CycleDetected,
                format!(
                    "adding {} -> {} would create a {} cycle",
                    req.source_id, req.target_id, req.dep_type
                ),
            )
            .with_detail("sourceId", json!(req.source_id))
            .with_detail("targetId", json!(req.target_id))
            .with_detail("type", json!(req.dep_type.as_str())));
        }

        let created_at = time::now_iso();
        let insert = db.run(
            "INSERT INTO dependencies(source_id, target_id, type, created_at, created_by, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                req.source_id,
                req.target_id,
                req.dep_type.as_str(),
                created_at,
                req.created_by,
                serde_json::to_string(&Value::Object(req.metadata.clone()))
                    .unwrap_or_else(|_| "{}".to_string()),
            ],
        );
        if let Err(err) = insert {
            if let Some(cause) = err
                .cause
                .as_ref()
                .and_then(|c| c.downcast_ref::<rusqlite::Error>())
            {
                if error::is_unique_violation(cause) {
                    return Err(ElementalError::new(
                        ErrorKind::DuplicateDependency,
                        "dependency already exists",
                    )
                    .with_detail("sourceId", json!(req.source_id))
                    .with_detail("targetId", json!(req.target_id)));
                }
            }
            return Err(err);
        }

        Ok(Dependency {
            source_id: ElementId::trusted(req.source_id.clone()),
            target_id: ElementId::trusted(req.target_id.clone()),
            dep_type: req.dep_type,
            created_at: time::parse_iso(&created_at).unwrap_or_default(),
            created_by: req.created_by.clone(),
            metadata: req.metadata.clone(),
        })
    })
}

/// Remove an edge. Fails `NOT_FOUND` when the triple is absent.
pub fn remove_dependency(
    db: &Database,
    source_id: &str,
    target_id: &str,
    dep_type: DependencyType,
) -> Result<(), ElementalError> {
    let result = db.run(
        "DELETE FROM dependencies WHERE source_id = ?1 AND target_id = ?2 AND type = ?3",
        params![source_id, target_id, dep_type.as_str()],
    )?;
    if result.changes == 0 {
        return Err(ElementalError::not_found(format!(
            "dependency not found: {source_id} -> {target_id} ({dep_type})"
        ))
        .with_detail("sourceId", json!(source_id))
        .with_detail("targetId", json!(target_id))
        .with_detail("type", json!(dep_type.as_str())));
    }
    Ok(())
}

fn row_to_dependency(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn materialize(rows: Vec<(String, String, String, String, String, String)>) -> Vec<Dependency> {
    let mut deps: Vec<Dependency> = rows
        .into_iter()
        .filter_map(|(source, target, dep_type, created_at, created_by, metadata)| {
            let dep_type = DependencyType::from_str(&dep_type).ok()?;
            Some(Dependency {
                source_id: ElementId::trusted(source),
                target_id: ElementId::trusted(target),
                dep_type,
                created_at: time::parse_iso(&created_at).unwrap_or_default(),
                created_by,
                metadata: serde_json::from_str::<Value>(&metadata)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default(),
            })
        })
        .collect();
    // Deterministic order: far endpoint, then type enumeration order.
    deps.sort_by(|a, b| {
        (a.source_id.as_str(), a.target_id.as_str(), a.dep_type)
            .cmp(&(b.source_id.as_str(), b.target_id.as_str(), b.dep_type))
    });
    deps
}

const DEP_COLUMNS: &str = "source_id, target_id, type, created_at, created_by, metadata";

/// Edges incident to `id`, filtered by direction and optionally by type.
pub fn get_dependencies(
    db: &Database,
    id: &str,
    direction: Direction,
    type_filter: Option<DependencyType>,
) -> Result<Vec<Dependency>, ElementalError> {
    let mut rows = Vec::new();
    if matches!(direction, Direction::Out | Direction::Both) {
        let fetched = match type_filter {
            Some(t) => db.query(
                &format!("SELECT {DEP_COLUMNS} FROM dependencies WHERE source_id = ?1 AND type = ?2"),
                params![id, t.as_str()],
                row_to_dependency,
            )?,
            None => db.query(
                &format!("SELECT {DEP_COLUMNS} FROM dependencies WHERE source_id = ?1"),
                params![id],
                row_to_dependency,
            )?,
        };
        rows.extend(fetched);
    }
    if matches!(direction, Direction::In | Direction::Both) {
        let fetched = match type_filter {
            Some(t) => db.query(
                &format!("SELECT {DEP_COLUMNS} FROM dependencies WHERE target_id = ?1 AND type = ?2"),
                params![id, t.as_str()],
                row_to_dependency,
            )?,
            None => db.query(
                &format!("SELECT {DEP_COLUMNS} FROM dependencies WHERE target_id = ?1"),
                params![id],
                row_to_dependency,
            )?,
        };
        rows.extend(fetched);
    }
    rows.dedup();
    Ok(materialize(rows))
}

/// Is there a directed path `from -> ... -> to` along same-type edges?
///
/// Iterative DFS with a visited set; O(V+E) over the same-type subgraph.
fn path_exists(
    db: &Database,
    from: &str,
    to: &str,
    dep_type: DependencyType,
) -> Result<bool, ElementalError> {
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut stack = vec![from.to_string()];
    while let Some(node) = stack.pop() {
        if node == to {
            return Ok(true);
        }
        if !visited.insert(node.clone()) {
            continue;
        }
        // DESC so the ascending-order neighbor is popped first.
        let neighbors: Vec<String> = db.query(
            "SELECT target_id FROM dependencies WHERE source_id = ?1 AND type = ?2 ORDER BY target_id DESC",
            params![node, dep_type.as_str()],
            |row| row.get(0),
        )?;
        stack.extend(neighbors);
    }
    Ok(false)
}

/// Global acyclicity diagnostic for one edge type.
pub fn has_cycle(db: &Database, dep_type: DependencyType) -> Result<bool, ElementalError> {
    let edges: Vec<(String, String)> = db.query(
        "SELECT source_id, target_id FROM dependencies WHERE type = ?1 ORDER BY source_id, target_id",
        [dep_type.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let mut adjacency: rustc_hash::FxHashMap<&str, Vec<&str>> = rustc_hash::FxHashMap::default();
    for (source, target) in &edges {
        adjacency.entry(source.as_str()).or_default().push(target.as_str());
    }

    // Three-color DFS: 0 unvisited, 1 on stack, 2 done.
    let mut color: rustc_hash::FxHashMap<&str, u8> = rustc_hash::FxHashMap::default();
    for start in adjacency.keys().copied().collect::<Vec<_>>() {
        if color.get(start).copied().unwrap_or(0) != 0 {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        color.insert(start, 1);
        while let Some((node, next_child)) = stack.pop() {
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if next_child < children.len() {
                stack.push((node, next_child + 1));
                let child = children[next_child];
                match color.get(child).copied().unwrap_or(0) {
                    0 => {
                        color.insert(child, 1);
                        stack.push((child, 0));
                    }
                    1 => return Ok(true),
                    _ => {}
                }
            } else {
                color.insert(node, 2);
            }
        }
    }
    Ok(false)
}

/// Breadth-first neighborhood of `id`, bounded by `max_depth`.
///
/// `Out`/`Both` walks outgoing edges (the element's dependencies);
/// `In`/`Both` walks incoming edges (its dependents). Re-entry terminates
/// through the visited set, so shared sub-graphs and diamonds are counted
/// once per side.
pub fn get_dependency_tree(
    db: &Database,
    id: &str,
    direction: Direction,
    max_depth: Option<usize>,
) -> Result<DependencyTree, ElementalError> {
    let exists: Option<i64> =
        db.query_one("SELECT 1 FROM elements WHERE id = ?1", [id], |row| row.get(0))?;
    if exists.is_none() {
        return Err(ElementalError::not_found(format!("element not found: {id}"))
            .with_detail("id", json!(id)));
    }

    let bound = max_depth.unwrap_or(usize::MAX);
    let (dependencies, dependency_depth) = if matches!(direction, Direction::Out | Direction::Both)
    {
        bfs_span(db, id, true, bound)?
    } else {
        (Vec::new(), 0)
    };
    let (dependents, dependent_depth) = if matches!(direction, Direction::In | Direction::Both) {
        bfs_span(db, id, false, bound)?
    } else {
        (Vec::new(), 0)
    };

    let mut unique: FxHashSet<&str> = FxHashSet::default();
    unique.insert(id);
    for node in dependencies.iter().chain(dependents.iter()) {
        unique.insert(node.id.as_str());
    }

    Ok(DependencyTree {
        root: id.to_string(),
        node_count: unique.len(),
        dependency_depth,
        dependent_depth,
        dependencies,
        dependents,
    })
}

fn bfs_span(
    db: &Database,
    root: &str,
    outward: bool,
    max_depth: usize,
) -> Result<(Vec<TreeNode>, usize), ElementalError> {
    let sql = if outward {
        "SELECT target_id, type FROM dependencies WHERE source_id = ?1"
    } else {
        "SELECT source_id, type FROM dependencies WHERE target_id = ?1"
    };
    let mut visited: FxHashSet<String> = FxHashSet::default();
    visited.insert(root.to_string());
    let mut frontier = vec![root.to_string()];
    let mut nodes = Vec::new();
    let mut depth = 0;

    while !frontier.is_empty() && depth < max_depth {
        let mut next = Vec::new();
        for node in &frontier {
            let mut neighbors: Vec<(String, String)> =
                db.query(sql, [node.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
            neighbors.sort_by(|a, b| {
                let ta = DependencyType::from_str(&a.1).ok();
                let tb = DependencyType::from_str(&b.1).ok();
                (a.0.as_str(), ta).cmp(&(b.0.as_str(), tb))
            });
            for (neighbor, _) in neighbors {
                if visited.insert(neighbor.clone()) {
                    next.push(neighbor);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        depth += 1;
        for id in &next {
            nodes.push(TreeNode {
                id: id.clone(),
                depth,
            });
        }
        frontier = next;
    }
    Ok((nodes, depth))
}
