//! Elemental: a local-first coordination substrate.
//!
//! Heterogeneous elements (tasks, workflows, documents, entities, channels,
//! messages, teams, libraries, playbooks) are linked by typed directed
//! dependencies on a single embedded SQLite database. The engine provides:
//!
//! - **Content-addressed identity**: deterministic `el-` IDs with adaptive
//!   length and hierarchical `.N` children ([`core::ids`])
//! - **Typed element store**: optimistic concurrency, tombstone soft
//!   deletion, tag/metadata semantics, mutation events ([`core::store`])
//! - **Dependency graph**: unique typed edges with cycle prevention on the
//!   blocking types and deterministic traversal ([`core::graph`])
//! - **Versioned documents**: an append-only chain with rollback-by-copy
//!   ([`core::documents`])
//! - **Readiness queries**: `ready`/`blocked`/`backlog`, workflow progress,
//!   per-entity workload ([`core::queries`])
//! - **Pours**: playbooks expanded into workflows, tasks, and edges in one
//!   transaction ([`core::pour`])
//!
//! # Concurrency contract
//!
//! Single cooperative writer: the store serializes every operation on an
//! internal mutex, mutations commit in operation order, and events fire
//! after commit. Network surfaces wrap the store in their own runtime.
//!
//! # Example
//!
//! ```no_run
//! use elemental::core::db::DbConfig;
//! use elemental::core::store::Store;
//!
//! let store = Store::open(&DbConfig::file(".elemental/elemental.db"))?;
//! let task = store.create_task("Wire the exporter", "el-sys")?;
//! println!("created {}", task.id);
//! # Ok::<(), elemental::core::error::ElementalError>(())
//! ```

pub mod cli;
pub mod core;

pub use crate::core::db::{Database, DbConfig};
pub use crate::core::error::{ElementalError, ErrorKind};
pub use crate::core::model::{Element, ElementId, ElementType};
pub use crate::core::store::Store;
