// src/core/schemas.rs
// Centralized database schema definitions for the element engine.

pub const DB_FILE_NAME: &str = "elemental.db";
pub const DB_DIR_NAME: &str = ".elemental";

/// Schema version persisted in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 3;

// --- v1: elements + dependencies ---

pub const SCHEMA_V1_ELEMENTS: &str = "
    CREATE TABLE IF NOT EXISTS elements (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        created_by TEXT NOT NULL DEFAULT '',
        tags TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT '{}',
        payload TEXT NOT NULL DEFAULT '{}',
        status TEXT GENERATED ALWAYS AS (json_extract(payload, '$.status')) VIRTUAL,
        assignee TEXT GENERATED ALWAYS AS (json_extract(payload, '$.assignee')) VIRTUAL,
        CHECK (updated_at >= created_at)
    )
";

pub const SCHEMA_V1_ELEMENTS_IDX_TYPE: &str =
    "CREATE INDEX IF NOT EXISTS idx_elements_type ON elements(type)";
pub const SCHEMA_V1_ELEMENTS_IDX_TYPE_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_elements_type_status ON elements(type, status)";
pub const SCHEMA_V1_ELEMENTS_IDX_ASSIGNEE: &str =
    "CREATE INDEX IF NOT EXISTS idx_elements_assignee ON elements(assignee) WHERE assignee IS NOT NULL";
pub const SCHEMA_V1_ELEMENTS_IDX_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_elements_created_at ON elements(created_at)";

pub const SCHEMA_V1_DEPENDENCIES: &str = "
    CREATE TABLE IF NOT EXISTS dependencies (
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        created_by TEXT NOT NULL DEFAULT '',
        metadata TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (source_id, target_id, type),
        FOREIGN KEY (source_id) REFERENCES elements(id),
        FOREIGN KEY (target_id) REFERENCES elements(id)
    )
";

pub const SCHEMA_V1_DEPENDENCIES_IDX_SOURCE: &str =
    "CREATE INDEX IF NOT EXISTS idx_dependencies_source_type ON dependencies(source_id, type)";
pub const SCHEMA_V1_DEPENDENCIES_IDX_TARGET: &str =
    "CREATE INDEX IF NOT EXISTS idx_dependencies_target_type ON dependencies(target_id, type)";

// --- v2: document version chain ---

pub const SCHEMA_V2_DOCUMENT_VERSIONS: &str = "
    CREATE TABLE IF NOT EXISTS document_versions (
        document_id TEXT NOT NULL,
        version INTEGER NOT NULL CHECK (version >= 1),
        content TEXT NOT NULL,
        content_type TEXT NOT NULL,
        previous_version_id TEXT,
        created_at TEXT NOT NULL,
        created_by TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (document_id, version),
        FOREIGN KEY (document_id) REFERENCES elements(id)
    )
";

pub const SCHEMA_V2_DOCUMENT_VERSIONS_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_document_versions_doc ON document_versions(document_id, version DESC)";

// --- v3: sync dirty-set + hierarchical child counters ---

pub const SCHEMA_V3_DIRTY_ELEMENTS: &str = "
    CREATE TABLE IF NOT EXISTS dirty_elements (
        element_id TEXT PRIMARY KEY,
        marked_at TEXT NOT NULL
    )
";

pub const SCHEMA_V3_CHILD_COUNTERS: &str = "
    CREATE TABLE IF NOT EXISTS child_counters (
        parent_id TEXT PRIMARY KEY,
        last_child INTEGER NOT NULL DEFAULT 0
    )
";
