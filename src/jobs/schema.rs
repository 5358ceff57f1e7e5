//! Database schema for the job store.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

// =============================================================================
// Jobs - Version 0
// =============================================================================

const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("action", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("tries", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("added_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("next_attempt_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_jobs_action_status", "action, status, added_at"),
        ("idx_jobs_next_attempt", "next_attempt_at"),
    ],
    unique_constraints: &[],
};

/// One row per parameter; deleting a job drops its parameters.
const JOB_PARAMETERS_TABLE_V0: Table = Table {
    name: "job_parameters",
    columns: &[
        sqlite_column!(
            "job_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "jobs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_job_parameters_lookup", "name, value")],
    unique_constraints: &[&["job_id", "name"]],
};

pub const JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOBS_TABLE_V0, JOB_PARAMETERS_TABLE_V0],
    migration: None,
}];
