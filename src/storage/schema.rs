//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the PostgreSQL
//! storage backend.

/// SQL schema for creating the submissions table.
pub const CREATE_SUBMISSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS submissions (
    id UUID PRIMARY KEY,
    total_repos INTEGER NOT NULL CHECK (total_repos BETWEEN 1 AND 10),
    processed_repos INTEGER NOT NULL DEFAULT 0,
    status VARCHAR(20) NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'completed')),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    submission_id UUID NOT NULL REFERENCES submissions(id) ON DELETE CASCADE,
    repo_url TEXT NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    result BOOLEAN,
    reason TEXT,
    logs TEXT NOT NULL DEFAULT '',
    setup_instructions TEXT,
    execution_time_ms BIGINT,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (attempts <= max_attempts)
)
"#;

/// Index for listing the jobs of a submission.
pub const CREATE_JOBS_SUBMISSION_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_submission_id ON jobs(submission_id)";

/// Index for the watchdog sweep.
pub const CREATE_JOBS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_updated_at ON jobs(status, updated_at)";

/// Named migrations, applied in order and recorded in `_migrations`.
///
/// Names are permanent; append new entries instead of editing old ones.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_create_submissions", CREATE_SUBMISSIONS_TABLE),
    ("0002_create_jobs", CREATE_JOBS_TABLE),
    ("0003_index_jobs_submission", CREATE_JOBS_SUBMISSION_INDEX),
    ("0004_index_jobs_status_updated_at", CREATE_JOBS_STATUS_INDEX),
];

/// Table names in the schema.
pub mod tables {
    /// Submissions table name.
    pub const SUBMISSIONS: &str = "submissions";
    /// Jobs table name.
    pub const JOBS: &str = "jobs";
}
