//! Builder for `pt-online-schema-change` invocations.
//!
//! The builder produces two forms of every command: the executable form with
//! the real password, and the redacted preview with the password replaced by
//! `***`. Only the preview is ever persisted or returned through an API.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::record::ExecutionParams;

/// Operation keywords a custom ALTER clause must contain at least one of.
const VALID_OPERATIONS: &[&str] = &[
    "ADD COLUMN",
    "ADD INDEX",
    "ADD KEY",
    "ADD UNIQUE",
    "DROP COLUMN",
    "DROP INDEX",
    "DROP KEY",
    "MODIFY COLUMN",
    "CHANGE COLUMN",
    "ALTER COLUMN",
    "ENGINE=",
    "AUTO_INCREMENT=",
    "COMMENT=",
    "ADD CONSTRAINT",
    "DROP CONSTRAINT",
    "ADD PRIMARY KEY",
    "DROP PRIMARY KEY",
];

/// Keywords that are never allowed to reach the tool.
const FORBIDDEN_OPERATIONS: &[&str] = &["DROP TABLE", "TRUNCATE", "DELETE"];

lazy_static! {
    static ref ALTER_TABLE_PREFIX: Regex =
        Regex::new(r"(?is)^\s*ALTER\s+TABLE\s+\S+\s+(.+)$").unwrap();
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("database and table names must not be empty")]
    EmptyTarget,
    #[error("ALTER clause must not be empty")]
    EmptyAlter,
    #[error("{0} not allowed")]
    ForbiddenOperation(&'static str),
    #[error("unsupported ALTER operation")]
    UnsupportedOperation,
    #[error("no ALTER clause has been built")]
    MissingAlter,
}

/// Where the tool should connect. The password here is plaintext and must
/// stay inside the builder; callers persist only the preview form.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Size facts about the target table, used for chunk-size and duration hints.
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub database: String,
    pub table: String,
    pub engine: Option<String>,
    pub rows: u64,
    pub size_bytes: u64,
}

/// Tool options in the order they are emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct PtOptions {
    pub chunk_size: u32,
    pub max_load: String,
    pub critical_load: String,
    pub check_interval: u32,
    pub max_lag: u32,
    pub charset: String,
    pub lock_wait_timeout: u32,
    pub progress: String,
    /// Extra flags appended verbatim before the execution flags
    pub other_params: String,
    pub execute: bool,
    pub print: bool,
    pub dry_run: bool,
    pub drop_old_table: bool,
    pub statistics: bool,
}

impl Default for PtOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            max_load: "Threads_running=25".to_string(),
            critical_load: "Threads_running=50".to_string(),
            check_interval: 1,
            max_lag: 1,
            charset: "utf8mb4".to_string(),
            lock_wait_timeout: 0,
            progress: "time,5".to_string(),
            other_params: String::new(),
            execute: true,
            print: true,
            dry_run: false,
            drop_old_table: true,
            statistics: true,
        }
    }
}

impl PtOptions {
    /// Merge the per-record tunables over the defaults.
    pub fn from_params(params: &ExecutionParams) -> Self {
        let mut options = Self::default();
        if params.chunk_size > 0 {
            options.chunk_size = params.chunk_size;
        }
        if !params.max_load.is_empty() {
            options.max_load = params.max_load.clone();
        }
        if !params.critical_load.is_empty() {
            options.critical_load = params.critical_load.clone();
        }
        if !params.charset.is_empty() {
            options.charset = params.charset.clone();
        }
        options.lock_wait_timeout = params.lock_wait_timeout;
        options.other_params = params.other_params.clone();
        options
    }
}

/// Builds one tool invocation for one `(connection, table)` pair.
pub struct CommandBuilder {
    target: ConnectionTarget,
    table: TableInfo,
    options: PtOptions,
    alter: Option<String>,
}

impl CommandBuilder {
    pub fn new(target: ConnectionTarget, table: TableInfo) -> Self {
        Self {
            target,
            table,
            options: PtOptions::default(),
            alter: None,
        }
    }

    pub fn with_options(mut self, options: PtOptions) -> Self {
        self.options = options;
        self
    }

    /// Prepare a table rebuild: a no-op copy that rewrites the table.
    pub fn rebuild(&mut self) -> Result<(), BuildError> {
        if self.table.database.is_empty() || self.table.table.is_empty() {
            return Err(BuildError::EmptyTarget);
        }
        self.alter = Some("ENGINE=INNODB".to_string());
        Ok(())
    }

    /// Prepare a custom ALTER. The clause is cleaned (leading
    /// `ALTER TABLE <name>` and trailing semicolon stripped) and validated
    /// against the forbidden and allowed operation sets.
    pub fn custom(&mut self, alter_sql: &str) -> Result<(), BuildError> {
        if self.table.database.is_empty() || self.table.table.is_empty() {
            return Err(BuildError::EmptyTarget);
        }
        let clause = clean_alter_clause(alter_sql)?;
        self.alter = Some(clause);
        Ok(())
    }

    /// The command with the real password, for the sandbox only.
    pub fn executable(&self) -> Result<String, BuildError> {
        self.assemble(&self.target.password)
    }

    /// The command with the password masked; this is the persisted form.
    pub fn preview(&self) -> Result<String, BuildError> {
        self.assemble("***")
    }

    fn assemble(&self, password: &str) -> Result<String, BuildError> {
        let alter = self.alter.as_ref().ok_or(BuildError::MissingAlter)?;
        let opts = &self.options;

        let mut parts = vec![
            "pt-online-schema-change".to_string(),
            format!("--host={}", self.target.host),
            format!("--port={}", self.target.port),
            format!("--user={}", self.target.user),
            format!("--password={}", password),
            format!("D={},t={}", self.table.database, self.table.table),
            format!("--alter=\"{}\"", alter),
        ];

        if opts.chunk_size > 0 {
            parts.push(format!("--chunk-size={}", opts.chunk_size));
        }
        if !opts.max_load.is_empty() {
            parts.push(format!("--max-load={}", opts.max_load));
        }
        if !opts.critical_load.is_empty() {
            parts.push(format!("--critical-load={}", opts.critical_load));
        }
        if opts.check_interval > 0 {
            parts.push(format!("--check-interval={}", opts.check_interval));
        }
        if opts.max_lag > 0 {
            parts.push(format!("--max-lag={}", opts.max_lag));
        }
        if !opts.charset.is_empty() {
            parts.push(format!("--charset={}", opts.charset));
        }
        if opts.lock_wait_timeout > 0 {
            parts.push(format!(
                "--set-vars=lock_wait_timeout={}",
                opts.lock_wait_timeout
            ));
        }
        if !opts.progress.is_empty() {
            parts.push(format!("--progress={}", opts.progress));
        }
        if !opts.other_params.is_empty() {
            parts.push(opts.other_params.clone());
        }

        if opts.print {
            parts.push("--print".to_string());
        }
        if opts.execute && !opts.dry_run {
            parts.push("--execute".to_string());
        }
        if opts.dry_run {
            parts.push("--dry-run".to_string());
        }
        if opts.drop_old_table {
            parts.push("--drop-old-table".to_string());
        }
        if opts.statistics {
            parts.push("--statistics".to_string());
        }

        Ok(parts.join(" "))
    }

    /// Chunk size hint by table size. Advisory output only; never substituted
    /// into the command.
    pub fn recommended_chunk_size(&self) -> u32 {
        match self.table.rows {
            0 => 1000,
            r if r < 100_000 => 1000,
            r if r < 1_000_000 => 2000,
            r if r < 10_000_000 => 5000,
            _ => 8000,
        }
    }

    /// Rough wall-time estimate assuming 1000 rows/sec.
    pub fn estimated_duration(&self) -> String {
        if self.table.rows == 0 {
            return "unknown".to_string();
        }
        let seconds = self.table.rows / 1000;
        if seconds < 60 {
            format!("{}s", seconds)
        } else if seconds < 3600 {
            format!("{}m", seconds / 60)
        } else {
            format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
        }
    }
}

/// Strip the `ALTER TABLE <name>` prefix and trailing semicolon, then check
/// the clause against the operation allow/deny lists.
fn clean_alter_clause(alter_sql: &str) -> Result<String, BuildError> {
    let mut sql = alter_sql.trim();
    if sql.is_empty() {
        return Err(BuildError::EmptyAlter);
    }
    sql = sql.strip_suffix(';').unwrap_or(sql).trim_end();

    let cleaned = match ALTER_TABLE_PREFIX.captures(sql) {
        Some(captures) => captures.get(1).map(|m| m.as_str()).unwrap_or(sql),
        None => sql,
    }
    .trim()
    .to_string();

    if cleaned.is_empty() {
        return Err(BuildError::EmptyAlter);
    }

    let upper = cleaned.to_uppercase();
    for keyword in FORBIDDEN_OPERATIONS {
        if upper.contains(keyword) {
            return Err(BuildError::ForbiddenOperation(keyword));
        }
    }
    if !VALID_OPERATIONS.iter().any(|op| upper.contains(op)) {
        return Err(BuildError::UnsupportedOperation);
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ConnectionTarget {
        ConnectionTarget {
            host: "db.example".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: "p@ss".to_string(),
        }
    }

    fn orders_table() -> TableInfo {
        TableInfo {
            database: "app".to_string(),
            table: "orders".to_string(),
            ..Default::default()
        }
    }

    fn count(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn fragment_rebuild_preview_masks_the_password() {
        let mut options = PtOptions::default();
        options.chunk_size = 2000;
        let mut builder = CommandBuilder::new(target(), orders_table()).with_options(options);
        builder.rebuild().unwrap();

        let preview = builder.preview().unwrap();
        assert_eq!(count(&preview, "--password=***"), 1);
        assert_eq!(count(&preview, "--alter=\"ENGINE=INNODB\""), 1);
        assert_eq!(count(&preview, "D=app,t=orders"), 1);
        assert_eq!(count(&preview, "--chunk-size=2000"), 1);
        assert!(preview.ends_with("--print --execute --drop-old-table --statistics"));
        assert!(!preview.contains("p@ss"));
    }

    #[test]
    fn preview_equals_executable_with_password_masked() {
        let mut builder = CommandBuilder::new(target(), orders_table());
        builder.rebuild().unwrap();

        let executable = builder.executable().unwrap();
        let preview = builder.preview().unwrap();
        assert_eq!(preview, executable.replace("p@ss", "***"));
    }

    #[test]
    fn identical_inputs_build_identical_commands() {
        let mut a = CommandBuilder::new(target(), orders_table());
        let mut b = CommandBuilder::new(target(), orders_table());
        a.custom("ADD COLUMN flags INT NOT NULL DEFAULT 0").unwrap();
        b.custom("ADD COLUMN flags INT NOT NULL DEFAULT 0").unwrap();
        assert_eq!(a.executable().unwrap(), b.executable().unwrap());
    }

    #[test]
    fn custom_clause_strips_prefix_and_semicolon() {
        let mut builder = CommandBuilder::new(target(), orders_table());
        builder
            .custom("ALTER TABLE orders ADD INDEX idx_created (created_at);")
            .unwrap();
        let command = builder.executable().unwrap();
        assert_eq!(
            count(&command, "--alter=\"ADD INDEX idx_created (created_at)\""),
            1
        );
        assert!(!command.contains("ALTER TABLE"));
    }

    #[test]
    fn drop_table_is_rejected() {
        let mut builder = CommandBuilder::new(target(), orders_table());
        let err = builder.custom("ALTER TABLE x DROP TABLE x").unwrap_err();
        assert_eq!(err, BuildError::ForbiddenOperation("DROP TABLE"));
        assert_eq!(err.to_string(), "DROP TABLE not allowed");
    }

    #[test]
    fn truncate_and_delete_are_rejected_case_insensitively() {
        let mut builder = CommandBuilder::new(target(), orders_table());
        assert_eq!(
            builder.custom("add column t int, truncate").unwrap_err(),
            BuildError::ForbiddenOperation("TRUNCATE")
        );
        assert_eq!(
            builder.custom("ADD COLUMN x INT, delete from y").unwrap_err(),
            BuildError::ForbiddenOperation("DELETE")
        );
    }

    #[test]
    fn unrecognized_operations_are_rejected() {
        let mut builder = CommandBuilder::new(target(), orders_table());
        assert_eq!(
            builder.custom("OPTIMIZE PARTITION p0").unwrap_err(),
            BuildError::UnsupportedOperation
        );
    }

    #[test]
    fn zero_valued_options_are_omitted() {
        let mut options = PtOptions::default();
        options.lock_wait_timeout = 0;
        let mut builder = CommandBuilder::new(target(), orders_table()).with_options(options);
        builder.rebuild().unwrap();
        assert!(!builder.executable().unwrap().contains("--set-vars"));

        let mut options = PtOptions::default();
        options.lock_wait_timeout = 5;
        let mut builder = CommandBuilder::new(target(), orders_table()).with_options(options);
        builder.rebuild().unwrap();
        assert!(builder
            .executable()
            .unwrap()
            .contains("--set-vars=lock_wait_timeout=5"));
    }

    #[test]
    fn dry_run_replaces_execute() {
        let mut options = PtOptions::default();
        options.dry_run = true;
        let mut builder = CommandBuilder::new(target(), orders_table()).with_options(options);
        builder.rebuild().unwrap();
        let command = builder.executable().unwrap();
        assert!(command.contains("--dry-run"));
        assert!(!command.contains("--execute"));
    }

    #[test]
    fn chunk_size_recommendation_scales_with_table_size() {
        let sizes = [
            (0u64, 1000u32),
            (50_000, 1000),
            (500_000, 2000),
            (5_000_000, 5000),
            (50_000_000, 8000),
        ];
        for (rows, expected) in sizes {
            let table = TableInfo {
                rows,
                ..orders_table()
            };
            let builder = CommandBuilder::new(target(), table);
            assert_eq!(builder.recommended_chunk_size(), expected, "rows={rows}");
        }
    }

    #[test]
    fn duration_estimate_is_humanized() {
        let cases = [
            (0u64, "unknown"),
            (30_000, "30s"),
            (600_000, "10m"),
            (7_200_000, "2h0m"),
        ];
        for (rows, expected) in cases {
            let table = TableInfo {
                rows,
                ..orders_table()
            };
            let builder = CommandBuilder::new(target(), table);
            assert_eq!(builder.estimated_duration(), expected, "rows={rows}");
        }
    }
}
