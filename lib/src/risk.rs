//! Risk classification for planned schema changes.
//!
//! Rules are evaluated in a fixed order and may only raise the level, never
//! lower it. Blocks make the result unsafe regardless of anything else.

use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::record::{DdlType, Environment};

/// Schemas that must never be targeted.
const SYSTEM_SCHEMAS: &[&str] = &["mysql", "information_schema", "performance_schema", "sys"];

/// Keywords that block an execution outright.
const DANGEROUS_KEYWORDS: &[&str] = &["TRUNCATE", "DROP TABLE", "DROP DATABASE"];

#[derive(
    PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Deserialize, Serialize, ToSchema, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// One step up, saturating at critical.
    fn raised(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of classifying one planned execution.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct RiskAssessment {
    pub is_safe: bool,
    pub level: RiskLevel,
    pub warnings: Vec<String>,
    /// Reasons the execution is refused outright
    pub blocks: Vec<String>,
    pub suggestions: Vec<String>,
    pub required_approvals: u32,
}

/// Everything the classifier looks at. Callers supply the clock and the
/// operator's recent activity so classification stays deterministic.
#[derive(Debug, Clone)]
pub struct RiskContext<'a> {
    pub environment: Environment,
    pub ddl_type: DdlType,
    /// Raw ALTER clause (empty for rebuilds)
    pub ddl_text: &'a str,
    pub database_name: &'a str,
    pub table_name: &'a str,
    pub ticket_id: Option<&'a str>,
    pub now: DateTime<Local>,
    pub executions_last_hour: u64,
    pub failures_last_hour: u64,
}

/// Scores planned executions against a configured set of important tables.
#[derive(Debug, Clone, Default)]
pub struct RiskClassifier {
    important_tables: Vec<String>,
}

impl RiskClassifier {
    pub fn new(important_tables: Vec<String>) -> Self {
        Self { important_tables }
    }

    pub fn classify(&self, ctx: &RiskContext<'_>) -> RiskAssessment {
        let mut level = RiskLevel::Low;
        let mut warnings: Vec<String> = Vec::new();
        let mut blocks: Vec<String> = Vec::new();
        let mut suggestions: Vec<String> = Vec::new();
        let mut required_approvals: u32 = 0;

        // 1. Environment
        match ctx.environment {
            Environment::Prod => {
                level = level.max(RiskLevel::High);
                warnings.push("production environment operation, risk is high".to_string());
                suggestions.push("verify the change on a test environment first".to_string());
                required_approvals = required_approvals.max(2);
            }
            Environment::Test => {
                level = level.max(RiskLevel::Medium);
                warnings.push("test environment operation, proceed with care".to_string());
            }
            Environment::Dev => {
                suggestions
                    .push("development environment operation is comparatively safe".to_string());
            }
        }

        // 2. DDL type
        let upper = ctx.ddl_text.to_uppercase();
        match ctx.ddl_type {
            DdlType::DropColumn => {
                level = level.max(RiskLevel::High);
                warnings
                    .push("dropping a column is irreversible, back up the data first".to_string());
            }
            DdlType::DropIndex => {
                level = level.max(RiskLevel::Medium);
                warnings.push("dropping an index can degrade query performance".to_string());
                suggestions
                    .push("confirm no important query depends on this index".to_string());
            }
            DdlType::ModifyColumn => {
                if upper.contains("NOT NULL") {
                    level = level.max(RiskLevel::Medium);
                    warnings.push(
                        "changing a column to NOT NULL can fail on existing NULL rows".to_string(),
                    );
                }
                if upper.contains("DROP DEFAULT") {
                    warnings.push("dropping the default can affect new inserts".to_string());
                }
            }
            DdlType::AddColumn => {
                if upper.contains("NOT NULL") && !upper.contains("DEFAULT") {
                    warnings.push(
                        "adding a NOT NULL column without a default can fail on existing rows"
                            .to_string(),
                    );
                }
            }
            DdlType::Fragment => {
                warnings.push(
                    "a table rebuild holds locks during the swap, run it off-peak".to_string(),
                );
                suggestions
                    .push("check the table size and estimate the run time first".to_string());
            }
            _ => {}
        }

        // 3. Keyword scan
        for keyword in DANGEROUS_KEYWORDS {
            if upper.contains(keyword) {
                level = RiskLevel::Critical;
                blocks.push(format!("extremely dangerous operation detected: {keyword}"));
            }
        }

        // 4. Target schema
        if SYSTEM_SCHEMAS
            .iter()
            .any(|schema| ctx.database_name.eq_ignore_ascii_case(schema))
        {
            level = RiskLevel::Critical;
            blocks.push("system databases must not be modified".to_string());
        } else if self
            .important_tables
            .iter()
            .any(|table| ctx.table_name.eq_ignore_ascii_case(table))
        {
            level = level.max(RiskLevel::High);
            warnings.push("this is a critical business table, proceed with care".to_string());
            required_approvals += 1;
        }

        // 5. Time window
        let hour = ctx.now.hour();
        if (9..=18).contains(&hour) {
            warnings.push("business hours right now, prefer an off-peak window".to_string());
        }
        if matches!(ctx.now.weekday(), Weekday::Sat | Weekday::Sun) {
            suggestions.push("weekend execution is comparatively safe".to_string());
        }

        // 6. Operator frequency
        if ctx.executions_last_hour > 10 {
            warnings
                .push("more than 10 executions in the past hour, slow down".to_string());
        }
        if ctx.failures_last_hour > 3 {
            warnings.push(
                "several failed executions in the past hour, review before retrying".to_string(),
            );
        }

        // 7. Ticket gate
        if ctx.environment == Environment::Prod && level == RiskLevel::High {
            match ctx.ticket_id {
                Some(ticket) if !ticket.is_empty() => {
                    suggestions.push(
                        "ticket attached, make sure it has been approved".to_string(),
                    );
                }
                _ => {
                    blocks.push(
                        "high risk production changes require a ticket id".to_string(),
                    );
                }
            }
        }

        // Final adjustment
        if !blocks.is_empty() {
            level = RiskLevel::Critical;
        } else if warnings.len() > 3 {
            level = level.raised();
        }

        required_approvals = match level {
            RiskLevel::Critical => required_approvals.max(3),
            RiskLevel::High => required_approvals.max(2),
            RiskLevel::Medium => required_approvals.max(1),
            RiskLevel::Low => required_approvals,
        };

        RiskAssessment {
            is_safe: blocks.is_empty() && level != RiskLevel::Critical,
            level,
            warnings,
            blocks,
            suggestions,
            required_approvals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// A Wednesday evening, outside business hours.
    fn off_peak() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 5, 21, 0, 0).unwrap()
    }

    fn ctx<'a>(environment: Environment, ddl_type: DdlType, ddl_text: &'a str) -> RiskContext<'a> {
        RiskContext {
            environment,
            ddl_type,
            ddl_text,
            database_name: "app",
            table_name: "orders",
            ticket_id: None,
            now: off_peak(),
            executions_last_hour: 0,
            failures_last_hour: 0,
        }
    }

    #[test]
    fn dev_index_addition_is_low_risk() {
        let classifier = RiskClassifier::default();
        let result = classifier.classify(&ctx(
            Environment::Dev,
            DdlType::AddIndex,
            "ADD INDEX idx_a (a)",
        ));
        assert!(result.is_safe);
        assert_eq!(result.level, RiskLevel::Low);
        assert_eq!(result.required_approvals, 0);
        assert!(result.blocks.is_empty());
    }

    #[test]
    fn production_raises_to_high_with_two_approvals() {
        let classifier = RiskClassifier::default();
        let result = classifier.classify(&ctx(
            Environment::Prod,
            DdlType::AddColumn,
            "ADD COLUMN note VARCHAR(64) DEFAULT ''",
        ));
        assert_eq!(result.level, RiskLevel::Critical); // high + no ticket
        assert!(!result.is_safe);
        assert!(result
            .blocks
            .iter()
            .any(|block| block.contains("ticket")));
        assert_eq!(result.required_approvals, 3);
    }

    #[test]
    fn production_with_ticket_stays_high() {
        let classifier = RiskClassifier::default();
        let mut context = ctx(
            Environment::Prod,
            DdlType::AddColumn,
            "ADD COLUMN note VARCHAR(64) DEFAULT ''",
        );
        context.ticket_id = Some("CHG-1234");
        let result = classifier.classify(&context);
        assert!(result.is_safe);
        assert_eq!(result.level, RiskLevel::High);
        assert_eq!(result.required_approvals, 2);
    }

    #[test]
    fn dangerous_keywords_block_outright() {
        let classifier = RiskClassifier::default();
        let result = classifier.classify(&ctx(
            Environment::Dev,
            DdlType::Other,
            "ADD COLUMN x INT, TRUNCATE",
        ));
        assert!(!result.is_safe);
        assert_eq!(result.level, RiskLevel::Critical);
        assert!(result.blocks[0].contains("TRUNCATE"));
        assert_eq!(result.required_approvals, 3);
    }

    #[test]
    fn system_schemas_are_blocked() {
        let classifier = RiskClassifier::default();
        let mut context = ctx(Environment::Dev, DdlType::AddIndex, "ADD INDEX idx_a (a)");
        context.database_name = "mysql";
        let result = classifier.classify(&context);
        assert!(!result.is_safe);
        assert_eq!(result.level, RiskLevel::Critical);
    }

    #[test]
    fn important_tables_raise_the_level_and_approvals() {
        let classifier = RiskClassifier::new(vec!["orders".to_string()]);
        let result = classifier.classify(&ctx(
            Environment::Test,
            DdlType::AddIndex,
            "ADD INDEX idx_a (a)",
        ));
        assert_eq!(result.level, RiskLevel::High);
        assert!(result.is_safe);
        assert_eq!(result.required_approvals, 2);
    }

    #[test]
    fn many_warnings_raise_the_level_one_step() {
        let classifier = RiskClassifier::default();
        let mut context = ctx(
            Environment::Test,
            DdlType::ModifyColumn,
            "MODIFY COLUMN a INT NOT NULL",
        );
        // Business hours and a busy operator stack two more warnings on top.
        context.now = Local.with_ymd_and_hms(2025, 3, 5, 10, 0, 0).unwrap();
        context.executions_last_hour = 11;
        let result = classifier.classify(&context);
        assert!(result.warnings.len() > 3);
        assert_eq!(result.level, RiskLevel::High);
    }

    #[test]
    fn weekends_only_add_a_suggestion() {
        let classifier = RiskClassifier::default();
        let mut context = ctx(Environment::Dev, DdlType::AddIndex, "ADD INDEX idx_a (a)");
        context.now = Local.with_ymd_and_hms(2025, 3, 8, 21, 0, 0).unwrap();
        let result = classifier.classify(&context);
        assert!(result
            .suggestions
            .iter()
            .any(|suggestion| suggestion.contains("weekend")));
        assert_eq!(result.level, RiskLevel::Low);
    }
}
