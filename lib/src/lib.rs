//! Core domain types and pure logic for the oscar schema change orchestrator:
//! execution records, the tool command builder, the risk classifier and the
//! progress parser. Everything in this crate is side-effect free; I/O lives in
//! the store, sandbox and engine crates.

pub mod command;
pub mod progress;
pub mod record;
pub mod risk;

pub use command::{BuildError, CommandBuilder, ConnectionTarget, PtOptions, TableInfo};
pub use progress::parse_progress;
pub use record::{
    ConnectionDescriptor, DdlType, Environment, ExecutionParams, ExecutionRecord, ExecutionStatus,
};
pub use risk::{RiskAssessment, RiskClassifier, RiskContext, RiskLevel};
