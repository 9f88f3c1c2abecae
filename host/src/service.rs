//! The submission service: validates intents through the command builder and
//! the risk classifier, creates records, hands them to the orchestrator and
//! keeps the audit trail.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use oscar_engine::Orchestrator;
use oscar_lib::{
    CommandBuilder, ConnectionDescriptor, ConnectionTarget, DdlType, Environment, ExecutionParams,
    ExecutionRecord, PtOptions, RiskAssessment, RiskClassifier, RiskContext, TableInfo,
};
use oscar_store::{
    AuditEntry, AuditStatus, AuditStore, ConnectionStore, CredentialVault, ListFilter, Page,
    RecordStore,
};

use crate::error::{HostError, HostResult};

/// A DDL intent, as submitted or previewed.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ExecutionRequest {
    pub connection_id: String,
    pub database_name: String,
    pub table_name: String,
    pub ddl_type: DdlType,
    /// Required for everything except a `fragment` rebuild
    pub original_ddl: Option<String>,
    pub execution_params: Option<ExecutionParams>,
    /// Change ticket backing this operation, required for high-risk
    /// production changes
    pub ticket_id: Option<String>,
    /// Operator-supplied row count of the target table; drives the progress
    /// denominator and the chunk-size recommendation
    pub table_rows: Option<u64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PreviewResponse {
    /// The redacted command, exactly what would be persisted
    pub command: String,
    pub risk: RiskAssessment,
    pub recommended_chunk_size: u32,
    pub estimated_duration: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateConnectionRequest {
    pub name: String,
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Plaintext password; encrypted before it is stored
    pub password: String,
    pub database_name: String,
    pub connect_timeout: Option<u32>,
    pub charset: Option<String>,
    pub use_ssl: Option<bool>,
}

/// Connection as returned by the API, without any password material.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConnectionResponse {
    pub id: String,
    pub name: String,
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub database_name: String,
    pub connect_timeout: u32,
    pub charset: String,
    pub use_ssl: bool,
}

impl From<ConnectionDescriptor> for ConnectionResponse {
    fn from(connection: ConnectionDescriptor) -> Self {
        Self {
            id: connection.id,
            name: connection.name,
            environment: connection.environment,
            host: connection.host,
            port: connection.port,
            username: connection.username,
            database_name: connection.database_name,
            connect_timeout: connection.connect_timeout,
            charset: connection.charset,
            use_ssl: connection.use_ssl,
        }
    }
}

pub struct ExecutionService {
    records: Arc<dyn RecordStore>,
    connections: Arc<dyn ConnectionStore>,
    audit: Arc<dyn AuditStore>,
    vault: Arc<CredentialVault>,
    orchestrator: Arc<Orchestrator>,
    classifier: RiskClassifier,
}

impl ExecutionService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        connections: Arc<dyn ConnectionStore>,
        audit: Arc<dyn AuditStore>,
        vault: Arc<CredentialVault>,
        orchestrator: Arc<Orchestrator>,
        classifier: RiskClassifier,
    ) -> Self {
        Self {
            records,
            connections,
            audit,
            vault,
            orchestrator,
            classifier,
        }
    }

    /// Build the command for a request without creating anything.
    pub async fn preview(&self, request: &ExecutionRequest, user: &str) -> HostResult<PreviewResponse> {
        let connection = self.connections.get(&request.connection_id).await?;
        let builder = self.build(request, &connection)?;
        let risk = self.assess(request, &connection, user).await?;
        Ok(PreviewResponse {
            command: builder.preview()?,
            recommended_chunk_size: builder.recommended_chunk_size(),
            estimated_duration: builder.estimated_duration(),
            risk,
        })
    }

    /// Validate, gate, persist and enqueue one execution.
    pub async fn submit(&self, request: &ExecutionRequest, user: &str) -> HostResult<ExecutionRecord> {
        let connection = self.connections.get(&request.connection_id).await?;
        let builder = self.build(request, &connection)?;
        let risk = self.assess(request, &connection, user).await?;

        if !risk.is_safe {
            oscar_metrics::EXECUTIONS_REJECTED_COUNT
                .with_label_values(&["blocked"])
                .inc();
            let reason = risk.blocks.join("; ");
            self.record_audit(
                AuditEntry::new(user, "execution_create", AuditStatus::Blocked)
                    .with_resource("execution", &request.table_name)
                    .with_risk_level(risk.level)
                    .with_error(reason.clone()),
            )
            .await;
            return Err(HostError::Blocked(reason));
        }

        let mut record = ExecutionRecord::new(
            Uuid::new_v4().to_string(),
            request.connection_id.clone(),
            request.database_name.clone(),
            request.table_name.clone(),
            request.ddl_type,
            request.original_ddl.clone(),
            builder.preview()?,
            request.execution_params.clone().unwrap_or_default(),
            user.to_string(),
        );
        record.total_rows = request.table_rows.unwrap_or(0);

        self.orchestrator.submit(&record).await?;

        self.record_audit(
            AuditEntry::new(user, "execution_create", AuditStatus::Success)
                .with_resource("execution", &record.id)
                .with_risk_level(risk.level),
        )
        .await;
        Ok(record)
    }

    pub async fn stop(&self, id: &str, user: &str) -> HostResult<ExecutionRecord> {
        self.orchestrator.stop(id).await?;
        self.record_audit(
            AuditEntry::new(user, "execution_stop", AuditStatus::Success)
                .with_resource("execution", id),
        )
        .await;
        Ok(self.records.get(id).await?)
    }

    pub async fn retry(&self, id: &str, user: &str) -> HostResult<ExecutionRecord> {
        let record = self.orchestrator.retry(id).await?;
        self.record_audit(
            AuditEntry::new(user, "execution_retry", AuditStatus::Success)
                .with_resource("execution", id),
        )
        .await;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> HostResult<ExecutionRecord> {
        Ok(self.records.get(id).await?)
    }

    pub async fn list(
        &self,
        filter: &ListFilter,
        page: Page,
    ) -> HostResult<(Vec<ExecutionRecord>, u64)> {
        Ok(self.records.list(filter, page).await?)
    }

    pub async fn logs(&self, id: &str) -> HostResult<Option<String>> {
        Ok(self.records.select_logs(id).await?)
    }

    pub async fn create_connection(
        &self,
        request: &CreateConnectionRequest,
        user: &str,
    ) -> HostResult<ConnectionResponse> {
        let connection = ConnectionDescriptor {
            id: Uuid::new_v4().to_string(),
            name: request.name.clone(),
            environment: request.environment,
            host: request.host.clone(),
            port: request.port,
            username: request.username.clone(),
            encrypted_password: self.vault.encrypt(&request.password)?,
            database_name: request.database_name.clone(),
            connect_timeout: request.connect_timeout.unwrap_or(5),
            charset: request
                .charset
                .clone()
                .unwrap_or_else(|| "utf8mb4".to_string()),
            use_ssl: request.use_ssl.unwrap_or(false),
        };
        self.connections.insert(&connection).await?;
        self.record_audit(
            AuditEntry::new(user, "connection_create", AuditStatus::Success)
                .with_resource("connection", &connection.id),
        )
        .await;
        Ok(connection.into())
    }

    pub async fn list_connections(&self) -> HostResult<Vec<ConnectionResponse>> {
        let connections = self.connections.list().await?;
        Ok(connections.into_iter().map(Into::into).collect())
    }

    /// Prepare a builder with the ALTER clause set and validated.
    fn build(
        &self,
        request: &ExecutionRequest,
        connection: &ConnectionDescriptor,
    ) -> HostResult<CommandBuilder> {
        let password = self.vault.decrypt(&connection.encrypted_password)?;
        let target = ConnectionTarget {
            host: connection.host.clone(),
            port: connection.port,
            user: connection.username.clone(),
            password,
        };
        let table = TableInfo {
            database: request.database_name.clone(),
            table: request.table_name.clone(),
            rows: request.table_rows.unwrap_or(0),
            ..Default::default()
        };
        let options = request
            .execution_params
            .as_ref()
            .map(PtOptions::from_params)
            .unwrap_or_default();

        let mut builder = CommandBuilder::new(target, table).with_options(options);
        match request.ddl_type {
            DdlType::Fragment => builder.rebuild()?,
            _ => {
                let clause = request
                    .original_ddl
                    .as_deref()
                    .filter(|ddl| !ddl.is_empty())
                    .ok_or_else(|| {
                        HostError::Validation(
                            "original_ddl is required for custom DDL".to_string(),
                        )
                    })?;
                builder.custom(clause)?;
            }
        }
        Ok(builder)
    }

    /// Classify the request with the operator's recent activity factored in.
    async fn assess(
        &self,
        request: &ExecutionRequest,
        connection: &ConnectionDescriptor,
        user: &str,
    ) -> HostResult<RiskAssessment> {
        let since: DateTime<Utc> = Utc::now() - Duration::hours(1);
        let recent = self.audit.recent_by_user(user, since).await.unwrap_or_else(|err| {
            warn!(%err, "audit lookup failed, classifying without history");
            Vec::new()
        });
        let executions_last_hour = recent
            .iter()
            .filter(|entry| entry.action.starts_with("execution"))
            .count() as u64;
        let failures_last_hour = recent
            .iter()
            .filter(|entry| entry.status == AuditStatus::Failed)
            .count() as u64;

        let context = RiskContext {
            environment: connection.environment,
            ddl_type: request.ddl_type,
            ddl_text: request.original_ddl.as_deref().unwrap_or(""),
            database_name: &request.database_name,
            table_name: &request.table_name,
            ticket_id: request.ticket_id.as_deref(),
            now: Local::now(),
            executions_last_hour,
            failures_last_hour,
        };
        Ok(self.classifier.classify(&context))
    }

    /// Audit writes never fail the audited operation.
    async fn record_audit(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.insert(&entry).await {
            warn!(action = %entry.action, %err, "failed to write audit entry");
        }
    }
}
