use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;

use crate::auth::TrialDeskAuthSource;
use crate::engine::Engine;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct TrialDeskHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<TrialDeskQueryParser>,
}

impl TrialDeskHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(TrialDeskQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// The connection's pg user is the acting role; the auth layer has
    /// already vouched for it. A user outside the closed role set gets a
    /// permission error on every command that cares.
    fn resolve_role<C: ClientInfo>(&self, client: &C) -> PgWireResult<Role> {
        let user = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_default();
        user.parse::<Role>().map_err(|()| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                format!("unknown role: {user} (expected teacher|sales|admin|supervisor)"),
            )))
        })
    }

    async fn run_command(
        &self,
        engine: &Engine,
        role: Role,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(engine, role, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        role: Role,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertTeacher { id, name, category } => {
                engine
                    .register_teacher(id, name, category)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSlot { teacher_id, key } => {
                engine.publish_slot(teacher_id, key).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteSlot { teacher_id, key } => {
                engine.withdraw_slot(teacher_id, key).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertTrial(req) => {
                let trial = engine.book_trial(req).await.map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&trial.id.to_string())?;
                encoder.encode_field(&trial.code)?;
                encoder.encode_field(&trial.teacher_id.to_string())?;
                encoder.encode_field(&trial.trial_date.map(|d| d.to_string()))?;
                encoder.encode_field(&trial.trial_time.map(|t| t.format("%H:%M").to_string()))?;
                encoder.encode_field(&trial.status.as_str())?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::InsertFamily(req) => {
                let group = engine.book_family(req).await.map_err(engine_err)?;
                let schema = Arc::new(booking_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&group.id.to_string())?;
                encoder.encode_field(&group.code)?;
                encoder.encode_field(&group.teacher_id.to_string())?;
                encoder.encode_field(&group.trial_date.map(|d| d.to_string()))?;
                encoder.encode_field(&group.trial_time.map(|t| t.format("%H:%M").to_string()))?;
                encoder.encode_field(&group.status.as_str())?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::UpdateStatus { family, id, status } => {
                if family {
                    engine.change_family_status(role, id, status).await.map_err(engine_err)?;
                } else {
                    engine.change_status(role, id, status).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::UpdateSchedule { family, id, key, reason } => {
                if family {
                    engine.reschedule_family(id, key, reason).await.map_err(engine_err)?;
                } else {
                    engine.reschedule_trial(id, key, reason).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertSession { occupant_id, key } => {
                let session = engine
                    .append_session(occupant_id, key)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(history_schema());
                let row = encode_session(&schema, &session)?;
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::CompleteSession { id, actual_minutes, notes } => {
                engine
                    .complete_session(id, actual_minutes, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectTeachers => {
                let teachers = engine.list_teachers().await;
                let schema = Arc::new(teachers_schema());
                let rows: Vec<PgWireResult<_>> = teachers
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.name)?;
                        encoder.encode_field(&info.category)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability { teacher_id, date } => {
                let views = engine
                    .list_available(teacher_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let tid_str = teacher_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = views
                    .into_iter()
                    .map(|view| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&tid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&view.time.format("%H:%M").to_string())?;
                        encoder.encode_field(&view.booked)?;
                        encoder.encode_field(&view.occupant.map(|o| o.id().to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectHistory { student_id } => {
                let sessions = engine.history(student_id).await.map_err(engine_err)?;
                let schema = Arc::new(history_schema());
                let rows: Vec<PgWireResult<_>> = sessions
                    .iter()
                    .map(|session| encode_session(&schema, session))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn teachers_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("category".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("teacher_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("date".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("booked".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("occupant_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

/// Row shape returned by booking inserts (trials and families).
fn booking_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("code".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("teacher_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("date".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn history_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("session_number".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("date".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("reschedule_count".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("original_date".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("original_time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("reason".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("actual_minutes".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("notes".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn encode_session(
    schema: &Arc<Vec<FieldInfo>>,
    session: &SessionOccurrence,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&session.id.to_string())?;
    encoder.encode_field(&(session.session_number as i32))?;
    encoder.encode_field(&session.scheduled_date.to_string())?;
    encoder.encode_field(&session.scheduled_time.format("%H:%M").to_string())?;
    encoder.encode_field(&session.status.as_str())?;
    encoder.encode_field(&(session.reschedule_count as i32))?;
    encoder.encode_field(&session.original_date.map(|d| d.to_string()))?;
    encoder.encode_field(&session.original_time.map(|t| t.format("%H:%M").to_string()))?;
    encoder.encode_field(&session.reschedule_reason.map(|r| r.as_str()))?;
    encoder.encode_field(&session.actual_minutes.map(|m| m as i32))?;
    encoder.encode_field(&session.notes)?;
    Ok(encoder.take_row())
}

/// Pick the result schema from the SQL text, for Describe and for the
/// extended-protocol row description. Booking inserts return a row.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("SELECT") && upper.contains("TEACHERS") {
        teachers_schema()
    } else if upper.contains("SELECT") && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("SELECT") && upper.contains("HISTORY") {
        history_schema()
    } else if upper.contains("INSERT") && (upper.contains("TRIALS") || upper.contains("FAMILIES")) {
        booking_schema()
    } else if upper.contains("INSERT") && upper.contains("SESSIONS") {
        history_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TrialDeskHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let role = self.resolve_role(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, role, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TrialDeskQueryParser;

#[async_trait]
impl QueryParser for TrialDeskQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TrialDeskHandler {
    type Statement = String;
    type QueryParser = TrialDeskQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let role = self.resolve_role(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(&engine, role, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_sql(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TrialDeskFactory {
    handler: Arc<TrialDeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<TrialDeskAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl TrialDeskFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = TrialDeskAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TrialDeskHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TrialDeskFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client socket to completion, optionally upgrading to TLS.
pub async fn process_connection(
    socket: tokio::net::TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<pgwire::tokio::TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = TrialDeskFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
