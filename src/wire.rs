use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::GatehouseAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, command_table, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError, Table};

pub struct GatehouseHandler {
    engine: Arc<Engine>,
    query_parser: Arc<GatehouseQueryParser>,
}

/// Paging columns appended to every list row.
#[derive(Debug, Clone, Copy)]
struct Envelope {
    total: i64,
    page: i64,
    limit: i64,
    total_pages: i64,
}

impl<T> From<&Page<T>> for Envelope {
    fn from(p: &Page<T>) -> Self {
        Self {
            total: p.total as i64,
            page: p.page.into(),
            limit: p.limit.into(),
            total_pages: p.total_pages.into(),
        }
    }
}

impl GatehouseHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(GatehouseQueryParser),
        }
    }

    /// Parse, execute, and record the outcome. `format` carries the result
    /// column formats a portal asked for; simple queries are all text.
    async fn run(&self, sql: &str, format: Option<&Format>) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!(error = %e, "rejected statement");
                metrics::counter!(QUERIES_TOTAL, "command" => "invalid", "table" => "none", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let (command, table) = (command_label(&cmd), command_table(&cmd));
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => command, "table" => table, "status" => status)
            .increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => command, "table" => table)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: Option<&Format>) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertPlace(draft) => {
                let view = engine.create_place(draft).await.map_err(engine_err)?;
                place_rows(&[view], None, format)
            }
            Command::UpdatePlace { id, patch } => {
                let view = engine.update_place(id, patch).await.map_err(engine_err)?;
                place_rows(&[view], None, format)
            }
            Command::InsertEvent(draft) => {
                let event = engine.create_event(draft).await.map_err(engine_err)?;
                event_rows(&[(event, None)], None, format)
            }
            Command::UpdateEvent { id, patch } => {
                let event = engine.update_event(id, patch).await.map_err(engine_err)?;
                event_rows(&[(event, None)], None, format)
            }
            Command::InsertChild {
                kind,
                place_id,
                name,
            } => {
                let child = engine
                    .create_child(kind, place_id, name)
                    .await
                    .map_err(engine_err)?;
                child_rows(&[child], format)
            }
            Command::UpdateChild { kind, id, patch } => {
                let child = engine
                    .update_child(kind, id, patch)
                    .await
                    .map_err(engine_err)?;
                child_rows(&[child], format)
            }
            Command::Delete { table, id } => match table {
                Table::Places => place_rows(&[engine.delete_place(id).await.map_err(engine_err)?], None, format),
                Table::Events => {
                    let event = engine.delete_event(id).await.map_err(engine_err)?;
                    event_rows(&[(event, None)], None, format)
                }
                Table::Children(kind) => {
                    child_rows(&[engine.delete_child(kind, id).await.map_err(engine_err)?], format)
                }
            },
            Command::Find { table, id } => match table {
                Table::Places => place_rows(&[engine.find_place(id).await.map_err(engine_err)?], None, format),
                Table::Events => {
                    let EventView { event, place } = engine.find_event(id).await.map_err(engine_err)?;
                    event_rows(&[(event, Some(place))], None, format)
                }
                Table::Children(kind) => {
                    child_rows(&[engine.find_child(kind, id).map_err(engine_err)?], format)
                }
            },
            Command::ListPlaces(query) => {
                let page = engine.list_places(&query).await.map_err(engine_err)?;
                place_rows(&page.data, Some((&page).into()), format)
            }
            Command::ListEvents { place_id, query } => {
                let page = engine
                    .list_events(place_id, &query)
                    .await
                    .map_err(engine_err)?;
                let envelope = (&page).into();
                let rows: Vec<_> = page.data.into_iter().map(|e| (e, None)).collect();
                event_rows(&rows, Some(envelope), format)
            }
            Command::ListChildren { kind, place_id } => {
                child_rows(&engine.list_children(kind, place_id), format)
            }
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

/// Paging columns, in the order `finish_row` writes them.
const ENVELOPE_COLUMNS: [&str; 4] = ["total", "page", "limit", "total_pages"];

/// Column layout for a table's result rows.
pub fn table_schema(table: Table, list: bool, format: Option<&Format>) -> Vec<FieldInfo> {
    let columns: &[&str] = match table {
        Table::Places => &["id", "name", "address", "city", "state", "gates", "turnstiles"],
        Table::Events => &[
            "id",
            "place_id",
            "event",
            "type",
            "email",
            "phone",
            "date_start",
            "date_end",
            "created_at",
            "updated_at",
            "place",
        ],
        Table::Children(_) => &["id", "place_id", "name"],
    };
    let envelope: &[&str] = if list {
        &ENVELOPE_COLUMNS
    } else {
        &[]
    };
    let typed = columns
        .iter()
        .map(|c| (*c, Type::VARCHAR))
        .chain(envelope.iter().map(|c| (*c, Type::INT8)));
    typed
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new(name.into(), None, None, ty, field_format)
        })
        .collect()
}

/// Schema a statement will produce, known before its parameters are bound.
/// Placeholders stand in as an all-zero ULID, which every column accepts as
/// text. Anything still unparseable falls back to the table's plain layout.
fn result_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    let stand_in = substitute(sql, |_| Some("'00000000000000000000000000'".into()));
    match sql::parse_sql(&stand_in) {
        Ok(Command::ListPlaces(_)) => table_schema(Table::Places, true, format),
        Ok(Command::ListEvents { .. }) => table_schema(Table::Events, true, format),
        Ok(cmd) => table_schema(cmd.table(), false, format),
        Err(_) => sql::statement_table(sql).map_or_else(Vec::new, |t| table_schema(t, false, format)),
    }
}

pub fn rfc3339(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn json<T: serde::Serialize>(value: &T) -> PgWireResult<String> {
    serde_json::to_string(value).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn finish_row(mut encoder: DataRowEncoder, envelope: Option<Envelope>) -> PgWireResult<DataRow> {
    if let Some(env) = envelope {
        encoder.encode_field(&env.total)?;
        encoder.encode_field(&env.page)?;
        encoder.encode_field(&env.limit)?;
        encoder.encode_field(&env.total_pages)?;
    }
    Ok(encoder.take_row())
}

/// An empty page still reports its envelope: one row whose record columns
/// are NULL.
fn envelope_only_row(schema: &Arc<Vec<FieldInfo>>, env: Envelope) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    for _ in 0..schema.len() - ENVELOPE_COLUMNS.len() {
        encoder.encode_field(&None::<String>)?;
    }
    finish_row(encoder, Some(env))
}

fn respond(
    schema: Arc<Vec<FieldInfo>>,
    mut rows: Vec<PgWireResult<DataRow>>,
    envelope: Option<Envelope>,
) -> PgWireResult<Response> {
    if let Some(env) = envelope
        && rows.is_empty()
    {
        rows.push(envelope_only_row(&schema, env));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn place_rows(
    views: &[PlaceView],
    envelope: Option<Envelope>,
    format: Option<&Format>,
) -> PgWireResult<Response> {
    let schema = Arc::new(table_schema(Table::Places, envelope.is_some(), format));
    let rows = views
        .iter()
        .map(|v| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&v.place.id.to_string())?;
            encoder.encode_field(&v.place.name)?;
            encoder.encode_field(&v.place.address)?;
            encoder.encode_field(&v.place.city)?;
            encoder.encode_field(&v.place.state)?;
            encoder.encode_field(&json(&v.gates)?)?;
            encoder.encode_field(&json(&v.turnstiles)?)?;
            finish_row(encoder, envelope)
        })
        .collect();
    respond(schema, rows, envelope)
}

fn event_rows(
    events: &[(Event, Option<Place>)],
    envelope: Option<Envelope>,
    format: Option<&Format>,
) -> PgWireResult<Response> {
    let schema = Arc::new(table_schema(Table::Events, envelope.is_some(), format));
    let rows = events
        .iter()
        .map(|(e, place)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&e.id.to_string())?;
            encoder.encode_field(&e.place_id.to_string())?;
            encoder.encode_field(&e.event)?;
            encoder.encode_field(&e.kind)?;
            encoder.encode_field(&e.email)?;
            encoder.encode_field(&e.phone)?;
            encoder.encode_field(&rfc3339(e.window.start))?;
            encoder.encode_field(&rfc3339(e.window.end))?;
            encoder.encode_field(&rfc3339(e.created_at))?;
            encoder.encode_field(&rfc3339(e.updated_at))?;
            encoder.encode_field(&place.as_ref().map(json).transpose()?)?;
            finish_row(encoder, envelope)
        })
        .collect();
    respond(schema, rows, envelope)
}

fn child_rows(children: &[AccessPoint], format: Option<&Format>) -> PgWireResult<Response> {
    let schema = Arc::new(table_schema(Table::Children(AccessKind::Gate), false, format));
    let rows = children
        .iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.place_id.to_string())?;
            encoder.encode_field(&c.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    respond(schema, rows, None)
}

#[async_trait]
impl SimpleQueryHandler for GatehouseHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GatehouseQueryParser;

#[async_trait]
impl QueryParser for GatehouseQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for GatehouseHandler {
    type Statement = String;
    type QueryParser = GatehouseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let params = &portal.parameters;
        let sql = substitute(&portal.statement.statement, |n| {
            n.checked_sub(1).and_then(|i| params.get(i)).map(|p| match p {
                Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
                None => "NULL".to_string(),
            })
        });
        self.run(&sql, Some(&portal.result_column_format)).await
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
            result_schema(&target.statement, None),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Walk `$N` placeholders outside string literals.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'$' if !in_quote => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, _, n)| n).max().unwrap_or(0)
}

/// Replace each `$N` with `value(N)`; placeholders without a value stay as-is.
fn substitute(sql: &str, value: impl Fn(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (start, end, n) in placeholders(sql) {
        if let Some(v) = value(n) {
            out.push_str(&sql[last..start]);
            out.push_str(&v);
            last = end;
        }
    }
    out.push_str(&sql[last..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GatehouseFactory {
    handler: Arc<GatehouseHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<GatehouseAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl GatehouseFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = GatehouseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GatehouseHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GatehouseFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(GatehouseFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::WalError(_)) {
        warn!(error = %e, "storage failure");
    } else {
        debug!(kind = e.label(), error = %e, "request failed");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
