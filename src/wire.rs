use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::auth::BookdAuthSource;
use crate::engine::{Engine, EngineError, NewBlock, NewBooking, SlotConflictReason};
use crate::feed::{gaps_from_feed, AvailabilityFeed, FeedError};
use crate::gaps::AvailabilityGap;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::timestamp::format_instant;

pub struct BookdHandler {
    engine: Arc<Engine>,
    feed: Arc<dyn AvailabilityFeed>,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(engine: Arc<Engine>, feed: Arc<dyn AvailabilityFeed>) -> Self {
        Self {
            engine,
            feed,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    /// Execute one command, recording query metrics.
    async fn run(&self, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResource {
                id,
                name,
                capacity,
                hourly_rate,
                status,
            } => {
                engine
                    .create_resource(id, name, capacity, hourly_rate, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                resource_id,
                requester_id,
                start,
                end,
                notes,
            } => {
                let booking = engine
                    .create_booking(NewBooking {
                        resource_id,
                        requester_id,
                        start,
                        end,
                        notes,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(rows(bookings_schema(), [booking], encode_booking))
            }
            Command::CancelBooking { id, actor } => {
                let booking = engine.cancel_booking(id, actor).await.map_err(engine_err)?;
                Ok(rows(bookings_schema(), [booking], encode_booking))
            }
            Command::InsertBlock {
                resource_id,
                start,
                end,
                reason,
                created_by,
            } => {
                let block = engine
                    .create_block(
                        NewBlock {
                            resource_id,
                            start,
                            end,
                            reason,
                        },
                        created_by,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(rows(blocks_schema(), [block], encode_block))
            }
            Command::DeleteBlock { id, actor_id } => {
                engine.delete_block(id, actor_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                Ok(rows(resources_schema(), resources, encode_resource))
            }
            Command::SelectBookings { resource_id } => {
                let bookings = engine.get_bookings(resource_id).await.map_err(engine_err)?;
                Ok(rows(bookings_schema(), bookings, encode_booking))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(rows(bookings_schema(), [booking], encode_booking))
            }
            Command::SelectBlocks { resource_id } => {
                let blocks = engine.get_blocks(resource_id).await.map_err(engine_err)?;
                Ok(rows(blocks_schema(), blocks, encode_block))
            }
            Command::SelectSlot { resource_id, start, end } => {
                let conflict = engine
                    .slot_conflict(resource_id, start, end, None)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(slots_schema(), [(resource_id, start, end, conflict)], encode_slot))
            }
            Command::SelectAvailability {
                resource_id,
                start,
                end,
                min_duration,
            } => {
                let windows = engine
                    .compute_free_windows(resource_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                let rid = resource_id.to_string();
                Ok(rows(availability_schema(), windows, |encoder, span| {
                    encoder.encode_field(&rid)?;
                    encoder.encode_field(&format_instant(span.start))?;
                    encoder.encode_field(&format_instant(span.end))
                }))
            }
            Command::SelectGaps { start, end, min_nights } => {
                let gaps = gaps_from_feed(self.feed.as_ref(), start, end, min_nights)
                    .await
                    .map_err(feed_err)?;
                Ok(rows(gaps_schema(), gaps, encode_gap))
            }
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_resource(encoder: &mut DataRowEncoder, r: ResourceInfo) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.name)?;
    encoder.encode_field(&i64::from(r.capacity))?;
    encoder.encode_field(&r.hourly_rate.to_string())?;
    encoder.encode_field(&r.status.to_string())
}

fn encode_booking(encoder: &mut DataRowEncoder, b: BookingInfo) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.resource_id.to_string())?;
    encoder.encode_field(&b.requester_id.to_string())?;
    encoder.encode_field(&format_instant(b.start))?;
    encoder.encode_field(&format_instant(b.end))?;
    encoder.encode_field(&b.total_price.to_string())?;
    encoder.encode_field(&b.status.to_string())?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&format_instant(b.created_at))?;
    encoder.encode_field(&format_instant(b.updated_at))
}

fn encode_block(encoder: &mut DataRowEncoder, b: BlockInfo) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.resource_id.to_string())?;
    encoder.encode_field(&format_instant(b.start))?;
    encoder.encode_field(&format_instant(b.end))?;
    encoder.encode_field(&b.reason)?;
    encoder.encode_field(&b.created_by.to_string())?;
    encoder.encode_field(&format_instant(b.created_at))
}

fn encode_slot(
    encoder: &mut DataRowEncoder,
    (resource_id, start, end, conflict): (ulid::Ulid, Ms, Ms, Option<SlotConflictReason>),
) -> PgWireResult<()> {
    encoder.encode_field(&resource_id.to_string())?;
    encoder.encode_field(&format_instant(start))?;
    encoder.encode_field(&format_instant(end))?;
    encoder.encode_field(&conflict.is_none())?;
    encoder.encode_field(&conflict.map(|c| c.label().to_string()))
}

fn encode_gap(encoder: &mut DataRowEncoder, g: AvailabilityGap) -> PgWireResult<()> {
    encoder.encode_field(&g.start_date.to_string())?;
    encoder.encode_field(&g.end_date.to_string())?;
    encoder.encode_field(&i64::from(g.nights))?;
    encoder.encode_field(&i64::from(g.min_rooms_available))
}

// ── Schemas ──────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("hourly_rate", Type::VARCHAR),
        field("status", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("total_price", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("updated_at", Type::VARCHAR),
    ]
}

fn blocks_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("reason", Type::VARCHAR),
        field("created_by", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("free", Type::BOOL),
        field("reason", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
    ]
}

fn gaps_schema() -> Vec<FieldInfo> {
    vec![
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("nights", Type::INT8),
        field("min_rooms_available", Type::INT8),
    ]
}

/// Row shape a statement will produce, for Describe.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::result_table(sql).as_deref() {
        Some("resources") => resources_schema(),
        Some("bookings") => bookings_schema(),
        Some("blocks") => blocks_schema(),
        Some("slots") => slots_schema(),
        Some("availability") => availability_schema(),
        Some("gaps") => gaps_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookdQueryParser;

#[async_trait]
impl QueryParser for BookdQueryParser {
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

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdHandler {
    type Statement = String;
    type QueryParser = BookdQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute `$1`, `$2`, ... with bound parameter values (text format) in a
/// single pass over the statement. Bound text is copied in once and never
/// scanned again, so a `$1` inside a value stays literal.
fn substitute_params(portal: &Portal<String>) -> String {
    splice_params(&portal.statement.statement, &portal.parameters)
}

fn splice_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => {
                out.push('$');
                out.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookdFactory {
    handler: Arc<BookdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<BookdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BookdFactory {
    pub fn new(engine: Arc<Engine>, feed: Arc<dyn AvailabilityFeed>, password: String) -> Self {
        let auth_source = BookdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(engine, feed)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    feed: Arc<dyn AvailabilityFeed>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(BookdFactory::new(engine, feed, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(sqlstate: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), sqlstate.into(), message)))
}

/// SQLSTATE for each engine failure kind.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInterval { .. } | EngineError::PastBooking { .. } => "22023",
        EngineError::ResourceNotFound(_) | EngineError::NotFound(_) => "P0002",
        EngineError::ResourceUnavailable { .. }
        | EngineError::AlreadyCancelled(_)
        | EngineError::InvalidTransition { .. } => "55000",
        EngineError::SlotConflict(SlotConflictReason::RaceLost { .. }) => "40001",
        EngineError::SlotConflict(_) | EngineError::ConflictWithBooking(_) | EngineError::ConflictWithBlock(_) => {
            "23P01"
        }
        EngineError::NotAuthorized { .. } => "42501",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::ResourceInUse(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Storage(_) => "58030",
    }
}

fn engine_message(e: &EngineError) -> String {
    format!("{}: {e}", e.code())
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!(code = e.code(), "request refused: {e}");
    user_error(sqlstate(&e), engine_message(&e))
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", format!("SYNTAX: {e}"))
}

fn feed_err(e: FeedError) -> PgWireError {
    match e {
        FeedError::InvalidRange { .. } => user_error("22023", format!("INVALID_INTERVAL: {e}")),
        FeedError::RangeTooWide { .. } => user_error("54000", format!("LIMIT_EXCEEDED: {e}")),
        other => {
            error!("availability feed failed: {other}");
            user_error("58000", "FEED_UNAVAILABLE: availability feed unavailable".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM resources"), 0);
        assert_eq!(count_params("SELECT * FROM slots WHERE resource_id = $1 AND start >= $3"), 3);
        assert_eq!(count_params("SELECT '$' FROM resources"), 0);
    }

    #[test]
    fn bound_text_is_not_rescanned() {
        let sql = "INSERT INTO bookings VALUES ($1, $2, $10)";
        let mut params = vec![Some("deposit $2 paid, it's $10".to_string()), None];
        params.extend((3..=10).map(|n| Some(format!("v{n}"))));
        assert_eq!(
            splice_params(sql, &params),
            "INSERT INTO bookings VALUES ('deposit $2 paid, it''s $10', NULL, 'v10')"
        );
    }

    #[test]
    fn unbound_placeholders_stay_literal() {
        let params: Vec<Option<&str>> = vec![Some("a")];
        assert_eq!(splice_params("SELECT $1, $2, '$'", &params), "SELECT 'a', $2, '$'");
    }

    #[test]
    fn error_message_leads_with_code() {
        let e = EngineError::AlreadyCancelled(Ulid::nil());
        assert_eq!(sqlstate(&e), "55000");
        assert!(engine_message(&e).starts_with("ALREADY_CANCELLED: "));
    }

    #[test]
    fn race_lost_is_retryable() {
        let lost = EngineError::SlotConflict(SlotConflictReason::RaceLost { booking_id: Ulid::nil() });
        let taken = EngineError::SlotConflict(SlotConflictReason::Taken { booking_id: Ulid::nil() });
        assert_eq!(sqlstate(&lost), "40001");
        assert_eq!(sqlstate(&taken), "23P01");
    }

    #[test]
    fn storage_detail_stays_out_of_the_message() {
        let e = EngineError::Storage("disk full at /data/bookd.wal".into());
        assert_eq!(engine_message(&e), "STORAGE: storage unavailable");
    }

    #[test]
    fn describe_matches_returned_rows() {
        assert_eq!(schema_for("SELECT * FROM gaps WHERE start >= $1").len(), 4);
        assert_eq!(schema_for("DELETE FROM bookings WHERE id = $1 AND actor_id = $2").len(), 10);
        assert!(schema_for("DELETE FROM resources WHERE id = $1").is_empty());
    }
}
