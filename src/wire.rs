use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

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

use crate::engine::{Engine, EngineError, Entity};
use crate::model::*;
use crate::net::SpotbookAuthSource;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, BookingFilter, Command};
use crate::tenant::TenantManager;

pub struct SpotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SpotbookQueryParser>,
}

impl SpotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SpotbookQueryParser),
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

    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertResource {
            owner_id,
            label,
            rate_hour,
            rate_day,
        } => {
            let id = engine
                .create_resource(owner_id, label, rate_hour, rate_day)
                .await
                .map_err(engine_err)?;
            Ok(id_response(id))
        }
        Command::UpdateResource {
            id,
            rate_hour,
            rate_day,
            active,
        } => {
            if rate_hour.is_some() || rate_day.is_some() {
                let current = engine
                    .get_resource(id)
                    .await
                    .ok_or(EngineError::NotFound(Entity::Resource, id))
                    .map_err(engine_err)?;
                engine
                    .update_rates(
                        id,
                        rate_hour.unwrap_or(current.rate_hour),
                        rate_day.unwrap_or(current.rate_day),
                    )
                    .await
                    .map_err(engine_err)?;
            }
            if let Some(active) = active {
                engine
                    .set_resource_active(id, active)
                    .await
                    .map_err(engine_err)?;
            }
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::SelectResources { id } => {
            let resources = match id {
                Some(id) => engine.get_resource(id).await.into_iter().collect(),
                None => engine.list_resources().await,
            };
            rows_response(resource_schema(), &resources, encode_resource)
        }
        Command::InsertInterval {
            resource_id,
            start,
            end,
        } => {
            let id = engine
                .add_interval(resource_id, start, end)
                .await
                .map_err(engine_err)?;
            Ok(id_response(id))
        }
        Command::DeleteInterval { id } => {
            engine.remove_interval(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectIntervals { resource_id, range } => {
            let intervals = engine
                .intervals_for_resource(resource_id, range)
                .await
                .map_err(engine_err)?;
            rows_response(interval_schema(), &intervals, encode_interval)
        }
        Command::SelectFreeIntervals {
            resource_id,
            start,
            end,
        } => {
            let intervals = engine
                .find_free_intervals_containing(resource_id, start, end)
                .await
                .map_err(engine_err)?;
            rows_response(interval_schema(), &intervals, encode_interval)
        }
        Command::SelectAvailableResources { start, end } => {
            let resources = engine
                .find_resources_available(start, end)
                .await
                .map_err(engine_err)?;
            rows_response(resource_schema(), &resources, encode_resource)
        }
        Command::InsertBooking {
            user_id,
            resource_id,
            interval_id,
            start,
            end,
        } => {
            let booking = engine
                .book(user_id, resource_id, interval_id, start, end)
                .await
                .map_err(engine_err)?;
            rows_response(booking_schema(), &[booking], encode_booking)
        }
        Command::DeleteBooking { id } => {
            let cancelled = engine.cancel(id).await.map_err(engine_err)?;
            Ok(Response::Execution(
                Tag::new("DELETE").with_rows(usize::from(cancelled)),
            ))
        }
        Command::UpdatePaymentStatus { id, status } => {
            engine
                .set_payment_status(id, status)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
        }
        Command::SelectBookings { filter } => {
            let bookings = match filter {
                BookingFilter::Id(id) => engine.get_booking(id).into_iter().collect(),
                BookingFilter::User(user_id) => engine.bookings_for_user(user_id),
                BookingFilter::Resource(rid) => engine
                    .bookings_for_resource(rid)
                    .await
                    .map_err(engine_err)?,
            };
            rows_response(booking_schema(), &bookings, encode_booking)
        }
        Command::InsertSubscription {
            user_id,
            resource_id,
            start,
            end,
        } => {
            let id = engine
                .subscribe(user_id, resource_id, start, end)
                .await
                .map_err(engine_err)?;
            Ok(id_response(id))
        }
        Command::DeleteSubscription { id } => {
            let deactivated = engine.unsubscribe(id).await.map_err(engine_err)?;
            Ok(Response::Execution(
                Tag::new("DELETE").with_rows(usize::from(deactivated)),
            ))
        }
        Command::SelectSubscriptions { user_id } => {
            let subs = engine.subscriptions_for_user(user_id).await;
            rows_response(subscription_schema(), &subs, encode_subscription)
        }
        Command::SelectNotifications { user_id } => {
            let pending = engine.pending_notifications(user_id).await;
            rows_response(notification_schema(), &pending, encode_notification)
        }
        Command::MarkNotificationsRead { user_id } => {
            let marked = engine.mark_read(user_id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("UPDATE").with_rows(marked)))
        }
        Command::SelectQuote {
            resource_id,
            start,
            end,
        } => {
            let quote = engine
                .quote(resource_id, start, end)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(quote_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(resource_id as i64))?;
            encoder.encode_field(&start)?;
            encoder.encode_field(&end)?;
            encoder.encode_field(&quote.duration_hours)?;
            encoder.encode_field(&quote.amount)?;
            let row = encoder.take_row();
            Ok(Response::Query(QueryResponse::new(
                schema,
                stream::iter(vec![Ok(row)]),
            )))
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows_response<T>(
    fields: Vec<FieldInfo>,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(fields);
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encode(&mut encoder, item)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn id_response(id: u64) -> Response {
    let schema = Arc::new(id_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder
        .encode_field(&(id as i64))
        .map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn id_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::INT8)]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("owner_id", Type::INT8),
        field("label", Type::VARCHAR),
        field("rate_hour", Type::FLOAT8),
        field("rate_day", Type::FLOAT8),
        field("active", Type::BOOL),
    ]
}

fn encode_resource(e: &mut DataRowEncoder, r: &Resource) -> PgWireResult<()> {
    e.encode_field(&(r.id as i64))?;
    e.encode_field(&(r.owner_id as i64))?;
    e.encode_field(&r.label)?;
    e.encode_field(&r.rate_hour)?;
    e.encode_field(&r.rate_day)?;
    e.encode_field(&r.active)
}

fn interval_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("resource_id", Type::INT8),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("booked", Type::BOOL),
        field("booked_by", Type::INT8),
        field("booked_at", Type::INT8),
    ]
}

fn encode_interval(e: &mut DataRowEncoder, i: &Interval) -> PgWireResult<()> {
    e.encode_field(&(i.id as i64))?;
    e.encode_field(&(i.resource_id as i64))?;
    e.encode_field(&i.span.start)?;
    e.encode_field(&i.span.end)?;
    e.encode_field(&i.booked)?;
    e.encode_field(&i.booked_by.map(|u| u as i64))?;
    e.encode_field(&i.booked_at)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("user_id", Type::INT8),
        field("resource_id", Type::INT8),
        field("interval_id", Type::INT8),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("total_price", Type::FLOAT8),
        field("duration_hours", Type::FLOAT8),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn encode_booking(e: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    e.encode_field(&(b.id as i64))?;
    e.encode_field(&(b.user_id as i64))?;
    e.encode_field(&(b.resource_id as i64))?;
    e.encode_field(&(b.interval_id as i64))?;
    e.encode_field(&b.span.start)?;
    e.encode_field(&b.span.end)?;
    e.encode_field(&b.total_price)?;
    e.encode_field(&b.duration_hours)?;
    e.encode_field(&b.status.as_str().to_string())?;
    e.encode_field(&b.payment_status.as_str().to_string())?;
    e.encode_field(&b.created_at)
}

fn subscription_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("user_id", Type::INT8),
        field("resource_id", Type::INT8),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("active", Type::BOOL),
    ]
}

fn encode_subscription(e: &mut DataRowEncoder, s: &Subscription) -> PgWireResult<()> {
    e.encode_field(&(s.id as i64))?;
    e.encode_field(&(s.user_id as i64))?;
    e.encode_field(&s.resource_id.map(|r| r as i64))?;
    e.encode_field(&s.span.start)?;
    e.encode_field(&s.span.end)?;
    e.encode_field(&s.active)
}

fn notification_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::INT8),
        field("user_id", Type::INT8),
        field("subscription_id", Type::INT8),
        field("resource_id", Type::INT8),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("text", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn encode_notification(e: &mut DataRowEncoder, n: &Notification) -> PgWireResult<()> {
    e.encode_field(&(n.id as i64))?;
    e.encode_field(&(n.user_id as i64))?;
    e.encode_field(&(n.subscription_id as i64))?;
    e.encode_field(&(n.resource_id as i64))?;
    e.encode_field(&n.window.start)?;
    e.encode_field(&n.window.end)?;
    e.encode_field(&n.text)?;
    e.encode_field(&n.created_at)
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::INT8),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("duration_hours", Type::FLOAT8),
        field("amount", Type::FLOAT8),
    ]
}

/// Row description for a statement, derived from its verb and table so it can
/// be answered before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| c == '"' || c == '(' || c == ';')
                .to_lowercase()
        })
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(String::as_str)
    };
    match words.first().map(String::as_str) {
        Some("select") => match after("from") {
            Some("resources" | "available_resources") => resource_schema(),
            Some("intervals" | "free_intervals") => interval_schema(),
            Some("bookings") => booking_schema(),
            Some("subscriptions") => subscription_schema(),
            Some("notifications") => notification_schema(),
            Some("quote") => quote_schema(),
            _ => vec![],
        },
        Some("insert") => match after("into") {
            Some("bookings") => booking_schema(),
            Some("resources" | "intervals" | "subscriptions") => id_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SpotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpotbookQueryParser;

#[async_trait]
impl QueryParser for SpotbookQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpotbookHandler {
    type Statement = String;
    type QueryParser = SpotbookQueryParser;

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
        let params: Vec<Option<String>> = portal
            .parameters
            .iter()
            .map(|p| p.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
            .collect();
        let sql = substitute_params(&portal.statement.statement, &params);
        self.run(&engine, &sql).await
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
            result_schema(&target.statement),
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
        )))
    }
}

/// Byte position, length and number of every `$N` placeholder.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let digits = bytes[i + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
            found.push((i, digits + 1, n));
        }
        i += digits + 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Replace `$1, $2, ...` with bound text parameters, quoted as literals.
fn substitute_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (pos, len, n) in placeholders(sql) {
        out.push_str(&sql[copied..pos]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(text)) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[pos..pos + len]),
        }
        copied = pos + len;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SpotbookFactory {
    handler: Arc<SpotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SpotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SpotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SpotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpotbookFactory {
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

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(..) => "P0002",
        EngineError::InvalidRange { .. }
        | EngineError::InvalidRate
        | EngineError::Overlapping(_)
        | EngineError::InUse(_) => "22023",
        EngineError::Conflict(_) => "40001",
        EngineError::Inactive(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
