use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use ulid::Ulid;

use crate::auth::ClassroomAuthSource;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_SUBSCRIPTIONS_PER_CONNECTION;
use crate::model::*;
use crate::notify::{RESERVATIONS_CHANNEL, normalize_channel};
use crate::observability;
use crate::sql::{self, Command, ReservationFilter, SqlError};
use crate::tenant::TenantManager;

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ClassroomFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Subscriptions live on the handler, so a handler serves exactly one
/// connection.
pub struct ClassroomHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ClassroomQueryParser>,
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<String>>>,
}

impl ClassroomHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ClassroomQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Push every notice queued for this connection's subscriptions.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut subs = self.subscriptions.lock().await;
            let mut pending = Vec::new();
            subs.retain(|channel, rx| loop {
                match rx.try_recv() {
                    Ok(payload) => pending.push((channel.clone(), payload)),
                    Err(broadcast::error::TryRecvError::Empty) => break true,
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        tracing::warn!("listener on {channel} lagged, {n} notices dropped");
                    }
                    Err(broadcast::error::TryRecvError::Closed) => break false,
                }
            });
            pending
        };

        let pid = std::process::id() as i32;
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(pid, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }

    /// Parse, run and record metrics for one statement.
    async fn run_statement(&self, engine: &Engine, sql_text: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertClassroom {
                id,
                room_name,
                building,
                capacity,
            } => {
                engine
                    .create_classroom(id, room_name, building, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertReservation(req) => {
                engine.create_reservation(req).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SetReservationStatus {
                id,
                status,
                acting_user,
            } => {
                let result = match status {
                    ReservationStatus::Approved => engine.approve_reservation(id).await,
                    ReservationStatus::Rejected => engine.reject_reservation(id).await,
                    ReservationStatus::Cancelled => {
                        engine.cancel_reservation(id, acting_user.as_deref()).await
                    }
                    other => {
                        return Err(sql_err(SqlError::Unsupported(format!(
                            "status {other} is managed by the server"
                        ))));
                    }
                };
                result.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::EditReservation {
                id,
                edit,
                acting_user,
            } => {
                engine
                    .update_reservation(id, edit, acting_user.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectClassrooms => {
                let rooms = engine.list_classrooms().await;
                Ok(vec![classroom_rows(rooms)])
            }
            Command::SelectReservations(filter) => {
                let rows = fetch_reservations(engine, &filter).await?;
                Ok(vec![reservation_rows(rows)])
            }
            Command::SelectAvailability {
                classroom_id,
                date,
                start,
                end,
                exclude,
            } => {
                let available = engine
                    .is_available(classroom_id, date, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![bool_row("available", available)])
            }
            Command::SelectOccupiedSlots { classroom_id, date } => {
                let rows = engine
                    .occupied_slots(classroom_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(rows)])
            }
            Command::SelectAvailableClassrooms { date, start, end } => {
                let rooms = engine
                    .available_classrooms(date, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![classroom_rows(rooms)])
            }
            Command::SelectCanModify { id, user_id } => {
                let allowed = engine.can_modify(id, &user_id).await;
                Ok(vec![bool_row("can_modify", allowed)])
            }
            Command::SelectNotifications {
                user_id,
                is_read,
                limit,
            } => {
                let rows = match is_read {
                    Some(true) => {
                        let mut read: Vec<Notification> = engine
                            .user_notifications(&user_id, false, None)
                            .await
                            .into_iter()
                            .filter(|n| n.is_read)
                            .collect();
                        read.truncate(limit.unwrap_or(usize::MAX));
                        read
                    }
                    _ => {
                        engine
                            .user_notifications(&user_id, is_read == Some(false), limit)
                            .await
                    }
                };
                Ok(vec![notification_rows(rows)])
            }
            Command::SelectUnreadCount { user_id } => {
                let count = engine.unread_count(&user_id).await;
                Ok(vec![count_row(count)])
            }
            Command::MarkNotificationRead { id } => {
                engine.mark_notification_read(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::MarkAllNotificationsRead { user_id } => {
                let changed = engine
                    .mark_all_notifications_read(&user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(changed))])
            }
            Command::DeleteNotification { id } => {
                engine.delete_notification(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::Listen { channel } => {
                let channel = validate_channel(&channel)?;
                let mut subs = self.subscriptions.lock().await;
                if !subs.contains_key(&channel) {
                    if subs.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION {
                        return Err(user_error(
                            "54000",
                            format!("too many subscriptions (max {MAX_SUBSCRIPTIONS_PER_CONNECTION})"),
                        ));
                    }
                    let rx = engine.notify.subscribe(&channel);
                    subs.insert(channel, rx);
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let channel = normalize_channel(&channel);
                let removed = self.subscriptions.lock().await.remove(&channel);
                if removed.is_some() {
                    drop(removed);
                    engine.notify.remove_if_idle(&channel);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                let drained: Vec<String> = {
                    let mut subs = self.subscriptions.lock().await;
                    subs.drain().map(|(channel, _)| channel).collect()
                };
                for channel in drained {
                    engine.notify.remove_if_idle(&channel);
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// `reservations` or `classroom_<ulid>`, lowercased.
fn validate_channel(raw: &str) -> PgWireResult<String> {
    let channel = normalize_channel(raw);
    if channel == RESERVATIONS_CHANNEL {
        return Ok(channel);
    }
    let valid = channel
        .strip_prefix("classroom_")
        .is_some_and(|id| Ulid::from_string(id).is_ok());
    if valid {
        Ok(channel)
    } else {
        Err(user_error(
            "42000",
            format!("invalid channel: {raw} (expected reservations or classroom_{{id}})"),
        ))
    }
}

/// Pick the narrowest engine query for the filter, then apply the rest.
async fn fetch_reservations(
    engine: &Engine,
    filter: &ReservationFilter,
) -> PgWireResult<Vec<Reservation>> {
    let candidates = if let Some(id) = filter.id {
        engine.get_reservation(id).await.into_iter().collect()
    } else if let Some(classroom_id) = filter.classroom_id {
        engine
            .classroom_reservations(classroom_id)
            .await
            .map_err(engine_err)?
    } else if let Some(user_id) = filter.user_id.as_deref() {
        engine.user_reservations(user_id).await
    } else if let Some(status) = filter.status {
        engine.reservations_by_status(status).await
    } else {
        engine.all_reservations().await
    };
    Ok(candidates.into_iter().filter(|r| filter.matches(r)).collect())
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn classroom_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("room_name", Type::VARCHAR),
        text_field("building", Type::VARCHAR),
        text_field("capacity", Type::INT4),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    [
        "id",
        "classroom_id",
        "user_id",
        "reservation_date",
        "start_time",
        "end_time",
        "purpose",
        "status",
        "created_at",
    ]
    .into_iter()
    .map(|name| text_field(name, Type::VARCHAR))
    .collect()
}

fn notification_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("message", Type::VARCHAR),
        text_field("reservation_id", Type::VARCHAR),
        text_field("is_read", Type::BOOL),
        text_field("created_at", Type::VARCHAR),
    ]
}

fn bool_schema(column: &str) -> Vec<FieldInfo> {
    vec![text_field(column, Type::BOOL)]
}

fn count_schema() -> Vec<FieldInfo> {
    vec![text_field("count", Type::INT8)]
}

/// Result columns for a SELECT, by the virtual table it reads.
fn schema_for(sql_text: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql_text).as_deref() {
        Some("classrooms" | "available_classrooms") => classroom_schema(),
        Some("reservations" | "occupied_slots") => reservation_schema(),
        Some("availability") => bool_schema("available"),
        Some("can_modify") => bool_schema("can_modify"),
        Some("notifications") => notification_schema(),
        Some("unread_count") => count_schema(),
        _ => vec![],
    }
}

fn classroom_rows(rooms: Vec<ClassroomInfo>) -> Response {
    let schema = Arc::new(classroom_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .into_iter()
        .map(|room| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.room_name)?;
            encoder.encode_field(&room.building)?;
            encoder.encode_field(&(room.capacity as i32))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(reservations: Vec<Reservation>) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.classroom_id.to_string())?;
            encoder.encode_field(&r.user_id)?;
            encoder.encode_field(&r.date.format("%Y-%m-%d").to_string())?;
            encoder.encode_field(&r.slot.start.format("%H:%M:%S").to_string())?;
            encoder.encode_field(&r.slot.end.format("%H:%M:%S").to_string())?;
            encoder.encode_field(&r.purpose)?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.created_at.format("%Y-%m-%d %H:%M:%S").to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn notification_rows(notifications: Vec<Notification>) -> Response {
    let schema = Arc::new(notification_schema());
    let rows: Vec<PgWireResult<_>> = notifications
        .into_iter()
        .map(|n| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&n.id.to_string())?;
            encoder.encode_field(&n.user_id)?;
            encoder.encode_field(&n.message)?;
            encoder.encode_field(&n.reservation_id.map(|id| id.to_string()))?;
            encoder.encode_field(&n.is_read)?;
            encoder.encode_field(&n.created_at.format("%Y-%m-%d %H:%M:%S").to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn count_row(count: usize) -> Response {
    let schema = Arc::new(count_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder.encode_field(&(count as i64)).map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn bool_row(column: &str, value: bool) -> Response {
    let schema = Arc::new(bool_schema(column));
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encoder.encode_field(&value).map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for ClassroomHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        self.run_statement(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClassroomQueryParser;

#[async_trait]
impl QueryParser for ClassroomQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ClassroomHandler {
    type Statement = String;
    type QueryParser = ClassroomQueryParser;

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
        self.flush_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        let sql_text = substitute_params(portal);
        self.run_statement(&engine, &sql_text)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// (byte range, N). The delimiters are ASCII, so every range falls on a
/// char boundary.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled '' closes and reopens, which leaves us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    out.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    out
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

fn sql_literal(param: &Option<bytes::Bytes>) -> String {
    match param {
        Some(raw) => format!("'{}'", String::from_utf8_lossy(raw).replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

/// Inline text-format parameters as SQL literals in a single pass, so a
/// bound value is never scanned for placeholders itself.
fn bind_params(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        out.push_str(&sql_literal(param));
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClassroomFactory {
    handler: Arc<ClassroomHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ClassroomAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ClassroomFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(ClassroomHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ClassroomAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClassroomFactory {
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

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// Slot conflicts map to `exclusion_violation`.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
