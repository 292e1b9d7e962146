use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertClassroom {
        id: Ulid,
        room_name: String,
        building: Option<String>,
        capacity: u32,
    },
    InsertReservation(NewReservation),
    /// Admin decision or owner cancellation.
    SetReservationStatus {
        id: Ulid,
        status: ReservationStatus,
        acting_user: Option<String>,
    },
    EditReservation {
        id: Ulid,
        edit: ReservationEdit,
        acting_user: Option<String>,
    },
    SelectClassrooms,
    SelectReservations(ReservationFilter),
    SelectAvailability {
        classroom_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        exclude: Option<Ulid>,
    },
    SelectOccupiedSlots {
        classroom_id: Ulid,
        date: NaiveDate,
    },
    SelectAvailableClassrooms {
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    },
    SelectCanModify {
        id: Ulid,
        user_id: String,
    },
    /// A user's inbox, newest first.
    SelectNotifications {
        user_id: String,
        is_read: Option<bool>,
        limit: Option<usize>,
    },
    SelectUnreadCount {
        user_id: String,
    },
    MarkNotificationRead {
        id: Ulid,
    },
    MarkAllNotificationsRead {
        user_id: String,
    },
    DeleteNotification {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Equality filters on `SELECT * FROM reservations`; all given ones must match.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReservationFilter {
    pub id: Option<Ulid>,
    pub classroom_id: Option<Ulid>,
    pub user_id: Option<String>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.id.is_none_or(|id| r.id == id)
            && self.classroom_id.is_none_or(|c| r.classroom_id == c)
            && self.user_id.as_deref().is_none_or(|u| r.user_id == u)
            && self.status.is_none_or(|s| r.status == s)
    }
}

/// Virtual table a `SELECT` reads from, if the statement is one.
pub fn select_table(sql: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("select") {
        return None;
    }
    words
        .skip_while(|w| !w.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_lowercase())
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        return match rest {
            "*" => Ok(Command::UnlistenAll),
            _ => Ok(Command::Unlisten {
                channel: channel_name(rest)?,
            }),
        };
    }
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel_name(rest)?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace))
        .then(|| rest.trim())
}

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let name = raw.trim_matches('"');
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(SqlError::Parse(format!("bad channel name: {raw}")));
    }
    Ok(name.to_string())
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert, &table)?;

    match table.as_str() {
        "classrooms" => Ok(Command::InsertClassroom {
            id: row.optional("id", parse_ulid_or_null)?.flatten().unwrap_or_else(Ulid::new),
            room_name: row.required("room_name", parse_string)?,
            building: row.optional("building", parse_string_or_null)?.flatten(),
            capacity: row.optional("capacity", parse_u32)?.unwrap_or(0),
        }),
        "reservations" => Ok(Command::InsertReservation(NewReservation {
            id: row.optional("id", parse_ulid_or_null)?.flatten(),
            classroom_id: row.required("classroom_id", parse_ulid)?,
            user_id: row.required("user_id", parse_string)?,
            date: row.required("reservation_date", parse_date)?,
            start: row.required("start_time", parse_time)?,
            end: row.required("end_time", parse_time)?,
            purpose: row.optional("purpose", parse_string_or_null)?.flatten().unwrap_or_default(),
        })),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Default column order when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "classrooms" => &["id", "room_name", "building", "capacity"],
        "reservations" => &[
            "id",
            "classroom_id",
            "user_id",
            "reservation_date",
            "start_time",
            "end_time",
            "purpose",
        ],
        _ => &[],
    }
}

/// Single VALUES row keyed by lowercase column name.
struct Row {
    values: HashMap<String, Expr>,
}

impl Row {
    fn required<T>(&self, col: &'static str, parse: fn(&Expr) -> Result<T, SqlError>) -> Result<T, SqlError> {
        let expr = self.values.get(col).ok_or(SqlError::MissingColumn(col))?;
        parse(expr).map_err(|e| e.in_column(col))
    }

    fn optional<T>(&self, col: &'static str, parse: fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
        self.values
            .get(col)
            .map(|expr| parse(expr).map_err(|e| e.in_column(col)))
            .transpose()
    }
}

fn insert_row(insert: &ast::Insert, table: &str) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let values = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() || (!insert.columns.is_empty() && values.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), values.len()));
    }

    Ok(Row {
        values: columns.into_iter().zip(values.iter().cloned()).collect(),
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let set = assignment_map(assignments)?;
    let filters = equality_filters(selection)?;
    match table.as_str() {
        "reservations" => parse_reservation_update(&set, &filters),
        "notifications" => parse_notification_update(&set, &filters),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_map(assignments: &[ast::Assignment]) -> Result<HashMap<String, &Expr>, SqlError> {
    let mut set: HashMap<String, &Expr> = HashMap::new();
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(col, &assignment.value);
    }
    Ok(set)
}

fn parse_reservation_update(
    set: &HashMap<String, &Expr>,
    filters: &HashMap<String, &Expr>,
) -> Result<Command, SqlError> {
    let id = filters
        .get("id")
        .ok_or(SqlError::MissingFilter("id"))
        .and_then(|e| parse_ulid(e))?;
    let acting_user = filters.get("user_id").map(|e| parse_string(e)).transpose()?;

    if let Some(expr) = set.get("status") {
        if set.len() > 1 {
            return Err(SqlError::Unsupported(
                "status cannot be combined with other assignments".into(),
            ));
        }
        let raw = parse_string(expr)?;
        let status = ReservationStatus::parse(&raw)
            .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?;
        return match status {
            ReservationStatus::Approved | ReservationStatus::Rejected | ReservationStatus::Cancelled => {
                Ok(Command::SetReservationStatus { id, status, acting_user })
            }
            other => Err(SqlError::Unsupported(format!(
                "status {other} is managed by the server"
            ))),
        };
    }

    if let Some(col) = set
        .keys()
        .find(|c| !matches!(c.as_str(), "reservation_date" | "start_time" | "end_time" | "purpose"))
    {
        return Err(SqlError::Unsupported(format!("cannot set column {col}")));
    }
    let field = |col: &'static str| set.get(col).copied().ok_or(SqlError::MissingColumn(col));
    let edit = ReservationEdit {
        date: parse_date(field("reservation_date")?).map_err(|e| e.in_column("reservation_date"))?,
        start: parse_time(field("start_time")?).map_err(|e| e.in_column("start_time"))?,
        end: parse_time(field("end_time")?).map_err(|e| e.in_column("end_time"))?,
        purpose: set.get("purpose").map(|e| parse_string(e)).transpose()?,
    };
    Ok(Command::EditReservation { id, edit, acting_user })
}

/// `SET is_read = true`, for one notification by id or a whole inbox by
/// user_id.
fn parse_notification_update(
    set: &HashMap<String, &Expr>,
    filters: &HashMap<String, &Expr>,
) -> Result<Command, SqlError> {
    if let Some(col) = set.keys().find(|c| c.as_str() != "is_read") {
        return Err(SqlError::Unsupported(format!("cannot set column {col}")));
    }
    let value = set.get("is_read").ok_or(SqlError::MissingColumn("is_read"))?;
    if !parse_bool(value).map_err(|e| e.in_column("is_read"))? {
        return Err(SqlError::Unsupported("notifications can only be marked read".into()));
    }

    if let Some(expr) = filters.get("id") {
        return Ok(Command::MarkNotificationRead {
            id: parse_ulid(expr).map_err(|e| e.in_column("id"))?,
        });
    }
    match filters.get("user_id") {
        Some(expr) => Ok(Command::MarkAllNotificationsRead {
            user_id: parse_string(expr).map_err(|e| e.in_column("user_id"))?,
        }),
        None => Err(SqlError::MissingFilter("id")),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    let relation = match tables.as_slice() {
        [one] if delete.tables.is_empty() => &one.relation,
        _ => return Err(SqlError::Unsupported("multi-table DELETE".into())),
    };
    let table = table_factor_name(relation)?;
    if table != "notifications" {
        return Err(SqlError::Unsupported(format!("DELETE from {table}")));
    }
    let f = Filters(equality_filters(delete.selection.as_ref())?);
    Ok(Command::DeleteNotification {
        id: f.required("id", parse_ulid)?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let f = Filters(equality_filters(select.selection.as_ref())?);
    let limit = select_limit(query)?;
    if limit.is_some() && table != "notifications" {
        return Err(SqlError::Unsupported(format!("LIMIT on {table}")));
    }

    match table.as_str() {
        "classrooms" => Ok(Command::SelectClassrooms),
        "reservations" => Ok(Command::SelectReservations(ReservationFilter {
            id: f.optional("id", parse_ulid)?,
            classroom_id: f.optional("classroom_id", parse_ulid)?,
            user_id: f.optional("user_id", parse_string)?,
            status: f.optional("status", parse_status)?,
        })),
        "availability" => Ok(Command::SelectAvailability {
            classroom_id: f.required("classroom_id", parse_ulid)?,
            date: f.required("reservation_date", parse_date)?,
            start: f.required("start_time", parse_time)?,
            end: f.required("end_time", parse_time)?,
            exclude: f.optional("exclude_id", parse_ulid_or_null)?.flatten(),
        }),
        "occupied_slots" => Ok(Command::SelectOccupiedSlots {
            classroom_id: f.required("classroom_id", parse_ulid)?,
            date: f.required("reservation_date", parse_date)?,
        }),
        "available_classrooms" => Ok(Command::SelectAvailableClassrooms {
            date: f.required("reservation_date", parse_date)?,
            start: f.required("start_time", parse_time)?,
            end: f.required("end_time", parse_time)?,
        }),
        "can_modify" => Ok(Command::SelectCanModify {
            id: f.required("id", parse_ulid)?,
            user_id: f.required("user_id", parse_string)?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            user_id: f.required("user_id", parse_string)?,
            is_read: f.optional("is_read", parse_bool)?,
            limit,
        }),
        "unread_count" => Ok(Command::SelectUnreadCount {
            user_id: f.required("user_id", parse_string)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `LIMIT n`; OFFSET and the MySQL comma form are refused.
fn select_limit(query: &ast::Query) -> Result<Option<usize>, SqlError> {
    match &query.limit_clause {
        None => Ok(None),
        Some(LimitClause::LimitOffset {
            limit,
            offset: None,
            limit_by,
        }) if limit_by.is_empty() => limit
            .as_ref()
            .map(|e| parse_u32(e).map(|n| n as usize).map_err(|e| e.in_column("limit")))
            .transpose(),
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

struct Filters<'a>(HashMap<String, &'a Expr>);

impl Filters<'_> {
    fn required<T>(&self, col: &'static str, parse: fn(&Expr) -> Result<T, SqlError>) -> Result<T, SqlError> {
        let expr = self.0.get(col).ok_or(SqlError::MissingFilter(col))?;
        parse(expr).map_err(|e| e.in_column(col))
    }

    fn optional<T>(&self, col: &'static str, parse: fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
        self.0
            .get(col)
            .map(|expr| parse(expr).map_err(|e| e.in_column(col)))
            .transpose()
    }
}

/// Flatten `a = x AND b = y AND ...` into column → value.
fn equality_filters(selection: Option<&Expr>) -> Result<HashMap<String, &Expr>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(col, right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = HashMap::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

/// `YYYY-MM-DD`.
pub fn parse_date_str(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_time_str(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date_str(&s).ok_or_else(|| SqlError::Parse(format!("bad date {s}, expected YYYY-MM-DD")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    parse_time_str(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s}, expected HH:MM[:SS]")))
}

/// `true`/`false`, or their quoted forms as bound by the extended protocol.
fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(Value::Boolean(b)) = extract_value(expr) {
        return Ok(*b);
    }
    let s = parse_string(expr)?;
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" => Ok(true),
        "false" | "f" => Ok(false),
        _ => Err(SqlError::Parse(format!("bad boolean {s}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = parse_string(expr)?;
    ReservationStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl SqlError {
    fn in_column(self, col: &str) -> Self {
        match self {
            SqlError::Parse(msg) => SqlError::Parse(format!("{col}: {msg}")),
            other => other,
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
