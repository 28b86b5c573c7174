use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Which bookings a `SELECT * FROM bookings` asks for.
#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    Id(BookingId),
    User(UserId),
    Resource(ResourceId),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        owner_id: UserId,
        label: String,
        rate_hour: f64,
        rate_day: f64,
    },
    /// Any combination of rate and activation changes on one resource.
    UpdateResource {
        id: ResourceId,
        rate_hour: Option<f64>,
        rate_day: Option<f64>,
        active: Option<bool>,
    },
    SelectResources {
        id: Option<ResourceId>,
    },
    InsertInterval {
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    },
    DeleteInterval {
        id: IntervalId,
    },
    SelectIntervals {
        resource_id: ResourceId,
        range: Option<(Ms, Ms)>,
    },
    SelectFreeIntervals {
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    },
    SelectAvailableResources {
        start: Ms,
        end: Ms,
    },
    InsertBooking {
        user_id: UserId,
        resource_id: ResourceId,
        interval_id: IntervalId,
        start: Ms,
        end: Ms,
    },
    DeleteBooking {
        id: BookingId,
    },
    UpdatePaymentStatus {
        id: BookingId,
        status: PaymentStatus,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    InsertSubscription {
        user_id: UserId,
        resource_id: Option<ResourceId>,
        start: Ms,
        end: Ms,
    },
    DeleteSubscription {
        id: SubscriptionId,
    },
    SelectSubscriptions {
        user_id: UserId,
    },
    SelectNotifications {
        user_id: UserId,
    },
    MarkNotificationsRead {
        user_id: UserId,
    },
    SelectQuote {
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row; looks values up by column name when the statement lists
/// columns, by position otherwise.
struct InsertRow {
    table: &'static str,
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn get(&self, name: &str, pos: usize) -> Result<&Expr, SqlError> {
        let idx = if self.columns.is_empty() {
            Some(pos)
        } else {
            self.columns.iter().position(|c| c == name)
        };
        idx.and_then(|i| self.values.get(i))
            .ok_or(SqlError::MissingColumn(self.table, name.to_string()))
    }

    fn get_opt(&self, name: &str, pos: usize) -> Option<&Expr> {
        self.get(name, pos).ok()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, expected): (&'static str, usize) = match table.as_str() {
        "resources" => ("resources", 4),
        "intervals" => ("intervals", 3),
        "bookings" => ("bookings", 5),
        "subscriptions" => ("subscriptions", 4),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = InsertRow {
        table,
        columns: insert.columns.iter().map(|c| c.value.to_lowercase()).collect(),
        values: extract_single_row(insert)?,
    };
    if row.columns.is_empty() && row.values.len() < expected {
        return Err(SqlError::WrongArity(table, expected, row.values.len()));
    }

    match table {
        "resources" => Ok(Command::InsertResource {
            owner_id: parse_u64(row.get("owner_id", 0)?)?,
            label: parse_string(row.get("label", 1)?)?,
            rate_hour: parse_f64(row.get("rate_hour", 2)?)?,
            rate_day: parse_f64(row.get("rate_day", 3)?)?,
        }),
        "intervals" => Ok(Command::InsertInterval {
            resource_id: parse_u64(row.get("resource_id", 0)?)?,
            start: parse_i64(row.get("start", 1)?)?,
            end: parse_i64(row.get("end", 2)?)?,
        }),
        "bookings" => Ok(Command::InsertBooking {
            user_id: parse_u64(row.get("user_id", 0)?)?,
            resource_id: parse_u64(row.get("resource_id", 1)?)?,
            interval_id: parse_u64(row.get("interval_id", 2)?)?,
            start: parse_i64(row.get("start", 3)?)?,
            end: parse_i64(row.get("end", 4)?)?,
        }),
        _ => Ok(Command::InsertSubscription {
            user_id: parse_u64(row.get("user_id", 0)?)?,
            resource_id: match row.get_opt("resource_id", 1) {
                Some(expr) => parse_u64_or_null(expr)?,
                None => None,
            },
            start: parse_i64(row.get("start", 2)?)?,
            end: parse_i64(row.get("end", 3)?)?,
        }),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = where_id(&delete.selection)?;

    match table.as_str() {
        "intervals" => Ok(Command::DeleteInterval { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "subscriptions" => Ok(Command::DeleteSubscription { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut set = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }

    match table.as_str() {
        "resources" => {
            let id = where_id(selection)?;
            let (mut rate_hour, mut rate_day, mut active) = (None, None, None);
            for (column, value) in set {
                match column.as_str() {
                    "rate_hour" => rate_hour = Some(parse_f64(value)?),
                    "rate_day" => rate_day = Some(parse_f64(value)?),
                    "active" => active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn("resources", column)),
                }
            }
            Ok(Command::UpdateResource {
                id,
                rate_hour,
                rate_day,
                active,
            })
        }
        "bookings" => {
            let id = where_id(selection)?;
            match set.as_slice() {
                [(column, value)] if column == "payment_status" => {
                    let s = parse_string(value)?;
                    let status = PaymentStatus::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("bad payment status: {s}")))?;
                    Ok(Command::UpdatePaymentStatus { id, status })
                }
                _ => Err(SqlError::Unsupported(
                    "bookings: only payment_status can be updated".into(),
                )),
            }
        }
        "notifications" => {
            let filters = Filters::collect(selection)?;
            let user_id = filters.require_u64("user_id", &BinaryOperator::Eq)?;
            match set.as_slice() {
                [(column, value)] if column == "read" && parse_bool(value)? => {
                    Ok(Command::MarkNotificationsRead { user_id })
                }
                _ => Err(SqlError::Unsupported(
                    "notifications: only SET read = true is supported".into(),
                )),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let f = Filters::collect(&select.selection)?;
    use BinaryOperator::{Eq, Gt, GtEq, Lt, LtEq};

    match table.as_str() {
        "resources" => Ok(Command::SelectResources {
            id: f.opt_u64("id", &Eq)?,
        }),
        "intervals" => {
            // Overlap with [a, b) is spelled `start < b AND "end" > a`.
            if f.opt_i64("start", &GtEq)?.is_some() || f.opt_i64("end", &LtEq)?.is_some() {
                return Err(SqlError::Unsupported(
                    r#"interval range filter, use start < b AND "end" > a"#.into(),
                ));
            }
            let range = match (f.opt_i64("end", &Gt)?, f.opt_i64("start", &Lt)?) {
                (Some(a), Some(b)) => Some((a, b)),
                (None, None) => None,
                (Some(_), None) => return Err(SqlError::MissingFilter("start")),
                (None, Some(_)) => return Err(SqlError::MissingFilter("end")),
            };
            Ok(Command::SelectIntervals {
                resource_id: f.require_u64("resource_id", &Eq)?,
                range,
            })
        }
        "free_intervals" => Ok(Command::SelectFreeIntervals {
            resource_id: f.require_u64("resource_id", &Eq)?,
            start: f.require_i64("start", &LtEq)?,
            end: f.require_i64("end", &GtEq)?,
        }),
        "available_resources" => Ok(Command::SelectAvailableResources {
            start: f.require_i64("start", &LtEq)?,
            end: f.require_i64("end", &GtEq)?,
        }),
        "bookings" => {
            let filter = if let Some(id) = f.opt_u64("id", &Eq)? {
                BookingFilter::Id(id)
            } else if let Some(user_id) = f.opt_u64("user_id", &Eq)? {
                BookingFilter::User(user_id)
            } else if let Some(rid) = f.opt_u64("resource_id", &Eq)? {
                BookingFilter::Resource(rid)
            } else {
                return Err(SqlError::MissingFilter("id, user_id or resource_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "subscriptions" => Ok(Command::SelectSubscriptions {
            user_id: f.require_u64("user_id", &Eq)?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            user_id: f.require_u64("user_id", &Eq)?,
        }),
        "quote" => Ok(Command::SelectQuote {
            resource_id: f.require_u64("resource_id", &Eq)?,
            start: f.require_i64("start", &Eq)?,
            end: f.require_i64("end", &Eq)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of `column <op> value` comparisons from a WHERE clause.
struct Filters<'a>(Vec<(String, BinaryOperator, &'a Expr)>);

impl<'a> Filters<'a> {
    fn collect(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut out = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut out)?;
        }
        Ok(Self(out))
    }

    fn find(&self, column: &str, op: &BinaryOperator) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == column && o == op)
            .map(|(_, _, e)| *e)
    }

    fn opt_u64(&self, column: &str, op: &BinaryOperator) -> Result<Option<u64>, SqlError> {
        self.find(column, op).map(parse_u64).transpose()
    }

    fn opt_i64(&self, column: &str, op: &BinaryOperator) -> Result<Option<i64>, SqlError> {
        self.find(column, op).map(parse_i64).transpose()
    }

    fn require_u64(&self, column: &'static str, op: &BinaryOperator) -> Result<u64, SqlError> {
        self.opt_u64(column, op)?.ok_or(SqlError::MissingFilter(column))
    }

    fn require_i64(&self, column: &'static str, op: &BinaryOperator) -> Result<i64, SqlError> {
        self.opt_i64(column, op)?.ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => match expr_column_name(left) {
            Some(column) => {
                out.push((column, op.clone(), right.as_ref()));
                Ok(())
            }
            None => Err(SqlError::Unsupported(format!("filter: {expr}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter: {expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_single_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn where_id(selection: &Option<Expr>) -> Result<u64, SqlError> {
    Filters::collect(selection)?.require_u64("id", &BinaryOperator::Eq)
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

/// Numeric literal text, with a leading minus folded in. Quoted numbers are
/// accepted since extended-protocol parameters arrive as strings.
fn numeric_text(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(format!("-{}", numeric_text(expr)?));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = numeric_text(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let s = numeric_text(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad id {s}: {e}")))
}

fn parse_u64_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_u64(expr).map(Some),
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let s = numeric_text(expr)?;
    s.parse()
        .map_err(|e| SqlError::Parse(format!("bad number {s}: {e}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, String),
    ReadOnlyColumn(&'static str, String),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::ReadOnlyColumn(t, c) => write!(f, "{t}: column {c} cannot be updated"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
