use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{FamilyRequest, TrialRequest};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTeacher {
        id: Ulid,
        name: String,
        category: String,
    },
    /// Teacher publishes one calendar cell.
    InsertSlot {
        teacher_id: Ulid,
        key: SlotKey,
    },
    /// Teacher opts a cell out.
    DeleteSlot {
        teacher_id: Ulid,
        key: SlotKey,
    },
    InsertTrial(TrialRequest),
    InsertFamily(FamilyRequest),
    UpdateStatus {
        family: bool,
        id: Ulid,
        status: TrialStatus,
    },
    UpdateSchedule {
        family: bool,
        id: Ulid,
        key: SlotKey,
        reason: RescheduleReason,
    },
    InsertSession {
        occupant_id: Ulid,
        key: SlotKey,
    },
    CompleteSession {
        id: Ulid,
        actual_minutes: u32,
        notes: Option<String>,
    },
    SelectTeachers,
    SelectAvailability {
        teacher_id: Ulid,
        date: NaiveDate,
    },
    SelectHistory {
        student_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "teachers" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("teachers", 3, values.len()));
            }
            Ok(Command::InsertTeacher {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                category: parse_string(&values[2])?,
            })
        }
        "slots" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("slots", 3, values.len()));
            }
            Ok(Command::InsertSlot {
                teacher_id: parse_ulid(&values[0])?,
                key: SlotKey::new(parse_date(&values[1])?, parse_time(&values[2])?),
            })
        }
        // (name, age, phone, country, platform, category, sales_agent,
        //  supervisor, date, time[, notes])
        "trials" => {
            if values.len() < 10 {
                return Err(SqlError::WrongArity("trials", 10, values.len()));
            }
            Ok(Command::InsertTrial(TrialRequest {
                name: parse_string(&values[0])?,
                age: parse_u8_or_null(&values[1])?,
                phone: parse_string(&values[2])?,
                country: parse_string(&values[3])?,
                platform: parse_string(&values[4])?,
                category: parse_string(&values[5])?,
                sales_agent: parse_string(&values[6])?,
                supervisor: parse_string_or_null(&values[7])?,
                slot: SlotKey::new(parse_date(&values[8])?, parse_time(&values[9])?),
                notes: if values.len() >= 11 {
                    parse_string_or_null(&values[10])?
                } else {
                    None
                },
            }))
        }
        // (parent_name, phone, country, platform, category, sales_agent,
        //  date, time, members[, notes]) — members is a JSON array
        "families" => {
            if values.len() < 9 {
                return Err(SqlError::WrongArity("families", 9, values.len()));
            }
            let members: Vec<MemberSpec> = serde_json::from_str(&parse_string(&values[8])?)
                .map_err(|e| SqlError::Parse(format!("bad members JSON: {e}")))?;
            Ok(Command::InsertFamily(FamilyRequest {
                parent_name: parse_string(&values[0])?,
                phone: parse_string(&values[1])?,
                country: parse_string(&values[2])?,
                platform: parse_string(&values[3])?,
                category: parse_string(&values[4])?,
                sales_agent: parse_string(&values[5])?,
                slot: SlotKey::new(parse_date(&values[6])?, parse_time(&values[7])?),
                members,
                notes: if values.len() >= 10 {
                    parse_string_or_null(&values[9])?
                } else {
                    None
                },
            }))
        }
        "sessions" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("sessions", 3, values.len()));
            }
            Ok(Command::InsertSession {
                occupant_id: parse_ulid(&values[0])?,
                key: SlotKey::new(parse_date(&values[1])?, parse_time(&values[2])?),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "slots" => {
            let filters = collect_eq_filters(&delete.selection)?;
            Ok(Command::DeleteSlot {
                teacher_id: filter_ulid(&filters, "teacher_id")?,
                key: SlotKey::new(filter_date(&filters, "date")?, filter_time(&filters, "time")?),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;
    let set = |col: &str| -> Option<&Expr> {
        assignments
            .iter()
            .find(|a| assignment_column(a).as_deref() == Some(col))
            .map(|a| &a.value)
    };

    match table.as_str() {
        "trials" | "families" => {
            let family = table == "families";
            if let Some(status) = set("status") {
                let s = parse_string(status)?;
                let status = s
                    .parse::<TrialStatus>()
                    .map_err(|()| SqlError::Parse(format!("unknown status: {s}")))?;
                return Ok(Command::UpdateStatus { family, id, status });
            }
            let (Some(date), Some(time)) = (set("date"), set("time")) else {
                return Err(SqlError::MissingColumn("status or date+time"));
            };
            let reason = set("reason").ok_or(SqlError::MissingColumn("reason"))?;
            let r = parse_string(reason)?;
            Ok(Command::UpdateSchedule {
                family,
                id,
                key: SlotKey::new(parse_date(date)?, parse_time(time)?),
                reason: r
                    .parse::<RescheduleReason>()
                    .map_err(|()| SqlError::Parse(format!("unknown reason: {r}")))?,
            })
        }
        "sessions" => {
            let minutes = set("actual_minutes").ok_or(SqlError::MissingColumn("actual_minutes"))?;
            Ok(Command::CompleteSession {
                id,
                actual_minutes: parse_u32(minutes)?,
                notes: match set("notes") {
                    Some(expr) => parse_string_or_null(expr)?,
                    None => None,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "teachers" => Ok(Command::SelectTeachers),
        "availability" => {
            let filters = collect_eq_filters(&select.selection)?;
            Ok(Command::SelectAvailability {
                teacher_id: filter_ulid(&filters, "teacher_id")?,
                date: filter_date(&filters, "date")?,
            })
        }
        "history" => {
            let filters = collect_eq_filters(&select.selection)?;
            Ok(Command::SelectHistory {
                student_id: filter_ulid(&filters, "student_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn assignment_column(assignment: &ast::Assignment) -> Option<String> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        ast::AssignmentTarget::Tuple(_) => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Flatten a WHERE clause of `col = value [AND ...]` into (column, value)
/// pairs. Anything other than Eq under And is rejected.
fn collect_eq_filters(selection: &Option<Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut filters = Vec::new();
    if let Some(expr) = selection {
        collect_eq_into(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq_into(expr: &Expr, filters: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_into(left, filters)?;
            collect_eq_into(right, filters)?;
            Ok(())
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left:?}")))?;
            filters.push((col, (**right).clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_into(inner, filters),
        other => Err(SqlError::Parse(format!("unsupported filter: {other:?}"))),
    }
}

fn find_filter<'a>(filters: &'a [(String, Expr)], col: &str) -> Result<&'a Expr, SqlError> {
    filters
        .iter()
        .find(|(c, _)| c == col)
        .map(|(_, e)| e)
        .ok_or(SqlError::MissingFilter(match col {
            "teacher_id" => "teacher_id",
            "student_id" => "student_id",
            "date" => "date",
            "time" => "time",
            _ => "id",
        }))
}

fn filter_ulid(filters: &[(String, Expr)], col: &str) -> Result<Ulid, SqlError> {
    parse_ulid_expr(find_filter(filters, col)?)
}

fn filter_date(filters: &[(String, Expr)], col: &str) -> Result<NaiveDate, SqlError> {
    parse_date(find_filter(filters, col)?)
}

fn filter_time(filters: &[(String, Expr)], col: &str) -> Result<NaiveTime, SqlError> {
    parse_time(find_filter(filters, col)?)
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

/// Dates come in as `'YYYY-MM-DD'` strings (or `DATE '...'` literals,
/// which sqlparser surfaces as typed strings).
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = match expr {
        Expr::TypedString(ast::TypedString { value, .. }) => match &value.value {
            Value::SingleQuotedString(s) => s.clone(),
            other => return Err(SqlError::Parse(format!("expected date string, got {other:?}"))),
        },
        _ => parse_string(expr)?,
    };
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Times are `'HH:MM'` (seconds tolerated and truncated).
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = match expr {
        Expr::TypedString(ast::TypedString { value, .. }) => match &value.value {
            Value::SingleQuotedString(s) => s.clone(),
            other => return Err(SqlError::Parse(format!("expected time string, got {other:?}"))),
        },
        _ => parse_string(expr)?,
    };
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8_or_null(expr: &Expr) -> Result<Option<u8>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u8::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing SET column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
