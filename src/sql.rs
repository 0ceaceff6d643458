use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;
use crate::timestamp;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: String,
        capacity: u32,
        hourly_rate: Decimal,
        status: ResourceStatus,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertBooking {
        resource_id: Ulid,
        requester_id: Ulid,
        start: Ms,
        end: Ms,
        notes: Option<String>,
    },
    CancelBooking {
        id: Ulid,
        actor: Actor,
    },
    InsertBlock {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
        created_by: Ulid,
    },
    DeleteBlock {
        id: Ulid,
        actor_id: Ulid,
    },
    SelectResources,
    SelectBookings {
        resource_id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBlocks {
        resource_id: Ulid,
    },
    SelectSlot {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectGaps {
        start: NaiveDate,
        end: NaiveDate,
        min_nights: u32,
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
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table whose rows a statement returns, if it returns any. Works on
/// statements that still carry `$n` placeholders.
pub fn result_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let table = match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => table_factor_name(&select.from.first()?.relation).ok()?,
            _ => return None,
        },
        Statement::Insert(insert) => insert_table_name(insert).ok().filter(|t| t != "resources")?,
        Statement::Delete(delete) => delete_table_name(delete).ok().filter(|t| t == "bookings")?,
        _ => return None,
    };
    Some(table)
}

/// Values are positional in the column order each table documents; the
/// column list in the statement is not consulted.
fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        // (id, name, capacity, hourly_rate, status)
        "resources" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("resources", 2, values.len()));
            }
            Ok(Command::InsertResource {
                id: parse_ulid_expr(&values[0])?,
                name: parse_text(&values[1])?,
                capacity: values.get(2).map(parse_u32).transpose()?.unwrap_or(1),
                hourly_rate: values.get(3).map(parse_decimal).transpose()?.unwrap_or(Decimal::ZERO),
                status: values
                    .get(4)
                    .map(parse_status)
                    .transpose()?
                    .unwrap_or(ResourceStatus::Available),
            })
        }
        // (resource_id, requester_id, start, "end", notes)
        "bookings" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("bookings", 4, values.len()));
            }
            Ok(Command::InsertBooking {
                resource_id: parse_ulid_expr(&values[0])?,
                requester_id: parse_ulid_expr(&values[1])?,
                start: parse_instant_expr(&values[2])?,
                end: parse_instant_expr(&values[3])?,
                notes: values.get(4).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        // (resource_id, start, "end", reason, created_by)
        "blocks" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("blocks", 5, values.len()));
            }
            Ok(Command::InsertBlock {
                resource_id: parse_ulid_expr(&values[0])?,
                start: parse_instant_expr(&values[1])?,
                end: parse_instant_expr(&values[2])?,
                reason: parse_text_or_null(&values[3])?,
                created_by: parse_ulid_expr(&values[4])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;
    let id = parse_ulid_expr(filters.require("id", BinaryOperator::Eq)?)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "bookings" => {
            let actor_id = parse_ulid_expr(filters.require("actor_id", BinaryOperator::Eq)?)?;
            let is_admin = filters
                .get("is_admin", BinaryOperator::Eq)
                .map(parse_bool)
                .transpose()?
                .unwrap_or(false);
            Ok(Command::CancelBooking {
                id,
                actor: Actor {
                    id: actor_id,
                    is_admin,
                },
            })
        }
        "blocks" => Ok(Command::DeleteBlock {
            id,
            actor_id: parse_ulid_expr(filters.require("actor_id", BinaryOperator::Eq)?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "bookings" => {
            if let Some(id) = filters.get("id", BinaryOperator::Eq) {
                return Ok(Command::SelectBooking {
                    id: parse_ulid_expr(id)?,
                });
            }
            Ok(Command::SelectBookings {
                resource_id: parse_ulid_expr(filters.require("resource_id", BinaryOperator::Eq)?)?,
            })
        }
        "blocks" => Ok(Command::SelectBlocks {
            resource_id: parse_ulid_expr(filters.require("resource_id", BinaryOperator::Eq)?)?,
        }),
        "slots" => {
            let (resource_id, start, end) = window_filters(&filters)?;
            Ok(Command::SelectSlot { resource_id, start, end })
        }
        "availability" => {
            let (resource_id, start, end) = window_filters(&filters)?;
            Ok(Command::SelectAvailability {
                resource_id,
                start,
                end,
                min_duration: filters
                    .get("min_duration", BinaryOperator::Eq)
                    .map(parse_i64_expr)
                    .transpose()?,
            })
        }
        "gaps" => Ok(Command::SelectGaps {
            start: parse_date_expr(filters.require("start", BinaryOperator::GtEq)?)?,
            end: parse_date_expr(filters.require("end", BinaryOperator::LtEq)?)?,
            min_nights: filters
                .get("min_nights", BinaryOperator::Eq)
                .map(parse_u32)
                .transpose()?
                .unwrap_or(1),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn window_filters(filters: &Filters<'_>) -> Result<(Ulid, Ms, Ms), SqlError> {
    Ok((
        parse_ulid_expr(filters.require("resource_id", BinaryOperator::Eq)?)?,
        parse_instant_expr(filters.require("start", BinaryOperator::GtEq)?)?,
        parse_instant_expr(filters.require("end", BinaryOperator::LtEq)?)?,
    ))
}

/// `column <op> value` terms of a WHERE clause made only of ANDs.
struct Filters<'a> {
    terms: Vec<(String, BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn get(&self, column: &str, op: BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(col, o, _)| col == column && *o == op)
            .map(|(_, _, value)| *value)
    }

    fn require(&self, column: &'static str, op: BinaryOperator) -> Result<&'a Expr, SqlError> {
        self.get(column, op).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_terms<'a>(expr: &'a Expr, terms: &mut Vec<(String, BinaryOperator, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, terms),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_terms(left, terms)?;
            collect_terms(right, terms)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            terms.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

/// A string literal, or a bare number rendered as text.
fn scalar_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.as_str()),
        Some(value) => Err(SqlError::Parse(format!("expected string or number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = scalar_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = scalar_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

/// Unix milliseconds, RFC 3339, or a zone-less ISO timestamp read as UTC.
fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if matches!(expr, Expr::UnaryOp { .. }) {
        return parse_i64_expr(expr);
    }
    let s = scalar_text(expr)?;
    timestamp::parse_instant(s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s:?}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = scalar_text(expr)?;
    timestamp::parse_date(s).ok_or_else(|| SqlError::Parse(format!("bad date: {s:?}")))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_decimal(expr)?);
    }
    let s = scalar_text(expr)?;
    Decimal::from_str(s.trim()).map_err(|e| SqlError::Parse(format!("bad decimal {s:?}: {e}")))
}

fn parse_status(expr: &Expr) -> Result<ResourceStatus, SqlError> {
    ResourceStatus::from_str(scalar_text(expr)?).map_err(SqlError::Parse)
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
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

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
