use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_FREQUENCY_HZ;
use crate::model::*;
use crate::units;

/// Optional `start >= .. AND "end" <= ..` bounds; missing bounds mean the band edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeFilter {
    pub start: Option<Hz>,
    pub end: Option<Hz>,
}

impl RangeFilter {
    pub fn within(&self, band: &Band) -> ChannelRange {
        ChannelRange::new(self.start.unwrap_or(band.from), self.end.unwrap_or(band.to))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccupancyFilter {
    All,
    Range(ChannelRange),
    Holder(String),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBand {
        id: Ulid,
        name: String,
        from: Hz,
        to: Hz,
        spacing: Hz,
    },
    DeleteBand {
        id: Ulid,
    },
    SelectBands {
        id: Option<Ulid>,
    },
    /// Allocate-all (no count column) or allocate-first-N.
    Allocate {
        request: AllocationRequest,
        holder: Holder,
    },
    PreviewSpaced {
        band_id: Ulid,
        range: RangeFilter,
        count: usize,
        fine_spacing: Hz,
    },
    Confirm {
        values: Vec<Hz>,
        holder: Holder,
    },
    Deallocate {
        band_id: Ulid,
        range: RangeFilter,
        holder: String,
    },
    Debar {
        band_id: Ulid,
        range: RangeFilter,
    },
    Allow {
        band_id: Ulid,
        range: RangeFilter,
    },
    ReleaseChannel {
        value: Hz,
    },
    ReleaseHolder {
        holder: String,
    },
    SelectAvailable {
        band_id: Ulid,
        range: RangeFilter,
    },
    SelectChannels {
        band_id: Ulid,
        range: RangeFilter,
    },
    SelectOccupancy {
        filter: OccupancyFilter,
    },
    SelectHistory {
        value: Hz,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const BAND_COLUMNS: &[&str] = &["id", "name", "from", "to", "spacing"];
const ALLOCATION_COLUMNS: &[&str] = &[
    "band_id", "start", "end", "holder", "contact", "latitude", "longitude", "count",
];
const OCCUPANCY_COLUMNS: &[&str] = &["value", "holder", "contact", "latitude", "longitude"];
const DEBARRED_COLUMNS: &[&str] = &["band_id", "start", "end"];

/// One VALUES row keyed by column name.
struct Row<'a> {
    columns: Vec<String>,
    values: &'a [Expr],
}

impl Row<'_> {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn holder(&self) -> Result<Holder, SqlError> {
        let latitude = self.get("latitude").map(parse_f64).transpose()?.unwrap_or(0.0);
        let longitude = self.get("longitude").map(parse_f64).transpose()?.unwrap_or(0.0);
        Ok(Holder::new(
            parse_text(self.require("holder")?)?,
            parse_text(self.require("contact")?)?,
            Location::new(latitude, longitude),
        ))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (columns, rows) = match table.as_str() {
        "bands" => insert_rows(insert, "bands", BAND_COLUMNS)?,
        "allocations" => insert_rows(insert, "allocations", ALLOCATION_COLUMNS)?,
        "occupancy" => insert_rows(insert, "occupancy", OCCUPANCY_COLUMNS)?,
        "debarred" => insert_rows(insert, "debarred", DEBARRED_COLUMNS)?,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let rows: Vec<Row<'_>> = rows
        .iter()
        .map(|values| Row {
            columns: columns.clone(),
            values,
        })
        .collect();

    match table.as_str() {
        "bands" => {
            let row = single_row("bands", &rows)?;
            Ok(Command::InsertBand {
                id: parse_ulid(row.require("id")?)?,
                name: parse_text(row.require("name")?)?,
                from: parse_hz(row.require("from")?)?,
                to: parse_hz(row.require("to")?)?,
                spacing: parse_hz(row.require("spacing")?)?,
            })
        }
        "allocations" => {
            let row = single_row("allocations", &rows)?;
            let band_id = parse_ulid(row.require("band_id")?)?;
            let range = ChannelRange::new(
                parse_hz(row.require("start")?)?,
                parse_hz(row.require("end")?)?,
            );
            let request = match row.get("count") {
                Some(count) => AllocationRequest::AllocateFirstN {
                    band_id,
                    range,
                    count: parse_count(count)?,
                },
                None => AllocationRequest::AllocateAll { band_id, range },
            };
            Ok(Command::Allocate {
                request,
                holder: row.holder()?,
            })
        }
        "occupancy" => {
            let mut values = Vec::with_capacity(rows.len());
            let mut holder: Option<Holder> = None;
            for (i, row) in rows.iter().enumerate() {
                values.push(
                    parse_hz(row.require("value")?)
                        .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?,
                );
                let row_holder = row.holder()?;
                match &holder {
                    Some(h) if *h != row_holder => {
                        return Err(SqlError::Parse(format!("row {i}: all rows must share one holder")));
                    }
                    Some(_) => {}
                    None => holder = Some(row_holder),
                }
            }
            let holder = holder.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::Confirm { values, holder })
        }
        _ => {
            let row = single_row("debarred", &rows)?;
            Ok(Command::Debar {
                band_id: parse_ulid(row.require("band_id")?)?,
                range: RangeFilter {
                    start: row.get("start").map(parse_hz).transpose()?,
                    end: row.get("end").map(parse_hz).transpose()?,
                },
            })
        }
    }
}

fn single_row<'r, 'a>(table: &'static str, rows: &'r [Row<'a>]) -> Result<&'r Row<'a>, SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

/// Column names (explicit, or the table's default order) and the VALUES rows.
fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<(Vec<String>, &'a [Vec<Expr>]), SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => values.rows.as_slice(),
        SetExpr::Values(_) => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    let explicit = !insert.columns.is_empty();
    let columns: Vec<String> = if explicit {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    } else {
        default_columns.iter().map(|c| c.to_string()).collect()
    };
    for row in rows {
        let fits = if explicit {
            row.len() == columns.len()
        } else {
            row.len() <= columns.len()
        };
        if !fits {
            return Err(SqlError::WrongArity(table, columns.len(), row.len()));
        }
    }
    Ok((columns, rows))
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "bands" => {
            filters.only(ID_FILTER)?;
            Ok(Command::DeleteBand {
                id: parse_ulid(filters.require("id", Cmp::Eq)?)?,
            })
        }
        "allocations" => {
            filters.only(HOLDER_RANGE_FILTERS)?;
            Ok(Command::Deallocate {
                band_id: parse_ulid(filters.require("band_id", Cmp::Eq)?)?,
                range: filters.range_filter()?,
                holder: parse_text(filters.require("holder", Cmp::Eq)?)?,
            })
        }
        "debarred" => {
            filters.only(RANGE_FILTERS)?;
            Ok(Command::Allow {
                band_id: parse_ulid(filters.require("band_id", Cmp::Eq)?)?,
                range: filters.range_filter()?,
            })
        }
        "occupancy" => {
            filters.only(&[("value", Cmp::Eq), ("holder", Cmp::Eq)])?;
            if filters.terms.len() > 1 {
                return Err(SqlError::Unsupported(
                    "DELETE FROM occupancy takes either value or holder".into(),
                ));
            }
            if let Some(value) = filters.find("value", Cmp::Eq) {
                Ok(Command::ReleaseChannel {
                    value: parse_hz(value)?,
                })
            } else if let Some(holder) = filters.find("holder", Cmp::Eq) {
                Ok(Command::ReleaseHolder {
                    holder: parse_text(holder)?,
                })
            } else {
                Err(SqlError::MissingFilter("value"))
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
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "bands" => {
            filters.only(ID_FILTER)?;
            Ok(Command::SelectBands {
                id: filters.find("id", Cmp::Eq).map(parse_ulid).transpose()?,
            })
        }
        "spaced" => {
            filters.only(SPACED_FILTERS)?;
            Ok(Command::PreviewSpaced {
                band_id: parse_ulid(filters.require("band_id", Cmp::Eq)?)?,
                range: filters.range_filter()?,
                count: parse_count(filters.require("count", Cmp::Eq)?)?,
                fine_spacing: parse_hz(filters.require("spacing", Cmp::Eq)?)?,
            })
        }
        "available" => {
            filters.only(RANGE_FILTERS)?;
            Ok(Command::SelectAvailable {
                band_id: parse_ulid(filters.require("band_id", Cmp::Eq)?)?,
                range: filters.range_filter()?,
            })
        }
        "channels" => {
            filters.only(RANGE_FILTERS)?;
            Ok(Command::SelectChannels {
                band_id: parse_ulid(filters.require("band_id", Cmp::Eq)?)?,
                range: filters.range_filter()?,
            })
        }
        "occupancy" => {
            filters.only(&[
                ("holder", Cmp::Eq),
                ("value", Cmp::Eq),
                ("value", Cmp::GtEq),
                ("value", Cmp::LtEq),
            ])?;
            let filter = if let Some(holder) = filters.find("holder", Cmp::Eq) {
                OccupancyFilter::Holder(parse_text(holder)?)
            } else if let Some(value) = filters.find("value", Cmp::Eq) {
                let value = parse_hz(value)?;
                OccupancyFilter::Range(ChannelRange::new(value, value))
            } else {
                let low = filters.find("value", Cmp::GtEq).map(parse_hz).transpose()?;
                let high = filters.find("value", Cmp::LtEq).map(parse_hz).transpose()?;
                match (low, high) {
                    (None, None) => OccupancyFilter::All,
                    (low, high) => OccupancyFilter::Range(ChannelRange::new(
                        low.unwrap_or(0),
                        high.unwrap_or(MAX_FREQUENCY_HZ),
                    )),
                }
            };
            Ok(Command::SelectOccupancy { filter })
        }
        "history" => {
            filters.only(&[("value", Cmp::Eq)])?;
            Ok(Command::SelectHistory {
                value: parse_hz(filters.require("value", Cmp::Eq)?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

impl Cmp {
    fn symbol(self) -> &'static str {
        match self {
            Cmp::Eq => "=",
            Cmp::GtEq => ">=",
            Cmp::LtEq => "<=",
        }
    }
}

const ID_FILTER: &[(&str, Cmp)] = &[("id", Cmp::Eq)];

const RANGE_FILTERS: &[(&str, Cmp)] = &[
    ("band_id", Cmp::Eq),
    ("start", Cmp::GtEq),
    ("end", Cmp::LtEq),
];

const HOLDER_RANGE_FILTERS: &[(&str, Cmp)] = &[
    ("band_id", Cmp::Eq),
    ("holder", Cmp::Eq),
    ("start", Cmp::GtEq),
    ("end", Cmp::LtEq),
];

const SPACED_FILTERS: &[(&str, Cmp)] = &[
    ("band_id", Cmp::Eq),
    ("start", Cmp::GtEq),
    ("end", Cmp::LtEq),
    ("count", Cmp::Eq),
    ("spacing", Cmp::Eq),
];

/// Flattened `col <op> literal AND ...` conjunction.
struct Filters<'a> {
    terms: Vec<(String, Cmp, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters { terms: Vec::new() };
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp { left, op, right } => {
                let cmp = match op {
                    ast::BinaryOperator::Eq => Cmp::Eq,
                    ast::BinaryOperator::GtEq => Cmp::GtEq,
                    ast::BinaryOperator::LtEq => Cmp::LtEq,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                self.terms.push((column, cmp, right.as_ref()));
                Ok(())
            }
            Expr::Between {
                expr,
                negated: false,
                low,
                high,
            } => {
                let column = expr_column_name(expr)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))?;
                self.terms.push((column.clone(), Cmp::GtEq, low.as_ref()));
                self.terms.push((column, Cmp::LtEq, high.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
        }
    }

    /// Rejects any term outside `allowed`, and any term given twice.
    fn only(&self, allowed: &[(&str, Cmp)]) -> Result<(), SqlError> {
        for (i, (column, cmp, _)) in self.terms.iter().enumerate() {
            if !allowed.iter().any(|(c, op)| *c == column.as_str() && op == cmp) {
                return Err(SqlError::Unsupported(format!(
                    "filter {column} {}",
                    cmp.symbol()
                )));
            }
            if self.terms[..i].iter().any(|(c, op, _)| c == column && op == cmp) {
                return Err(SqlError::Unsupported(format!("repeated filter on {column}")));
            }
        }
        Ok(())
    }

    fn find(&self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == column && *op == cmp)
            .map(|(_, _, expr)| *expr)
    }

    fn require(&self, column: &'static str, cmp: Cmp) -> Result<&'a Expr, SqlError> {
        self.find(column, cmp).ok_or(SqlError::MissingFilter(column))
    }

    fn range_filter(&self) -> Result<RangeFilter, SqlError> {
        Ok(RangeFilter {
            start: self.find("start", Cmp::GtEq).map(parse_hz).transpose()?,
            end: self.find("end", Cmp::LtEq).map(parse_hz).transpose()?,
        })
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

/// Literal text of a number or string, with a leading minus folded in.
fn literal_text(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(format!("-{}", literal_text(expr)?));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected number or string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let text = literal_text(expr)?;
    Ulid::from_string(&text).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Integer Hz, or a string with a unit suffix such as `'145.5MHz'`.
fn parse_hz(expr: &Expr) -> Result<Hz, SqlError> {
    let text = literal_text(expr)?;
    units::parse_frequency(&text).map_err(|e| SqlError::Parse(format!("bad frequency {text:?}: {e}")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let text = literal_text(expr)?;
    text.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad number {text:?}: {e}")))
}

fn parse_count(expr: &Expr) -> Result<usize, SqlError> {
    let text = literal_text(expr)?;
    text.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad count {text:?}: {e}")))
}

// ── Result shape ──────────────────────────────────────────────

/// Row layout a statement produces, known before it runs (for Describe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    NoRows,
    Bands,
    Outcome,
    Available,
    Channels,
    Occupancy,
    History,
}

/// Placeholders such as `$1` are accepted; only the statement kind and table matter.
pub fn result_shape(sql: &str) -> ResultShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::NoRows;
    };
    match stmts.first() {
        Some(Statement::Insert(insert)) => match insert_table_name(insert).as_deref() {
            Ok("allocations" | "occupancy" | "debarred") => ResultShape::Outcome,
            _ => ResultShape::NoRows,
        },
        Some(Statement::Query(query)) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return ResultShape::NoRows;
            };
            let table = select.from.first().map(|f| table_factor_name(&f.relation));
            match table {
                Some(Ok(table)) => match table.as_str() {
                    "bands" => ResultShape::Bands,
                    "spaced" => ResultShape::Outcome,
                    "available" => ResultShape::Available,
                    "channels" => ResultShape::Channels,
                    "occupancy" => ResultShape::Occupancy,
                    "history" => ResultShape::History,
                    _ => ResultShape::NoRows,
                },
                _ => ResultShape::NoRows,
            }
        }
        _ => ResultShape::NoRows,
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
    MissingColumn(&'static str),
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
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
