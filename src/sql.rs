use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Places,
    Events,
    Children(AccessKind),
}

impl Table {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "places" => Table::Places,
            "events" => Table::Events,
            "gates" => Table::Children(AccessKind::Gate),
            "turnstiles" => Table::Children(AccessKind::Turnstile),
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Table::Places => "places",
            Table::Events => "events",
            Table::Children(kind) => kind.table(),
        }
    }

    /// Column order for an INSERT without a column list.
    fn insert_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Places => &["name", "address", "city", "state", "gates", "turnstiles"],
            Table::Events => &["place_id", "event", "email", "phone", "type", "date_start", "date_end"],
            Table::Children(_) => &["place_id", "name"],
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertPlace(PlaceDraft),
    UpdatePlace { id: Ulid, patch: PlacePatch },
    InsertEvent(EventDraft),
    UpdateEvent { id: Ulid, patch: EventPatch },
    InsertChild { kind: AccessKind, place_id: Ulid, name: String },
    UpdateChild { kind: AccessKind, id: Ulid, patch: ChildPatch },
    Delete { table: Table, id: Ulid },
    Find { table: Table, id: Ulid },
    ListPlaces(ListQuery),
    ListEvents { place_id: Option<Ulid>, query: ListQuery },
    ListChildren { kind: AccessKind, place_id: Option<Ulid> },
}

impl Command {
    /// The table this command reads or writes.
    pub fn table(&self) -> Table {
        match self {
            Command::InsertPlace(_) | Command::UpdatePlace { .. } | Command::ListPlaces(_) => Table::Places,
            Command::InsertEvent(_) | Command::UpdateEvent { .. } | Command::ListEvents { .. } => Table::Events,
            Command::InsertChild { kind, .. }
            | Command::UpdateChild { kind, .. }
            | Command::ListChildren { kind, .. } => Table::Children(*kind),
            Command::Delete { table, .. } | Command::Find { table, .. } => *table,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Best-effort target table of a statement, without a full parse. Used to
/// describe result columns before parameters are bound.
pub fn statement_table(sql: &str) -> Option<Table> {
    let lower = sql.to_lowercase();
    let mut tokens = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == ',')
        .filter(|t| !t.is_empty());
    while let Some(tok) = tokens.next() {
        if matches!(tok, "into" | "update" | "from") {
            let name = tokens.next()?.trim_matches('"');
            let name = name.rsplit('.').next().unwrap_or(name);
            return Table::from_name(name);
        }
    }
    None
}

// ── Column/value pairs ────────────────────────────────────────

/// Named values from an INSERT row or UPDATE SET list. Each column is taken
/// at most once; `finish` rejects whatever is left over.
struct Fields {
    table: Table,
    cols: Vec<(String, Expr)>,
}

impl Fields {
    fn take(&mut self, col: &str) -> Option<Expr> {
        let pos = self.cols.iter().position(|(c, _)| c == col)?;
        Some(self.cols.remove(pos).1)
    }

    /// NULL and an absent column are both `None`.
    fn text(&mut self, col: &str) -> Result<Option<String>, SqlError> {
        self.take(col).map_or(Ok(None), |e| parse_text_or_null(&e))
    }

    fn require_text(&mut self, col: &'static str) -> Result<String, SqlError> {
        self.text(col)?
            .ok_or(SqlError::MissingColumn(self.table.name(), col))
    }

    fn ulid(&mut self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.text(col)?.map(|s| parse_ulid_text(&s)).transpose()
    }

    fn require_ulid(&mut self, col: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(col)?
            .ok_or(SqlError::MissingColumn(self.table.name(), col))
    }

    /// JSON array of `{"id"?, "name"?}`.
    fn children(&mut self, col: &str) -> Result<Option<Vec<ChildInput>>, SqlError> {
        self.text(col)?
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| SqlError::Parse(format!("{col}: expected JSON array of {{id, name}}: {e}")))
            })
            .transpose()
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.cols.into_iter().next() {
            Some((col, _)) => Err(SqlError::UnknownColumn(self.table.name(), col)),
            None => Ok(()),
        }
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let name = insert_table_name(insert)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        table.insert_columns().iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() || (!insert.columns.is_empty() && values.len() != columns.len()) {
        return Err(SqlError::WrongArity(table.name(), columns.len(), values.len()));
    }
    let mut f = Fields {
        table,
        cols: columns.into_iter().zip(values).collect(),
    };

    let cmd = match table {
        Table::Places => Command::InsertPlace(PlaceDraft {
            name: f.require_text("name")?,
            address: f.require_text("address")?,
            city: f.require_text("city")?,
            state: f.require_text("state")?,
            gates: f.children("gates")?,
            turnstiles: f.children("turnstiles")?,
        }),
        Table::Events => Command::InsertEvent(EventDraft {
            place_id: f.require_ulid("place_id")?,
            event: f.require_text("event")?,
            email: f.require_text("email")?,
            phone: f.require_text("phone")?,
            kind: f.require_text("type")?,
            date_start: f.require_text("date_start")?,
            date_end: f.require_text("date_end")?,
        }),
        Table::Children(kind) => Command::InsertChild {
            kind,
            place_id: f.require_ulid("place_id")?,
            name: f.require_text("name")?,
        },
    };
    f.finish()?;
    Ok(cmd)
}

fn parse_update(
    target: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&target.relation)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let id = extract_where_id(selection)?;

    let mut cols = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        cols.push((col, a.value.clone()));
    }
    let mut f = Fields { table, cols };

    let cmd = match table {
        Table::Places => Command::UpdatePlace {
            id,
            patch: PlacePatch {
                name: f.text("name")?,
                address: f.text("address")?,
                city: f.text("city")?,
                state: f.text("state")?,
                gates: f.children("gates")?,
                turnstiles: f.children("turnstiles")?,
            },
        },
        Table::Events => Command::UpdateEvent {
            id,
            patch: EventPatch {
                place_id: f.ulid("place_id")?,
                event: f.text("event")?,
                kind: f.text("type")?,
                email: f.text("email")?,
                phone: f.text("phone")?,
                date_start: f.text("date_start")?,
                date_end: f.text("date_end")?,
            },
        },
        Table::Children(kind) => Command::UpdateChild {
            kind,
            id,
            patch: ChildPatch {
                name: f.text("name")?,
                place_id: f.ulid("place_id")?,
            },
        },
    };
    f.finish()?;
    Ok(cmd)
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let name = delete_table_name(delete)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::Delete { table, id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let name = table_factor_name(&from.relation)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let mut f = Fields { table, cols: filters };

    if let Some(id) = f.ulid("id")? {
        f.finish()?;
        return Ok(Command::Find { table, id });
    }

    let cmd = match table {
        Table::Places => Command::ListPlaces(list_query(&mut f)?),
        Table::Events => Command::ListEvents {
            place_id: f.ulid("place_id")?,
            query: list_query(&mut f)?,
        },
        Table::Children(kind) => Command::ListChildren {
            kind,
            place_id: f.ulid("place_id")?,
        },
    };
    f.finish()?;
    Ok(cmd)
}

/// `search`, `order`, `page`, `limit` pseudo-columns.
fn list_query(f: &mut Fields) -> Result<ListQuery, SqlError> {
    let number = |v: Option<String>, col: &str| -> Result<Option<u32>, SqlError> {
        v.map(|s| {
            s.trim()
                .parse::<u32>()
                .map_err(|e| SqlError::Parse(format!("{col}: {e}")))
        })
        .transpose()
    };
    Ok(ListQuery {
        search: f.text("search")?,
        order: f.text("order")?,
        page: number(f.text("page")?, "page")?,
        limit: number(f.text("limit")?, "limit")?,
    })
}

/// Flatten `a = x AND b = y AND ...` into column/value pairs.
fn collect_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
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
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => {
            let text = parse_text_or_null(right)?.ok_or(SqlError::MissingFilter("id"))?;
            parse_ulid_text(&text)
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

/// Literal as text. Numbers and booleans are rendered; NULL is `None`.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Expr::Cast { expr, .. } | Expr::Nested(expr) = expr {
        return parse_text_or_null(expr);
    }
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(parse_text_or_null(expr)?.map(|s| format!("-{s}")));
    }
    let value = extract_value(expr).ok_or_else(|| SqlError::Parse(format!("expected value, got {expr}")))?;
    match value {
        Value::Null => Ok(None),
        Value::SingleQuotedString(s) | Value::EscapedStringLiteral(s) | Value::Number(s, _) => {
            Ok(Some(s.clone()))
        }
        Value::DollarQuotedString(d) => Ok(Some(d.value.clone())),
        Value::Boolean(b) => Ok(Some(b.to_string())),
        other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
    }
}

fn parse_ulid_text(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(..) => "42703",
            _ => "42601",
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
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
