//! A small SQL syntax tree, rendered to SQLite text.

use itertools::Itertools;
use num_bigint::BigInt;

use crate::ast::ColumnType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    /// `<qualifier>.<column>`, where the qualifier is an alias or a table.
    Column { qualifier: String, column: String },
    Integer(BigInt),
    Text(String),
    Null,
    /// `CAST(NULL AS <type>)`, so the column type of a projection stays known.
    TypedNull(ColumnType),
    /// A positional statement parameter, `?<n>`.
    Param(usize),
    Binary {
        op: &'static str,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Function { name: &'static str, args: Vec<Expr> },
    Cast { expr: Box<Expr>, ty: ColumnType },
    Concat(Vec<Expr>),
    /// `CASE WHEN <expr> IS NULL THEN <null> ELSE <other> END`
    NullCase {
        expr: Box<Expr>,
        null: Box<Expr>,
        other: Box<Expr>,
    },
    Exists { query: Box<Select>, negated: bool },
}

impl Expr {
    pub fn column(qualifier: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            qualifier: qualifier.into(),
            column: column.into(),
        }
    }

    pub fn int(n: i64) -> Self {
        Expr::Integer(BigInt::from(n))
    }

    pub fn binary(self, op: &'static str, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(self, rhs: Expr) -> Self {
        self.binary("=", rhs)
    }

    /// Null-safe equality.
    pub fn is(self, rhs: Expr) -> Self {
        self.binary("IS", rhs)
    }

    pub fn to_sql(&self) -> String {
        match self {
            Expr::Column { qualifier, column } => format!("{}.{}", qualifier, column),
            Expr::Integer(n) => n.to_string(),
            Expr::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Expr::Null => "NULL".to_owned(),
            Expr::TypedNull(ty) => format!("CAST(NULL AS {})", ty.sql_name()),
            Expr::Param(n) => format!("?{}", n),
            Expr::Binary { op, lhs, rhs } => format!("{} {} {}", lhs.to_sql(), op, rhs.to_sql()),
            Expr::Function { name, args } => {
                format!("{}({})", name, args.iter().map(Expr::to_sql).join(", "))
            }
            Expr::Cast { expr, ty } => format!("CAST({} AS {})", expr.to_sql(), ty.sql_name()),
            Expr::Concat(parts) => parts.iter().map(Expr::to_sql).join(" || "),
            Expr::NullCase { expr, null, other } => format!(
                "CASE WHEN {} IS NULL THEN {} ELSE {} END",
                expr.to_sql(),
                null.to_sql(),
                other.to_sql()
            ),
            Expr::Exists { query, negated } => format!(
                "{}EXISTS ({})",
                if *negated { "NOT " } else { "" },
                query.to_sql()
            ),
        }
    }
}

/// How a FROM item attaches to the items before it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Join {
    /// A comma join, constrained by the WHERE clause.
    #[default]
    Cross,
    /// `LEFT OUTER JOIN ... ON <conditions>`: rows of the earlier items are
    /// kept, NULL-padded, when nothing here matches.
    LeftOuter(Vec<Expr>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
    pub join: Join,
}

impl TableRef {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
            join: Join::Cross,
        }
    }

    pub fn left_outer(table: impl Into<String>, alias: impl Into<String>, on: Vec<Expr>) -> Self {
        Self {
            join: Join::LeftOuter(on),
            ..Self::new(table, alias)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Select {
    pub distinct: bool,
    /// Empty renders as `SELECT 1`.
    pub projection: Vec<Expr>,
    pub from: Vec<TableRef>,
    pub selection: Vec<Expr>,
}

impl Select {
    pub fn to_sql(&self) -> String {
        let mut s = String::from("SELECT ");
        if self.distinct {
            s.push_str("DISTINCT ");
        }
        if self.projection.is_empty() {
            s.push('1');
        } else {
            s.push_str(&self.projection.iter().map(Expr::to_sql).join(", "));
        }
        for (i, item) in self.from.iter().enumerate() {
            match &item.join {
                _ if i == 0 => s.push_str(" FROM "),
                Join::Cross => s.push_str(", "),
                Join::LeftOuter(_) => s.push_str(" LEFT OUTER JOIN "),
            }
            s.push_str(&item.table);
            s.push(' ');
            s.push_str(&item.alias);
            if let Join::LeftOuter(on) = &item.join {
                s.push_str(" ON ");
                if on.is_empty() {
                    s.push('1');
                } else {
                    s.push_str(&on.iter().map(Expr::to_sql).join(" AND "));
                }
            }
        }
        if !self.selection.is_empty() {
            s.push_str(" WHERE ");
            s.push_str(&self.selection.iter().map(Expr::to_sql).join(" AND "));
        }
        s
    }
}

/// A union of selects, optionally minus the rows of a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub selects: Vec<Select>,
    /// Keep duplicate rows across the selects (`UNION ALL`).
    pub all: bool,
    pub except: Option<Select>,
}

impl From<Select> for Query {
    fn from(select: Select) -> Self {
        Self {
            selects: vec![select],
            all: false,
            except: None,
        }
    }
}

impl Query {
    fn union(&self) -> &'static str {
        if self.all {
            " UNION ALL "
        } else {
            " UNION "
        }
    }

    pub fn to_sql(&self) -> String {
        let mut s = self.selects.iter().map(Select::to_sql).join(self.union());
        if let Some(except) = &self.except {
            s.push_str(" EXCEPT ");
            s.push_str(&except.to_sql());
        }
        s
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertSource {
    Values(Vec<Expr>),
    Query(Query),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Statement {
    CreateTable {
        name: String,
        columns: Vec<(String, ColumnType)>,
    },
    CreateView {
        name: String,
        columns: Vec<String>,
        query: Query,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        source: InsertSource,
    },
    Delete {
        table: String,
        selection: Vec<Expr>,
    },
}

impl Statement {
    pub fn to_sql(&self) -> String {
        match self {
            Statement::CreateTable { name, columns } => format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                name,
                columns
                    .iter()
                    .map(|(column, ty)| format!("{} {}", column, ty.sql_name()))
                    .join(", ")
            ),
            Statement::CreateView { name, columns, query } => format!(
                "CREATE VIEW IF NOT EXISTS {} ({}) AS {}",
                name,
                columns.join(", "),
                query.to_sql()
            ),
            Statement::Insert {
                table,
                columns,
                source,
            } => {
                let source = match source {
                    InsertSource::Values(values) => {
                        format!("VALUES ({})", values.iter().map(Expr::to_sql).join(", "))
                    }
                    InsertSource::Query(query) => query.to_sql(),
                };
                format!("INSERT INTO {} ({}) {}", table, columns.join(", "), source)
            }
            Statement::Delete { table, selection } => {
                let mut s = format!("DELETE FROM {}", table);
                if !selection.is_empty() {
                    s.push_str(" WHERE ");
                    s.push_str(&selection.iter().map(Expr::to_sql).join(" AND "));
                }
                s
            }
        }
    }

    /// Folds `next` into `self` as one more arm of a UNION when both insert
    /// a plain query into the same columns of the same table and the merged
    /// text stays under `limit` bytes. Returns `next` back otherwise. With
    /// `all` the arms are joined by `UNION ALL`, so duplicates across arms
    /// survive as they would with separate statements.
    pub fn merge(&mut self, next: Statement, limit: usize, all: bool) -> Option<Statement> {
        if !self.can_merge(&next, limit, all) {
            return Some(next);
        }
        if let (
            Statement::Insert {
                source: InsertSource::Query(query),
                ..
            },
            Statement::Insert {
                source: InsertSource::Query(next),
                ..
            },
        ) = (self, next)
        {
            query.all = all;
            query.selects.extend(next.selects);
        }
        None
    }

    fn can_merge(&self, next: &Statement, limit: usize, all: bool) -> bool {
        match (self, next) {
            (
                Statement::Insert {
                    table,
                    columns,
                    source: InsertSource::Query(query),
                },
                Statement::Insert {
                    table: next_table,
                    columns: next_columns,
                    source: InsertSource::Query(next_query),
                },
            ) => {
                table == next_table
                    && columns == next_columns
                    && query.except.is_none()
                    && next_query.except.is_none()
                    && (query.selects.len() == 1 || query.all == all)
                    && self.to_sql().len() + " UNION ALL ".len() + next_query.to_sql().len() < limit
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn insert(table: &str, select: Select) -> Statement {
        Statement::Insert {
            table: table.to_owned(),
            columns: vec!["a".to_owned()],
            source: InsertSource::Query(select.into()),
        }
    }

    fn select_from(table: &str) -> Select {
        Select {
            projection: vec![Expr::column("R0", "a")],
            from: vec![TableRef::new(table, "R0")],
            ..Select::default()
        }
    }

    #[test]
    fn test_render_select() {
        let select = Select {
            distinct: true,
            selection: vec![
                Expr::column("R0", "a").eq(Expr::int(3)),
                Expr::Exists {
                    query: Box::new(Select {
                        from: vec![TableRef::new("S", "R1")],
                        selection: vec![Expr::column("R1", "b").is(Expr::column("R0", "a"))],
                        ..Select::default()
                    }),
                    negated: true,
                },
            ],
            ..select_from("R")
        };
        assert_eq!(
            select.to_sql(),
            "SELECT DISTINCT R0.a FROM R R0 WHERE R0.a = 3 AND NOT EXISTS (SELECT 1 FROM S R1 WHERE R1.b IS R0.a)"
        );
    }

    #[test]
    fn test_render_outer_join_view() {
        let mut select = select_from("T");
        select.projection.push(Expr::column("R1", "x"));
        select.from.push(TableRef::new("S", "R1"));
        select.from.push(TableRef::left_outer(
            "P_m",
            "R2",
            vec![
                Expr::column("R2", "T_a").is(Expr::column("R0", "a")),
                Expr::column("R2", "S_x").is(Expr::column("R1", "x")),
            ],
        ));
        select.from.push(TableRef::left_outer("P_n", "R3", vec![]));
        let view = Statement::CreateView {
            name: "J_T".to_owned(),
            columns: vec!["a".to_owned(), "x".to_owned()],
            query: select.into(),
        };
        assert_eq!(
            view.to_sql(),
            "CREATE VIEW IF NOT EXISTS J_T (a, x) AS SELECT R0.a, R1.x FROM T R0, S R1 \
             LEFT OUTER JOIN P_m R2 ON R2.T_a IS R0.a AND R2.S_x IS R1.x LEFT OUTER JOIN P_n R3 ON 1"
        );
    }

    #[test]
    fn test_text_literals_are_escaped() {
        assert_eq!(Expr::Text("it's".to_owned()).to_sql(), "'it''s'");
        assert_eq!(Expr::TypedNull(ColumnType::Text).to_sql(), "CAST(NULL AS TEXT)");
    }

    #[test]
    fn test_merge_same_table() {
        let mut first = insert("T", select_from("R"));
        assert_eq!(first.merge(insert("T", select_from("S")), 1000, false), None);
        assert_eq!(
            first.to_sql(),
            "INSERT INTO T (a) SELECT R0.a FROM R R0 UNION SELECT R0.a FROM S R0"
        );

        let other = insert("U", select_from("S"));
        assert_eq!(first.merge(other.clone(), 1000, false), Some(other));

        let big = insert("T", select_from("S"));
        assert_eq!(first.merge(big.clone(), 20, false), Some(big));
    }

    #[test]
    fn test_merge_keeps_duplicates_without_set_semantics() {
        let mut first = insert("T", select_from("R"));
        assert_eq!(first.merge(insert("T", select_from("S")), 1000, true), None);
        assert_eq!(
            first.to_sql(),
            "INSERT INTO T (a) SELECT R0.a FROM R R0 UNION ALL SELECT R0.a FROM S R0"
        );

        let distinct = insert("T", select_from("U"));
        assert_eq!(first.merge(distinct.clone(), 1000, false), Some(distinct));
    }

    #[test]
    fn test_never_merge_except() {
        let mut first = insert("T", select_from("R"));
        let mut with_except: Query = select_from("S").into();
        with_except.except = Some(select_from("T"));
        let next = Statement::Insert {
            table: "T".to_owned(),
            columns: vec!["a".to_owned()],
            source: InsertSource::Query(with_except),
        };
        assert_eq!(first.merge(next.clone(), 1000, false), Some(next));
    }
}
