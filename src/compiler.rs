//! Lowers maintenance rules to SQLite statements.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error};

use crate::ast::{
    builtin_binding, Argument, Atom, AtomKind, Builtin, Catalog, ColumnType, Constant, HeadStratum,
    Identifier, Literal, Relation, Rule, RuleBehavior, SkolemTerm, StratumGuard, LN_LABELED,
    LN_REAL_VALUE, LN_SQL_NULL, STRATUM_COLUMN,
};
use crate::config::EngineConfig;
use crate::error::CompileError;
use crate::sql::{Expr, InsertSource, Query, Select, Statement, TableRef};

/// How the semi-naive iteration counter reaches a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Iteration {
    /// Inlined as a literal; the statement is good for one iteration.
    Literal(i64),
    /// Left as the `?1` parameter, bound on every execution.
    Prepared,
}

impl Iteration {
    fn expr(self, offset: i64) -> Expr {
        match self {
            Iteration::Literal(k) => Expr::int(k + offset),
            Iteration::Prepared if offset == 0 => Expr::Param(1),
            Iteration::Prepared if offset > 0 => Expr::Param(1).binary("+", Expr::int(offset)),
            Iteration::Prepared => Expr::Param(1).binary("-", Expr::int(-offset)),
        }
    }
}

pub struct SqlContext<'a> {
    pub catalog: &'a Catalog,
    pub config: &'a EngineConfig,
}

/// A variable's value expression and, where known, its labeled-null
/// companion expression.
#[derive(Clone, Debug)]
struct Binding {
    value: Expr,
    marker: Option<Expr>,
}

impl Binding {
    fn labeled(value: Expr) -> Self {
        Self {
            value,
            marker: Some(Expr::int(LN_LABELED)),
        }
    }

    fn marker(&self) -> Expr {
        self.marker.clone().unwrap_or_else(|| Expr::NullCase {
            expr: Box::new(self.value.clone()),
            null: Box::new(Expr::int(LN_SQL_NULL)),
            other: Box::new(Expr::int(LN_REAL_VALUE)),
        })
    }
}

type Bindings = HashMap<Identifier, Binding>;

fn constant(c: &Constant) -> Binding {
    let value = match &c.value {
        Literal::String(s) => Expr::Text(s.clone()),
        Literal::Integer(n) => Expr::Integer(n.clone()),
        Literal::Null => c.ty.map_or(Expr::Null, Expr::TypedNull),
        Literal::LabeledNull(label) => Expr::Text(label.clone()),
    };
    Binding {
        value,
        marker: Some(Expr::int(c.value.null_marker())),
    }
}

fn compare(lhs: Expr, rhs: Expr, null_safe: bool) -> Expr {
    if null_safe {
        lhs.is(rhs)
    } else {
        lhs.eq(rhs)
    }
}

/// Per-statement generation state. Aliases are numbered across the whole
/// statement, subqueries included.
struct Generator<'a> {
    ctx: &'a SqlContext<'a>,
    rule: &'a Rule,
    iteration: Iteration,
    aliases: usize,
}

impl<'a> Generator<'a> {
    fn alias(&mut self) -> String {
        let alias = format!("R{}", self.aliases);
        self.aliases += 1;
        alias
    }

    fn unsafe_variable(&self, name: &str) -> CompileError {
        CompileError::UnsafeRule {
            rule: self.rule.id.clone(),
            variable: name.to_owned(),
        }
    }

    fn relation(&self, atom: &Atom) -> Result<&'a Relation, CompileError> {
        let relation = self.ctx.catalog.relation(atom.relation().unwrap_or_default())?;
        if atom.args.len() != relation.arity() {
            return Err(CompileError::Arity {
                relation: relation.name.clone(),
                expected: relation.arity(),
                found: atom.args.len(),
            });
        }
        Ok(relation)
    }

    fn value(&self, arg: &Argument, bindings: &Bindings) -> Result<Binding, CompileError> {
        match arg {
            Argument::Variable(v) => {
                if let Some(binding) = bindings.get(&v.name) {
                    return Ok(binding.clone());
                }
                match v.skolem.and_then(|id| self.rule.skolem(id)) {
                    Some(term) => Ok(Binding::labeled(self.skolem(term, bindings)?)),
                    None => Err(self.unsafe_variable(&v.name)),
                }
            }
            Argument::Constant(c) => Ok(constant(c)),
            Argument::Skolem(term) => Ok(Binding::labeled(self.skolem(term, bindings)?)),
        }
    }

    /// `'f(' || COALESCE(SUBSTR(CAST(a AS TEXT), 1, W), '-') || ',' || ... || ')'`
    fn skolem(&self, term: &SkolemTerm, bindings: &Bindings) -> Result<Expr, CompileError> {
        let width = self.ctx.config.skolem_width as i64;
        let mut parts = vec![Expr::Text(format!("{}(", term.function))];
        for (i, arg) in term.args.iter().enumerate() {
            if i > 0 {
                parts.push(Expr::Text(",".to_owned()));
            }
            let value = self.value(arg, bindings)?.value;
            let truncated = Expr::Function {
                name: "SUBSTR",
                args: vec![
                    Expr::Cast {
                        expr: Box::new(value),
                        ty: ColumnType::Text,
                    },
                    Expr::int(1),
                    Expr::int(width),
                ],
            };
            parts.push(Expr::Function {
                name: "COALESCE",
                args: vec![truncated, Expr::Text("-".to_owned())],
            });
        }
        parts.push(Expr::Text(")".to_owned()));
        Ok(Expr::Concat(parts))
    }

    /// Conditions matching a column, and its companion where either side
    /// has one, against an argument.
    fn conditions(
        &self,
        value: Expr,
        marker: Option<Expr>,
        arg: &Argument,
        bindings: &Bindings,
        null_safe: bool,
    ) -> Result<Vec<Expr>, CompileError> {
        if arg.is_null() {
            return Ok(vec![value.is(Expr::Null)]);
        }
        let bound = self.value(arg, bindings)?;
        let mut out = vec![];
        if marker.is_some() || bound.marker.is_some() {
            let ours = marker.unwrap_or_else(|| {
                Binding {
                    value: value.clone(),
                    marker: None,
                }
                .marker()
            });
            out.push(compare(ours, bound.marker(), null_safe));
        }
        out.push(compare(value, bound.value, null_safe));
        Ok(out)
    }

    /// Builds the FROM and WHERE parts of `body` on top of `outer`. Tuple
    /// comparisons use `IS` when `null_safe`, `=` otherwise. Optional atoms
    /// come after every other relation atom and are left outer joined, with
    /// null-safe ON conditions.
    fn select(
        &mut self,
        body: &[Atom],
        outer: &Bindings,
        null_safe: bool,
        guard: Option<StratumGuard>,
    ) -> Result<(Select, Bindings), CompileError> {
        let mut bindings = outer.clone();
        let mut select = Select::default();
        let mut pending: Vec<(Expr, Option<Expr>, &Argument)> = vec![];

        let mut outer_joined = false;
        for (position, atom) in body.iter().enumerate() {
            if !atom.is_positive_relation() {
                continue;
            }
            if outer_joined && !atom.optional {
                return Err(CompileError::Unsupported {
                    mapping: self.rule.id.clone(),
                    detail: format!("{} follows an optional atom", atom),
                });
            }
            outer_joined |= atom.optional;
            let relation = self.relation(atom)?;
            let alias = self.alias();

            if let Some(guard) = guard.filter(|g| g.atom == position) {
                if !relation.has_stratum(atom.kind) {
                    return Err(CompileError::IncompatibleSchema(format!(
                        "{} has no {} column",
                        relation.table_name(atom.kind),
                        STRATUM_COLUMN
                    )));
                }
                select.selection.push(
                    Expr::column(&alias, STRATUM_COLUMN).eq(self.iteration.expr(guard.offset)),
                );
            }

            let mut on = vec![];
            for (i, (arg, column)) in atom.args.iter().zip(&relation.columns).enumerate() {
                let value = Expr::column(&alias, &column.name);
                let marker = relation.null_column(i).map(|ln| Expr::column(&alias, ln));
                match arg {
                    Argument::Variable(v) if v.skolem.is_none() && !bindings.contains_key(&v.name) => {
                        bindings.insert(v.name.clone(), Binding { value, marker });
                    }
                    _ if atom.optional => on.extend(self.conditions(value, marker, arg, &bindings, true)?),
                    _ => pending.push((value, marker, arg)),
                }
            }
            let table = relation.table_name(atom.kind);
            select.from.push(if atom.optional {
                TableRef::left_outer(table, alias, on)
            } else {
                TableRef::new(table, alias)
            });
        }

        self.builtins(body, &mut bindings, &mut select)?;

        for (value, marker, arg) in pending {
            select
                .selection
                .extend(self.conditions(value, marker, arg, &bindings, null_safe)?);
        }

        for atom in body.iter().filter(|atom| atom.negated) {
            if atom.builtin_op().is_some() {
                return Err(CompileError::Unsupported {
                    mapping: self.rule.id.clone(),
                    detail: format!("negated built-in {}", atom),
                });
            }
            let positive = Atom {
                negated: false,
                ..atom.clone()
            };
            let (query, _) = self.select(std::slice::from_ref(&positive), &bindings, true, None)?;
            select.selection.push(Expr::Exists {
                query: Box::new(query),
                negated: true,
            });
        }

        Ok((select, bindings))
    }

    /// Resolves built-in atoms until nothing changes: a built-in whose
    /// output is free binds it, one whose arguments are all bound becomes a
    /// condition. Anything left over mentions a variable nothing binds.
    fn builtins(&self, body: &[Atom], bindings: &mut Bindings, select: &mut Select) -> Result<(), CompileError> {
        let mut remaining: Vec<&Atom> = body
            .iter()
            .filter(|atom| !atom.negated && atom.builtin_op().is_some())
            .collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            let mut unresolved = vec![];
            for atom in remaining {
                let Some(op) = atom.builtin_op() else { continue };
                let names: Vec<Identifier> = bindings.keys().cloned().collect();
                let resolvable = |arg: &Argument| {
                    arg.variables()
                        .iter()
                        .all(|v| bindings.contains_key(&v.name) || v.skolem.is_some())
                };

                if let Some(name) = builtin_binding(atom, &names) {
                    let binding = if op.is_function() {
                        self.function(op, &atom.args[1..], bindings)?
                    } else if atom.args[0].as_variable().map_or(false, |v| v.name == name) {
                        self.value(&atom.args[1], bindings)?
                    } else {
                        self.value(&atom.args[0], bindings)?
                    };
                    bindings.insert(name, binding);
                } else if atom.args.iter().all(resolvable) {
                    let lhs = self.value(&atom.args[0], bindings)?.value;
                    let rhs = if op.is_function() {
                        self.function(op, &atom.args[1..], bindings)?.value
                    } else {
                        self.value(&atom.args[1], bindings)?.value
                    };
                    let symbol = if op.is_function() { "=" } else { op.symbol() };
                    select.selection.push(lhs.binary(symbol, rhs));
                } else {
                    unresolved.push(atom);
                }
            }
            if unresolved.len() == before {
                let name = unresolved
                    .iter()
                    .flat_map(|atom| atom.variables())
                    .find(|v| !bindings.contains_key(&v.name))
                    .map(|v| v.name.clone())
                    .unwrap_or_default();
                return Err(self.unsafe_variable(&name));
            }
            remaining = unresolved;
        }
        Ok(())
    }

    fn function(&self, op: Builtin, args: &[Argument], bindings: &Bindings) -> Result<Binding, CompileError> {
        let name = match op {
            Builtin::Least => "MIN",
            _ => "MAX",
        };
        let args = args
            .iter()
            .map(|arg| Ok(self.value(arg, bindings)?.value))
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(Binding {
            value: Expr::Function { name, args },
            marker: None,
        })
    }

    /// Head values in physical column order: each value, its companion
    /// when the table has one, then STRATUM.
    fn projection(&self, head: &Atom, relation: &Relation, bindings: &Bindings) -> Result<Vec<Expr>, CompileError> {
        let key: HashSet<usize> = relation.key.iter().copied().collect();
        let blanking = self.rule.replace_with_nulls || self.rule.key_and_nulls_only;
        let mut out = vec![];
        for (i, (arg, column)) in head.args.iter().zip(&relation.columns).enumerate() {
            let bound = self.value(arg, bindings)?;
            if blanking && !key.contains(&i) {
                out.push(Expr::TypedNull(column.ty));
                if relation.has_null_column(i) {
                    out.push(if self.rule.key_and_nulls_only {
                        bound.marker()
                    } else {
                        Expr::int(LN_SQL_NULL)
                    });
                }
                continue;
            }
            let marker = bound.marker();
            out.push(bound.value);
            if relation.has_null_column(i) {
                out.push(marker);
            }
        }
        if relation.has_stratum(head.kind) {
            out.push(match self.rule.head_stratum {
                Some(HeadStratum::Fixed(n)) => Expr::int(n),
                Some(HeadStratum::Iteration(offset)) => self.iteration.expr(offset),
                None => Expr::int(0),
            });
        }
        Ok(out)
    }

    /// `head table.column IS value` for every head column, correlating a
    /// DELETE with the rows its body produces.
    fn correlation(&self, head: &Atom, relation: &Relation, bindings: &Bindings) -> Result<Vec<Expr>, CompileError> {
        let table = relation.table_name(head.kind);
        let mut out = vec![];
        for (i, (arg, column)) in head.args.iter().zip(&relation.columns).enumerate() {
            let bound = self.value(arg, bindings)?;
            if let Some(ln) = relation.null_column(i) {
                out.push(Expr::column(&table, ln).is(bound.marker()));
            }
            out.push(Expr::column(&table, &column.name).is(bound.value));
        }
        Ok(out)
    }

    fn insert(&mut self, head: &Atom, relation: &Relation, set_semantics: bool) -> Result<Statement, CompileError> {
        let table = relation.table_name(head.kind);
        let columns = relation
            .physical_columns(head.kind)
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        if self.rule.is_fact() {
            let values = self.projection(head, relation, &Bindings::new())?;
            return Ok(Statement::Insert {
                table,
                columns,
                source: InsertSource::Values(values),
            });
        }

        let mut body = self.rule.body.clone();
        let own = head.clone().negate();
        if set_semantics && !body.contains(&own) {
            body.push(own.clone());
        }
        let except = body.last() == Some(&own) && !relation.has_stratum(head.kind);
        if except {
            body.pop();
        }

        let guard = self.rule.guard;
        let (mut select, bindings) = self.select(&body, &Bindings::new(), false, guard)?;
        select.distinct = self.rule.distinct;
        select.projection = self.projection(head, relation, &bindings)?;

        let mut query = Query::from(select);
        if except {
            let alias = self.alias();
            query.except = Some(Select {
                projection: relation
                    .physical_columns(head.kind)
                    .into_iter()
                    .map(|(name, _)| Expr::column(&alias, name))
                    .collect(),
                from: vec![TableRef::new(table.clone(), alias)],
                ..Select::default()
            });
        }
        Ok(Statement::Insert {
            table,
            columns,
            source: InsertSource::Query(query),
        })
    }

    fn delete(&mut self, head: &Atom, relation: &Relation) -> Result<Statement, CompileError> {
        let table = relation.table_name(head.kind);
        if self.rule.is_fact() {
            let bindings = Bindings::new();
            let selection = relation
                .require_key()?
                .iter()
                .map(|&k| {
                    let value = self.value(&head.args[k], &bindings)?.value;
                    Ok(Expr::column(&table, &relation.columns[k].name).eq(value))
                })
                .collect::<Result<Vec<_>, CompileError>>()?;
            return Ok(Statement::Delete { table, selection });
        }

        let rule = self.rule;
        let (mut select, bindings) = self.select(&rule.body, &Bindings::new(), false, rule.guard)?;
        select.selection.extend(self.correlation(head, relation, &bindings)?);
        Ok(Statement::Delete {
            table,
            selection: vec![Expr::Exists {
                query: Box::new(select),
                negated: false,
            }],
        })
    }

    fn view(&mut self, head: &Atom, relation: &Relation) -> Result<Statement, CompileError> {
        let rule = self.rule;
        let (mut select, bindings) = self.select(&rule.body, &Bindings::new(), false, None)?;
        select.distinct = rule.distinct;
        select.projection = self.projection(head, relation, &bindings)?;
        Ok(Statement::CreateView {
            name: relation.name.clone(),
            columns: relation
                .physical_columns(AtomKind::Base)
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
            query: select.into(),
        })
    }

    fn statements(&mut self) -> Result<Vec<Statement>, CompileError> {
        let rule = self.rule;
        let [head] = rule.head.as_slice() else {
            return Err(CompileError::Unsupported {
                mapping: rule.id.clone(),
                detail: format!("{} heads cannot be lowered to one statement", rule.head.len()),
            });
        };
        let relation = self.relation(head)?;
        let set_semantics = self.ctx.config.set_semantics;
        match rule.behavior {
            RuleBehavior::Other => Ok(vec![self.insert(head, relation, set_semantics)?]),
            RuleBehavior::DeleteFromHead => Ok(vec![self.delete(head, relation)?]),
            RuleBehavior::View => Ok(vec![self.view(head, relation)?]),
            RuleBehavior::ClearAndCopy => Ok(vec![
                clear_table(relation.table_name(head.kind)),
                self.insert(head, relation, false)?,
            ]),
        }
    }
}

impl Rule {
    /// The statements implementing this rule for one iteration.
    pub fn to_statements(&self, ctx: &SqlContext, iteration: Iteration) -> Result<Vec<Statement>, CompileError> {
        let mut generator = Generator {
            ctx,
            rule: self,
            iteration,
            aliases: 0,
        };
        generator.statements().map_err(|err| err.in_rule(self))
    }

    pub fn to_update(&self, ctx: &SqlContext, iteration: Iteration) -> Result<Vec<String>, CompileError> {
        Ok(self
            .to_statements(ctx, iteration)?
            .iter()
            .map(Statement::to_sql)
            .collect())
    }

    /// Appends this rule's statements to `previous`, folding inserts into
    /// the last statement where the configuration allows. Returns whether
    /// anything was folded. `previous` is untouched when the rule fails.
    pub fn to_update_merged(
        &self,
        ctx: &SqlContext,
        iteration: Iteration,
        previous: &mut Vec<Statement>,
    ) -> Result<bool, CompileError> {
        let mut merged = false;
        for statement in self.to_statements(ctx, iteration)? {
            let statement = match previous.last_mut() {
                Some(last) if ctx.config.merge_statements => {
                    last.merge(statement, ctx.config.merge_limit, !ctx.config.set_semantics)
                }
                _ => Some(statement),
            };
            match statement {
                Some(statement) => previous.push(statement),
                None => merged = true,
            }
        }
        Ok(merged)
    }
}

/// The outcome of compiling a group of rules: the statements of every rule
/// that compiled, and the errors of those that did not.
#[derive(Debug, Default)]
pub struct Compiled {
    pub statements: Vec<Statement>,
    pub failures: Vec<CompileError>,
}

impl Compiled {
    /// The statements, or every failure as one batch error.
    pub fn into_result(self) -> Result<Vec<Statement>, CompileError> {
        if self.failures.is_empty() {
            Ok(self.statements)
        } else {
            Err(CompileError::Rules(self.failures))
        }
    }
}

/// Compiles a group of rules in order. Every rule is attempted; a failing
/// rule contributes no statements and its error is logged and collected.
pub fn compile_rules(rules: &[Rule], ctx: &SqlContext, iteration: Iteration) -> Compiled {
    let mut compiled = Compiled::default();
    for rule in rules {
        match rule.to_update_merged(ctx, iteration, &mut compiled.statements) {
            Ok(merged) => debug!(rule = %rule.id, merged, "compiled"),
            Err(err) => {
                error!(rule = %rule.id, "{}", err);
                compiled.failures.push(err);
            }
        }
    }
    compiled
}

/// The base, insert and delete tables of a relation.
pub fn create_tables(relation: &Relation) -> Vec<Statement> {
    [AtomKind::Base, AtomKind::Insert, AtomKind::Delete]
        .into_iter()
        .map(|kind| Statement::CreateTable {
            name: relation.table_name(kind),
            columns: relation.physical_columns(kind),
        })
        .collect()
}

pub fn clear_table(table: impl Into<String>) -> Statement {
    Statement::Delete {
        table: table.into(),
        selection: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::skolemize;
    use crate::ast::Column;
    use num_bigint::BigInt;
    use pretty_assertions::assert_eq;

    fn var(name: &str) -> Argument {
        Argument::var(name)
    }

    fn catalog() -> Catalog {
        let int = |name: &str| Column::new(name, ColumnType::Integer, false);
        let mut catalog = Catalog::default();
        catalog.add_relation(Relation::new("R", vec![int("a"), int("b")])).unwrap();
        catalog.add_relation(Relation::new("S", vec![int("b")])).unwrap();
        catalog.add_relation(Relation::new("T", vec![int("a"), int("b")])).unwrap();
        catalog.add_relation(Relation::new("W", vec![int("a")])).unwrap();

        let mut n = Relation::new("N", vec![int("a"), Column::new("b", ColumnType::Text, true)]);
        n.labeled_nulls = true;
        n.key = vec![0];
        catalog.add_relation(n).unwrap();

        let mut l = Relation::new("L", vec![int("a"), Column::new("b", ColumnType::Text, false)]);
        l.key = vec![0];
        catalog.add_relation(l).unwrap();
        catalog
    }

    fn bag() -> EngineConfig {
        EngineConfig {
            set_semantics: false,
            ..EngineConfig::default()
        }
    }

    fn sql(rule: &Rule, catalog: &Catalog, config: &EngineConfig, iteration: Iteration) -> Vec<String> {
        rule.to_update(&SqlContext { catalog, config }, iteration).unwrap()
    }

    #[test]
    fn test_insertion_delta_uses_except() {
        let mut rule = Rule::new(
            "m_ins0",
            Atom::new("T", vec![var("x"), var("y")]).with_kind(AtomKind::Insert),
            vec![
                Atom::new("R", vec![var("x"), var("y")]).with_kind(AtomKind::Insert),
                Atom::new("S", vec![var("y")]),
                Atom::new("T", vec![var("x"), var("y")]).negate(),
            ],
        );
        rule.distinct = true;
        assert_eq!(
            sql(&rule, &catalog(), &EngineConfig::default(), Iteration::Prepared),
            vec![
                "INSERT INTO T_INS (a, b) SELECT DISTINCT R0.a, R0.b FROM R_INS R0, S R1 \
                 WHERE R1.b = R0.b \
                 AND NOT EXISTS (SELECT 1 FROM T R2 WHERE R2.a IS R0.a AND R2.b IS R0.b) \
                 EXCEPT SELECT R3.a, R3.b FROM T_INS R3"
            ]
        );
    }

    #[test]
    fn test_stratum_guard_and_iteration() {
        let mut catalog = catalog();
        catalog.relation_mut("R").unwrap().stratified = true;
        let mut rule = Rule::new(
            "c_ins1",
            Atom::new("R", vec![var("x"), var("z")]).with_kind(AtomKind::Insert),
            vec![
                Atom::new("R", vec![var("x"), var("y")]),
                Atom::new("R", vec![var("y"), var("z")]).with_kind(AtomKind::Insert),
                Atom::new("R", vec![var("x"), var("z")]).negate(),
            ],
        );
        rule.distinct = true;
        rule.guard = Some(StratumGuard { atom: 1, offset: 0 });
        rule.head_stratum = Some(HeadStratum::Iteration(1));

        assert_eq!(
            sql(&rule, &catalog, &bag(), Iteration::Prepared),
            vec![
                "INSERT INTO R_INS (a, b, STRATUM) SELECT DISTINCT R0.a, R1.b, ?1 + 1 \
                 FROM R R0, R_INS R1 WHERE R1.STRATUM = ?1 AND R1.a = R0.b \
                 AND NOT EXISTS (SELECT 1 FROM R R2 WHERE R2.a IS R0.a AND R2.b IS R1.b)"
            ]
        );
        assert_eq!(
            sql(&rule, &catalog, &bag(), Iteration::Literal(3)),
            vec![
                "INSERT INTO R_INS (a, b, STRATUM) SELECT DISTINCT R0.a, R1.b, 4 \
                 FROM R R0, R_INS R1 WHERE R1.STRATUM = 3 AND R1.a = R0.b \
                 AND NOT EXISTS (SELECT 1 FROM R R2 WHERE R2.a IS R0.a AND R2.b IS R1.b)"
            ]
        );

        rule.guard = Some(StratumGuard { atom: 0, offset: 0 });
        let ctx = SqlContext {
            catalog: &catalog,
            config: &EngineConfig::default(),
        };
        assert!(rule.to_update(&ctx, Iteration::Prepared).is_err());
    }

    #[test]
    fn test_delete_from_head() {
        let mut rule = Rule::new(
            "m_red",
            Atom::new("T", vec![var("x"), var("y")]).with_kind(AtomKind::Delete),
            vec![
                Atom::new("R", vec![var("x"), var("y")]),
                Atom::new("S", vec![var("y")]),
                Atom::new("R", vec![var("x"), var("y")]).with_kind(AtomKind::Delete).negate(),
                Atom::new("S", vec![var("y")]).with_kind(AtomKind::Delete).negate(),
            ],
        );
        rule.behavior = RuleBehavior::DeleteFromHead;
        assert_eq!(
            sql(&rule, &catalog(), &EngineConfig::default(), Iteration::Prepared),
            vec![
                "DELETE FROM T_DEL WHERE EXISTS (SELECT 1 FROM R R0, S R1 WHERE R1.b = R0.b \
                 AND NOT EXISTS (SELECT 1 FROM R_DEL R2 WHERE R2.a IS R0.a AND R2.b IS R0.b) \
                 AND NOT EXISTS (SELECT 1 FROM S_DEL R3 WHERE R3.b IS R0.b) \
                 AND T_DEL.a IS R0.a AND T_DEL.b IS R0.b)"
            ]
        );
    }

    #[test]
    fn test_skolem_expression_is_deterministic() {
        let mut catalog = catalog();
        let mut t = Relation::new(
            "V",
            vec![
                Column::new("a", ColumnType::Integer, false),
                Column::new("b", ColumnType::Text, true),
            ],
        );
        t.labeled_nulls = true;
        catalog.add_relation(t).unwrap();

        let mut rule = Rule::new(
            "m",
            Atom::new("V", vec![var("x"), var("n")]),
            vec![Atom::new("R", vec![var("x"), var("y")])],
        );
        skolemize(&mut rule);
        let expected = vec![
            "INSERT INTO V (a, b, b_LN) SELECT R0.a, \
             'm_n(' || COALESCE(SUBSTR(CAST(R0.a AS TEXT), 1, 64), '-') || ')', 2 FROM R R0"
                .to_owned(),
        ];
        assert_eq!(sql(&rule, &catalog, &bag(), Iteration::Prepared), expected);
        assert_eq!(sql(&rule.clone(), &catalog, &bag(), Iteration::Literal(7)), expected);
    }

    #[test]
    fn test_facts() {
        let catalog = catalog();
        let one = Argument::constant(Literal::Integer(BigInt::from(1)));
        let x = Argument::constant(Literal::String("x".to_owned()));
        let fact = Rule::new("f", Atom::new("L", vec![one.clone(), x.clone()]).with_kind(AtomKind::Insert), vec![]);
        assert_eq!(
            sql(&fact, &catalog, &EngineConfig::default(), Iteration::Prepared),
            vec!["INSERT INTO L_INS (a, b) VALUES (1, 'x')"]
        );

        let mut cancel = fact.clone();
        cancel.behavior = RuleBehavior::DeleteFromHead;
        assert_eq!(
            sql(&cancel, &catalog, &EngineConfig::default(), Iteration::Prepared),
            vec!["DELETE FROM L_INS WHERE L_INS.a = 1"]
        );

        let mut keyless = Rule::new("g", Atom::new("T", vec![one.clone(), one]), vec![]);
        keyless.behavior = RuleBehavior::DeleteFromHead;
        let ctx = SqlContext {
            catalog: &catalog,
            config: &EngineConfig::default(),
        };
        let err = keyless.to_update(&ctx, Iteration::Prepared).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InRule { source, .. } if matches!(*source, CompileError::MissingKey(_))
        ));
    }

    #[test]
    fn test_unsafe_head_variable() {
        let rule = Rule::new(
            "u",
            Atom::new("T", vec![var("x"), var("y")]),
            vec![Atom::new("R", vec![var("x"), var("x")])],
        );
        let catalog = catalog();
        let config = EngineConfig::default();
        let err = rule
            .to_update(&SqlContext { catalog: &catalog, config: &config }, Iteration::Prepared)
            .unwrap_err();
        assert!(matches!(
            err,
            CompileError::InRule { source, .. } if matches!(&*source, CompileError::UnsafeRule { variable, .. } if variable == "y")
        ));
    }

    #[test]
    fn test_builtins() {
        let three = Argument::constant(Literal::Integer(BigInt::from(3)));
        let rule = Rule::new(
            "b",
            Atom::new("T", vec![var("x"), var("z")]),
            vec![
                Atom::new("R", vec![var("x"), var("y")]),
                Atom::new("S", vec![var("y")]),
                Atom::builtin(Builtin::Least, vec![var("z"), var("x"), var("y")]),
                Atom::builtin(Builtin::Lt, vec![var("x"), three]),
            ],
        );
        assert_eq!(
            sql(&rule, &catalog(), &bag(), Iteration::Prepared),
            vec!["INSERT INTO T (a, b) SELECT R0.a, MIN(R0.a, R0.b) FROM R R0, S R1 WHERE R0.a < 3 AND R1.b = R0.b"]
        );

        let loose = Rule::new(
            "b",
            Atom::new("W", vec![var("x")]),
            vec![
                Atom::new("W", vec![var("x")]),
                Atom::builtin(Builtin::Gt, vec![var("x"), var("q")]),
            ],
        );
        let catalog = catalog();
        let config = bag();
        assert!(loose
            .to_update(&SqlContext { catalog: &catalog, config: &config }, Iteration::Prepared)
            .is_err());
    }

    #[test]
    fn test_labeled_null_columns() {
        let catalog = catalog();
        let v = Argument::constant(Literal::String("v".to_owned()));
        let rule = Rule::new(
            "n",
            Atom::new("W", vec![var("x")]),
            vec![Atom::new("N", vec![var("x"), v])],
        );
        assert_eq!(
            sql(&rule, &catalog, &bag(), Iteration::Prepared),
            vec!["INSERT INTO W (a) SELECT R0.a FROM N R0 WHERE R0.b_LN = 1 AND R0.b = 'v'"]
        );

        let mut copy = Rule::new(
            "k",
            Atom::new("N", vec![var("x"), var("y")]),
            vec![Atom::new("N", vec![var("x"), var("y")])],
        );
        copy.replace_with_nulls = true;
        assert_eq!(
            sql(&copy, &catalog, &bag(), Iteration::Prepared),
            vec!["INSERT INTO N (a, b, b_LN) SELECT R0.a, CAST(NULL AS TEXT), 0 FROM N R0"]
        );
        copy.replace_with_nulls = false;
        copy.key_and_nulls_only = true;
        assert_eq!(
            sql(&copy, &catalog, &bag(), Iteration::Prepared),
            vec!["INSERT INTO N (a, b, b_LN) SELECT R0.a, CAST(NULL AS TEXT), R0.b_LN FROM N R0"]
        );
    }

    #[test]
    fn test_clear_and_copy() {
        let mut rule = Rule::new(
            "L_reset",
            Atom::new("L", vec![var("x0"), var("x1")]).with_kind(AtomKind::Insert),
            vec![Atom::new("L", vec![var("x0"), var("x1")])],
        );
        rule.behavior = RuleBehavior::ClearAndCopy;
        rule.distinct = true;
        assert_eq!(
            sql(&rule, &catalog(), &EngineConfig::default(), Iteration::Prepared),
            vec![
                "DELETE FROM L_INS",
                "INSERT INTO L_INS (a, b) SELECT DISTINCT R0.a, R0.b FROM L R0",
            ]
        );
    }

    #[test]
    fn test_view_left_joins_optional_atoms() {
        let mut catalog = catalog();
        let mut q = Relation::new(
            "Q",
            vec![
                Column::new("N_a", ColumnType::Integer, false),
                Column::new("N_b", ColumnType::Text, true),
                Column::new("x", ColumnType::Integer, true),
            ],
        );
        q.labeled_nulls = true;
        catalog.add_relation(q).unwrap();
        catalog
            .add_relation(Relation::new(
                "J",
                vec![
                    Column::new("a", ColumnType::Integer, false),
                    Column::new("b", ColumnType::Text, true),
                    Column::new("x", ColumnType::Integer, true),
                ],
            ))
            .unwrap();

        let mut rule = Rule::new(
            "J_view",
            Atom::new("J", vec![var("t0"), var("t1"), var("p")]),
            vec![
                Atom::new("N", vec![var("t0"), var("t1")]),
                Atom::new("Q", vec![var("t0"), var("t1"), var("p")]).optional(),
            ],
        );
        rule.behavior = RuleBehavior::View;
        assert_eq!(
            sql(&rule, &catalog, &EngineConfig::default(), Iteration::Prepared),
            vec![
                "CREATE VIEW IF NOT EXISTS J (a, b, x) AS SELECT R0.a, R0.b, R1.x FROM N R0 \
                 LEFT OUTER JOIN Q R1 ON R1.N_a IS R0.a AND R1.N_b_LN IS R0.b_LN AND R1.N_b IS R0.b"
            ]
        );

        rule.body.swap(0, 1);
        let ctx = SqlContext {
            catalog: &catalog,
            config: &EngineConfig::default(),
        };
        assert!(matches!(
            rule.to_statements(&ctx, Iteration::Prepared),
            Err(CompileError::InRule { .. })
        ));
    }

    #[test]
    fn test_compile_rules_merges_same_table() {
        let catalog = catalog();
        let config = bag();
        let ctx = SqlContext {
            catalog: &catalog,
            config: &config,
        };
        let rules = vec![
            Rule::new("a", Atom::new("W", vec![var("x")]), vec![Atom::new("S", vec![var("x")])]),
            Rule::new("b", Atom::new("W", vec![var("x")]), vec![Atom::new("R", vec![var("x"), var("y")])]),
            Rule::new("c", Atom::new("S", vec![var("x")]), vec![Atom::new("W", vec![var("x")])]),
        ];
        let statements = compile_rules(&rules, &ctx, Iteration::Prepared).into_result().unwrap();
        let text: Vec<String> = statements.iter().map(Statement::to_sql).collect();
        assert_eq!(
            text,
            vec![
                "INSERT INTO W (a) SELECT R0.b FROM S R0 UNION ALL SELECT R0.a FROM R R0",
                "INSERT INTO S (b) SELECT R0.a FROM W R0",
            ]
        );

        let config = EngineConfig::default();
        let ctx = SqlContext {
            catalog: &catalog,
            config: &config,
        };
        let statements = compile_rules(&rules[..2], &ctx, Iteration::Prepared).into_result().unwrap();
        assert_eq!(statements.len(), 2, "inserts ending in EXCEPT are never merged");

        let broken = vec![
            Rule::new("d", Atom::new("W", vec![var("q")]), vec![Atom::new("S", vec![var("x")])]),
            Rule::new("e", Atom::new("Nope", vec![var("x")]), vec![Atom::new("S", vec![var("x")])]),
        ];
        match compile_rules(&broken, &ctx, Iteration::Prepared).into_result() {
            Err(CompileError::Rules(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("expected a batch failure, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_rules_keeps_statements_of_good_rules() {
        let catalog = catalog();
        let config = bag();
        let ctx = SqlContext {
            catalog: &catalog,
            config: &config,
        };
        let rules = vec![
            Rule::new("a", Atom::new("W", vec![var("x")]), vec![Atom::new("S", vec![var("x")])]),
            Rule::new("e", Atom::new("Nope", vec![var("x")]), vec![Atom::new("S", vec![var("x")])]),
            Rule::new("c", Atom::new("S", vec![var("x")]), vec![Atom::new("W", vec![var("x")])]),
        ];
        let compiled = compile_rules(&rules, &ctx, Iteration::Prepared);
        let text: Vec<String> = compiled.statements.iter().map(Statement::to_sql).collect();
        assert_eq!(
            text,
            vec!["INSERT INTO W (a) SELECT R0.b FROM S R0", "INSERT INTO S (b) SELECT R0.a FROM W R0"]
        );
        assert_eq!(compiled.failures.len(), 1);
        assert!(compiled.failures[0].to_string().contains("Nope"));
    }

    #[test]
    fn test_create_tables() {
        let mut catalog = catalog();
        catalog.relation_mut("N").unwrap().stratified = true;
        let text: Vec<String> = create_tables(catalog.relation("N").unwrap())
            .iter()
            .map(Statement::to_sql)
            .collect();
        assert_eq!(
            text,
            vec![
                "CREATE TABLE IF NOT EXISTS N (a INTEGER, b TEXT, b_LN INTEGER)",
                "CREATE TABLE IF NOT EXISTS N_INS (a INTEGER, b TEXT, b_LN INTEGER, STRATUM INTEGER)",
                "CREATE TABLE IF NOT EXISTS N_DEL (a INTEGER, b TEXT, b_LN INTEGER, STRATUM INTEGER)",
            ]
        );
    }
}
