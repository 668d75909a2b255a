//! Orchestrates compilation and runs maintenance programs against a session.

use std::path::Path;

use num_bigint::BigInt;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, info, warn};

use crate::algebra::{check_composable, check_safety, decompose, invert, skolemize, FreshNames};
use crate::ast::{
    Argument, Atom, AtomKind, Catalog, Literal, Relation, RelationRole, Rule, RuleBehavior,
    TrustPolicy, LN_LABELED, LN_SQL_NULL,
};
use crate::compiler::{clear_table, compile_rules, create_tables, Iteration, SqlContext};
use crate::config::{EngineConfig, ProvenanceMode};
use crate::delta::{compute_delta_rules, DeltaRules};
use crate::error::{CompileError, ExecError};
use crate::provenance::{add_local_relations, synthesize, TranslationState};
use crate::sql::{Expr, Statement};

pub type Row = Vec<Value>;

/// An open database connection the engine executes statements on.
pub trait Session {
    /// Runs one statement, binding `iteration` to `?1` when the statement
    /// has a parameter. Returns the number of rows changed.
    fn evaluate(&mut self, sql: &str, iteration: Option<i64>) -> Result<usize, ExecError>;

    fn batch(&mut self, statements: &[String]) -> Result<(), ExecError>;

    fn begin(&mut self) -> Result<(), ExecError>;

    fn commit(&mut self) -> Result<(), ExecError>;

    /// Rolls back the open transaction.
    fn reset(&mut self) -> Result<(), ExecError>;

    /// Bulk-loads rows into a table.
    fn import(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<usize, ExecError>;

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, ExecError>;

    fn disconnect(self) -> Result<(), ExecError>
    where
        Self: Sized;
}

pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    pub fn open(path: &Path) -> Result<Self, ExecError> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, ExecError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Session for SqliteSession {
    fn evaluate(&mut self, sql: &str, iteration: Option<i64>) -> Result<usize, ExecError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let changed = if stmt.parameter_count() > 0 {
            stmt.execute([iteration.unwrap_or_default()])?
        } else {
            stmt.execute([])?
        };
        Ok(changed)
    }

    fn batch(&mut self, statements: &[String]) -> Result<(), ExecError> {
        self.conn.execute_batch(&statements.join(";\n"))?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), ExecError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ExecError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), ExecError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn import(&mut self, table: &str, columns: &[String], rows: &[Row]) -> Result<usize, ExecError> {
        let placeholders = (1..=columns.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut count = 0;
        for row in rows {
            count += stmt.execute(params_from_iter(row.iter()))?;
        }
        Ok(count)
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, ExecError> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let rows = stmt
            .query_map([], |row| (0..column_count).map(|i| row.get::<_, Value>(i)).collect())?
            .collect::<Result<Vec<Row>, _>>()?;
        Ok(rows)
    }

    fn disconnect(self) -> Result<(), ExecError> {
        self.conn.close().map_err(|(_, err)| ExecError::from(err))
    }
}

/// What one update cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub statements: usize,
    pub changes: usize,
    /// Semi-naive iterations across all recursive strata.
    pub iterations: usize,
}

/// Executes rule groups, compiling them for the iteration at hand.
struct Runner<'a, S> {
    session: &'a mut S,
    ctx: SqlContext<'a>,
    stats: CycleStats,
}

impl<'a, S: Session> Runner<'a, S> {
    fn exec(&mut self, rules: &[Rule], k: i64) -> Result<usize, ExecError> {
        if rules.is_empty() {
            return Ok(0);
        }
        let iteration = if self.ctx.config.inline_iteration {
            Iteration::Literal(k)
        } else {
            Iteration::Prepared
        };
        let mut changed = 0;
        for statement in compile_rules(rules, &self.ctx, iteration).into_result()? {
            let sql = statement.to_sql();
            let n = self.session.evaluate(&sql, Some(k))?;
            debug!(rows = n, iteration = k, "{}", sql);
            self.stats.statements += 1;
            changed += n;
        }
        self.stats.changes += changed;
        Ok(changed)
    }

    /// Runs `step(k)` for k = start, start + 1, ... until it changes nothing.
    fn fixpoint(
        &mut self,
        stratum: usize,
        start: i64,
        mut step: impl FnMut(&mut Self, i64) -> Result<usize, ExecError>,
    ) -> Result<(), ExecError> {
        let max = self.ctx.config.max_iterations;
        for (count, k) in (start..).enumerate() {
            if count >= max {
                return Err(ExecError::Diverged {
                    stratum,
                    iterations: max,
                });
            }
            self.stats.iterations += 1;
            if step(self, k)? == 0 {
                return Ok(());
            }
        }
        Ok(())
    }

    fn run(&mut self, program: &DeltaRules) -> Result<(), ExecError> {
        for stratum in &program.deletion {
            self.exec(&stratum.seed, 0)?;
            if stratum.recursive {
                self.fixpoint(stratum.index, 1, |runner, k| runner.exec(&stratum.iterate, k))?;
                self.fixpoint(stratum.index, 0, |runner, _| runner.exec(&stratum.rederive, 0))?;
            } else {
                self.exec(&stratum.iterate, 0)?;
                self.exec(&stratum.rederive, 0)?;
            }
        }

        self.exec(&program.apply, 0)?;

        for stratum in &program.insertion {
            self.exec(&stratum.seed, 0)?;
            if stratum.recursive {
                self.exec(&stratum.merge, 0)?;
                self.fixpoint(stratum.index, 0, |runner, k| {
                    let n = runner.exec(&stratum.iterate, k)?;
                    if n > 0 {
                        runner.exec(&stratum.merge, k + 1)?;
                    }
                    Ok(n)
                })?;
            } else {
                self.exec(&stratum.iterate, 0)?;
                self.exec(&stratum.merge, 0)?;
            }
        }

        for name in &program.relations {
            let relation = self.ctx.catalog.relation(name)?;
            for kind in [AtomKind::Insert, AtomKind::Delete] {
                let sql = clear_table(relation.table_name(kind)).to_sql();
                self.session.evaluate(&sql, None)?;
            }
        }
        Ok(())
    }
}

fn literal_value(literal: &Literal) -> Result<Value, CompileError> {
    Ok(match literal {
        Literal::String(s) | Literal::LabeledNull(s) => Value::Text(s.clone()),
        Literal::Integer(n) => Value::Integer(
            i64::try_from(n).map_err(|_| CompileError::IntegerOutOfRange(n.to_string()))?,
        ),
        Literal::Null => Value::Null,
    })
}

fn value_literal(value: Value) -> Literal {
    match value {
        Value::Null => Literal::Null,
        Value::Integer(n) => Literal::Integer(BigInt::from(n)),
        Value::Real(r) => Literal::String(r.to_string()),
        Value::Text(s) => Literal::String(s),
        Value::Blob(bytes) => Literal::String(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

/// A tuple laid out as a physical row, companions included.
fn physical_row(relation: &Relation, tuple: &[Literal]) -> Result<Row, CompileError> {
    let mut row = vec![];
    for (i, literal) in tuple.iter().enumerate() {
        row.push(literal_value(literal)?);
        if relation.has_null_column(i) {
            row.push(Value::Integer(literal.null_marker()));
        }
    }
    Ok(row)
}

/// The inverse of `physical_row` for a base table row.
fn logical_tuple(relation: &Relation, row: Row) -> Vec<Literal> {
    let mut values = row.into_iter();
    let mut tuple = vec![];
    for i in 0..relation.arity() {
        let value = values.next().unwrap_or(Value::Null);
        let marker = if relation.has_null_column(i) {
            values.next()
        } else {
            None
        };
        tuple.push(match (marker, value) {
            (Some(Value::Integer(LN_SQL_NULL)), _) => Literal::Null,
            (Some(Value::Integer(LN_LABELED)), Value::Text(label)) => Literal::LabeledNull(label),
            (_, value) => value_literal(value),
        });
    }
    tuple
}

pub struct Engine<S> {
    /// The catalog as loaded, before any compilation pass touched it.
    user: Catalog,
    /// The user catalog plus provenance and local relations.
    catalog: Catalog,
    config: EngineConfig,
    trust: TrustPolicy,
    session: S,
    translation: Option<TranslationState>,
    delta: Option<DeltaRules>,
}

impl<S: Session> Engine<S> {
    pub fn new(catalog: Catalog, config: EngineConfig, session: S) -> Result<Self, CompileError> {
        config.validate()?;
        catalog.validate()?;
        Ok(Self {
            user: catalog.clone(),
            catalog,
            config,
            trust: TrustPolicy::default(),
            session,
            translation: None,
            delta: None,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn translation(&self) -> Option<&TranslationState> {
        self.translation.as_ref()
    }

    pub fn delta_rules(&self) -> Option<&DeltaRules> {
        self.delta.as_ref()
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// Runs the whole mapping pipeline and returns the rules connecting
    /// source relations, provenance relations and targets. Nothing is
    /// installed unless every stage succeeds.
    pub fn compute_translation_rules(&mut self, trust: &TrustPolicy) -> Result<Vec<Rule>, CompileError> {
        self.config.validate()?;
        self.user.validate()?;

        let mut catalog = self.user.clone();
        let mut fresh = FreshNames::new();

        let mut mappings = vec![];
        for mapping in &catalog.mappings {
            let target = catalog.peer_of(mapping.head_atom());
            let distrusted = target.and_then(|peer| {
                mapping
                    .body
                    .iter()
                    .filter_map(|atom| catalog.peer_of(atom))
                    .find(|source| trust.priority(peer, source) <= 0)
            });
            match distrusted {
                Some(source) => warn!(mapping = %mapping.id, source, "mapping reads from a distrusted peer; skipped"),
                None => mappings.push(mapping.clone()),
            }
        }

        if self.config.bidirectional {
            let inverses: Vec<Rule> = mappings.iter().filter_map(invert).collect();
            debug!(count = inverses.len(), "added inverse mappings");
            mappings.extend(inverses);
        }

        for mapping in &mappings {
            let detail = if mapping.body.iter().any(|atom| atom.negated) {
                "negation in mapping bodies"
            } else if mapping.body.iter().chain(&mapping.head).any(|atom| atom.optional) {
                "optional atoms in mappings"
            } else {
                continue;
            };
            return Err(CompileError::Unsupported {
                mapping: mapping.id.clone(),
                detail: detail.to_owned(),
            }
            .in_rule(mapping));
        }

        let materialized = |atom: &Atom| {
            atom.relation()
                .and_then(|name| catalog.relations.get(name))
                .map_or(true, |r| r.materialized)
        };
        let mut rules = vec![];
        for mut mapping in mappings {
            skolemize(&mut mapping);
            let repeats = mapping.head.iter().filter_map(Atom::relation).collect::<Vec<_>>();
            let split = self.config.provenance == ProvenanceMode::OuterUnion
                || mapping.head.iter().any(|head| !materialized(head))
                || repeats.len() != repeats.iter().collect::<std::collections::HashSet<_>>().len();
            if split {
                rules.extend(decompose(mapping));
            } else {
                rules.push(mapping);
            }
        }

        check_composable(&rules, &catalog)?;
        for rule in &rules {
            check_safety(rule).map_err(|err| err.in_rule(rule))?;
        }

        let mut state = TranslationState::default();
        synthesize(rules, &mut catalog, &self.config, trust, &mut state)?;
        state.compose_virtual(&catalog, &mut fresh)?;
        state.minimize(&catalog);
        add_local_relations(&mut catalog, &mut state)?;

        info!(
            mappings = state.source_to_provenance.len(),
            provenance = state.provenance.len(),
            discarded = state.discarded.len(),
            relations = catalog.relations.len(),
            "computed translation rules"
        );
        let rules = state.mapping_rules();
        self.catalog = catalog;
        self.trust = trust.clone();
        self.translation = Some(state);
        self.delta = None;
        Ok(rules)
    }

    /// Derives the maintenance program, running the translation first if
    /// it has not run yet.
    pub fn compute_delta_rules(&mut self) -> Result<&DeltaRules, CompileError> {
        if self.translation.is_none() {
            let trust = self.trust.clone();
            self.compute_translation_rules(&trust)?;
        }
        let Some(state) = self.translation.as_ref() else {
            return Err(CompileError::IncompatibleSchema("no translation state".to_owned()));
        };
        let delta = compute_delta_rules(state, &mut self.catalog)?;
        Ok(self.delta.insert(delta))
    }

    fn ensure_delta(&mut self) -> Result<(), CompileError> {
        if self.delta.is_none() {
            self.compute_delta_rules()?;
        }
        Ok(())
    }

    /// The SQL of every program group, labeled, with the iteration counter
    /// left as a parameter.
    pub fn program_sql(&mut self) -> Result<Vec<(String, Vec<String>)>, CompileError> {
        self.ensure_delta()?;
        let Some(program) = self.delta.as_ref() else {
            return Ok(vec![]);
        };
        let ctx = SqlContext {
            catalog: &self.catalog,
            config: &self.config,
        };
        let render = |rules: &[Rule]| -> Result<Vec<String>, CompileError> {
            Ok(compile_rules(rules, &ctx, Iteration::Prepared)
                .into_result()?
                .iter()
                .map(Statement::to_sql)
                .collect())
        };

        let mut groups = vec![];
        for s in &program.deletion {
            groups.push((format!("deletion {} seed", s.index), render(&s.seed)?));
            groups.push((format!("deletion {} iterate", s.index), render(&s.iterate)?));
            groups.push((format!("deletion {} rederive", s.index), render(&s.rederive)?));
        }
        groups.push(("apply".to_owned(), render(&program.apply)?));
        for s in &program.insertion {
            groups.push((format!("insertion {} seed", s.index), render(&s.seed)?));
            groups.push((format!("insertion {} iterate", s.index), render(&s.iterate)?));
            groups.push((format!("insertion {} merge", s.index), render(&s.merge)?));
        }
        groups.push(("reset".to_owned(), render(&program.reset)?));
        groups.retain(|(_, statements)| !statements.is_empty());
        Ok(groups)
    }

    /// Creates the base, insert and delete tables of every stored relation.
    pub fn create_schema(&mut self) -> Result<(), ExecError> {
        self.ensure_delta()?;
        let mut statements: Vec<String> = self
            .catalog
            .relations
            .values()
            .filter(|r| r.materialized && r.role != RelationRole::View)
            .flat_map(create_tables)
            .map(|statement| statement.to_sql())
            .collect();
        let tables = statements.len();
        let ctx = SqlContext {
            catalog: &self.catalog,
            config: &self.config,
        };
        for view in self.translation.iter().flat_map(|state| &state.views) {
            for statement in view.rule.to_statements(&ctx, Iteration::Prepared)? {
                statements.push(statement.to_sql());
            }
        }
        info!(tables, views = statements.len() - tables, "creating schema");
        self.session.batch(&statements)
    }

    /// The local relation user edits of `relation` go to.
    fn local(&self, relation: &str) -> Result<&Relation, CompileError> {
        let peer = self.catalog.relation(relation)?;
        if peer.role != RelationRole::Peer || !peer.materialized {
            return Err(CompileError::IncompatibleSchema(format!(
                "{} does not accept local edits",
                relation
            )));
        }
        self.catalog.relation(&peer.local_name())
    }

    fn fact(&self, relation: &Relation, id: &str, kind: AtomKind, tuple: &[Literal]) -> Result<Rule, CompileError> {
        let args = tuple
            .iter()
            .zip(&relation.columns)
            .map(|(literal, column)| match literal {
                Literal::Null => Argument::typed_null(column.ty),
                literal => Argument::constant(literal.clone()),
            })
            .collect::<Vec<_>>();
        if args.len() != relation.arity() || tuple.len() != relation.arity() {
            return Err(CompileError::Arity {
                relation: relation.name.clone(),
                expected: relation.arity(),
                found: tuple.len(),
            });
        }
        let rule = Rule::new(id, Atom::new(relation.name.clone(), args).with_kind(kind), vec![]);
        self.catalog.validate_rule(&rule).map_err(|err| err.in_rule(&rule))?;
        Ok(rule)
    }

    fn run_rule(&mut self, rule: &Rule) -> Result<usize, ExecError> {
        let ctx = SqlContext {
            catalog: &self.catalog,
            config: &self.config,
        };
        let mut changed = 0;
        for sql in rule.to_update(&ctx, Iteration::Literal(0))? {
            changed += self.session.evaluate(&sql, None)?;
        }
        Ok(changed)
    }

    /// Queues a local insertion into `relation`, applied by the next cycle.
    pub fn insert(&mut self, relation: &str, tuple: &[Literal]) -> Result<(), ExecError> {
        self.ensure_delta()?;
        let local = self.local(relation)?;
        let rule = self.fact(local, "insert", AtomKind::Insert, tuple)?;
        self.run_rule(&rule)?;
        debug!(relation, "queued insertion");
        Ok(())
    }

    /// Queues a local deletion from `relation` and cancels any pending
    /// insertion of the same tuple.
    pub fn delete(&mut self, relation: &str, tuple: &[Literal]) -> Result<(), ExecError> {
        self.ensure_delta()?;
        let local = self.local(relation)?.clone();
        let rule = self.fact(&local, "delete", AtomKind::Delete, tuple)?;
        self.run_rule(&rule)?;

        let cancelled = if local.key.is_empty() {
            let table = local.table_name(AtomKind::Insert);
            let columns = local.physical_columns(AtomKind::Insert);
            let selection = columns
                .iter()
                .zip(physical_row(&local, tuple)?)
                .map(|((column, _), value)| {
                    let value = match value {
                        Value::Integer(n) => Expr::int(n),
                        Value::Text(s) => Expr::Text(s),
                        _ => Expr::Null,
                    };
                    Expr::column(&table, column).is(value)
                })
                .collect();
            let sql = Statement::Delete { table, selection }.to_sql();
            self.session.evaluate(&sql, None)?
        } else {
            let rule = Rule {
                behavior: RuleBehavior::DeleteFromHead,
                ..self.fact(&local, "cancel", AtomKind::Insert, tuple)?
            };
            self.run_rule(&rule)?
        };
        debug!(relation, cancelled, "queued deletion");
        Ok(())
    }

    /// Bulk-loads tuples as pending local insertions.
    pub fn import(&mut self, relation: &str, tuples: &[Vec<Literal>]) -> Result<usize, ExecError> {
        self.ensure_delta()?;
        let local = self.local(relation)?;
        let table = local.table_name(AtomKind::Insert);
        let columns: Vec<String> = local
            .physical_columns(AtomKind::Insert)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let rows = tuples
            .iter()
            .map(|tuple| {
                if tuple.len() == local.arity() {
                    physical_row(local, tuple)
                } else {
                    Err(CompileError::Arity {
                        relation: local.name.clone(),
                        expected: local.arity(),
                        found: tuple.len(),
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let count = self.session.import(&table, &columns, &rows)?;
        info!(relation, rows = count, "imported");
        Ok(count)
    }

    fn cycle(&mut self) -> Result<CycleStats, ExecError> {
        let Some(program) = self.delta.as_ref() else {
            return Ok(CycleStats::default());
        };
        let mut runner = Runner {
            session: &mut self.session,
            ctx: SqlContext {
                catalog: &self.catalog,
                config: &self.config,
            },
            stats: CycleStats::default(),
        };
        runner.run(program)?;
        Ok(runner.stats)
    }

    /// Runs `body` in one transaction, rolling back on failure.
    fn transaction<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T, ExecError>) -> Result<T, ExecError> {
        self.session.begin()?;
        match body(self) {
            Ok(value) => {
                self.session.commit()?;
                Ok(value)
            }
            Err(err) => {
                warn!("{}; rolling back", err);
                self.session.reset()?;
                Err(err)
            }
        }
    }

    /// Propagates every pending local edit to all derived relations.
    pub fn update_cycle(&mut self) -> Result<CycleStats, ExecError> {
        self.ensure_delta()?;
        let stats = self.transaction(Self::cycle)?;
        info!(
            statements = stats.statements,
            changes = stats.changes,
            iterations = stats.iterations,
            "update cycle complete"
        );
        Ok(stats)
    }

    /// Applies pending edits, then rebuilds every relation from the local
    /// relations alone.
    pub fn recompute(&mut self) -> Result<CycleStats, ExecError> {
        self.update_cycle()?;
        let stats = self.transaction(|engine| {
            let Some(program) = engine.delta.as_ref() else {
                return Ok(CycleStats::default());
            };
            let reset = program.reset.clone();
            let tables: Vec<String> = program
                .relations
                .iter()
                .map(|name| Ok(engine.catalog.relation(name)?.table_name(AtomKind::Base)))
                .collect::<Result<_, CompileError>>()?;

            for rule in &reset {
                engine.run_rule(rule)?;
            }
            for table in tables {
                engine.session.evaluate(&clear_table(table).to_sql(), None)?;
            }
            engine.cycle()
        })?;
        info!(changes = stats.changes, "recomputed");
        Ok(stats)
    }

    /// The current tuples of a stored relation.
    pub fn contents(&mut self, relation: &str) -> Result<Vec<Vec<Literal>>, ExecError> {
        let relation = self.catalog.relation(relation)?.clone();
        if !relation.materialized {
            return Err(ExecError::NotFound(format!("{} is not stored", relation.name)));
        }
        let columns: Vec<String> = relation
            .physical_columns(AtomKind::Base)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let sql = format!("SELECT {} FROM {}", columns.join(", "), relation.name);
        Ok(self
            .session
            .query(&sql)?
            .into_iter()
            .map(|row| logical_tuple(&relation, row))
            .collect())
    }
}
