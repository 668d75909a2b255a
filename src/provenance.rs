//! Provenance relations: one auxiliary table per mapping (or per target
//! relation) recording the values every derivation was built from.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::algebra::{compose, minimize, FreshNames};
use crate::ast::{
    Argument, Atom, Catalog, Column, ColumnName, ColumnType, Constant, Identifier, Literal,
    Relation, RelationName, RelationRole, Rule, RuleBehavior, TrustPolicy,
};
use crate::config::{EngineConfig, ProvenanceMode};
use crate::error::CompileError;

/// Column holding the id of the mapping that produced an outer-union row.
pub const MAPPING_COLUMN: &str = "MID";
pub const TRUST_PREFIX: &str = "TRUST_";
pub const PROVENANCE_PREFIX: &str = "P_";
pub const OUTER_JOIN_PREFIX: &str = "J_";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub relation: RelationName,
    pub column: ColumnName,
}

impl ColumnRef {
    fn new(relation: &Relation, column: &Column) -> Self {
        Self {
            relation: relation.name.clone(),
            column: column.name.clone(),
        }
    }
}

/// Identity of a provenance column. Contributions of different rules with
/// the same identity share one column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnKey {
    /// A column of the derived tuple.
    Target {
        relation: RelationName,
        column: ColumnName,
    },
    /// A body variable the head does not mention. `ordinal` separates
    /// repeated reads of the same source column in one rule.
    Source {
        relation: RelationName,
        column: ColumnName,
        ordinal: usize,
    },
}

/// What one rule puts into one provenance column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Contribution {
    /// The rule does not produce this column.
    Padding,
    /// The rule explicitly projects SQL NULL here.
    OriginalNull,
    Source {
        source_columns: Vec<ColumnRef>,
        target_columns: Vec<ColumnRef>,
        arg: Argument,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceColumn {
    pub key: ColumnKey,
    pub name: ColumnName,
    pub ty: ColumnType,
    pub nullable: bool,
    /// One entry per contributing rule, in rule order.
    pub contributions: Vec<Contribution>,
}

impl ProvenanceColumn {
    fn may_be_null(&self) -> bool {
        self.nullable
            || self
                .contributions
                .iter()
                .any(|c| !matches!(c, Contribution::Source { .. }))
    }
}

/// How the rules of a provenance relation combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// A single-head mapping.
    Single,
    /// A multi-head mapping: every target is a projection of the same rows.
    InnerJoin,
    /// All mappings into one target relation, padded to a common schema.
    OuterUnion,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRelation {
    pub name: RelationName,
    pub kind: GroupKind,
    pub peer: Option<Identifier>,
    pub columns: Vec<ProvenanceColumn>,
    /// Contributing rule ids.
    pub rules: Vec<Identifier>,
    /// Source peers with a trust column, sorted.
    pub trust: BTreeSet<Identifier>,
    pub labeled_nulls: bool,
}

impl ProvenanceRelation {
    pub fn new(name: impl Into<RelationName>, kind: GroupKind, peer: Option<Identifier>) -> Self {
        Self {
            name: name.into(),
            kind,
            peer,
            columns: vec![],
            rules: vec![],
            trust: BTreeSet::new(),
            labeled_nulls: false,
        }
    }

    fn has_mapping_column(&self) -> bool {
        self.kind == GroupKind::OuterUnion
    }

    /// Every column holds exactly one contribution per rule added so far.
    pub fn is_aligned(&self) -> bool {
        self.columns
            .iter()
            .all(|c| c.contributions.len() == self.rules.len())
    }

    fn column_name(&self, key: &ColumnKey) -> ColumnName {
        let base = match key {
            ColumnKey::Target { relation, column } => format!("{}_{}", relation, column),
            ColumnKey::Source {
                relation,
                column,
                ordinal: 0,
            } => format!("SRC_{}_{}", relation, column),
            ColumnKey::Source {
                relation,
                column,
                ordinal,
            } => format!("SRC_{}_{}_{}", relation, column, ordinal),
        };
        let taken = |name: &str| self.columns.iter().any(|c| c.name == name);
        if !taken(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{}_{}", base, n))
            .find(|name| !taken(name))
            .unwrap_or(base)
    }

    /// Adds one contributing rule. Columns the rule shares with earlier
    /// rules get its contribution at the rule's index; new columns are
    /// back-filled with padding, and columns the rule does not produce are
    /// padded after it.
    pub fn add_rule(&mut self, rule: &Rule, catalog: &Catalog) -> Result<(), CompileError> {
        let index = self.rules.len();
        for (key, column, contribution) in contributions(rule, catalog)? {
            let position = match self.columns.iter().position(|c| c.key == key) {
                Some(position) => position,
                None => {
                    let name = self.column_name(&key);
                    self.columns.push(ProvenanceColumn {
                        key,
                        name,
                        ty: column.ty,
                        nullable: false,
                        contributions: vec![Contribution::Padding; index],
                    });
                    self.columns.len() - 1
                }
            };

            let slot = &mut self.columns[position];
            if slot.contributions.len() > index {
                return Err(CompileError::IncompatibleSchema(format!(
                    "rule {} writes provenance column {} twice",
                    rule.id, slot.name
                )));
            }
            if slot.ty != column.ty {
                return Err(CompileError::IncompatibleTypes {
                    mapping: rule.id.clone(),
                    detail: format!("provenance column {} is {} and {}", slot.name, slot.ty, column.ty),
                });
            }
            slot.nullable |= column.nullable;
            slot.contributions.push(contribution);
        }

        self.rules.push(rule.id.clone());
        for column in &mut self.columns {
            if column.contributions.len() < self.rules.len() {
                column.contributions.push(Contribution::Padding);
            }
        }

        self.trust.extend(source_peers(rule, catalog));
        self.labeled_nulls |= rule
            .head
            .iter()
            .chain(&rule.body)
            .filter_map(Atom::relation)
            .any(|name| catalog.relations.get(name).map_or(false, |r| r.labeled_nulls));
        debug!(provenance = %self.name, rule = %rule.id, columns = self.columns.len(), "aligned");
        Ok(())
    }

    fn data_offset(&self) -> usize {
        usize::from(self.has_mapping_column())
    }

    /// The table definition: the mapping column in outer-union mode, data
    /// columns, then one trust column per source peer.
    pub fn relation(&self) -> Relation {
        let mut columns = vec![];
        if self.has_mapping_column() {
            columns.push(Column::new(MAPPING_COLUMN, ColumnType::Text, false));
        }
        for column in &self.columns {
            columns.push(Column::new(column.name.clone(), column.ty, column.may_be_null()));
        }
        let key = (0..columns.len()).collect();
        for peer in &self.trust {
            columns.push(Column::new(format!("{}{}", TRUST_PREFIX, peer), ColumnType::Integer, true));
        }
        Relation {
            peer: self.peer.clone(),
            role: RelationRole::Provenance,
            key,
            labeled_nulls: self.labeled_nulls,
            ..Relation::new(self.name.clone(), columns)
        }
    }

    /// The rule filling this relation from the body of contributing rule
    /// `index`.
    pub fn source_rule(&self, index: usize, rule: &Rule, catalog: &Catalog, trust: &TrustPolicy) -> Rule {
        let mut args = vec![];
        if self.has_mapping_column() {
            args.push(Argument::constant(Literal::String(rule.id.clone())));
        }
        for column in &self.columns {
            args.push(match &column.contributions[index] {
                Contribution::Source { arg, .. } => arg.clone(),
                Contribution::Padding | Contribution::OriginalNull => Argument::typed_null(column.ty),
            });
        }
        let peers = source_peers(rule, catalog);
        let target_peer = self.peer.as_deref().unwrap_or_default();
        for peer in &self.trust {
            args.push(if peers.contains(peer) {
                Argument::Constant(Constant {
                    ty: Some(ColumnType::Integer),
                    value: Literal::Integer(trust.priority(target_peer, peer).into()),
                })
            } else {
                Argument::typed_null(ColumnType::Integer)
            });
        }

        Rule {
            head: vec![Atom::new(self.name.clone(), args)],
            provenance: Some(self.name.clone()),
            ..rule.clone()
        }
    }

    /// Target relations of the contributing rules, in column order.
    pub fn targets(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter_map(|c| match &c.key {
                ColumnKey::Target { relation, .. } => Some(relation.as_str()),
                ColumnKey::Source { .. } => None,
            })
            .fold(vec![], |mut seen, name| {
                if !seen.contains(&name) {
                    seen.push(name);
                }
                seen
            })
    }

    /// One projection rule per target relation.
    pub fn target_rules(&self, catalog: &Catalog) -> Result<Vec<Rule>, CompileError> {
        let width = self.data_offset() + self.columns.len() + self.trust.len();
        let body_args: Vec<Argument> = (0..width).map(|i| Argument::var(format!("c{}", i))).collect();
        let body = Atom::new(self.name.clone(), body_args.clone());

        let mut rules = vec![];
        for target in self.targets() {
            let relation = catalog.relation(target)?;
            let mut head_args = vec![];
            for column in &relation.columns {
                let key = ColumnKey::Target {
                    relation: relation.name.clone(),
                    column: column.name.clone(),
                };
                let position = self
                    .columns
                    .iter()
                    .position(|c| c.key == key)
                    .ok_or_else(|| {
                        CompileError::IncompatibleSchema(format!(
                            "provenance relation {} does not cover {}.{}",
                            self.name, relation.name, column.name
                        ))
                    })?;
                head_args.push(body_args[self.data_offset() + position].clone());
            }
            let mut rule = Rule::new(
                format!("{}_{}", self.name, target),
                Atom::new(target, head_args),
                vec![body.clone()],
            );
            rule.provenance = Some(self.name.clone());
            rules.push(rule);
        }
        Ok(rules)
    }
}

/// A target relation beside the provenance rows of every mapping into it.
/// Each tuple of the target is left outer joined with each member
/// provenance relation on the target's columns, so a mapping that does not
/// derive the tuple shows as NULLs in its columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuterJoinView {
    pub name: RelationName,
    pub target: RelationName,
    /// Provenance relations joined in, in synthesis order.
    pub members: Vec<RelationName>,
    /// `J_T(t̄, p̄1, ..) :- T(t̄), optional P1(..), ..`, lowered to a view.
    pub rule: Rule,
}

impl OuterJoinView {
    /// The view and its relation. Member columns holding the target's own
    /// columns are join conditions; every other member column is projected
    /// as `<member>_<column>`.
    pub fn new(target: &Relation, members: &[&ProvenanceRelation]) -> (Self, Relation) {
        let name = format!("{}{}", OUTER_JOIN_PREFIX, target.name);
        let target_args: Vec<Argument> = (0..target.arity())
            .map(|i| Argument::var(format!("t{}", i)))
            .collect();

        let mut columns = target.columns.clone();
        let mut head_args = target_args.clone();
        let mut body = vec![Atom::new(target.name.clone(), target_args.clone())];
        for (m, member) in members.iter().enumerate() {
            let relation = member.relation();
            let offset = member.data_offset();
            let mut args = vec![];
            for (i, column) in relation.columns.iter().enumerate() {
                let joined = i
                    .checked_sub(offset)
                    .and_then(|j| member.columns.get(j))
                    .and_then(|c| match &c.key {
                        ColumnKey::Target { relation, column } if relation == &target.name => {
                            target.columns.iter().position(|t| &t.name == column)
                        }
                        _ => None,
                    });
                match joined {
                    Some(k) => args.push(target_args[k].clone()),
                    None => {
                        let arg = Argument::var(format!("p{}_{}", m, i));
                        columns.push(Column::new(
                            format!("{}_{}", member.name, column.name),
                            column.ty,
                            true,
                        ));
                        head_args.push(arg.clone());
                        args.push(arg);
                    }
                }
            }
            body.push(Atom::new(member.name.clone(), args).optional());
        }

        let mut rule = Rule::new(format!("{}_view", name), Atom::new(name.clone(), head_args), body);
        rule.behavior = RuleBehavior::View;
        let relation = Relation {
            role: RelationRole::View,
            ..Relation::new(name.clone(), columns)
        };
        let view = Self {
            name,
            target: target.name.clone(),
            members: members.iter().map(|p| p.name.clone()).collect(),
            rule,
        };
        (view, relation)
    }
}

/// One outer-join view per materialized target relation.
fn add_outer_join_views(catalog: &mut Catalog, state: &mut TranslationState) -> Result<(), CompileError> {
    let mut targets: Vec<RelationName> = vec![];
    for provenance in &state.provenance {
        for target in provenance.targets() {
            if !targets.iter().any(|t| t == target) {
                targets.push(target.to_owned());
            }
        }
    }

    for target in targets {
        let relation = catalog.relation(&target)?.clone();
        if !relation.materialized {
            continue;
        }
        let members: Vec<&ProvenanceRelation> = state
            .provenance
            .iter()
            .filter(|p| p.targets().contains(&target.as_str()))
            .collect();
        let (view, view_relation) = OuterJoinView::new(&relation, &members);
        catalog.add_relation(view_relation)?;
        info!(view = %view.name, members = view.members.len(), "synthesized outer join view");
        state.views.push(view);
    }
    Ok(())
}

/// Peers owning the relations a rule reads.
fn source_peers(rule: &Rule, catalog: &Catalog) -> BTreeSet<Identifier> {
    rule.body
        .iter()
        .filter(|atom| atom.is_positive_relation())
        .filter_map(|atom| catalog.peer_of(atom))
        .map(str::to_owned)
        .collect()
}

/// Per output column of `rule`: its identity, the column it is typed by,
/// and what the rule contributes to it.
fn contributions(rule: &Rule, catalog: &Catalog) -> Result<Vec<(ColumnKey, Column, Contribution)>, CompileError> {
    let positive: Vec<(&Atom, &Relation)> = rule
        .body
        .iter()
        .filter(|atom| atom.is_positive_relation())
        .map(|atom| -> Result<(&Atom, &Relation), CompileError> {
            Ok((atom, catalog.relation(atom.relation().unwrap_or_default())?))
        })
        .collect::<Result<_, _>>()?;

    let mut occurrences: HashMap<&str, Vec<ColumnRef>> = HashMap::new();
    for (atom, relation) in &positive {
        for (arg, column) in atom.args.iter().zip(&relation.columns) {
            if let Argument::Variable(v) = arg {
                occurrences
                    .entry(v.name.as_str())
                    .or_default()
                    .push(ColumnRef::new(relation, column));
            }
        }
    }

    let mut out = vec![];
    let mut head_variables = HashSet::new();
    for head in &rule.head {
        let target = catalog.relation(head.relation().unwrap_or_default())?;
        for (arg, column) in head.args.iter().zip(&target.columns) {
            head_variables.extend(arg.variables().into_iter().map(|v| v.name.as_str()));
            let contribution = if arg.is_null() {
                Contribution::OriginalNull
            } else {
                let source_columns = match arg {
                    Argument::Variable(v) => occurrences.get(v.name.as_str()).cloned().unwrap_or_default(),
                    _ => vec![],
                };
                Contribution::Source {
                    source_columns,
                    target_columns: vec![ColumnRef::new(target, column)],
                    arg: arg.clone(),
                }
            };
            let key = ColumnKey::Target {
                relation: target.name.clone(),
                column: column.name.clone(),
            };
            out.push((key, column.clone(), contribution));
        }
    }

    let mut ordinals: HashMap<(&str, &str), usize> = HashMap::new();
    let mut seen = HashSet::new();
    for (atom, relation) in &positive {
        for (arg, column) in atom.args.iter().zip(&relation.columns) {
            let Argument::Variable(v) = arg else { continue };
            if head_variables.contains(v.name.as_str()) || !seen.insert(v.name.as_str()) {
                continue;
            }
            let counter = ordinals
                .entry((relation.name.as_str(), column.name.as_str()))
                .or_insert(0);
            let key = ColumnKey::Source {
                relation: relation.name.clone(),
                column: column.name.clone(),
                ordinal: *counter,
            };
            *counter += 1;
            let contribution = Contribution::Source {
                source_columns: occurrences.get(v.name.as_str()).cloned().unwrap_or_default(),
                target_columns: vec![],
                arg: arg.clone(),
            };
            out.push((key, column.clone(), contribution));
        }
    }
    Ok(out)
}

/// Outer-union rows are told apart by the target key, so every
/// contributing rule must fill it with something that is never NULL.
fn check_key_bound(rule: &Rule, catalog: &Catalog) -> Result<(), CompileError> {
    let head = rule.head_atom();
    let target = catalog.relation(head.relation().unwrap_or_default())?;
    for &k in &target.key {
        let nullable_only = match &head.args[k] {
            Argument::Constant(c) => c.value == Literal::Null,
            Argument::Skolem(_) => false,
            Argument::Variable(v) if v.skolem.is_some() => false,
            Argument::Variable(v) => {
                let mut columns = rule
                    .body
                    .iter()
                    .filter(|atom| atom.is_positive_relation())
                    .filter_map(|atom| {
                        let relation = catalog.relations.get(atom.relation()?)?;
                        Some(atom.args.iter().zip(&relation.columns).filter_map(|(arg, column)| {
                            matches!(arg, Argument::Variable(w) if w == v).then(|| column.nullable)
                        }).collect::<Vec<_>>())
                    })
                    .flatten()
                    .peekable();
                columns.peek().is_some() && columns.all(|nullable| nullable)
            }
        };
        if nullable_only {
            return Err(CompileError::IncompatibleKeys {
                mapping: rule.to_string(),
                detail: format!(
                    "key column {}.{} may be null",
                    target.name, target.columns[k].name
                ),
            });
        }
    }
    Ok(())
}

/// A body atom that minimization removed from a translation rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedAtom {
    pub rule: Identifier,
    pub atom: Atom,
}

/// Everything the mapping pipeline produces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationState {
    pub local_rules: Vec<Rule>,
    pub source_to_provenance: Vec<Rule>,
    pub provenance_to_target: Vec<Rule>,
    pub provenance: Vec<ProvenanceRelation>,
    pub edb: BTreeSet<RelationName>,
    pub idb: BTreeSet<RelationName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discarded: Vec<DiscardedAtom>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub views: Vec<OuterJoinView>,
}

impl TranslationState {
    /// Inlines non-materialized targets: rules reading a virtual relation
    /// read the provenance relations behind it instead, and the projection
    /// rules into virtual relations are dropped.
    pub fn compose_virtual(&mut self, catalog: &Catalog, fresh: &mut FreshNames) -> Result<(), CompileError> {
        let is_virtual = |rule: &Rule| {
            catalog
                .relations
                .get(rule.head_relation())
                .map_or(false, |r| !r.materialized)
        };
        let (definitions, targets): (Vec<Rule>, Vec<Rule>) =
            self.provenance_to_target.drain(..).partition(|rule| is_virtual(rule));
        self.provenance_to_target = targets;
        if definitions.is_empty() {
            return Ok(());
        }

        let rules = self.source_to_provenance.drain(..).chain(definitions).collect();
        self.source_to_provenance = compose(rules, catalog, fresh)?;
        debug!(rules = self.source_to_provenance.len(), "composed virtual relations");
        Ok(())
    }

    /// Minimizes every mapping rule, recording the atoms it drops.
    pub fn minimize(&mut self, catalog: &Catalog) {
        let is_provenance = |name: &str| catalog.is_provenance(name);
        for rule in self
            .source_to_provenance
            .iter_mut()
            .chain(self.provenance_to_target.iter_mut())
        {
            let dropped = minimize(rule, &is_provenance);
            self.discarded.extend(dropped.into_iter().map(|atom| DiscardedAtom {
                rule: rule.id.clone(),
                atom,
            }));
        }
    }

    /// Every translation rule: local contributions, then source to
    /// provenance, then provenance to target.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.local_rules
            .iter()
            .chain(&self.source_to_provenance)
            .chain(&self.provenance_to_target)
    }

    /// Rules that came from mappings, the result of the translation pass.
    pub fn mapping_rules(&self) -> Vec<Rule> {
        self.source_to_provenance
            .iter()
            .chain(&self.provenance_to_target)
            .cloned()
            .collect()
    }
}

/// Groups canonical mapping rules into provenance relations, registers
/// those relations in `catalog` and rewires every mapping through them.
pub fn synthesize(
    rules: Vec<Rule>,
    catalog: &mut Catalog,
    config: &EngineConfig,
    trust: &TrustPolicy,
    state: &mut TranslationState,
) -> Result<(), CompileError> {
    let mut groups: Vec<(ProvenanceRelation, Vec<Rule>)> = vec![];
    for rule in rules {
        let peer = catalog.peer_of(rule.head_atom()).map(str::to_owned);
        match config.provenance {
            ProvenanceMode::Union | ProvenanceMode::OuterJoin => {
                let kind = if rule.head.len() > 1 {
                    GroupKind::InnerJoin
                } else {
                    GroupKind::Single
                };
                let name = format!("{}{}", PROVENANCE_PREFIX, rule.id);
                groups.push((ProvenanceRelation::new(name, kind, peer), vec![rule]));
            }
            ProvenanceMode::OuterUnion => {
                check_key_bound(&rule, catalog)?;
                let name = format!("{}{}", PROVENANCE_PREFIX, rule.head_relation());
                match groups.iter_mut().find(|(p, _)| p.name == name) {
                    Some((_, members)) => members.push(rule),
                    None => groups.push((
                        ProvenanceRelation::new(name, GroupKind::OuterUnion, peer),
                        vec![rule],
                    )),
                }
            }
        }
    }

    for (mut provenance, members) in groups {
        for rule in &members {
            provenance.add_rule(rule, catalog)?;
        }
        catalog.add_relation(provenance.relation())?;
        for (index, rule) in members.iter().enumerate() {
            state
                .source_to_provenance
                .push(provenance.source_rule(index, rule, catalog, trust));
        }
        state
            .provenance_to_target
            .extend(provenance.target_rules(catalog)?);
        state.idb.insert(provenance.name.clone());
        info!(
            provenance = %provenance.name,
            rules = provenance.rules.len(),
            columns = provenance.columns.len(),
            "synthesized provenance relation"
        );
        state.provenance.push(provenance);
    }

    if config.provenance == ProvenanceMode::OuterJoin {
        add_outer_join_views(catalog, state)?;
    }
    Ok(())
}

/// Adds `R_L` and the rule `R(x̄) :- R_L(x̄)` for every materialized peer
/// relation.
pub fn add_local_relations(catalog: &mut Catalog, state: &mut TranslationState) -> Result<(), CompileError> {
    let peers: Vec<Relation> = catalog
        .relations
        .values()
        .filter(|r| r.role == RelationRole::Peer && r.materialized)
        .cloned()
        .collect();

    for relation in peers {
        let local = relation.local_relation();
        let args: Vec<Argument> = (0..relation.arity())
            .map(|i| Argument::var(format!("x{}", i)))
            .collect();
        state.local_rules.push(Rule::new(
            format!("{}_local", relation.name),
            Atom::new(relation.name.clone(), args.clone()),
            vec![Atom::new(local.name.clone(), args)],
        ));
        state.edb.insert(local.name.clone());
        state.idb.insert(relation.name.clone());
        catalog.add_relation(local)?;
    }
    Ok(())
}
