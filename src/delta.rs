//! Incremental maintenance: stratification and the insertion and deletion
//! programs derived from the translation rules.
//!
//! Deletions are propagated first (over-delete, then re-derive against the
//! post-deletion state), applied to the base tables, and only then are
//! insertions propagated. Relations in a recursive stratum tag the rows of
//! their delta tables with the semi-naive iteration that produced them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ast::{
    Argument, Atom, AtomKind, Catalog, HeadStratum, RelationName, Rule, RuleBehavior,
    StratumGuard,
};
use crate::error::CompileError;
use crate::provenance::TranslationState;

/// A strongly connected set of relations, evaluated together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stratum {
    pub relations: Vec<RelationName>,
    pub recursive: bool,
}

struct Tarjan<'a> {
    edges: &'a BTreeMap<&'a str, BTreeSet<&'a str>>,
    index: HashMap<&'a str, usize>,
    low: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: HashSet<&'a str>,
    components: Vec<Vec<&'a str>>,
}

impl<'a> Tarjan<'a> {
    fn visit(&mut self, node: &'a str) {
        let index = self.index.len();
        self.index.insert(node, index);
        self.low.insert(node, index);
        self.stack.push(node);
        self.on_stack.insert(node);

        let edges = self.edges;
        for &next in edges.get(node).into_iter().flatten() {
            if !self.index.contains_key(next) {
                self.visit(next);
                let low = self.low[next].min(self.low[node]);
                self.low.insert(node, low);
            } else if self.on_stack.contains(next) {
                let low = self.index[next].min(self.low[node]);
                self.low.insert(node, low);
            }
        }

        if self.low[node] == self.index[node] {
            let mut component = vec![];
            while let Some(top) = self.stack.pop() {
                self.on_stack.remove(top);
                component.push(top);
                if top == node {
                    break;
                }
            }
            component.sort_unstable();
            self.components.push(component);
        }
    }
}

/// Orders `relations` into strata so that every relation comes after the
/// relations its rules read. Relations that depend on each other share a
/// stratum, which is recursive when it holds more than one relation or a
/// relation that reads itself.
pub fn stratify(rules: &[Rule], relations: &BTreeSet<RelationName>) -> Vec<Stratum> {
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for rule in rules {
        for atom in &rule.body {
            if let Some(body) = atom.relation() {
                edges.entry(body).or_default().insert(rule.head_relation());
            }
        }
    }

    let mut tarjan = Tarjan {
        edges: &edges,
        index: HashMap::new(),
        low: HashMap::new(),
        stack: vec![],
        on_stack: HashSet::new(),
        components: vec![],
    };
    for node in relations {
        if !tarjan.index.contains_key(node.as_str()) {
            tarjan.visit(node);
        }
    }

    tarjan
        .components
        .into_iter()
        .rev()
        .map(|component| {
            let recursive = component.len() > 1
                || edges
                    .get(component[0])
                    .map_or(false, |heads| heads.contains(component[0]));
            Stratum {
                relations: component.into_iter().map(str::to_owned).collect(),
                recursive,
            }
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionStratum {
    pub index: usize,
    pub relations: Vec<RelationName>,
    pub recursive: bool,
    /// Over-deletions caused by deletions in lower strata.
    pub seed: Vec<Rule>,
    /// Over-deletions inside the stratum, one semi-naive step per run.
    pub iterate: Vec<Rule>,
    /// Removes tuples from the delete tables that still have a derivation.
    pub rederive: Vec<Rule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertionStratum {
    pub index: usize,
    pub relations: Vec<RelationName>,
    pub recursive: bool,
    /// Insertions caused by lower strata, and pruning of local rows that
    /// are already present.
    pub seed: Vec<Rule>,
    pub iterate: Vec<Rule>,
    /// Moves the insert tables into the base tables.
    pub merge: Vec<Rule>,
}

/// The complete maintenance program of a translation state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRules {
    pub deletion: Vec<DeletionStratum>,
    /// Removes the delete tables from the base tables.
    pub apply: Vec<Rule>,
    pub insertion: Vec<InsertionStratum>,
    /// Copies every local relation into its insert table.
    pub reset: Vec<Rule>,
    /// Every maintained relation, in stratum order.
    pub relations: Vec<RelationName>,
}

impl DeltaRules {
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.deletion
            .iter()
            .flat_map(|s| s.seed.iter().chain(&s.iterate).chain(&s.rederive))
            .chain(&self.apply)
            .chain(
                self.insertion
                    .iter()
                    .flat_map(|s| s.seed.iter().chain(&s.iterate).chain(&s.merge)),
            )
    }
}

fn variables(arity: usize) -> Vec<Argument> {
    (0..arity).map(|i| Argument::var(format!("x{}", i))).collect()
}

/// A rule derived from `rule`, keeping its Skolem arena and lineage.
fn derived(rule: &Rule, id: String, head: Atom, body: Vec<Atom>) -> Rule {
    Rule {
        distinct: true,
        stratified: rule.stratified,
        provenance: rule.provenance.clone(),
        parent: Some(rule.parent.clone().unwrap_or_else(|| rule.id.clone())),
        skolems: rule.skolems.clone(),
        ..Rule::new(id, head, body)
    }
}

/// One rule per positive body atom: the head's deletions caused by that
/// atom's deletions, joined with the rest of the body in the old state.
fn deletion_rules(rule: &Rule, scc: &BTreeSet<&str>, recursive: bool) -> (Vec<Rule>, Vec<Rule>) {
    let head = rule.head_atom().clone().with_kind(AtomKind::Delete);
    let (mut seed, mut iterate) = (vec![], vec![]);
    for (i, atom) in rule.body.iter().enumerate() {
        if !atom.is_positive_relation() {
            continue;
        }
        let mut body = rule.body.clone();
        body[i] = atom.clone().with_kind(AtomKind::Delete);
        let inside = recursive && atom.relation().map_or(false, |name| scc.contains(name));
        if inside {
            body.push(head.clone().negate());
        }
        let mut delta = derived(rule, format!("{}_del{}", rule.id, i), head.clone(), body);
        if recursive {
            delta.head_stratum = Some(if inside {
                HeadStratum::Iteration(0)
            } else {
                HeadStratum::Fixed(0)
            });
        }
        if inside {
            delta.guard = Some(StratumGuard { atom: i, offset: -1 });
            iterate.push(delta);
        } else {
            seed.push(delta);
        }
    }
    (seed, iterate)
}

/// Deletes from the head's delete table every tuple the rule still derives
/// once the pending deletions of its body are taken out.
fn rederive_rule(rule: &Rule) -> Rule {
    let mut body = rule.body.clone();
    body.extend(
        rule.body
            .iter()
            .filter(|atom| atom.is_positive_relation())
            .map(|atom| atom.clone().with_kind(AtomKind::Delete).negate()),
    );
    Rule {
        distinct: false,
        behavior: RuleBehavior::DeleteFromHead,
        ..derived(
            rule,
            format!("{}_red", rule.id),
            rule.head_atom().clone().with_kind(AtomKind::Delete),
            body,
        )
    }
}

/// One rule per positive body atom: new head tuples caused by that atom's
/// insertions, joined with the rest of the body in the current state.
fn insertion_rules(rule: &Rule, scc: &BTreeSet<&str>, recursive: bool) -> (Vec<Rule>, Vec<Rule>) {
    let head = rule.head_atom().clone().with_kind(AtomKind::Insert);
    let (mut seed, mut iterate) = (vec![], vec![]);
    for (i, atom) in rule.body.iter().enumerate() {
        if !atom.is_positive_relation() {
            continue;
        }
        let mut body = rule.body.clone();
        body[i] = atom.clone().with_kind(AtomKind::Insert);
        body.push(rule.head_atom().clone().negate());
        let inside = recursive && atom.relation().map_or(false, |name| scc.contains(name));
        let mut delta = derived(rule, format!("{}_ins{}", rule.id, i), head.clone(), body);
        if recursive {
            delta.head_stratum = Some(if inside {
                HeadStratum::Iteration(1)
            } else {
                HeadStratum::Fixed(0)
            });
        }
        if inside {
            delta.guard = Some(StratumGuard { atom: i, offset: 0 });
            iterate.push(delta);
        } else {
            seed.push(delta);
        }
    }
    (seed, iterate)
}

fn relation_rule(name: &str, id: String, arity: usize, head: AtomKind, body: AtomKind) -> Rule {
    let args = variables(arity);
    Rule {
        distinct: true,
        ..Rule::new(
            id,
            Atom::new(name, args.clone()).with_kind(head),
            vec![Atom::new(name, args).with_kind(body)],
        )
    }
}

/// Derives the maintenance program of `state` and marks the relations and
/// rules of recursive strata as stratified in `catalog`.
pub fn compute_delta_rules(state: &TranslationState, catalog: &mut Catalog) -> Result<DeltaRules, CompileError> {
    let relations: BTreeSet<RelationName> = state.edb.union(&state.idb).cloned().collect();
    let mut rules: Vec<Rule> = state.rules().cloned().collect();
    let strata = stratify(&rules, &relations);

    for stratum in strata.iter().filter(|s| s.recursive) {
        for name in &stratum.relations {
            catalog.relation_mut(name)?.stratified = true;
        }
    }
    let recursive_heads: BTreeSet<&str> = strata
        .iter()
        .filter(|s| s.recursive)
        .flat_map(|s| s.relations.iter().map(String::as_str))
        .collect();
    for rule in &mut rules {
        rule.stratified = recursive_heads.contains(rule.head_relation());
    }

    let mut program = DeltaRules::default();
    for (index, stratum) in strata.iter().enumerate() {
        let scc: BTreeSet<&str> = stratum.relations.iter().map(String::as_str).collect();
        let mut deletion = DeletionStratum {
            index,
            relations: stratum.relations.clone(),
            recursive: stratum.recursive,
            ..DeletionStratum::default()
        };
        let mut insertion = InsertionStratum {
            index,
            relations: stratum.relations.clone(),
            recursive: stratum.recursive,
            ..InsertionStratum::default()
        };

        for rule in rules.iter().filter(|r| scc.contains(r.head_relation())) {
            let (seed, iterate) = deletion_rules(rule, &scc, stratum.recursive);
            deletion.seed.extend(seed);
            deletion.iterate.extend(iterate);
            deletion.rederive.push(rederive_rule(rule));

            let (seed, iterate) = insertion_rules(rule, &scc, stratum.recursive);
            insertion.seed.extend(seed);
            insertion.iterate.extend(iterate);
        }

        for name in &stratum.relations {
            let relation = catalog.relation(name)?;
            let arity = relation.arity();
            if state.edb.contains(name) {
                insertion.seed.push(Rule {
                    behavior: RuleBehavior::DeleteFromHead,
                    ..relation_rule(name, format!("{}_prune", name), arity, AtomKind::Insert, AtomKind::Base)
                });
                program.reset.push(Rule {
                    behavior: RuleBehavior::ClearAndCopy,
                    ..relation_rule(name, format!("{}_reset", name), arity, AtomKind::Insert, AtomKind::Base)
                });
            }

            let mut merge = relation_rule(name, format!("{}_merge", name), arity, AtomKind::Base, AtomKind::Insert);
            if stratum.recursive {
                merge.stratified = true;
                merge.guard = Some(StratumGuard { atom: 0, offset: 0 });
            }
            insertion.merge.push(merge);

            program.apply.push(Rule {
                behavior: RuleBehavior::DeleteFromHead,
                ..relation_rule(name, format!("{}_apply", name), arity, AtomKind::Base, AtomKind::Delete)
            });
            program.relations.push(name.clone());
        }

        debug!(
            stratum = index,
            relations = ?stratum.relations,
            recursive = stratum.recursive,
            "delta stratum"
        );
        program.deletion.push(deletion);
        program.insertion.push(insertion);
    }

    info!(
        strata = strata.len(),
        rules = program.rules().count(),
        "computed delta rules"
    );
    Ok(program)
}
