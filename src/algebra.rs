//! Rule algebra: renaming, unification, composition, Skolemization and
//! minimization of mapping rules.

use std::collections::{BTreeSet, HashMap, HashSet};

use itertools::Itertools;
use tracing::debug;

use crate::ast::{
    Argument, Atom, Builtin, Catalog, Identifier, Rule, SkolemDef, SkolemId, SkolemTerm, Variable,
};
use crate::error::CompileError;

/// Separates a variable's base name from its freshening suffix.
const FRESH_SEPARATOR: char = '$';

/// Source of fresh variable names for one compilation pass.
#[derive(Clone, Debug, Default)]
pub struct FreshNames {
    next: usize,
}

impl FreshNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, base: &str) -> Identifier {
        let base = base.split(FRESH_SEPARATOR).next().unwrap_or(base);
        let name = format!("{}{}{}", base, FRESH_SEPARATOR, self.next);
        self.next += 1;
        name
    }
}

/// Old variable name -> new variable name, shared across calls.
pub type NameMap = HashMap<Identifier, Identifier>;

/// Variable name -> the argument replacing it.
pub type Substitution = HashMap<Identifier, Argument>;

/// Pairs of arguments that must be equal for an atom to fold onto another.
pub type Equalities = Vec<(Argument, Argument)>;

fn rename_argument(arg: &mut Argument, rename: &mut dyn FnMut(&str) -> Identifier) {
    match arg {
        Argument::Variable(v) => v.name = rename(&v.name),
        Argument::Constant(_) => {}
        Argument::Skolem(term) => {
            for arg in &mut term.args {
                rename_argument(arg, rename);
            }
        }
    }
}

/// Renames every variable of `rule` through `names`, inventing a fresh
/// name for variables not mapped yet. Names that are already the result of
/// a renaming in `names` are left alone, so repeated calls with the same
/// map are no-ops.
pub fn freshen(rule: &mut Rule, names: &mut NameMap, fresh: &mut FreshNames) {
    let renamed: HashSet<Identifier> = names.values().cloned().collect();
    let mut rename = |name: &str| -> Identifier {
        if renamed.contains(name) {
            return name.to_owned();
        }
        names
            .entry(name.to_owned())
            .or_insert_with(|| fresh.fresh(name))
            .clone()
    };

    for atom in rule.head.iter_mut().chain(rule.body.iter_mut()) {
        for arg in &mut atom.args {
            rename_argument(arg, &mut rename);
        }
    }
    for def in &mut rule.skolems {
        def.variable = rename(&def.variable);
        for arg in &mut def.term.args {
            rename_argument(arg, &mut rename);
        }
    }
}

/// Like [`freshen`], but leaves `rule` untouched and returns the renamed copy.
pub fn freshened(rule: &Rule, names: &mut NameMap, fresh: &mut FreshNames) -> Rule {
    let mut rule = rule.clone();
    freshen(&mut rule, names, fresh);
    rule
}

pub fn substitute_argument(arg: &Argument, sigma: &Substitution) -> Argument {
    match arg {
        Argument::Variable(v) => sigma.get(&v.name).cloned().unwrap_or_else(|| arg.clone()),
        Argument::Constant(_) => arg.clone(),
        Argument::Skolem(term) => Argument::Skolem(SkolemTerm {
            function: term.function.clone(),
            args: term
                .args
                .iter()
                .map(|arg| substitute_argument(arg, sigma))
                .collect(),
        }),
    }
}

pub fn substitute(atom: &Atom, sigma: &Substitution) -> Atom {
    Atom {
        args: atom
            .args
            .iter()
            .map(|arg| substitute_argument(arg, sigma))
            .collect(),
        ..atom.clone()
    }
}

/// Applies `sigma` to the heads, body and Skolem arena of a rule.
pub fn apply(rule: &mut Rule, sigma: &Substitution) {
    if sigma.is_empty() {
        return;
    }
    for atom in rule.head.iter_mut().chain(rule.body.iter_mut()) {
        *atom = substitute(atom, sigma);
    }
    for def in &mut rule.skolems {
        def.term.args = def
            .term
            .args
            .iter()
            .map(|arg| substitute_argument(arg, sigma))
            .collect();
    }
}

/// Extends `sigma` so that `sigma(b)` equals `a`. Positions that can only be
/// satisfied by an extra equality are pushed to `equalities`; returns false
/// on a mismatch no equality can repair.
fn unify(a: &Argument, b: &Argument, sigma: &mut Substitution, equalities: &mut Equalities) -> bool {
    match b {
        Argument::Variable(v) => match sigma.get(&v.name) {
            None => {
                sigma.insert(v.name.clone(), a.clone());
                true
            }
            Some(existing) if existing == a => true,
            Some(existing) => {
                equalities.push((a.clone(), existing.clone()));
                true
            }
        },
        Argument::Constant(c) => match a {
            Argument::Constant(d) => {
                c.value == d.value && (c.ty.is_none() || d.ty.is_none() || c.ty == d.ty)
            }
            Argument::Variable(_) => {
                equalities.push((a.clone(), b.clone()));
                true
            }
            Argument::Skolem(_) => false,
        },
        Argument::Skolem(t) => match a {
            Argument::Skolem(s) if s.function == t.function && s.args.len() == t.args.len() => s
                .args
                .iter()
                .zip(&t.args)
                .all(|(x, y)| unify(x, y, sigma, equalities)),
            Argument::Variable(_) => {
                equalities.push((a.clone(), b.clone()));
                true
            }
            _ => false,
        },
    }
}

/// The substitution of `target`'s variables that folds `target` onto `head`:
/// same relation, same delta kind, same arity, and every position equal
/// after substitution. Returns `None` when no such substitution exists.
pub fn homomorphism(head: &Atom, target: &Atom) -> Option<Substitution> {
    let (sigma, equalities) = homomorphism_with_equalities(head, target)?;
    equalities.is_empty().then(|| sigma)
}

/// Like [`homomorphism`], but positions that cannot be unified positionally
/// are returned as equalities (left side from `head`, right side from
/// `target` before substitution) instead of failing.
pub fn homomorphism_with_equalities(head: &Atom, target: &Atom) -> Option<(Substitution, Equalities)> {
    if head.predicate != target.predicate
        || head.kind != target.kind
        || head.args.len() != target.args.len()
    {
        return None;
    }

    let mut sigma = Substitution::new();
    let mut equalities = vec![];
    for (a, b) in head.args.iter().zip(&target.args) {
        if !unify(a, b, &mut sigma, &mut equalities) {
            return None;
        }
    }
    Some((sigma, equalities))
}

/// Replaces Skolem-defined variables in `atom` by their Skolem terms.
fn inline_skolems(rule: &Rule, atom: &Atom) -> Atom {
    let sigma: Substitution = rule
        .skolems
        .iter()
        .map(|def| (def.variable.clone(), Argument::Skolem(def.term.clone())))
        .collect();
    substitute(atom, &sigma)
}

/// Replaces the body atom at `position` with the body of every definition
/// whose head unifies with it. Definitions are freshened first; a head
/// position holding a Skolem term turns the matching variable of `rule`
/// into that term. Returns one rule per successful unification.
pub fn substitute_atom(
    rule: &Rule,
    position: usize,
    definitions: &[Rule],
    fresh: &mut FreshNames,
) -> Vec<Rule> {
    let target = &rule.body[position];
    let mut results = vec![];

    for definition in definitions {
        let definition = freshened(definition, &mut NameMap::new(), fresh);
        for head in &definition.head {
            if head.relation() != target.relation() {
                continue;
            }
            let mut head = inline_skolems(&definition, head);

            let mut rule_sigma = Substitution::new();
            let mut clash = false;
            for (i, arg) in head.args.iter_mut().enumerate() {
                let Argument::Skolem(term) = arg else { continue };
                match &target.args[i] {
                    Argument::Variable(v) => {
                        let term = Argument::Skolem(term.clone());
                        if rule_sigma.get(&v.name).map_or(false, |t| t != &term) {
                            clash = true;
                        }
                        rule_sigma.insert(v.name.clone(), term);
                        *arg = Argument::var(fresh.fresh("sk"));
                    }
                    Argument::Skolem(_) => {}
                    Argument::Constant(_) => clash = true,
                }
            }
            if clash {
                continue;
            }

            let Some((sigma, equalities)) = homomorphism_with_equalities(target, &head) else {
                continue;
            };

            let mut body: Vec<Atom> = rule.body[..position].to_vec();
            body.extend(definition.body.iter().map(|atom| substitute(atom, &sigma)));
            body.extend(equalities.iter().map(|(a, b)| {
                Atom::builtin(Builtin::Eq, vec![a.clone(), substitute_argument(b, &sigma)])
            }));
            body.extend(rule.body[position + 1..].iter().cloned());

            for term in rule_sigma.values_mut() {
                *term = substitute_argument(term, &sigma);
            }

            let mut composed = Rule {
                id: format!("{}_{}", rule.id, definition.id),
                body,
                parent: Some(rule.parent.clone().unwrap_or_else(|| rule.id.clone())),
                ..rule.clone()
            };
            apply(&mut composed, &rule_sigma);
            debug!(rule = %composed, "composed");
            results.push(composed);
        }
    }
    results
}

/// Gives every existential head variable (one that occurs nowhere in the
/// body) a Skolem definition over the rule's frontier: the head variables
/// the body binds, in order of first occurrence. When the frontier is
/// empty the Skolem term ranges over all positively bound body variables.
pub fn skolemize(rule: &mut Rule) {
    let body_variables: HashSet<&str> = rule
        .body
        .iter()
        .flat_map(Atom::variables)
        .map(|v| v.name.as_str())
        .collect();
    let head_variables: Vec<&Variable> = rule.head.iter().flat_map(Atom::variables).unique().collect();

    let frontier: Vec<Argument> = head_variables
        .iter()
        .filter(|v| body_variables.contains(v.name.as_str()))
        .map(|v| Argument::var(v.name.clone()))
        .collect();
    let inputs = if frontier.is_empty() {
        rule.positively_bound()
            .into_iter()
            .map(|v| Argument::var(v.name.clone()))
            .collect()
    } else {
        frontier
    };

    let existentials: Vec<Identifier> = head_variables
        .iter()
        .filter(|v| v.skolem.is_none() && !body_variables.contains(v.name.as_str()))
        .map(|v| v.name.clone())
        .collect();

    for name in existentials {
        let id = SkolemId(rule.skolems.len());
        rule.skolems.push(SkolemDef {
            variable: name.clone(),
            term: SkolemTerm {
                function: format!("{}_{}", rule.id, name),
                args: inputs.clone(),
            },
        });
        for arg in rule.head.iter_mut().flat_map(|atom| atom.args.iter_mut()) {
            if let Argument::Variable(v) = arg {
                if v.name == name {
                    v.existential = true;
                    v.skolem = Some(id);
                }
            }
        }
        debug!(rule = %rule.id, variable = %name, "skolemized");
    }
}

fn occurs_outside(rule: &Rule, position: usize, name: &str) -> bool {
    let in_atom = |atom: &Atom| atom.variables().any(|v| v.name == name);
    rule.head.iter().any(in_atom)
        || rule
            .body
            .iter()
            .enumerate()
            .any(|(i, atom)| i != position && in_atom(atom))
        || rule
            .skolems
            .iter()
            .any(|def| def.term.args.iter().flat_map(Argument::variables).any(|v| v.name == name))
}

/// Whether the atom at `j` adds nothing over the atom at `i`: both range over
/// the same provenance relation and every position of `j` either agrees
/// with `i` or holds a variable that occurs nowhere else in the rule.
fn subsumes(rule: &Rule, i: usize, j: usize, is_provenance: &dyn Fn(&str) -> bool) -> bool {
    let (a, b) = (&rule.body[i], &rule.body[j]);
    if !a.is_positive_relation() || !b.is_positive_relation() {
        return false;
    }
    if !a.relation().map_or(false, is_provenance) {
        return false;
    }
    let Some(sigma) = homomorphism(a, b) else { return false };
    sigma.iter().all(|(name, image)| {
        matches!(image, Argument::Variable(v) if &v.name == name) || !occurs_outside(rule, j, name)
    })
}

/// Removes duplicate body atoms and provenance atoms subsumed by another
/// atom over the same relation. Returns the removed atoms.
pub fn minimize(rule: &mut Rule, is_provenance: &dyn Fn(&str) -> bool) -> Vec<Atom> {
    let mut discarded = vec![];

    let mut kept: Vec<Atom> = vec![];
    for atom in rule.body.drain(..) {
        if kept.contains(&atom) {
            discarded.push(atom);
        } else {
            kept.push(atom);
        }
    }
    rule.body = kept;

    loop {
        let n = rule.body.len();
        let found = (0..n)
            .cartesian_product(0..n)
            .find(|&(i, j)| i != j && subsumes(rule, i, j, is_provenance));
        match found {
            Some((_, j)) => discarded.push(rule.body.remove(j)),
            None => break,
        }
    }

    if !discarded.is_empty() {
        debug!(rule = %rule.id, discarded = discarded.len(), "minimized");
    }
    discarded
}

/// Every head variable must be bound by the body or Skolem-defined, and
/// every built-in must only mention bound variables.
pub fn check_safety(rule: &Rule) -> Result<(), CompileError> {
    let bound: HashSet<Identifier> = rule.bound_variables().into_iter().collect();
    let unsafe_variable = |v: &Variable| !bound.contains(&v.name) && v.skolem.is_none();

    let builtins = rule.body.iter().filter(|atom| atom.builtin_op().is_some());
    let skolem_inputs = rule.skolems.iter().flat_map(|def| def.term.args.iter());
    let offending = rule
        .head
        .iter()
        .chain(builtins)
        .flat_map(Atom::variables)
        .chain(skolem_inputs.flat_map(Argument::variables))
        .find(|v| unsafe_variable(v));

    match offending {
        Some(v) => Err(CompileError::UnsafeRule {
            rule: rule.id.clone(),
            variable: v.name.clone(),
        }),
        None => Ok(()),
    }
}

/// Splits a rule with several heads into one rule per head, each pointing
/// back at the original through `parent`.
pub fn decompose(rule: Rule) -> Vec<Rule> {
    if rule.head.len() == 1 {
        return vec![rule];
    }
    rule.head
        .iter()
        .enumerate()
        .map(|(i, head)| Rule {
            id: format!("{}_{}", rule.id, i),
            head: vec![head.clone()],
            parent: Some(rule.id.clone()),
            ..rule.clone()
        })
        .collect()
}

/// The inverse of a single-head, single-source mapping whose arguments are
/// all variables.
pub fn invert(rule: &Rule) -> Option<Rule> {
    let [head] = rule.head.as_slice() else { return None };
    let [source] = rule.body.as_slice() else { return None };
    let only_variables = |atom: &Atom| atom.args.iter().all(|arg| arg.as_variable().is_some());
    if !source.is_positive_relation() || !only_variables(head) || !only_variables(source) {
        return None;
    }
    let plain = |atom: &Atom| {
        let args = atom.args.iter().map(|arg| Argument::var(arg.to_string())).collect();
        Atom::new(atom.relation().unwrap_or_default(), args)
    };
    Some(Rule::new(format!("{}_inv", rule.id), plain(source), vec![plain(head)]))
}

/// Inlines every non-materialized relation into the rules that read it and
/// drops the rules that define one.
pub fn compose(rules: Vec<Rule>, catalog: &Catalog, fresh: &mut FreshNames) -> Result<Vec<Rule>, CompileError> {
    let is_virtual = |name: &str| catalog.relations.get(name).map_or(false, |r| !r.materialized);
    let (definitions, mut pending): (Vec<Rule>, Vec<Rule>) = rules
        .into_iter()
        .partition(|rule| is_virtual(rule.head_relation()));
    if definitions.is_empty() {
        return Ok(pending);
    }

    check_composable(&definitions, catalog)?;

    loop {
        let mut changed = false;
        let mut next = vec![];
        for rule in pending {
            let position = rule
                .body
                .iter()
                .position(|atom| atom.relation().map_or(false, is_virtual));
            match position {
                None => next.push(rule),
                Some(position) => {
                    changed = true;
                    let composed = substitute_atom(&rule, position, &definitions, fresh);
                    if composed.is_empty() {
                        debug!(rule = %rule.id, "no definition unifies; rule dropped");
                    }
                    next.extend(composed);
                }
            }
        }
        pending = next;
        if !changed {
            return Ok(pending);
        }
    }
}

/// Fails when non-materialized relations define one another in a cycle,
/// which composition could never inline away.
pub fn check_composable(rules: &[Rule], catalog: &Catalog) -> Result<(), CompileError> {
    let is_virtual = |name: &str| catalog.relations.get(name).map_or(false, |r| !r.materialized);
    let definitions: Vec<Rule> = rules
        .iter()
        .filter(|rule| is_virtual(rule.head_relation()))
        .cloned()
        .collect();
    check_virtual_cycles(&definitions, &is_virtual)
}

fn check_virtual_cycles(definitions: &[Rule], is_virtual: &dyn Fn(&str) -> bool) -> Result<(), CompileError> {
    let mut edges: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for rule in definitions {
        let targets = rule
            .body
            .iter()
            .filter_map(Atom::relation)
            .filter(|name| is_virtual(name));
        edges.entry(rule.head_relation()).or_default().extend(targets);
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, BTreeSet<&'a str>>,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<Vec<&'a str>> {
        if let Some(start) = path.iter().position(|n| *n == node) {
            return Some(path[start..].to_vec());
        }
        if !done.insert(node) {
            return None;
        }
        path.push(node);
        for next in edges.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(*next, edges, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        None
    }

    let mut done = HashSet::new();
    for node in edges.keys().copied().sorted() {
        if let Some(cycle) = visit(node, &edges, &mut vec![], &mut done) {
            return Err(CompileError::RecursiveComposition(cycle.join(" -> ")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Column, ColumnType, Literal, Relation, RelationRole};
    use num_bigint::BigInt;

    fn var(name: &str) -> Argument {
        Argument::var(name)
    }

    fn int(n: i64) -> Argument {
        Argument::constant(Literal::Integer(BigInt::from(n)))
    }

    fn atom(relation: &str, args: Vec<Argument>) -> Atom {
        Atom::new(relation, args)
    }

    fn names(rule: &Rule) -> Vec<String> {
        rule.head
            .iter()
            .chain(&rule.body)
            .flat_map(Atom::variables)
            .map(|v| v.name.clone())
            .collect()
    }

    #[test]
    fn test_freshen_is_idempotent_under_shared_map() {
        let rule = Rule::new(
            "m",
            atom("T", vec![var("x"), var("y")]),
            vec![atom("R", vec![var("x"), var("y")]), atom("S", vec![var("y")])],
        );
        let mut map = NameMap::new();
        let mut fresh = FreshNames::new();
        let once = freshened(&rule, &mut map, &mut fresh);
        let twice = freshened(&once, &mut map, &mut fresh);
        assert_eq!(names(&once), names(&twice));
        assert_eq!(names(&once), vec!["x$0", "y$1", "x$0", "y$1", "y$1"]);
    }

    #[test]
    fn test_fresh_strips_previous_suffix() {
        let mut fresh = FreshNames::new();
        let a = fresh.fresh("x");
        let b = fresh.fresh(&a);
        assert_eq!(a, "x$0");
        assert_eq!(b, "x$1");
    }

    #[test]
    fn test_homomorphism_maps_target_onto_head() {
        let head = atom("R", vec![var("a"), int(3)]);
        let target = atom("R", vec![var("x"), var("y")]);
        let sigma = homomorphism(&head, &target).unwrap();
        assert_eq!(substitute(&target, &sigma), head);
    }

    #[test]
    fn test_homomorphism_fails_on_constant_mismatch() {
        let head = atom("R", vec![var("a"), int(3)]);
        assert!(homomorphism(&head, &atom("R", vec![var("x"), int(4)])).is_none());
        assert!(homomorphism(&head, &atom("S", vec![var("x"), var("y")])).is_none());
        assert!(homomorphism(&head, &atom("R", vec![var("x")])).is_none());
    }

    #[test]
    fn test_homomorphism_with_equalities_for_repeated_variable() {
        let head = atom("R", vec![var("a"), var("b")]);
        let target = atom("R", vec![var("x"), var("x")]);
        assert!(homomorphism(&head, &target).is_none());
        let (sigma, equalities) = homomorphism_with_equalities(&head, &target).unwrap();
        assert_eq!(sigma.get("x"), Some(&var("a")));
        assert_eq!(equalities, vec![(var("b"), var("a"))]);
    }

    #[test]
    fn test_substitute_atom_inlines_definition() {
        let rule = Rule::new(
            "m",
            atom("T", vec![var("x")]),
            vec![atom("V", vec![var("x"), var("y")]), atom("S", vec![var("y")])],
        );
        let def = Rule::new(
            "d",
            atom("V", vec![var("a"), var("b")]),
            vec![atom("R", vec![var("a"), var("c")]), atom("U", vec![var("c"), var("b")])],
        );
        let mut fresh = FreshNames::new();
        let composed = substitute_atom(&rule, 0, &[def], &mut fresh);
        assert_eq!(composed.len(), 1);
        let composed = &composed[0];
        assert_eq!(composed.id, "m_d");
        assert_eq!(composed.parent.as_deref(), Some("m"));
        assert_eq!(
            composed.body,
            vec![
                atom("R", vec![var("x"), var("c$2")]),
                atom("U", vec![var("c$2"), var("y")]),
                atom("S", vec![var("y")]),
            ]
        );
    }

    #[test]
    fn test_substitute_atom_with_constant_head_adds_equality() {
        let rule = Rule::new(
            "m",
            atom("T", vec![var("x")]),
            vec![atom("V", vec![var("x")])],
        );
        let def = Rule::new("d", atom("V", vec![int(7)]), vec![atom("R", vec![int(7)])]);
        let composed = substitute_atom(&rule, 0, &[def], &mut FreshNames::new());
        assert_eq!(
            composed[0].body,
            vec![
                atom("R", vec![int(7)]),
                Atom::builtin(Builtin::Eq, vec![var("x"), int(7)]),
            ]
        );
    }

    #[test]
    fn test_substitute_atom_carries_skolem_into_rule() {
        let rule = Rule::new(
            "m",
            atom("T", vec![var("x"), var("z")]),
            vec![atom("V", vec![var("x"), var("z")])],
        );
        let mut def = Rule::new(
            "d",
            atom("V", vec![var("a"), var("n")]),
            vec![atom("R", vec![var("a")])],
        );
        skolemize(&mut def);
        let composed = substitute_atom(&rule, 0, &[def], &mut FreshNames::new());
        assert_eq!(composed.len(), 1);
        assert_eq!(composed[0].body, vec![atom("R", vec![var("x")])]);
        assert_eq!(
            composed[0].head[0].args[1],
            Argument::Skolem(SkolemTerm {
                function: "d_n".to_owned(),
                args: vec![var("x")],
            })
        );
    }

    #[test]
    fn test_skolemize_uses_frontier() {
        let mut rule = Rule::new(
            "m",
            atom("T", vec![var("x"), var("z")]),
            vec![atom("R", vec![var("x"), var("y")])],
        );
        skolemize(&mut rule);
        assert_eq!(rule.skolems.len(), 1);
        assert_eq!(rule.skolems[0].variable, "z");
        assert_eq!(rule.skolems[0].term.function, "m_z");
        assert_eq!(rule.skolems[0].term.args, vec![var("x")]);
        let z = rule.head[0].args[1].as_variable().unwrap();
        assert!(z.existential);
        assert_eq!(z.skolem, Some(SkolemId(0)));
        check_safety(&rule).unwrap();
    }

    #[test]
    fn test_unbound_head_variable_in_builtin_is_unsafe() {
        let mut rule = Rule::new(
            "m",
            atom("T", vec![var("x")]),
            vec![
                atom("R", vec![var("y")]),
                Atom::builtin(Builtin::Lt, vec![var("x"), var("y")]),
            ],
        );
        skolemize(&mut rule);
        assert!(rule.skolems.is_empty());
        assert!(matches!(
            check_safety(&rule),
            Err(CompileError::UnsafeRule { variable, .. }) if variable == "x"
        ));
    }

    #[test]
    fn test_minimize_removes_duplicates_and_subsumed_provenance() {
        let mut rule = Rule::new(
            "m",
            atom("T", vec![var("x")]),
            vec![
                atom("R", vec![var("x")]),
                atom("R", vec![var("x")]),
                atom("P_m", vec![var("x"), int(1)]),
                atom("P_m", vec![var("x"), var("w")]),
            ],
        );
        let discarded = minimize(&mut rule, &|name| name.starts_with("P_"));
        assert_eq!(
            discarded,
            vec![atom("R", vec![var("x")]), atom("P_m", vec![var("x"), var("w")])]
        );
        assert_eq!(
            rule.body,
            vec![atom("R", vec![var("x")]), atom("P_m", vec![var("x"), int(1)])]
        );
    }

    #[test]
    fn test_minimize_keeps_distinguished_positions() {
        let mut rule = Rule::new(
            "m",
            atom("T", vec![var("x"), var("w")]),
            vec![
                atom("P_m", vec![var("x"), int(1)]),
                atom("P_m", vec![var("x"), var("w")]),
            ],
        );
        assert!(minimize(&mut rule, &|name| name.starts_with("P_")).is_empty());
        assert_eq!(rule.body.len(), 2);
    }

    #[test]
    fn test_compose_rejects_recursive_virtual_relations() {
        let mut catalog = Catalog::default();
        for name in ["V", "W", "R", "T"] {
            let mut relation = Relation::new(name, vec![Column::new("a", ColumnType::Integer, false)]);
            relation.materialized = !matches!(name, "V" | "W");
            relation.role = RelationRole::Peer;
            catalog.add_relation(relation).unwrap();
        }
        let rules = vec![
            Rule::new("a", atom("V", vec![var("x")]), vec![atom("W", vec![var("x")])]),
            Rule::new("b", atom("W", vec![var("x")]), vec![atom("V", vec![var("x")])]),
            Rule::new("c", atom("T", vec![var("x")]), vec![atom("V", vec![var("x")])]),
        ];
        let err = compose(rules, &catalog, &mut FreshNames::new()).unwrap_err();
        assert!(matches!(err, CompileError::RecursiveComposition(_)));
    }

    #[test]
    fn test_decompose_and_invert() {
        let rule = Rule::with_heads(
            "m",
            vec![atom("T", vec![var("x")]), atom("U", vec![var("x"), var("y")])],
            vec![atom("R", vec![var("x"), var("y")])],
        );
        let parts = decompose(rule);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].id, "m_1");
        assert_eq!(parts[1].parent.as_deref(), Some("m"));

        let inverse = invert(&parts[1]).unwrap();
        assert_eq!(inverse.id, "m_1_inv");
        assert_eq!(inverse.head_relation(), "R");
        assert_eq!(inverse.body, vec![atom("U", vec![var("x"), var("y")])]);
        assert!(invert(&Rule::new("k", atom("T", vec![int(1)]), vec![atom("R", vec![int(1)])])).is_none());
    }
}
