use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use itertools::Itertools;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::error::CompileError;

pub type Identifier = String;
pub type RelationName = Identifier;
pub type ColumnName = Identifier;

/// Suffix of the local-contribution relation every peer relation owns.
pub const LOCAL_SUFFIX: &str = "_L";
pub const INSERT_SUFFIX: &str = "_INS";
pub const DELETE_SUFFIX: &str = "_DEL";
/// Suffix of the labeled-null companion of a nullable column.
pub const NULL_SUFFIX: &str = "_LN";
pub const STRATUM_COLUMN: &str = "STRATUM";

/// Companion value for a column that holds SQL NULL.
pub const LN_SQL_NULL: i64 = 0;
/// Companion value for a column that holds a real value.
pub const LN_REAL_VALUE: i64 = 1;
/// Companion value for a labeled null; the label is the text in the value column.
pub const LN_LABELED: i64 = 2;

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    String(String),
    Integer(BigInt),
    Null,
    LabeledNull(String),
}

impl Literal {
    pub fn ty(&self) -> Option<ColumnType> {
        match self {
            Literal::String(_) => Some(ColumnType::Text),
            Literal::Integer(_) => Some(ColumnType::Integer),
            Literal::Null | Literal::LabeledNull(_) => None,
        }
    }

    /// The integer value as stored; SQLite integers are 64-bit.
    pub fn to_i64(&self) -> Result<Option<i64>, CompileError> {
        match self {
            Literal::Integer(n) => i64::try_from(n)
                .map(Some)
                .map_err(|_| CompileError::IntegerOutOfRange(n.to_string())),
            _ => Ok(None),
        }
    }

    /// The companion-column value a literal is stored with.
    pub fn null_marker(&self) -> i64 {
        match self {
            Literal::Null => LN_SQL_NULL,
            Literal::LabeledNull(_) => LN_LABELED,
            _ => LN_REAL_VALUE,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::Null => f.write_str("null"),
            Literal::LabeledNull(label) => write!(f, "_:{}", label),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Text,
}

impl ColumnType {
    pub fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
        }
    }
}

impl FromStr for ColumnType {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(ColumnType::Integer),
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            _ => Err(CompileError::MalformedType(s.to_owned())),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => f.write_str("int"),
            ColumnType::Text => f.write_str("text"),
        }
    }
}

/// Index into a rule's Skolem arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkolemId(pub usize);

/// A rule-scoped variable. Equality and hashing only look at the name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Variable {
    pub name: Identifier,
    #[serde(default, skip_serializing_if = "is_false")]
    pub existential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skolem: Option<SkolemId>,
}

impl Variable {
    pub fn new(name: impl Into<Identifier>) -> Self {
        Self {
            name: name.into(),
            existential: false,
            skolem: None,
        }
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<ColumnType>,
    pub value: Literal,
}

impl From<Literal> for Constant {
    fn from(value: Literal) -> Self {
        Self {
            ty: value.ty(),
            value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkolemTerm {
    pub function: Identifier,
    pub args: Vec<Argument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Argument {
    Variable(Variable),
    #[serde(rename = "const")]
    Constant(Constant),
    Skolem(SkolemTerm),
}

impl Argument {
    pub fn var(name: impl Into<Identifier>) -> Self {
        Argument::Variable(Variable::new(name))
    }

    pub fn constant(value: Literal) -> Self {
        Argument::Constant(value.into())
    }

    pub fn typed_null(ty: ColumnType) -> Self {
        Argument::Constant(Constant {
            ty: Some(ty),
            value: Literal::Null,
        })
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Argument::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// Every variable in the argument, descending into Skolem terms.
    pub fn variables(&self) -> Vec<&Variable> {
        match self {
            Argument::Variable(v) => vec![v],
            Argument::Constant(_) => vec![],
            Argument::Skolem(term) => term.args.iter().flat_map(Argument::variables).collect(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(
            self,
            Argument::Constant(Constant {
                value: Literal::Null,
                ..
            })
        )
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Variable(v) => f.write_str(&v.name),
            Argument::Constant(c) => write!(f, "{}", c.value),
            Argument::Skolem(term) => {
                write!(f, "{}({})", term.function, term.args.iter().join(", "))
            }
        }
    }
}

/// Built-in predicates, evaluated in SQL rather than joined as tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Builtin {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Least,
    Greatest,
}

impl Builtin {
    /// Functions bind their first argument to the result of the call on the rest.
    pub fn is_function(self) -> bool {
        matches!(self, Builtin::Least | Builtin::Greatest)
    }

    pub fn arity(self) -> usize {
        if self.is_function() {
            3
        } else {
            2
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Builtin::Eq => "=",
            Builtin::Ne => "!=",
            Builtin::Lt => "<",
            Builtin::Le => "<=",
            Builtin::Gt => ">",
            Builtin::Ge => ">=",
            Builtin::Least => "least",
            Builtin::Greatest => "greatest",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "=" => Builtin::Eq,
            "!=" | "<>" => Builtin::Ne,
            "<" => Builtin::Lt,
            "<=" => Builtin::Le,
            ">" => Builtin::Gt,
            ">=" => Builtin::Ge,
            "least" => Builtin::Least,
            "greatest" => Builtin::Greatest,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    Relation(RelationName),
    Builtin(Builtin),
}

/// Which physical table of a relation an atom reads or writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomKind {
    #[default]
    Base,
    Insert,
    Delete,
}

impl AtomKind {
    pub fn suffix(self) -> &'static str {
        match self {
            AtomKind::Base => "",
            AtomKind::Insert => INSERT_SUFFIX,
            AtomKind::Delete => DELETE_SUFFIX,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Atom {
    pub predicate: Predicate,
    #[serde(default)]
    pub kind: AtomKind,
    pub args: Vec<Argument>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub negated: bool,
    /// Left outer joined: the rule still holds when nothing matches, with
    /// the atom's free variables NULL.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

impl Atom {
    pub fn new(relation: impl Into<RelationName>, args: Vec<Argument>) -> Self {
        Self {
            predicate: Predicate::Relation(relation.into()),
            kind: AtomKind::Base,
            args,
            negated: false,
            optional: false,
        }
    }

    pub fn builtin(op: Builtin, args: Vec<Argument>) -> Self {
        Self {
            predicate: Predicate::Builtin(op),
            kind: AtomKind::Base,
            args,
            negated: false,
            optional: false,
        }
    }

    pub fn with_kind(mut self, kind: AtomKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn negate(mut self) -> Self {
        self.negated = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn relation(&self) -> Option<&str> {
        match &self.predicate {
            Predicate::Relation(name) => Some(name),
            Predicate::Builtin(_) => None,
        }
    }

    pub fn builtin_op(&self) -> Option<Builtin> {
        match &self.predicate {
            Predicate::Builtin(op) => Some(*op),
            Predicate::Relation(_) => None,
        }
    }

    /// A positive atom over a stored relation, i.e. one that becomes a FROM item.
    pub fn is_positive_relation(&self) -> bool {
        !self.negated && self.relation().is_some()
    }

    pub fn table_name(&self) -> Option<String> {
        self.relation()
            .map(|name| format!("{}{}", name, self.kind.suffix()))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.args.iter().flat_map(Argument::variables)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("not ")?;
        }
        if self.optional {
            f.write_str("optional ")?;
        }
        match &self.predicate {
            Predicate::Relation(name) => write!(
                f,
                "{}{}({})",
                name,
                self.kind.suffix(),
                self.args.iter().join(", ")
            ),
            Predicate::Builtin(op) => match self.args.as_slice() {
                [output, args @ ..] if op.is_function() => {
                    write!(f, "{} = {}({})", output, op.symbol(), args.iter().join(", "))
                }
                [lhs, rhs] => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
                args => write!(f, "{}({})", op.symbol(), args.iter().join(", ")),
            },
        }
    }
}

/// How the SQL generator turns a rule into statements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleBehavior {
    /// Replace the head table's contents with the body's result.
    ClearAndCopy,
    /// Delete the head rows for which the body holds.
    DeleteFromHead,
    /// Define the head relation as a view over the body.
    View,
    #[default]
    Other,
}

/// `STRATUM = <iteration> + offset` on the delta atom at `atom`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumGuard {
    pub atom: usize,
    pub offset: i64,
}

/// Value written to the head's STRATUM column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadStratum {
    Fixed(i64),
    Iteration(i64),
}

/// Where an existential variable's value is invented.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkolemDef {
    pub variable: Identifier,
    pub term: SkolemTerm,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Identifier,
    pub head: Vec<Atom>,
    pub body: Vec<Atom>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stratified: bool,
    /// Provenance relation this rule writes or reads through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<RelationName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Identifier>,
    #[serde(default)]
    pub behavior: RuleBehavior,
    #[serde(default, skip_serializing_if = "is_false")]
    pub replace_with_nulls: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub key_and_nulls_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<StratumGuard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_stratum: Option<HeadStratum>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skolems: Vec<SkolemDef>,
}

impl Rule {
    pub fn new(id: impl Into<Identifier>, head: Atom, body: Vec<Atom>) -> Self {
        Self::with_heads(id, vec![head], body)
    }

    pub fn with_heads(id: impl Into<Identifier>, head: Vec<Atom>, body: Vec<Atom>) -> Self {
        Self {
            id: id.into(),
            head,
            body,
            distinct: false,
            stratified: false,
            provenance: None,
            parent: None,
            behavior: RuleBehavior::Other,
            replace_with_nulls: false,
            key_and_nulls_only: false,
            guard: None,
            head_stratum: None,
            skolems: vec![],
        }
    }

    /// The single head of a non-decomposed rule.
    pub fn head_atom(&self) -> &Atom {
        &self.head[0]
    }

    pub fn head_relation(&self) -> &str {
        self.head_atom().relation().unwrap_or_default()
    }

    pub fn skolem(&self, id: SkolemId) -> Option<&SkolemTerm> {
        self.skolems.get(id.0).map(|def| &def.term)
    }

    /// Variables occurring in a positive relation atom of the body.
    pub fn positively_bound(&self) -> Vec<&Variable> {
        self.body
            .iter()
            .filter(|atom| atom.is_positive_relation())
            .flat_map(Atom::variables)
            .unique()
            .collect()
    }

    /// Variables the body binds, including those bound by built-in equalities
    /// and functions over already bound inputs.
    pub fn bound_variables(&self) -> Vec<Identifier> {
        let mut bound: Vec<Identifier> = self
            .positively_bound()
            .into_iter()
            .map(|v| v.name.clone())
            .collect();
        loop {
            let before = bound.len();
            for atom in self.body.iter().filter(|atom| !atom.negated) {
                if let Some(name) = builtin_binding(atom, &bound) {
                    bound.push(name);
                }
            }
            if bound.len() == before {
                return bound;
            }
        }
    }

    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
    }
}

/// The variable a built-in atom binds once the rest of its arguments are
/// bound: the output of a function, or the free side of an equality.
pub fn builtin_binding(atom: &Atom, bound: &[Identifier]) -> Option<Identifier> {
    let op = atom.builtin_op()?;
    let is_bound = |arg: &Argument| arg.variables().iter().all(|v| bound.contains(&v.name));
    let free = |arg: &Argument| match arg {
        Argument::Variable(v) if !bound.contains(&v.name) => Some(v.name.clone()),
        _ => None,
    };

    if op.is_function() {
        return free(&atom.args[0]).filter(|_| atom.args[1..].iter().all(is_bound));
    }
    if op != Builtin::Eq {
        return None;
    }
    match (free(&atom.args[0]), free(&atom.args[1])) {
        (Some(name), None) if is_bound(&atom.args[1]) => Some(name),
        (None, Some(name)) if is_bound(&atom.args[0]) => Some(name),
        _ => None,
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.head.iter().join(", "))?;
        if !self.body.is_empty() {
            write!(f, " :- {}", self.body.iter().join(", "))?;
        }
        f.write_str(".")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: ColumnName,
    pub ty: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<ColumnName>, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationRole {
    #[default]
    Peer,
    Local,
    Provenance,
    /// Computed on read; never stored or maintained.
    View,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub name: RelationName,
    #[serde(default)]
    pub peer: Option<Identifier>,
    #[serde(default)]
    pub role: RelationRole,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub key: Vec<usize>,
    #[serde(default)]
    pub labeled_nulls: bool,
    pub materialized: bool,
    /// Set for relations in recursive strata; their delta tables carry STRATUM.
    #[serde(default)]
    pub stratified: bool,
}

impl Relation {
    pub fn new(name: impl Into<RelationName>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            peer: None,
            role: RelationRole::Peer,
            columns,
            key: vec![],
            labeled_nulls: false,
            materialized: true,
            stratified: false,
        }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn table_name(&self, kind: AtomKind) -> String {
        format!("{}{}", self.name, kind.suffix())
    }

    pub fn local_name(&self) -> RelationName {
        format!("{}{}", self.name, LOCAL_SUFFIX)
    }

    pub fn has_null_column(&self, index: usize) -> bool {
        self.labeled_nulls && self.columns[index].nullable
    }

    pub fn null_column(&self, index: usize) -> Option<ColumnName> {
        self.has_null_column(index)
            .then(|| format!("{}{}", self.columns[index].name, NULL_SUFFIX))
    }

    pub fn has_stratum(&self, kind: AtomKind) -> bool {
        self.stratified && kind != AtomKind::Base
    }

    /// Columns of the physical table for `kind`: data columns, their
    /// labeled-null companions, then STRATUM where the table carries one.
    pub fn physical_columns(&self, kind: AtomKind) -> Vec<(ColumnName, ColumnType)> {
        let mut columns = vec![];
        for (i, column) in self.columns.iter().enumerate() {
            columns.push((column.name.clone(), column.ty));
            if let Some(ln) = self.null_column(i) {
                columns.push((ln, ColumnType::Integer));
            }
        }
        if self.has_stratum(kind) {
            columns.push((STRATUM_COLUMN.to_owned(), ColumnType::Integer));
        }
        columns
    }

    pub fn require_key(&self) -> Result<&[usize], CompileError> {
        if self.key.is_empty() {
            Err(CompileError::MissingKey(self.name.clone()))
        } else {
            Ok(&self.key)
        }
    }

    /// The local-contribution relation of a peer relation.
    pub fn local_relation(&self) -> Relation {
        Relation {
            name: self.local_name(),
            role: RelationRole::Local,
            stratified: false,
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: Identifier,
    pub relations: Vec<RelationName>,
}

/// Peers, their relations, and the mappings between them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub peers: Vec<Peer>,
    pub relations: BTreeMap<RelationName, Relation>,
    pub mappings: Vec<Rule>,
}

impl Catalog {
    pub fn relation(&self, name: &str) -> Result<&Relation, CompileError> {
        self.relations
            .get(name)
            .ok_or_else(|| CompileError::UnknownRelation(name.to_owned()))
    }

    pub fn relation_mut(&mut self, name: &str) -> Result<&mut Relation, CompileError> {
        self.relations
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownRelation(name.to_owned()))
    }

    pub fn add_relation(&mut self, relation: Relation) -> Result<(), CompileError> {
        if self.relations.contains_key(&relation.name) {
            return Err(CompileError::IncompatibleSchema(format!(
                "relation {} is defined twice",
                relation.name
            )));
        }
        if let Some(peer) = &relation.peer {
            match self.peers.iter_mut().find(|p| &p.name == peer) {
                Some(p) => p.relations.push(relation.name.clone()),
                None => self.peers.push(Peer {
                    name: peer.clone(),
                    relations: vec![relation.name.clone()],
                }),
            }
        }
        self.relations.insert(relation.name.clone(), relation);
        Ok(())
    }

    pub fn is_provenance(&self, name: &str) -> bool {
        self.relations
            .get(name)
            .map_or(false, |r| r.role == RelationRole::Provenance)
    }

    /// Owning peer of the relation an atom refers to, if any.
    pub fn peer_of(&self, atom: &Atom) -> Option<&str> {
        atom.relation()
            .and_then(|name| self.relations.get(name))
            .and_then(|r| r.peer.as_deref())
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        for relation in self.relations.values() {
            if relation.role != RelationRole::Peer {
                continue;
            }
            for suffix in [LOCAL_SUFFIX, INSERT_SUFFIX, DELETE_SUFFIX, NULL_SUFFIX] {
                if relation.name.ends_with(suffix) {
                    return Err(CompileError::IncompatibleSchema(format!(
                        "relation name {} ends in reserved suffix {}",
                        relation.name, suffix
                    )));
                }
            }
            for column in &relation.columns {
                if column.name.ends_with(NULL_SUFFIX) || column.name == STRATUM_COLUMN {
                    return Err(CompileError::IncompatibleSchema(format!(
                        "column {}.{} uses a reserved name",
                        relation.name, column.name
                    )));
                }
            }
            if relation.columns.iter().map(|c| &c.name).unique().count() != relation.arity() {
                return Err(CompileError::IncompatibleSchema(format!(
                    "relation {} repeats a column name",
                    relation.name
                )));
            }
            for &k in &relation.key {
                match relation.columns.get(k) {
                    Some(column) if !column.nullable => {}
                    Some(column) => {
                        return Err(CompileError::IncompatibleKeys {
                            mapping: relation.name.clone(),
                            detail: format!("key column {} is nullable", column.name),
                        })
                    }
                    None => {
                        return Err(CompileError::IncompatibleKeys {
                            mapping: relation.name.clone(),
                            detail: format!("key position {} is out of range", k),
                        })
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            if !seen.insert(&mapping.id) {
                return Err(CompileError::IncompatibleSchema(format!(
                    "mapping {} is defined twice",
                    mapping.id
                )));
            }
        }
        for mapping in &self.mappings {
            self.validate_rule(mapping)?;
        }
        Ok(())
    }

    /// Checks relations, arities and column types of every atom in a rule.
    pub fn validate_rule(&self, rule: &Rule) -> Result<(), CompileError> {
        if rule.head.is_empty() {
            return Err(CompileError::Unsupported {
                mapping: rule.id.clone(),
                detail: "rule has no head".to_owned(),
            });
        }

        let mut types: HashMap<&str, (ColumnType, String)> = HashMap::new();
        for atom in rule.head.iter().chain(&rule.body) {
            for arg in &atom.args {
                if let Argument::Constant(Constant {
                    value: literal @ Literal::Integer(_),
                    ..
                }) = arg
                {
                    literal.to_i64()?;
                }
            }
            if let Some(op) = atom.builtin_op() {
                if atom.args.len() != op.arity() {
                    return Err(CompileError::Arity {
                        relation: op.symbol().to_owned(),
                        expected: op.arity(),
                        found: atom.args.len(),
                    });
                }
                continue;
            }

            let relation = self.relation(atom.relation().unwrap_or_default())?;
            if atom.args.len() != relation.arity() {
                return Err(CompileError::Arity {
                    relation: relation.name.clone(),
                    expected: relation.arity(),
                    found: atom.args.len(),
                });
            }

            for (arg, column) in atom.args.iter().zip(&relation.columns) {
                let place = format!("{}.{}", relation.name, column.name);
                match arg {
                    Argument::Constant(c) => match c.value.ty() {
                        Some(ty) if ty != column.ty => {
                            return Err(CompileError::IncompatibleTypes {
                                mapping: rule.id.clone(),
                                detail: format!("constant {} used at {} of type {}", c.value, place, column.ty),
                            })
                        }
                        _ => {}
                    },
                    Argument::Variable(v) => match types.get(v.name.as_str()) {
                        Some((ty, first)) if *ty != column.ty => {
                            return Err(CompileError::IncompatibleTypes {
                                mapping: rule.id.clone(),
                                detail: format!(
                                    "variable {} used at {} ({}) and {} ({})",
                                    v.name, first, ty, place, column.ty
                                ),
                            })
                        }
                        Some(_) => {}
                        None => {
                            types.insert(&v.name, (column.ty, place));
                        }
                    },
                    Argument::Skolem(_) => {}
                }
            }
        }
        Ok(())
    }
}

/// Per-peer trust priorities: how much a target peer trusts data coming
/// from a source peer. Unlisted pairs default to 1; a priority of 0 or
/// less means distrust.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustPolicy {
    priorities: BTreeMap<(Identifier, Identifier), i64>,
}

impl TrustPolicy {
    pub const DEFAULT_PRIORITY: i64 = 1;

    pub fn set(&mut self, peer: impl Into<Identifier>, source: impl Into<Identifier>, priority: i64) {
        self.priorities.insert((peer.into(), source.into()), priority);
    }

    pub fn priority(&self, peer: &str, source: &str) -> i64 {
        self.priorities
            .get(&(peer.to_owned(), source.to_owned()))
            .copied()
            .unwrap_or(Self::DEFAULT_PRIORITY)
    }
}
