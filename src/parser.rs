use std::borrow::BorrowMut;

use anyhow::{anyhow, bail, Context, Result};
use num_bigint::BigInt;
use pest::Parser as _;
use pest_derive::Parser;

use crate::ast::{
    Argument, Atom, Builtin, Catalog, Column, ColumnType, Identifier, Literal, Relation,
    Rule as MappingRule, TrustPolicy,
};

#[derive(Parser)]
#[grammar = "deltaql.pest"]
struct Parser;

type Pair<'a> = pest::iterators::Pair<'a, Rule>;
type Pairs<'a> = pest::iterators::Pairs<'a, Rule>;

/// A parsed catalog file: schema, mappings and trust priorities.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub catalog: Catalog,
    pub trust: TrustPolicy,
}

/// An edit or inspection typed at the shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Insert(Identifier, Vec<Literal>),
    Delete(Identifier, Vec<Literal>),
    Show(Identifier),
}

pub fn parse_catalog(code: &str) -> Result<Program> {
    let catalog = Parser::parse(Rule::catalog, code)
        .context("Failed to parse catalog")?
        .next()
        .context("Empty parse")?;

    let mut program = Program::default();
    for item in catalog.into_inner().filter(|pair| pair.as_rule() == Rule::item) {
        let pair = item.into_inner().next().context("Empty item")?;
        match pair.as_rule() {
            Rule::peer => {
                let mut pairs = pair.into_inner();
                let peer = expect_identifier(&mut pairs)?;
                for relation in pairs {
                    let mut relation = convert_relation(relation)?;
                    relation.peer = Some(peer.clone());
                    program.catalog.add_relation(relation)?;
                }
            }
            Rule::relation => program.catalog.add_relation(convert_relation(pair)?)?,
            Rule::mapping => program.catalog.mappings.push(convert_mapping(pair)?),
            Rule::trust => {
                let mut pairs = pair.into_inner();
                let peer = expect_identifier(&mut pairs)?;
                let source = expect_identifier(&mut pairs)?;
                let priority = expect_next_rule(&mut pairs, Rule::integer)?;
                let priority = priority
                    .as_str()
                    .parse::<i64>()
                    .with_context(|| format!("Bad trust priority {}", priority.as_str()))?;
                program.trust.set(peer, source, priority);
            }
            rule => bail!("Unexpected {:?}", rule),
        }
    }
    Ok(program)
}

pub fn parse_command(code: &str) -> Result<Command> {
    let command = Parser::parse(Rule::command, code.trim())
        .context("Failed to parse command")?
        .next()
        .context("Empty parse")?;
    let pair = command.into_inner().next().context("Empty command")?;
    let rule = pair.as_rule();
    let inner = pair.into_inner().next().context("Empty command")?;

    match rule {
        Rule::show_command => Ok(Command::Show(convert_identifier(inner)?)),
        Rule::insert_command | Rule::delete_command => {
            let atom = convert_atom(inner)?;
            let name = atom.relation().unwrap_or_default().to_owned();
            let tuple = atom
                .args
                .into_iter()
                .map(|arg| match arg {
                    Argument::Constant(c) => Ok(c.value),
                    other => Err(anyhow!("Edit arguments must be literals, found {}", other)),
                })
                .collect::<Result<Vec<_>>>()?;
            if rule == Rule::insert_command {
                Ok(Command::Insert(name, tuple))
            } else {
                Ok(Command::Delete(name, tuple))
            }
        }
        rule => bail!("Unexpected {:?}", rule),
    }
}

fn expect_next_rule<'a, P: BorrowMut<Pairs<'a>>>(mut pairs: P, rule: Rule) -> Result<Pair<'a>> {
    let pair = pairs
        .borrow_mut()
        .next()
        .with_context(|| format!("Missing {:?}", rule))?;
    if pair.as_rule() != rule {
        bail!("Expected {:?}, found {:?}", rule, pair.as_rule());
    }
    Ok(pair)
}

fn convert_identifier(pair: Pair) -> Result<Identifier> {
    if pair.as_rule() != Rule::identifier {
        bail!("Expected identifier, found {:?}", pair.as_rule());
    }
    Ok(pair.as_str().to_string())
}

fn expect_identifier<'a, P: BorrowMut<Pairs<'a>>>(pairs: P) -> Result<Identifier> {
    convert_identifier(expect_next_rule(pairs, Rule::identifier)?)
}

fn convert_literal(pair: Pair) -> Result<Literal> {
    let pair = pair.into_inner().next().context("Empty literal")?;
    Ok(match pair.as_rule() {
        Rule::string_literal => {
            let interior = expect_next_rule(pair.into_inner(), Rule::string_interior)?;
            Literal::String(interior.as_str().to_string())
        }
        Rule::labeled_null => Literal::LabeledNull(expect_identifier(pair.into_inner())?),
        Rule::integer => Literal::Integer(
            pair.as_str()
                .parse::<BigInt>()
                .with_context(|| format!("Bad integer {}", pair.as_str()))?,
        ),
        Rule::null_literal => Literal::Null,
        rule => bail!("Unexpected {:?}", rule),
    })
}

fn convert_argument(pair: Pair) -> Result<Argument> {
    let pair = pair.into_inner().next().context("Empty argument")?;
    match pair.as_rule() {
        Rule::literal => Ok(Argument::constant(convert_literal(pair)?)),
        Rule::variable => Ok(Argument::var(expect_identifier(pair.into_inner())?)),
        rule => bail!("Unexpected {:?}", rule),
    }
}

fn convert_atom(pair: Pair) -> Result<Atom> {
    let mut pairs = pair.into_inner();
    let name = expect_identifier(&mut pairs)?;
    let args = pairs.map(convert_argument).collect::<Result<Vec<_>>>()?;
    Ok(Atom::new(name, args))
}

fn convert_body_item(pair: Pair) -> Result<Atom> {
    let pair = pair.into_inner().next().context("Empty body item")?;
    match pair.as_rule() {
        Rule::atom => convert_atom(pair),
        Rule::negated_atom => {
            let mut pairs = pair.into_inner();
            expect_next_rule(&mut pairs, Rule::not_keyword)?;
            Ok(convert_atom(expect_next_rule(&mut pairs, Rule::atom)?)?.negate())
        }
        Rule::comparison => {
            let mut pairs = pair.into_inner();
            let lhs = convert_argument(expect_next_rule(&mut pairs, Rule::argument)?)?;
            let op = expect_next_rule(&mut pairs, Rule::comparison_op)?;
            let op = Builtin::from_symbol(op.as_str())
                .with_context(|| format!("Unknown comparison {}", op.as_str()))?;
            let rhs = convert_argument(expect_next_rule(&mut pairs, Rule::argument)?)?;
            Ok(Atom::builtin(op, vec![lhs, rhs]))
        }
        Rule::function_call => {
            let mut pairs = pair.into_inner();
            let output = convert_argument(expect_next_rule(&mut pairs, Rule::argument)?)?;
            let function = expect_next_rule(&mut pairs, Rule::function_name)?;
            let op = Builtin::from_symbol(function.as_str())
                .with_context(|| format!("Unknown function {}", function.as_str()))?;
            let mut args = vec![output];
            for pair in pairs {
                args.push(convert_argument(pair)?);
            }
            Ok(Atom::builtin(op, args))
        }
        rule => bail!("Unexpected {:?}", rule),
    }
}

fn convert_mapping(pair: Pair) -> Result<MappingRule> {
    let mut pairs = pair.into_inner();
    let id = expect_identifier(&mut pairs)?;
    let head = expect_next_rule(&mut pairs, Rule::heads)?
        .into_inner()
        .map(convert_atom)
        .collect::<Result<Vec<_>>>()?;
    let body = expect_next_rule(&mut pairs, Rule::body)?
        .into_inner()
        .map(convert_body_item)
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("In mapping {}", id))?;
    Ok(MappingRule::with_heads(id, head, body))
}

fn convert_relation(pair: Pair) -> Result<Relation> {
    let mut materialized = true;
    let mut labeled_nulls = false;
    let mut name = None;
    let mut columns = vec![];
    let mut key = vec![];

    for pair in pair.into_inner() {
        match pair.as_rule() {
            Rule::virtual_keyword => materialized = false,
            Rule::identifier => name = Some(convert_identifier(pair)?),
            Rule::with_nulls => labeled_nulls = true,
            Rule::column => {
                let mut pairs = pair.into_inner();
                let column = expect_identifier(&mut pairs)?;
                let ty = expect_identifier(&mut pairs)?.parse::<ColumnType>()?;
                let mut nullable = false;
                for flag in pairs {
                    match flag.as_rule() {
                        Rule::key_flag => key.push(columns.len()),
                        _ => nullable = true,
                    }
                }
                columns.push(Column::new(column, ty, nullable));
            }
            rule => bail!("Unexpected {:?}", rule),
        }
    }

    let mut relation = Relation::new(name.context("Relation without a name")?, columns);
    relation.key = key;
    relation.labeled_nulls = labeled_nulls;
    relation.materialized = materialized;
    Ok(relation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CATALOG: &str = r#"
        // two peers sharing a relation
        peer P {
            relation R(a: int key, b: text null) with nulls;
            virtual relation V(a: int);
        }
        peer Q {
            relation T(a: int, b: text null);
        }
        mapping m: T(x, y) :- R(x, y), x < 3, z = least(x, x).
        mapping n: T(x, "k"), V(x) :- R(x, _:n1), not T(x, null).
        trust Q P 0;
    "#;

    #[test]
    fn test_parse_catalog() {
        let program = parse_catalog(CATALOG).unwrap();
        let catalog = &program.catalog;

        let r = catalog.relation("R").unwrap();
        assert_eq!(r.peer.as_deref(), Some("P"));
        assert_eq!(r.key, vec![0]);
        assert!(r.labeled_nulls && r.columns[1].nullable && !r.columns[0].nullable);
        assert!(!catalog.relation("V").unwrap().materialized);
        assert_eq!(catalog.peers.len(), 2);

        let mappings: Vec<String> = catalog.mappings.iter().map(ToString::to_string).collect();
        assert_eq!(
            mappings,
            vec![
                "m: T(x, y) :- R(x, y), x < 3, z = least(x, x).",
                "n: T(x, \"k\"), V(x) :- R(x, _:n1), not T(x, null).",
            ]
        );
        assert_eq!(program.trust.priority("Q", "P"), 0);
        assert_eq!(program.trust.priority("P", "Q"), TrustPolicy::DEFAULT_PRIORITY);
    }

    #[test]
    fn test_keywords_inside_identifiers() {
        let program = parse_catalog(
            "relation nothing(nullable: int);
             relation keys(a: int);
             mapping k: keys(x) :- nothing(x), notable(x).",
        )
        .unwrap();
        assert!(program.catalog.relation("nothing").unwrap().key.is_empty());
        assert_eq!(
            program.catalog.mappings[0].to_string(),
            "k: keys(x) :- nothing(x), notable(x)."
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_catalog("relation R(a: float);").is_err());
        assert!(parse_catalog("relation R(a: int) relation").is_err());
        assert!(parse_catalog("relation R(a: int); relation R(b: int);").is_err());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("+R(1, \"x\")").unwrap(),
            Command::Insert(
                "R".to_owned(),
                vec![Literal::Integer(BigInt::from(1)), Literal::String("x".to_owned())]
            )
        );
        assert_eq!(
            parse_command(" -R(-2, null, _:a) ").unwrap(),
            Command::Delete(
                "R".to_owned(),
                vec![
                    Literal::Integer(BigInt::from(-2)),
                    Literal::Null,
                    Literal::LabeledNull("a".to_owned())
                ]
            )
        );
        assert_eq!(parse_command("?T").unwrap(), Command::Show("T".to_owned()));
        assert!(parse_command("+R(x)").is_err());
    }
}
