//! The JSON document form of compiled programs, for diagnostics.

use serde::{Deserialize, Serialize};

use crate::ast::{Catalog, Rule};
use crate::delta::DeltaRules;
use crate::provenance::TranslationState;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// The compiled catalog, provenance and local relations included.
    pub catalog: Catalog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<TranslationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaRules>,
}

impl Document {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

pub fn rule_to_json(rule: &Rule) -> serde_json::Result<String> {
    serde_json::to_string(rule)
}

pub fn rule_from_json(text: &str) -> serde_json::Result<Rule> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::skolemize;
    use crate::ast::{Argument, Atom, AtomKind, HeadStratum, Literal, RuleBehavior, StratumGuard};
    use num_bigint::BigInt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rule() -> Rule {
        let mut rule = Rule::new(
            "m",
            Atom::new("T", vec![Argument::var("x"), Argument::var("n")]),
            vec![
                Atom::new("R", vec![Argument::var("x"), Argument::constant(Literal::Integer(BigInt::from(3)))]),
                Atom::new("S", vec![Argument::var("x")]).with_kind(AtomKind::Delete).negate(),
            ],
        );
        skolemize(&mut rule);
        rule
    }

    #[test]
    fn test_argument_discriminators() {
        let value = serde_json::to_value(rule()).unwrap();
        assert_eq!(value["head"][0]["args"][0], json!({"type": "variable", "name": "x"}));
        assert_eq!(
            value["head"][0]["args"][1],
            json!({"type": "variable", "name": "n", "existential": true, "skolem": 0})
        );
        assert_eq!(value["body"][0]["args"][1]["type"], json!("const"));
        assert_eq!(value["body"][0]["args"][1]["ty"], json!("integer"));
        assert_eq!(value["skolems"][0]["term"]["function"], json!("m_n"));
        assert_eq!(value["body"][1]["negated"], json!(true));
    }

    #[test]
    fn test_rule_roundtrip() {
        let mut rule = rule();
        rule.parent = Some("mapping".to_owned());
        rule.distinct = true;
        rule.behavior = RuleBehavior::DeleteFromHead;
        rule.guard = Some(StratumGuard { atom: 0, offset: -1 });
        rule.head_stratum = Some(HeadStratum::Iteration(0));
        rule.head.push(Atom::new(
            "U",
            vec![Argument::Skolem(rule.skolems[0].term.clone())],
        ));

        let text = rule_to_json(&rule).unwrap();
        let back = rule_from_json(&text).unwrap();
        assert_eq!(back, rule);
        assert_eq!(back.head[0].args[1].as_variable().unwrap().skolem, rule.head[0].args[1].as_variable().unwrap().skolem);
    }

    #[test]
    fn test_document_roundtrip() {
        let document = Document {
            catalog: Catalog::default(),
            translation: Some(TranslationState {
                local_rules: vec![rule()],
                ..TranslationState::default()
            }),
            delta: None,
        };
        let text = document.to_json().unwrap();
        assert!(!text.contains("\"delta\""));
        assert_eq!(Document::from_json(&text).unwrap(), document);
    }
}
