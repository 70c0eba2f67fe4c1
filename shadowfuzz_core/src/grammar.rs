//! Context-free program grammars for schema-independent generation.
//!
//! A grammar is a map from nonterminal names to alternatives, each alternative
//! a list of symbols. In the JSON form `"<name>"` is a nonterminal, `"$int"` is
//! a random integer literal, and any other string is emitted verbatim.

use rand::Rng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INT_LITERAL: &str = "$int";
const INT_LITERAL_RANGE: std::ops::RangeInclusive<i64> = -100..=100;

#[derive(Error, Debug)]
pub enum GrammarError {
    #[error("Start symbol '{0}' has no rule")]
    MissingStart(String),
    #[error("Rule '{rule}' references undefined nonterminal '{symbol}'")]
    UndefinedSymbol { rule: String, symbol: String },
    #[error("Rule '{0}' has no alternatives")]
    EmptyRule(String),
    #[error("Rule '{0}' never derives a finite string")]
    Unproductive(String),
    #[error("Malformed grammar: {0}")]
    Malformed(String),
    #[error("Failed to read grammar file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Symbol {
    NonTerminal(String),
    Terminal(String),
    IntLiteral,
}

impl Symbol {
    fn parse(raw: &str) -> Self {
        if raw == INT_LITERAL {
            return Symbol::IntLiteral;
        }
        match raw.strip_prefix('<').and_then(|r| r.strip_suffix('>')) {
            Some(name) if !name.is_empty() => Symbol::NonTerminal(name.to_string()),
            _ => Symbol::Terminal(raw.to_string()),
        }
    }
}

/// Serialized grammar document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrammarDef {
    pub start: String,
    pub rules: BTreeMap<String, Vec<Vec<String>>>,
}

#[derive(Debug, Clone)]
pub struct Grammar {
    start: String,
    rules: BTreeMap<String, Vec<Vec<Symbol>>>,
    /// Minimum derivation height of each nonterminal.
    heights: BTreeMap<String, usize>,
}

impl Grammar {
    pub fn new(def: GrammarDef) -> Result<Self, GrammarError> {
        let rules: BTreeMap<String, Vec<Vec<Symbol>>> = def
            .rules
            .into_iter()
            .map(|(name, alts)| {
                let alts = alts
                    .iter()
                    .map(|alt| alt.iter().map(|s| Symbol::parse(s)).collect())
                    .collect();
                (name, alts)
            })
            .collect();

        if !rules.contains_key(&def.start) {
            return Err(GrammarError::MissingStart(def.start));
        }
        for (name, alts) in &rules {
            if alts.is_empty() {
                return Err(GrammarError::EmptyRule(name.clone()));
            }
            for symbol in alts.iter().flatten() {
                if let Symbol::NonTerminal(target) = symbol {
                    if !rules.contains_key(target) {
                        return Err(GrammarError::UndefinedSymbol {
                            rule: name.clone(),
                            symbol: target.clone(),
                        });
                    }
                }
            }
        }

        let heights = derivation_heights(&rules);
        if let Some(name) = rules.keys().find(|name| !heights.contains_key(*name)) {
            return Err(GrammarError::Unproductive(name.clone()));
        }

        Ok(Self {
            start: def.start,
            rules,
            heights,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, GrammarError> {
        let def: GrammarDef =
            serde_json::from_str(text).map_err(|e| GrammarError::Malformed(e.to_string()))?;
        Self::new(def)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, GrammarError> {
        let text = std::fs::read_to_string(path).map_err(|source| GrammarError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Expands the start symbol. Below `max_depth` alternatives are chosen
    /// uniformly; at or past it the lowest alternative is taken.
    pub fn expand(&self, max_depth: usize, rng: &mut dyn RngCore) -> String {
        let mut out = String::new();
        self.expand_into(&self.start, 0, max_depth, rng, &mut out);
        out
    }

    fn expand_into(
        &self,
        name: &str,
        depth: usize,
        max_depth: usize,
        rng: &mut dyn RngCore,
        out: &mut String,
    ) {
        let Some(alts) = self.rules.get(name) else {
            return;
        };
        let alt = if depth >= max_depth {
            self.shallowest(alts)
        } else {
            alts[rng.random_range(0..alts.len())].as_slice()
        };
        for symbol in alt {
            match symbol {
                Symbol::Terminal(text) => out.push_str(text),
                Symbol::IntLiteral => out.push_str(&rng.random_range(INT_LITERAL_RANGE).to_string()),
                Symbol::NonTerminal(next) => self.expand_into(next, depth + 1, max_depth, rng, out),
            }
        }
    }

    fn alt_height(&self, alt: &[Symbol]) -> usize {
        alt_height(alt, &self.heights).unwrap_or(usize::MAX)
    }

    fn shallowest<'a>(&self, alts: &'a [Vec<Symbol>]) -> &'a [Symbol] {
        alts.iter()
            .min_by_key(|alt| self.alt_height(alt))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn alt_height(alt: &[Symbol], heights: &BTreeMap<String, usize>) -> Option<usize> {
    let mut deepest = 0;
    for symbol in alt {
        if let Symbol::NonTerminal(name) = symbol {
            deepest = deepest.max(*heights.get(name)?);
        }
    }
    Some(deepest + 1)
}

/// Least fixed point of `h(N) = min over alts (1 + max h(child))`.
/// Nonterminals missing from the result derive no finite string.
fn derivation_heights(rules: &BTreeMap<String, Vec<Vec<Symbol>>>) -> BTreeMap<String, usize> {
    let mut heights: BTreeMap<String, usize> = BTreeMap::new();
    loop {
        let mut changed = false;
        for (name, alts) in rules {
            let best = alts.iter().filter_map(|alt| alt_height(alt, &heights)).min();
            if let Some(best) = best {
                if heights.get(name).is_none_or(|current| best < *current) {
                    heights.insert(name.clone(), best);
                    changed = true;
                }
            }
        }
        if !changed {
            return heights;
        }
    }
}

fn alts(raw: &[&[&str]]) -> Vec<Vec<String>> {
    raw.iter()
        .map(|alt| alt.iter().map(|s| s.to_string()).collect())
        .collect()
}

/// Built-in grammar: variable updates, printing, conditionals, bounded loops
/// and integer arithmetic.
pub fn default_grammar_def() -> GrammarDef {
    let mut rules = BTreeMap::new();
    rules.insert(
        "program".to_string(),
        alts(&[&[
            "fun main() {\n",
            "    let mut a = ",
            "$int",
            ";\n",
            "    let mut b = ",
            "$int",
            ";\n",
            "    let mut c = ",
            "$int",
            ";\n",
            "<stmts>",
            "}\n",
        ]]),
    );
    rules.insert("stmts".to_string(), alts(&[&["<stmt>"], &["<stmt>", "<stmts>"]]));
    rules.insert(
        "stmt".to_string(),
        alts(&[
            &["    ", "<var>", " = ", "<expr>", ";\n"],
            &["    println(", "<expr>", ");\n"],
            &["    if ", "<cond>", " {\n", "<stmts>", "    }\n"],
            &["    if ", "<cond>", " {\n", "<stmts>", "    } else {\n", "<stmts>", "    }\n"],
            &["    for i in 0..", "<bound>", " {\n", "<stmts>", "    }\n"],
        ]),
    );
    rules.insert(
        "expr".to_string(),
        alts(&[
            &["<term>"],
            &["<term>", " + ", "<expr>"],
            &["<term>", " - ", "<expr>"],
            &["<term>", " * ", "<term>"],
        ]),
    );
    rules.insert(
        "term".to_string(),
        alts(&[&["$int"], &["<var>"], &["i"], &["(", "<expr>", ")"]]),
    );
    rules.insert(
        "cond".to_string(),
        alts(&[
            &["true"],
            &["false"],
            &["<expr>", " < ", "<expr>"],
            &["<expr>", " == ", "<expr>"],
        ]),
    );
    rules.insert("var".to_string(), alts(&[&["a"], &["b"], &["c"]]));
    rules.insert("bound".to_string(), alts(&[&["1"], &["3"], &["10"]]));
    GrammarDef {
        start: "program".to_string(),
        rules,
    }
}

pub fn default_grammar() -> Result<Grammar, GrammarError> {
    Grammar::new(default_grammar_def())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn default_grammar_expands_to_a_program() {
        let grammar = default_grammar().unwrap();
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        for _ in 0..50 {
            let program = grammar.expand(6, &mut rng);
            assert!(program.starts_with("fun main() {\n"));
            assert!(program.ends_with("}\n"));
            assert_eq!(program.matches('{').count(), program.matches('}').count());
        }
    }

    #[test]
    fn zero_depth_takes_shallowest_path() {
        let grammar = default_grammar().unwrap();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let program = grammar.expand(0, &mut rng);
        assert_eq!(program.lines().count(), 6, "{program}");
        assert!(!program.contains("if "));
        assert!(!program.contains("for "));
    }

    #[test]
    fn expansion_is_deterministic_per_seed() {
        let grammar = default_grammar().unwrap();
        let a = grammar.expand(5, &mut ChaCha8Rng::from_seed([7; 32]));
        let b = grammar.expand(5, &mut ChaCha8Rng::from_seed([7; 32]));
        assert_eq!(a, b);
    }

    #[test]
    fn grammar_loads_from_json() {
        let grammar = Grammar::from_json(
            r#"{ "start": "s", "rules": { "s": [["print(", "<n>", ")\n"]], "n": [["$int"], ["0"]] } }"#,
        )
        .unwrap();
        let text = grammar.expand(3, &mut ChaCha8Rng::from_seed([2; 32]));
        assert!(text.starts_with("print("));
    }

    #[test]
    fn invalid_grammars_are_rejected() {
        let undefined = r#"{ "start": "s", "rules": { "s": [["<missing>"]] } }"#;
        assert!(matches!(
            Grammar::from_json(undefined),
            Err(GrammarError::UndefinedSymbol { .. })
        ));

        let looping = r#"{ "start": "s", "rules": { "s": [["x", "<s>"]] } }"#;
        assert!(matches!(
            Grammar::from_json(looping),
            Err(GrammarError::Unproductive(name)) if name == "s"
        ));

        let no_start = r#"{ "start": "top", "rules": { "s": [["x"]] } }"#;
        assert!(matches!(
            Grammar::from_json(no_start),
            Err(GrammarError::MissingStart(_))
        ));
    }
}
