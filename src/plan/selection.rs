//! Step subset selection.
//!
//! A selection expression is a whitespace- or comma-separated list of
//! tokens over flattened step keys:
//!
//! - `name` selects one step
//! - `+name` also selects its direct ancestors; each extra leading `+`
//!   reaches one generation further (`++name` includes grandparents)
//! - `name+` does the same downstream
//! - `*name` / `name*` select the full ancestor / descendant closure
//! - `*` selects every step
//!
//! Selecting a subset does not relax input requirements: a selected
//! step whose producer is excluded must get that input from run config,
//! and the plan builder reports the miss naming both steps.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::plan::PlanError;
use crate::types::StepKey;

#[derive(Clone, Debug, PartialEq, Eq)]
struct SelectionToken {
    name: String,
    /// Generations of ancestors to include (leading `+` count).
    ancestors: usize,
    /// Generations of descendants to include (trailing `+` count).
    descendants: usize,
    all: bool,
}

/// A parsed selection expression.
///
/// # Examples
///
/// ```rust
/// use runloom::plan::StepSelection;
///
/// let everything = StepSelection::all();
/// assert!(everything.is_all());
///
/// let subset = StepSelection::parse("+train report").unwrap();
/// assert!(!subset.is_all());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StepSelection {
    tokens: Vec<SelectionToken>,
}

impl std::fmt::Display for StepSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self
            .tokens
            .iter()
            .map(|t| {
                if t.all {
                    "*".to_string()
                } else {
                    let affix = |n: usize| {
                        if n == usize::MAX {
                            "*".to_string()
                        } else {
                            "+".repeat(n)
                        }
                    };
                    format!("{}{}{}", affix(t.ancestors), t.name, affix(t.descendants))
                }
            })
            .collect();
        write!(f, "{}", rendered.join(" "))
    }
}

impl From<StepSelection> for String {
    fn from(selection: StepSelection) -> Self {
        selection.to_string()
    }
}

impl TryFrom<String> for StepSelection {
    type Error = PlanError;

    fn try_from(expr: String) -> Result<Self, Self::Error> {
        StepSelection::parse(&expr)
    }
}

impl Default for StepSelection {
    fn default() -> Self {
        Self::all()
    }
}

impl StepSelection {
    /// The full plan.
    #[must_use]
    pub fn all() -> Self {
        StepSelection {
            tokens: vec![SelectionToken {
                name: String::new(),
                ancestors: 0,
                descendants: 0,
                all: true,
            }],
        }
    }

    #[must_use]
    pub fn is_all(&self) -> bool {
        self.tokens.iter().any(|t| t.all)
    }

    /// Parse a selection expression. Empty input is an error; use
    /// [`StepSelection::all`] for "everything".
    pub fn parse(expr: &str) -> Result<Self, PlanError> {
        let mut tokens = Vec::new();
        for raw in expr.split([' ', ',', '\t', '\n']).filter(|t| !t.is_empty()) {
            tokens.push(parse_token(raw)?);
        }
        if tokens.is_empty() {
            return Err(PlanError::BadSelectionToken {
                token: expr.to_string(),
            });
        }
        Ok(StepSelection { tokens })
    }

    /// Expand to the concrete set of step keys over the flattened
    /// dependency graph.
    pub(crate) fn resolve(
        &self,
        keys: &[StepKey],
        upstreams: &FxHashMap<StepKey, Vec<StepKey>>,
        dependents: &FxHashMap<StepKey, Vec<StepKey>>,
    ) -> Result<FxHashSet<StepKey>, PlanError> {
        let known: FxHashSet<&StepKey> = keys.iter().collect();
        let mut selected: FxHashSet<StepKey> = FxHashSet::default();

        for token in &self.tokens {
            if token.all {
                selected.extend(keys.iter().cloned());
                continue;
            }
            let root = StepKey::new(token.name.clone());
            if !known.contains(&root) {
                return Err(PlanError::UnknownSelectionStep {
                    name: token.name.clone(),
                });
            }
            selected.insert(root.clone());
            expand(&root, token.ancestors, upstreams, &mut selected);
            expand(&root, token.descendants, dependents, &mut selected);
        }

        if selected.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        Ok(selected)
    }
}

/// Breadth-first walk `generations` levels along `edges`.
fn expand(
    root: &StepKey,
    generations: usize,
    edges: &FxHashMap<StepKey, Vec<StepKey>>,
    selected: &mut FxHashSet<StepKey>,
) {
    let mut frontier = vec![root.clone()];
    for _ in 0..generations {
        let mut next = Vec::new();
        for key in frontier {
            for neighbor in edges.get(&key).map(Vec::as_slice).unwrap_or(&[]) {
                if selected.insert(neighbor.clone()) {
                    next.push(neighbor.clone());
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
}

fn parse_token(raw: &str) -> Result<SelectionToken, PlanError> {
    let bad = || PlanError::BadSelectionToken {
        token: raw.to_string(),
    };

    if raw == "*" {
        return Ok(SelectionToken {
            name: String::new(),
            ancestors: 0,
            descendants: 0,
            all: true,
        });
    }

    // A `*` affix means the unbounded closure on that side; `+` affixes
    // count generations. The two cannot be combined on one side.
    let (ancestors, rest) = if let Some(rest) = raw.strip_prefix('*') {
        (usize::MAX, rest)
    } else {
        let plusses = raw.chars().take_while(|c| *c == '+').count();
        (plusses, &raw[plusses..])
    };
    let (descendants, name) = if let Some(name) = rest.strip_suffix('*') {
        (usize::MAX, name)
    } else {
        let plusses = rest.chars().rev().take_while(|c| *c == '+').count();
        (plusses, &rest[..rest.len() - plusses])
    };
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(bad());
    }
    Ok(SelectionToken {
        name: name.to_string(),
        ancestors,
        descendants,
        all: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (
        Vec<StepKey>,
        FxHashMap<StepKey, Vec<StepKey>>,
        FxHashMap<StepKey, Vec<StepKey>>,
    ) {
        // a -> b -> d, a -> c -> d
        let keys: Vec<StepKey> = ["a", "b", "c", "d"].iter().map(|s| StepKey::new(*s)).collect();
        let mut ups: FxHashMap<StepKey, Vec<StepKey>> = FxHashMap::default();
        ups.insert(StepKey::new("b"), vec![StepKey::new("a")]);
        ups.insert(StepKey::new("c"), vec![StepKey::new("a")]);
        ups.insert(StepKey::new("d"), vec![StepKey::new("b"), StepKey::new("c")]);
        let mut downs: FxHashMap<StepKey, Vec<StepKey>> = FxHashMap::default();
        downs.insert(StepKey::new("a"), vec![StepKey::new("b"), StepKey::new("c")]);
        downs.insert(StepKey::new("b"), vec![StepKey::new("d")]);
        downs.insert(StepKey::new("c"), vec![StepKey::new("d")]);
        (keys, ups, downs)
    }

    #[test]
    fn descendant_expansion_is_one_generation_per_plus() {
        let (keys, ups, downs) = diamond();
        let sel = StepSelection::parse("b+").unwrap();
        let resolved = sel.resolve(&keys, &ups, &downs).unwrap();
        let mut got: Vec<&str> = resolved.iter().map(StepKey::as_str).collect();
        got.sort();
        assert_eq!(got, vec!["b", "d"]);
    }

    #[test]
    fn ancestor_expansion_stacks() {
        let (keys, ups, downs) = diamond();
        let one = StepSelection::parse("+d").unwrap().resolve(&keys, &ups, &downs).unwrap();
        assert_eq!(one.len(), 3); // b, c, d
        let two = StepSelection::parse("++d").unwrap().resolve(&keys, &ups, &downs).unwrap();
        assert_eq!(two.len(), 4); // a too
    }

    #[test]
    fn star_affix_takes_the_full_closure() {
        let (keys, ups, downs) = diamond();
        let up = StepSelection::parse("*d").unwrap().resolve(&keys, &ups, &downs).unwrap();
        assert_eq!(up.len(), 4); // every ancestor of d, plus d
        let down = StepSelection::parse("a*").unwrap().resolve(&keys, &ups, &downs).unwrap();
        assert_eq!(down.len(), 4); // every descendant of a, plus a
        let b_down = StepSelection::parse("b*").unwrap().resolve(&keys, &ups, &downs).unwrap();
        let mut got: Vec<&str> = b_down.iter().map(StepKey::as_str).collect();
        got.sort();
        assert_eq!(got, vec!["b", "d"]);
    }

    #[test]
    fn star_selects_everything() {
        let (keys, ups, downs) = diamond();
        let resolved = StepSelection::parse("*").unwrap().resolve(&keys, &ups, &downs).unwrap();
        assert_eq!(resolved.len(), 4);
    }

    #[test]
    fn unknown_step_is_an_error() {
        let (keys, ups, downs) = diamond();
        let err = StepSelection::parse("nope").unwrap().resolve(&keys, &ups, &downs);
        assert!(matches!(err, Err(PlanError::UnknownSelectionStep { .. })));
    }

    #[test]
    fn render_parse_round_trip() {
        let sel = StepSelection::parse("++a b+ *c d* *").unwrap();
        assert_eq!(StepSelection::parse(&sel.to_string()).unwrap(), sel);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(StepSelection::parse("").is_err());
        assert!(StepSelection::parse("+*").is_err());
        assert!(StepSelection::parse("a b!").is_err());
    }
}
