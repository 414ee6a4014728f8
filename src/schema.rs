//! Schema declarations, compiled node records, and the `Unchanged` sentinel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DepGraphError, Result};
use crate::expr::{self, Arg, ConstValue, Expression};

/// Sentinel marker type returned by [`make_unchanged`]. Distinguishable from
/// every admissible `Value` by the type system itself, not by a reserved
/// runtime tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unchanged;

/// Construct the `Unchanged` sentinel.
pub fn make_unchanged() -> Unchanged {
    Unchanged
}

/// True iff a `ComputeOutcome` is the `Unchanged` variant.
pub fn is_unchanged(outcome: &ComputeOutcome) -> bool {
    matches!(outcome, ComputeOutcome::Unchanged)
}

/// What a computor returns: either a fresh value or an assertion that the
/// logically stored value did not change.
#[derive(Debug, Clone)]
pub enum ComputeOutcome {
    /// A freshly computed value to store.
    Value(Value),
    /// The previously stored value is still correct; do not overwrite it.
    Unchanged,
}

impl From<Value> for ComputeOutcome {
    fn from(value: Value) -> Self {
        ComputeOutcome::Value(value)
    }
}

impl From<Unchanged> for ComputeOutcome {
    fn from(_: Unchanged) -> Self {
        ComputeOutcome::Unchanged
    }
}

/// User-supplied computation attached to a schema.
///
/// Input order matches the schema's declared input order. `old_value` is
/// `None` on first materialization and `Some` on every subsequent
/// recomputation.
#[async_trait]
pub trait Computor: Send + Sync {
    /// Compute (or reaffirm) this node's value from its resolved inputs.
    async fn compute(
        &self,
        inputs: Vec<Value>,
        old_value: Option<Value>,
        bindings: &HashMap<String, ConstValue>,
    ) -> Result<ComputeOutcome>;
}

/// A user-declared node definition: `output <- inputs via computor`.
///
/// A definition with no `inputs` is a *source schema*, settable via
/// [`crate::Graph::set`].
pub struct NodeDef {
    /// The output pattern text (may contain variables).
    pub output: String,
    /// Input pattern texts; every variable here must appear in `output`.
    pub inputs: Vec<String>,
    /// The computation that produces this node's value from its inputs.
    pub computor: Arc<dyn Computor>,
}

impl NodeDef {
    /// Declare a derived node with one or more inputs.
    pub fn new(output: impl Into<String>, inputs: Vec<String>, computor: Arc<dyn Computor>) -> Self {
        Self {
            output: output.into(),
            inputs,
            computor,
        }
    }

    /// Declare a source node (no inputs, settable via `set`).
    pub fn source(output: impl Into<String>, computor: Arc<dyn Computor>) -> Self {
        Self {
            output: output.into(),
            inputs: Vec::new(),
            computor,
        }
    }
}

/// A single output-pattern argument position, classified at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    /// A free variable at this position.
    Var(String),
    /// A fixed literal at this position.
    Const(ConstValue),
}

/// A schema compiled from a [`NodeDef`]: canonical output, structural
/// metadata needed for matching and unification, and the parsed input
/// patterns.
pub struct CompiledNode {
    /// Canonical form of the output pattern (the schema's identity).
    pub canonical_output: String,
    /// Output pattern head.
    pub head: String,
    /// Output pattern arity.
    pub arity: usize,
    /// Per-position classification of the output pattern's arguments.
    pub arg_kinds: Vec<ArgKind>,
    /// Positions in the output sharing the same variable name (len > 1 only).
    pub repeated_vars: HashMap<String, Vec<usize>>,
    /// Parsed output pattern (kept for rendering/unification).
    pub output_pattern: Expression,
    /// Parsed input patterns, in declared order.
    pub input_patterns: Vec<Expression>,
    /// Set of variable names referenced across all input patterns.
    pub input_vars: HashSet<String>,
    /// The user-supplied computor.
    pub computor: Arc<dyn Computor>,
}

impl CompiledNode {
    /// A source schema has no inputs.
    pub fn is_source(&self) -> bool {
        self.input_patterns.is_empty()
    }
}

/// Classify an expression's arguments into [`ArgKind`]s. Shared between
/// schema compilation (for an output pattern) and cycle detection (for an
/// input pattern treated as an ad hoc unification target).
pub(crate) fn classify_args(expr: &Expression) -> Vec<ArgKind> {
    expr.args
        .iter()
        .map(|a| match a {
            Arg::Var(name) => ArgKind::Var(name.clone()),
            Arg::Const(c) => ArgKind::Const(c.clone()),
        })
        .collect()
}

/// Compile a single [`NodeDef`] into a [`CompiledNode`], enforcing variable
/// coverage: every variable used in an input pattern must appear in the
/// output pattern (spec §4.2).
pub fn compile(def: &NodeDef) -> Result<CompiledNode> {
    let output_pattern = expr::parse(&def.output)?;
    let canonical_output = expr::render(&output_pattern);
    let arg_kinds = classify_args(&output_pattern);

    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, kind) in arg_kinds.iter().enumerate() {
        if let ArgKind::Var(name) = kind {
            positions.entry(name.clone()).or_default().push(i);
        }
    }
    let repeated_vars: HashMap<String, Vec<usize>> =
        positions.into_iter().filter(|(_, ps)| ps.len() > 1).collect();

    let output_vars: HashSet<&str> = output_pattern.variables().into_iter().collect();

    let mut input_patterns = Vec::with_capacity(def.inputs.len());
    let mut input_vars = HashSet::new();
    for input_text in &def.inputs {
        let pattern = expr::parse(input_text)?;
        for var in pattern.variables() {
            if !output_vars.contains(var) {
                return Err(DepGraphError::InvalidSchema {
                    schema_output: canonical_output.clone(),
                    message: format!(
                        "input variable '{var}' does not appear in the output pattern"
                    ),
                });
            }
            input_vars.insert(var.to_string());
        }
        input_patterns.push(pattern);
    }

    Ok(CompiledNode {
        head: output_pattern.head.clone(),
        arity: output_pattern.args.len(),
        arg_kinds,
        repeated_vars,
        output_pattern,
        canonical_output,
        input_patterns,
        input_vars,
        computor: Arc::clone(&def.computor),
    })
}

/// Check whether a concrete key matches a compiled node's output pattern,
/// returning the variable bindings implied by the match.
///
/// A match requires: equal head and arity, every constant position equal,
/// and every set of positions sharing a variable equal to each other.
pub fn match_bindings(node: &CompiledNode, key: &Expression) -> Option<HashMap<String, ConstValue>> {
    if key.head != node.head || key.args.len() != node.arity {
        return None;
    }

    let mut bindings = HashMap::new();
    for (i, kind) in node.arg_kinds.iter().enumerate() {
        let Arg::Const(key_const) = &key.args[i] else {
            return None; // the key itself must be concrete
        };
        match kind {
            ArgKind::Const(expected) => {
                if expected != key_const {
                    return None;
                }
            }
            ArgKind::Var(name) => {
                bindings.insert(name.clone(), key_const.clone());
            }
        }
    }

    for positions in node.repeated_vars.values() {
        let Arg::Const(first) = &key.args[positions[0]] else {
            return None;
        };
        for &pos in &positions[1..] {
            let Arg::Const(other) = &key.args[pos] else {
                return None;
            };
            if other != first {
                return None;
            }
        }
    }

    Some(bindings)
}

/// Substitute bindings into an input pattern to obtain a concrete
/// expression. Every variable in `pattern` is guaranteed (by
/// [`compile`]'s coverage check) to be present in `bindings`.
pub fn instantiate(pattern: &Expression, bindings: &HashMap<String, ConstValue>) -> Expression {
    let args = pattern
        .args
        .iter()
        .map(|a| match a {
            Arg::Var(name) => Arg::Const(
                bindings
                    .get(name)
                    .cloned()
                    .expect("variable coverage guarantees a binding"),
            ),
            Arg::Const(c) => Arg::Const(c.clone()),
        })
        .collect();
    Expression {
        head: pattern.head.clone(),
        args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopComputor;

    #[async_trait]
    impl Computor for NoopComputor {
        async fn compute(
            &self,
            _inputs: Vec<Value>,
            _old_value: Option<Value>,
            _bindings: &HashMap<String, ConstValue>,
        ) -> Result<ComputeOutcome> {
            Ok(ComputeOutcome::Value(Value::Null))
        }
    }

    #[test]
    fn compiles_source_schema() {
        let def = NodeDef::source("a", Arc::new(NoopComputor));
        let compiled = compile(&def).unwrap();
        assert!(compiled.is_source());
        assert_eq!(compiled.canonical_output, "a");
    }

    #[test]
    fn compiles_derived_schema_with_variable() {
        let def = NodeDef::new(
            "event_context(e)",
            vec!["all_events".to_string()],
            Arc::new(NoopComputor),
        );
        let compiled = compile(&def).unwrap();
        assert!(!compiled.is_source());
        assert_eq!(compiled.head, "event_context");
        assert_eq!(compiled.arity, 1);
    }

    #[test]
    fn rejects_uncovered_input_variable() {
        let def = NodeDef::new(
            "b(x)",
            vec!["a(y)".to_string()],
            Arc::new(NoopComputor),
        );
        let err = compile(&def).unwrap_err();
        assert!(matches!(err, DepGraphError::InvalidSchema { .. }));
    }

    #[test]
    fn matches_concrete_key_and_extracts_bindings() {
        let def = NodeDef::new("status(e,s)", vec![], Arc::new(NoopComputor));
        let compiled = compile(&def).unwrap();
        let key = expr::parse("status('id123','active')").unwrap();
        let bindings = match_bindings(&compiled, &key).unwrap();
        assert_eq!(bindings.get("e"), Some(&ConstValue::Str("id123".to_string())));
        assert_eq!(bindings.get("s"), Some(&ConstValue::Str("active".to_string())));
    }

    #[test]
    fn rejects_mismatched_head_or_arity() {
        let def = NodeDef::new("status(e,s)", vec![], Arc::new(NoopComputor));
        let compiled = compile(&def).unwrap();
        assert!(match_bindings(&compiled, &expr::parse("other('a','b')").unwrap()).is_none());
        assert!(match_bindings(&compiled, &expr::parse("status('a')").unwrap()).is_none());
    }

    #[test]
    fn repeated_variable_constrains_equal_positions() {
        let def = NodeDef::new("pair(x,x)", vec![], Arc::new(NoopComputor));
        let compiled = compile(&def).unwrap();
        assert!(match_bindings(&compiled, &expr::parse("pair('a','a')").unwrap()).is_some());
        assert!(match_bindings(&compiled, &expr::parse("pair('a','b')").unwrap()).is_none());
    }

    #[test]
    fn instantiate_substitutes_bindings() {
        let pattern = expr::parse("all_events").unwrap();
        let bindings = HashMap::new();
        assert_eq!(expr::render(&instantiate(&pattern, &bindings)), "all_events");

        let pattern = expr::parse("event_context(e)").unwrap();
        let mut bindings = HashMap::new();
        bindings.insert("e".to_string(), ConstValue::Str("id123".to_string()));
        assert_eq!(
            expr::render(&instantiate(&pattern, &bindings)),
            "event_context('id123')"
        );
    }
}
