//! Schema hashing: derives the namespace under which a compiled schema
//! set's materialized state is stored.

use crate::expr;
use crate::schema::CompiledNode;

/// Hash an ordered, compiled schema set into a stable hex digest.
///
/// Two schema sets with the same declarations in the same order hash
/// identically; any change to an output pattern, an input pattern, or their
/// relative order changes the hash, which changes the storage namespace and
/// so makes every previously materialized node `missing` again (spec §3).
pub fn schema_hash(nodes: &[CompiledNode]) -> String {
    let mut hasher = blake3::Hasher::new();
    for node in nodes {
        hasher.update(node.canonical_output.as_bytes());
        hasher.update(b"\0");
        for pattern in &node.input_patterns {
            hasher.update(expr::render(pattern).as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"\x1e"); // record separator between schemas
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ComputeOutcome, Computor, NodeDef};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct NoopComputor;

    #[async_trait]
    impl Computor for NoopComputor {
        async fn compute(
            &self,
            _inputs: Vec<Value>,
            _old_value: Option<Value>,
            _bindings: &HashMap<String, crate::expr::ConstValue>,
        ) -> crate::error::Result<ComputeOutcome> {
            Ok(ComputeOutcome::Value(Value::Null))
        }
    }

    fn compiled(output: &str, inputs: Vec<&str>) -> CompiledNode {
        let def = NodeDef::new(
            output,
            inputs.into_iter().map(str::to_string).collect(),
            Arc::new(NoopComputor),
        );
        crate::schema::compile(&def).unwrap()
    }

    #[test]
    fn identical_schema_sets_hash_identically() {
        let set_a = vec![compiled("a", vec![]), compiled("b", vec!["a"])];
        let set_b = vec![compiled("a", vec![]), compiled("b", vec!["a"])];
        assert_eq!(schema_hash(&set_a), schema_hash(&set_b));
    }

    #[test]
    fn changing_an_input_pattern_changes_the_hash() {
        let before = vec![compiled("a", vec![]), compiled("b", vec!["a"])];
        let after = vec![compiled("a", vec![]), compiled("b", vec!["c"])];
        assert_ne!(schema_hash(&before), schema_hash(&after));
    }

    #[test]
    fn changing_declaration_order_changes_the_hash() {
        let one = vec![compiled("a", vec![]), compiled("b", vec!["a"])];
        let two = vec![compiled("b", vec!["a"]), compiled("a", vec![])];
        assert_ne!(schema_hash(&one), schema_hash(&two));
    }
}
