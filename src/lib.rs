//! Persistent, incremental, demand-driven dependency-graph evaluation engine.
//!
//! Clients describe a set of named computations (schemas), some with
//! symbolic parameters, whose outputs depend on other named values. The
//! engine materializes concrete values on demand, persists them in a
//! key-value store, and guarantees that subsequent reads observe values
//! consistent with the latest declared inputs while recomputing only the
//! minimum necessary.
//!
//! # Architecture
//!
//! - [`expr`]: node expressions, constants, and canonical serialization —
//!   the sole identity used for storage keys.
//! - [`schema`]: declared node definitions, compiled schema records, and the
//!   [`Unchanged`](schema::Unchanged) sentinel.
//! - [`validate`]: schema-set validation (output-pattern overlap, pattern-
//!   level acyclicity).
//! - [`hash`]: stable hashing of a compiled schema set into the storage
//!   namespace it owns.
//! - [`storage`]: the [`Store`](storage::Store) trait and its `redb`-backed,
//!   counting, and in-memory implementations.
//! - [`evaluator`]: [`Graph::pull`](evaluator::Graph::pull) and
//!   [`Graph::set`](evaluator::Graph::set) — the demand-driven evaluation
//!   protocol itself.
//!
//! # Example
//!
//! ```ignore
//! use depgraph::{make, NodeDef, ComputeOutcome, Computor};
//! use depgraph::storage::MemStore;
//! use std::sync::Arc;
//!
//! # struct Increment;
//! # #[async_trait::async_trait]
//! # impl Computor for Increment {
//! #     async fn compute(&self, inputs: Vec<serde_json::Value>, _old: Option<serde_json::Value>, _b: &std::collections::HashMap<String, depgraph::ConstValue>) -> depgraph::Result<ComputeOutcome> {
//! #         Ok(ComputeOutcome::Value(inputs[0].clone()))
//! #     }
//! # }
//! # async fn run() -> depgraph::Result<()> {
//! let store = Arc::new(MemStore::new());
//! let graph = make(
//!     store,
//!     vec![
//!         NodeDef::source("a", Arc::new(Increment)),
//!         NodeDef::new("b", vec!["a".to_string()], Arc::new(Increment)),
//!     ],
//! )?;
//! graph.set("a", serde_json::json!(1)).await?;
//! let _ = graph.pull("b").await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod evaluator;
pub mod expr;
pub mod hash;
pub mod schema;
pub mod storage;
pub mod validate;

pub use error::{DepGraphError, Result};
pub use evaluator::{make, Freshness, Graph, GraphStats};
pub use expr::{canonicalize, parse, render, Arg, ConstValue, Expression};
pub use hash::schema_hash;
pub use schema::{is_unchanged, make_unchanged, ComputeOutcome, Computor, NodeDef, Unchanged};
pub use storage::{BatchOp, Store, Sublevel};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;

    struct ConstComputor(Value);

    #[async_trait]
    impl Computor for ConstComputor {
        async fn compute(
            &self,
            _inputs: Vec<Value>,
            _old_value: Option<Value>,
            _bindings: &HashMap<String, ConstValue>,
        ) -> Result<ComputeOutcome> {
            Ok(ComputeOutcome::Value(self.0.clone()))
        }
    }

    /// Property 8: two graphs with distinct schema hashes sharing one store
    /// cannot observe each other's `values`/`freshness`/`inputs`/`revdeps`.
    #[tokio::test]
    async fn distinct_schema_hashes_do_not_share_state() {
        let store = Arc::new(MemStore::new());

        let graph_one = make(
            store.clone(),
            vec![NodeDef::source("a", Arc::new(ConstComputor(json!(1))))],
        )
        .unwrap();
        let graph_two = make(
            store,
            vec![NodeDef::source("a", Arc::new(ConstComputor(json!(2))))],
        )
        .unwrap();

        assert_ne!(graph_one.schema_hash(), graph_two.schema_hash());

        graph_one.set("a", json!(100)).await.unwrap();

        assert_eq!(graph_one.pull("a").await.unwrap(), json!(100));
        // graph_two never had "a" set under its own namespace, so it falls
        // back to materializing via its own schema rather than seeing
        // graph_one's stored value.
        assert_eq!(graph_two.pull("a").await.unwrap(), json!(2));

        assert_eq!(
            graph_two.debug_get_freshness("a").await.unwrap(),
            Freshness::UpToDate,
        );
        // graph_two materialized independently; it must not have inherited
        // graph_one's revdeps/inputs bookkeeping either.
        assert_eq!(
            graph_two.debug_list_materialized_nodes().await.unwrap(),
            vec!["a".to_string()]
        );
    }
}
