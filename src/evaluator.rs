//! The demand-driven evaluator: `pull`, `set`, freshness tracking, and
//! atomic invalidation fan-out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{DepGraphError, Result};
use crate::expr::{self, ConstValue, Expression};
use crate::hash::schema_hash;
use crate::schema::{self, CompiledNode, ComputeOutcome, NodeDef};
use crate::storage::{BatchOp, Store, Sublevel};

// ASCII unit separator. Safe as a composite-key join character only because
// `expr::parse` rejects every raw control byte in a string constant and no
// escape sequence produces one (see `expr::parse_string_literal`), so this
// byte can never occur inside a canonical key's own content.
const REVDEP_SEP: char = '\u{1f}';

/// Freshness of a materialized node relative to its declared inputs
/// (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Never materialized (or materialized under a different schema hash).
    Missing,
    /// Materialized and known correct under the current schema.
    UpToDate,
    /// Materialized, but an ancestor has since been set or recomputed with
    /// a changed value; must be re-examined before being trusted.
    PotentiallyOutdated,
}

impl Freshness {
    fn to_wire(self) -> &'static [u8] {
        match self {
            Freshness::Missing => b"missing",
            Freshness::UpToDate => b"up-to-date",
            Freshness::PotentiallyOutdated => b"potentially-outdated",
        }
    }

    fn from_wire(bytes: &[u8]) -> Self {
        match bytes {
            b"up-to-date" => Freshness::UpToDate,
            b"potentially-outdated" => Freshness::PotentiallyOutdated,
            _ => Freshness::Missing,
        }
    }
}

/// Snapshot counts over a graph's materialized nodes, grouped by freshness.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStats {
    /// Nodes currently up-to-date.
    pub up_to_date: usize,
    /// Nodes currently potentially-outdated (invalidated but not yet re-examined).
    pub potentially_outdated: usize,
}

fn revdep_key(input: &str, dependent: &str) -> String {
    format!("{input}{REVDEP_SEP}{dependent}")
}

/// A compiled, validated dependency graph bound to a [`Store`].
///
/// Construct with [`make`]. Safe to share across tasks: every method takes
/// `&self`, and per-node mutual exclusion is internal (spec §5).
pub struct Graph {
    nodes: Vec<CompiledNode>,
    schema_hash: String,
    store: Arc<dyn Store>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Compile, validate, and hash a set of node definitions, producing a
/// [`Graph`] bound to `store`.
pub fn make(store: Arc<dyn Store>, defs: Vec<NodeDef>) -> Result<Graph> {
    let nodes: Vec<CompiledNode> = defs.iter().map(schema::compile).collect::<Result<_>>()?;
    crate::validate::validate_schemas(&nodes)?;
    let hash = schema_hash(&nodes);
    log::info!(
        "compiled dependency graph: {} schemas, schema_hash={}",
        nodes.len(),
        hash
    );
    Ok(Graph {
        nodes,
        schema_hash: hash,
        store,
        locks: DashMap::new(),
    })
}

impl Graph {
    /// The schema hash this graph's materialized state is namespaced under.
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    fn find_match(&self, key: &Expression) -> Option<(&CompiledNode, HashMap<String, ConstValue>)> {
        for node in &self.nodes {
            if let Some(bindings) = schema::match_bindings(node, key) {
                return Some((node, bindings));
            }
        }
        None
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    async fn read_value(&self, key: &str) -> Result<Option<Value>> {
        match self.store.get(&self.schema_hash, Sublevel::Values, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_freshness(&self, key: &str) -> Result<Freshness> {
        match self
            .store
            .get(&self.schema_hash, Sublevel::Freshness, key)
            .await?
        {
            Some(bytes) => Ok(Freshness::from_wire(&bytes)),
            None => Ok(Freshness::Missing),
        }
    }

    async fn read_inputs(&self, key: &str) -> Result<Vec<String>> {
        match self.store.get(&self.schema_hash, Sublevel::Inputs, key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn direct_dependents(&self, key: &str) -> Result<Vec<String>> {
        let prefix = format!("{key}{REVDEP_SEP}");
        let keys = self.store.keys(&self.schema_hash, Sublevel::RevDeps).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect())
    }

    /// Resolve `key` to a value, materializing or recomputing as needed.
    ///
    /// Returns [`DepGraphError::NonConcreteNode`] if `key` contains a
    /// variable, or [`DepGraphError::InvalidNode`] if no schema matches it.
    pub async fn pull(&self, key: &str) -> Result<Value> {
        let canonical = expr::canonicalize(key)?;
        let key_expr = expr::parse(&canonical)?;
        if !key_expr.is_concrete() {
            return Err(DepGraphError::NonConcreteNode { key: canonical });
        }
        self.find_match(&key_expr)
            .ok_or_else(|| DepGraphError::InvalidNode { key: canonical.clone() })?;

        let mut memo = HashMap::new();
        let (value, _changed) = self.pull_inner(&canonical, &mut memo).await?;
        Ok(value)
    }

    /// Core recursive pull. `memo` deduplicates repeated visits to the same
    /// key within a single top-level [`pull`] (diamond-shaped dependencies);
    /// the per-key [`Mutex`] deduplicates concurrent top-level pulls on the
    /// same key across different callers — a second caller blocks on the
    /// lock and, once it acquires it, observes the already-up-to-date
    /// result rather than recomputing.
    fn pull_inner<'a>(
        &'a self,
        key: &'a str,
        memo: &'a mut HashMap<String, (Value, bool)>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(Value, bool)>> + Send + 'a>>
    {
        Box::pin(async move {
            if let Some((value, changed)) = memo.get(key) {
                return Ok((value.clone(), *changed));
            }

            let lock = self.lock_for(key);
            let _guard = lock.lock().await;

            if let Some((value, changed)) = memo.get(key) {
                return Ok((value.clone(), *changed));
            }

            let key_expr = expr::parse(key)?;
            let (node, bindings) = self
                .find_match(&key_expr)
                .ok_or_else(|| DepGraphError::InvalidNode { key: key.to_string() })?;

            let freshness = self.read_freshness(key).await?;
            let (value, changed) = match freshness {
                Freshness::UpToDate => {
                    let stored = self
                        .read_value(key)
                        .await?
                        .ok_or_else(|| DepGraphError::MissingValue { key: key.to_string() })?;
                    log::debug!("pull({key}): up-to-date, returning cached value");
                    (stored, false)
                }
                Freshness::Missing => {
                    log::debug!("pull({key}): missing, materializing");
                    self.materialize(key, node, &bindings, memo).await?
                }
                Freshness::PotentiallyOutdated => {
                    log::debug!("pull({key}): potentially-outdated, re-examining inputs");
                    self.recompute_conditionally(key, node, &bindings, memo).await?
                }
            };

            memo.insert(key.to_string(), (value.clone(), changed));
            Ok((value, changed))
        })
    }

    async fn resolve_inputs(
        &self,
        node: &CompiledNode,
        bindings: &HashMap<String, ConstValue>,
        memo: &mut HashMap<String, (Value, bool)>,
    ) -> Result<(Vec<Value>, Vec<String>, bool)> {
        let mut values = Vec::with_capacity(node.input_patterns.len());
        let mut keys = Vec::with_capacity(node.input_patterns.len());
        let mut any_changed = false;
        for pattern in &node.input_patterns {
            let concrete_key = expr::render(&schema::instantiate(pattern, bindings));
            let (value, changed) = self.pull_inner(&concrete_key, memo).await?;
            any_changed |= changed;
            values.push(value);
            keys.push(concrete_key);
        }
        Ok((values, keys, any_changed))
    }

    async fn materialize(
        &self,
        key: &str,
        node: &CompiledNode,
        bindings: &HashMap<String, ConstValue>,
        memo: &mut HashMap<String, (Value, bool)>,
    ) -> Result<(Value, bool)> {
        let (input_values, input_keys, _) = self.resolve_inputs(node, bindings, memo).await?;

        let outcome = node.computor.compute(input_values, None, bindings).await?;
        let value = match outcome {
            ComputeOutcome::Value(v) => v,
            ComputeOutcome::Unchanged => {
                return Err(DepGraphError::InvalidComputorResult { key: key.to_string() });
            }
        };

        let mut ops = vec![
            BatchOp::Put {
                sublevel: Sublevel::Values,
                key: key.to_string(),
                value: serde_json::to_vec(&value)?,
            },
            BatchOp::Put {
                sublevel: Sublevel::Freshness,
                key: key.to_string(),
                value: Freshness::UpToDate.to_wire().to_vec(),
            },
            BatchOp::Put {
                sublevel: Sublevel::Inputs,
                key: key.to_string(),
                value: serde_json::to_vec(&input_keys)?,
            },
        ];
        for input_key in &input_keys {
            ops.push(BatchOp::Put {
                sublevel: Sublevel::RevDeps,
                key: revdep_key(input_key, key),
                value: Vec::new(),
            });
        }
        self.store.batch(&self.schema_hash, ops).await?;
        Ok((value, true))
    }

    async fn recompute_conditionally(
        &self,
        key: &str,
        node: &CompiledNode,
        bindings: &HashMap<String, ConstValue>,
        memo: &mut HashMap<String, (Value, bool)>,
    ) -> Result<(Value, bool)> {
        let (input_values, input_keys, any_changed) =
            self.resolve_inputs(node, bindings, memo).await?;

        if !any_changed {
            self.store
                .batch(
                    &self.schema_hash,
                    vec![BatchOp::Put {
                        sublevel: Sublevel::Freshness,
                        key: key.to_string(),
                        value: Freshness::UpToDate.to_wire().to_vec(),
                    }],
                )
                .await?;
            let stored = self
                .read_value(key)
                .await?
                .ok_or_else(|| DepGraphError::MissingValue { key: key.to_string() })?;
            log::debug!("pull({key}): inputs unchanged, skipping computor");
            return Ok((stored, false));
        }

        let old_value = self.read_value(key).await?;
        let outcome = node
            .computor
            .compute(input_values, old_value.clone(), bindings)
            .await?;

        let mut ops = vec![
            BatchOp::Put {
                sublevel: Sublevel::Freshness,
                key: key.to_string(),
                value: Freshness::UpToDate.to_wire().to_vec(),
            },
            BatchOp::Put {
                sublevel: Sublevel::Inputs,
                key: key.to_string(),
                value: serde_json::to_vec(&input_keys)?,
            },
        ];
        self.diff_revdeps(&mut ops, key, &input_keys).await?;

        match outcome {
            ComputeOutcome::Unchanged => {
                self.store.batch(&self.schema_hash, ops).await?;
                log::debug!("pull({key}): computor asserted Unchanged");
                let stored =
                    old_value.ok_or_else(|| DepGraphError::MissingValue { key: key.to_string() })?;
                Ok((stored, false))
            }
            ComputeOutcome::Value(value) => {
                ops.push(BatchOp::Put {
                    sublevel: Sublevel::Values,
                    key: key.to_string(),
                    value: serde_json::to_vec(&value)?,
                });
                self.store.batch(&self.schema_hash, ops).await?;
                Ok((value, true))
            }
        }
    }

    /// Compute the revdep put/del ops needed to move from the previously
    /// recorded input set to `new_input_keys`.
    async fn diff_revdeps(
        &self,
        ops: &mut Vec<BatchOp>,
        key: &str,
        new_input_keys: &[String],
    ) -> Result<()> {
        let previous = self.read_inputs(key).await?;
        let new_set: HashSet<&str> = new_input_keys.iter().map(String::as_str).collect();
        for old_input in &previous {
            if !new_set.contains(old_input.as_str()) {
                ops.push(BatchOp::Del {
                    sublevel: Sublevel::RevDeps,
                    key: revdep_key(old_input, key),
                });
            }
        }
        for input_key in new_input_keys {
            ops.push(BatchOp::Put {
                sublevel: Sublevel::RevDeps,
                key: revdep_key(input_key, key),
                value: Vec::new(),
            });
        }
        Ok(())
    }

    /// Set a source node's value, atomically flipping every currently
    /// up-to-date descendant to `potentially-outdated`.
    ///
    /// Returns [`DepGraphError::InvalidSet`] if `key` matches a schema with
    /// declared inputs (only source schemas are settable).
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        let canonical = expr::canonicalize(key)?;
        let key_expr = expr::parse(&canonical)?;
        if !key_expr.is_concrete() {
            return Err(DepGraphError::NonConcreteNode { key: canonical });
        }
        let (node, _bindings) = self
            .find_match(&key_expr)
            .ok_or_else(|| DepGraphError::InvalidNode { key: canonical.clone() })?;
        if !node.is_source() {
            return Err(DepGraphError::InvalidSet { key: canonical });
        }

        let lock = self.lock_for(&canonical);
        let _guard = lock.lock().await;

        let dependents = self.collect_up_to_date_dependents(&canonical).await?;

        let mut ops = vec![
            BatchOp::Put {
                sublevel: Sublevel::Values,
                key: canonical.clone(),
                value: serde_json::to_vec(&value)?,
            },
            BatchOp::Put {
                sublevel: Sublevel::Freshness,
                key: canonical.clone(),
                value: Freshness::UpToDate.to_wire().to_vec(),
            },
        ];
        for dependent in &dependents {
            ops.push(BatchOp::Put {
                sublevel: Sublevel::Freshness,
                key: dependent.clone(),
                value: Freshness::PotentiallyOutdated.to_wire().to_vec(),
            });
        }

        log::info!(
            "set({canonical}): invalidating {} up-to-date dependent(s)",
            dependents.len()
        );
        self.store.batch(&self.schema_hash, ops).await
    }

    /// BFS over the reverse-dependency graph rooted at `root`, collecting
    /// every reachable node currently `up-to-date`. Traversal continues
    /// through nodes regardless of their own freshness — a node already
    /// `potentially-outdated` may still have up-to-date dependents reached
    /// via a different input path.
    async fn collect_up_to_date_dependents(&self, root: &str) -> Result<Vec<String>> {
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::new();
        visited.insert(root.to_string());
        queue.push_back(root.to_string());

        while let Some(current) = queue.pop_front() {
            for dependent in self.direct_dependents(&current).await? {
                if !visited.insert(dependent.clone()) {
                    continue;
                }
                if self.read_freshness(&dependent).await? == Freshness::UpToDate {
                    result.push(dependent.clone());
                }
                queue.push_back(dependent);
            }
        }
        Ok(result)
    }

    /// Freshness of a node, for debugging/introspection only.
    pub async fn debug_get_freshness(&self, key: &str) -> Result<Freshness> {
        let canonical = expr::canonicalize(key)?;
        self.read_freshness(&canonical).await
    }

    /// Every node key with a materialized value, for debugging/introspection only.
    pub async fn debug_list_materialized_nodes(&self) -> Result<Vec<String>> {
        self.store.keys(&self.schema_hash, Sublevel::Values).await
    }

    /// Summary counts of materialized node freshness.
    pub async fn stats(&self) -> Result<GraphStats> {
        let mut stats = GraphStats::default();
        for key in self.store.keys(&self.schema_hash, Sublevel::Freshness).await? {
            match self.read_freshness(&key).await? {
                Freshness::UpToDate => stats.up_to_date += 1,
                Freshness::PotentiallyOutdated => stats.potentially_outdated += 1,
                Freshness::Missing => {}
            }
        }
        Ok(stats)
    }
}
