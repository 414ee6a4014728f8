//! Schema-set validation: pairwise overlap detection and pattern-level
//! acyclicity checking over the compiled schema set.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{DepGraphError, Result};
use crate::schema::{self, ArgKind, CompiledNode};

/// Validate a compiled schema set: no two output patterns may overlap, and
/// the pattern-level dependency graph (input pattern -> matching schemas)
/// must be acyclic.
pub fn validate_schemas(nodes: &[CompiledNode]) -> Result<()> {
    check_overlaps(nodes)?;
    check_acyclic(nodes)
}

/// A union-find over variable symbols, each optionally bound to a constant.
/// Arguments here are always flat (variable or literal, never a nested
/// term), so no occurs-check is needed: a symbol can never occur within its
/// own binding.
struct UnionFind {
    parent: HashMap<String, String>,
    value: HashMap<String, crate::expr::ConstValue>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: HashMap::new(),
            value: HashMap::new(),
        }
    }

    fn find(&mut self, sym: &str) -> String {
        if !self.parent.contains_key(sym) {
            self.parent.insert(sym.to_string(), sym.to_string());
            return sym.to_string();
        }
        let parent = self.parent[sym].clone();
        if parent == sym {
            return parent;
        }
        let root = self.find(&parent);
        self.parent.insert(sym.to_string(), root.clone());
        root
    }

    /// Bind a variable symbol to a constant, failing if it is already bound
    /// to a different constant.
    fn bind_const(&mut self, sym: &str, val: &crate::expr::ConstValue) -> bool {
        let root = self.find(sym);
        match self.value.get(&root) {
            Some(existing) => existing == val,
            None => {
                self.value.insert(root, val.clone());
                true
            }
        }
    }

    /// Unify two variable symbols, merging any bound constants and failing
    /// on conflict.
    fn union(&mut self, a: &str, b: &str) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return true;
        }
        let va = self.value.get(&ra).cloned();
        let vb = self.value.get(&rb).cloned();
        if let (Some(x), Some(y)) = (&va, &vb) {
            if x != y {
                return false;
            }
        }
        self.parent.insert(ra.clone(), rb.clone());
        if let Some(x) = va {
            self.value.insert(rb, x);
        }
        true
    }
}

/// Unify two (head, arg_kinds) pairs position by position, treating
/// variables on each side as occupying independent namespaces (prefixed
/// `L:`/`R:`) so identically-named variables from different patterns are
/// not conflated.
fn unify(head_a: &str, args_a: &[ArgKind], head_b: &str, args_b: &[ArgKind]) -> bool {
    if head_a != head_b || args_a.len() != args_b.len() {
        return false;
    }
    let mut uf = UnionFind::new();
    for (a, b) in args_a.iter().zip(args_b.iter()) {
        let ok = match (a, b) {
            (ArgKind::Const(ca), ArgKind::Const(cb)) => ca == cb,
            (ArgKind::Const(ca), ArgKind::Var(vb)) => uf.bind_const(&format!("R:{vb}"), ca),
            (ArgKind::Var(va), ArgKind::Const(cb)) => uf.bind_const(&format!("L:{va}"), cb),
            (ArgKind::Var(va), ArgKind::Var(vb)) => uf.union(&format!("L:{va}"), &format!("R:{vb}")),
        };
        if !ok {
            return false;
        }
    }
    true
}

/// True iff some concrete key could match both output patterns.
fn patterns_overlap(a: &CompiledNode, b: &CompiledNode) -> bool {
    unify(&a.head, &a.arg_kinds, &b.head, &b.arg_kinds)
}

fn check_overlaps(nodes: &[CompiledNode]) -> Result<()> {
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            if patterns_overlap(&nodes[i], &nodes[j]) {
                return Err(DepGraphError::SchemaOverlap {
                    patterns: (
                        nodes[i].canonical_output.clone(),
                        nodes[j].canonical_output.clone(),
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Build the pattern-level dependency graph: an edge `S -> T` exists when
/// some instantiation of one of `S`'s declared input patterns could match
/// `T`'s output pattern (including `S == T`, a self-cycle via
/// specialization).
fn build_dependency_graph(nodes: &[CompiledNode]) -> DiGraph<usize, ()> {
    let mut graph = DiGraph::<usize, ()>::new();
    let indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

    for (i, node) in nodes.iter().enumerate() {
        for pattern in &node.input_patterns {
            let pattern_kinds = schema::classify_args(pattern);
            for (j, target) in nodes.iter().enumerate() {
                if unify(&pattern.head, &pattern_kinds, &target.head, &target.arg_kinds) {
                    graph.add_edge(indices[i], indices[j], ());
                }
            }
        }
    }
    graph
}

fn check_acyclic(nodes: &[CompiledNode]) -> Result<()> {
    let graph = build_dependency_graph(nodes);
    if let Some(cycle) = find_cycle(&graph) {
        let cycle_outputs = cycle
            .iter()
            .map(|&idx| nodes[graph[idx]].canonical_output.clone())
            .collect();
        return Err(DepGraphError::SchemaCycle {
            cycle: cycle_outputs,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Classic three-color DFS cycle detection, returning the offending cycle
/// path (not merely the fact that one exists) so callers can report it.
fn find_cycle(graph: &DiGraph<usize, ()>) -> Option<Vec<NodeIndex>> {
    let mut color = vec![Color::White; graph.node_count()];
    let mut path = Vec::new();

    fn visit(
        node: NodeIndex,
        graph: &DiGraph<usize, ()>,
        color: &mut [Color],
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        color[node.index()] = Color::Gray;
        path.push(node);
        for neighbor in graph.neighbors(node) {
            match color[neighbor.index()] {
                Color::White => {
                    if let Some(cycle) = visit(neighbor, graph, color, path) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    let start = path.iter().position(|&n| n == neighbor).unwrap();
                    return Some(path[start..].to_vec());
                }
                Color::Black => {}
            }
        }
        path.pop();
        color[node.index()] = Color::Black;
        None
    }

    for idx in graph.node_indices() {
        if color[idx.index()] == Color::White {
            if let Some(cycle) = visit(idx, graph, &mut color, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
