//! Fragment Dependency Graph
//!
//! Declared once at startup, validated (unknown edges, duplicates, cycles) and
//! immutable afterwards. Edges point from a dependency to its dependent, so a
//! topological order lists dependencies first.

use std::collections::HashMap;

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type FragmentId = String;

/// Static declaration of one fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDecl {
    pub id: FragmentId,
    #[serde(default)]
    pub depends_on: Vec<FragmentId>,
    /// Default scheduling priority; higher loads first
    #[serde(default)]
    pub priority: u8,
    /// Top-level keys a loaded payload must contain
    #[serde(default)]
    pub required_keys: Vec<String>,
}

impl FragmentDecl {
    pub fn new(id: impl Into<FragmentId>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            priority: 0,
            required_keys: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FragmentId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// Validated, immutable fragment dependency graph
#[derive(Debug)]
pub struct DependencyGraph {
    /// Node weight = index into `decls`
    graph: DiGraph<usize, ()>,
    decls: Vec<FragmentDecl>,
    indices: HashMap<FragmentId, NodeIndex>,
    /// Position of each node in the topological order
    rank: Vec<usize>,
    order: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Build and validate the graph. Fails on duplicates, dangling edges and cycles.
    pub fn new(decls: Vec<FragmentDecl>) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(decls.len(), decls.len());
        let mut indices = HashMap::with_capacity(decls.len());

        for (pos, decl) in decls.iter().enumerate() {
            if indices.contains_key(&decl.id) {
                return Err(Error::DuplicateFragment(decl.id.clone()));
            }
            indices.insert(decl.id.clone(), graph.add_node(pos));
        }

        for decl in &decls {
            let to = indices[&decl.id];
            for dep in &decl.depends_on {
                let from = *indices.get(dep).ok_or_else(|| Error::UnknownDependency {
                    fragment: decl.id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.update_edge(from, to, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| Error::CycleDetected {
            cycle: Self::trace_cycle(&graph, &decls, cycle.node_id()),
        })?;

        let mut rank = vec![0; decls.len()];
        for (position, node) in order.iter().enumerate() {
            rank[node.index()] = position;
        }

        Ok(Self {
            graph,
            decls,
            indices,
            rank,
            order,
        })
    }

    /// Name the members of the cycle through `start`, closing the loop
    fn trace_cycle(graph: &DiGraph<usize, ()>, decls: &[FragmentDecl], start: NodeIndex) -> Vec<FragmentId> {
        let component = kosaraju_scc(graph)
            .into_iter()
            .find(|scc| scc.contains(&start))
            .unwrap_or_else(|| vec![start]);

        let name = |node: NodeIndex| decls[graph[node]].id.clone();
        let mut path = vec![name(start)];
        let mut current = start;
        loop {
            let next = graph
                .neighbors_directed(current, Direction::Outgoing)
                .filter(|n| component.contains(n))
                .min_by_key(|n| n.index());
            match next {
                Some(next) if next == start => {
                    path.push(name(start));
                    return path;
                }
                Some(next) if !path.contains(&name(next)) => {
                    path.push(name(next));
                    current = next;
                }
                Some(next) => {
                    path.push(name(next));
                    return path;
                }
                None => return path,
            }
        }
    }

    fn node(&self, id: &str) -> Result<NodeIndex> {
        self.indices
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownFragment(id.to_string()))
    }

    fn ids_in_order(&self, mut nodes: Vec<NodeIndex>) -> Vec<FragmentId> {
        nodes.sort_by_key(|n| self.rank[n.index()]);
        nodes.dedup();
        nodes
            .into_iter()
            .map(|n| self.decls[self.graph[n]].id.clone())
            .collect()
    }

    /// Transitive dependency closure of `id` (itself included), dependencies first
    pub fn resolve(&self, id: &str) -> Result<Vec<FragmentId>> {
        self.resolve_all([id])
    }

    /// Union of the closures of `ids`, dependencies first
    pub fn resolve_all<'a, I>(&self, ids: I) -> Result<Vec<FragmentId>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let reversed = Reversed(&self.graph);
        let mut nodes = Vec::new();
        for id in ids {
            let mut dfs = Dfs::new(reversed, self.node(id)?);
            while let Some(node) = dfs.next(reversed) {
                nodes.push(node);
            }
        }
        Ok(self.ids_in_order(nodes))
    }

    /// Fragments that transitively depend on `id` (itself excluded)
    pub fn dependents(&self, id: &str) -> Result<Vec<FragmentId>> {
        let start = self.node(id)?;
        let mut dfs = Dfs::new(&self.graph, start);
        let mut nodes = Vec::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                nodes.push(node);
            }
        }
        Ok(self.ids_in_order(nodes))
    }

    /// Direct dependents of `id`
    pub fn direct_dependents(&self, id: &str) -> Result<Vec<FragmentId>> {
        let node = self.node(id)?;
        Ok(self.ids_in_order(
            self.graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect(),
        ))
    }

    pub fn decl(&self, id: &str) -> Option<&FragmentDecl> {
        self.indices.get(id).map(|n| &self.decls[self.graph[*n]])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    /// Position in the topological order
    pub fn topo_rank(&self, id: &str) -> Option<usize> {
        self.indices.get(id).map(|n| self.rank[n.index()])
    }

    /// All fragment ids, dependencies first
    pub fn topo_order(&self) -> Vec<FragmentId> {
        self.order
            .iter()
            .map(|n| self.decls[self.graph[*n]].id.clone())
            .collect()
    }

    pub fn decls(&self) -> &[FragmentDecl] {
        &self.decls
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    pub(crate) fn curriculum() -> Vec<FragmentDecl> {
        vec![
            FragmentDecl::new("ucdm_comprehensive_index").with_priority(10),
            FragmentDecl::new("lesson_mapper")
                .depends_on(["ucdm_comprehensive_index"])
                .with_priority(8),
            FragmentDecl::new("lesson_date_mapper")
                .depends_on(["lesson_mapper"])
                .with_priority(8),
            FragmentDecl::new("concepts_index")
                .depends_on(["ucdm_comprehensive_index"])
                .with_priority(7),
            FragmentDecl::new("concept_to_lessons_index")
                .depends_on(["concepts_index"])
                .with_priority(7),
            FragmentDecl::new("365_lessons_indexed")
                .depends_on(["lesson_mapper"])
                .with_priority(5),
            FragmentDecl::new("365_lessons_advanced")
                .depends_on(["365_lessons_indexed"])
                .with_priority(3),
        ]
    }

    fn position(order: &[FragmentId], id: &str) -> usize {
        order.iter().position(|f| f == id).unwrap()
    }

    #[test]
    fn test_resolve_closure_in_dependency_order() {
        let graph = DependencyGraph::new(curriculum()).unwrap();
        let closure = graph.resolve("365_lessons_advanced").unwrap();

        assert_eq!(closure.len(), 4);
        assert_eq!(closure[0], "ucdm_comprehensive_index");
        assert!(position(&closure, "lesson_mapper") < position(&closure, "365_lessons_indexed"));
        assert_eq!(closure.last().unwrap(), "365_lessons_advanced");
        assert!(!closure.contains(&"concepts_index".to_string()));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let graph = DependencyGraph::new(curriculum()).unwrap();
        let first = graph.resolve("concept_to_lessons_index").unwrap();
        let second = graph.resolve("concept_to_lessons_index").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_all_unions_without_duplicates() {
        let graph = DependencyGraph::new(curriculum()).unwrap();
        let closure = graph
            .resolve_all(["lesson_date_mapper", "concept_to_lessons_index"])
            .unwrap();
        assert_eq!(closure.len(), 5);
        assert_eq!(closure[0], "ucdm_comprehensive_index");
    }

    #[test]
    fn test_dependents() {
        let graph = DependencyGraph::new(curriculum()).unwrap();
        let dependents = graph.dependents("lesson_mapper").unwrap();
        assert_eq!(dependents.len(), 3);
        assert!(dependents.contains(&"365_lessons_advanced".to_string()));
        assert!(graph.dependents("365_lessons_advanced").unwrap().is_empty());

        let direct = graph.direct_dependents("ucdm_comprehensive_index").unwrap();
        assert_eq!(direct.len(), 2);
    }

    #[test]
    fn test_cycle_fails_construction() {
        let decls = vec![
            FragmentDecl::new("a").depends_on(["c"]),
            FragmentDecl::new("b").depends_on(["a"]),
            FragmentDecl::new("c").depends_on(["b"]),
            FragmentDecl::new("d"),
        ];
        let err = DependencyGraph::new(decls).unwrap_err();
        assert_matches!(err, Error::CycleDetected { ref cycle } if cycle.len() == 4 && cycle.first() == cycle.last());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DependencyGraph::new(vec![FragmentDecl::new("a").depends_on(["a"])]).unwrap_err();
        assert_matches!(err, Error::CycleDetected { .. });
    }

    #[test]
    fn test_declaration_errors() {
        assert_matches!(
            DependencyGraph::new(vec![FragmentDecl::new("a"), FragmentDecl::new("a")]),
            Err(Error::DuplicateFragment(id)) if id == "a"
        );
        assert_matches!(
            DependencyGraph::new(vec![FragmentDecl::new("a").depends_on(["ghost"])]),
            Err(Error::UnknownDependency { dependency, .. }) if dependency == "ghost"
        );

        let graph = DependencyGraph::new(curriculum()).unwrap();
        assert_matches!(graph.resolve("ghost"), Err(Error::UnknownFragment(_)));
    }

    #[test]
    fn test_decls_from_yaml() {
        let yaml = r#"
- id: base
  priority: 9
  required_keys: [metadata]
- id: derived
  depends_on: [base]
"#;
        let decls: Vec<FragmentDecl> = serde_yaml::from_str(yaml).unwrap();
        let graph = DependencyGraph::new(decls).unwrap();
        assert_eq!(graph.topo_order(), vec!["base", "derived"]);
        assert_eq!(graph.decl("base").unwrap().required_keys, vec!["metadata"]);
        assert_eq!(graph.decl("derived").unwrap().priority, 0);
        assert!(graph.topo_rank("base").unwrap() < graph.topo_rank("derived").unwrap());
    }
}
