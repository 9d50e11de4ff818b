//! The phylogenetic tree backing the `MostRecentCommonAncestor`,
//! `PhyloSubtree`, and `PhyloParents` actions (grounded in
//! `examples/original_source/src/silo/common/phylo_tree.h`/`.cpp`).
//!
//! Built once, ahead of query time, via [`PhyloTreeBuilder`] rather than by
//! parsing a Newick or Auspice JSON file directly - that parsing step stays
//! out of scope (see DESIGN.md).

use rustc_hash::FxHashMap;
use std::collections::HashSet;

use crate::error::SiloError;

/// A single rooted tree over string node ids. Parent pointers plus a
/// children adjacency list, so both upward (ancestor) and downward
/// (subtree) traversals are cheap.
#[derive(Debug, Clone)]
pub struct PhyloTree {
    node_ids: Vec<String>,
    id_to_index: FxHashMap<String, usize>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    depth: Vec<u32>,
    root: usize,
}

impl PhyloTree {
    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_to_index.contains_key(id)
    }

    pub fn root_id(&self) -> &str {
        &self.node_ids[self.root]
    }

    pub fn parent_of(&self, id: &str) -> Result<Option<&str>, SiloError> {
        let index = self.index_of(id)?;
        Ok(self.parent[index].map(|p| self.node_ids[p].as_str()))
    }

    /// The chain from `id` up to (and including) the root, closest ancestor
    /// first.
    pub fn parents_chain(&self, id: &str) -> Result<Vec<String>, SiloError> {
        let mut index = self.index_of(id)?;
        let mut chain = Vec::new();
        while let Some(parent) = self.parent[index] {
            chain.push(self.node_ids[parent].clone());
            index = parent;
        }
        Ok(chain)
    }

    /// Every node id in the subtree rooted at `id`, inclusive, in
    /// depth-first pre-order.
    pub fn subtree_node_ids(&self, id: &str) -> Result<Vec<String>, SiloError> {
        let root = self.index_of(id)?;
        let mut result = Vec::new();
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            result.push(self.node_ids[index].clone());
            stack.extend(self.children[index].iter().rev());
        }
        Ok(result)
    }

    /// The deepest node that is an ancestor (inclusive) of every id in
    /// `ids`. `None` only when `ids` is empty.
    pub fn most_recent_common_ancestor(
        &self,
        ids: &[&str],
    ) -> Result<Option<String>, SiloError> {
        let mut common: Option<HashSet<usize>> = None;
        for id in ids {
            let mut ancestors = HashSet::new();
            let mut cursor = Some(self.index_of(id)?);
            while let Some(index) = cursor {
                ancestors.insert(index);
                cursor = self.parent[index];
            }
            common = Some(match common {
                None => ancestors,
                Some(previous) => previous.intersection(&ancestors).copied().collect(),
            });
        }
        let common = common.unwrap_or_default();
        Ok(common
            .into_iter()
            .max_by_key(|&index| self.depth[index])
            .map(|index| self.node_ids[index].clone()))
    }

    /// Number of direct children `id` has in the tree. Used by actions that
    /// contract unary (single-child) nodes out of a printed ancestor chain.
    pub fn child_count(&self, id: &str) -> Result<usize, SiloError> {
        let index = self.index_of(id)?;
        Ok(self.children[index].len())
    }

    fn index_of(&self, id: &str) -> Result<usize, SiloError> {
        self.id_to_index
            .get(id)
            .copied()
            .ok_or_else(|| SiloError::bad_request(format!("unknown phylogenetic tree node '{id}'")))
    }
}

/// Accumulates `(node, parent)` edges before validating and freezing them
/// into a [`PhyloTree`].
#[derive(Debug, Default)]
pub struct PhyloTreeBuilder {
    edges: Vec<(String, Option<String>)>,
}

impl PhyloTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>, parent_id: Option<String>) -> &mut Self {
        self.edges.push((id.into(), parent_id));
        self
    }

    /// Validates that every node id is unique, every referenced parent was
    /// also added, there is exactly one root, and the edges form no cycle.
    pub fn build(self) -> Result<PhyloTree, SiloError> {
        if self.edges.is_empty() {
            return Err(SiloError::preprocessing("phylogenetic tree has no nodes"));
        }

        let mut id_to_index = FxHashMap::default();
        let mut node_ids = Vec::with_capacity(self.edges.len());
        for (id, _) in &self.edges {
            if id_to_index.insert(id.clone(), node_ids.len()).is_some() {
                return Err(SiloError::preprocessing(format!(
                    "duplicate phylogenetic tree node id '{id}'"
                )));
            }
            node_ids.push(id.clone());
        }

        let mut parent = vec![None; node_ids.len()];
        let mut children = vec![Vec::new(); node_ids.len()];
        let mut roots = Vec::new();
        for (index, (_, parent_id)) in self.edges.iter().enumerate() {
            match parent_id {
                None => roots.push(index),
                Some(parent_id) => {
                    let parent_index = *id_to_index.get(parent_id).ok_or_else(|| {
                        SiloError::preprocessing(format!(
                            "phylogenetic tree node '{}' references unknown parent '{parent_id}'",
                            node_ids[index]
                        ))
                    })?;
                    parent[index] = Some(parent_index);
                    children[parent_index].push(index);
                }
            }
        }

        if roots.len() != 1 {
            return Err(SiloError::preprocessing(format!(
                "phylogenetic tree must have exactly one root, found {}",
                roots.len()
            )));
        }
        let root = roots[0];

        let mut depth = vec![u32::MAX; node_ids.len()];
        depth[root] = 0;
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(root);
        let mut visited = 1usize;
        while let Some(index) = queue.pop_front() {
            for &child in &children[index] {
                depth[child] = depth[index] + 1;
                visited += 1;
                queue.push_back(child);
            }
        }
        if visited != node_ids.len() {
            return Err(SiloError::preprocessing(
                "phylogenetic tree is not fully connected to its root (cycle or orphaned subtree)",
            ));
        }

        Ok(PhyloTree {
            node_ids,
            id_to_index,
            parent,
            children,
            depth,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> PhyloTree {
        // root
        //  +- a
        //  |   +- a1
        //  |   +- a2
        //  +- b
        let mut builder = PhyloTreeBuilder::new();
        builder
            .add_node("root", None)
            .add_node("a", Some("root".to_string()))
            .add_node("b", Some("root".to_string()))
            .add_node("a1", Some("a".to_string()))
            .add_node("a2", Some("a".to_string()));
        builder.build().unwrap()
    }

    #[test]
    fn parents_chain_walks_to_the_root() {
        let tree = sample_tree();
        assert_eq!(tree.parents_chain("a1").unwrap(), vec!["a", "root"]);
        assert_eq!(tree.parents_chain("root").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn subtree_is_inclusive_and_depth_first() {
        let tree = sample_tree();
        let subtree = tree.subtree_node_ids("a").unwrap();
        assert_eq!(subtree, vec!["a", "a1", "a2"]);
    }

    #[test]
    fn mrca_of_siblings_is_their_parent() {
        let tree = sample_tree();
        let mrca = tree.most_recent_common_ancestor(&["a1", "a2"]).unwrap();
        assert_eq!(mrca.as_deref(), Some("a"));
    }

    #[test]
    fn mrca_across_subtrees_is_the_root() {
        let tree = sample_tree();
        let mrca = tree.most_recent_common_ancestor(&["a1", "b"]).unwrap();
        assert_eq!(mrca.as_deref(), Some("root"));
    }

    #[test]
    fn build_rejects_multiple_roots() {
        let mut builder = PhyloTreeBuilder::new();
        builder.add_node("a", None).add_node("b", None);
        assert!(builder.build().is_err());
    }

    #[test]
    fn build_rejects_unknown_parent_reference() {
        let mut builder = PhyloTreeBuilder::new();
        builder.add_node("a", Some("missing".to_string()));
        assert!(builder.build().is_err());
    }
}
