use anyhow::*;
use identity_hash::{IntMap, IntSet};
use newick::{Newick, NewickTree};
use smallvec::SmallVec;
use std::path::Path;

use crate::dede::VecMatrix;

pub type NodeID = usize;

/// Leaf prefix added by MAFFT to reverse-complemented sequences
const REVERSED_PREFIX: &str = "_R_";
const DEFAULT_SUPPORT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    /// Length of the branch leading to this node
    pub dist: f64,
    /// Support of the branch leading to this node
    pub support: f64,
    parent: Option<NodeID>,
    children: SmallVec<[NodeID; 2]>,
}
impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[NodeID] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeID> {
        self.parent
    }
}

/// An arena-backed rooted phylogeny, whose topology can be freely rearranged.
#[derive(Debug, Clone)]
pub struct PhyloTree {
    nodes: IntMap<NodeID, Node>,
    root: NodeID,
    next_id: NodeID,
}

impl std::ops::Index<NodeID> for PhyloTree {
    type Output = Node;
    fn index(&self, i: NodeID) -> &Self::Output {
        &self.nodes[&i]
    }
}
impl std::ops::IndexMut<NodeID> for PhyloTree {
    fn index_mut(&mut self, i: NodeID) -> &mut Self::Output {
        self.nodes.get_mut(&i).unwrap()
    }
}

impl PhyloTree {
    pub fn new() -> PhyloTree {
        let mut t = PhyloTree { nodes: IntMap::default(), root: 0, next_id: 0 };
        t.root = t.add_node(None, "", 0., DEFAULT_SUPPORT);
        t
    }

    pub fn from_file<P: AsRef<Path>>(filename: P) -> Result<PhyloTree> {
        let filename = filename.as_ref();
        let t = newick::one_from_filename(filename.to_string_lossy())
            .with_context(|| anyhow!("while parsing {}", filename.display()))?;
        Ok(PhyloTree::from_newick(&t))
    }

    pub fn from_string(s: &str) -> Result<PhyloTree> {
        let trees = newick::from_string(s).with_context(|| "while parsing a Newick string")?;
        let t = trees.first().ok_or_else(|| anyhow!("no tree found in Newick string"))?;
        Ok(PhyloTree::from_newick(t))
    }

    /// Imports a parsed Newick tree. Internal labels are read as branch supports.
    pub fn from_newick(src: &NewickTree) -> PhyloTree {
        fn label(src: &NewickTree, n: newick::NodeID) -> (String, f64) {
            let name = src.name(n).cloned().unwrap_or_default();
            if src[n].is_leaf() {
                let name = name.strip_prefix(REVERSED_PREFIX).map(str::to_owned).unwrap_or(name);
                (name, DEFAULT_SUPPORT)
            } else {
                match name.parse::<f64>() {
                    std::result::Result::Ok(support) => (String::new(), support),
                    Err(_) => (name, DEFAULT_SUPPORT),
                }
            }
        }

        fn rec_insert(src: &NewickTree, n: newick::NodeID, t: &mut PhyloTree, me: NodeID) {
            for &c in src[n].children().iter() {
                let (name, support) = label(src, c);
                let dist = src[c].branch().map(|b| b.to_owned() as f64).unwrap_or(0.);
                let c_id = t.add_node(Some(me), &name, dist, support);
                rec_insert(src, c, t, c_id);
            }
        }

        let mut t = PhyloTree::new();
        let root = t.root;
        let (name, support) = label(src, src.root());
        t[root].name = name;
        t[root].support = support;
        t[root].dist = src[src.root()].branch().map(|b| b.to_owned() as f64).unwrap_or(0.);
        rec_insert(src, src.root(), &mut t, root);
        t
    }

    pub fn add_node(&mut self, parent: Option<NodeID>, name: &str, dist: f64, support: f64) -> NodeID {
        let id = self.next_id;
        self.next_id += 1;
        assert!(parent.is_none() || self.nodes.contains_key(&parent.unwrap()));
        self.nodes.insert(
            id,
            Node { name: name.to_owned(), dist, support, parent, children: SmallVec::new() },
        );
        if let Some(parent) = parent {
            self.nodes.get_mut(&parent).unwrap().children.push(id);
        }
        id
    }

    pub fn root(&self) -> NodeID {
        self.root
    }

    pub fn set_root(&mut self, n: NodeID) {
        assert!(self.nodes[&n].parent.is_none());
        self.root = n;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeID> {
        self.nodes.keys()
    }

    pub fn plug(&mut self, target: NodeID, n: NodeID) {
        assert!(self.nodes[&n].parent.is_none());
        assert!(!self.nodes[&target].children.contains(&n));
        self.nodes.get_mut(&n).unwrap().parent = Some(target);
        self.nodes.get_mut(&target).unwrap().children.push(n)
    }

    pub fn unplug(&mut self, n: NodeID) {
        let parent = self.nodes[&n].parent;
        self.nodes.get_mut(&n).unwrap().parent = None;
        if let Some(parent) = parent {
            self.nodes.get_mut(&parent).unwrap().children.retain(|nn| *nn != n);
        }
    }

    pub fn move_node(&mut self, n: NodeID, dest: NodeID) {
        self.unplug(n);
        self.plug(dest, n);
    }

    pub fn delete_node(&mut self, n: NodeID) {
        assert!(self.nodes.contains_key(&n));
        self.unplug(n);
        self.nodes.remove(&n);
    }

    /// Creates a new detached node whose children are `l` and `r`.
    pub fn join(&mut self, l: (NodeID, f64, f64), r: (NodeID, f64, f64), dist: f64) -> NodeID {
        let me = self.add_node(None, "", dist, DEFAULT_SUPPORT);
        for (c, c_dist, c_support) in [l, r] {
            self.unplug(c);
            self.plug(me, c);
            self[c].dist = c_dist;
            self[c].support = c_support;
        }
        me
    }

    /// Drops every node that cannot be reached from the root.
    pub fn retain_reachable(&mut self) {
        let keep = self.preorder(self.root).into_iter().collect::<IntSet<_>>();
        self.nodes.retain(|k, _| keep.contains(k));
    }

    fn rec_preorder(&self, i: NodeID, ax: &mut Vec<NodeID>) {
        ax.push(i);
        for &j in &self.nodes[&i].children {
            self.rec_preorder(j, ax)
        }
    }

    /// `n` and all of its descendants, in depth-first pre-order.
    pub fn preorder(&self, n: NodeID) -> Vec<NodeID> {
        let mut r = Vec::with_capacity(self.nodes.len());
        self.rec_preorder(n, &mut r);
        r
    }

    pub fn descendants(&self, n: NodeID) -> Vec<NodeID> {
        let mut r = self.preorder(n);
        r.remove(0);
        r
    }

    pub fn leaves_of(&self, n: NodeID) -> Vec<NodeID> {
        self.preorder(n).into_iter().filter(|&k| self[k].is_leaf()).collect()
    }

    pub fn leaves(&self) -> Vec<NodeID> {
        self.leaves_of(self.root)
    }

    pub fn find_leaf(&self, name: &str) -> Option<NodeID> {
        self.leaves().into_iter().find(|&l| self[l].name == name)
    }

    /// `n` and its ancestors, up to the root.
    pub fn ancestors(&self, n: NodeID) -> Vec<NodeID> {
        let mut r = vec![n];
        let mut me = n;
        while let Some(parent) = self[me].parent {
            r.push(parent);
            me = parent;
        }
        r
    }

    pub fn mrca(&self, ns: &[NodeID]) -> Option<NodeID> {
        let (first, others) = ns.split_first()?;
        let lineages = others
            .iter()
            .map(|&n| self.ancestors(n).into_iter().collect::<IntSet<_>>())
            .collect::<Vec<_>>();
        self.ancestors(*first).into_iter().find(|a| lineages.iter().all(|l| l.contains(a)))
    }

    /// Distance from the root to `n`.
    pub fn depth(&self, n: NodeID) -> f64 {
        self.ancestors(n).into_iter().filter(|&a| a != self.root).map(|a| self[a].dist).sum()
    }

    /// Longest distance from `n` to one of its leaves.
    pub fn max_leaf_distance(&self, n: NodeID) -> f64 {
        self[n]
            .children
            .iter()
            .map(|&c| self[c].dist + self.max_leaf_distance(c))
            .fold(0., f64::max)
    }

    /// Patristic distances from `from` to every node of the tree.
    pub fn distances_from(&self, from: NodeID) -> IntMap<NodeID, f64> {
        let mut r = IntMap::default();
        let mut todo = vec![(from, 0f64)];
        r.insert(from, 0.);
        while let Some((n, d)) = todo.pop() {
            let neighbours = self[n]
                .children
                .iter()
                .map(|&c| (c, self[c].dist))
                .chain(self[n].parent.map(|p| (p, self[n].dist)));
            for (m, dm) in neighbours {
                if !r.contains_key(&m) {
                    r.insert(m, d + dm);
                    todo.push((m, d + dm));
                }
            }
        }
        r
    }

    /// Pairwise patristic distances between the given nodes.
    pub fn patristic_matrix(&self, ns: &[NodeID]) -> VecMatrix<f64> {
        let mut m = VecMatrix::with_elem(ns.len(), ns.len(), 0.);
        for (i, &a) in ns.iter().enumerate() {
            let ds = self.distances_from(a);
            for (j, b) in ns.iter().enumerate() {
                m[(i, j)] = ds[b];
            }
        }
        m
    }

    /// Turns every multifurcation into a ladder of binary nodes joined by
    /// zero-length branches.
    pub fn resolve_polytomy(&mut self) {
        for n in self.preorder(self.root) {
            let mut current = n;
            while self[current].children.len() > 2 {
                let rest = self[current].children[1..].to_vec();
                let next = self.add_node(Some(current), "", 0., 0.);
                for c in rest {
                    self.move_node(c, next);
                }
                current = next;
            }
        }
    }

    /// Sorts children by their leaf count, largest first if `descending`;
    /// siblings of equal size keep their order.
    pub fn ladderize(&mut self, descending: bool) {
        fn rec_sizes(t: &PhyloTree, n: NodeID, sizes: &mut IntMap<NodeID, usize>) -> usize {
            let size = if t[n].is_leaf() {
                1
            } else {
                t[n].children.iter().map(|&c| rec_sizes(t, c, sizes)).sum()
            };
            sizes.insert(n, size);
            size
        }

        let mut sizes = IntMap::default();
        rec_sizes(self, self.root, &mut sizes);
        for n in self.preorder(self.root) {
            let children = &mut self.nodes.get_mut(&n).unwrap().children;
            if descending {
                children.sort_by_key(|c| std::cmp::Reverse(sizes[c]));
            } else {
                children.sort_by_key(|c| sizes[c]);
            }
        }
    }

    /// Roots the tree on the branch leading to `outgroup`, splitting it in half.
    pub fn reroot_on(&mut self, outgroup: NodeID) {
        if outgroup == self.root {
            return;
        }
        let path = self.ancestors(outgroup)[1..].to_vec();
        let old_edges = path.iter().map(|&a| (self[a].dist, self[a].support)).collect::<Vec<_>>();
        let (half, support) = (self[outgroup].dist / 2., self[outgroup].support);

        self.unplug(outgroup);
        for &a in &path {
            self.unplug(a);
        }

        let new_root = self.add_node(None, "", 0., DEFAULT_SUPPORT);
        self.plug(new_root, outgroup);
        self[outgroup].dist = half;
        self.plug(new_root, path[0]);
        self[path[0]].dist = half;
        self[path[0]].support = support;
        for (i, w) in path.windows(2).enumerate() {
            self.plug(w[0], w[1]);
            self[w[1]].dist = old_edges[i].0;
            self[w[1]].support = old_edges[i].1;
        }

        // The former root may now be a mere relay
        let old_root = *path.last().unwrap();
        match self[old_root].children.len() {
            0 if self[old_root].name.is_empty() => self.delete_node(old_root),
            1 if old_root != path[0] || self[old_root].parent.is_some() => {
                let child = self[old_root].children[0];
                let parent = self[old_root].parent.unwrap();
                let dist = self[old_root].dist;
                let support = self[old_root].support;
                self.move_node(child, parent);
                self[child].dist += dist;
                self[child].support = support;
                self.delete_node(old_root);
            }
            _ => {}
        }
        self.root = new_root;
    }

    fn format_newick(&self, i: NodeID, r: &mut String) {
        let node = &self[i];
        if !node.is_leaf() {
            r.push('(');
            for (k, &c) in node.children.iter().enumerate() {
                if k > 0 {
                    r.push(',');
                }
                self.format_newick(c, r);
            }
            r.push(')');
            if node.name.is_empty() {
                r.push_str(&format!("{}", node.support));
            } else {
                r.push_str(&node.name);
            }
        } else {
            r.push_str(&node.name);
        }
        if i != self.root {
            r.push_str(&format!(":{}", node.dist));
        }
    }

    pub fn to_newick(&self) -> String {
        let mut r = String::new();
        self.format_newick(self.root, &mut r);
        r.push(';');
        r
    }
}

impl Default for PhyloTree {
    fn default() -> Self {
        PhyloTree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(t: &PhyloTree, ns: &[NodeID]) -> Vec<String> {
        ns.iter().map(|&n| t[n].name.clone()).collect()
    }

    #[test]
    fn parse_supports_and_lengths() {
        let t = PhyloTree::from_string("((A:0.1,_R_B:0.2)95:0.3,C:0.4);").unwrap();
        let leaves = t.leaves();
        assert_eq!(names(&t, &leaves), vec!["A", "B", "C"]);
        let ab = t.mrca(&leaves[..2]).unwrap();
        assert_eq!(t[ab].support, 95.);
        assert!((t[ab].dist - 0.3).abs() < 1e-6);
        assert!((t.depth(leaves[1]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mrca_and_distances() {
        let t = PhyloTree::from_string("((A:1,B:2):1,(C:1,D:1):1);").unwrap();
        let a = t.find_leaf("A").unwrap();
        let b = t.find_leaf("B").unwrap();
        let c = t.find_leaf("C").unwrap();
        assert_eq!(t.mrca(&[a, c]), Some(t.root()));
        assert_eq!(t.leaves_of(t.mrca(&[a, b]).unwrap()).len(), 2);
        let m = t.patristic_matrix(&[a, b, c]);
        assert!((m[(0, 1)] - 3.).abs() < 1e-9);
        assert!((m[(0, 2)] - 4.).abs() < 1e-9);
        assert!((m[(2, 0)] - 4.).abs() < 1e-9);
    }

    #[test]
    fn resolve_polytomy_makes_binary() {
        let mut t = PhyloTree::from_string("(A:1,B:1,C:1,D:1);").unwrap();
        t.resolve_polytomy();
        assert!(t.nodes().all(|&n| t[n].children().len() <= 2));
        assert_eq!(t.leaves().len(), 4);
        let a = t.find_leaf("A").unwrap();
        let d = t.find_leaf("D").unwrap();
        let ds = t.distances_from(a);
        assert!((ds[&d] - 2.).abs() < 1e-9);
    }

    #[test]
    fn reroot_preserves_distances() {
        let mut t = PhyloTree::from_string("((A:1,B:2):1,(C:1,O:3):1);").unwrap();
        let before = {
            let l = t.leaves();
            let ms = names(&t, &l);
            let m = t.patristic_matrix(&l);
            (ms, m)
        };
        let o = t.find_leaf("O").unwrap();
        t.reroot_on(o);
        assert!(t[t.root()].children().contains(&o));
        assert!((t[o].dist - 1.5).abs() < 1e-9);
        assert!(t.nodes().all(|&n| t[n].children().len() <= 2));
        for (i, a) in before.0.iter().enumerate() {
            for (j, b) in before.0.iter().enumerate() {
                let na = t.find_leaf(a).unwrap();
                let nb = t.find_leaf(b).unwrap();
                assert!((t.distances_from(na)[&nb] - before.1[(i, j)]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn ladderize_puts_larger_clades_first() {
        let mut t = PhyloTree::from_string("(A:1,(B:1,(C:1,D:1):1):1);").unwrap();
        t.ladderize(true);
        assert_eq!(names(&t, &t.leaves()), vec!["C", "D", "B", "A"]);
        t.ladderize(false);
        assert_eq!(names(&t, &t.leaves()), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn ladderize_keeps_equal_siblings_in_place() {
        let mut t = PhyloTree::from_string("((A:1,B:1):1,(C:1,D:1):1);").unwrap();
        t.ladderize(true);
        assert_eq!(names(&t, &t.leaves()), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn join_and_cleanup() {
        let mut t = PhyloTree::from_string("((A:1,B:1):1,C:1);").unwrap();
        let a = t.find_leaf("A").unwrap();
        let c = t.find_leaf("C").unwrap();
        let ac = t.join((a, 0.5, 1.), (c, 0.5, 1.), 0.);
        let b = t.find_leaf("B").unwrap();
        let root = t.join((ac, 0., 1.), (b, 2., 1.), 0.);
        t.set_root(root);
        t.retain_reachable();
        assert_eq!(t.len(), 5);
        assert_eq!(t.to_newick(), "((A:0.5,C:0.5)1:0,B:2)1;");
    }
}
