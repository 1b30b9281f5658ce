use anyhow::*;
use bio::io::fasta;
use log::*;
use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::dataset::Datatype;
use crate::delimit::{CollapseDict, Taxon};
use crate::errors::{DataError, FileError, TreeError};
use crate::tree::{NodeID, PhyloTree};

/// Branches at most this long are considered null until an alignment says otherwise
pub const DEFAULT_ZERO: f64 = 1.00000050002909e-6;
pub const CONCATENATED: &str = "concatenated";
const ZERO_MARGIN: f64 = 1e-13;

#[derive(Debug, Clone)]
pub struct LeafMeta {
    pub original_id: String,
    pub datatype: Datatype,
    pub genus: String,
    /// Species label of the sample for the gene of the tree
    pub species: String,
    pub ori_species: String,
}

/// Everything a worker needs to interpret a single (group, gene) tree.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub group: String,
    pub gene: String,
    pub tree_file: PathBuf,
    pub alignment_file: PathBuf,
    pub hash_image: PathBuf,
    pub image: PathBuf,
    pub collapsed_image: PathBuf,
    pub newick_out: PathBuf,
    pub query: Vec<String>,
    pub outgroup: Vec<String>,
    pub db: Vec<String>,
    pub leaves: HashMap<String, LeafMeta>,
}

#[derive(Clone)]
pub struct TreeInfo {
    pub tree: PhyloTree,
    pub group: String,
    pub gene: String,
    pub source: String,
    pub query: HashSet<String>,
    pub outgroup: HashSet<String>,
    pub db: HashSet<String>,
    pub meta: HashMap<String, LeafMeta>,
    pub zero: f64,
    pub outgroup_leaves: Vec<String>,
    pub collapse_dict: CollapseDict,
    /// genus -> `sp. N` numbers already used by the database
    pub reserved_sp: HashMap<String, HashSet<u32>>,
    /// genus -> next placeholder number
    pub sp_counters: HashMap<String, u32>,
    /// genus -> numbering span, set once the tree has been synchronized for this genus
    pub sync_stamps: BTreeMap<String, u32>,
}

impl TreeInfo {
    pub fn new(tree: PhyloTree, task: &TaskInput) -> TreeInfo {
        TreeInfo {
            tree,
            group: task.group.clone(),
            gene: task.gene.clone(),
            source: task.tree_file.display().to_string(),
            query: task.query.iter().cloned().collect(),
            outgroup: task.outgroup.iter().cloned().collect(),
            db: task.db.iter().cloned().collect(),
            meta: task.leaves.clone(),
            zero: DEFAULT_ZERO,
            outgroup_leaves: Vec::new(),
            collapse_dict: CollapseDict::new(),
            reserved_sp: HashMap::new(),
            sp_counters: HashMap::new(),
            sync_stamps: BTreeMap::new(),
        }
    }

    pub fn load(task: &TaskInput) -> Result<TreeInfo> {
        if !task.tree_file.is_file() {
            bail!(FileError::NotFound(task.tree_file.display().to_string()));
        }
        let mut tree = PhyloTree::from_file(&task.tree_file)?;
        rescale_supports(&mut tree);
        Ok(TreeInfo::new(tree, task))
    }

    pub fn decide_type(&self, hash: &str) -> Option<Datatype> {
        if self.query.contains(hash) {
            Some(Datatype::Query)
        } else if self.db.contains(hash) {
            Some(Datatype::Db)
        } else if self.outgroup.contains(hash) {
            Some(Datatype::Outgroup)
        } else {
            None
        }
    }

    pub fn is_reference(&self, hash: &str) -> bool {
        matches!(self.decide_type(hash), Some(Datatype::Db) | Some(Datatype::Outgroup))
    }

    pub fn taxon_of(&self, hash: &str) -> Option<Taxon> {
        self.meta.get(hash).map(|m| Taxon::new(&m.genus, &m.species))
    }

    pub fn leaf_names(&self, n: NodeID) -> Vec<&str> {
        self.tree.leaves_of(n).into_iter().map(|l| self.tree[l].name.as_str()).collect()
    }

    /// Derives the null branch length from the pairs of sequences that the
    /// alignment cannot tell apart.
    pub fn calculate_zero<P: AsRef<Path>>(&mut self, alignment_file: P) -> Result<f64> {
        let alignment_file = alignment_file.as_ref();
        let reader = fasta::Reader::from_file(alignment_file).map_err(|_| {
            FileError::NotFound(alignment_file.display().to_string())
        })?;
        let mut records = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("while parsing {}", alignment_file.display()))?;
            let ungapped = String::from_utf8_lossy(record.seq()).replace('-', "");
            records.push((record.id().to_owned(), ungapped));
        }

        let leaves = self.tree.leaves();
        let mut in_tree = leaves.iter().map(|&l| self.tree[l].name.clone()).collect::<Vec<_>>();
        let mut in_alignment = records.iter().map(|r| r.0.clone()).collect::<Vec<_>>();
        in_tree.sort();
        in_alignment.sort();
        if in_tree != in_alignment {
            bail!(DataError::AlignmentMismatch { tree: self.source.clone() });
        }

        let by_name = leaves.iter().map(|&l| (self.tree[l].name.as_str(), l)).collect::<HashMap<_, _>>();
        let nodes = records.iter().map(|r| by_name[r.0.as_str()]).collect::<Vec<_>>();
        let distances = self.tree.patristic_matrix(&nodes);
        trace!("{}: {} leaves, distances:{:?}", self.source, distances.nrows(), distances);

        let mut identical = Vec::new();
        let mut distinct = Vec::new();
        for (i, j, &d) in distances.upper_triangle() {
            let (a, b) = (&records[i].1, &records[j].1);
            if a.contains(b.as_str()) || b.contains(a.as_str()) {
                identical.push(OrderedFloat(d));
            } else {
                distinct.push(OrderedFloat(d));
            }
        }

        match (identical.iter().max(), distinct.iter().min()) {
            (Some(max_identical), Some(min_distinct)) => {
                self.zero = if max_identical < min_distinct {
                    max_identical.0
                } else {
                    min_distinct.0 - ZERO_MARGIN
                };
            }
            (Some(max_identical), None) => self.zero = max_identical.0,
            _ => {}
        }
        debug!("{}: zero set to {:e}", self.source, self.zero);
        Ok(self.zero)
    }

    /// Roots the tree on the smallest clade containing every outgroup leaf.
    pub fn reroot_outgroup(&mut self) -> Result<()> {
        self.tree.resolve_polytomy();
        let leaves = self
            .tree
            .leaves()
            .into_iter()
            .filter(|&l| self.outgroup.contains(&self.tree[l].name))
            .collect::<Vec<_>>();
        self.outgroup_leaves = leaves.iter().map(|&l| self.tree[l].name.clone()).collect();

        let target = match leaves.len() {
            0 => bail!(DataError::NoOutgroup { tree: self.source.clone() }),
            1 => leaves[0],
            _ => {
                let mut mrca = self.tree.mrca(&leaves).unwrap_or(self.tree.root());
                if mrca == self.tree.root() {
                    // The outgroup straddles the root: move the root elsewhere first
                    let other = self
                        .tree
                        .leaves()
                        .into_iter()
                        .find(|l| !leaves.contains(l))
                        .ok_or_else(|| DataError::UnrootableOutgroup { tree: self.source.clone() })?;
                    self.tree.reroot_on(other);
                    mrca = self.tree.mrca(&leaves).unwrap_or(self.tree.root());
                    if mrca == self.tree.root() {
                        bail!(DataError::UnrootableOutgroup { tree: self.source.clone() });
                    }
                }
                mrca
            }
        };
        if self.tree.leaves_of(target).len() != leaves.len() {
            warn!("outgroup of {} does not seem to be monophyletic", self.source);
        }

        self.tree.reroot_on(target);
        self.tree.ladderize(true);
        Ok(())
    }

    /// Remembers the `sp. N` numbers carried by the samples, so that new
    /// placeholders do not collide with them.
    pub fn reserve_sp(&mut self) {
        for l in self.tree.leaves() {
            if let Some(m) = self.meta.get(&self.tree[l].name) {
                let mut words = m.ori_species.split_whitespace();
                if matches!(words.next(), Some("sp") | Some("sp.")) {
                    if let Some(n) = words.next().and_then(|w| w.parse::<u32>().ok()) {
                        self.reserved_sp.entry(m.genus.clone()).or_default().insert(n);
                    }
                }
            }
        }
        for (genus, numbers) in self.reserved_sp.iter() {
            debug!("{}: {} reserves {:?}", self.source, genus, numbers);
        }
    }

    /// Rebuilds the tree so that same-taxon components hanging off null
    /// branches end up as sisters.
    pub fn reconstruct(&mut self) -> Result<()> {
        let mut out = PhyloTree::new();
        let root = self.rebuild(self.tree.root(), &mut out)?;
        out[root].dist = 0.;
        out.set_root(root);
        out.retain_reachable();
        debug!("{}: reconstructed, {} -> {} nodes", self.source, self.tree.len(), out.len());
        self.tree = out;
        Ok(())
    }

    fn copy_into(&self, n: NodeID, out: &mut PhyloTree) -> NodeID {
        let node = &self.tree[n];
        let me = out.add_node(None, &node.name, node.dist, node.support);
        for &c in node.children() {
            let c_id = self.copy_into(c, out);
            out.plug(me, c_id);
        }
        me
    }

    fn rebuild(&self, n: NodeID, out: &mut PhyloTree) -> Result<NodeID> {
        let t = &self.tree;
        match t[n].children() {
            [] | [_] => Ok(self.copy_into(n, out)),
            &[c1, c2] => {
                if t[n].dist <= self.zero || t[c1].dist <= self.zero || t[c2].dist <= self.zero {
                    self.solve_flat(n, out)
                } else {
                    let r1 = self.rebuild(c1, out)?;
                    let r2 = self.rebuild(c2, out)?;
                    Ok(out.join((r1, t[c1].dist, t[c1].support), (r2, t[c2].dist, t[c2].support), t[n].dist))
                }
            }
            children => Err(TreeError::NonBinary { node: n, arity: children.len() }.into()),
        }
    }

    fn solve_flat(&self, clade: NodeID, out: &mut PhyloTree) -> Result<NodeID> {
        let mut components = Vec::new();
        self.separate(clade, out, &mut components)?;
        if components.is_empty() {
            return Ok(self.copy_into(clade, out));
        }

        let mut by_taxon = BTreeMap::<Taxon, Vec<(NodeID, f64)>>::new();
        let mut parts = Vec::new();
        for (taxon, node, dist) in components {
            match taxon {
                Some(taxon) => by_taxon.entry(taxon).or_default().push((node, dist)),
                None => parts.push((node, dist)),
            }
        }
        for (_, mut same) in by_taxon.into_iter() {
            same.sort_by(|a, b| b.1.total_cmp(&a.1));
            parts.push(concat_all(out, &same, self.zero, self.zero)?);
        }
        let (root, _) = concat_all(out, &parts, self.tree[clade].dist, self.zero)?;
        Ok(root)
    }

    fn separate(&self, clade: NodeID, out: &mut PhyloTree, ax: &mut Vec<(Option<Taxon>, NodeID, f64)>) -> Result<()> {
        for &c in self.tree[clade].children() {
            let dist = self.tree[c].dist;
            if dist <= self.zero {
                if self.tree[c].is_leaf() || self.tree.leaves_of(c).len() == 1 {
                    ax.push((self.clade_taxon(c), self.copy_into(c, out), dist));
                } else {
                    self.separate(c, out, ax)?;
                }
            } else {
                let rebuilt = self.rebuild(c, out)?;
                ax.push((self.clade_taxon(c), rebuilt, dist));
            }
        }
        Ok(())
    }

    /// The single taxon a component stands for, if any.
    fn clade_taxon(&self, c: NodeID) -> Option<Taxon> {
        let leaves = self.leaf_names(c);
        let n_ref = leaves.iter().filter(|l| self.is_reference(l)).count();

        let counted = if n_ref == 0 {
            leaves.clone()
        } else {
            leaves.iter().copied().filter(|l| self.is_reference(l)).collect()
        };
        let mut counts: Vec<(Taxon, usize)> = Vec::new();
        for l in counted {
            if let Some(taxon) = self.taxon_of(l) {
                match counts.iter_mut().find(|(t, _)| *t == taxon) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((taxon, 1)),
                }
            }
        }

        match counts.len() {
            0 => None,
            1 => counts.pop().map(|(t, _)| t),
            // Query-only components follow their majority
            _ if n_ref == 0 => first_max(counts),
            _ => None,
        }
    }
}

pub(crate) fn first_max(counts: Vec<(Taxon, usize)>) -> Option<Taxon> {
    let mut best: Option<(Taxon, usize)> = None;
    for (t, n) in counts {
        if best.as_ref().map(|b| n > b.1).unwrap_or(true) {
            best = Some((t, n));
        }
    }
    best.map(|b| b.0)
}

/// Chains `clades` into a caterpillar, the last join getting `root_dist`.
fn concat_all(out: &mut PhyloTree, clades: &[(NodeID, f64)], root_dist: f64, zero: f64) -> Result<(NodeID, f64)> {
    match clades {
        [] => Err(TreeError::EmptyJoin.into()),
        [single] => Ok(*single),
        [first, middle @ .., last] => {
            let mut acc = *first;
            for &c in middle {
                let (sa, sc) = (out[acc.0].support, out[c.0].support);
                acc = (out.join((acc.0, acc.1, sa), (c.0, c.1, sc), zero), zero);
            }
            let (sa, sl) = (out[acc.0].support, out[last.0].support);
            Ok((out.join((acc.0, acc.1, sa), (last.0, last.1, sl), root_dist), root_dist))
        }
    }
}

/// Brings [0, 1] supports to the [0, 100] scale.
fn rescale_supports(tree: &mut PhyloTree) {
    let nodes = tree.nodes().copied().collect::<Vec<_>>();
    let max = nodes.iter().map(|&n| tree[n].support).fold(f64::MIN, f64::max);
    if max <= 1. {
        for n in nodes {
            tree[n].support = (tree[n].support * 100.).trunc();
        }
    }
}
