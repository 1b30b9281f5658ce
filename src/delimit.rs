use anyhow::*;
use log::*;
use std::collections::{BTreeMap, BTreeSet};

use crate::dataset::Datatype;
use crate::errors::TreeError;
use crate::tree::NodeID;
use crate::tree_info::{first_max, TreeInfo};

pub const AMBIGUOUS_GENUS: &str = "Ambiguousgenus";
pub const UNKNOWN_GENUS: &str = "Unknowngenus";
const PLACEHOLDER: &str = "sp.";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Taxon {
    pub genus: String,
    pub species: String,
}
impl Taxon {
    pub fn new(genus: &str, species: &str) -> Taxon {
        Taxon { genus: genus.to_owned(), species: species.to_owned() }
    }

    pub fn placeholder(genus: &str, n: u32) -> Taxon {
        Taxon { genus: genus.to_owned(), species: format!("{} {}", PLACEHOLDER, n) }
    }

    /// Whether the species is left undetermined, even partially
    pub fn is_placeholder(&self) -> bool {
        self.species.contains(PLACEHOLDER)
    }

    /// `N` for a `sp. N` label
    pub fn placeholder_number(&self) -> Option<u32> {
        self.species.strip_prefix(PLACEHOLDER)?.strip_prefix(' ')?.parse().ok()
    }

    /// An undetermined species such as `sp. 2` or `cf. sp.`, as opposed to a
    /// forma specialis like `f.sp. lycopersici`
    pub fn is_narrow_placeholder(&self) -> bool {
        self.species.contains(PLACEHOLDER) && !self.species.contains(".sp")
    }
}
impl std::fmt::Display for Taxon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{} {}", self.genus, self.species).trim())
    }
}

#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub hash: String,
    pub datatype: Option<Datatype>,
    /// Taxon the sample was annotated with
    pub annotation: Taxon,
}

/// A clade standing for a single taxon.
#[derive(Debug, Clone)]
pub struct CollapseRecord {
    pub clade: NodeID,
    pub leaves: Vec<LeafEntry>,
    /// Number of distinct reference taxa merged in the clade
    pub clade_cnt: usize,
    pub flat: bool,
    pub n_db: usize,
    pub n_query: usize,
    pub n_others: usize,
}

pub type CollapseDict = BTreeMap<Taxon, Vec<CollapseRecord>>;

impl TreeInfo {
    /// Reference taxa found in the clade, in order of first appearance.
    fn taxon_count(&self, clade: NodeID, count_query: bool) -> Vec<(Taxon, usize)> {
        let mut counts: Vec<(Taxon, usize)> = Vec::new();
        for l in self.leaf_names(clade) {
            if !count_query && !self.is_reference(l) {
                continue;
            }
            if let Some(taxon) = self.taxon_of(l) {
                match counts.iter_mut().find(|(t, _)| *t == taxon) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((taxon, 1)),
                }
            }
        }
        counts
    }

    fn designate_genus(&self, clade: NodeID) -> String {
        let genera = self
            .leaf_names(clade)
            .into_iter()
            .filter(|l| self.is_reference(l))
            .filter_map(|l| self.meta.get(l).map(|m| m.genus.as_str()))
            .collect::<BTreeSet<_>>();
        match genera.len() {
            0 => match self.tree[clade].parent() {
                Some(parent) => self.designate_genus(parent),
                None => UNKNOWN_GENUS.to_owned(),
            },
            1 => genera.into_iter().next().unwrap_or(UNKNOWN_GENUS).to_owned(),
            _ => AMBIGUOUS_GENUS.to_owned(),
        }
    }

    fn next_placeholder(&mut self, genus: &str) -> Taxon {
        let reserved = self.reserved_sp.get(genus);
        let counter = self.sp_counters.entry(genus.to_owned()).or_insert(1);
        while reserved.map(|r| r.contains(&*counter)).unwrap_or(false) {
            debug!("skipping {} sp. {}, already used in the database", genus, counter);
            *counter += 1;
        }
        let taxon = Taxon::placeholder(genus, *counter);
        *counter += 1;
        taxon
    }

    /// The taxon a clade will be reported as.
    fn major_taxon(&mut self, clade: NodeID, validation: bool) -> Taxon {
        if let Some(taxon) = first_max(self.taxon_count(clade, false)) {
            return taxon;
        }
        if validation {
            if let Some(taxon) = first_max(self.taxon_count(clade, true)) {
                if taxon.species.starts_with("sp") {
                    return taxon;
                }
            }
        }
        let genus = self.designate_genus(clade);
        self.next_placeholder(&genus)
    }

    fn is_monophyletic(&self, clade: NodeID, cutoff: f64) -> bool {
        if self.tree[clade].children().len() == 1 {
            return true;
        }
        match self.taxon_count(clade, false).len() {
            0 => self.tree[clade].children().iter().all(|&c| self.tree[c].dist <= cutoff),
            1 => self
                .tree[clade]
                .children()
                .iter()
                .filter(|&&c| self.taxon_count(c, false).is_empty())
                .all(|&c| self.tree[c].dist <= cutoff),
            _ => false,
        }
    }

    fn collapse(&mut self, clade: NodeID, flat: bool, validation: bool) {
        let taxon = self.major_taxon(clade, validation);
        let mut record = CollapseRecord {
            clade,
            leaves: Vec::new(),
            clade_cnt: self.taxon_count(clade, false).len(),
            flat,
            n_db: 0,
            n_query: 0,
            n_others: 0,
        };
        for l in self.leaf_names(clade) {
            let datatype = self.decide_type(l);
            match datatype {
                Some(Datatype::Db) | Some(Datatype::Outgroup) => record.n_db += 1,
                Some(Datatype::Query) => record.n_query += 1,
                None => record.n_others += 1,
            }
            record.leaves.push(LeafEntry {
                hash: l.to_owned(),
                datatype,
                annotation: self.taxon_of(l).unwrap_or_else(|| Taxon::new("", "")),
            });
        }
        trace!("{}: {} leaves collapsed as {}", self.source, record.leaves.len(), taxon);
        self.collapse_dict.entry(taxon).or_default().push(record);
    }

    fn search(&mut self, clade: NodeID, cutoff: f64, validation: bool) -> Result<()> {
        match self.tree[clade].children().to_vec().as_slice() {
            [] | [_] => {
                self.collapse(clade, false, validation);
                Ok(())
            }
            [c1, c2] => {
                for &c in [*c1, *c2].iter() {
                    let flat = self.tree[c].dist <= self.zero;
                    if self.is_monophyletic(c, cutoff) {
                        self.collapse(c, flat, validation);
                    } else {
                        self.search(c, cutoff, validation)?;
                    }
                }
                Ok(())
            }
            children => Err(TreeError::NonBinary { node: clade, arity: children.len() }.into()),
        }
    }

    /// Splits the whole tree into collapsed clades, each named after a taxon.
    pub fn tree_search(&mut self, cutoff: f64, validation: bool) -> Result<()> {
        self.collapse_dict.clear();
        self.sp_counters.clear();
        self.search(self.tree.root(), cutoff, validation)?;
        debug!(
            "{}: {} taxa over {} clades",
            self.source,
            self.collapse_dict.len(),
            self.collapse_dict.values().map(|r| r.len()).sum::<usize>()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree_info::tests::info;
    use Datatype::*;

    const CUTOFF: f64 = 0.01;

    fn leaves_of(ti: &TreeInfo) -> Vec<String> {
        let mut r = ti
            .collapse_dict
            .values()
            .flat_map(|rs| rs.iter().flat_map(|r| r.leaves.iter().map(|l| l.hash.clone())))
            .collect::<Vec<_>>();
        r.sort();
        r
    }

    #[test]
    fn taxon_labels() {
        assert!(Taxon::new("F", "sp. 3").is_narrow_placeholder());
        assert_eq!(Taxon::new("F", "sp. 3").placeholder_number(), Some(3));
        assert!(Taxon::new("F", "sp.").is_narrow_placeholder());
        assert!(Taxon::new("F", "aff. sp. 2").is_narrow_placeholder());
        let forma = Taxon::new("F", "oxysporum f.sp. lycopersici");
        assert!(forma.is_placeholder() && !forma.is_narrow_placeholder());
        assert_eq!(Taxon::new("F", "").to_string(), "F");
    }

    #[test]
    fn every_leaf_in_exactly_one_record() {
        let mut ti = info(
            "((O:0.5,P:0.5):0.1,((A1:0.001,A2:0.001):0.2,((Q1:0.3,Q2:0.3):0.2,B:0.1):0.2):0.1);",
            "ITS",
            &[
                ("O", Outgroup, "Neo", "rubi"),
                ("P", Outgroup, "Neo", "rubi"),
                ("A1", Db, "F", "oxysporum"),
                ("A2", Db, "F", "oxysporum"),
                ("B", Db, "F", "solani"),
                ("Q1", Query, "F", ""),
                ("Q2", Query, "F", ""),
            ],
        );
        ti.tree_search(CUTOFF, false).unwrap();
        assert_eq!(leaves_of(&ti), vec!["A1", "A2", "B", "O", "P", "Q1", "Q2"]);
        assert_eq!(ti.collapse_dict[&Taxon::new("F", "oxysporum")][0].leaves.len(), 2);
        assert_eq!(ti.collapse_dict[&Taxon::new("Neo", "rubi")][0].n_db, 2);

        // Q1 and Q2 are too far apart to stand for a single species
        let placeholders = ti.collapse_dict.keys().filter(|t| t.is_narrow_placeholder()).collect::<Vec<_>>();
        assert_eq!(placeholders, vec![&Taxon::new("F", "sp. 1"), &Taxon::new("F", "sp. 2")]);
        assert!(ti.collapse_dict.values().flatten().all(|r| r.n_query + r.n_db + r.n_others == r.leaves.len()));
    }

    #[test]
    fn close_queries_join_their_reference() {
        let mut ti = info(
            "((O:0.5,P:0.5):0.1,((A:0.001,Q:0.001):0.2,B:0.2):0.1);",
            "ITS",
            &[
                ("O", Outgroup, "Neo", "rubi"),
                ("P", Outgroup, "Neo", "rubi"),
                ("A", Db, "F", "oxysporum"),
                ("Q", Query, "F", ""),
                ("B", Db, "F", "solani"),
            ],
        );
        ti.tree_search(CUTOFF, false).unwrap();
        let records = &ti.collapse_dict[&Taxon::new("F", "oxysporum")];
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].n_query, 1);
        assert_eq!(records[0].clade_cnt, 1);
    }

    #[test]
    fn placeholders_skip_reserved_numbers() {
        let mut ti = info(
            "((O:0.5,P:0.5):0.1,(Q1:0.3,Q2:0.3):0.1);",
            "ITS",
            &[("O", Outgroup, "F", "rubi"), ("P", Outgroup, "F", "rubi"), ("Q1", Query, "F", ""), ("Q2", Query, "F", "")],
        );
        ti.reserved_sp.entry("F".into()).or_default().insert(1);
        ti.tree_search(CUTOFF, false).unwrap();
        let numbers = ti.collapse_dict.keys().filter_map(|t| t.placeholder_number()).collect::<Vec<_>>();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn validation_keeps_query_placeholders() {
        let mut ti = info(
            "((O:0.5,P:0.5):0.1,(Q1:0.001,Q2:0.001):0.1);",
            "ITS",
            &[("O", Outgroup, "F", "rubi"), ("P", Outgroup, "F", "rubi"), ("Q1", Query, "F", "sp. 9"), ("Q2", Query, "F", "sp. 9")],
        );
        ti.tree_search(CUTOFF, true).unwrap();
        assert!(ti.collapse_dict.contains_key(&Taxon::new("F", "sp. 9")));
    }

    #[test]
    fn polytomies_are_rejected() {
        let mut ti = info("(A:1,B:1,C:1);", "ITS", &[]);
        let err = ti.tree_search(CUTOFF, false).unwrap_err();
        assert!(matches!(err.downcast_ref::<TreeError>(), Some(TreeError::NonBinary { arity: 3, .. })));
    }
}
