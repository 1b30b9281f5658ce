//! Keeps `sp. N` placeholders consistent across the trees of a genus.
//!
//! Within a genus, the concatenated tree of every group is the numbering
//! authority: its placeholders are shifted past those of the groups sorted
//! before it, and the single-gene trees of the group are then relabelled after
//! the concatenated placeholders their leaves ended up in.
use anyhow::*;
use log::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use crate::delimit::{CollapseDict, CollapseRecord, Taxon};
use crate::errors::SyncError;
use crate::tree_info::{TreeInfo, CONCATENATED};

/// What to do with a by-gene placeholder whose leaves match no concatenated placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyMatchPolicy {
    Keep,
    Fail,
}
impl Default for EmptyMatchPolicy {
    fn default() -> Self {
        EmptyMatchPolicy::Keep
    }
}
impl FromStr for EmptyMatchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep" => Ok(EmptyMatchPolicy::Keep),
            "fail" => Ok(EmptyMatchPolicy::Fail),
            _ => bail!("unknown policy `{}`; expected keep or fail", s),
        }
    }
}

/// genus -> group -> gene -> position in the tree list
type SyncIndex = BTreeMap<String, BTreeMap<String, BTreeMap<String, usize>>>;

#[derive(Debug, Default)]
pub struct SyncSummary {
    /// genus -> final numbering offset
    pub offsets: BTreeMap<String, u32>,
}

fn build_index(trees: &[TreeInfo]) -> Result<SyncIndex> {
    let mut index = SyncIndex::new();
    for (i, t) in trees.iter().enumerate() {
        let genera = t.collapse_dict.keys().map(|k| k.genus.clone()).collect::<BTreeSet<_>>();
        for genus in genera {
            let genes = index.entry(genus.clone()).or_default().entry(t.group.clone()).or_default();
            if genes.insert(t.gene.clone(), i).is_some() {
                let err = SyncError::DuplicateTreeInfo { genus, group: t.group.clone(), gene: t.gene.clone() };
                error!("{}", err);
                return Err(err.into());
            }
        }
    }

    for (genus, groups) in index.iter() {
        for (group, genes) in groups.iter() {
            if !genes.contains_key(CONCATENATED) {
                let err = SyncError::MissingConcatenated { genus: genus.clone(), group: group.clone() };
                error!("{}", err);
                return Err(err.into());
            }
        }
    }
    Ok(index)
}

/// Moves every record to the key given by `f`, concatenating records that collide.
fn rekey<F: FnMut(&Taxon, &[CollapseRecord]) -> Result<Taxon>>(dict: &CollapseDict, mut f: F) -> Result<CollapseDict> {
    let mut r = CollapseDict::new();
    for (taxon, records) in dict.iter() {
        let new_taxon = f(taxon, records)?;
        r.entry(new_taxon).or_default().extend(records.iter().cloned());
    }
    Ok(r)
}

/// Shifts the `sp. N` placeholders of `genus` by `offset`.
///
/// Returns the renumbered dictionary, the new placeholder number of every
/// leaf involved, and the width of the range of numbers used.
pub fn renumber_placeholders(dict: &CollapseDict, genus: &str, offset: u32) -> Result<(CollapseDict, HashMap<String, u32>, u32)> {
    let mut hash_map = HashMap::new();
    let mut count = 0;
    let mut max_n = 0;
    let renumbered = rekey(dict, |taxon, records| {
        if taxon.genus != genus {
            return Ok(taxon.clone());
        }
        match taxon.placeholder_number() {
            Some(n) => {
                count += 1;
                max_n = max_n.max(n);
                for leaf in records.iter().flat_map(|r| r.leaves.iter()) {
                    hash_map.insert(leaf.hash.clone(), n + offset);
                }
                Ok(Taxon::placeholder(genus, n + offset))
            }
            None => Ok(taxon.clone()),
        }
    })?;
    Ok((renumbered, hash_map, count.max(max_n)))
}

/// The `sp. N` labels that the given leaves received in the concatenated tree.
pub fn placeholder_labels<'a, I: IntoIterator<Item = &'a str>>(leaves: I, hash_map: &HashMap<String, u32>) -> Vec<String> {
    leaves
        .into_iter()
        .filter_map(|h| hash_map.get(h).copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|n| format!("sp. {}", n))
        .collect()
}

/// Renames the placeholders of `genus` in a single-gene tree after their
/// concatenated counterparts.
pub fn relabel_by_gene(
    dict: &CollapseDict,
    genus: &str,
    hash_map: &HashMap<String, u32>,
    policy: EmptyMatchPolicy,
    group: &str,
    gene: &str,
) -> Result<CollapseDict> {
    rekey(dict, |taxon, records| {
        if taxon.genus != genus || !taxon.is_placeholder() {
            return Ok(taxon.clone());
        }
        let labels = placeholder_labels(
            records.iter().flat_map(|r| r.leaves.iter().map(|l| l.hash.as_str())),
            hash_map,
        );
        if labels.is_empty() {
            return match policy {
                EmptyMatchPolicy::Keep => {
                    warn!(
                        "{} {} in {}/{} matches no concatenated placeholder; left as is",
                        genus, taxon.species, group, gene
                    );
                    Ok(taxon.clone())
                }
                EmptyMatchPolicy::Fail => Err(SyncError::UnmatchedPlaceholder {
                    genus: genus.to_owned(),
                    group: group.to_owned(),
                    gene: gene.to_owned(),
                    label: taxon.species.clone(),
                }
                .into()),
            };
        }

        let joined = labels.join("/");
        let species = if taxon.is_narrow_placeholder() {
            joined
        } else {
            format!("{}/{}", taxon.species, joined)
        };
        Ok(Taxon::new(genus, &species))
    })
}

/// Numbers the placeholders of all trees so that they never collide within a
/// genus, and so that single-gene trees agree with the concatenated ones.
pub fn synchronize(trees: &mut [TreeInfo], policy: EmptyMatchPolicy) -> Result<SyncSummary> {
    let index = build_index(trees)?;
    let mut summary = SyncSummary::default();

    for (genus, groups) in index.iter() {
        let mut offset = 0u32;
        for (group, genes) in groups.iter() {
            let concatenated = genes[CONCATENATED];
            if let Some(&span) = trees[concatenated].sync_stamps.get(genus) {
                debug!("{}/{} already synchronized for {}", group, CONCATENATED, genus);
                offset += span;
                continue;
            }

            let (dict, hash_map, span) = renumber_placeholders(&trees[concatenated].collapse_dict, genus, offset)?;
            trees[concatenated].collapse_dict = dict;
            trees[concatenated].sync_stamps.insert(genus.clone(), span);
            debug!("{}: {} placeholders of {} start after {}", group, span, genus, offset);

            for (gene, &i) in genes.iter().filter(|(gene, _)| gene.as_str() != CONCATENATED) {
                if trees[i].sync_stamps.contains_key(genus) {
                    continue;
                }
                trees[i].collapse_dict = relabel_by_gene(&trees[i].collapse_dict, genus, &hash_map, policy, group, gene)?;
                trees[i].sync_stamps.insert(genus.clone(), 0);
            }
            offset += span;
        }
        info!("{}: {} placeholder species", genus, offset);
        summary.offsets.insert(genus.clone(), offset);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Datatype::*;
    use crate::tree_info::tests::info;

    const CUTOFF: f64 = 0.01;
    const OUT: [(&str, crate::dataset::Datatype, &str, &str); 2] =
        [("O1", Outgroup, "Fusarium", "rubi"), ("O2", Outgroup, "Fusarium", "rubi")];

    fn tree(group: &str, gene: &str, newick: &str, queries: &[&str]) -> TreeInfo {
        let mut leaves = OUT.to_vec();
        leaves.push(("A", Db, "Fusarium", "oxysporum"));
        leaves.extend(queries.iter().map(|q| (*q, Query, "Fusarium", "")));
        let mut t = info(newick, gene, &leaves);
        t.group = group.to_owned();
        t.tree_search(CUTOFF, false).unwrap();
        t
    }

    /// G1 holds two distinct query clades, G2 a single one
    fn fusarium() -> Vec<TreeInfo> {
        vec![
            tree("G1", CONCATENATED, "((O1:0.5,O2:0.5):0.1,(A:0.2,((Q1:0.001,Q2:0.001):0.3,(Q3:0.001,Q4:0.001):0.3):0.2):0.1);", &["Q1", "Q2", "Q3", "Q4"]),
            tree("G1", "ITS", "((O1:0.5,O2:0.5):0.1,(A:0.2,(Q1:0.001,(Q2:0.001,Q3:0.001):0.001):0.2):0.1);", &["Q1", "Q2", "Q3"]),
            tree("G2", CONCATENATED, "((O1:0.5,O2:0.5):0.1,(A:0.2,(Q5:0.001,Q6:0.001):0.2):0.1);", &["Q5", "Q6"]),
            tree("G2", "ITS", "((O1:0.5,O2:0.5):0.1,(A:0.2,(Q5:0.001,Q6:0.001):0.2):0.1);", &["Q5", "Q6"]),
        ]
    }

    fn placeholders(t: &TreeInfo) -> Vec<String> {
        t.collapse_dict.keys().filter(|k| k.is_placeholder()).map(|k| k.species.clone()).collect()
    }

    #[test]
    fn fusarium_groups_are_numbered_in_sequence() {
        let mut trees = fusarium();
        assert_eq!(placeholders(&trees[0]), vec!["sp. 1", "sp. 2"]);
        assert_eq!(placeholders(&trees[2]), vec!["sp. 1"]);

        let summary = synchronize(&mut trees, EmptyMatchPolicy::Keep).unwrap();
        assert_eq!(placeholders(&trees[0]), vec!["sp. 1", "sp. 2"]);
        assert_eq!(placeholders(&trees[2]), vec!["sp. 3"]);
        assert_eq!(summary.offsets["Fusarium"], 3);

        // ITS lumps Q1..Q3, which the concatenated tree split across sp. 1 and sp. 2
        assert_eq!(placeholders(&trees[1]), vec!["sp. 1/sp. 2"]);
        assert_eq!(placeholders(&trees[3]), vec!["sp. 3"]);
    }

    #[test]
    fn numbers_are_unique_within_a_genus() {
        let mut trees = fusarium();
        synchronize(&mut trees, EmptyMatchPolicy::Keep).unwrap();
        let numbers = trees
            .iter()
            .filter(|t| t.gene == CONCATENATED)
            .flat_map(|t| t.collapse_dict.keys().filter_map(|k| k.placeholder_number()))
            .collect::<Vec<_>>();
        let unique = numbers.iter().collect::<BTreeSet<_>>();
        assert_eq!(numbers.len(), unique.len());
    }

    #[test]
    fn second_pass_changes_nothing() {
        let mut trees = fusarium();
        let first = synchronize(&mut trees, EmptyMatchPolicy::Keep).unwrap();
        let labels = trees.iter().map(placeholders).collect::<Vec<_>>();
        let second = synchronize(&mut trees, EmptyMatchPolicy::Keep).unwrap();
        assert_eq!(trees.iter().map(placeholders).collect::<Vec<_>>(), labels);
        assert_eq!(first.offsets, second.offsets);
        assert!(labels.iter().flatten().all(|l| !l.contains("tmp")));
    }

    #[test]
    fn offset_follows_concatenated_counts() {
        let dict = fusarium().remove(0).collapse_dict;
        let (renumbered, hash_map, span) = renumber_placeholders(&dict, "Fusarium", 5).unwrap();
        assert_eq!(span, 2);
        assert!(renumbered.contains_key(&Taxon::new("Fusarium", "sp. 6")));
        assert!(renumbered.contains_key(&Taxon::new("Fusarium", "sp. 7")));
        assert_eq!(hash_map.len(), 4);
        // other genera are left alone
        let (untouched, empty, zero) = renumber_placeholders(&dict, "Neocosmospora", 5).unwrap();
        assert_eq!(untouched.keys().collect::<Vec<_>>(), dict.keys().collect::<Vec<_>>());
        assert!(empty.is_empty() && zero == 0);
    }

    #[test]
    fn reserved_gaps_push_the_next_group() {
        let mut trees = fusarium();
        // G1 kept sp. 2 and sp. 3 reserved, so its second clade was minted as sp. 4
        let second = trees[0].collapse_dict.remove(&Taxon::new("Fusarium", "sp. 2")).unwrap();
        trees[0].collapse_dict.insert(Taxon::new("Fusarium", "sp. 4"), second);
        assert_eq!(placeholders(&trees[0]), vec!["sp. 1", "sp. 4"]);

        let summary = synchronize(&mut trees, EmptyMatchPolicy::Keep).unwrap();
        assert_eq!(placeholders(&trees[0]), vec!["sp. 1", "sp. 4"]);
        assert_eq!(placeholders(&trees[2]), vec!["sp. 5"]);
        assert_eq!(placeholders(&trees[3]), vec!["sp. 5"]);
        assert_eq!(summary.offsets["Fusarium"], 5);
    }

    #[test]
    fn missing_concatenated_is_fatal() {
        let mut trees = fusarium();
        trees.remove(2);
        let err = synchronize(&mut trees, EmptyMatchPolicy::Keep).unwrap_err();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::MissingConcatenated { .. })));
        // nothing was renumbered
        assert_eq!(placeholders(&trees[0]), vec!["sp. 1", "sp. 2"]);
        assert!(trees.iter().all(|t| t.sync_stamps.is_empty()));
    }

    #[test]
    fn duplicated_trees_are_fatal() {
        let mut trees = fusarium();
        trees.push(tree("G1", "ITS", "((O1:0.5,O2:0.5):0.1,(A:0.2,Q1:0.2):0.1);", &["Q1"]));
        let err = synchronize(&mut trees, EmptyMatchPolicy::Keep).unwrap_err();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::DuplicateTreeInfo { .. })));
    }

    #[test]
    fn unmatched_placeholders_follow_policy() {
        let mut trees = fusarium();
        // Q9 only exists in the ITS tree of G2
        trees[3] = tree("G2", "ITS", "((O1:0.5,O2:0.5):0.1,(A:0.2,Q9:0.2):0.1);", &["Q9"]);
        let mut kept = trees.clone();

        synchronize(&mut kept, EmptyMatchPolicy::Keep).unwrap();
        assert_eq!(placeholders(&kept[3]), vec!["sp. 1"]);

        let err = synchronize(&mut trees, EmptyMatchPolicy::Fail).unwrap_err();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::UnmatchedPlaceholder { .. })));
    }

    #[test]
    fn formae_speciales_keep_their_prefix() {
        let mut dict = CollapseDict::new();
        let record = |h: &str| CollapseRecord {
            clade: 0,
            leaves: vec![crate::delimit::LeafEntry { hash: h.into(), datatype: None, annotation: Taxon::new("F", "") }],
            clade_cnt: 0,
            flat: false,
            n_db: 0,
            n_query: 0,
            n_others: 1,
        };
        dict.insert(Taxon::new("F", "cf. sp."), vec![record("a")]);
        dict.insert(Taxon::new("F", "oxysporum f.sp. lycopersici"), vec![record("c")]);
        dict.insert(Taxon::new("F", "solani"), vec![record("b")]);
        let hash_map = [("a".to_owned(), 4), ("b".to_owned(), 5), ("c".to_owned(), 6)].into_iter().collect();
        let r = relabel_by_gene(&dict, "F", &hash_map, EmptyMatchPolicy::Fail, "G", "ITS").unwrap();
        assert!(r.contains_key(&Taxon::new("F", "sp. 4")));
        assert!(r.contains_key(&Taxon::new("F", "oxysporum f.sp. lycopersici/sp. 6")));
        assert!(r.contains_key(&Taxon::new("F", "solani")));
        assert_eq!(r.len(), 3);
    }
}
