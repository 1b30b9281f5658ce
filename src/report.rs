use anyhow::*;
use itertools::Itertools;
use std::io::Write;
use std::path::Path;

use crate::dataset::{Datatype, Registry};
use crate::delimit::Taxon;
use crate::tree_info::TreeInfo;
use crate::utils::create_file;

/// The fate of a single sample in a single tree.
#[derive(Debug, Clone)]
pub struct Singlereport {
    pub id: String,
    pub hash: String,
    pub group: String,
    pub gene: String,
    pub species_original: Taxon,
    pub species_assigned: String,
    /// Number of reference taxa merged in the clade of the sample
    pub ambiguous: usize,
    /// 1-based index of the clade among those sharing its label, if several do
    pub clade_index: Option<usize>,
    pub flat: bool,
}

/// Named taxa first, then placeholders, each sorted by label.
pub fn ordered_taxa<'a, I: IntoIterator<Item = &'a Taxon>>(taxa: I) -> Vec<&'a Taxon> {
    let (named, placeholders): (Vec<&Taxon>, Vec<&Taxon>) =
        taxa.into_iter().partition(|t| !t.species.starts_with("sp."));
    named
        .into_iter()
        .sorted_by(|a, b| (&a.species, &a.genus).cmp(&(&b.species, &b.genus)))
        .chain(placeholders.into_iter().sorted_by(|a, b| (&a.species, &a.genus).cmp(&(&b.species, &b.genus))))
        .collect()
}

pub fn collect_reports(info: &TreeInfo) -> Vec<Singlereport> {
    let mut r = Vec::new();
    for taxon in ordered_taxa(info.collapse_dict.keys()) {
        let records = &info.collapse_dict[taxon];
        for (n, record) in records.iter().enumerate() {
            let clade_index = if records.len() > 1 { Some(n + 1) } else { None };
            let species_assigned = match clade_index {
                Some(i) => format!("{} {}", taxon, i),
                None => taxon.to_string(),
            };
            for leaf in record.leaves.iter() {
                r.push(Singlereport {
                    id: info.meta.get(&leaf.hash).map(|m| m.original_id.clone()).unwrap_or_else(|| leaf.hash.clone()),
                    hash: leaf.hash.clone(),
                    group: info.group.clone(),
                    gene: info.gene.clone(),
                    species_original: leaf.annotation.clone(),
                    species_assigned: species_assigned.clone(),
                    ambiguous: record.clade_cnt,
                    clade_index,
                    flat: record.flat,
                });
            }
        }
    }
    r
}

pub fn write_reports<P: AsRef<Path>>(filename: P, reports: &[Singlereport]) -> Result<()> {
    let mut out = create_file(filename)?;
    writeln!(out, "id\thash\tgroup\tgene\tspecies_original\tspecies_assigned\tambiguous\tclade\tflat")?;
    for r in reports {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.id,
            r.hash,
            r.group,
            r.gene,
            r.species_original,
            r.species_assigned,
            r.ambiguous,
            r.clade_index.map(|i| i.to_string()).unwrap_or_default(),
            r.flat
        )?;
    }
    Ok(out.flush()?)
}

/// Writes what was concluded about every query sample.
pub fn write_identification<P: AsRef<Path>>(filename: P, registry: &Registry, genes: &[String]) -> Result<()> {
    let mut out = create_file(filename)?;
    writeln!(
        out,
        "id\thash\tgenus\tfinal_species\tspecies_identifier\t{}\tflat",
        genes.iter().join("\t")
    )?;
    for fi in registry.values().filter(|fi| fi.datatype == Datatype::Query) {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            fi.original_id,
            fi.hash,
            fi.genus,
            fi.final_species.as_deref().unwrap_or(""),
            fi.species_identifier,
            genes.iter().map(|g| fi.bygene_species.get(g).map(String::as_str).unwrap_or("")).join("\t"),
            fi.flat.iter().join(",")
        )?;
    }
    Ok(out.flush()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Datatype::*;
    use crate::tree_info::tests::info;

    #[test]
    fn named_taxa_come_first() {
        let taxa = vec![
            Taxon::new("Fusarium", "sp. 2"),
            Taxon::new("Fusarium", "solani"),
            Taxon::new("Alternaria", "sp. 1"),
            Taxon::new("Fusarium", "oxysporum"),
            Taxon::new("Alternaria", "solani"),
        ];
        let ordered = ordered_taxa(taxa.iter()).into_iter().map(|t| t.to_string()).collect::<Vec<_>>();
        assert_eq!(
            ordered,
            vec!["Fusarium oxysporum", "Alternaria solani", "Fusarium solani", "Alternaria sp. 1", "Fusarium sp. 2"]
        );
    }

    #[test]
    fn shared_labels_are_disambiguated() {
        // oxysporum shows up as two separate clades
        let mut ti = info(
            "((O1:0.5,O2:0.5):0.1,((A1:0.1,B:0.1):0.2,(A2:0.1,Q:0.001):0.2):0.1);",
            "ITS",
            &[
                ("O1", Outgroup, "Neo", "rubi"),
                ("O2", Outgroup, "Neo", "rubi"),
                ("A1", Db, "Fusarium", "oxysporum"),
                ("A2", Db, "Fusarium", "oxysporum"),
                ("B", Db, "Fusarium", "solani"),
                ("Q", Query, "Fusarium", ""),
            ],
        );
        ti.tree_search(0.01, false).unwrap();
        let reports = collect_reports(&ti);
        assert_eq!(reports.len(), 6);

        let q = reports.iter().find(|r| r.hash == "Q").unwrap();
        assert_eq!(q.species_assigned, "Fusarium oxysporum 2");
        assert_eq!(q.clade_index, Some(2));
        let b = reports.iter().find(|r| r.hash == "B").unwrap();
        assert_eq!(b.species_assigned, "Fusarium solani");
        assert_eq!(b.clade_index, None);
        assert_eq!(b.species_original, Taxon::new("Fusarium", "solani"));
    }

    #[test]
    fn reports_are_written_as_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.report.tsv");
        let report = Singlereport {
            id: "CBS 1".into(),
            hash: "HS1HE".into(),
            group: "G1".into(),
            gene: "ITS".into(),
            species_original: Taxon::new("Fusarium", "oxysporum"),
            species_assigned: "Fusarium oxysporum".into(),
            ambiguous: 1,
            clade_index: None,
            flat: false,
        };
        write_reports(&path, &[report]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "CBS 1\tHS1HE\tG1\tITS\tFusarium oxysporum\tFusarium oxysporum\t1\t\tfalse");
    }
}
