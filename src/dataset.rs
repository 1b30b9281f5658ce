use anyhow::*;
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;

use crate::errors::DataError;
use crate::hasher::HashCodec;
use crate::utils::read_tsv;

/// Placeholder in the sample sheet asking for a freshly minted hash
const AUTO_HASH: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Datatype {
    Query,
    Db,
    Outgroup,
}
impl FromStr for Datatype {
    type Err = DataError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "query" => std::result::Result::Ok(Datatype::Query),
            "db" | "database" => std::result::Result::Ok(Datatype::Db),
            "outgroup" => std::result::Result::Ok(Datatype::Outgroup),
            _ => Err(DataError::UnknownDatatype(s.to_owned())),
        }
    }
}
impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Datatype::Query => "query",
                Datatype::Db => "db",
                Datatype::Outgroup => "outgroup",
            }
        )
    }
}

/// One sample, and what the run concluded about it.
#[derive(Debug, Clone)]
pub struct FunInfo {
    pub hash: String,
    pub original_id: String,
    pub datatype: Datatype,
    pub genus: String,
    pub ori_species: String,
    /// gene -> species label; read from the sample sheet, overwritten by by-gene results
    pub bygene_species: BTreeMap<String, String>,
    pub final_species: Option<String>,
    pub species_identifier: usize,
    /// Genes in which this sample landed in a flat clade
    pub flat: Vec<String>,
}
impl FunInfo {
    pub fn species_for(&self, gene: &str) -> &str {
        self.bygene_species.get(gene).map(String::as_str).unwrap_or(&self.ori_species)
    }
}

pub type Registry = BTreeMap<String, FunInfo>;

#[derive(Debug, Clone, Default)]
pub struct GeneSet {
    pub queries: Vec<String>,
    pub outgroups: Vec<String>,
}

pub struct Dataset {
    pub registry: Registry,
    /// group -> gene -> members
    pub groups: BTreeMap<String, BTreeMap<String, GeneSet>>,
    pub genus_list: Vec<String>,
}

impl Dataset {
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(samples: P, dataset: Q, codec: &mut HashCodec) -> Result<Dataset> {
        let samples = samples.as_ref();
        let dataset = dataset.as_ref();
        info!("Reading samples from {}", samples.display());
        let registry = read_samples(samples, codec)?;
        info!("Reading dataset from {}", dataset.display());
        let groups = read_dataset(dataset, &registry, codec)?;
        let genus_list = registry
            .values()
            .map(|fi| fi.genus.clone())
            .filter(|g| !g.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(
            "{} samples, {} groups, {} (group, gene) pairs",
            registry.len(),
            groups.len(),
            groups.values().map(|g| g.len()).sum::<usize>()
        );

        Ok(Dataset { registry, groups, genus_list })
    }

    /// All database samples that are neither queries nor outgroups of `members`.
    pub fn db_list(&self, members: &GeneSet) -> Vec<String> {
        self.registry
            .values()
            .filter(|fi| fi.datatype == Datatype::Db)
            .filter(|fi| !members.queries.contains(&fi.hash) && !members.outgroups.contains(&fi.hash))
            .map(|fi| fi.hash.clone())
            .collect()
    }
}

fn read_samples(filename: &Path, codec: &mut HashCodec) -> Result<Registry> {
    let malformed = |line| DataError::MalformedLine { file: filename.display().to_string(), line };

    let records = read_tsv(filename)?;
    for r in records.iter() {
        if r.fields.len() < 5 {
            return Err(malformed(r.line).into());
        }
        if r.fields[0] != AUTO_HASH {
            if !codec.is_hash(&r.fields[0]) {
                bail!(DataError::InvalidHash(r.fields[0].clone()));
            }
            codec.register(&r.fields[0], &r.fields[1]);
        }
    }

    let mut registry = Registry::new();
    for r in records.into_iter() {
        let hash = if r.fields[0] == AUTO_HASH { codec.assign(&r.fields[1]) } else { r.fields[0].clone() };
        let mut bygene_species = BTreeMap::new();
        for extra in &r.fields[5..] {
            let (gene, label) = extra.split_once('=').ok_or_else(|| malformed(r.line))?;
            bygene_species.insert(gene.trim().to_owned(), label.trim().to_owned());
        }
        if registry.contains_key(&hash) {
            warn!("{} appears twice in {}; keeping the last entry", hash, filename.display());
        }
        registry.insert(
            hash.clone(),
            FunInfo {
                hash,
                original_id: r.fields[1].clone(),
                datatype: r.fields[2].parse()?,
                genus: r.fields[3].clone(),
                ori_species: r.fields[4].clone(),
                bygene_species,
                final_species: None,
                species_identifier: 0,
                flat: Vec::new(),
            },
        );
    }
    Ok(registry)
}

fn read_dataset(
    filename: &Path,
    registry: &Registry,
    codec: &HashCodec,
) -> Result<BTreeMap<String, BTreeMap<String, GeneSet>>> {
    let mut groups: BTreeMap<String, BTreeMap<String, GeneSet>> = BTreeMap::new();
    for r in read_tsv(filename)? {
        if r.fields.len() < 4 {
            bail!(DataError::MalformedLine { file: filename.display().to_string(), line: r.line });
        }
        let member = &r.fields[3];
        let hash = if registry.contains_key(member) {
            member.to_owned()
        } else {
            codec.encode(member)?.to_owned()
        };

        let set = groups.entry(r.fields[0].clone()).or_default().entry(r.fields[1].clone()).or_default();
        match r.fields[2].to_lowercase().as_str() {
            "query" => set.queries.push(hash),
            "outgroup" => set.outgroups.push(hash),
            _ => bail!(DataError::UnknownRole(r.fields[2].clone())),
        }
    }
    Ok(groups)
}
