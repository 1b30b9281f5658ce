use anyhow::*;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::*;
use rayon::prelude::*;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::dataset::{Dataset, Registry};
use crate::errors::RuntimeError;
use crate::hasher::HashCodec;
use crate::render::{render_collapsed, render_tree, VisualStyle};
use crate::report::{collect_reports, Singlereport};
use crate::synchronize::{synchronize, EmptyMatchPolicy, SyncSummary};
use crate::tree_info::{LeafMeta, TaskInput, TreeInfo, CONCATENATED};
use crate::utils::create_file;

/// From this verbosity on, trees are interpreted one after the other
pub const SERIAL_VERBOSITY: LevelFilter = LevelFilter::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Identification,
    Validation,
}
impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "identification" => Ok(Mode::Identification),
            "validation" => Ok(Mode::Validation),
            _ => bail!("unknown mode `{}`; expected identification or validation", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub runname: String,
    pub threads: usize,
    pub verbosity: LevelFilter,
    pub mode: Mode,
    pub solve_flat: bool,
    pub concatenate: bool,
    pub query_only: bool,
    pub collapse_distance_cutoff: f64,
    pub empty_match: EmptyMatchPolicy,
    pub style: VisualStyle,
}
impl Default for Settings {
    fn default() -> Self {
        Settings {
            runname: "run".into(),
            threads: 0,
            verbosity: LevelFilter::Warn,
            mode: Mode::Identification,
            solve_flat: true,
            concatenate: true,
            query_only: true,
            collapse_distance_cutoff: 0.01,
            empty_match: EmptyMatchPolicy::Keep,
            style: VisualStyle::default(),
        }
    }
}

/// Where every file of a run lives.
pub struct Paths {
    pub outdir: PathBuf,
    pub runname: String,
}
impl Paths {
    pub fn new<P: AsRef<Path>>(outdir: P, runname: &str) -> Paths {
        Paths { outdir: outdir.as_ref().to_owned(), runname: runname.to_owned() }
    }

    pub fn tree_dir(&self) -> PathBuf {
        self.outdir.join("tree")
    }

    pub fn tree_file(&self, group: &str, gene: &str) -> PathBuf {
        self.tree_dir().join("hash").join(format!("hash_{}_{}_{}.nwk", self.runname, group, gene))
    }

    pub fn alignment_file(&self, group: &str, gene: &str) -> PathBuf {
        self.outdir.join("alignment").join(format!("{}_hash_trimmed_{}_{}.fasta", self.runname, group, gene))
    }

    pub fn hash_image(&self, group: &str, gene: &str) -> PathBuf {
        self.tree_dir().join(format!("hash_{}_{}_{}_original.svg", self.runname, group, gene))
    }

    pub fn image(&self, group: &str, gene: &str) -> PathBuf {
        self.tree_dir().join(format!("{}_{}_{}_original.svg", self.runname, group, gene))
    }

    pub fn collapsed_image(&self, group: &str, gene: &str) -> PathBuf {
        self.tree_dir().join(format!("{}_{}_{}.svg", self.runname, group, gene))
    }

    pub fn newick_out(&self, group: &str, gene: &str) -> PathBuf {
        self.tree_dir().join(format!("{}_{}_{}.nwk", self.runname, group, gene))
    }

    pub fn report(&self) -> PathBuf {
        self.outdir.join(format!("{}.report.tsv", self.runname))
    }

    pub fn identification(&self) -> PathBuf {
        self.outdir.join(format!("{}.identification.tsv", self.runname))
    }
}

/// Builds the self-contained input of every (group, gene) tree to interpret.
pub fn make_tasks(dataset: &Dataset, paths: &Paths, settings: &Settings) -> Vec<TaskInput> {
    let mut tasks = Vec::new();
    for (group, genes) in dataset.groups.iter() {
        for (gene, members) in genes.iter() {
            if members.queries.is_empty() && settings.query_only {
                debug!("skipping {}/{}: no query", group, gene);
                continue;
            }
            let db = dataset.db_list(members);
            let leaves = members
                .queries
                .iter()
                .chain(members.outgroups.iter())
                .chain(db.iter())
                .filter_map(|h| dataset.registry.get(h))
                .map(|fi| {
                    (
                        fi.hash.clone(),
                        LeafMeta {
                            original_id: fi.original_id.clone(),
                            datatype: fi.datatype,
                            genus: fi.genus.clone(),
                            species: fi.species_for(gene).to_owned(),
                            ori_species: fi.ori_species.clone(),
                        },
                    )
                })
                .collect::<HashMap<_, _>>();

            tasks.push(TaskInput {
                group: group.clone(),
                gene: gene.clone(),
                tree_file: paths.tree_file(group, gene),
                alignment_file: paths.alignment_file(group, gene),
                hash_image: paths.hash_image(group, gene),
                image: paths.image(group, gene),
                collapsed_image: paths.collapsed_image(group, gene),
                newick_out: paths.newick_out(group, gene),
                query: members.queries.clone(),
                outgroup: members.outgroups.clone(),
                db,
                leaves,
            });
        }
    }
    tasks
}

/// Turns a single tree into collapsed, named clades.
pub fn interpret(task: &TaskInput, settings: &Settings) -> Result<TreeInfo> {
    info!("Interpreting {}/{}", task.group, task.gene);
    let mut info = TreeInfo::load(task)?;
    info.calculate_zero(&task.alignment_file)?;
    info.reroot_outgroup()?;

    render_tree(&info.tree, &task.hash_image, &settings.style)?;
    let codec = HashCodec::from_pairs(task.leaves.iter().map(|(h, m)| (h.as_str(), m.original_id.as_str())));
    codec.decode_file(&task.hash_image, &task.image, true)?;

    if settings.mode == Mode::Validation {
        info.reserve_sp();
    }
    if settings.solve_flat {
        info.reconstruct()?;
    }
    info.tree.ladderize(true);
    info.tree_search(settings.collapse_distance_cutoff, settings.mode == Mode::Validation)?;

    let mut out = create_file(&task.newick_out)?;
    writeln!(out, "{}", info.tree.to_newick())?;
    out.flush()?;
    Ok(info)
}

fn interpret_all(tasks: &[TaskInput], settings: &Settings) -> Result<Vec<std::result::Result<TreeInfo, RuntimeError>>> {
    let run = |task: &TaskInput| {
        interpret(task, settings).map_err(|cause| RuntimeError::FailedToInterpret {
            cause,
            tree: format!("{}/{}", task.group, task.gene),
        })
    };

    if settings.verbosity >= SERIAL_VERBOSITY {
        info!("Interpreting {} trees serially", tasks.len());
        return Ok(tasks.iter().map(run).collect());
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(settings.threads).build()?;
    info!("Interpreting {} trees on {} threads", tasks.len(), pool.current_num_threads());
    let bar = if atty::is(atty::Stream::Stdout) {
        ProgressBar::new(tasks.len() as u64)
            .with_style(ProgressStyle::default_bar().template("{msg} {bar:40} {pos}/{len} ({eta})"))
            .with_message("Trees")
    } else {
        ProgressBar::hidden()
    };
    let results = pool.install(|| tasks.par_iter().progress_with(bar.clone()).map(run).collect::<Vec<_>>());
    bar.finish_and_clear();
    Ok(results)
}

/// Folds the reports of every tree back into the sample registry.
pub fn fold_reports(registry: &mut Registry, reports: &[Singlereport], concatenate: bool) {
    for r in reports {
        if let Some(fi) = registry.get_mut(&r.hash) {
            if r.gene == CONCATENATED || !concatenate {
                fi.final_species = Some(r.species_assigned.clone());
                fi.species_identifier = r.ambiguous;
            } else {
                fi.bygene_species.insert(r.gene.clone(), r.species_assigned.clone());
            }
            if r.flat {
                fi.flat.push(r.gene.clone());
            }
        } else {
            warn!("{} reported in {}/{} but absent from the samples", r.hash, r.group, r.gene);
        }
    }
}

/// Interprets, synchronizes and draws every tree, then updates the registry.
pub fn run(dataset: &mut Dataset, paths: &Paths, settings: &Settings) -> Result<(Vec<Singlereport>, SyncSummary)> {
    let tasks = make_tasks(dataset, paths, settings);
    if tasks.is_empty() {
        warn!("No tree to interpret");
    }

    let mut infos = Vec::with_capacity(tasks.len());
    let mut failed = 0;
    for result in interpret_all(&tasks, settings)? {
        match result {
            std::result::Result::Ok(info) => infos.push(info),
            Err(e) => {
                error!("{}", e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!(RuntimeError::FailedUnits(failed));
    }

    let summary = synchronize(&mut infos, settings.empty_match)?;

    let mut reports = Vec::new();
    for (task, info) in tasks.iter().zip(infos.iter()) {
        render_collapsed(info, &task.collapsed_image, &settings.style)
            .with_context(|| format!("while drawing {}", task.collapsed_image.display()))?;
        reports.extend(collect_reports(info));
    }
    fold_reports(&mut dataset.registry, &reports, settings.concatenate);
    info!("{} reports over {} trees", reports.len(), infos.len());
    Ok((reports, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Datatype, FunInfo};
    use crate::delimit::Taxon;
    use std::collections::BTreeMap;

    fn report(gene: &str, assigned: &str, flat: bool) -> Singlereport {
        Singlereport {
            id: "Q1".into(),
            hash: "HS1HE".into(),
            group: "G1".into(),
            gene: gene.into(),
            species_original: Taxon::new("Fusarium", ""),
            species_assigned: assigned.into(),
            ambiguous: 1,
            clade_index: None,
            flat,
        }
    }

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.insert(
            "HS1HE".into(),
            FunInfo {
                hash: "HS1HE".into(),
                original_id: "Q1".into(),
                datatype: Datatype::Query,
                genus: "Fusarium".into(),
                ori_species: "".into(),
                bygene_species: BTreeMap::new(),
                final_species: None,
                species_identifier: 0,
                flat: Vec::new(),
            },
        );
        r
    }

    #[test]
    fn concatenated_results_are_final() {
        let mut r = registry();
        fold_reports(
            &mut r,
            &[report(CONCATENATED, "Fusarium sp. 1", true), report("ITS", "Fusarium sp. 1/sp. 2", false)],
            true,
        );
        let fi = &r["HS1HE"];
        assert_eq!(fi.final_species.as_deref(), Some("Fusarium sp. 1"));
        assert_eq!(fi.bygene_species["ITS"], "Fusarium sp. 1/sp. 2");
        assert_eq!(fi.flat, vec![CONCATENATED]);
    }

    #[test]
    fn without_concatenation_every_gene_is_final() {
        let mut r = registry();
        fold_reports(&mut r, &[report("ITS", "Fusarium oxysporum", true)], false);
        let fi = &r["HS1HE"];
        assert_eq!(fi.final_species.as_deref(), Some("Fusarium oxysporum"));
        assert_eq!(fi.species_identifier, 1);
        assert_eq!(fi.flat, vec!["ITS"]);
    }

    #[test]
    fn paths_follow_the_run_layout() {
        let p = Paths::new("/out", "run");
        assert_eq!(p.tree_file("G1", "ITS"), PathBuf::from("/out/tree/hash/hash_run_G1_ITS.nwk"));
        assert_eq!(p.alignment_file("G1", "ITS"), PathBuf::from("/out/alignment/run_hash_trimmed_G1_ITS.fasta"));
        assert_eq!(p.collapsed_image("G1", CONCATENATED), PathBuf::from("/out/tree/run_G1_concatenated.svg"));
    }

    #[test]
    fn missing_tree_is_reported_per_unit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), "run");
        let task = TaskInput {
            group: "G1".into(),
            gene: "ITS".into(),
            tree_file: paths.tree_file("G1", "ITS"),
            alignment_file: paths.alignment_file("G1", "ITS"),
            hash_image: paths.hash_image("G1", "ITS"),
            image: paths.image("G1", "ITS"),
            collapsed_image: paths.collapsed_image("G1", "ITS"),
            newick_out: paths.newick_out("G1", "ITS"),
            query: vec![],
            outgroup: vec![],
            db: vec![],
            leaves: HashMap::new(),
        };
        let settings = Settings { verbosity: LevelFilter::Trace, ..Default::default() };
        let results = interpret_all(&[task], &settings).unwrap();
        assert!(matches!(&results[0], Err(RuntimeError::FailedToInterpret { .. })));
    }

    #[test]
    fn whole_run_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("tree/hash")).unwrap();
        std::fs::create_dir_all(root.join("alignment")).unwrap();
        std::fs::write(
            root.join("samples.tsv"),
            "HS1HE\tO-1\toutgroup\tNeo\trubi\nHS2HE\tO-2\toutgroup\tNeo\trubi\nHS3HE\tCBS 1\tdb\tFusarium\toxysporum\nHS4HE\tQ-1\tquery\tFusarium\t\nHS5HE\tQ-2\tquery\tFusarium\t\n",
        )
        .unwrap();
        std::fs::write(
            root.join("dataset.tsv"),
            "G1\tconcatenated\tquery\tHS4HE\nG1\tconcatenated\tquery\tHS5HE\nG1\tconcatenated\toutgroup\tHS1HE\nG1\tconcatenated\toutgroup\tHS2HE\n",
        )
        .unwrap();
        std::fs::write(
            root.join("tree/hash/hash_run_G1_concatenated.nwk"),
            "((HS1HE:0.5,HS2HE:0.5):0.1,(HS3HE:0.2,(HS4HE:0.001,HS5HE:0.001):0.2):0.1);",
        )
        .unwrap();
        std::fs::write(
            root.join("alignment/run_hash_trimmed_G1_concatenated.fasta"),
            ">HS1HE\nAAAAAAAA\n>HS2HE\nAAAAAAAT\n>HS3HE\nCCCCCCCC\n>HS4HE\nGGGGGGGG\n>HS5HE\nGGGGGGGC\n",
        )
        .unwrap();

        let mut codec = HashCodec::new();
        let mut dataset = Dataset::load(root.join("samples.tsv"), root.join("dataset.tsv"), &mut codec).unwrap();
        let paths = Paths::new(root, "run");
        let settings = Settings { runname: "run".into(), threads: 2, ..Default::default() };
        let (reports, summary) = run(&mut dataset, &paths, &settings).unwrap();

        assert_eq!(reports.len(), 5);
        assert_eq!(dataset.registry["HS4HE"].final_species.as_deref(), Some("Fusarium sp. 1"));
        assert_eq!(dataset.registry["HS3HE"].final_species.as_deref(), Some("Fusarium oxysporum"));
        assert_eq!(summary.offsets["Fusarium"], 1);
        assert!(paths.image("G1", CONCATENATED).exists());
        let decoded = std::fs::read_to_string(paths.image("G1", CONCATENATED)).unwrap();
        assert!(decoded.contains("CBS 1") && !decoded.contains("HS3HE"));
        assert!(paths.collapsed_image("G1", CONCATENATED).exists());
        assert!(paths.newick_out("G1", CONCATENATED).exists());
    }
}
