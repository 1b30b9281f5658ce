use colored::Colorize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("failed to open {}", .filename.bright_yellow().bold())]
    CannotOpen { source: std::io::Error, filename: String },

    #[error("{} not found", .0.bright_yellow().bold())]
    NotFound(String),

    #[error("while creating {filename}")]
    WhileCreating { source: std::io::Error, filename: String },
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("hash {} not found in the sample registry", .0.yellow().bold())]
    UnknownHash(String),

    #[error("invalid hash {}; expected HS<number>HE or - to assign one", .0.yellow().bold())]
    InvalidHash(String),

    #[error("unknown datatype {}; expected query, db or outgroup", .0.yellow().bold())]
    UnknownDatatype(String),

    #[error("unknown role {}; expected query or outgroup", .0.yellow().bold())]
    UnknownRole(String),

    #[error("malformed line {line} in {}", .file.yellow().bold())]
    MalformedLine { file: String, line: usize },

    #[error("leaves of {} and its alignment differ", .tree.yellow().bold())]
    AlignmentMismatch { tree: String },

    #[error("no outgroup leaf found in {}", .tree.yellow().bold())]
    NoOutgroup { tree: String },

    #[error("unable to root {} on its outgroup", .tree.yellow().bold())]
    UnrootableOutgroup { tree: String },
}

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("node {node} has {arity} children; a binary tree was expected")]
    NonBinary { node: usize, arity: usize },

    #[error("no clade left to join")]
    EmptyJoin,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(
        "genus {} has no concatenated tree in group {}",
        .genus.yellow().bold(),
        .group.yellow().bold()
    )]
    MissingConcatenated { genus: String, group: String },

    #[error(
        "tree {}/{} indexed twice for genus {}",
        .group.yellow().bold(),
        .gene.yellow().bold(),
        .genus.yellow().bold()
    )]
    DuplicateTreeInfo { genus: String, group: String, gene: String },

    #[error(
        "{} {} in {}/{} matches no placeholder of the concatenated tree",
        .genus,
        .label.yellow().bold(),
        .group,
        .gene
    )]
    UnmatchedPlaceholder { genus: String, group: String, gene: String, label: String },
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("{} tree interpretation unit(s) failed", .0.to_string().red().bold())]
    FailedUnits(usize),

    #[error("failed to interpret {}: {:#}", .tree.yellow().bold(), .cause)]
    FailedToInterpret { cause: anyhow::Error, tree: String },
}
