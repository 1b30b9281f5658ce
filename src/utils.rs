use anyhow::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use crate::errors::FileError;

/// A non-empty, non-comment line of a tab-separated file, with its 1-based line number.
#[derive(Debug)]
pub struct TsvRecord {
    pub line: usize,
    pub fields: Vec<String>,
}

pub fn read_tsv<P: AsRef<Path>>(filename: P) -> Result<Vec<TsvRecord>> {
    let filename = filename.as_ref();
    let f = File::open(filename).map_err(|source| FileError::CannotOpen {
        source,
        filename: filename.display().to_string(),
    })?;

    let mut r = Vec::new();
    for (i, l) in BufReader::new(f).lines().enumerate() {
        let l = l.with_context(|| format!("while reading {}", filename.display()))?;
        let l = l.trim_end_matches('\r');
        if l.trim().is_empty() || l.starts_with('#') {
            continue;
        }
        r.push(TsvRecord {
            line: i + 1,
            fields: l.split('\t').map(|s| s.trim().to_owned()).collect(),
        });
    }
    Ok(r)
}

pub fn create_file<P: AsRef<Path>>(filename: P) -> Result<BufWriter<File>> {
    let filename = filename.as_ref();
    let f = File::create(filename).map_err(|source| FileError::WhileCreating {
        source,
        filename: filename.display().to_string(),
    })?;
    Ok(BufWriter::new(f))
}

pub fn xml_escape(s: &str) -> String {
    let mut r = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => r.push_str("&amp;"),
            '<' => r.push_str("&lt;"),
            '>' => r.push_str("&gt;"),
            '"' => r.push_str("&quot;"),
            '\'' => r.push_str("&apos;"),
            c => r.push(c),
        }
    }
    r
}
