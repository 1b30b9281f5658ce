use anyhow::*;
use regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::errors::{DataError, FileError};
use crate::utils::{create_file, xml_escape};

const HASH_PREFIX: &str = "HS";
const HASH_SUFFIX: &str = "HE";

/// Bidirectional mapping between sample identifiers and the opaque,
/// filename-safe hashes used while building trees.
pub struct HashCodec {
    to_id: HashMap<String, String>,
    to_hash: HashMap<String, String>,
    next: usize,
    token: Regex,
}

impl HashCodec {
    pub fn new() -> HashCodec {
        HashCodec {
            to_id: HashMap::new(),
            to_hash: HashMap::new(),
            next: 1,
            token: Regex::new(&format!(r"{}\d+{}", HASH_PREFIX, HASH_SUFFIX)).unwrap(),
        }
    }

    pub fn from_pairs<'a, I: IntoIterator<Item = (&'a str, &'a str)>>(pairs: I) -> HashCodec {
        let mut codec = HashCodec::new();
        for (hash, id) in pairs {
            codec.register(hash, id);
        }
        codec
    }

    /// Whether `s` is a whole hash token, i.e. something `decode_str` can find.
    pub fn is_hash(&self, s: &str) -> bool {
        self.token.find(s).map(|m| m.start() == 0 && m.end() == s.len()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.to_id.len()
    }

    /// Records an explicit `hash` for `id`.
    pub fn register(&mut self, hash: &str, id: &str) {
        self.to_id.insert(hash.to_owned(), id.to_owned());
        self.to_hash.insert(id.to_owned(), hash.to_owned());
    }

    /// Mints a fresh hash for `id`, or returns the one it already has.
    pub fn assign(&mut self, id: &str) -> String {
        if let Some(h) = self.to_hash.get(id) {
            return h.clone();
        }
        let hash = loop {
            let candidate = format!("{}{}{}", HASH_PREFIX, self.next, HASH_SUFFIX);
            self.next += 1;
            if !self.to_id.contains_key(&candidate) {
                break candidate;
            }
        };
        self.register(&hash, id);
        hash
    }

    pub fn encode(&self, id: &str) -> Result<&str> {
        self.to_hash
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| DataError::UnknownHash(id.to_owned()).into())
    }

    pub fn decode(&self, hash: &str) -> Option<&str> {
        self.to_id.get(hash).map(String::as_str)
    }

    /// Replaces every known hash in `s` by its identifier; unknown tokens are left as is.
    pub fn decode_str(&self, s: &str, escape: bool) -> String {
        self.token
            .replace_all(s, |caps: &regex::Captures| {
                let token = &caps[0];
                match self.decode(token) {
                    Some(id) if escape => xml_escape(id),
                    Some(id) => id.to_owned(),
                    None => token.to_owned(),
                }
            })
            .into_owned()
    }

    pub fn decode_file<P: AsRef<Path>, Q: AsRef<Path>>(&self, from: P, to: Q, escape: bool) -> Result<()> {
        let from = from.as_ref();
        let content = std::fs::read_to_string(from).map_err(|source| FileError::CannotOpen {
            source,
            filename: from.display().to_string(),
        })?;
        let mut out = create_file(to.as_ref())?;
        out.write_all(self.decode_str(&content, escape).as_bytes())?;
        Ok(out.flush()?)
    }
}

impl Default for HashCodec {
    fn default() -> Self {
        HashCodec::new()
    }
}
