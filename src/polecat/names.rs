//! Polecat name allocation from a themed pool.
//!
//! Names are unique among the rig's live polecats (directories under
//! `<rig>/polecats/`). Once the pool is used up, names get a numeric suffix.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const FALLBACK_NAME: &str = "polecat";

/// Names of polecats that currently have a directory.
pub fn live_names(polecats_dir: &Path) -> BTreeSet<String> {
    let Ok(entries) = fs::read_dir(polecats_dir) else {
        return BTreeSet::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| !n.starts_with('.'))
        .collect()
}

#[derive(Debug, Clone)]
pub struct NamePool {
    names: Vec<String>,
}

impl NamePool {
    pub fn new(names: &[String]) -> Self {
        let mut seen = BTreeSet::new();
        let names = names
            .iter()
            .filter(|n| !n.is_empty() && seen.insert(n.as_str()))
            .cloned()
            .collect();
        Self { names }
    }

    /// First free name, then `<name>-2`, `<name>-3`, ... in pool order.
    pub fn allocate(&self, taken: &BTreeSet<String>) -> String {
        let base: Vec<&str> = if self.names.is_empty() {
            vec![FALLBACK_NAME]
        } else {
            self.names.iter().map(String::as_str).collect()
        };
        if let Some(name) = base.iter().find(|n| !taken.contains(**n)) {
            return (*name).to_string();
        }
        let mut suffix = 2usize;
        loop {
            for name in &base {
                let candidate = format!("{name}-{suffix}");
                if !taken.contains(&candidate) {
                    return candidate;
                }
            }
            suffix += 1;
        }
    }

    /// `count` pairwise-distinct names, none of them in `taken`.
    pub fn allocate_many(&self, taken: &BTreeSet<String>, count: usize) -> Vec<String> {
        let mut taken = taken.clone();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.allocate(&taken);
            taken.insert(name.clone());
            out.push(name);
        }
        out
    }
}
