//! Process-wide lock registry for file sinks
//!
//! Writers targeting the same path (in any form: relative, absolute) share one
//! async mutex, so batches from concurrent captures never interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

type Registry = Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>;

static LOCKS: OnceLock<Registry> = OnceLock::new();

/// The lock guarding `path`
pub fn path_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let registry = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(locks.entry(key).or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_shares_a_lock() {
        let a = path_lock(Path::new("target/lineage.jsonl"));
        let b = path_lock(&std::path::absolute("target/lineage.jsonl").unwrap());
        assert!(Arc::ptr_eq(&a, &b));

        let c = path_lock(Path::new("target/other.jsonl"));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
