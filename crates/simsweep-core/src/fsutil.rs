use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Sibling path used to stage a write before it is renamed over `path`.
///
/// Staging names start with a dot and carry pid, timestamp and a
/// process-wide sequence so concurrent writers never share one.
pub fn staging_path(path: &Path, kind: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(
        ".{}.{}.{}.{}.{}",
        name,
        kind,
        std::process::id(),
        Utc::now().timestamp_micros(),
        seq
    ))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = staging_path(path, "tmp");
    let staged = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_parent(path);
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub(crate) fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest over the compact JSON encoding. Object keys are sorted by
/// `serde_json::Map`, so callers that care about order must encode it
/// as arrays.
pub fn canonical_json_digest(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "simsweep_fsutil_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_staging_files() {
        let root = temp_root("replace");
        let target = root.join("record.json");
        atomic_write_bytes(&target, b"first").expect("first write");
        atomic_write_bytes(&target, b"second").expect("second write");
        assert_eq!(fs::read(&target).expect("read"), b"second");
        let leftovers: Vec<_> = fs::read_dir(&root)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "staging files left behind");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn staging_paths_are_unique_within_a_process() {
        let target = PathBuf::from("/tmp/x/run_status.json");
        let a = staging_path(&target, "tmp");
        let b = staging_path(&target, "tmp");
        assert_ne!(a, b);
        assert_eq!(a.parent(), target.parent());
    }

    #[test]
    fn digest_is_stable_and_prefixed() {
        let v = json!({"b": 1, "a": [1, 2]});
        let d1 = canonical_json_digest(&v).expect("digest");
        let d2 = canonical_json_digest(&json!({"a": [1, 2], "b": 1})).expect("digest");
        assert_eq!(d1, d2);
        assert!(d1.starts_with("sha256:"));
        let reordered = canonical_json_digest(&json!({"a": [2, 1], "b": 1})).expect("digest");
        assert_ne!(d1, reordered);
        assert_ne!(d1, sha256_bytes(b""));
    }
}
