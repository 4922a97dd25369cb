//! Drift detection: compare synthesized artifacts on disk to lock hashes.
//!
//! Templates are build outputs. A hash mismatch means someone edited the
//! artifact by hand (or a different config synthesized into the same output
//! directory) after the lock was written.

use crate::core::types::StackLock;
use crate::tripwire::hasher;
use std::path::Path;

/// A single drift finding.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub stack: String,
    pub template_file: String,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

/// Check one stack's template artifact against its lock.
pub fn check_stack_drift(lock: &StackLock) -> Option<DriftFinding> {
    let path = Path::new(&lock.template_file);
    let finding = |actual: String, detail: String| DriftFinding {
        stack: lock.stack.clone(),
        template_file: lock.template_file.clone(),
        expected_hash: lock.template_hash.clone(),
        actual_hash: actual,
        detail,
    };

    if !path.exists() {
        return Some(finding(
            "MISSING".to_string(),
            format!("{} does not exist", lock.template_file),
        ));
    }

    let actual = hasher::hash_file(path).unwrap_or_else(|e| format!("ERROR:{}", e));
    if actual == lock.template_hash {
        None
    } else {
        Some(finding(actual, format!("{} content changed", lock.template_file)))
    }
}

/// Check every lock.
pub fn detect_drift(locks: &[StackLock]) -> Vec<DriftFinding> {
    locks.iter().filter_map(check_stack_drift).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn lock_for(path: &Path, hash: &str) -> StackLock {
        StackLock {
            schema: "1.0".to_string(),
            stack: "MedianVPCStack".to_string(),
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            generator: "median-infra 0.3.0".to_string(),
            template_file: path.to_string_lossy().to_string(),
            template_hash: hash.to_string(),
            resources: IndexMap::new(),
        }
    }

    #[test]
    fn test_no_drift() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("MedianVPCStack.template.json");
        std::fs::write(&file, "{}").unwrap();
        let hash = hasher::hash_file(&file).unwrap();
        assert!(check_stack_drift(&lock_for(&file, &hash)).is_none());
    }

    #[test]
    fn test_content_drift() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("MedianVPCStack.template.json");
        std::fs::write(&file, "{}").unwrap();
        let hash = hasher::hash_file(&file).unwrap();
        std::fs::write(&file, "{\"edited\":true}").unwrap();

        let finding = check_stack_drift(&lock_for(&file, &hash)).unwrap();
        assert_eq!(finding.stack, "MedianVPCStack");
        assert_ne!(finding.actual_hash, finding.expected_hash);
        assert!(finding.detail.contains("content changed"));
    }

    #[test]
    fn test_missing_artifact() {
        let lock = lock_for(Path::new("/nonexistent/x.template.json"), "blake3:abc");
        let finding = check_stack_drift(&lock).unwrap();
        assert_eq!(finding.actual_hash, "MISSING");
    }

    #[test]
    fn test_detect_drift_collects() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("ok.json");
        std::fs::write(&ok, "{}").unwrap();
        let ok_hash = hasher::hash_file(&ok).unwrap();
        let locks = vec![
            lock_for(&ok, &ok_hash),
            lock_for(&dir.path().join("gone.json"), "blake3:abc"),
        ];
        let findings = detect_drift(&locks);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].actual_hash, "MISSING");
    }
}
