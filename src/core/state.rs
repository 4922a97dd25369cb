//! Lock file management: load, save (atomic), path derivation, and the
//! launch-template version ledger.

use super::app::Stack;
use super::template::CfnResource;
use super::types::{ResourceLock, StackLock};
use crate::error::{InfraError, Result};
use crate::tripwire::hasher;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "state.lock.yaml";

/// Resource types whose every change publishes a new immutable version.
pub const VERSIONED_TYPES: &[&str] = &["AWS::EC2::LaunchTemplate"];

/// Derive the lock file path for a stack within the state directory.
pub fn lock_file_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join(LOCK_FILE)
}

/// Load a lock file for a stack. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, stack: &str) -> Result<Option<StackLock>> {
    let path = lock_file_path(state_dir, stack);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|source| InfraError::Read {
        path: path.clone(),
        source,
    })?;
    Ok(Some(serde_yaml_ng::from_str(&content)?))
}

/// Load every lock under the state directory, sorted by stack name.
pub fn load_all_locks(state_dir: &Path) -> Result<IndexMap<String, StackLock>> {
    let mut locks = IndexMap::new();
    if !state_dir.is_dir() {
        return Ok(locks);
    }
    let entries = std::fs::read_dir(state_dir).map_err(|source| InfraError::Read {
        path: state_dir.to_path_buf(),
        source,
    })?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join(LOCK_FILE).is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    for name in names {
        if let Some(lock) = load_lock(state_dir, &name)? {
            locks.insert(name, lock);
        }
    }
    Ok(locks)
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StackLock) -> Result<()> {
    let path = lock_file_path(state_dir, &lock.stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| InfraError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let yaml = serde_yaml_ng::to_string(lock)?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml).map_err(|source| InfraError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, &path).map_err(|source| InfraError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Remove a stack's lock file and its directory if that leaves it empty.
pub fn remove_lock(state_dir: &Path, stack: &str) -> Result<()> {
    let path = lock_file_path(state_dir, stack);
    if path.exists() {
        std::fs::remove_file(&path).map_err(|source| InfraError::Write {
            path: path.clone(),
            source,
        })?;
    }
    if let Some(dir) = path.parent() {
        let empty = std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
        if empty {
            std::fs::remove_dir(dir).map_err(|source| InfraError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

/// Hash of one resource declaration.
pub fn resource_hash(resource: &CfnResource) -> Result<String> {
    hasher::hash_json(resource)
}

pub fn is_versioned(resource_type: &str) -> bool {
    VERSIONED_TYPES.contains(&resource_type)
}

/// Version a versioned resource will have: unchanged keeps its number,
/// changed bumps it, new starts at 1.
pub fn next_version(previous: Option<&ResourceLock>, hash: &str) -> u32 {
    match previous {
        None => 1,
        Some(prev) => {
            let current = prev.version.unwrap_or(1);
            if prev.hash == hash {
                current
            } else {
                current + 1
            }
        }
    }
}

/// Build the lock for a synthesized stack, carrying version numbers forward
/// from the previous lock.
pub fn build_lock(
    stack: &Stack,
    template_file: &str,
    template_hash: &str,
    previous: Option<&StackLock>,
) -> Result<StackLock> {
    use crate::tripwire::eventlog::now_iso8601;

    let mut resources = IndexMap::new();
    for (id, resource) in &stack.template.resources {
        let hash = resource_hash(resource)?;
        let version = if is_versioned(&resource.resource_type) {
            let prev = previous.and_then(|l| l.resources.get(id));
            Some(next_version(prev, &hash))
        } else {
            None
        };
        resources.insert(
            id.clone(),
            ResourceLock {
                resource_type: resource.resource_type.clone(),
                hash,
                version,
            },
        );
    }

    Ok(StackLock {
        schema: "1.0".to_string(),
        stack: stack.name.clone(),
        generated_at: now_iso8601(),
        generator: format!("median-infra {}", env!("CARGO_PKG_VERSION")),
        template_file: template_file.to_string(),
        template_hash: template_hash.to_string(),
        resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::template::Template;
    use serde_json::json;

    fn make_lock() -> StackLock {
        let mut resources = IndexMap::new();
        resources.insert(
            "Vpc".to_string(),
            ResourceLock {
                resource_type: "AWS::EC2::VPC".to_string(),
                hash: "blake3:abc123".to_string(),
                version: None,
            },
        );
        StackLock {
            schema: "1.0".to_string(),
            stack: "MedianVPCStack".to_string(),
            generated_at: "2026-02-16T14:00:00Z".to_string(),
            generator: "median-infra 0.3.0".to_string(),
            template_file: "cdk.out/MedianVPCStack.template.json".to_string(),
            template_hash: "blake3:def".to_string(),
            resources,
        }
    }

    fn stack_with_template(data: serde_json::Value) -> Stack {
        let mut template = Template::new(None);
        template.resources.insert(
            "Lt".to_string(),
            CfnResource::new("AWS::EC2::LaunchTemplate", json!({ "LaunchTemplateData": data })),
        );
        template
            .resources
            .insert("Vpc".to_string(), CfnResource::new("AWS::EC2::VPC", json!({})));
        Stack {
            name: "Web".to_string(),
            template,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_lock_file_path() {
        let p = lock_file_path(Path::new("/state"), "MedianVPCStack");
        assert_eq!(p, PathBuf::from("/state/MedianVPCStack/state.lock.yaml"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();
        let loaded = load_lock(dir.path(), "MedianVPCStack").unwrap().unwrap();
        assert_eq!(loaded.stack, "MedianVPCStack");
        assert_eq!(loaded.resources["Vpc"].hash, "blake3:abc123");
    }

    #[test]
    fn test_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_lock(dir.path(), "ghost").unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_cleans_tmp() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();
        let tmp = dir.path().join("MedianVPCStack").join("state.lock.yaml.tmp");
        assert!(!tmp.exists());
        assert!(lock_file_path(dir.path(), "MedianVPCStack").exists());
    }

    #[test]
    fn test_load_all_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = make_lock();
        b.stack = "B".to_string();
        let mut a = make_lock();
        a.stack = "A".to_string();
        save_lock(dir.path(), &b).unwrap();
        save_lock(dir.path(), &a).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        let locks = load_all_locks(dir.path()).unwrap();
        let names: Vec<_> = locks.keys().collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_remove_lock() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();
        remove_lock(dir.path(), "MedianVPCStack").unwrap();
        assert!(!dir.path().join("MedianVPCStack").exists());
        assert!(load_all_locks(dir.path()).unwrap().is_empty());
        remove_lock(dir.path(), "MedianVPCStack").unwrap();
    }

    #[test]
    fn test_load_all_missing_dir() {
        let locks = load_all_locks(Path::new("/nonexistent/state")).unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn test_next_version() {
        let prev = ResourceLock {
            resource_type: "AWS::EC2::LaunchTemplate".to_string(),
            hash: "blake3:old".to_string(),
            version: Some(4),
        };
        assert_eq!(next_version(None, "blake3:x"), 1);
        assert_eq!(next_version(Some(&prev), "blake3:old"), 4);
        assert_eq!(next_version(Some(&prev), "blake3:new"), 5);
    }

    #[test]
    fn test_build_lock_versions_launch_templates_only() {
        let stack = stack_with_template(json!({ "InstanceType": "t2.micro" }));
        let first = build_lock(&stack, "out/Web.template.json", "blake3:t", None).unwrap();
        assert_eq!(first.resources["Lt"].version, Some(1));
        assert_eq!(first.resources["Vpc"].version, None);

        let same = build_lock(&stack, "out/Web.template.json", "blake3:t", Some(&first)).unwrap();
        assert_eq!(same.resources["Lt"].version, Some(1));

        let changed = stack_with_template(json!({ "InstanceType": "t3.small" }));
        let second = build_lock(&changed, "out/Web.template.json", "blake3:u", Some(&same)).unwrap();
        assert_eq!(second.resources["Lt"].version, Some(2));
        assert_eq!(second.resources["Vpc"].hash, first.resources["Vpc"].hash);
    }
}
