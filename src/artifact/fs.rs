use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Local, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{ArtifactKind, ArtifactRef, ArtifactStore};
use crate::errors::StoreError;

/// Upper bound on `-N` suffixes tried when a time-qualified name is taken.
const MAX_NAME_COLLISIONS: u32 = 1000;

/// Artifact store backed by a single flat directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (creating if needed) the artifact directory.
    ///
    /// The root is canonicalized because the sandbox bind-mounts it and
    /// container runtimes reject relative mount sources.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|source| StoreError::WriteFailed {
            path: root.to_path_buf(),
            source,
        })?;
        let root = root
            .canonicalize()
            .map_err(|source| StoreError::ReadFailed {
                path: root.to_path_buf(),
                source,
            })?;
        Ok(Self { root })
    }

    fn artifact(&self, kind: ArtifactKind, name: String) -> ArtifactRef {
        ArtifactRef {
            kind,
            path: self.root.join(&name),
            name,
        }
    }

    /// Write `content` to a hidden temp file, then hard-link it into place.
    ///
    /// `hard_link` fails when the target exists, so a name is claimed and
    /// populated in one step: readers never see a partial file and concurrent
    /// writers never clobber each other.
    fn write_atomic(
        &self,
        kind: ArtifactKind,
        stamp: &str,
        content: &str,
    ) -> Result<ArtifactRef, StoreError> {
        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        let write_tmp = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()
        };
        if let Err(source) = write_tmp() {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::WriteFailed { path: tmp, source });
        }

        let result = self.claim_name(kind, stamp, &tmp);
        let _ = fs::remove_file(&tmp);
        result
    }

    fn claim_name(
        &self,
        kind: ArtifactKind,
        stamp: &str,
        tmp: &Path,
    ) -> Result<ArtifactRef, StoreError> {
        for n in 0..MAX_NAME_COLLISIONS {
            let name = if n == 0 {
                format!("{}{}.{}", kind.prefix(), stamp, kind.extension())
            } else {
                format!("{}{}-{}.{}", kind.prefix(), stamp, n, kind.extension())
            };
            let artifact = self.artifact(kind, name);
            match fs::hard_link(tmp, &artifact.path) {
                Ok(()) => {
                    debug!(artifact = %artifact.name, "artifact written");
                    return Ok(artifact);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(StoreError::WriteFailed {
                        path: artifact.path,
                        source,
                    });
                }
            }
        }
        Err(StoreError::WriteFailed {
            path: self.root.join(format!("{}{}", kind.prefix(), stamp)),
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "no free artifact name for this timestamp",
            ),
        })
    }

    fn scan(&self, kind: ArtifactKind) -> Result<Vec<(SystemTime, ArtifactRef)>, StoreError> {
        let pattern = format!(
            "{}/{}*.{}",
            glob::Pattern::escape(&self.root.to_string_lossy()),
            kind.prefix(),
            kind.extension()
        );
        let entries = glob::glob(&pattern).map_err(|e| StoreError::Scan(e.to_string()))?;

        let mut found = Vec::new();
        for path in entries.filter_map(|entry| entry.ok()) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !kind.matches(name) {
                continue;
            }
            let Ok(meta) = path.metadata() else {
                // Removed between the listing and the stat.
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((created, self.artifact(kind, name.to_string())));
        }
        // Newest first; the name breaks ties between same-instant writes.
        found.sort_by(|(a_time, a), (b_time, b)| b_time.cmp(a_time).then(b.name.cmp(&a.name)));
        Ok(found)
    }
}

fn wall_clock_stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S%3f").to_string()
}

impl ArtifactStore for FsArtifactStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn put(&self, kind: ArtifactKind, content: &str) -> Result<ArtifactRef, StoreError> {
        let stamp = match kind {
            ArtifactKind::Plan => Utc::now().timestamp_millis().to_string(),
            ArtifactKind::Program => wall_clock_stamp(),
        };
        self.write_atomic(kind, &stamp, content)
    }

    fn put_program(
        &self,
        content: &str,
        plan: Option<&ArtifactRef>,
    ) -> Result<ArtifactRef, StoreError> {
        let stamp = plan
            .filter(|p| p.kind == ArtifactKind::Plan)
            .and_then(|p| p.stamp())
            .map(str::to_string)
            .unwrap_or_else(wall_clock_stamp);
        self.write_atomic(ArtifactKind::Program, &stamp, content)
    }

    fn latest(&self, kind: ArtifactKind) -> Result<ArtifactRef, StoreError> {
        self.scan(kind)?
            .into_iter()
            .next()
            .map(|(_, artifact)| artifact)
            .ok_or_else(|| StoreError::NoneOfKind {
                kind: kind.label(),
                dir: self.root.clone(),
            })
    }

    fn list(&self, kind: ArtifactKind) -> Result<Vec<ArtifactRef>, StoreError> {
        Ok(self.scan(kind)?.into_iter().map(|(_, a)| a).collect())
    }

    fn exists(&self, artifact: &ArtifactRef) -> bool {
        artifact.path.is_file()
    }

    fn read(&self, artifact: &ArtifactRef) -> Result<String, StoreError> {
        fs::read_to_string(&artifact.path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    name: artifact.name.clone(),
                }
            } else {
                StoreError::ReadFailed {
                    path: artifact.path.clone(),
                    source,
                }
            }
        })
    }

    fn resolve(&self, kind: ArtifactKind, name: &str) -> Result<ArtifactRef, StoreError> {
        if name.contains(['/', '\\']) || name.contains("..") || !kind.matches(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let artifact = self.artifact(kind, name.to_string());
        if !self.exists(&artifact) {
            return Err(StoreError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn open(dir: &Path) -> FsArtifactStore {
        FsArtifactStore::open(dir.join("artifacts")).unwrap()
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert!(store.root().is_dir());
        assert!(store.root().is_absolute());
    }

    #[test]
    fn test_put_then_read() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let plan = store.put(ArtifactKind::Plan, "{\"a\": 1}").unwrap();
        assert!(plan.name.starts_with("plan_"));
        assert!(plan.name.ends_with(".json"));
        assert!(store.exists(&plan));
        assert_eq!(store.read(&plan).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_put_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(ArtifactKind::Program, "print(1)").unwrap();
        let leftovers: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_latest_picks_newest() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let _first = store.put(ArtifactKind::Plan, "first").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let second = store.put(ArtifactKind::Plan, "second").unwrap();
        let latest = store.latest(ArtifactKind::Plan).unwrap();
        assert_eq!(latest, second);
        assert_eq!(store.read(&latest).unwrap(), "second");
    }

    #[test]
    fn test_latest_ignores_other_kind() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let plan = store.put(ArtifactKind::Plan, "{}").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        store.put(ArtifactKind::Program, "print(1)").unwrap();
        assert_eq!(store.latest(ArtifactKind::Plan).unwrap(), plan);
    }

    #[test]
    fn test_latest_empty_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let err = store.latest(ArtifactKind::Program).unwrap_err();
        assert!(matches!(err, StoreError::NoneOfKind { kind: "program", .. }));
    }

    #[test]
    fn test_list_newest_first() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = store.put(ArtifactKind::Plan, "a").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let b = store.put(ArtifactKind::Plan, "b").unwrap();
        let listed = store.list(ArtifactKind::Plan).unwrap();
        assert_eq!(listed, vec![b, a]);
    }

    #[test]
    fn test_concurrent_puts_never_collide() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .put(ArtifactKind::Plan, &format!("content-{}", i))
                        .unwrap()
                })
            })
            .collect();
        let refs: Vec<ArtifactRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);

        let mut contents: Vec<String> = refs.iter().map(|r| store.read(r).unwrap()).collect();
        contents.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("content-{}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_put_program_reuses_plan_stamp() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let plan = store.put(ArtifactKind::Plan, "{}").unwrap();
        let program = store.put_program("print(2)", Some(&plan)).unwrap();
        assert_eq!(program.stamp(), plan.stamp());
        assert_eq!(program.kind, ArtifactKind::Program);
    }

    #[test]
    fn test_put_program_same_plan_twice_gets_suffix() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let plan = store.put(ArtifactKind::Plan, "{}").unwrap();
        let first = store.put_program("print(1)", Some(&plan)).unwrap();
        let second = store.put_program("print(2)", Some(&plan)).unwrap();
        assert_ne!(first.name, second.name);
        assert!(second.name.ends_with("-1.py"));
        assert_eq!(store.read(&first).unwrap(), "print(1)");
    }

    #[test]
    fn test_put_program_without_plan_uses_wall_clock() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let program = store.put_program("print(1)", None).unwrap();
        let stamp = program.stamp().unwrap();
        // %Y%m%d_%H%M%S%3f
        assert_eq!(stamp.len(), 18);
        assert_eq!(&stamp[8..9], "_");
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let ghost = ArtifactRef {
            kind: ArtifactKind::Program,
            name: "output_0.py".into(),
            path: store.root().join("output_0.py"),
        };
        assert!(!store.exists(&ghost));
        assert!(matches!(
            store.read(&ghost),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_traversal_and_wrong_kind() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert!(matches!(
            store.resolve(ArtifactKind::Program, "../output_1.py"),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.resolve(ArtifactKind::Program, "plan_1.json"),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.resolve(ArtifactKind::Program, "output_1.py"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_existing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let program = store.put_program("print(1)", None).unwrap();
        let resolved = store
            .resolve(ArtifactKind::Program, &program.name)
            .unwrap();
        assert_eq!(resolved, program);
    }
}
