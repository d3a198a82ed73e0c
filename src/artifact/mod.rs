//! Artifact store: the directory-backed namespace shared by all stages.
//!
//! Two kinds of records live side by side in one flat directory:
//!
//! | Kind      | Name                        | Content               |
//! |-----------|-----------------------------|-----------------------|
//! | `Plan`    | `plan_<unix-millis>.json`   | pretty-printed `Plan` |
//! | `Program` | `output_<stamp>.py`         | generated source text |
//!
//! A program's `<stamp>` is copied from the plan it was generated from when
//! that plan's name parses, so the two can be correlated by eye; otherwise it
//! is a wall-clock stamp. The store owns naming and placement, callers own
//! content.

mod fs;

pub use fs::FsArtifactStore;

use std::path::{Path, PathBuf};

use crate::errors::StoreError;

/// The two record kinds the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Plan,
    Program,
}

impl ArtifactKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Plan => "plan_",
            ArtifactKind::Program => "output_",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Plan => "json",
            ArtifactKind::Program => "py",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Plan => "plan",
            ArtifactKind::Program => "program",
        }
    }

    /// Whether `name` is a well-formed file name for this kind.
    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(self.prefix())
            && name
                .strip_suffix(self.extension())
                .is_some_and(|rest| rest.ends_with('.'))
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" | "plans" => Ok(ArtifactKind::Plan),
            "program" | "programs" | "output" => Ok(ArtifactKind::Program),
            _ => anyhow::bail!("Invalid artifact kind '{}'. Valid values: plans, programs", s),
        }
    }
}

/// A resolved handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub name: String,
    pub path: PathBuf,
}

impl ArtifactRef {
    /// The timestamp component embedded in the name (`plan_<stamp>.json` → `<stamp>`).
    pub fn stamp(&self) -> Option<&str> {
        self.name
            .strip_prefix(self.kind.prefix())?
            .strip_suffix(self.kind.extension())?
            .strip_suffix('.')
            .filter(|s| !s.is_empty())
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Storage seam for plans and programs.
///
/// Real implementation: `FsArtifactStore`. The coordinator only ever talks to
/// this trait so tests can simulate a store whose writes are not yet visible.
pub trait ArtifactStore: Send + Sync {
    /// Root directory; the sandbox mounts exactly this path.
    fn root(&self) -> &Path;

    /// Write a new artifact atomically under a fresh time-qualified name.
    fn put(&self, kind: ArtifactKind, content: &str) -> Result<ArtifactRef, StoreError>;

    /// Write a program, reusing the originating plan's timestamp in its name when available.
    fn put_program(
        &self,
        content: &str,
        plan: Option<&ArtifactRef>,
    ) -> Result<ArtifactRef, StoreError>;

    /// The artifact of `kind` with the greatest creation time.
    fn latest(&self, kind: ArtifactKind) -> Result<ArtifactRef, StoreError>;

    /// All artifacts of `kind`, newest first.
    fn list(&self, kind: ArtifactKind) -> Result<Vec<ArtifactRef>, StoreError>;

    fn exists(&self, artifact: &ArtifactRef) -> bool;

    fn read(&self, artifact: &ArtifactRef) -> Result<String, StoreError>;

    /// Build a reference for a user-supplied file name.
    fn resolve(&self, kind: ArtifactKind, name: &str) -> Result<ArtifactRef, StoreError>;
}
