//! Artifact listing: `anvil artifacts [plans|programs]`.

use anyhow::Result;
use anvil::artifact::{ArtifactKind, ArtifactStore};
use anvil::config::AnvilConfig;
use anvil::ui::icons;
use console::style;

use super::open_store;

/// List stored artifacts, newest first. Both kinds when `kind` is `None`.
pub fn cmd_artifacts(config: &AnvilConfig, kind: Option<&str>, limit: Option<usize>) -> Result<()> {
    let kinds = match kind {
        Some(kind) => vec![kind.parse::<ArtifactKind>()?],
        None => vec![ArtifactKind::Plan, ArtifactKind::Program],
    };
    let store = open_store(config)?;

    println!("{}{}", icons::FOLDER, style(store.root().display()).bold());
    for kind in kinds {
        let artifacts = store.list(kind)?;
        println!();
        if artifacts.is_empty() {
            println!("No {} artifacts", kind.label());
            continue;
        }
        println!("{}s ({})", kind.label(), artifacts.len());
        let shown = limit.unwrap_or(artifacts.len());
        for artifact in artifacts.iter().take(shown) {
            println!("  {}{}", icons::FILE_NEW, artifact.name);
        }
        if artifacts.len() > shown {
            println!("  {}", style(format!("... {} more", artifacts.len() - shown)).dim());
        }
    }
    Ok(())
}
