//! CLI command implementations

pub mod migrate;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use finledger_core::adapters::DirectorySource;
use finledger_core::services::EntryPoint;
use finledger_core::LedgerContext;
use tracing::debug;

/// Where the ledger and its migrations live, from global flags
pub struct Location {
    pub dir: Option<PathBuf>,
    pub migrations: Option<PathBuf>,
}

impl Location {
    /// The ledger directory: `--dir`, `FINLEDGER_DIR`, or `~/.finledger`
    pub fn ledger_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".finledger"))
                .ok_or_else(|| anyhow!("Could not find home directory; pass --dir")),
        }
    }
}

/// Open the ledger context, honoring `--migrations`
pub fn get_context(location: &Location) -> Result<LedgerContext> {
    let ledger_dir = location.ledger_dir()?;
    debug!(dir = %ledger_dir.display(), "using ledger directory");

    let ctx = LedgerContext::open(&ledger_dir, EntryPoint::Cli)
        .with_context(|| format!("Failed to open ledger in {}", ledger_dir.display()))?;

    Ok(match &location.migrations {
        Some(dir) => ctx.with_source(DirectorySource::new(dir)),
        None => ctx,
    })
}
