//! Report of repositories that may have lost writes.
//!
//! A repository is at risk when it has no primary, or when its primary is
//! behind the latest generation: writes acknowledged on a replica that is now
//! outdated or gone can only be recovered by hand.

use std::fmt::{self, Write as _};

use crate::config::ConfiguredStorages;
use crate::datastore::{DatastoreError, Generation, RepositoryRecord, RepositoryStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedReplica {
    pub storage: String,
    /// Generations behind the latest. None when the storage holds no replica.
    pub behind_by: Option<Generation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLossEntry {
    pub virtual_storage: String,
    pub relative_path: String,
    pub generation: Generation,
    pub primary: Option<String>,
    pub outdated: Vec<OutdatedReplica>,
}

impl DataLossEntry {
    /// The primary is missing or among the outdated replicas.
    pub fn primary_at_risk(&self) -> bool {
        match &self.primary {
            None => true,
            Some(primary) => self.outdated.iter().any(|replica| &replica.storage == primary),
        }
    }

    fn from_record(record: &RepositoryRecord, configured: &[String]) -> Self {
        let assigned = configured
            .iter()
            .filter(|storage| record.assigned.is_empty() || record.assigned.contains(*storage));
        let outdated = record
            .outdated(assigned)
            .into_iter()
            .map(|storage| OutdatedReplica {
                behind_by: record
                    .replicas
                    .get(&storage)
                    .map(|generation| record.generation - generation),
                storage,
            })
            .collect();
        Self {
            virtual_storage: record.virtual_storage.clone(),
            relative_path: record.relative_path.clone(),
            generation: record.generation,
            primary: record.primary.clone(),
            outdated,
        }
    }
}

/// Repositories of `virtual_storage` (or of every configured virtual
/// storage) whose primary is at risk. With `include_partially_replicated`
/// repositories with a healthy primary but outdated replicas are listed too.
pub async fn dataloss(
    store: &dyn RepositoryStore,
    storages: &ConfiguredStorages,
    virtual_storage: Option<&str>,
    include_partially_replicated: bool,
) -> Result<Vec<DataLossEntry>, DatastoreError> {
    let mut entries = Vec::new();
    for (name, configured) in storages {
        if virtual_storage.is_some_and(|wanted| wanted != name) {
            continue;
        }
        for record in store.repositories(name).await? {
            let entry = DataLossEntry::from_record(&record, configured);
            let listed = entry.primary_at_risk()
                || (include_partially_replicated && !entry.outdated.is_empty());
            if listed {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

/// Human-readable report, one block per virtual storage.
pub struct DataLossReport<'a>(pub &'a [DataLossEntry]);

impl fmt::Display for DataLossReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return writeln!(f, "All repositories are available.");
        }
        let mut current: Option<&str> = None;
        for entry in self.0 {
            if current != Some(entry.virtual_storage.as_str()) {
                writeln!(f, "Virtual storage: {}", entry.virtual_storage)?;
                current = Some(entry.virtual_storage.as_str());
            }
            let mut line = format!("  {}", entry.relative_path);
            match &entry.primary {
                Some(primary) if entry.primary_at_risk() => {
                    let _ = write!(line, " (primary {primary} is outdated)");
                }
                Some(primary) => {
                    let _ = write!(line, " (primary {primary})");
                }
                None => line.push_str(" (no primary, read-only)"),
            }
            writeln!(f, "{line}")?;
            for replica in &entry.outdated {
                match replica.behind_by {
                    Some(behind) => writeln!(
                        f,
                        "    {}: {behind} generation{} behind",
                        replica.storage,
                        if behind == 1 { "" } else { "s" }
                    )?,
                    None => writeln!(f, "    {}: no replica", replica.storage)?,
                }
            }
        }
        Ok(())
    }
}
