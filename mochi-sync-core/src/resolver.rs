//! # resolver: directory path → remote deck id
//!
//! Resolution reads the lock first and only talks to the remote service when
//! a deck is missing or its configured name changed. Missing ancestors are
//! created top-down, and each new deck is recorded in the lock as soon as it
//! exists, so a failed run resumes where it stopped instead of duplicating
//! decks.
//!
//! Callers must resolve directories in non-decreasing depth order (as the
//! grouper hands them out) for ancestors to be found in the lock.

use tracing::{debug, info};

use crate::config::SynchroniseConfig;
use crate::contract::Client;
use crate::executor::{execute_one, OperationError};
use crate::grouper::parent_dir;
use crate::lock::Lock;
use crate::operation::{Operation, Tally};

#[derive(Debug, thiserror::Error)]
#[error("failed to {operation}: {source}")]
pub struct ResolveError {
    pub operation: String,
    #[source]
    pub source: OperationError,
}

pub struct DeckResolver<'a, C: ?Sized> {
    client: &'a C,
    lock: &'a Lock,
    config: &'a SynchroniseConfig,
    tally: Tally,
}

impl<'a, C> DeckResolver<'a, C>
where
    C: Client + ?Sized,
{
    pub fn new(client: &'a C, lock: &'a Lock, config: &'a SynchroniseConfig) -> Self {
        Self {
            client,
            lock,
            config,
            tally: Tally::default(),
        }
    }

    /// Deck writes performed so far.
    pub fn tally(&self) -> Tally {
        self.tally
    }

    /// Resolve `dir` to a deck id, creating it and any missing ancestors.
    ///
    /// The root directory has no deck and resolves to `None`.
    pub async fn resolve(&mut self, dir: &str) -> Result<Option<String>, ResolveError> {
        if dir == "/" {
            return Ok(None);
        }
        if let Some(id) = self.locked(dir).await? {
            debug!(dir, deck_id = %id, "[RESOLVE] Deck found in lock");
            return Ok(Some(id));
        }

        let mut missing = vec![dir.to_string()];
        let mut parent_id = None;
        let mut current = parent_dir(dir);
        while current != "/" {
            if let Some(id) = self.locked(&current).await? {
                parent_id = Some(id);
                break;
            }
            missing.push(current.clone());
            current = parent_dir(&current);
        }

        while let Some(path) = missing.pop() {
            let name = self.config.deck_name(&path);
            let applied = self
                .apply(Operation::CreateDeck {
                    path: path.clone(),
                    name: name.clone(),
                    parent_id: parent_id.take(),
                })
                .await?;
            info!(path = %path, name = %name, deck_id = %applied, "[RESOLVE] Created deck");
            parent_id = Some(applied);
        }
        Ok(parent_id)
    }

    /// Locked deck id for `dir`, renaming the deck first if its configured
    /// name changed.
    async fn locked(&mut self, dir: &str) -> Result<Option<String>, ResolveError> {
        let Some((id, record)) = self.lock.get_deck(dir) else {
            return Ok(None);
        };
        let name = self.config.deck_name(dir);
        if record.name != name {
            info!(dir, deck_id = %id, old = %record.name, new = %name, "[RESOLVE] Renaming deck");
            self.apply(Operation::UpdateDeckName {
                deck_id: id.clone(),
                path: dir.to_string(),
                name,
            })
            .await?;
        }
        Ok(Some(id))
    }

    async fn apply(&mut self, op: Operation) -> Result<String, ResolveError> {
        let operation = op.to_string();
        let kind = op.kind();
        match execute_one(self.client, self.lock, op).await {
            Ok(applied) => {
                self.tally.record(kind);
                Ok(applied.id)
            }
            Err(source) => Err(ResolveError { operation, source }),
        }
    }
}
