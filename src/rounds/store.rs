use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// One round of fleet-wide work, keyed by `stamp` (a millisecond timestamp
/// acting as round identity). All mutations are idempotent set-by-stamp
/// operations; `persisted` implies `complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub stamp: u64,
    pub started_at: u64,
    pub complete: bool,
    pub persisted: bool,
}

impl Round {
    pub fn started(stamp: u64, started_at: u64) -> Self {
        Self {
            stamp,
            started_at,
            complete: false,
            persisted: false,
        }
    }
}

/// Minimal persisted bookkeeping for rounds. Mutated by whichever process
/// runs a given handler; safe only because every write is an idempotent set
/// keyed by stamp.
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Create or refresh the round record for `stamp`.
    async fn upsert_round(&self, stamp: u64, started_at: u64) -> Result<()>;

    /// The round with the greatest `started_at`, if any.
    async fn latest_round(&self) -> Result<Option<Round>>;

    /// Set completion/persistence flags. A missing round is a no-op; setting
    /// `persisted` forces `complete` (the invariant is enforced here, not
    /// trusted to callers).
    async fn mark_round(
        &self,
        stamp: u64,
        complete: Option<bool>,
        persisted: Option<bool>,
    ) -> Result<()>;

    /// Administrative wipe of all round bookkeeping.
    async fn wipe_all(&self) -> Result<()>;
}

fn apply_marks(round: &mut Round, complete: Option<bool>, persisted: Option<bool>) {
    if let Some(complete) = complete {
        round.complete = complete;
    }
    if let Some(persisted) = persisted {
        round.persisted = persisted;
        if persisted {
            round.complete = true;
        }
    }
}

/// In-memory round store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryRoundStore {
    rounds: RwLock<HashMap<u64, Round>>,
}

impl MemoryRoundStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoundStore for MemoryRoundStore {
    async fn upsert_round(&self, stamp: u64, started_at: u64) -> Result<()> {
        let mut rounds = self.rounds.write().await;
        rounds
            .entry(stamp)
            .and_modify(|r| r.started_at = started_at)
            .or_insert_with(|| Round::started(stamp, started_at));
        Ok(())
    }

    async fn latest_round(&self) -> Result<Option<Round>> {
        let rounds = self.rounds.read().await;
        Ok(rounds.values().max_by_key(|r| r.started_at).cloned())
    }

    async fn mark_round(
        &self,
        stamp: u64,
        complete: Option<bool>,
        persisted: Option<bool>,
    ) -> Result<()> {
        let mut rounds = self.rounds.write().await;
        match rounds.get_mut(&stamp) {
            Some(round) => apply_marks(round, complete, persisted),
            None => tracing::warn!(stamp, "Marking unknown round, ignoring"),
        }
        Ok(())
    }

    async fn wipe_all(&self) -> Result<()> {
        self.rounds.write().await.clear();
        Ok(())
    }
}

const ROUNDS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("rounds");

/// redb-backed round store. Tables are tiny (one row per round) and writes
/// are rare, so calls run inline on the async path.
pub struct RedbRoundStore {
    db: Arc<Database>,
}

impl RedbRoundStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        // Ensure the table exists so reads never race its creation.
        let txn = db.begin_write()?;
        txn.open_table(ROUNDS_TABLE)?;
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    fn read_round(bytes: &[u8]) -> Result<Round> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn load(&self, stamp: u64) -> Result<Option<Round>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ROUNDS_TABLE)?;
        match table.get(stamp)? {
            Some(guard) => Ok(Some(Self::read_round(guard.value())?)),
            None => Ok(None),
        }
    }

    fn save(&self, round: &Round) -> Result<()> {
        let bytes = serde_json::to_vec(round)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ROUNDS_TABLE)?;
            table.insert(round.stamp, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl RoundStore for RedbRoundStore {
    async fn upsert_round(&self, stamp: u64, started_at: u64) -> Result<()> {
        let round = match self.load(stamp)? {
            Some(mut existing) => {
                existing.started_at = started_at;
                existing
            }
            None => Round::started(stamp, started_at),
        };
        self.save(&round)
    }

    async fn latest_round(&self) -> Result<Option<Round>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ROUNDS_TABLE)?;
        let mut latest: Option<Round> = None;
        for item in table.iter()? {
            let (_, value) = item?;
            let round = Self::read_round(value.value())?;
            if latest
                .as_ref()
                .map(|l| round.started_at > l.started_at)
                .unwrap_or(true)
            {
                latest = Some(round);
            }
        }
        Ok(latest)
    }

    async fn mark_round(
        &self,
        stamp: u64,
        complete: Option<bool>,
        persisted: Option<bool>,
    ) -> Result<()> {
        match self.load(stamp)? {
            Some(mut round) => {
                apply_marks(&mut round, complete, persisted);
                self.save(&round)
            }
            None => {
                tracing::warn!(stamp, "Marking unknown round, ignoring");
                Ok(())
            }
        }
    }

    async fn wipe_all(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ROUNDS_TABLE)?;
            table.retain(|_, _| false)?;
        }
        txn.commit()?;
        Ok(())
    }
}
