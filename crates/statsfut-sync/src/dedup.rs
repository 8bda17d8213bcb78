use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use statsfut_core::{compare_retention, FixtureKey, MatchRecord};
use statsfut_storage::MatchStore;
use tracing::{debug, info};

/// One (home, away, date) key that occurs more than once.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub key: FixtureKey,
    pub keep: MatchRecord,
    pub discard: Vec<MatchRecord>,
}

impl DuplicateGroup {
    pub fn discard_ids(&self) -> Vec<i64> {
        self.discard.iter().map(|m| m.id).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupPlan {
    pub groups: Vec<DuplicateGroup>,
}

impl DedupPlan {
    pub fn records_to_delete(&self) -> usize {
        self.groups.iter().map(|g| g.discard.len()).sum()
    }
}

/// Groups records by fixture key and picks a survivor for every key shared
/// by two or more records. Singletons are left out of the plan.
pub fn plan_dedup(records: Vec<MatchRecord>) -> DedupPlan {
    let mut by_key: BTreeMap<FixtureKey, Vec<MatchRecord>> = BTreeMap::new();
    for record in records {
        by_key.entry(record.fixture_key()).or_default().push(record);
    }

    let groups = by_key
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, mut members)| {
            members.sort_by(|a, b| compare_retention(b, a));
            let discard = members.split_off(1);
            let keep = members.remove(0);
            DuplicateGroup { key, keep, discard }
        })
        .collect();

    DedupPlan { groups }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupReport {
    pub groups_found: usize,
    pub records_deleted: u64,
    pub dry_run: bool,
    pub kept_ids: Vec<i64>,
}

/// Collapses duplicate match rows, keeping the best candidate of each group.
///
/// Groups are deleted one statement at a time with no surrounding
/// transaction: an error aborts the run and earlier groups stay deleted.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupCommand {
    pub dry_run: bool,
}

impl DedupCommand {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub async fn run(&self, store: &dyn MatchStore) -> Result<DedupReport> {
        let candidates = store
            .duplicate_candidates()
            .await
            .context("loading duplicate match candidates")?;
        let plan = plan_dedup(candidates);
        info!(
            groups = plan.groups.len(),
            dry_run = self.dry_run,
            "found duplicate match groups"
        );

        let mut records_deleted = 0u64;
        for group in &plan.groups {
            let ids = group.discard_ids();
            debug!(key = %group.key, keep = group.keep.id, discard = ?ids, "collapsing group");
            if self.dry_run {
                records_deleted += ids.len() as u64;
                continue;
            }
            records_deleted += store
                .delete_matches(&ids)
                .await
                .with_context(|| format!("deleting duplicates of {}", group.key))?;
        }

        info!(records_deleted, dry_run = self.dry_run, "duplicate removal finished");
        Ok(DedupReport {
            groups_found: plan.groups.len(),
            records_deleted,
            dry_run: self.dry_run,
            kept_ids: plan.groups.iter().map(|g| g.keep.id).collect(),
        })
    }
}
