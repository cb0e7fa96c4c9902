//! Diff computation between source and destination listings
//!
//! Both sides are maps from relative path to attributes. Every source entry
//! lands in exactly one of `copy` or `unchanged`; `delete` holds the
//! destination entries missing from the source, and only when deletion is
//! requested.

use crate::error::Result;
use crate::types::{Attributes, Resource};
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;

/// Attributes keyed by relative path
pub type AttrMap = BTreeMap<String, Attributes>;

/// Comparisons in flight; each may compute a checksum
const COMPARE_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Compare CRC32C even when modification times are known
    pub force_checksum: bool,
    /// Fill the delete list
    pub delete: bool,
}

/// Result of a diff
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Source entries missing or different at the destination
    pub copy: Vec<Attributes>,
    /// Destination entries absent from the source
    pub delete: Vec<Attributes>,
    /// Source entries already present and equal
    pub unchanged: Vec<Attributes>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.copy.is_empty() && self.delete.is_empty()
    }

    /// Bytes the copy list will transfer
    pub fn copy_bytes(&self) -> u64 {
        self.copy.iter().map(|a| a.size).sum()
    }
}

/// Build a map from the objects of a listing; directories are skipped
pub fn build_map(resources: Vec<Resource>) -> AttrMap {
    resources
        .into_iter()
        .filter_map(|r| match r.kind {
            crate::types::ResourceKind::Object(attrs) => {
                Some((attrs.relative_path.clone(), attrs))
            }
            _ => None,
        })
        .collect()
}

/// Compute the copy, delete and unchanged sets
pub async fn compute(source: &AttrMap, dest: &AttrMap, options: DiffOptions) -> Result<SyncPlan> {
    let verdicts: Vec<(Attributes, bool)> = futures::stream::iter(source.iter())
        .map(|(rel, src)| async move {
            let same = src.same(dest.get(rel), options.force_checksum).await?;
            Ok::<_, crate::error::Error>((src.clone(), same))
        })
        .buffered(COMPARE_CONCURRENCY)
        .try_collect()
        .await?;

    let mut plan = SyncPlan::default();
    for (attrs, same) in verdicts {
        if same {
            plan.unchanged.push(attrs);
        } else {
            tracing::debug!(path = %attrs.relative_path, size = attrs.size, "Needs copy");
            plan.copy.push(attrs);
        }
    }

    if options.delete {
        plan.delete = dest
            .iter()
            .filter(|(rel, _)| !source.contains_key(*rel))
            .map(|(_, attrs)| attrs.clone())
            .collect();
    }

    tracing::debug!(
        copy = plan.copy.len(),
        delete = plan.delete.len(),
        unchanged = plan.unchanged.len(),
        "Diff complete"
    );
    Ok(plan)
}

/// Plan for a source that does not exist: remove everything at the destination
pub fn purge(dest: &AttrMap) -> SyncPlan {
    SyncPlan {
        delete: dest.values().cloned().collect(),
        ..SyncPlan::default()
    }
}
