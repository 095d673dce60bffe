//! # Queue Collapse
//!
//! Reduces a store's pending queue to a minimal equivalent set before it is
//! replayed. The rules are data: [`COLLAPSE_RULES`] lists them in the order
//! they run, and each can be applied on its own.
//!
//! ## Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. DeleteCancelsUnsentCreate                                          │
//! │     create(local-A) … update(local-A) … delete(local-A)                │
//! │     → all three dropped, the server never hears of local-A             │
//! │                                                                         │
//! │  2. LatestUpdateWins                                                   │
//! │     update(P1, price=5) … update(P1, price=7)                          │
//! │     → update(P1, price=7)                                              │
//! │                                                                         │
//! │  3. SingleCreatePerPlaceholder                                         │
//! │     create(local-B, v1) … create(local-B, v2)                          │
//! │     → create(local-B, v2) with the first entry's token and position    │
//! │                                                                         │
//! │  Discrete events (cash session open/close, cash movements, sale       │
//! │  confirmation) are never touched and act as barriers: operations on   │
//! │  the same resource only merge between two of them, and a resource a   │
//! │  discrete event refers to is never cancelled. The result is re-sorted │
//! │  by (created_at, id).                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::types::{MutationKind, MutationLogEntry, ResourceKind};

/// A single collapse rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollapseRule {
    /// A delete of a resource whose creates were never sent drops the
    /// creates, the delete and any updates in between.
    DeleteCancelsUnsentCreate,
    /// Several updates to one resource reduce to the latest.
    LatestUpdateWins,
    /// Several creates of one placeholder reduce to one.
    SingleCreatePerPlaceholder,
}

/// Rules in the order [`collapse`] runs them.
pub const COLLAPSE_RULES: &[CollapseRule] = &[
    CollapseRule::DeleteCancelsUnsentCreate,
    CollapseRule::LatestUpdateWins,
    CollapseRule::SingleCreatePerPlaceholder,
];

/// An entry removed from the queue without being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEntry {
    pub id: i64,
    pub idempotency_token: String,
    pub rule: CollapseRule,
}

/// Result of collapsing a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collapsed {
    /// Entries to replay, ordered by (created_at, id).
    pub kept: Vec<MutationLogEntry>,
    pub dropped: Vec<DroppedEntry>,
}

type ResourceKey = (ResourceKind, String);
type OrderKey = (chrono::DateTime<chrono::Utc>, i64);

fn resource_key(entry: &MutationLogEntry) -> ResourceKey {
    (entry.resource_kind, entry.resource_id.clone())
}

/// Positions of the discrete events queued against each resource.
struct Barriers(HashMap<ResourceKey, Vec<OrderKey>>);

impl Barriers {
    fn new(entries: &[MutationLogEntry]) -> Self {
        let mut by_resource: HashMap<ResourceKey, Vec<OrderKey>> = HashMap::new();
        for entry in entries.iter().filter(|e| !e.kind.is_mergeable()) {
            by_resource.entry(resource_key(entry)).or_default().push(entry.order_key());
        }
        for keys in by_resource.values_mut() {
            keys.sort();
        }
        Barriers(by_resource)
    }

    fn touches(&self, key: &ResourceKey) -> bool {
        self.0.contains_key(key)
    }

    /// Resource plus the number of its discrete events queued before
    /// `entry`; only entries with equal keys may merge.
    fn segment_key(&self, entry: &MutationLogEntry) -> (ResourceKey, usize) {
        let key = resource_key(entry);
        let order = entry.order_key();
        let segment = self
            .0
            .get(&key)
            .map_or(0, |barriers| barriers.partition_point(|b| *b < order));
        (key, segment)
    }
}

impl CollapseRule {
    pub fn name(&self) -> &'static str {
        match self {
            CollapseRule::DeleteCancelsUnsentCreate => "delete_cancels_unsent_create",
            CollapseRule::LatestUpdateWins => "latest_update_wins",
            CollapseRule::SingleCreatePerPlaceholder => "single_create_per_placeholder",
        }
    }

    /// Applies this rule, appending removed entries to `dropped`.
    ///
    /// The relative order of surviving entries is preserved.
    pub fn apply(
        &self,
        entries: Vec<MutationLogEntry>,
        dropped: &mut Vec<DroppedEntry>,
    ) -> Vec<MutationLogEntry> {
        match self {
            CollapseRule::DeleteCancelsUnsentCreate => cancel_unsent_creates(entries, dropped),
            CollapseRule::LatestUpdateWins => keep_latest_update(entries, dropped),
            CollapseRule::SingleCreatePerPlaceholder => merge_duplicate_creates(entries, dropped),
        }
    }

    fn drop_entry(&self, entry: &MutationLogEntry, dropped: &mut Vec<DroppedEntry>) {
        dropped.push(DroppedEntry {
            id: entry.id,
            idempotency_token: entry.idempotency_token.clone(),
            rule: *self,
        });
    }
}

impl fmt::Display for CollapseRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn cancel_unsent_creates(
    entries: Vec<MutationLogEntry>,
    dropped: &mut Vec<DroppedEntry>,
) -> Vec<MutationLogEntry> {
    let barriers = Barriers::new(&entries);
    let mut creates: HashMap<ResourceKey, Vec<&MutationLogEntry>> = HashMap::new();
    let mut deletes: HashMap<ResourceKey, &MutationLogEntry> = HashMap::new();

    for entry in &entries {
        match entry.kind {
            MutationKind::Create => creates.entry(resource_key(entry)).or_default().push(entry),
            MutationKind::Delete => {
                let key = resource_key(entry);
                let latest = deletes.get(&key).map_or(true, |d| d.order_key() < entry.order_key());
                if latest {
                    deletes.insert(key, entry);
                }
            }
            _ => {}
        }
    }

    let cancelled: HashSet<ResourceKey> = deletes
        .iter()
        .filter(|(key, _)| !barriers.touches(key))
        .filter(|(key, delete)| match creates.get(*key) {
            Some(group) => group
                .iter()
                .all(|c| c.is_unsent() && c.order_key() < delete.order_key()),
            None => false,
        })
        .map(|(key, _)| key.clone())
        .collect();

    if cancelled.is_empty() {
        return entries;
    }

    let rule = CollapseRule::DeleteCancelsUnsentCreate;
    entries
        .into_iter()
        .filter(|entry| {
            let cancel = entry.kind.is_mergeable() && cancelled.contains(&resource_key(entry));
            if cancel {
                rule.drop_entry(entry, dropped);
            }
            !cancel
        })
        .collect()
}

fn keep_latest_update(
    entries: Vec<MutationLogEntry>,
    dropped: &mut Vec<DroppedEntry>,
) -> Vec<MutationLogEntry> {
    let barriers = Barriers::new(&entries);
    let mut latest: HashMap<(ResourceKey, usize), OrderKey> = HashMap::new();
    for entry in entries.iter().filter(|e| e.kind == MutationKind::Update) {
        let slot = latest.entry(barriers.segment_key(entry)).or_insert(entry.order_key());
        if entry.order_key() > *slot {
            *slot = entry.order_key();
        }
    }

    let rule = CollapseRule::LatestUpdateWins;
    entries
        .into_iter()
        .filter(|entry| {
            if entry.kind != MutationKind::Update {
                return true;
            }
            let keep = latest.get(&barriers.segment_key(entry)) == Some(&entry.order_key());
            if !keep {
                rule.drop_entry(entry, dropped);
            }
            keep
        })
        .collect()
}

fn merge_duplicate_creates(
    entries: Vec<MutationLogEntry>,
    dropped: &mut Vec<DroppedEntry>,
) -> Vec<MutationLogEntry> {
    let barriers = Barriers::new(&entries);
    // segment -> (index of earliest create, index of latest create)
    let mut bounds: HashMap<(ResourceKey, usize), (usize, usize)> = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        if entry.kind != MutationKind::Create || !entry.targets_placeholder() {
            continue;
        }
        let slot = bounds.entry(barriers.segment_key(entry)).or_insert((i, i));
        if entry.order_key() < entries[slot.0].order_key() {
            slot.0 = i;
        }
        if entry.order_key() > entries[slot.1].order_key() {
            slot.1 = i;
        }
    }

    let mut latest_requests = HashMap::new();
    for (first, last) in bounds.values() {
        if first != last {
            latest_requests.insert(*first, entries[*last].request.clone());
        }
    }

    let rule = CollapseRule::SingleCreatePerPlaceholder;
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, mut entry)| {
            if entry.kind != MutationKind::Create || !entry.targets_placeholder() {
                return Some(entry);
            }
            match bounds.get(&barriers.segment_key(&entry)) {
                Some((first, _)) if *first == i => {
                    if let Some(request) = latest_requests.remove(&i) {
                        entry.request = request;
                    }
                    Some(entry)
                }
                _ => {
                    rule.drop_entry(&entry, dropped);
                    None
                }
            }
        })
        .collect()
}

/// Runs every rule in [`COLLAPSE_RULES`] over a store's pending entries.
pub fn collapse(entries: Vec<MutationLogEntry>) -> Collapsed {
    collapse_with(COLLAPSE_RULES, entries)
}

/// Runs the given rules in order, then re-sorts by (created_at, id).
pub fn collapse_with(rules: &[CollapseRule], entries: Vec<MutationLogEntry>) -> Collapsed {
    let mut dropped = Vec::new();
    let mut kept = entries;
    for rule in rules {
        kept = rule.apply(kept, &mut dropped);
    }
    kept.sort_by_key(|e| e.order_key());
    Collapsed { kept, dropped }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReplayRequest;
    use crate::types::{HttpMethod, MutationStatus};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn entry(
        id: i64,
        minute: i64,
        kind: MutationKind,
        resource_id: &str,
        body: serde_json::Value,
    ) -> MutationLogEntry {
        let method = match kind {
            MutationKind::Create => HttpMethod::Post,
            MutationKind::Delete => HttpMethod::Delete,
            _ => HttpMethod::Patch,
        };
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        MutationLogEntry {
            id,
            idempotency_token: format!("tok-{id}"),
            store_id: "s1".into(),
            resource_kind: ResourceKind::Sale,
            resource_id: resource_id.into(),
            kind,
            request: ReplayRequest::new(method, &format!("/sales/{resource_id}")).with_body(body),
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: base + Duration::minutes(minute),
            attempted_at: None,
        }
    }

    fn ids(entries: &[MutationLogEntry]) -> Vec<i64> {
        entries.iter().map(|e| e.id).collect()
    }

    fn ids_of(dropped: &[DroppedEntry]) -> Vec<i64> {
        dropped.iter().map(|d| d.id).collect()
    }

    #[test]
    fn test_create_then_delete_cancels_everything() {
        let out = collapse(vec![
            entry(1, 0, MutationKind::Create, "local-a", json!({})),
            entry(2, 1, MutationKind::Update, "local-a", json!({ "note": "x" })),
            entry(3, 2, MutationKind::Delete, "local-a", json!(null)),
        ]);
        assert!(out.kept.is_empty());
        assert_eq!(out.dropped.len(), 3);
        assert!(out
            .dropped
            .iter()
            .all(|d| d.rule == CollapseRule::DeleteCancelsUnsentCreate));
    }

    #[test]
    fn test_attempted_create_is_not_cancelled() {
        let mut create = entry(1, 0, MutationKind::Create, "local-a", json!({}));
        create.attempted_at = Some(create.created_at);
        let out = collapse(vec![
            create,
            entry(2, 1, MutationKind::Delete, "local-a", json!(null)),
        ]);
        assert_eq!(ids(&out.kept), vec![1, 2]);
    }

    #[test]
    fn test_delete_without_create_is_kept() {
        let out = collapse(vec![entry(1, 0, MutationKind::Delete, "991", json!(null))]);
        assert_eq!(ids(&out.kept), vec![1]);
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn test_latest_update_wins() {
        let out = collapse(vec![
            entry(1, 0, MutationKind::Update, "991", json!({ "price": 5 })),
            entry(2, 1, MutationKind::Update, "992", json!({ "price": 1 })),
            entry(3, 2, MutationKind::Update, "991", json!({ "price": 7 })),
        ]);
        assert_eq!(ids(&out.kept), vec![2, 3]);
        assert_eq!(out.kept[1].request.body, Some(json!({ "price": 7 })));
        assert_eq!(out.dropped[0].idempotency_token, "tok-1");
    }

    #[test]
    fn test_same_timestamp_updates_use_insertion_order() {
        let out = collapse(vec![
            entry(5, 0, MutationKind::Update, "991", json!({ "price": 5 })),
            entry(6, 0, MutationKind::Update, "991", json!({ "price": 6 })),
        ]);
        assert_eq!(ids(&out.kept), vec![6]);
    }

    #[test]
    fn test_duplicate_creates_keep_first_token_latest_body() {
        let out = collapse(vec![
            entry(1, 0, MutationKind::Create, "local-b", json!({ "v": 1 })),
            entry(2, 1, MutationKind::Create, "local-b", json!({ "v": 2 })),
        ]);
        assert_eq!(ids(&out.kept), vec![1]);
        assert_eq!(out.kept[0].idempotency_token, "tok-1");
        assert_eq!(out.kept[0].request.body, Some(json!({ "v": 2 })));
        assert_eq!(out.dropped[0].rule, CollapseRule::SingleCreatePerPlaceholder);
    }

    #[test]
    fn test_discrete_events_untouched() {
        let out = collapse(vec![
            entry(1, 0, MutationKind::CashMovement, "55", json!({ "amount": 10 })),
            entry(2, 1, MutationKind::CashMovement, "55", json!({ "amount": 10 })),
            entry(3, 2, MutationKind::ConfirmSale, "55", json!(null)),
            entry(4, 3, MutationKind::ConfirmSale, "55", json!(null)),
        ]);
        assert_eq!(ids(&out.kept), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_causal_order_preserved() {
        // Scenario: draft, add item to it, confirm. Different identities survive.
        let mut item = entry(2, 1, MutationKind::Create, "local-item", json!({ "sale_id": "local-d" }));
        item.resource_kind = ResourceKind::SaleItem;
        let out = collapse(vec![
            entry(3, 2, MutationKind::ConfirmSale, "local-d", json!(null)),
            item,
            entry(1, 0, MutationKind::Create, "local-d", json!({})),
        ]);
        assert_eq!(ids(&out.kept), vec![1, 2, 3]);
    }

    #[test]
    fn test_rules_apply_independently() {
        let entries = vec![
            entry(1, 0, MutationKind::Update, "991", json!({ "price": 5 })),
            entry(2, 1, MutationKind::Update, "991", json!({ "price": 7 })),
        ];
        let only_cancel = collapse_with(&[CollapseRule::DeleteCancelsUnsentCreate], entries.clone());
        assert_eq!(ids(&only_cancel.kept), vec![1, 2]);

        let mut dropped = Vec::new();
        let kept = CollapseRule::LatestUpdateWins.apply(entries, &mut dropped);
        assert_eq!(ids(&kept), vec![2]);
        assert_eq!(dropped.len(), 1);
    }

    #[test]
    fn test_updates_do_not_merge_across_a_confirmation() {
        let out = collapse(vec![
            entry(1, 0, MutationKind::Update, "991", json!({ "discount": 10 })),
            entry(2, 1, MutationKind::ConfirmSale, "991", json!(null)),
            entry(3, 2, MutationKind::Update, "991", json!({ "note": "gift" })),
            entry(4, 3, MutationKind::Update, "991", json!({ "note": "gift wrap" })),
        ]);
        assert_eq!(ids(&out.kept), vec![1, 2, 4]);
        assert_eq!(out.kept[0].request.body, Some(json!({ "discount": 10 })));
        assert_eq!(ids_of(&out.dropped), vec![3]);
    }

    #[test]
    fn test_confirmed_draft_is_not_cancelled_by_its_delete() {
        let out = collapse(vec![
            entry(1, 0, MutationKind::Create, "local-a", json!({})),
            entry(2, 1, MutationKind::ConfirmSale, "local-a", json!(null)),
            entry(3, 2, MutationKind::Delete, "local-a", json!(null)),
        ]);
        assert_eq!(ids(&out.kept), vec![1, 2, 3]);
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn test_duplicate_creates_merge_only_within_a_segment() {
        let out = collapse(vec![
            entry(1, 0, MutationKind::Create, "local-b", json!({ "v": 1 })),
            entry(2, 1, MutationKind::Create, "local-b", json!({ "v": 2 })),
            entry(3, 2, MutationKind::ConfirmSale, "local-b", json!(null)),
            entry(4, 3, MutationKind::Create, "local-b", json!({ "v": 3 })),
        ]);
        assert_eq!(ids(&out.kept), vec![1, 3, 4]);
        assert_eq!(out.kept[0].request.body, Some(json!({ "v": 2 })));
    }
}
