//! # Cache Invalidation Map
//!
//! Which cached path prefixes a change to a resource kind makes stale.
//! Used after both server-origin and local-origin items so the next read of
//! an affected prefix goes to the server.

use crate::changes::ServerChange;
use crate::types::{MutationKind, MutationLogEntry, ResourceKind};

/// Prefixes affected by a change to `kind`.
///
/// ## Example
/// ```rust
/// use till_core::invalidation::prefixes_for;
/// use till_core::types::ResourceKind;
///
/// assert!(prefixes_for(ResourceKind::Sale).contains(&"/inventory"));
/// assert!(prefixes_for(ResourceKind::Other).is_empty());
/// ```
pub fn prefixes_for(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Product => &["/products", "/inventory"],
        ResourceKind::StockAdjustment => &["/inventory", "/stock", "/products"],
        ResourceKind::Sale | ResourceKind::SaleItem => &["/sales", "/inventory", "/stock"],
        ResourceKind::CashSession => &["/cash-sessions"],
        ResourceKind::CashMovement => &["/cash-sessions", "/cash-movements"],
        ResourceKind::Customer => &["/customers"],
        ResourceKind::Other => &[],
    }
}

/// Prefixes affected by a confirmed local operation.
///
/// A sale confirmation moves stock even though it targets the sale itself.
pub fn prefixes_for_mutation(entry: &MutationLogEntry) -> Vec<&'static str> {
    prefixes_for_operation(entry.resource_kind, entry.kind)
}

/// Same as [`prefixes_for_mutation`] for an operation that was never queued.
pub fn prefixes_for_operation(resource_kind: ResourceKind, kind: MutationKind) -> Vec<&'static str> {
    let mut prefixes = prefixes_for(resource_kind).to_vec();
    if kind == MutationKind::ConfirmSale {
        for p in prefixes_for(ResourceKind::StockAdjustment) {
            if !prefixes.contains(p) {
                prefixes.push(p);
            }
        }
    }
    prefixes
}

/// Prefixes affected by a server-origin change.
pub fn prefixes_for_change(change: &ServerChange) -> &'static [&'static str] {
    prefixes_for(change.resource_kind())
}
