// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::listing::Item;

/// What to do with one channel's listing this run
#[derive(Debug, Clone, Default)]
pub struct ChannelPlan {
    /// Items to fetch, in producer order
    pub to_download: Vec<Item>,
    /// Number of items in the listing
    pub total_listed: usize,
    /// Items already in the seen set
    pub already_seen: usize,
    /// Novel items, before the date window and limit
    pub novel: usize,
    /// Novel items published before the date window
    pub outside_window: usize,
    /// Novel items dropped by the per-run limit
    pub limited: usize,
}

/// Return the items whose id is not in `seen`, keeping the producer's order
///
/// Repeated ids within one listing are kept once (first occurrence).
pub fn filter_novel(items: Vec<Item>, seen: &HashSet<String>) -> Vec<Item> {
    let mut scheduled = HashSet::new();

    items
        .into_iter()
        .filter(|item| !seen.contains(&item.item_id) && scheduled.insert(item.item_id.clone()))
        .collect()
}

/// Build a channel plan from a listing and the channel's seen set
///
/// Items without a publication date are never excluded by `since`. Novel
/// items that are excluded stay uncommitted, so they become eligible again
/// when the window or limit changes.
pub fn create_channel_plan(
    items: Vec<Item>,
    seen: &HashSet<String>,
    since: Option<NaiveDate>,
    limit: Option<usize>,
) -> ChannelPlan {
    let total_listed = items.len();
    let already_seen = items
        .iter()
        .filter(|item| seen.contains(&item.item_id))
        .count();

    let novel = filter_novel(items, seen);
    let novel_count = novel.len();

    let (in_window, outside): (Vec<_>, Vec<_>) = novel
        .into_iter()
        .partition(|item| match (since, item.published) {
            (Some(since), Some(published)) => published >= since,
            _ => true,
        });

    let eligible = in_window.len();
    let to_download: Vec<_> = match limit {
        Some(limit) => in_window.into_iter().take(limit).collect(),
        None => in_window,
    };

    ChannelPlan {
        limited: eligible - to_download.len(),
        to_download,
        total_listed,
        already_seen,
        novel: novel_count,
        outside_window: outside.len(),
    }
}
