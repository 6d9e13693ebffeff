//! The bucketed GFS retention planner: a pure function from a schema, a set
//! of candidate snapshots, and a reference instant to a keep/destroy split.
//!
//! Generalizes `zcrab::policy::RetentionPolicy::judge` (flat
//! `(Duration, count)` rules, `HashSet`-returning, oldest-first scan) from a
//! "periods since now" model into the fixed-unit-order bucket walk this
//! scheme requires, while keeping that function's style: build owned
//! index/reference sets rather than mutate a snapshot list in place, and
//! colocate `#[cfg(test)]` with synthetic-age fixtures the way
//! `policy.rs`'s `aged!` macro does.
//!
//! Bucket membership uses a half-open `(start, end]` interval (exclusive
//! start, inclusive end): a snapshot whose creation instant exactly equals a
//! shared bucket boundary belongs to the *older* of the two buckets it
//! touches, per the boundary rule this scheme specifies. The bucket walk
//! anchors at local midnight and assigns each unit's buckets contiguously in
//! fixed order (`k, h, d, w, m, y`); see `DESIGN.md` for why a sequential
//! chain, rather than independent per-unit anchors, is the reading
//! implemented here.

use chrono::{DateTime, Duration, Utc};

use crate::schema::{Schema, Unit};
use crate::time::local_midnight;

/// One managed-or-foreign snapshot as the planner sees it: just enough to
/// place it in a bucket and decide whether it is protected regardless of
/// bucketing.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub created: DateTime<Utc>,
    pub managed: bool,
}

/// The planner's output: indices into the input slice, partitioned into
/// keep and destroy. Always covers every input index exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub keep: Vec<usize>,
    pub destroy: Vec<usize>,
}

struct BucketSpan {
    unit: Unit,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Lay out every configured bucket, nearest-to-now first, anchored at local
/// midnight: each unit's `count` buckets immediately follow the previous
/// unit's, so the walk cursor only ever moves backward in time.
fn bucket_plan(schema: &Schema, now: DateTime<Utc>) -> Vec<BucketSpan> {
    let mut edge = local_midnight(now);
    let mut spans = Vec::new();
    for unit in Unit::ORDER {
        let count = schema.count(unit);
        let unit_len = Duration::hours(unit.hours());
        for _ in 0..count {
            let end = edge;
            let start = edge - unit_len;
            spans.push(BucketSpan { unit, start, end });
            edge = start;
        }
    }
    spans
}

/// Run the planner. `clean_all` controls whether foreign-named snapshots
/// are eligible for destruction at all; when false they are always kept.
pub fn plan(schema: &Schema, candidates: &[Candidate], now: DateTime<Utc>, clean_all: bool) -> Verdict {
    let spans = bucket_plan(schema, now);
    let newest_edge = local_midnight(now);

    let mut bucket_members: Vec<Vec<usize>> = vec![Vec::new(); spans.len()];
    let mut keep = Vec::new();
    let mut destroy = Vec::new();

    for (i, candidate) in candidates.iter().enumerate() {
        // With no configured buckets there is no "first interval's start" to
        // be newer than, so the §4.4.2 keep rule is vacuous and every
        // candidate must fall through to the bucket search (which, with an
        // empty `spans`, always misses and lands in `destroy`).
        if !spans.is_empty() && candidate.created > newest_edge {
            keep.push(i);
            continue;
        }
        match spans
            .iter()
            .position(|span| candidate.created > span.start && candidate.created <= span.end)
        {
            Some(bucket_idx) => bucket_members[bucket_idx].push(i),
            None => destroy.push(i),
        }
    }

    for (bucket_idx, members) in bucket_members.into_iter().enumerate() {
        if members.is_empty() {
            continue;
        }
        if spans[bucket_idx].unit == Unit::K {
            keep.extend(members);
            continue;
        }
        let oldest = *members
            .iter()
            .min_by_key(|&&i| candidates[i].created)
            .expect("members is non-empty");
        for i in members {
            if i == oldest {
                keep.push(i);
            } else {
                destroy.push(i);
            }
        }
    }

    if !clean_all {
        let mut rescued = Vec::new();
        destroy.retain(|&i| {
            if candidates[i].managed {
                true
            } else {
                rescued.push(i);
                false
            }
        });
        keep.extend(rescued);
    }

    Verdict { keep, destroy }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn managed(created: DateTime<Utc>) -> Candidate {
        Candidate { created, managed: true }
    }

    fn foreign(created: DateTime<Utc>) -> Candidate {
        Candidate { created, managed: false }
    }

    #[test]
    fn empty_input_has_no_destroy() {
        let schema: Schema = "3d".parse().unwrap();
        let verdict = plan(&schema, &[], at(2024, 6, 15, 10, 30), false);
        assert!(verdict.destroy.is_empty());
        assert!(verdict.keep.is_empty());
    }

    #[test]
    fn empty_schema_destroys_every_managed_snapshot_regardless_of_recency() {
        // no buckets configured ⇒ no "first interval's start" exists, so even
        // a snapshot taken earlier the same day as `now` is not exempt
        let schema: Schema = "0k0h0d0w0m0y".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        let candidates = vec![managed(at(2024, 6, 15, 8, 0)), managed(at(2024, 6, 1, 0, 0))];
        let verdict = plan(&schema, &candidates, now, false);
        let mut destroyed = verdict.destroy.clone();
        destroyed.sort_unstable();
        assert_eq!(destroyed, vec![0, 1]);
        assert!(verdict.keep.is_empty());
    }

    #[test]
    fn keep_and_destroy_partition_all_inputs() {
        let schema: Schema = "2k24h7d".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        let candidates = vec![
            managed(at(2024, 6, 15, 0, 30)),
            managed(at(2024, 6, 13, 5, 0)),
            managed(at(2024, 6, 5, 0, 0)),
            managed(at(2024, 6, 1, 0, 0)),
        ];
        let verdict = plan(&schema, &candidates, now, false);
        let mut all: Vec<usize> = verdict.keep.iter().chain(verdict.destroy.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
        for k in &verdict.keep {
            assert!(!verdict.destroy.contains(k));
        }
    }

    #[test]
    fn foreign_is_always_kept_when_clean_all_false() {
        let schema: Schema = "0k0h0d0w0m0y".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        let candidates = vec![foreign(at(2020, 1, 1, 0, 0))];
        let verdict = plan(&schema, &candidates, now, false);
        assert_eq!(verdict.keep, vec![0]);
        assert!(verdict.destroy.is_empty());
    }

    #[test]
    fn clean_all_allows_foreign_destruction() {
        let schema: Schema = "0k0h0d0w0m0y".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        let candidates = vec![foreign(at(2020, 1, 1, 0, 0))];
        let verdict = plan(&schema, &candidates, now, true);
        assert_eq!(verdict.destroy, vec![0]);
    }

    #[test]
    fn non_k_bucket_keeps_only_the_oldest() {
        let schema: Schema = "0k3d".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        // all three fall in the same daily bucket two days back
        let candidates = vec![
            managed(at(2024, 6, 13, 1, 0)),
            managed(at(2024, 6, 13, 12, 0)),
            managed(at(2024, 6, 13, 23, 0)),
        ];
        let verdict = plan(&schema, &candidates, now, false);
        assert_eq!(verdict.keep, vec![0]);
        let mut destroyed = verdict.destroy.clone();
        destroyed.sort_unstable();
        assert_eq!(destroyed, vec![1, 2]);
    }

    #[test]
    fn k_bucket_keeps_every_member() {
        let schema: Schema = "2k".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        let candidates = vec![
            managed(at(2024, 6, 14, 1, 0)),
            managed(at(2024, 6, 14, 12, 0)),
            managed(at(2024, 6, 13, 6, 0)),
        ];
        let verdict = plan(&schema, &candidates, now, false);
        assert!(verdict.destroy.is_empty());
        assert_eq!(verdict.keep.len(), 3);
    }

    #[test]
    fn snapshot_newer_than_midnight_is_always_kept() {
        let schema: Schema = "0k24h".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        let candidates = vec![managed(at(2024, 6, 15, 0, 30))];
        let verdict = plan(&schema, &candidates, now, false);
        assert_eq!(verdict.keep, vec![0]);
    }

    #[test]
    fn snapshot_older_than_every_bucket_is_destroyed() {
        let schema: Schema = "2k24h7d".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        // exactly on the oldest bucket's start boundary: belongs to the
        // (nonexistent) older bucket, so it falls below everything
        let candidates = vec![managed(at(2024, 6, 5, 0, 0))];
        let verdict = plan(&schema, &candidates, now, false);
        assert_eq!(verdict.destroy, vec![0]);
    }

    #[test]
    fn idempotent_on_its_own_keep_set() {
        let schema: Schema = "2k24h7d3w".parse().unwrap();
        let now = at(2024, 6, 15, 10, 30);
        let candidates = vec![
            managed(at(2024, 6, 15, 0, 30)),
            managed(at(2024, 6, 14, 6, 0)),
            managed(at(2024, 6, 13, 2, 0)),
            managed(at(2024, 6, 13, 20, 0)),
            managed(at(2024, 5, 20, 0, 0)),
            managed(at(2024, 4, 1, 0, 0)),
        ];
        let first = plan(&schema, &candidates, now, false);
        let kept: Vec<Candidate> = first.keep.iter().map(|&i| candidates[i]).collect();
        let second = plan(&schema, &kept, now, false);
        assert!(second.destroy.is_empty());
    }

    #[test]
    fn boundary_equal_snapshot_belongs_to_older_bucket() {
        // two adjacent daily buckets share a boundary; a snapshot exactly on
        // it must land in the older bucket, not the newer one
        let schema: Schema = "0k2d".parse().unwrap();
        let now = at(2024, 6, 15, 0, 0);
        let boundary = local_midnight(now) - Duration::hours(24);
        let newer_bucket_member = managed(at(2024, 6, 14, 12, 0));
        let on_boundary = managed(boundary);
        let candidates = vec![newer_bucket_member, on_boundary];
        let verdict = plan(&schema, &candidates, now, false);
        // the boundary snapshot is alone in the older bucket, so it is kept
        // as that bucket's oldest (and only) member, not grouped with index 0
        assert!(verdict.keep.contains(&0));
        assert!(verdict.keep.contains(&1));
    }
}
