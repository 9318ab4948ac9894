//! Range Planner (§4.5): turns a remote occupied-range listing into a lazy,
//! pause/resume-capable sequence of data/zero-fill ranges obeying min/max
//! chunk rules.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::StorageClientResult;

/// Whether a planned range corresponds to real remote bytes or a gap to be
/// synthesized as zeros (§3 Range).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Data,
    Zero,
}

/// An inclusive byte range the caller should fetch (or synthesize, if `Zero`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub kind: RangeKind,
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Supplies the occupied (non-sparse) sub-ranges within a paging window.
/// Implementations must return entries sorted by `start`, non-overlapping,
/// and clipped to `[start, start + len - 1]`.
#[async_trait]
pub trait RemoteRangeSource: Send + Sync {
    async fn list_occupied(&self, start: u64, len: u64) -> StorageClientResult<Vec<(u64, u64)>>;
}

fn build_page_ranges(page_start: u64, page_end: u64, occupied: Vec<(u64, u64)>) -> Vec<Range> {
    let mut out = Vec::new();
    let mut cursor = page_start;
    for (start, end) in occupied {
        if start > cursor {
            out.push(Range { kind: RangeKind::Zero, start: cursor, end: start - 1 });
        }
        out.push(Range { kind: RangeKind::Data, start, end });
        cursor = end + 1;
    }
    if cursor <= page_end {
        out.push(Range { kind: RangeKind::Zero, start: cursor, end: page_end });
    }
    out
}

/// Extends a `Data` range shorter than `s_min` forward into whatever follows
/// it (gap or more data), capped at `s_max` total length from its own start,
/// so small isolated chunks don't become their own tiny request — but only
/// when another occupied range still follows later in the page. A trailing
/// sub-`Smin` fragment with nothing more ahead has no data to align with, so
/// padding it would just reclassify pure sparse territory as `Data` for no
/// benefit, in violation of "gaps are always zero-filled" (§4.5, §8 scenario 4).
fn merge_below_min(mut ranges: Vec<Range>, s_min: u64, s_max: u64) -> Vec<Range> {
    let mut i = 0;
    while i < ranges.len() {
        let has_later_data = ranges[(i + 1)..].iter().any(|r| r.kind == RangeKind::Data);
        if ranges[i].kind == RangeKind::Data && ranges[i].len() < s_min && has_later_data {
            let cap_end = ranges[i].start + s_max - 1;
            while ranges[i].len() < s_min && ranges[i].end < cap_end {
                let adjacent = i + 1 < ranges.len() && ranges[i + 1].start == ranges[i].end + 1;
                if !adjacent {
                    break;
                }
                let consume_end = ranges[i + 1].end.min(cap_end);
                ranges[i].end = consume_end;
                if ranges[i + 1].end <= consume_end {
                    ranges.remove(i + 1);
                } else {
                    ranges[i + 1].start = consume_end + 1;
                }
            }
        }
        i += 1;
    }
    ranges
}

fn split_above_max(ranges: Vec<Range>, s_max: u64) -> Vec<Range> {
    let mut out = Vec::new();
    for r in ranges {
        let mut start = r.start;
        while start <= r.end {
            let end = (start + s_max - 1).min(r.end);
            out.push(Range { kind: r.kind, start, end });
            start = end + 1;
        }
    }
    out
}

/// Lazily enumerates `[w0, min(total - 1, w1)]` as a sequence of [`Range`]s,
/// paging the remote occupied-range listing in windows of `page_size` (§4.5).
pub struct RangePlanner<S: RemoteRangeSource> {
    source: S,
    window_end: u64,
    position: u64,
    page_size: u64,
    s_min: u64,
    s_max: u64,
    paused: bool,
    pending: VecDeque<Range>,
}

impl<S: RemoteRangeSource> RangePlanner<S> {
    pub fn new(source: S, total: u64, w0: u64, w1: u64, s_min: u64, s_max: u64, page_size: u64) -> Self {
        let window_end = total.saturating_sub(1).min(w1);
        Self {
            source,
            window_end,
            position: w0,
            page_size,
            s_min,
            s_max,
            paused: false,
            pending: VecDeque::new(),
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Returns the next range, paging the remote listing as needed. Returns
    /// `Ok(None)` once the window is exhausted (the planner's `end` event) or
    /// immediately while paused with nothing already buffered.
    pub async fn next(&mut self) -> StorageClientResult<Option<Range>> {
        loop {
            if let Some(r) = self.pending.pop_front() {
                return Ok(Some(r));
            }
            if self.paused {
                return Ok(None);
            }
            if self.position > self.window_end {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> StorageClientResult<()> {
        let page_start = self.position;
        let page_len = self.page_size.min(self.window_end - page_start + 1);
        let page_end = page_start + page_len - 1;

        let occupied = self.source.list_occupied(page_start, page_len).await?;
        let raw = build_page_ranges(page_start, page_end, occupied);
        let merged = merge_below_min(raw, self.s_min, self.s_max);
        let planned = split_above_max(merged, self.s_max);

        self.pending.extend(planned);
        self.position = page_end + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<(u64, u64)>);

    #[async_trait]
    impl RemoteRangeSource for FixedSource {
        async fn list_occupied(&self, start: u64, len: u64) -> StorageClientResult<Vec<(u64, u64)>> {
            let end = start + len - 1;
            Ok(self
                .0
                .iter()
                .filter(|(s, e)| *s <= end && *e >= start)
                .map(|(s, e)| (*s.max(&start), *e.min(&end)))
                .collect())
        }
    }

    const MIB: u64 = 1024 * 1024;

    #[tokio::test]
    async fn scenario_4_merges_small_chunk_and_zero_fills_gaps() {
        let total = 10 * 1024 * MIB; // 10 GiB
        let source = FixedSource(vec![(0, MIB - 1), (8 * MIB, 9 * MIB - 1)]);
        let mut planner = RangePlanner::new(source, total, 0, u64::MAX, 2 * MIB, 4 * MIB, 148 * MIB);

        let first = planner.next().await.unwrap().unwrap();
        assert_eq!(first, Range { kind: RangeKind::Data, start: 0, end: 4 * MIB - 1 });

        let second = planner.next().await.unwrap().unwrap();
        assert_eq!(second, Range { kind: RangeKind::Zero, start: 4 * MIB, end: 8 * MIB - 1 });

        let third = planner.next().await.unwrap().unwrap();
        assert_eq!(third, Range { kind: RangeKind::Data, start: 8 * MIB, end: 9 * MIB - 1 });
    }

    #[tokio::test]
    async fn covers_the_full_window_with_strictly_increasing_starts() {
        let total = 20 * MIB;
        let source = FixedSource(vec![(5 * MIB, 6 * MIB - 1)]);
        let mut planner = RangePlanner::new(source, total, 0, u64::MAX, MIB, 4 * MIB, 20 * MIB);

        let mut ranges = Vec::new();
        while let Some(r) = planner.next().await.unwrap() {
            ranges.push(r);
        }

        assert_eq!(ranges.first().unwrap().start, 0);
        assert_eq!(ranges.last().unwrap().end, total - 1);
        for w in ranges.windows(2) {
            assert!(w[1].start > w[0].start);
            assert_eq!(w[1].start, w[0].end + 1, "no gaps and no overlap");
        }
        for r in &ranges {
            assert!(r.len() <= 4 * MIB);
        }
    }

    #[tokio::test]
    async fn pausing_stops_emission_until_resumed() {
        let total = 10 * MIB;
        let source = FixedSource(vec![]);
        let mut planner = RangePlanner::new(source, total, 0, u64::MAX, MIB, 4 * MIB, 20 * MIB);
        planner.pause();
        assert_eq!(planner.next().await.unwrap(), None);
        planner.resume();
        assert!(planner.next().await.unwrap().is_some());
    }

    #[test]
    fn split_above_max_never_emits_an_oversized_chunk() {
        let ranges = vec![Range { kind: RangeKind::Zero, start: 0, end: 10 * MIB - 1 }];
        let split = split_above_max(ranges, 4 * MIB);
        assert!(split.iter().all(|r| r.len() <= 4 * MIB));
        assert_eq!(split.last().unwrap().end, 10 * MIB - 1);
    }
}
