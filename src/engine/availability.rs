use crate::model::*;

// ── Free windows ──────────────────────────────────────────────────

/// Parts of `query` not covered by a block or a live booking.
/// Non-bookable resources have no free windows.
pub fn free_windows(resource: &ResourceState, query: &Span) -> Vec<Span> {
    if resource.status != ResourceStatus::Available {
        return Vec::new();
    }
    let mut occupied: Vec<Span> = resource
        .overlapping(query)
        .filter(|i| i.occupies())
        .map(|i| Span::new(i.span.start.max(query.start), i.span.end.min(query.end)))
        .collect();
    occupied.sort_by_key(|s| s.start);
    let occupied = merge_overlapping(&occupied);
    subtract_intervals(&[*query], &occupied)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
