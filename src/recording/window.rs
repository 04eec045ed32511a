// Trailing-window selection over the segment registry

use chrono::{DateTime, Duration, Utc};

use super::segments::{Segment, SegmentRegistry};

/// Segments whose `created_at` lies within `buffer_duration` of `now`,
/// ordered by sequence number.
///
/// Never fails: an empty vector means nothing qualifies and the caller decides
/// whether that matters. Segments stamped after `now` (clock skew between the
/// watcher and file metadata) are excluded along with the stale ones.
pub fn select_window(
    registry: &SegmentRegistry,
    now: DateTime<Utc>,
    buffer_duration: Duration,
) -> Vec<Segment> {
    let mut window: Vec<Segment> = registry
        .segments()
        .filter(|s| in_window(s, now, buffer_duration))
        .cloned()
        .collect();

    // HashMap iteration order is arbitrary; the numeric key is what matters
    window.sort_by_key(|s| s.sequence_number);
    window
}

/// Reorder a window from `select_window` into recording order.
///
/// Once the encoder has wrapped, the newest segments carry the lowest numbers
/// and sort to the front. The wrap point is the one boundary where
/// `created_at` falls by more than `wrap_gap` from one segment to the next;
/// everything after it belongs to the older lap and is moved ahead. A window
/// that does not span the wrap point is returned unchanged.
pub fn playback_order(mut window: Vec<Segment>, wrap_gap: std::time::Duration) -> Vec<Segment> {
    let wrap_at = window
        .windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let drop = (pair[0].created_at - pair[1].created_at).to_std().ok()?;
            (drop > wrap_gap).then_some((i + 1, drop))
        })
        .max_by_key(|(_, drop)| *drop)
        .map(|(i, _)| i);

    if let Some(i) = wrap_at {
        window.rotate_left(i);
    }
    window
}

/// Number of segments that would be selected, without cloning them
pub fn count_in_window(
    registry: &SegmentRegistry,
    now: DateTime<Utc>,
    buffer_duration: Duration,
) -> usize {
    registry
        .segments()
        .filter(|s| in_window(s, now, buffer_duration))
        .count()
}

fn in_window(segment: &Segment, now: DateTime<Utc>, buffer_duration: Duration) -> bool {
    let cutoff = now - buffer_duration;
    segment.created_at >= cutoff && segment.created_at <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::segments::SegmentNaming;
    use std::path::PathBuf;

    fn registry() -> SegmentRegistry {
        SegmentRegistry::new(
            PathBuf::from("/buf"),
            SegmentNaming::new("segment", "mp4"),
            std::time::Duration::from_secs(1),
        )
    }

    fn names(window: &[Segment]) -> Vec<u32> {
        window.iter().map(|s| s.sequence_number).collect()
    }

    #[test]
    fn filters_by_age_and_sorts_numerically() {
        let now = Utc::now();
        let mut reg = registry();
        // Inserted out of order, with mixed padding widths
        reg.record("segment010.mp4", now - Duration::seconds(5));
        reg.record("segment9.mp4", now - Duration::seconds(6));
        reg.record("segment002.mp4", now - Duration::seconds(59));
        reg.record("segment001.mp4", now - Duration::seconds(61));
        reg.record("segment100.mp4", now);

        let window = select_window(&reg, now, Duration::seconds(60));
        assert_eq!(names(&window), vec![2, 9, 10, 100]);
        assert_eq!(count_in_window(&reg, now, Duration::seconds(60)), 4);
    }

    #[test]
    fn cutoff_is_inclusive() {
        let now = Utc::now();
        let mut reg = registry();
        reg.record("segment001.mp4", now - Duration::seconds(60));
        reg.record("segment002.mp4", now - Duration::milliseconds(60_001));

        let window = select_window(&reg, now, Duration::seconds(60));
        assert_eq!(names(&window), vec![1]);
    }

    #[test]
    fn future_timestamps_are_excluded() {
        let now = Utc::now();
        let mut reg = registry();
        reg.record("segment001.mp4", now + Duration::seconds(3));
        reg.record("segment002.mp4", now);

        let window = select_window(&reg, now, Duration::seconds(60));
        assert_eq!(names(&window), vec![2]);
    }

    #[test]
    fn empty_window_is_not_an_error() {
        let now = Utc::now();
        let mut reg = registry();
        assert!(select_window(&reg, now, Duration::seconds(60)).is_empty());

        reg.record("segment001.mp4", now - Duration::seconds(300));
        assert!(select_window(&reg, now, Duration::seconds(60)).is_empty());
    }

    #[test]
    fn playback_order_moves_the_older_lap_first() {
        let now = Utc::now();
        let mut reg = registry();
        // Ring of 10: 6..9 are from the previous lap, 0..2 were rewritten since
        for (seq, age_ms) in [(6, 3500), (7, 3000), (8, 2500), (9, 2000), (0, 1500), (1, 1000), (2, 500)] {
            reg.record(&format!("segment{:03}.mp4", seq), now - Duration::milliseconds(age_ms));
        }

        let window = select_window(&reg, now, Duration::seconds(60));
        assert_eq!(names(&window), vec![0, 1, 2, 6, 7, 8, 9]);

        let ordered = playback_order(window, std::time::Duration::from_secs(1));
        assert_eq!(names(&ordered), vec![6, 7, 8, 9, 0, 1, 2]);
        assert!(ordered.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn playback_order_ignores_small_jitter() {
        let now = Utc::now();
        let mut reg = registry();
        // Observation jitter stamps 4 a little earlier than 3
        reg.record("segment003.mp4", now - Duration::milliseconds(900));
        reg.record("segment004.mp4", now - Duration::milliseconds(950));
        reg.record("segment005.mp4", now - Duration::milliseconds(400));

        let window = select_window(&reg, now, Duration::seconds(60));
        let ordered = playback_order(window, std::time::Duration::from_secs(1));
        assert_eq!(names(&ordered), vec![3, 4, 5]);
        assert!(playback_order(Vec::new(), std::time::Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn every_insertion_order_gives_the_same_window() {
        let now = Utc::now();
        let stamps: Vec<(u32, i64)> = vec![(5, 1), (3, 70), (8, 20), (1, 59), (13, 0), (2, 61)];

        // Rotate the insertion order through every starting point
        for start in 0..stamps.len() {
            let mut reg = registry();
            for i in 0..stamps.len() {
                let (seq, age) = stamps[(start + i) % stamps.len()];
                reg.record(&format!("segment{:03}.mp4", seq), now - Duration::seconds(age));
            }
            let window = select_window(&reg, now, Duration::seconds(60));
            assert_eq!(names(&window), vec![1, 5, 8, 13]);
            assert!(window.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
        }
    }
}
