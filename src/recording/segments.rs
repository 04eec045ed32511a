// Segment registry: which segment files exist in the buffer directory and when
// each one was produced.
//
// The registry is fed from two directions. The directory watcher records a
// segment as soon as it notices the encoder opening it (trusted timestamp),
// and reconciliation against a directory listing fills in anything the watcher
// missed using file metadata. Reconciliation is the authoritative fallback: after
// it runs, the registry never knows fewer segments than the directory holds.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where a segment's `created_at` came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Observed by the directory watcher when the encoder opened the file
    Notified,
    /// Taken from the file's modification time during reconciliation
    FileModified,
    /// The file could not be stat'ed; the reconciliation time was used instead
    Fallback,
}

impl TimestampSource {
    /// Whether the timestamp reflects the real creation time
    pub fn is_trusted(&self) -> bool {
        !matches!(self, TimestampSource::Fallback)
    }
}

/// One fixed-duration chunk of recorded media
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Number embedded in the file name; wraps at the configured segment count
    pub sequence_number: u32,
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub source: TimestampSource,
}

/// Naming scheme of the encoder's segment files: `<prefix><digits>.<extension>`
#[derive(Debug, Clone)]
pub struct SegmentNaming {
    pub prefix: String,
    pub extension: String,
}

impl SegmentNaming {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    /// Parse the sequence number out of a segment file name.
    ///
    /// The number is parsed rather than compared as text so a change in
    /// zero-padding width (`segment7.mp4` vs `segment007.mp4`) still orders
    /// correctly. Returns `None` for anything that is not a segment file.
    pub fn sequence_number(&self, file_name: &str) -> Option<u32> {
        let digits = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn is_segment(&self, file_name: &str) -> bool {
        self.sequence_number(file_name).is_some()
    }

    /// printf-style output pattern handed to the encoder's segment muxer
    pub fn encoder_pattern(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}%03d.{}", self.prefix, self.extension))
    }
}

/// Counts from one reconciliation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub refreshed: usize,
    pub forgotten: usize,
}

/// In-memory map of segment file name -> creation record
pub struct SegmentRegistry {
    dir: PathBuf,
    naming: SegmentNaming,
    /// A file whose mtime is this much newer than its record was rewritten
    /// after wraparound without the watcher noticing
    rewrite_gap: Duration,
    entries: HashMap<String, Segment>,
}

impl SegmentRegistry {
    pub fn new(dir: PathBuf, naming: SegmentNaming, rewrite_gap: Duration) -> Self {
        Self {
            dir,
            naming,
            rewrite_gap,
            entries: HashMap::new(),
        }
    }

    pub fn naming(&self) -> &SegmentNaming {
        &self.naming
    }

    /// Record (or re-record after wraparound) a segment observed at `timestamp`.
    /// Names that are not segment files are ignored.
    pub fn record(&mut self, name: &str, timestamp: DateTime<Utc>) -> bool {
        self.insert(name, timestamp, TimestampSource::Notified)
    }

    fn insert(&mut self, name: &str, timestamp: DateTime<Utc>, source: TimestampSource) -> bool {
        let Some(sequence_number) = self.naming.sequence_number(name) else {
            return false;
        };
        self.entries.insert(
            name.to_string(),
            Segment {
                sequence_number,
                name: name.to_string(),
                path: self.dir.join(name),
                created_at: timestamp,
                source,
            },
        );
        true
    }

    pub fn forget(&mut self, name: &str) -> Option<Segment> {
        self.entries.remove(name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Segment> {
        self.entries.get(name)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.entries.values()
    }

    /// Bring the registry in line with the buffer directory.
    ///
    /// - files not yet known are added with their mtime (or `now` if stat fails)
    /// - known files rewritten since they were recorded get the newer mtime
    /// - entries whose file is gone are forgotten
    ///
    /// Failures on individual files are logged and skipped. A missing or
    /// unreadable directory leaves the registry untouched.
    pub async fn reconcile_with_filesystem(&mut self, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                log::warn!("Cannot list buffer directory {}: {}", self.dir.display(), e);
                return report;
            }
        };

        let mut on_disk: HashSet<String> = HashSet::new();
        let mut complete = true;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Error while listing {}: {}", self.dir.display(), e);
                    complete = false;
                    break;
                }
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.naming.is_segment(&name) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => Some(DateTime::<Utc>::from(modified)),
                Err(e) => {
                    log::warn!("Cannot stat segment {}: {}", name, e);
                    None
                }
            };

            let known = self.entries.get(&name).map(|s| s.created_at);
            match (known, modified) {
                (None, Some(mtime)) => {
                    self.insert(&name, mtime, TimestampSource::FileModified);
                    report.added += 1;
                }
                (None, None) => {
                    self.insert(&name, now, TimestampSource::Fallback);
                    report.added += 1;
                }
                (Some(recorded), Some(mtime)) if self.was_rewritten(recorded, mtime) => {
                    self.insert(&name, mtime, TimestampSource::FileModified);
                    report.refreshed += 1;
                }
                _ => {}
            }
            on_disk.insert(name);
        }

        // A partial listing cannot prove a file is gone
        if complete {
            let before = self.entries.len();
            self.entries.retain(|name, _| on_disk.contains(name));
            report.forgotten = before - self.entries.len();
        }

        if report != ReconcileReport::default() {
            log::debug!(
                "Reconciled buffer: +{} added, {} refreshed, {} forgotten ({} total)",
                report.added,
                report.refreshed,
                report.forgotten,
                self.entries.len()
            );
        }

        report
    }

    fn was_rewritten(&self, recorded: DateTime<Utc>, mtime: DateTime<Utc>) -> bool {
        match (mtime - recorded).to_std() {
            Ok(delta) => delta > self.rewrite_gap,
            // mtime older than the record: nothing new happened to the file
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;

    fn naming() -> SegmentNaming {
        SegmentNaming::new("segment", "mp4")
    }

    fn registry(dir: &Path) -> SegmentRegistry {
        SegmentRegistry::new(dir.to_path_buf(), naming(), Duration::from_secs(1))
    }

    // Filesystems differ in mtime precision
    fn assert_close(a: DateTime<Utc>, b: DateTime<Utc>) {
        assert!((a - b).num_milliseconds().abs() < 1000, "{} vs {}", a, b);
    }

    fn touch(dir: &Path, name: &str, mtime: SystemTime) {
        let file = File::create(dir.join(name)).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn parses_sequence_numbers_regardless_of_padding() {
        let n = naming();
        assert_eq!(n.sequence_number("segment000.mp4"), Some(0));
        assert_eq!(n.sequence_number("segment042.mp4"), Some(42));
        assert_eq!(n.sequence_number("segment7.mp4"), Some(7));
        assert_eq!(n.sequence_number("segment1234.mp4"), Some(1234));
    }

    #[test]
    fn rejects_non_segment_names() {
        let n = naming();
        assert_eq!(n.sequence_number("segment.mp4"), None);
        assert_eq!(n.sequence_number("segmentabc.mp4"), None);
        assert_eq!(n.sequence_number("segment001.mkv"), None);
        assert_eq!(n.sequence_number("segment001mp4"), None);
        assert_eq!(n.sequence_number("filelist-1234.txt"), None);
        assert_eq!(n.sequence_number("other001.mp4"), None);
    }

    #[test]
    fn encoder_pattern_uses_three_digit_padding() {
        let pattern = naming().encoder_pattern(Path::new("/dev/shm/buffer"));
        assert_eq!(pattern, PathBuf::from("/dev/shm/buffer/segment%03d.mp4"));
    }

    #[test]
    fn record_forget_clear() {
        let mut reg = registry(Path::new("/tmp/none"));
        let now = Utc::now();
        assert!(reg.record("segment001.mp4", now));
        assert!(reg.record("segment002.mp4", now));
        assert!(!reg.record("notes.txt", now));
        assert_eq!(reg.len(), 2);

        let seg = reg.get("segment002.mp4").unwrap();
        assert_eq!(seg.sequence_number, 2);
        assert_eq!(seg.source, TimestampSource::Notified);
        assert_eq!(seg.path, PathBuf::from("/tmp/none/segment002.mp4"));

        assert!(reg.forget("segment001.mp4").is_some());
        assert!(reg.forget("segment001.mp4").is_none());
        reg.clear();
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn reconcile_adds_untracked_files_with_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(10);
        touch(dir.path(), "segment000.mp4", mtime);
        touch(dir.path(), "segment001.mp4", mtime);
        touch(dir.path(), "filelist.txt", mtime);

        let mut reg = registry(dir.path());
        let now = Utc::now();
        reg.record("segment001.mp4", now);

        let report = reg.reconcile_with_filesystem(now).await;
        assert_eq!(report.added, 1);
        assert_eq!(reg.len(), 2);

        let added = reg.get("segment000.mp4").unwrap();
        assert_eq!(added.source, TimestampSource::FileModified);
        assert_close(added.created_at, DateTime::<Utc>::from(mtime));

        // The watcher's record is newer than the mtime and is kept
        let kept = reg.get("segment001.mp4").unwrap();
        assert_eq!(kept.source, TimestampSource::Notified);
        assert_eq!(kept.created_at, now);
    }

    #[tokio::test]
    async fn reconcile_never_reports_fewer_than_disk() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            touch(dir.path(), &format!("segment{:03}.mp4", i), SystemTime::now());
        }
        let mut reg = registry(dir.path());
        reg.reconcile_with_filesystem(Utc::now()).await;
        assert_eq!(reg.len(), 12);
    }

    #[tokio::test]
    async fn reconcile_forgets_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "segment000.mp4", SystemTime::now());

        let mut reg = registry(dir.path());
        let now = Utc::now();
        reg.record("segment000.mp4", now);
        reg.record("segment001.mp4", now);

        let report = reg.reconcile_with_filesystem(now).await;
        assert_eq!(report.forgotten, 1);
        assert!(reg.get("segment001.mp4").is_none());
        assert!(reg.get("segment000.mp4").is_some());
    }

    #[tokio::test]
    async fn reconcile_refreshes_rewritten_segments() {
        let dir = tempfile::tempdir().unwrap();
        let rewritten = SystemTime::now();
        touch(dir.path(), "segment003.mp4", rewritten);

        let mut reg = registry(dir.path());
        let stale = Utc::now() - chrono::Duration::seconds(70);
        reg.record("segment003.mp4", stale);

        let report = reg.reconcile_with_filesystem(Utc::now()).await;
        assert_eq!(report.refreshed, 1);
        let seg = reg.get("segment003.mp4").unwrap();
        assert_close(seg.created_at, DateTime::<Utc>::from(rewritten));
        assert_eq!(seg.source, TimestampSource::FileModified);
    }

    #[tokio::test]
    async fn reconcile_tolerates_missing_directory() {
        let mut reg = registry(Path::new("/nonexistent/kiosk-replay-buffer"));
        reg.record("segment000.mp4", Utc::now());
        let report = reg.reconcile_with_filesystem(Utc::now()).await;
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn fallback_timestamps_are_flagged_untrusted() {
        assert!(TimestampSource::Notified.is_trusted());
        assert!(TimestampSource::FileModified.is_trusted());
        assert!(!TimestampSource::Fallback.is_trusted());
    }
}
