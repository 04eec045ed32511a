// Buffer directory observer
//
// Scans the buffer directory on a short interval and reports each segment
// file the moment it is first seen, and again whenever the encoder reopens it
// after wrapping around. The observation time stands in for the creation time,
// so the interval bounds how far off a recorded timestamp can be.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::segments::SegmentNaming;

/// Watcher settings
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub dir: PathBuf,
    pub naming: SegmentNaming,
    pub interval: Duration,
    /// An mtime jump larger than this means the file was rewritten
    pub rewrite_gap: Duration,
}

/// Start observing. `on_observed(name, observed_at)` is called from the
/// watcher task; abort the handle to stop.
pub fn spawn_segment_watcher<F>(settings: WatchSettings, on_observed: F) -> JoinHandle<()>
where
    F: Fn(String, DateTime<Utc>) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        log::debug!(
            "[Watcher] Observing {} every {:?}",
            settings.dir.display(),
            settings.interval
        );
        let mut scanner = Scanner::new(settings.naming.clone(), settings.rewrite_gap);
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let listing = match list(&settings.dir, &scanner.naming).await {
                Ok(listing) => listing,
                Err(e) => {
                    log::debug!("[Watcher] Cannot scan {}: {}", settings.dir.display(), e);
                    continue;
                }
            };
            let now = Utc::now();
            for name in scanner.scan(listing) {
                on_observed(name, now);
            }
        }
    })
}

async fn list(
    dir: &std::path::Path,
    naming: &SegmentNaming,
) -> std::io::Result<Vec<(String, Option<SystemTime>)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut listing = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !naming.is_segment(&name) {
            continue;
        }
        // A file deleted between listing and stat is simply skipped next round
        let modified = entry.metadata().await.and_then(|m| m.modified()).ok();
        listing.push((name, modified));
    }
    Ok(listing)
}

/// Change detection between consecutive listings
struct Scanner {
    naming: SegmentNaming,
    rewrite_gap: Duration,
    seen: HashMap<String, Option<SystemTime>>,
}

impl Scanner {
    fn new(naming: SegmentNaming, rewrite_gap: Duration) -> Self {
        Self {
            naming,
            rewrite_gap,
            seen: HashMap::new(),
        }
    }

    /// Names that are new or were reopened since the previous listing
    fn scan(&mut self, listing: Vec<(String, Option<SystemTime>)>) -> Vec<String> {
        let mut observed = Vec::new();
        let mut current = HashMap::with_capacity(listing.len());

        for (name, modified) in listing {
            let reopened = match self.seen.get(&name) {
                None => true,
                Some(Some(previous)) => match modified.and_then(|m| m.duration_since(*previous).ok()) {
                    Some(jump) => jump > self.rewrite_gap,
                    None => false,
                },
                Some(None) => false,
            };
            if reopened {
                observed.push(name.clone());
            }
            current.insert(name, modified);
        }

        self.seen = current;
        observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn scanner() -> Scanner {
        Scanner::new(SegmentNaming::new("segment", "mp4"), Duration::from_secs(1))
    }

    #[test]
    fn reports_new_files_once() {
        let mut s = scanner();
        let t = SystemTime::now();
        assert_eq!(s.scan(vec![("segment000.mp4".into(), Some(t))]), vec!["segment000.mp4"]);

        // Still being written: small mtime steps are not a reopen
        let t2 = t + Duration::from_millis(400);
        let observed = s.scan(vec![
            ("segment000.mp4".into(), Some(t2)),
            ("segment001.mp4".into(), Some(t2)),
        ]);
        assert_eq!(observed, vec!["segment001.mp4"]);
    }

    #[test]
    fn reports_reopened_files_after_wraparound() {
        let mut s = scanner();
        let t = SystemTime::now();
        s.scan(vec![("segment005.mp4".into(), Some(t))]);

        let later = t + Duration::from_secs(60);
        assert_eq!(
            s.scan(vec![("segment005.mp4".into(), Some(later))]),
            vec!["segment005.mp4"]
        );
        assert!(s.scan(vec![("segment005.mp4".into(), Some(later))]).is_empty());
    }

    #[test]
    fn deleted_then_recreated_is_new_again() {
        let mut s = scanner();
        let t = SystemTime::now();
        s.scan(vec![("segment001.mp4".into(), Some(t))]);
        assert!(s.scan(Vec::new()).is_empty());
        assert_eq!(s.scan(vec![("segment001.mp4".into(), Some(t))]), vec!["segment001.mp4"]);
    }

    #[tokio::test]
    async fn watcher_reports_files_written_into_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let task = spawn_segment_watcher(
            WatchSettings {
                dir: dir.path().to_path_buf(),
                naming: SegmentNaming::new("segment", "mp4"),
                interval: Duration::from_millis(20),
                rewrite_gap: Duration::from_secs(1),
            },
            move |name, at| seen_clone.lock().push((name, at)),
        );

        std::fs::write(dir.path().join("segment000.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("filelist-1.txt"), b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "segment000.mp4");
        assert!(seen[0].1 <= Utc::now());
    }
}
