use std::time::{Duration, SystemTime};

use chrono::{Local, Timelike};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::ArtifactStore;

/// Inclusive range of local hours during which the store may be emptied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    start_hour: u32,
    end_hour: u32,
}

impl RetentionWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Option<Self> {
        if start_hour <= end_hour && end_hour <= 23 {
            Some(RetentionWindow {
                start_hour,
                end_hour,
            })
        } else {
            None
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        (self.start_hour..=self.end_hour).contains(&hour)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub in_window: bool,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Periodically deletes everything in the store during working hours.
///
/// There is no coordination with running jobs or downloads: a file being
/// written or streamed at the moment of a sweep is deleted like any other
/// unless `min_age` is set.
#[derive(Debug, Clone)]
pub struct Sweeper {
    store: ArtifactStore,
    window: RetentionWindow,
    min_age: Option<Duration>,
}

impl Sweeper {
    pub fn new(store: ArtifactStore, window: RetentionWindow, min_age: Option<Duration>) -> Self {
        Sweeper {
            store,
            window,
            min_age,
        }
    }

    /// Runs once immediately, then once per `every`, until the process exits.
    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    pub async fn tick(&self) -> SweepReport {
        self.sweep_at(Local::now().hour(), SystemTime::now()).await
    }

    pub async fn sweep_at(&self, hour: u32, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        if !self.window.contains(hour) {
            tracing::info!(hour, "sweep: outside retention window, skipping deletion");
            return report;
        }

        report.in_window = true;
        tracing::info!(hour, "sweep: within retention window, deleting files");

        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(store = %self.store.root().display(), error = %err, "sweep: failed to read store");
                return report;
            }
        };

        for entry in entries {
            if let (Some(min_age), Some(modified)) = (self.min_age, entry.modified) {
                let age = now.duration_since(modified).unwrap_or_default();
                if age < min_age {
                    tracing::debug!(file = %entry.file_name, age_secs = age.as_secs(), "sweep: too young, keeping");
                    report.skipped += 1;
                    continue;
                }
            }

            match tokio::fs::remove_file(&entry.path).await {
                Ok(()) => {
                    tracing::info!(file = %entry.file_name, "sweep: deleted file");
                    report.deleted += 1;
                }
                Err(err) => {
                    tracing::warn!(file = %entry.file_name, error = %err, "sweep: failed to delete file");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDir;

    fn seeded_store(dir: &TestDir) -> ArtifactStore {
        let store = ArtifactStore::open(dir.path().join("uploads")).unwrap();
        for name in ["a.pdf", "b.csv", "converted_1_ff.pdf"] {
            std::fs::write(store.root().join(name), b"data").unwrap();
        }
        store
    }

    fn remaining(store: &ArtifactStore) -> usize {
        std::fs::read_dir(store.root()).unwrap().count()
    }

    fn office_hours(store: ArtifactStore) -> Sweeper {
        Sweeper::new(store, RetentionWindow::new(8, 18).unwrap(), None)
    }

    #[test]
    fn window_is_inclusive_at_both_ends() {
        let window = RetentionWindow::new(8, 18).unwrap();
        assert!(!window.contains(7));
        assert!(window.contains(8));
        assert!(window.contains(10));
        assert!(window.contains(18));
        assert!(!window.contains(19));
    }

    #[test]
    fn inverted_or_out_of_range_windows_are_rejected() {
        assert_eq!(RetentionWindow::new(18, 8), None);
        assert_eq!(RetentionWindow::new(0, 24), None);
        assert!(RetentionWindow::new(0, 23).is_some());
    }

    #[tokio::test]
    async fn sweep_inside_window_deletes_everything() {
        let dir = TestDir::new();
        let store = seeded_store(&dir);
        let sweeper = office_hours(store.clone());

        let report = sweeper.sweep_at(10, SystemTime::now()).await;

        assert_eq!(report.deleted, 3);
        assert!(report.in_window);
        assert_eq!(remaining(&store), 0);
    }

    #[tokio::test]
    async fn sweep_outside_window_deletes_nothing() {
        let dir = TestDir::new();
        let store = seeded_store(&dir);
        let sweeper = office_hours(store.clone());

        let report = sweeper.sweep_at(19, SystemTime::now()).await;

        assert_eq!(report, SweepReport::default());
        assert_eq!(remaining(&store), 3);
    }

    #[tokio::test]
    async fn window_edges_both_delete() {
        for hour in [8, 18] {
            let dir = TestDir::new();
            let store = seeded_store(&dir);
            let report = office_hours(store.clone()).sweep_at(hour, SystemTime::now()).await;
            assert_eq!(report.deleted, 3, "hour {hour}");
            assert_eq!(remaining(&store), 0, "hour {hour}");
        }
    }

    #[tokio::test]
    async fn one_failed_delete_does_not_stop_the_sweep() {
        let dir = TestDir::new();
        let store = seeded_store(&dir);
        std::fs::create_dir(store.root().join("stray-directory")).unwrap();

        let report = office_hours(store.clone()).sweep_at(12, SystemTime::now()).await;

        assert_eq!(report.deleted, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(remaining(&store), 1);
    }

    #[tokio::test]
    async fn unreadable_store_is_logged_not_fatal() {
        let dir = TestDir::new();
        let store = seeded_store(&dir);
        std::fs::remove_dir_all(store.root()).unwrap();

        let report = office_hours(store).sweep_at(12, SystemTime::now()).await;

        assert!(report.in_window);
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn min_age_spares_fresh_files() {
        let dir = TestDir::new();
        let store = seeded_store(&dir);
        let sweeper = Sweeper::new(
            store.clone(),
            RetentionWindow::new(8, 18).unwrap(),
            Some(Duration::from_secs(3600)),
        );

        let report = sweeper.sweep_at(12, SystemTime::now()).await;
        assert_eq!(report.skipped, 3);
        assert_eq!(remaining(&store), 3);

        let later = SystemTime::now() + Duration::from_secs(7200);
        let report = sweeper.sweep_at(12, later).await;
        assert_eq!(report.deleted, 3);
        assert_eq!(remaining(&store), 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_at_startup() {
        let dir = TestDir::new();
        let store = seeded_store(&dir);
        let always = Sweeper::new(store.clone(), RetentionWindow::new(0, 23).unwrap(), None);

        let handle = always.spawn(Duration::from_secs(3600));

        for _ in 0..100 {
            if remaining(&store) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        assert_eq!(remaining(&store), 0);
    }
}
