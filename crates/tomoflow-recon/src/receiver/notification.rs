use parking_lot::{Condvar, Mutex};

/// Synchronisation point between the receiver modules and the source stage.
///
/// Each module reports the newest scan index it has fully written into its
/// ring buffer. `fetch` waits until every module has completed an index
/// newer than the previously fetched one and returns the most recent
/// complete index; if the pipeline falls behind the scanner, intermediate
/// scans are skipped rather than queued. A module that times out ends the
/// stream.
pub struct ScanNotification {
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    /// Newest completed index per module, -1 before the first scan.
    latest: Vec<i64>,
    /// Modules that have stopped receiving.
    finished: Vec<bool>,
    last_fetched: i64,
    closed: bool,
}

impl ScanNotification {
    pub fn new(modules: usize) -> Self {
        Self {
            state: Mutex::new(State {
                latest: vec![-1; modules],
                finished: vec![false; modules],
                last_fetched: -1,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Module `module` finished writing scan `index` into its buffer.
    pub fn notify(&self, module: usize, index: u64) {
        let mut state = self.state.lock();
        if (index as i64) > state.latest[module] {
            state.latest[module] = index as i64;
        }
        self.cv.notify_all();
    }

    /// Module `module` will not receive any more packets.
    pub fn finish(&self, module: usize) {
        let mut state = self.state.lock();
        state.finished[module] = true;
        self.cv.notify_all();
    }

    /// Stop all fetchers immediately.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cv.notify_all();
    }

    /// Block until a new complete scan exists; `None` once any module has
    /// finished or the notification was closed.
    pub fn fetch(&self) -> Option<u64> {
        let mut state = self.state.lock();
        loop {
            if state.closed || state.finished.iter().any(|&f| f) {
                return None;
            }
            let complete = state.latest.iter().copied().min().unwrap_or(-1);
            if complete > state.last_fetched {
                state.last_fetched = complete;
                return Some(complete as u64);
            }
            self.cv.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fetch_waits_for_all_modules() {
        let n = Arc::new(ScanNotification::new(2));

        let fetcher = {
            let n = Arc::clone(&n);
            std::thread::spawn(move || n.fetch())
        };
        n.notify(0, 0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!fetcher.is_finished());

        n.notify(1, 0);
        assert_eq!(fetcher.join().unwrap(), Some(0));
    }

    #[test]
    fn fetch_skips_to_most_recent_complete_scan() {
        let n = ScanNotification::new(2);
        for index in 0..5 {
            n.notify(0, index);
            n.notify(1, index);
        }
        assert_eq!(n.fetch(), Some(4));
    }

    #[test]
    fn finished_module_ends_the_stream() {
        let n = ScanNotification::new(3);
        n.notify(0, 1);
        n.finish(2);
        assert_eq!(n.fetch(), None);
    }

    #[test]
    fn close_wakes_blocked_fetcher() {
        let n = Arc::new(ScanNotification::new(1));
        let fetcher = {
            let n = Arc::clone(&n);
            std::thread::spawn(move || n.fetch())
        };
        std::thread::sleep(Duration::from_millis(50));
        n.close();
        assert_eq!(fetcher.join().unwrap(), None);
    }
}
