//! Progress accounting for long scan runs.
//!
//! The tracker distinguishes productive work (`completed`) from retries
//! and extra verification passes (`overhead`). Rates are computed over a
//! sliding window so the ETA follows the current pool behavior instead
//! of the whole run's average.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    completed: u64,
    overhead: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    overhead: u64,
    entries: Vec<Entry>,
}

pub struct ProgressTracker {
    total: u64,
    unit: String,
    show_percent: bool,
    show_speed: bool,
    show_eta: bool,
    average_window: Duration,
    start: Instant,
    inner: Mutex<Counters>,
}

impl ProgressTracker {
    /// Tracker for `total` work units; `unit` names them in the status
    /// line (e.g. `hosts`). The averaging window defaults to 30 minutes.
    pub fn new(total: u64, unit: &str) -> Self {
        Self {
            total,
            unit: if unit.is_empty() {
                String::new()
            } else {
                format!(" {unit}")
            },
            show_percent: true,
            show_speed: true,
            show_eta: true,
            average_window: Duration::from_secs(30 * 60),
            start: Instant::now(),
            inner: Mutex::new(Counters::default()),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.average_window = window;
        self
    }

    pub fn log_completed(&self, completed: u64) {
        let mut inner = self.inner.lock().expect("progress lock");
        inner.entries.push(Entry {
            at: Instant::now(),
            completed,
            overhead: 0,
        });
        inner.completed += completed;
    }

    pub fn log_overhead(&self, overhead: u64) {
        let mut inner = self.inner.lock().expect("progress lock");
        inner.entries.push(Entry {
            at: Instant::now(),
            completed: 0,
            overhead,
        });
        inner.overhead += overhead;
    }

    pub fn completed(&self) -> u64 {
        self.inner.lock().expect("progress lock").completed
    }

    pub fn overhead(&self) -> u64 {
        self.inner.lock().expect("progress lock").overhead
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Percent of productive work done, capped at 100.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (100.0 * self.completed() as f64 / self.total as f64).min(100.0)
    }
}

impl fmt::Display for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("progress lock");
        let now = Instant::now();
        let overall_time = now.duration_since(self.start).as_secs_f64();

        let net_total = self.total.max(1) as f64;
        let net_done = inner.completed as f64;
        let net_percent = (100.0 * net_done / net_total).min(100.0);

        // Gross values take overhead into account; the gross total is
        // extrapolated from the overhead rate observed so far.
        let gross_done = (inner.completed + inner.overhead) as f64;
        let gross_total = if inner.completed == 0 {
            net_total
        } else {
            net_total * gross_done / net_done
        };
        let gross_todo = gross_total - gross_done;

        let overhead_percent = if inner.completed == 0 {
            0.0
        } else {
            100.0 * inner.overhead as f64 / net_done
        };

        // Sliding window; the first entry only anchors the time span.
        let earliest = now.checked_sub(self.average_window);
        let window_start = earliest
            .map(|cutoff| inner.entries.partition_point(|entry| entry.at < cutoff))
            .unwrap_or(0);
        let window = &inner.entries[window_start..];

        if window.len() < 2 {
            if self.show_percent {
                write!(f, "{net_percent:.0}% ")?;
            }
            write!(f, "{}/{}", inner.completed.min(self.total), self.total)?;
            write!(f, ", {overhead_percent:.0}% overhead")?;
            if self.show_speed {
                write!(f, ", --{}/s net, --{}/s gross", self.unit, self.unit)?;
            }
            if self.show_eta {
                write!(f, ", ETA --")?;
            }
            return Ok(());
        }

        let span = window[window.len() - 1]
            .at
            .duration_since(window[0].at)
            .as_secs_f64();
        let win_completed: u64 = window[1..].iter().map(|entry| entry.completed).sum();
        let win_overhead: u64 = window[1..].iter().map(|entry| entry.overhead).sum();

        let gross_speed = if overall_time > 0.0 {
            gross_done / overall_time
        } else {
            0.0
        };
        let (net_win_speed, gross_win_speed) = if span > 0.0 {
            (
                win_completed as f64 / span,
                (win_completed + win_overhead) as f64 / span,
            )
        } else {
            (0.0, 0.0)
        };

        if self.show_percent {
            write!(f, "{net_percent:.0}% ")?;
        }
        write!(f, "{}/{}", inner.completed.min(self.total), self.total)?;
        write!(f, ", {overhead_percent:.1}% overhead")?;

        if self.show_speed {
            let scales = [
                (0.001, "/ms"),
                (1.0, "/s"),
                (60.0, "/min"),
                (3600.0, "/h"),
                (86400.0, "/day"),
            ];
            let mut picked = scales[1];
            for candidate in scales {
                picked = candidate;
                if gross_speed * candidate.0 > 100.0 {
                    break;
                }
            }
            let (scale, suffix) = picked;
            write!(f, ", {:.0}{}{} net", scale * net_win_speed, self.unit, suffix)?;
            write!(f, ", {:.0}{}{} gross", scale * gross_win_speed, self.unit, suffix)?;
        }

        if self.show_eta {
            if gross_win_speed > 0.0 {
                let eta = Utc::now()
                    + chrono::Duration::milliseconds(
                        ((gross_todo / gross_win_speed) * 1000.0).max(0.0) as i64,
                    );
                write!(f, ", ETA {}", eta.format("%Y-%m-%d %H:%M:%S"))?;
            } else {
                write!(f, ", ETA --")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let progress = ProgressTracker::new(100, "hosts");
        progress.log_completed(10);
        progress.log_completed(15);
        progress.log_overhead(5);
        assert_eq!(progress.completed(), 25);
        assert_eq!(progress.overhead(), 5);
        assert!((progress.percent() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn percent_is_capped() {
        let progress = ProgressTracker::new(10, "hosts");
        progress.log_completed(25);
        assert!((progress.percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn status_line_without_data() {
        let progress = ProgressTracker::new(10, "hosts");
        let line = progress.to_string();
        assert!(line.starts_with("0% 0/10"), "unexpected status line: {line}");
        assert!(line.contains("ETA --"));
        assert!(line.contains("-- hosts/s net"));
    }

    #[test]
    fn status_line_with_window_data() {
        let progress = ProgressTracker::new(100, "hosts");
        progress.log_completed(10);
        std::thread::sleep(Duration::from_millis(30));
        progress.log_completed(10);
        progress.log_overhead(4);
        let line = progress.to_string();
        assert!(line.starts_with("20% 20/100"), "unexpected status line: {line}");
        assert!(line.contains("overhead"));
        assert!(line.contains("ETA "));
        assert!(!line.contains("ETA --"));
    }
}
