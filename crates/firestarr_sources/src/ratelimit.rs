//! File-backed request rate limiting.
//!
//! The weather API enforces a requests-per-minute cap per key, and several
//! pipeline processes can run on one host with the same key, so the sliding
//! window of recent request times lives in a file guarded by an exclusive
//! lock rather than in memory.

use crate::{Result, SourceError};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub struct RateLimiter {
    state_path: PathBuf,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(state_path: &Path, max_requests: usize, window: Duration) -> RateLimiter {
        RateLimiter {
            state_path: state_path.to_path_buf(),
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// Block until a request slot is free, then record the request.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            match self.try_record()? {
                None => return Ok(()),
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Record a request now if the window has room, else return how long to
    /// wait before the oldest recorded request expires.
    fn try_record(&self) -> Result<Option<Duration>> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.state_path)?;
        file.lock_exclusive()?;
        let result = self.update_locked(&mut file);
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn update_locked(&self, file: &mut std::fs::File) -> Result<Option<Duration>> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SourceError::RateLimit {
                path: self.state_path.clone(),
                message: e.to_string(),
            })?;

        let mut stamps: Vec<Duration> = contents
            .lines()
            .filter_map(|line| line.trim().parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .filter(|t| now.saturating_sub(*t) < self.window)
            .collect();
        stamps.sort();

        let wait = if stamps.len() >= self.max_requests {
            let oldest = stamps[stamps.len() - self.max_requests];
            Some(self.window.saturating_sub(now.saturating_sub(oldest)) + Duration::from_millis(50))
        } else {
            stamps.push(now);
            None
        };

        let serialized: String = stamps
            .iter()
            .map(|t| format!("{}\n", t.as_secs_f64()))
            .collect();
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(serialized.as_bytes())?;
        Ok(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit_then_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(&dir.path().join("rl.txt"), 3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.try_record().unwrap().is_none());
        }
        let wait = limiter.try_record().unwrap();
        assert!(wait.is_some());
        assert!(wait.unwrap() <= Duration::from_secs(61));
    }

    #[test]
    fn test_expired_stamps_free_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rl.txt");
        // stamps from long ago should not count against the window
        let old = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
            - 3600.0;
        std::fs::write(&path, format!("{old}\n{old}\n{old}\n")).unwrap();
        let limiter = RateLimiter::new(&path, 3, Duration::from_secs(60));
        assert!(limiter.try_record().unwrap().is_none());
    }

    #[test]
    fn test_state_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rl.txt");
        let a = RateLimiter::new(&path, 2, Duration::from_secs(60));
        let b = RateLimiter::new(&path, 2, Duration::from_secs(60));
        assert!(a.try_record().unwrap().is_none());
        assert!(b.try_record().unwrap().is_none());
        assert!(a.try_record().unwrap().is_some());
    }
}
