use std::time::Duration;

/// Progress of a run, sent to the caller as files complete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub files_done: usize,
    pub files_total: usize,
    pub particles_seen: u64,
    pub opp_seen: u64,
    pub elapsed: Duration,
}

impl ProgressUpdate {
    pub fn new(
        files_done: usize,
        files_total: usize,
        particles_seen: u64,
        opp_seen: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            files_done,
            files_total,
            particles_seen,
            opp_seen,
            elapsed,
        }
    }

    /// Fraction of files completed, in [0, 1]
    pub fn progress(&self) -> f32 {
        if self.files_total == 0 {
            1.0
        } else {
            self.files_done as f32 / self.files_total as f32
        }
    }

    /// Canonical OPP particles over all particles seen so far
    pub fn opp_ratio(&self) -> Option<f64> {
        if self.particles_seen == 0 {
            None
        } else {
            Some(self.opp_seen as f64 / self.particles_seen as f64)
        }
    }
}

/// Decides when a progress update is due: every `every_percent` of files and at the end
#[derive(Debug, Clone)]
pub struct ProgressCadence {
    files_total: usize,
    every_percent: f64,
    next_percent: f64,
}

impl ProgressCadence {
    pub fn new(files_total: usize, every_percent: f64) -> Self {
        Self {
            files_total,
            every_percent,
            next_percent: every_percent,
        }
    }

    pub fn is_due(&mut self, files_done: usize) -> bool {
        if files_done >= self.files_total {
            return true;
        }
        let percent = 100.0 * files_done as f64 / self.files_total as f64;
        if percent >= self.next_percent {
            let steps = (percent / self.every_percent).floor() + 1.0;
            self.next_percent = steps * self.every_percent;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence() {
        let mut cadence = ProgressCadence::new(10, 25.0);
        let due: Vec<usize> = (1..=10).filter(|n| cadence.is_due(*n)).collect();
        assert_eq!(due, vec![3, 5, 8, 10]);
    }

    #[test]
    fn test_tiny_cadence_reports_every_file() {
        let mut cadence = ProgressCadence::new(10, 1e-12);
        let due: Vec<usize> = (1..=10).filter(|n| cadence.is_due(*n)).collect();
        assert_eq!(due, (1..=10).collect::<Vec<usize>>());

        let config = crate::config::Config {
            progress_every: 1e-12,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_progress() {
        let update = ProgressUpdate::new(1, 4, 200, 50, Duration::from_secs(1));
        assert_eq!(update.progress(), 0.25);
        assert_eq!(update.opp_ratio(), Some(0.25));
        assert_eq!(ProgressUpdate::default().opp_ratio(), None);
        assert_eq!(ProgressUpdate::default().progress(), 1.0);
    }
}
