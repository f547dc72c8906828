use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub pages_opened: u64,
    pub navigations: u64,
    pub selector_probes: u64,
    pub selector_hits: u64,
    pub login_attempts: u64,
    pub login_successes: u64,
    pub export_fetches: u64,
    pub export_rejections: u64,
    pub reauthentications: u64,
    pub screenshots: u64,
}

impl SessionMetrics {
    pub fn record_page_open(&mut self) {
        self.pages_opened = self.pages_opened.saturating_add(1);
    }

    pub fn record_navigation(&mut self) {
        self.navigations = self.navigations.saturating_add(1);
    }

    pub fn record_probe(&mut self, hit: bool) {
        self.selector_probes = self.selector_probes.saturating_add(1);
        if hit {
            self.selector_hits = self.selector_hits.saturating_add(1);
        }
    }

    pub fn record_login(&mut self, success: bool) {
        self.login_attempts = self.login_attempts.saturating_add(1);
        if success {
            self.login_successes = self.login_successes.saturating_add(1);
        }
    }

    pub fn record_export_fetch(&mut self, accepted: bool) {
        self.export_fetches = self.export_fetches.saturating_add(1);
        if !accepted {
            self.export_rejections = self.export_rejections.saturating_add(1);
        }
    }

    pub fn record_reauthentication(&mut self) {
        self.reauthentications = self.reauthentications.saturating_add(1);
    }

    pub fn record_screenshot(&mut self) {
        self.screenshots = self.screenshots.saturating_add(1);
    }

    pub fn selector_hit_rate(&self) -> f64 {
        if self.selector_probes == 0 {
            0.0
        } else {
            (self.selector_hits as f64 / self.selector_probes as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut metrics = SessionMetrics::default();
        metrics.record_probe(false);
        metrics.record_probe(false);
        metrics.record_probe(true);
        metrics.record_probe(true);
        metrics.record_login(false);
        metrics.record_login(true);
        metrics.record_export_fetch(false);
        metrics.record_export_fetch(true);
        assert_eq!(metrics.selector_probes, 4);
        assert!((metrics.selector_hit_rate() - 50.0).abs() < f64::EPSILON);
        assert_eq!(metrics.login_attempts, 2);
        assert_eq!(metrics.login_successes, 1);
        assert_eq!(metrics.export_fetches, 2);
        assert_eq!(metrics.export_rejections, 1);
    }

    #[test]
    fn hit_rate_is_zero_without_probes() {
        assert_eq!(SessionMetrics::default().selector_hit_rate(), 0.0);
    }
}
