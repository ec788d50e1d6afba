use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Per-task metrics, zeroed by every rollout reset.
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    start: Instant,
    pub steps: u64,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub total_tokens: u64,
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            steps: 0,
            success_rate: 0.0,
            avg_response_time: 0.0,
            total_tokens: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Fold one step outcome into the running means.
    pub fn update(&mut self, success: bool, response_time: f64, tokens: u64) {
        self.steps += 1;
        self.total_tokens += tokens;
        let n = self.steps as f64;
        let success = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * (n - 1.0) + success) / n;
        self.avg_response_time = (self.avg_response_time * (n - 1.0) + response_time) / n;
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary returned by a `learn` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnReport {
    pub success_rate: f64,
    pub total_steps: u64,
    pub avg_response_time: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_means() {
        let mut metrics = AgentMetrics::new();
        metrics.update(true, 2.0, 100);
        metrics.update(false, 4.0, 50);

        assert_eq!(metrics.steps, 2);
        assert!((metrics.success_rate - 0.5).abs() < 1e-9);
        assert!((metrics.avg_response_time - 3.0).abs() < 1e-9);
        assert_eq!(metrics.total_tokens, 150);
    }

    #[test]
    fn test_reset_zeroes() {
        let mut metrics = AgentMetrics::new();
        metrics.update(true, 1.0, 10);
        metrics.reset();
        assert_eq!(metrics.steps, 0);
        assert_eq!(metrics.success_rate, 0.0);
    }
}
