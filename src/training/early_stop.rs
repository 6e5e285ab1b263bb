//! Patience-based early stopping on the validation score.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopDecision {
    /// New best; checkpoint now.
    Improved,
    Wait,
    Stop,
}

#[derive(Clone, Debug)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    best_epoch: Option<usize>,
    stale_epochs: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: f64::INFINITY,
            best_epoch: None,
            stale_epochs: 0,
        }
    }

    /// Improvement means strictly below `best - min_delta`.
    pub fn update(&mut self, epoch: usize, score: f64) -> StopDecision {
        if score < self.best - self.min_delta {
            self.best = score;
            self.best_epoch = Some(epoch);
            self.stale_epochs = 0;
            return StopDecision::Improved;
        }
        self.stale_epochs += 1;
        if self.stale_epochs >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Wait
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best_epoch.map(|_| self.best)
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_exactly_patience_after_best() {
        let mut stopper = EarlyStopping::new(15, 0.001);
        let scores = [1.0, 0.8, 0.5, 0.45];
        let mut stopped_at = None;
        for epoch in 0..100 {
            let score = scores.get(epoch).copied().unwrap_or(0.4495);
            if stopper.update(epoch, score) == StopDecision::Stop {
                stopped_at = Some(epoch);
                break;
            }
        }
        assert_eq!(stopper.best_epoch(), Some(3));
        assert_eq!(stopped_at, Some(3 + 15));
        assert_eq!(stopper.best(), Some(0.45));
    }

    #[test]
    fn test_improvement_must_exceed_min_delta() {
        let mut stopper = EarlyStopping::new(3, 0.001);
        assert_eq!(stopper.update(0, 1.0), StopDecision::Improved);
        assert_eq!(stopper.update(1, 0.9995), StopDecision::Wait);
        assert_eq!(stopper.update(2, 0.998), StopDecision::Improved);
        assert_eq!(stopper.update(3, 0.998), StopDecision::Wait);
        assert_eq!(stopper.update(4, 0.998), StopDecision::Wait);
        assert_eq!(stopper.update(5, 0.998), StopDecision::Stop);
    }

    #[test]
    fn test_no_best_before_first_update() {
        assert_eq!(EarlyStopping::new(5, 0.0).best(), None);
    }
}
