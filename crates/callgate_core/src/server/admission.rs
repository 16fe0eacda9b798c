use rand::Rng;

/// Random early detection over the depth of the pending-arrival queue.
///
/// Up to the soft limit every arrival is admitted. Between the soft and the
/// hard limit an arrival is rejected with a probability rising linearly from
/// 0 to 1. From the hard limit on every arrival is rejected.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AdmissionControl {
    soft_limit: usize,
    hard_limit: usize,
}

impl AdmissionControl {
    pub(crate) fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            soft_limit,
            hard_limit: hard_limit.max(soft_limit),
        }
    }

    pub(crate) fn should_reject<R: Rng>(&self, depth: usize, rng: &mut R) -> bool {
        if depth <= self.soft_limit {
            return false;
        }
        if depth >= self.hard_limit {
            return true;
        }
        let probability =
            (depth - self.soft_limit) as f64 / (self.hard_limit - self.soft_limit) as f64;
        rng.random::<f64>() < probability
    }
}
