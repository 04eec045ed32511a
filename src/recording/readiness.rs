// Buffer readiness gate: a one-way latch that opens once enough segments
// have accumulated inside the trailing window.

/// Latch that flips to ready the first time the observed window count
/// reaches `required`, and stays ready until `reset`.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    required: usize,
    current: usize,
    ready: bool,
}

impl ReadinessGate {
    pub fn new(required: usize) -> Self {
        Self {
            required: required.max(1),
            current: 0,
            ready: false,
        }
    }

    /// Feed the latest window count. Returns true only on the call that
    /// opened the gate.
    pub fn observe(&mut self, segment_count: usize) -> bool {
        self.current = segment_count;
        if !self.ready && segment_count >= self.required {
            self.ready = true;
            return true;
        }
        false
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Count from the most recent observation
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.ready = false;
    }
}
