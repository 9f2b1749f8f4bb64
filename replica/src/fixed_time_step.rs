use crate::wrapping_number::wrapping_diff;

/// Quantizes carrier time into whole simulation steps
#[derive(Debug)]
pub(crate) struct FixedTimeStep {
    step_ms: u32,
    current_time: u32,
    last_carrier_time: u32,
    accumulated_ms: u32,
}

impl FixedTimeStep {
    pub fn new(steps_per_second: u32, carrier_time: u32) -> Self {
        let step_ms = (1000 / steps_per_second.max(1)).max(1);
        Self {
            step_ms,
            current_time: carrier_time,
            last_carrier_time: carrier_time,
            accumulated_ms: 0,
        }
    }

    /// Returns the number of whole steps taken
    pub fn advance(&mut self, carrier_time: u32) -> u32 {
        let elapsed = wrapping_diff(self.last_carrier_time, carrier_time).max(0) as u32;
        self.last_carrier_time = carrier_time;
        self.accumulated_ms += elapsed;
        let steps = self.accumulated_ms / self.step_ms;
        self.accumulated_ms %= self.step_ms;
        self.current_time = self.current_time.wrapping_add(steps * self.step_ms);
        steps
    }

    /// Start of the current step
    pub fn current_time(&self) -> u32 {
        self.current_time
    }

    #[cfg(test)]
    pub fn step_ms(&self) -> u32 {
        self.step_ms
    }
}
