//! Parameter smoothing for click-free gain changes

/// One-pole smoother approaching its target exponentially
#[derive(Debug, Clone)]
pub struct ParameterSmoother {
    current: f32,
    target: f32,
    coeff: f32,
}

impl ParameterSmoother {
    /// `time_frames` is the time constant in frames
    pub fn new(initial: f32, time_frames: f32) -> Self {
        let coeff = if time_frames > 0.0 {
            (-1.0 / time_frames).exp()
        } else {
            0.0
        };
        Self {
            current: initial,
            target: initial,
            coeff,
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    /// Jump straight to `value`
    pub fn snap_to(&mut self, value: f32) {
        self.current = value;
        self.target = value;
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline]
    pub fn next(&mut self) -> f32 {
        self.current = self.target + (self.current - self.target) * self.coeff;
        if (self.current - self.target).abs() < 1e-6 {
            self.current = self.target;
        }
        self.current
    }
}

/// Linear ramp toward 0.0 or 1.0, used for transport declicking
#[derive(Debug, Clone)]
pub struct GainRamp {
    value: f32,
    target: f32,
    step: f32,
}

impl GainRamp {
    pub fn new(ramp_frames: usize) -> Self {
        Self {
            value: 0.0,
            target: 0.0,
            step: 1.0 / ramp_frames.max(1) as f32,
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target.clamp(0.0, 1.0);
    }

    pub fn snap_to(&mut self, value: f32) {
        self.value = value.clamp(0.0, 1.0);
        self.target = self.value;
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Fully faded out with nothing left to ramp
    pub fn is_silent(&self) -> bool {
        self.value == 0.0 && self.target == 0.0
    }

    #[inline]
    pub fn next(&mut self) -> f32 {
        if self.value < self.target {
            self.value = (self.value + self.step).min(self.target);
        } else if self.value > self.target {
            self.value = (self.value - self.step).max(self.target);
        }
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoother_converges() {
        let mut smoother = ParameterSmoother::new(0.0, 100.0);
        smoother.set_target(1.0);
        let first = smoother.next();
        assert!(first > 0.0 && first < 0.05);
        for _ in 0..5000 {
            smoother.next();
        }
        assert_eq!(smoother.current(), 1.0);
    }

    #[test]
    fn test_gain_ramp() {
        let mut ramp = GainRamp::new(4);
        assert!(ramp.is_silent());
        ramp.set_target(1.0);
        let values: Vec<f32> = (0..5).map(|_| ramp.next()).collect();
        assert_eq!(values, vec![0.25, 0.5, 0.75, 1.0, 1.0]);
        ramp.set_target(0.0);
        for _ in 0..4 {
            ramp.next();
        }
        assert!(ramp.is_silent());
    }
}
