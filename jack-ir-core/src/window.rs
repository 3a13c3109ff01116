use std::f64::consts::FRAC_PI_2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    QuarterSine,
    Linear,
}

impl Window {
    /// Gain `n` samples into a rising ramp that reaches unity after `width` samples.
    pub fn rising(&self, n: usize, width: usize) -> f64 {
        if n >= width {
            return 1.0;
        }

        let x = n as f64 / width as f64;
        match self {
            Window::QuarterSine => f64::sin(FRAC_PI_2 * x),
            Window::Linear => x,
        }
    }
}

/// Fade-in, flat body, fade-out over a signal of fixed length.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub left_side: Window,
    pub left_side_width: usize,
    pub right_side: Window,
    pub right_side_width: usize,
    pub len: usize,
}

impl Envelope {
    pub fn new(
        left_side: Window,
        left_side_width: usize,
        right_side: Window,
        right_side_width: usize,
        len: usize,
    ) -> Self {
        Self {
            left_side,
            left_side_width,
            right_side,
            right_side_width,
            len,
        }
    }

    pub fn gain(&self, index: usize) -> f64 {
        if index < self.left_side_width {
            return self.left_side.rising(index, self.left_side_width);
        }

        let from_end = self.len.saturating_sub(index + 1);
        if from_end < self.right_side_width {
            self.right_side.rising(from_end, self.right_side_width)
        } else {
            1.0
        }
    }
}
