/// Exponential moving average over a scalar.
///
/// The first update seeds the state; afterwards
/// `value = alpha * x + (1 - alpha) * previous`. Non-finite input is not
/// filtered and propagates into the state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoother {
    alpha: f64,
    value: Option<f64>,
}

impl Smoother {
    /// Build with an explicit smoothing factor in `(0, 1]`.
    pub fn with_alpha(alpha: f64) -> Self {
        debug_assert!(alpha > 0.0 && alpha <= 1.0, "alpha out of range: {alpha}");
        Self { alpha, value: None }
    }

    /// Build from a window length using `alpha = 2 / (N + 1)`.
    pub fn with_window(window: usize) -> Self {
        Self::with_alpha(2.0 / (window as f64 + 1.0))
    }

    #[inline]
    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    #[inline]
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    #[inline]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_seeds() {
        let mut s = Smoother::with_alpha(0.2);
        assert_eq!(s.value(), None);
        assert_eq!(s.update(10.0), 10.0);
        assert_eq!(s.value(), Some(10.0));
    }

    #[test]
    fn test_recurrence() {
        let mut s = Smoother::with_alpha(0.2);
        s.update(10.0);
        let v = s.update(20.0);
        assert!((v - 12.0).abs() < 1e-12, "expected 12.0, got {v}");
    }

    #[test]
    fn test_window_alpha() {
        let s = Smoother::with_window(5);
        assert!((s.alpha() - 2.0 / 6.0).abs() < 1e-12);

        let s = Smoother::with_window(40);
        assert!((s.alpha() - 2.0 / 41.0).abs() < 1e-12);
    }

    #[test]
    fn test_nan_propagates() {
        let mut s = Smoother::with_alpha(0.5);
        s.update(1.0);
        assert!(s.update(f64::NAN).is_nan());
        assert!(s.update(1.0).is_nan());
    }
}
