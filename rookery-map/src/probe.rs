//! Probe sequences for open addressing.
//!
//! A probe strategy maps `(current index, probes so far, capacity)` to the
//! next index to visit. Both strategies below avoid a modulus: the step is
//! always smaller than `capacity`, so a single conditional subtraction wraps.

/// Next-slot function used by [`AtomicHashArray`](crate::AtomicHashArray).
pub trait Probe {
    /// Index visited after `idx`. `probes` counts the cells visited so far
    /// (at least 1) and is always `< capacity`.
    fn next(idx: usize, probes: usize, capacity: usize) -> usize;
}

/// `idx + 1`, wrapping at `capacity`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearProbe;

impl Probe for LinearProbe {
    #[inline(always)]
    fn next(idx: usize, _probes: usize, capacity: usize) -> usize {
        let next = idx + 1;
        if next == capacity { 0 } else { next }
    }
}

/// `idx + probes`, wrapping at `capacity` (triangular-number offsets).
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticProbe;

impl Probe for QuadraticProbe {
    #[inline(always)]
    fn next(idx: usize, probes: usize, capacity: usize) -> usize {
        let next = idx + probes;
        if next >= capacity { next - capacity } else { next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_wraps() {
        assert_eq!(LinearProbe::next(3, 1, 8), 4);
        assert_eq!(LinearProbe::next(7, 1, 8), 0);
    }

    #[test]
    fn test_quadratic_visits_every_slot_of_power_of_two() {
        let capacity = 16;
        let mut seen = vec![false; capacity];
        let mut idx = 5;
        seen[idx] = true;
        for probes in 1..capacity {
            idx = QuadraticProbe::next(idx, probes, capacity);
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
