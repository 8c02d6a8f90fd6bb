//! Tolerant value equality for change detection.
//!
//! Collection batch writes and float-carrying setters compare the incoming
//! value against the current one to decide whether anything actually
//! changed. Exact float comparison would re-signal on every re-derived
//! value, so float comparisons carry a small absolute plus relative
//! tolerance; everything else compares exactly.

/// Relative tolerance for float comparison.
const RTOL: f64 = 1e-5;
/// Absolute tolerance for float comparison.
const ATOL: f64 = 1e-8;

#[inline]
fn close(a: f64, b: f64) -> bool {
    if a == b {
        // Also covers equal infinities.
        return true;
    }
    (a - b).abs() <= ATOL + RTOL * b.abs()
}

/// Equality with float tolerance, used to decide whether a write is a
/// change worth signaling.
///
/// `NaN` never compares equal to anything, including itself, so a `NaN`
/// write always registers as a change.
pub trait ApproxEq {
    fn approx_eq(&self, other: &Self) -> bool;
}

impl ApproxEq for f64 {
    #[inline]
    fn approx_eq(&self, other: &Self) -> bool {
        close(*self, *other)
    }
}

impl ApproxEq for f32 {
    #[inline]
    fn approx_eq(&self, other: &Self) -> bool {
        close(f64::from(*self), f64::from(*other))
    }
}

macro_rules! exact_approx_eq {
    ($($t:ty),* $(,)?) => {
        $(impl ApproxEq for $t {
            #[inline]
            fn approx_eq(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

exact_approx_eq!(bool, i8, i16, i32, i64, u8, u16, u32, u64, usize, char, String);

impl ApproxEq for &str {
    #[inline]
    fn approx_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl<V: ApproxEq, const N: usize> ApproxEq for [V; N] {
    fn approx_eq(&self, other: &Self) -> bool {
        self.iter().zip(other.iter()).all(|(a, b)| a.approx_eq(b))
    }
}

impl<V: ApproxEq> ApproxEq for Vec<V> {
    fn approx_eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a.approx_eq(b))
    }
}

impl<V: ApproxEq> ApproxEq for Option<V> {
    fn approx_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.approx_eq(b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerates_small_float_drift() {
        assert!(1.0f64.approx_eq(&(1.0 + 1e-9)));
        assert!(1.0f64.approx_eq(&(1.0 + 5e-6)));
        assert!(!1.0f64.approx_eq(&1.1));
        assert!(0.0f64.approx_eq(&1e-9));
        assert!(!0.0f64.approx_eq(&1e-3));
    }

    #[test]
    fn scales_with_magnitude() {
        assert!(1e6f64.approx_eq(&(1e6 + 1.0)));
        assert!(!1e-6f64.approx_eq(&(2e-6)));
    }

    #[test]
    fn nan_never_equals() {
        assert!(!f64::NAN.approx_eq(&f64::NAN));
        assert!(!f64::NAN.approx_eq(&0.0));
        assert!(f64::INFINITY.approx_eq(&f64::INFINITY));
    }

    #[test]
    fn options_and_shapes() {
        assert!(None::<f64>.approx_eq(&None));
        assert!(!Some(1.0).approx_eq(&None));
        assert!(Some([1.0, 2.0, 3.0]).approx_eq(&Some([1.0, 2.0, 3.0 + 1e-9])));
        // Length mismatch is inequality, not an error.
        assert!(!vec![1.0].approx_eq(&vec![1.0, 2.0]));
    }

    #[test]
    fn exact_types_compare_exactly() {
        assert!(true.approx_eq(&true));
        assert!(7u32.approx_eq(&7));
        assert!(!"a".approx_eq(&"b"));
        assert!("x".to_string().approx_eq(&"x".to_string()));
    }
}
