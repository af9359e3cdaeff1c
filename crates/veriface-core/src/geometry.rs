//! Distance and ratio primitives shared by the detectors.

use crate::types::Point;

/// Denominators at or below this are treated as zero.
const MIN_DENOMINATOR: f32 = 1e-6;

/// Euclidean distance between two landmarks.
pub fn distance(a: Point, b: Point) -> f32 {
    (a.x - b.x).hypot(a.y - b.y)
}

/// `numerator / denominator`, or `None` when the denominator is (near) zero
/// or either side is not finite.
pub fn ratio(numerator: f32, denominator: f32) -> Option<f32> {
    if !numerator.is_finite() || !denominator.is_finite() || denominator.abs() <= MIN_DENOMINATOR
    {
        return None;
    }
    Some(numerator / denominator)
}

/// Euclidean distance between two embedding vectors.
///
/// Returns `None` if the vectors differ in length or are empty.
pub fn euclidean(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let sum: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum();
    Some(sum.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_345() {
        let d = distance(Point::new(0.0, 0.0), Point::new(3.0, 4.0));
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = Point::new(12.5, -3.0);
        let b = Point::new(-4.0, 8.25);
        assert_eq!(distance(a, b), distance(b, a));
    }

    #[test]
    fn test_ratio_guards_zero_denominator() {
        assert_eq!(ratio(1.0, 0.0), None);
        assert_eq!(ratio(1.0, 1e-9), None);
        assert_eq!(ratio(f32::NAN, 2.0), None);
        assert_eq!(ratio(3.0, 2.0), Some(1.5));
    }

    #[test]
    fn test_euclidean_known_value() {
        let d = euclidean(&[0.0, 0.0, 0.0], &[1.0, 2.0, 2.0]).unwrap();
        assert!((d - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_rejects_length_mismatch() {
        assert_eq!(euclidean(&[1.0, 2.0], &[1.0]), None);
        assert_eq!(euclidean(&[], &[]), None);
    }
}
