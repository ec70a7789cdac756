//! N-dimensional axis-aligned bounding boxes.
//!
//! A box is stored as a flat list of interval bounds, dimension `d` living at
//! `[2d, 2d + 1]`. The empty box is the full space: it carries no spatial
//! restriction and intersects everything.
//!
//! ```text
//! +-----------+-----------+-----------+-----------+-----
//! | low0: f64 | high0:f64 | low1: f64 | high1:f64 | ...
//! +-----------+-----------+-----------+-----------+-----
//! ```

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Hyperrectangle {
    bounds: Vec<f64>,
}

impl Hyperrectangle {
    /// The box without spatial restriction.
    pub const FULL_SPACE: Hyperrectangle = Hyperrectangle { bounds: Vec::new() };

    /// Creates a box from `[low0, high0, low1, high1, ...]`.
    pub fn new(bounds: Vec<f64>) -> Result<Self> {
        if bounds.len() % 2 != 0 {
            return Err(Error::InvalidData(format!(
                "Odd number of bounds: {}",
                bounds.len()
            )));
        }

        for pair in bounds.chunks(2) {
            if pair[0].is_nan() || pair[1].is_nan() || pair[0] > pair[1] {
                return Err(Error::InvalidData(format!(
                    "Invalid interval [{}, {}]",
                    pair[0], pair[1]
                )));
            }
        }

        Ok(Self { bounds })
    }

    pub fn full_space() -> Self {
        Self::FULL_SPACE
    }

    pub fn is_full_space(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.bounds.len() / 2
    }

    pub fn low(&self, dimension: usize) -> f64 {
        self.bounds[2 * dimension]
    }

    pub fn high(&self, dimension: usize) -> f64 {
        self.bounds[2 * dimension + 1]
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Closed interval intersection. The full space intersects every box,
    /// boxes of different dimensions never intersect.
    pub fn intersects(&self, other: &Hyperrectangle) -> bool {
        if self.is_full_space() || other.is_full_space() {
            return true;
        }

        if self.dimension() != other.dimension() {
            return false;
        }

        (0..self.dimension())
            .all(|d| self.low(d) <= other.high(d) && other.low(d) <= self.high(d))
    }

    /// The common part of both boxes, `None` when they do not intersect.
    pub fn intersection(&self, other: &Hyperrectangle) -> Option<Hyperrectangle> {
        if !self.intersects(other) {
            return None;
        }

        if self.is_full_space() {
            return Some(other.clone());
        }

        if other.is_full_space() {
            return Some(self.clone());
        }

        let bounds = (0..self.dimension())
            .flat_map(|d| {
                [
                    self.low(d).max(other.low(d)),
                    self.high(d).min(other.high(d)),
                ]
            })
            .collect();

        Some(Hyperrectangle { bounds })
    }

    /// Smallest box that covers all given boxes. Full space boxes carry no
    /// extent and are skipped.
    pub fn covering_box<'a>(
        boxes: impl IntoIterator<Item = &'a Hyperrectangle>,
    ) -> Result<Hyperrectangle> {
        let mut covering: Option<Vec<f64>> = None;

        for bbox in boxes.into_iter().filter(|b| !b.is_full_space()) {
            match covering.as_mut() {
                None => covering = Some(bbox.bounds.clone()),
                Some(bounds) => {
                    if bounds.len() != bbox.bounds.len() {
                        return Err(Error::InvalidData(format!(
                            "Dimension mismatch in covering box: {} and {}",
                            bounds.len() / 2,
                            bbox.dimension()
                        )));
                    }

                    for d in 0..bbox.dimension() {
                        bounds[2 * d] = bounds[2 * d].min(bbox.low(d));
                        bounds[2 * d + 1] = bounds[2 * d + 1].max(bbox.high(d));
                    }
                }
            }
        }

        Ok(Hyperrectangle {
            bounds: covering.unwrap_or_default(),
        })
    }

    pub fn volume(&self) -> f64 {
        if self.is_full_space() {
            return 0.0;
        }

        (0..self.dimension())
            .map(|d| self.high(d) - self.low(d))
            .product()
    }

    /// Volume growth needed to also cover `other`.
    pub fn enlargement(&self, other: &Hyperrectangle) -> f64 {
        match Self::covering_box([self, other]) {
            Ok(covering) => covering.volume() - self.volume(),
            Err(_) => f64::INFINITY,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.bounds.len() * 8
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        for bound in &self.bounds {
            // Writing into a Vec never fails
            let _ = bytes.write_f64::<BigEndian>(*bound);
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 16 != 0 {
            return Err(Error::InvalidData(format!(
                "Bounding box encoding has invalid length {}",
                bytes.len()
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let mut bounds = Vec::with_capacity(bytes.len() / 8);
        for _ in 0..bytes.len() / 8 {
            bounds.push(
                cursor
                    .read_f64::<BigEndian>()
                    .map_err(|e| Error::Decode("bounding box", e))?,
            );
        }

        Self::new(bounds)
    }
}

impl std::fmt::Display for Hyperrectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_full_space() {
            return write!(f, "[full space]");
        }

        let intervals: Vec<String> = (0..self.dimension())
            .map(|d| format!("[{},{}]", self.low(d), self.high(d)))
            .collect();
        write!(f, "{}", intervals.join("x"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(bounds: &[f64]) -> Hyperrectangle {
        Hyperrectangle::new(bounds.to_vec()).unwrap()
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(Hyperrectangle::new(vec![1.0]).is_err());
        assert!(Hyperrectangle::new(vec![2.0, 1.0]).is_err());
        assert!(Hyperrectangle::new(vec![f64::NAN, 1.0]).is_err());
        assert!(Hyperrectangle::new(vec![]).unwrap().is_full_space());
    }

    #[test]
    fn test_intersects() {
        let a = rect(&[0.0, 1.0, 0.0, 1.0]);
        let b = rect(&[1.0, 2.0, 1.0, 2.0]);
        let c = rect(&[5.0, 6.0, 5.0, 6.0]);

        // Closed intervals: touching boxes intersect
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));

        assert!(a.intersects(&Hyperrectangle::FULL_SPACE));
        assert!(Hyperrectangle::FULL_SPACE.intersects(&c));

        let one_dimensional = rect(&[0.0, 1.0]);
        assert!(!a.intersects(&one_dimensional));
    }

    #[test]
    fn test_intersection() {
        let a = rect(&[0.0, 4.0, 0.0, 4.0]);
        let b = rect(&[2.0, 6.0, -1.0, 3.0]);

        assert_eq!(a.intersection(&b), Some(rect(&[2.0, 4.0, 0.0, 3.0])));
        assert_eq!(a.intersection(&Hyperrectangle::FULL_SPACE), Some(a.clone()));
        assert_eq!(a.intersection(&rect(&[10.0, 11.0, 10.0, 11.0])), None);
    }

    #[test]
    fn test_covering_box() {
        let a = rect(&[0.0, 1.0, 0.0, 1.0]);
        let b = rect(&[5.0, 6.0, -2.0, 0.5]);

        let covering =
            Hyperrectangle::covering_box([&a, &Hyperrectangle::FULL_SPACE, &b]).unwrap();
        assert_eq!(covering, rect(&[0.0, 6.0, -2.0, 1.0]));

        let empty = Hyperrectangle::covering_box(std::iter::empty()).unwrap();
        assert!(empty.is_full_space());

        assert!(Hyperrectangle::covering_box([&a, &rect(&[0.0, 1.0])]).is_err());
    }

    #[test]
    fn test_volume_and_enlargement() {
        let a = rect(&[0.0, 2.0, 0.0, 2.0]);
        assert_eq!(a.volume(), 4.0);
        assert_eq!(a.enlargement(&rect(&[1.0, 2.0, 1.0, 2.0])), 0.0);
        assert_eq!(a.enlargement(&rect(&[0.0, 4.0, 0.0, 2.0])), 4.0);
    }

    #[test]
    fn test_byte_encoding() {
        let a = rect(&[-1.5, 1.0, 3.0, 7.25]);
        let bytes = a.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..8], &(-1.5f64).to_be_bytes());
        assert_eq!(Hyperrectangle::from_bytes(&bytes).unwrap(), a);

        assert!(Hyperrectangle::FULL_SPACE.to_bytes().is_empty());
        assert!(Hyperrectangle::from_bytes(&[]).unwrap().is_full_space());
        assert!(Hyperrectangle::from_bytes(&[0u8; 8]).is_err());
    }
}
