use serde::{Deserialize, Serialize};

/// Axis-aligned box in page space. Origin is the top-left corner of the page,
/// so `y0` is the top edge and `y1` the bottom edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// True when `other` lies inside `self`, allowing each edge to poke out by `tolerance`.
    pub fn contains(&self, other: &BBox, tolerance: f32) -> bool {
        other.x0 >= self.x0 - tolerance
            && other.y0 >= self.y0 - tolerance
            && other.x1 <= self.x1 + tolerance
            && other.y1 <= self.y1 + tolerance
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    pub fn intersection(&self, other: &BBox) -> Option<BBox> {
        let x0 = self.x0.max(other.x0);
        let y0 = self.y0.max(other.y0);
        let x1 = self.x1.min(other.x1);
        let y1 = self.y1.min(other.y1);

        if x0 < x1 && y0 < y1 {
            Some(BBox { x0, y0, x1, y1 })
        } else {
            None
        }
    }

    pub fn overlap_area(&self, other: &BBox) -> f32 {
        self.intersection(other).map(|b| b.area()).unwrap_or(0.0)
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Every edge within `tolerance` of the matching edge of `other`.
    pub fn near_equal(&self, other: &BBox, tolerance: f32) -> bool {
        (self.x0 - other.x0).abs() <= tolerance
            && (self.y0 - other.y0).abs() <= tolerance
            && (self.x1 - other.x1).abs() <= tolerance
            && (self.y1 - other.y1).abs() <= tolerance
    }

    /// Boxes share an edge or overlap once both are grown by `tolerance`.
    pub fn touches(&self, other: &BBox, tolerance: f32) -> bool {
        self.x0 - tolerance <= other.x1
            && other.x0 - tolerance <= self.x1
            && self.y0 - tolerance <= other.y1
            && other.y0 - tolerance <= self.y1
    }

    pub fn horizontal_overlap(&self, other: &BBox) -> f32 {
        (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0)
    }

    pub fn enclosing<'a>(boxes: impl IntoIterator<Item = &'a BBox>) -> Option<BBox> {
        boxes.into_iter().fold(None, |acc, b| match acc {
            None => Some(*b),
            Some(a) => Some(a.union(b)),
        })
    }
}

/// Groups values that are within `threshold` of their neighbour and returns
/// the cluster centroids in ascending order.
pub fn cluster_values(values: &[f32], threshold: f32) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut clusters: Vec<Vec<f32>> = Vec::new();
    let mut current = vec![sorted[0]];

    for &val in &sorted[1..] {
        let last = current.last().copied().unwrap_or(val);
        if val - last <= threshold {
            current.push(val);
        } else {
            clusters.push(std::mem::take(&mut current));
            current.push(val);
        }
    }
    clusters.push(current);

    clusters
        .iter()
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect()
}

/// Index of the centroid nearest to `value`.
pub fn nearest_index(centroids: &[f32], value: f32) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - value).abs().total_cmp(&(*b - value).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment_with_tolerance() {
        let outer = BBox::new(0.0, 0.0, 100.0, 100.0);
        let inner = BBox::new(10.0, 10.0, 100.5, 50.0);

        assert!(!outer.contains(&inner, 0.0));
        assert!(outer.contains(&inner, 1.0));
        assert!(!inner.contains(&outer, 1.0));
    }

    #[test]
    fn test_touching_cells() {
        let left = BBox::new(0.0, 0.0, 50.0, 20.0);
        let right = BBox::new(50.0, 0.0, 100.0, 20.0);
        let far = BBox::new(80.0, 40.0, 100.0, 60.0);

        assert!(left.touches(&right, 0.5));
        assert!(!left.touches(&far, 2.0));
    }

    #[test]
    fn test_cluster_values() {
        let clusters = cluster_values(&[10.0, 11.0, 12.0, 50.0, 51.0, 100.0], 5.0);

        assert_eq!(clusters.len(), 3);
        assert!((clusters[0] - 11.0).abs() < 0.01);
        assert!((clusters[1] - 50.5).abs() < 0.01);
        assert_eq!(nearest_index(&clusters, 49.0), 1);
    }
}
