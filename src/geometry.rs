// src/geometry.rs
//
// Scales authored spot polygons to the resolution of the frames actually
// being read. Cached per resolution; recomputed only when it changes.

use crate::spots::SpotLayout;
use crate::types::{PixelPoint, Resolution, Spot};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone)]
pub struct ScaledSpot {
    pub name: String,
    pub polygon: Vec<PixelPoint>,
    pub bounds: BoundingBox,
}

impl ScaledSpot {
    pub fn centroid(&self) -> PixelPoint {
        let n = self.polygon.len().max(1) as i64;
        let (sx, sy) = self
            .polygon
            .iter()
            .fold((0i64, 0i64), |(ax, ay), p| (ax + p.x as i64, ay + p.y as i64));
        PixelPoint {
            x: (sx / n) as i32,
            y: (sy / n) as i32,
        }
    }
}

pub struct SpotGeometry {
    spots: Vec<Spot>,
    reference: Option<Resolution>,
    cached_for: Option<Resolution>,
    scaled: Vec<ScaledSpot>,
}

impl SpotGeometry {
    pub fn new(layout: &SpotLayout) -> Self {
        Self {
            spots: layout.spots.clone(),
            reference: layout.reference_size,
            cached_for: None,
            scaled: Vec::new(),
        }
    }

    /// Polygons in pixel coordinates of `frame`.
    pub fn resolve(&mut self, frame: Resolution) -> &[ScaledSpot] {
        if self.cached_for != Some(frame) {
            let (sx, sy) = match self.reference {
                Some(r) => (
                    frame.width as f32 / r.width as f32,
                    frame.height as f32 / r.height as f32,
                ),
                None => {
                    warn!("No reference size for spots, assuming 1:1 scale");
                    (1.0, 1.0)
                }
            };
            info!(
                "Scaling spots to {}x{}: sx={:.3}, sy={:.3}",
                frame.width, frame.height, sx, sy
            );
            self.scaled = self.spots.iter().map(|s| scale_spot(s, sx, sy)).collect();
            self.cached_for = Some(frame);
        }
        &self.scaled
    }
}

fn scale_spot(spot: &Spot, sx: f32, sy: f32) -> ScaledSpot {
    let polygon: Vec<PixelPoint> = spot
        .polygon
        .iter()
        .map(|p| PixelPoint {
            x: (p.x * sx).round() as i32,
            y: (p.y * sy).round() as i32,
        })
        .collect();
    let bounds = bounding_box(&polygon);
    ScaledSpot {
        name: spot.name.clone(),
        polygon,
        bounds,
    }
}

/// Inclusive pixel bounds of a polygon (same convention as OpenCV's boundingRect).
pub fn bounding_box(polygon: &[PixelPoint]) -> BoundingBox {
    if polygon.is_empty() {
        return BoundingBox {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
        };
    }
    let min_x = polygon.iter().map(|p| p.x).min().unwrap_or(0);
    let max_x = polygon.iter().map(|p| p.x).max().unwrap_or(0);
    let min_y = polygon.iter().map(|p| p.y).min().unwrap_or(0);
    let max_y = polygon.iter().map(|p| p.y).max().unwrap_or(0);
    BoundingBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    }
}

/// Even-odd test, with points on an edge counted as inside.
pub fn point_in_polygon(x: f32, y: f32, polygon: &[PixelPoint]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (polygon[i].x as f32, polygon[i].y as f32);
        let (xj, yj) = (polygon[j].x as f32, polygon[j].y as f32);

        if on_segment(x, y, xi, yi, xj, yj) {
            return true;
        }
        if (yi > y) != (yj > y) {
            let cross_x = xj + (y - yj) * (xi - xj) / (yi - yj);
            if x < cross_x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(px: f32, py: f32, ax: f32, ay: f32, bx: f32, by: f32) -> bool {
    let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
    if cross.abs() > 1e-3 {
        return false;
    }
    px >= ax.min(bx) - 1e-3
        && px <= ax.max(bx) + 1e-3
        && py >= ay.min(by) - 1e-3
        && py <= ay.max(by) + 1e-3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    fn layout(reference: Option<Resolution>) -> SpotLayout {
        SpotLayout {
            spots: vec![Spot {
                name: "A1".to_string(),
                polygon: vec![
                    Point { x: 100.0, y: 100.0 },
                    Point { x: 200.0, y: 100.0 },
                    Point { x: 200.0, y: 150.0 },
                    Point { x: 100.0, y: 150.0 },
                ],
                reserved: false,
                authorized_plates: vec![],
            }],
            reference_size: reference,
        }
    }

    #[test]
    fn test_scales_independently_in_x_and_y() {
        let mut geometry = SpotGeometry::new(&layout(Some(Resolution {
            width: 1000,
            height: 500,
        })));
        let scaled = geometry.resolve(Resolution {
            width: 2000,
            height: 1000,
        });
        assert_eq!(scaled[0].polygon[0], PixelPoint { x: 200, y: 200 });
        assert_eq!(scaled[0].polygon[2], PixelPoint { x: 400, y: 300 });

        let scaled = geometry.resolve(Resolution {
            width: 500,
            height: 1000,
        });
        assert_eq!(scaled[0].polygon[0], PixelPoint { x: 50, y: 200 });
    }

    #[test]
    fn test_missing_reference_is_identity() {
        let mut geometry = SpotGeometry::new(&layout(None));
        let scaled = geometry.resolve(Resolution {
            width: 640,
            height: 480,
        });
        assert_eq!(scaled[0].polygon[0], PixelPoint { x: 100, y: 100 });
        assert_eq!(
            scaled[0].bounds,
            BoundingBox {
                x: 100,
                y: 100,
                width: 101,
                height: 51
            }
        );
    }

    #[test]
    fn test_point_in_polygon() {
        let tri = vec![
            PixelPoint { x: 0, y: 0 },
            PixelPoint { x: 10, y: 0 },
            PixelPoint { x: 0, y: 10 },
        ];
        assert!(point_in_polygon(1.0, 1.0, &tri));
        assert!(point_in_polygon(0.0, 5.0, &tri));
        assert!(point_in_polygon(5.0, 5.0, &tri));
        assert!(!point_in_polygon(8.0, 8.0, &tri));
    }
}
