// src/preprocessing.rs

use crate::geometry::{point_in_polygon, ScaledSpot};
use crate::types::Frame;

/// RGB crop of a single spot. Pixels outside the polygon are zeroed.
#[derive(Debug, Clone)]
pub struct SpotCrop {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl SpotCrop {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }
}

/// Mask the spot polygon and crop its bounding box, clipped to the frame.
/// Returns None when nothing of the box lies inside the frame.
pub fn crop_spot(frame: &Frame, spot: &ScaledSpot) -> Option<SpotCrop> {
    let b = spot.bounds;
    let x0 = b.x.max(0) as usize;
    let y0 = b.y.max(0) as usize;
    let x1 = ((b.x + b.width).max(0) as usize).min(frame.width);
    let y1 = ((b.y + b.height).max(0) as usize).min(frame.height);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let width = x1 - x0;
    let height = y1 - y0;
    let mut data = vec![0u8; width * height * 3];

    for y in y0..y1 {
        for x in x0..x1 {
            if !point_in_polygon(x as f32, y as f32, &spot.polygon) {
                continue;
            }
            let src = (y * frame.width + x) * 3;
            let dst = ((y - y0) * width + (x - x0)) * 3;
            data[dst..dst + 3].copy_from_slice(&frame.data[src..src + 3]);
        }
    }

    Some(SpotCrop {
        data,
        width,
        height,
    })
}

/// Resize a crop to `size`x`size` and normalise to [-1, 1] in CHW order
/// (mean 0.5, std 0.5 per channel).
pub fn crop_to_tensor(crop: &SpotCrop, size: usize) -> Vec<f32> {
    const MEAN: f32 = 0.5;
    const STD: f32 = 0.5;

    let resized = resize_bilinear(&crop.data, crop.width, crop.height, size, size);
    let mut output = vec![0.0f32; 3 * size * size];

    for c in 0..3 {
        for h in 0..size {
            for w in 0..size {
                let hwc_idx = (h * size + w) * 3 + c;
                let chw_idx = c * size * size + h * size + w;

                let pixel = resized[hwc_idx] as f32 / 255.0;
                output[chw_idx] = (pixel - MEAN) / STD;
            }
        }
    }

    output
}

/// Bilinear image resize
pub fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;

            let sx0 = (sx.floor() as usize).min(src_w - 1);
            let sy0 = (sy.floor() as usize).min(src_h - 1);
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);

            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
