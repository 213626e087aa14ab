//! Five-point face alignment to the canonical 112×112 ArcFace crop.

use image::{Rgb, RgbImage};

pub const ALIGNED_SIZE: u32 = 112;

/// InsightFace reference landmark positions in a 112×112 crop.
const REFERENCE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `dst = [a -b; b a] · src + (tx, ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit over point pairs (Umeyama without
    /// reflection, scale unconstrained).
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy, dx, dy) = (sx - msx, sy - msy, dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-9 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    fn inverse_apply(&self, x: f32, y: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (dx, dy) = (x - self.tx, y - self.ty);
        ((self.a * dx + self.b * dy) / det, (self.a * dy - self.b * dx) / det)
    }
}

/// Bilinear sample; outside the image reads as black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let texel = |xi: f32, yi: f32| -> [f32; 3] {
        if xi < 0.0 || yi < 0.0 {
            return [0.0; 3];
        }
        match image.get_pixel_checked(xi as u32, yi as u32) {
            Some(p) => [p[0] as f32, p[1] as f32, p[2] as f32],
            None => [0.0; 3],
        }
    };

    let (tl, tr) = (texel(x0, y0), texel(x0 + 1.0, y0));
    let (bl, br) = (texel(x0, y0 + 1.0), texel(x0 + 1.0, y0 + 1.0));
    Rgb(std::array::from_fn(|c| {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

/// Warp the face described by `landmarks` into a 112×112 aligned crop.
///
/// Degenerate landmarks (all coincident) produce a black crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    match Similarity::fit(landmarks, &REFERENCE) {
        Some(transform) => RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
            let (sx, sy) = transform.inverse_apply(ox as f32, oy as f32);
            sample(image, sx, sy)
        }),
        None => RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&REFERENCE, &REFERENCE).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_scale_and_shift() {
        let src: [(f32, f32); 5] = std::array::from_fn(|i| (REFERENCE[i].0 * 2.0 + 10.0, REFERENCE[i].1 * 2.0 - 4.0));
        let t = Similarity::fit(&src, &REFERENCE).unwrap();
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4);
        let (x, y) = t.inverse_apply(REFERENCE[2].0, REFERENCE[2].1);
        assert!((x - src[2].0).abs() < 1e-2 && (y - src[2].1).abs() < 1e-2);
    }

    #[test]
    fn test_degenerate_landmarks_give_black_crop() {
        let image = RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]));
        let out = align_face(&image, &[(50.0, 50.0); 5]);
        assert_eq!(out.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_aligned_reference_face_copies_pixels() {
        let image = RgbImage::from_pixel(112, 112, Rgb([90, 120, 200]));
        let out = align_face(&image, &REFERENCE);
        assert_eq!(*out.get_pixel(56, 56), Rgb([90, 120, 200]));
    }
}
