//! SCRFD face detector on RGB snapshots.
//!
//! Letterboxes the snapshot into a 640×640 input, decodes the three stride
//! heads (anchor-free, two anchors per cell) and suppresses overlaps.

use super::OnnxError;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Positional output layout used when tensor names carry no stride hint:
/// scores 8/16/32, then boxes, then keypoints.
const POSITIONAL_LAYOUT: [HeadOutputs; 3] = [
    HeadOutputs { score: 0, bbox: 3, kps: 6 },
    HeadOutputs { score: 1, bbox: 4, kps: 7 },
    HeadOutputs { score: 2, bbox: 5, kps: 8 },
];

/// Output tensor indices for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Snapshot → letterboxed input mapping.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
}

impl Letterbox {
    fn to_source(self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// A detected face in snapshot coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
    /// Left eye, right eye, nose, left mouth corner, right mouth corner.
    pub landmarks: [(f32, f32); 5],
}

impl FaceBox {
    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    fn iou(&self, other: &FaceBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 { overlap / union } else { 0.0 }
    }
}

pub struct FaceDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(OnnxError::UnexpectedOutput(format!(
                "SCRFD needs 9 outputs (3 strides × score/bbox/kps), model has {}",
                names.len()
            )));
        }
        let heads = head_layout(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?heads, "loaded SCRFD detector");

        Ok(Self { session, heads })
    }

    /// Detect faces, best score first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, OnnxError> {
        let (input, letterbox) = letterbox(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut faces = Vec::new();
        for (head, &stride) in self.heads.iter().zip(STRIDES.iter()) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| OnnxError::UnexpectedOutput(format!("{what} stride {stride}: {e}")))
            };
            let scores = tensor(head.score, "scores")?;
            let boxes = tensor(head.bbox, "boxes")?;
            let kps = tensor(head.kps, "keypoints")?;
            faces.extend(decode_head(scores, boxes, kps, stride, letterbox));
        }

        Ok(suppress_overlaps(faces, IOU_THRESHOLD))
    }
}

/// Locate each stride head by tensor name ("score_8", "bbox_16", "kps_32"),
/// falling back to the positional layout when any name is missing.
fn head_layout(names: &[String]) -> [HeadOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut layout = POSITIONAL_LAYOUT;
    for (slot, &stride) in layout.iter_mut().zip(STRIDES.iter()) {
        match (position("score", stride), position("bbox", stride), position("kps", stride)) {
            (Some(score), Some(bbox), Some(kps)) => *slot = HeadOutputs { score, bbox, kps },
            _ => return POSITIONAL_LAYOUT,
        }
    }
    layout
}

/// Resize into the 640×640 canvas preserving aspect ratio, then normalise
/// into a NCHW tensor. Padding normalises to 0.
fn letterbox(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (INPUT_SIZE as f32 / width.max(1) as f32).min(INPUT_SIZE as f32 / height.max(1) as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let offset_x = (INPUT_SIZE - new_w) / 2;
    let offset_y = (INPUT_SIZE - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + offset_x) as usize, (y + offset_y) as usize);
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = (pixel[channel] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }

    (tensor, Letterbox { scale, offset_x, offset_y })
}

/// Decode one stride head into snapshot-space faces above the score threshold.
fn decode_head(scores: &[f32], boxes: &[f32], kps: &[f32], stride: usize, letterbox: Letterbox) -> Vec<FaceBox> {
    let grid = INPUT_SIZE as usize / stride;
    let step = stride as f32;
    let anchors = grid * grid * ANCHORS_PER_CELL;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > SCORE_THRESHOLD)
        .filter_map(|i| {
            let cell = i / ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let d = boxes.get(i * 4..i * 4 + 4)?;
            let k = kps.get(i * 10..i * 10 + 10)?;

            let (x1, y1) = letterbox.to_source(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.to_source(ax + d[2] * step, ay + d[3] * step);
            let landmarks = std::array::from_fn(|p| {
                letterbox.to_source(ax + k[p * 2] * step, ay + k[p * 2 + 1] * step)
            });

            Some(FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                score: scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest score wins.
fn suppress_overlaps(mut faces: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    faces.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<FaceBox> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| k.iou(&face) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}
