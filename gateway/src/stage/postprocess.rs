//! Pure post-processing of backend output: top-k classification and
//! detection decoding with non-max suppression.

use modelgate_common::{BoundingBox, Record, Tensor, Value};

use crate::config::PredictionType;

/// Tolerance when deciding whether scores already form a distribution.
const PROBABILITY_EPSILON: f32 = 1e-3;

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn is_distribution(scores: &[f32]) -> bool {
    let sum: f32 = scores.iter().sum();
    scores.iter().all(|s| (0.0..=1.0).contains(s)) && (sum - 1.0).abs() <= PROBABILITY_EPSILON
}

fn label_for(labels: &[String], index: usize) -> String {
    labels.get(index).cloned().unwrap_or_else(|| index.to_string())
}

/// The `k` most probable classes of one score row, most probable first.
/// Scores that do not sum to 1 go through softmax first. Equal scores keep
/// index order.
pub fn top_k(scores: &[f32], labels: &[String], k: usize) -> Vec<(String, f32)> {
    let probs = if is_distribution(scores) {
        scores.to_vec()
    } else {
        softmax(scores)
    };
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    order
        .into_iter()
        .take(k)
        .map(|i| (label_for(labels, i), probs[i]))
        .collect()
}

fn prediction_record(label: String, prob: f32) -> Value {
    let mut record = Record::new();
    // two distinct names, cannot collide
    let _ = record.insert("label", Value::String(label));
    let _ = record.insert("prob", Value::Float32(prob));
    Value::Record(record)
}

/// Classification output: a list of `{label, prob}` records for a single
/// row (`[C]` or `[1, C]`), or a list of such lists for `[N, C]`.
pub fn classify(scores: &Tensor, labels: &[String], k: usize) -> Result<Value, String> {
    let values = scores.to_f32_vec().map_err(|e| e.to_string())?;
    let classes = match scores.shape() {
        [] => 1,
        shape => shape[shape.len() - 1],
    };
    if classes == 0 {
        return Ok(Value::List(Vec::new()));
    }
    let rows: Vec<Value> = values
        .chunks(classes)
        .map(|row| {
            Value::List(
                top_k(row, labels, k)
                    .into_iter()
                    .map(|(label, prob)| prediction_record(label, prob))
                    .collect(),
            )
        })
        .collect();
    match <[Value; 1]>::try_from(rows) {
        Ok([single]) => Ok(single),
        Err(rows) => Ok(Value::List(rows)),
    }
}

/// One decoded detection before suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub class: usize,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Rows of a detection tensor, dropping a leading batch axis of 1.
fn rows(output: &Tensor, min_width: usize) -> Result<(Vec<f32>, usize), String> {
    let shape = match output.shape() {
        [1, rest @ ..] if rest.len() == 2 => rest,
        shape => shape,
    };
    let [_, width] = shape else {
        return Err(format!("expected detection rows [N, K], got shape {:?}", output.shape()));
    };
    if *width < min_width {
        return Err(format!("detection rows need at least {} values, got {}", min_width, width));
    }
    Ok((output.to_f32_vec().map_err(|e| e.to_string())?, *width))
}

/// SSD / RCNN rows: `(x1, y1, x2, y2, score, class)`.
pub fn decode_corner_rows(output: &Tensor) -> Result<Vec<Candidate>, String> {
    let (values, width) = rows(output, 6)?;
    Ok(values
        .chunks(width)
        .map(|r| Candidate {
            x1: r[0],
            y1: r[1],
            x2: r[2],
            y2: r[3],
            score: r[4],
            class: r[5].max(0.0) as usize,
        })
        .collect())
}

/// YOLO rows: `(cx, cy, w, h, objectness, class scores...)`. The score is
/// objectness times the best class score.
pub fn decode_yolo(output: &Tensor) -> Result<Vec<Candidate>, String> {
    let (values, width) = rows(output, 6)?;
    Ok(values
        .chunks(width)
        .map(|r| {
            let (class, best) = r[5..]
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });
            Candidate {
                x1: r[0] - r[2] / 2.0,
                y1: r[1] - r[3] / 2.0,
                x2: r[0] + r[2] / 2.0,
                y2: r[1] + r[3] / 2.0,
                score: r[4] * best,
                class,
            }
        })
        .collect())
}

/// Greedy non-max suppression. Boxes with area <= 0 or a score below
/// `score_threshold` are dropped first; the rest are visited by descending
/// score, ties in input order, and a box is kept unless it overlaps a kept
/// box by more than `iou_threshold`.
pub fn nms(
    candidates: Vec<Candidate>,
    iou_threshold: f32,
    score_threshold: f32,
    per_class: bool,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.area() > 0.0 && c.score >= score_threshold)
        .collect();
    // stable, so equal scores keep insertion order
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            (!per_class || k.class == candidate.class) && k.iou(&candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

pub struct DetectionParams<'a> {
    pub labels: &'a [String],
    pub iou_threshold: f32,
    pub score_threshold: f32,
    pub per_class: bool,
}

/// Decode and suppress, producing normalized bounding boxes.
pub fn detect(
    prediction_type: PredictionType,
    output: &Tensor,
    params: &DetectionParams<'_>,
) -> Result<Vec<BoundingBox>, String> {
    let candidates = match prediction_type {
        PredictionType::Yolo => decode_yolo(output)?,
        PredictionType::Ssd | PredictionType::Rcnn => decode_corner_rows(output)?,
        other => return Err(format!("{:?} is not a detection type", other)),
    };
    Ok(nms(candidates, params.iou_threshold, params.score_threshold, params.per_class)
        .into_iter()
        .map(|c| {
            BoundingBox::from_corners(
                c.x1.clamp(0.0, 1.0),
                c.y1.clamp(0.0, 1.0),
                c.x2.clamp(0.0, 1.0),
                c.y2.clamp(0.0, 1.0),
            )
            .with_label(label_for(params.labels, c.class))
            .with_probability(c.score)
        })
        .collect())
}
