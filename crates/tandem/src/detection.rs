//! Decoding of SSD detector outputs.

use std::fmt;

use anyhow::{bail, ensure};

use crate::nn::Tensor;

/// An axis-aligned box in normalized image coordinates (0.0 to 1.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub ymin: f32,
    pub xmin: f32,
    pub ymax: f32,
    pub xmax: f32,
}

impl BoundingBox {
    /// Converts the box to pixel coordinates `(x, y, width, height)` in an image of the given
    /// size, clamped to the image.
    pub fn to_pixels(&self, width: u32, height: u32) -> (i32, i32, u32, u32) {
        let (w, h) = (width as f32, height as f32);
        let x0 = (self.xmin.clamp(0.0, 1.0) * w).round();
        let y0 = (self.ymin.clamp(0.0, 1.0) * h).round();
        let x1 = (self.xmax.clamp(0.0, 1.0) * w).round();
        let y1 = (self.ymax.clamp(0.0, 1.0) * h).round();
        (
            x0 as i32,
            y0 as i32,
            (x1 - x0).max(0.0) as u32,
            (y1 - y0).max(0.0) as u32,
        )
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.3} {:.3} {:.3} {:.3}]",
            self.ymin, self.xmin, self.ymax, self.xmax
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: u32,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// The detections reported for one frame, ordered as the detector output them (by descending
/// score for SSD post-processing).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    vec: Vec<Detection>,
}

impl Detections {
    /// Decodes the detector outputs `[boxes, scores, classes, num_detections]`.
    ///
    /// `boxes` must have shape `[1, N, 4]`, `scores` and `classes` `[1, N]`, and
    /// `num_detections` must hold a single value. Only the first `num_detections` entries are
    /// decoded.
    pub fn decode(outputs: &[Tensor]) -> anyhow::Result<Self> {
        let [boxes, scores, classes, num] = outputs else {
            bail!("expected 4 detector outputs, got {}", outputs.len());
        };

        let n = match boxes.shape() {
            &[1, n, 4] => n,
            shape => bail!("`boxes` must have shape [1, N, 4], got {shape:?}"),
        };
        ensure!(
            scores.shape() == [1, n],
            "`scores` must have shape [1, {n}], got {:?}",
            scores.shape()
        );
        ensure!(
            classes.shape() == [1, n],
            "`classes` must have shape [1, {n}], got {:?}",
            classes.shape()
        );
        let &[count] = num.data() else {
            bail!("`num_detections` must hold one value, got shape {:?}", num.shape());
        };
        let count = (count.max(0.0) as usize).min(n);

        let scores = scores.index([0]).as_slice();
        let classes = classes.index([0]).as_slice();
        let vec = (0..count)
            .map(|i| {
                let b = boxes.index([0, i]).as_slice();
                Detection {
                    class: classes[i].round().max(0.0) as u32,
                    score: scores[i],
                    bbox: BoundingBox {
                        ymin: b[0],
                        xmin: b[1],
                        ymax: b[2],
                        xmax: b[3],
                    },
                }
            })
            .collect();
        Ok(Self { vec })
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.vec.iter()
    }

    /// Returns the detections scoring strictly above `threshold`.
    pub fn above(&self, threshold: f32) -> impl Iterator<Item = &Detection> {
        self.vec.iter().filter(move |det| det.score > threshold)
    }
}

impl FromIterator<Detection> for Detections {
    fn from_iter<T: IntoIterator<Item = Detection>>(iter: T) -> Self {
        Self {
            vec: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test::ssd_outputs;

    use super::*;

    #[test]
    fn decode_truncates_to_count() {
        let mut outputs = ssd_outputs(&[(1, 0.9), (3, 0.6), (2, 0.1)]);
        outputs[3] = Tensor::from([2.0]);

        let detections = Detections::decode(&outputs).unwrap();
        assert_eq!(detections.len(), 2);
        let first = detections.iter().next().unwrap();
        assert_eq!(first.class, 1);
        assert_eq!(first.score, 0.9);
        assert_eq!(
            first.bbox,
            BoundingBox {
                ymin: 0.1,
                xmin: 0.2,
                ymax: 0.5,
                xmax: 0.6
            }
        );
        assert_eq!(detections.above(0.5).count(), 2);
        assert_eq!(detections.above(0.6).count(), 1);
    }

    #[test]
    fn decode_empty() {
        let detections = Detections::decode(&ssd_outputs(&[])).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn rejects_malformed_outputs() {
        let outputs = ssd_outputs(&[(1, 0.9)]);
        assert!(Detections::decode(&outputs[..3]).is_err());

        let mut bad_boxes = outputs.clone();
        bad_boxes[0] = Tensor::zeros(&[1, 1, 3]);
        assert!(Detections::decode(&bad_boxes).is_err());

        let mut bad_scores = outputs.clone();
        bad_scores[1] = Tensor::zeros(&[1, 2]);
        assert!(Detections::decode(&bad_scores).is_err());

        let mut bad_num = outputs;
        bad_num[3] = Tensor::from([1.0, 1.0]);
        assert!(Detections::decode(&bad_num).is_err());
    }

    #[test]
    fn pixel_boxes() {
        let bbox = BoundingBox {
            ymin: 0.25,
            xmin: -0.1,
            ymax: 0.75,
            xmax: 0.5,
        };
        assert_eq!(bbox.to_pixels(200, 100), (0, 25, 100, 50));
    }
}
