use serde::{Deserialize, Serialize};

/// One object detection published to callers.
///
/// `bbox` is `[x_min, y_min, x_max, y_max]`, normalized to `0..=1`, with
/// `x_max > x_min` and `y_max > y_min`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class name from the label table.
    #[serde(rename = "class")]
    pub label: String,
    pub class_id: u32,
    /// Model confidence (0.0-1.0).
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    /// Fraction of the frame covered by the box.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}
