//! Accelerator output tensor decoding.
//!
//! The detection accelerator publishes a flat `f32` tensor per frame. Its
//! layout is positional and undocumented by the device; `TensorSchema`
//! describes it so the decoder carries no model-specific constants.
//!
//! MobileNet-SSD (the default model) with 100 detection slots:
//!
//! ```text
//! [  0..400)  boxes, 4 values per slot, ordered y1, x1, y2, x2
//! [400..500)  confidences, one per slot
//! [500..600)  class ids, one per slot; 100.0 ends the valid slots
//! ```
//!
//! Slots after the sentinel hold stale or uninitialized memory and must
//! never be read as detections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::result::Detection;
use crate::error::MetadataError;

/// Metadata field carrying the raw tensor.
pub const DEFAULT_TENSOR_FIELD: &str = "CnnOutputTensor";

/// COCO class names indexed by dataset class id. Blank entries are ids the
/// dataset reserves but never labels.
const COCO_LABELS: [&str; 90] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "", "backpack",
    "umbrella", "", "", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard",
    "sports ball", "kite", "baseball bat", "baseball glove", "skateboard", "surfboard",
    "tennis racket", "bottle", "", "wine glass", "cup", "fork", "knife", "spoon", "bowl",
    "banana", "apple", "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza",
    "donut", "cake", "chair", "couch", "potted plant", "bed", "", "dining table", "", "",
    "toilet", "", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone", "microwave",
    "oven", "toaster", "sink", "refrigerator", "", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Order of the four box values inside each tensor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxOrder {
    /// `y1, x1, y2, x2`
    Yxyx,
    /// `x1, y1, x2, y2`
    Xyxy,
}

/// Positional layout of a detection tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorSchema {
    /// Metadata field holding the flat tensor.
    pub tensor_field: String,
    /// Number of detection slots.
    pub slots: usize,
    /// Start of the box region (`slots * 4` values).
    pub box_offset: usize,
    /// Start of the confidence region (`slots` values).
    pub score_offset: usize,
    /// Start of the class id region (`slots` values).
    pub class_offset: usize,
    /// Class id value that terminates the valid slots.
    pub sentinel: f32,
    pub box_order: BoxOrder,
}

impl TensorSchema {
    /// IMX500 MobileNet-SSD output layout.
    pub fn mobilenet_ssd() -> Self {
        Self {
            tensor_field: DEFAULT_TENSOR_FIELD.to_string(),
            slots: 100,
            box_offset: 0,
            score_offset: 400,
            class_offset: 500,
            sentinel: 100.0,
            box_order: BoxOrder::Yxyx,
        }
    }

    /// Minimum tensor length covering all three regions.
    pub fn required_len(&self) -> usize {
        (self.box_offset + self.slots * 4)
            .max(self.score_offset + self.slots)
            .max(self.class_offset + self.slots)
    }
}

impl Default for TensorSchema {
    fn default() -> Self {
        Self::mobilenet_ssd()
    }
}

/// Class id to name mapping. Ids with a blank name, or beyond the table, are
/// filtered out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelTable {
    names: Vec<String>,
}

impl LabelTable {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn coco() -> Self {
        Self::new(COCO_LABELS.iter().map(|name| name.to_string()).collect())
    }

    pub fn name(&self, class_id: u32) -> Option<&str> {
        self.names
            .get(class_id as usize)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::coco()
    }
}

/// Acceptance thresholds applied to each decoded slot.
///
/// The confidence threshold is low (the model scores people poorly); the size
/// minimums require a box large enough to be a person in frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionFilter {
    pub confidence_threshold: f32,
    /// Minimum normalized box width.
    pub min_width: f32,
    /// Minimum normalized box height.
    pub min_height: f32,
    /// Minimum fraction of the frame covered.
    pub min_area: f32,
    /// Labels to report. Empty reports every labelled class.
    pub classes: Vec<String>,
}

impl DetectionFilter {
    fn allows(&self, label: &str) -> bool {
        self.classes.is_empty() || self.classes.iter().any(|class| class == label)
    }
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.10,
            min_width: 0.05,
            min_height: 0.20,
            min_area: 0.04,
            classes: vec!["person".to_string()],
        }
    }
}

/// Decode a tensor into detections, in tensor slot order.
pub fn decode_detections(
    tensor: &[f32],
    schema: &TensorSchema,
    labels: &LabelTable,
    filter: &DetectionFilter,
) -> Result<Vec<Detection>, MetadataError> {
    let needed = schema.required_len();
    if tensor.len() < needed {
        return Err(MetadataError::TensorTooShort {
            len: tensor.len(),
            needed,
        });
    }

    let mut detections = Vec::new();
    for slot in 0..schema.slots {
        let class_val = tensor[schema.class_offset + slot];
        if class_val == schema.sentinel {
            break;
        }
        if !class_val.is_finite() || class_val < 0.0 {
            continue;
        }
        let class_id = class_val as u32;

        let confidence = tensor[schema.score_offset + slot];
        if !(confidence >= filter.confidence_threshold && confidence <= 1.0) {
            continue;
        }

        let base = schema.box_offset + slot * 4;
        let raw = [tensor[base], tensor[base + 1], tensor[base + 2], tensor[base + 3]];
        let bbox = match schema.box_order {
            BoxOrder::Yxyx => [raw[1], raw[0], raw[3], raw[2]],
            BoxOrder::Xyxy => raw,
        };
        if !bbox.iter().all(|v| (0.0..=1.0).contains(v)) {
            continue;
        }
        let width = bbox[2] - bbox[0];
        let height = bbox[3] - bbox[1];
        if width <= 0.0 || height <= 0.0 {
            continue;
        }
        if width < filter.min_width || height < filter.min_height || width * height < filter.min_area
        {
            continue;
        }

        let Some(label) = labels.name(class_id) else {
            continue;
        };
        if !filter.allows(label) {
            continue;
        }

        detections.push(Detection {
            label: label.to_string(),
            class_id,
            confidence,
            bbox,
        });
    }
    Ok(detections)
}

/// Pull the flat tensor out of a metadata record.
pub fn extract_tensor(record: &Value, field: &str) -> Result<Vec<f32>, MetadataError> {
    let values = record
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| MetadataError::MissingTensor(field.to_string()))?;
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            value
                .as_f64()
                .map(|v| v as f32)
                .ok_or(MetadataError::NonNumeric(index))
        })
        .collect()
}

/// Schema, labels and filter bundled for per-record decoding.
#[derive(Clone, Debug, Default)]
pub struct TensorDecoder {
    pub schema: TensorSchema,
    pub labels: LabelTable,
    pub filter: DetectionFilter,
}

impl TensorDecoder {
    pub fn new(schema: TensorSchema, labels: LabelTable, filter: DetectionFilter) -> Self {
        Self {
            schema,
            labels,
            filter,
        }
    }

    pub fn decode(&self, tensor: &[f32]) -> Result<Vec<Detection>, MetadataError> {
        decode_detections(tensor, &self.schema, &self.labels, &self.filter)
    }

    /// Extract and decode the tensor of one metadata record.
    pub fn decode_record(&self, record: &Value) -> Result<Vec<Detection>, MetadataError> {
        let tensor = extract_tensor(record, &self.schema.tensor_field)?;
        self.decode(&tensor)
    }
}
