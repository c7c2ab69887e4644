//! Detection decoding.
//!
//! Inference runs on the camera's accelerator; this module only interprets
//! its output tensors (`tensor`) and debounces the result over time
//! (`debounce`).

pub mod debounce;
mod result;
pub mod tensor;

pub use debounce::{DebounceState, TemporalDebouncer};
pub use result::Detection;
pub use tensor::{
    decode_detections, extract_tensor, BoxOrder, DetectionFilter, LabelTable, TensorDecoder,
    TensorSchema,
};
