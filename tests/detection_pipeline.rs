use serde_json::{json, Value};

use camstream::config::EngineConfig;
use camstream::detect::{
    decode_detections, BoxOrder, DebounceState, DetectionFilter, LabelTable, TemporalDebouncer,
    TensorDecoder, TensorSchema,
};
use camstream::engine::{DetectionPipeline, EngineState};
use camstream::ingest::metadata::decode_fragment;
use camstream::MetadataError;

const PERSON: f32 = 0.0;
const DOG: f32 = 17.0;

/// Blank 100-slot tensor with the sentinel in the first class slot.
fn empty_tensor() -> Vec<f32> {
    let mut tensor = vec![0.0; 600];
    tensor[500] = 100.0;
    tensor
}

/// Write one slot in accelerator order (y1, x1, y2, x2) and move the
/// sentinel past it.
fn put(tensor: &mut [f32], slot: usize, class: f32, score: f32, yxyx: [f32; 4]) {
    tensor[slot * 4..slot * 4 + 4].copy_from_slice(&yxyx);
    tensor[400 + slot] = score;
    tensor[500 + slot] = class;
    if slot + 1 < 100 {
        tensor[500 + slot + 1] = 100.0;
    }
}

fn record(tensor: &[f32]) -> Value {
    json!({ "SensorTimestamp": 1, "CnnOutputTensor": tensor })
}

fn person_record() -> Value {
    let mut tensor = empty_tensor();
    put(&mut tensor, 0, PERSON, 0.72, [0.1, 0.2, 0.9, 0.6]);
    record(&tensor)
}

fn empty_record() -> Value {
    record(&empty_tensor())
}

#[test]
fn decoded_detections_respect_filter_invariants() {
    let mut tensor = empty_tensor();
    put(&mut tensor, 0, PERSON, 0.72, [0.1, 0.2, 0.9, 0.6]);
    put(&mut tensor, 1, PERSON, 0.05, [0.1, 0.2, 0.9, 0.6]); // low score
    put(&mut tensor, 2, PERSON, 0.50, [0.1, 0.2, 0.2, 0.6]); // too short
    put(&mut tensor, 3, PERSON, 0.50, [0.1, 0.30, 0.9, 0.32]); // too narrow
    put(&mut tensor, 4, DOG, 0.90, [0.1, 0.2, 0.9, 0.6]); // not allowed
    put(&mut tensor, 5, PERSON, 0.40, [0.0, 0.0, 1.2, 0.5]); // out of range
    put(&mut tensor, 6, PERSON, 0.40, [0.5, 0.5, 0.3, 0.9]); // inverted
    put(&mut tensor, 7, PERSON, 0.10, [0.0, 0.0, 1.0, 1.0]); // at threshold

    let schema = TensorSchema::default();
    let labels = LabelTable::coco();
    let filter = DetectionFilter::default();
    let detections = decode_detections(&tensor, &schema, &labels, &filter).expect("decode");

    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0].bbox, [0.2, 0.1, 0.6, 0.9]);
    assert_eq!(detections[1].confidence, 0.10);
    for det in &detections {
        assert_eq!(det.label, "person");
        assert!(det.confidence >= filter.confidence_threshold && det.confidence <= 1.0);
        assert!(det.bbox.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(det.bbox[2] > det.bbox[0] && det.bbox[3] > det.bbox[1]);
        assert!(det.width() >= filter.min_width);
        assert!(det.height() >= filter.min_height);
        assert!(det.area() >= filter.min_area);
    }

    // Decoding is a pure function of its inputs.
    let again = decode_detections(&tensor, &schema, &labels, &filter).expect("decode");
    assert_eq!(again, detections);
}

#[test]
fn sentinel_stops_decoding() {
    let mut tensor = empty_tensor();
    put(&mut tensor, 0, PERSON, 0.8, [0.1, 0.1, 0.9, 0.5]);
    // Slot 1 holds the sentinel; slot 2 must be ignored.
    tensor[502] = PERSON;
    tensor[402] = 0.9;
    tensor[8..12].copy_from_slice(&[0.1, 0.1, 0.9, 0.5]);

    let decoder = TensorDecoder::default();
    assert_eq!(decoder.decode(&tensor).expect("decode").len(), 1);
}

#[test]
fn empty_allow_list_reports_every_labelled_class() {
    let mut tensor = empty_tensor();
    put(&mut tensor, 0, DOG, 0.8, [0.1, 0.1, 0.9, 0.5]);
    let filter = DetectionFilter {
        classes: Vec::new(),
        ..DetectionFilter::default()
    };
    let decoder = TensorDecoder::new(TensorSchema::default(), LabelTable::coco(), filter);
    let detections = decoder.decode(&tensor).expect("decode");
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].label, "dog");
    assert_eq!(detections[0].class_id, 17);
}

#[test]
fn xyxy_schema_keeps_box_order() {
    let schema = TensorSchema {
        box_order: BoxOrder::Xyxy,
        ..TensorSchema::default()
    };
    let mut tensor = empty_tensor();
    put(&mut tensor, 0, PERSON, 0.8, [0.2, 0.1, 0.6, 0.9]);
    let decoder = TensorDecoder::new(schema, LabelTable::coco(), DetectionFilter::default());
    let detections = decoder.decode(&tensor).expect("decode");
    assert_eq!(detections[0].bbox, [0.2, 0.1, 0.6, 0.9]);
}

#[test]
fn malformed_records_are_errors() {
    let decoder = TensorDecoder::default();
    assert!(matches!(
        decoder.decode_record(&json!({"ExposureTime": 3000})),
        Err(MetadataError::MissingTensor(_))
    ));
    assert!(matches!(
        decoder.decode_record(&json!({"CnnOutputTensor": [0.1, 0.2]})),
        Err(MetadataError::TensorTooShort { len: 2, needed: 600 })
    ));
    assert!(matches!(
        decoder.decode_record(&json!({"CnnOutputTensor": [0.1, "x"]})),
        Err(MetadataError::NonNumeric(1))
    ));
}

#[test]
fn metadata_fragments_decode_like_the_capture_output() {
    assert!(decode_fragment(b"[").expect("bracket").is_none());
    assert!(decode_fragment(b"]").expect("bracket").is_none());
    let value = decode_fragment(br#"{"a": 1},"#).expect("line").expect("object");
    assert_eq!(value["a"], 1);
    assert!(decode_fragment(br#"{"a": "#).is_err());
}

#[test]
fn debouncer_publishes_only_after_consecutive_records() {
    let config = EngineConfig::default();
    let state = EngineState::new(&config.buffer);
    let mut pipeline = DetectionPipeline::from_config(&config);

    // true, false, true, true, true, true with a threshold of 3.
    let sequence = [true, false, true, true, true, true];
    let mut published = Vec::new();
    for detected in sequence {
        let record = if detected { person_record() } else { empty_record() };
        pipeline.process_into(&record, &state);
        published.push(state.detections().len());
    }
    assert_eq!(published, vec![0, 0, 0, 0, 1, 1]);
    assert_eq!(pipeline.state(), DebounceState::Active);

    pipeline.process_into(&empty_record(), &state);
    assert!(state.detections().is_empty());
    assert_eq!(pipeline.state(), DebounceState::Quiet);
}

#[test]
fn skipped_records_do_not_break_a_streak() {
    let config = EngineConfig::default();
    let state = EngineState::new(&config.buffer);
    let mut pipeline = DetectionPipeline::from_config(&config);

    pipeline.process_into(&person_record(), &state);
    pipeline.process_into(&json!({"CnnOutputTensor": []}), &state);
    pipeline.process_into(&person_record(), &state);
    assert!(state.detections().is_empty());
    pipeline.process_into(&person_record(), &state);
    assert_eq!(state.detections().len(), 1);
}

#[test]
fn debouncer_never_publishes_intermittent_detections() {
    let mut debouncer = TemporalDebouncer::new(5, 3);
    let decoder = TensorDecoder::default();
    let hit = decoder.decode_record(&person_record()).expect("decode");
    assert_eq!(hit.len(), 1);

    for i in 0..50 {
        let input = if i % 3 == 2 { Vec::new() } else { hit.clone() };
        assert!(debouncer.observe(input).is_empty());
    }
}
