use assert_matches::assert_matches;
use serde_json::{Value, json};

use spectra_processor::convert::{self, Columns};
use spectra_processor::domain::SpectrumFormat;
use spectra_processor::error::ProcessingError;
use spectra_processor::peaks::{
    self, Denoise, Peak, PeakDetector, PeakDetectorConfig, PeakSet,
};

fn columns(y: Vec<f64>) -> Columns {
    Columns {
        x: (0..y.len()).map(|i| 100.0 + i as f64).collect(),
        y,
    }
}

#[test]
fn single_spike_is_detected() {
    let mut y = vec![5.0; 10];
    y[6] = 15.0;
    let found = PeakDetector::default().detect_columns(&columns(y)).unwrap();
    assert_eq!(found.positions(), vec![106.0]);
    let peak = found.iter().next().unwrap();
    assert_eq!(peak.rank, 1);
    assert_eq!(peak.height, 1.0);
}

#[test]
fn peaks_are_reported_in_sample_order_with_persistence_ranks() {
    let mut y = vec![0.1; 16];
    y[3] = 1.0;
    y[10] = 0.5;
    let found = PeakDetector::default().detect_columns(&columns(y)).unwrap();
    let summary: Vec<(usize, usize)> = found.iter().map(|p| (p.index, p.rank)).collect();
    assert_eq!(summary, vec![(3, 1), (10, 2)]);
}

#[test]
fn low_peaks_are_dropped() {
    let mut y = vec![0.001; 16];
    y[3] = 1.0;
    y[10] = 0.004;
    let found = PeakDetector::default().detect_columns(&columns(y)).unwrap();
    assert_eq!(found.positions(), vec![103.0]);
}

#[test]
fn only_forty_ranks_survive() {
    let mut y = vec![0.01; 3 * 45 + 1];
    for k in 0..45 {
        y[3 * k + 1] = 0.5 + 0.01 * k as f64;
    }
    let found = PeakDetector::default().detect_columns(&columns(y)).unwrap();
    assert_eq!(found.len(), 40);
    assert_eq!(found.iter().next().map(|p| p.index), Some(3 * 5 + 1));
    assert!(found.iter().all(|p| (1..=40).contains(&p.rank)));
}

#[test]
fn flat_channel_has_no_peaks() {
    let found = PeakDetector::default()
        .detect_columns(&columns(vec![2.0; 12]))
        .unwrap();
    assert!(found.is_empty());
}

#[test]
fn zero_maximum_is_a_detection_failure() {
    let err = PeakDetector::default()
        .detect_columns(&columns(vec![0.0; 5]))
        .unwrap_err();
    assert_matches!(err, ProcessingError::PeakDetection(_));
}

#[test]
fn lookahead_suppresses_shoulders() {
    let config = PeakDetectorConfig {
        denoise: Denoise::None,
        ..PeakDetectorConfig::default()
    };
    // the shoulder at 5 is a local maximum, but within two samples of the main peak
    let y = vec![0.1, 0.2, 0.5, 1.0, 0.6, 0.62, 0.2, 0.1, 0.1];
    let found = PeakDetector::new(config).detect_columns(&columns(y)).unwrap();
    assert_eq!(found.positions(), vec![103.0]);
}

#[test]
fn detects_from_converted_buffer_without_moving_it() {
    let raw = "Tracer counts\n5\n5\n5\n5\n5\n15\n5\n5\n5\n5\n";
    let buffer = convert::convert(SpectrumFormat::Dat, raw.as_bytes(), "soil.dat").unwrap();
    let found = PeakDetector::default().detect(&buffer).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.iter().next().map(|p| p.index), Some(5));
    assert_eq!(buffer.position(), 0);
}

fn peak_set(positions: &[f64]) -> PeakSet {
    PeakSet::new(
        positions
            .iter()
            .enumerate()
            .map(|(index, &position)| Peak {
                index,
                position,
                rank: index + 1,
                height: 1.0,
            })
            .collect(),
    )
}

#[test]
fn metadata_merge_keeps_existing_keys() {
    let merged = peaks::build_metadata(&json!({"a": 1}), &peak_set(&[10.0, 20.5])).unwrap();
    assert_eq!(
        Value::Object(merged),
        json!({"a": 1, "peaks": [{"position": "10.0"}, {"position": "20.5"}]})
    );
}

#[test]
fn metadata_merge_parses_json_strings_and_replaces_peaks() {
    let existing = json!(r#"{"operator": "kim", "peaks": [{"position": "1.0"}]}"#);
    let merged = peaks::build_metadata(&existing, &peak_set(&[2.5])).unwrap();
    assert_eq!(merged["operator"], json!("kim"));
    assert_eq!(merged["peaks"], json!([{"position": "2.5"}]));
}

#[test]
fn invalid_metadata_is_not_merged() {
    for existing in [json!("not json"), json!("[1, 2]"), json!(42), Value::Null] {
        assert!(!peaks::metadata_is_valid(&existing));
        assert_matches!(
            peaks::build_metadata(&existing, &peak_set(&[1.0])),
            Err(ProcessingError::Metadata(_))
        );
    }
    assert!(peaks::metadata_is_valid(&json!("{}")));
}
