use assert_matches::assert_matches;
use serde_json::json;

use spectra_processor::domain::{ProcessingStatus, Spectrum, SpectrumFormat, SpectrumId};
use spectra_processor::error::ProcessingError;

#[test]
fn parses_service_record() {
    let body = json!({
        "spectrum": {
            "id": 7,
            "file_url": "/rails/active_storage/blobs/abc/soil.dat",
            "filename": "soil.dat",
            "format": "dat",
            "status": "pending",
            "category": "xrf",
            "range": "0-40 keV",
            "sample": { "id": 3, "name": "soil" },
            "metadata": "{\"operator\": \"kim\"}"
        }
    })
    .to_string();

    let spectrum = Spectrum::from_record(&body).unwrap();
    assert_eq!(spectrum.id, SpectrumId::new(7));
    assert_eq!(spectrum.filename, "soil.dat");
    assert_eq!(spectrum.parsed_format().unwrap(), SpectrumFormat::Dat);
    assert_eq!(spectrum.metadata, json!("{\"operator\": \"kim\"}"));
}

#[test]
fn optional_fields_may_be_absent() {
    let body = r#"{"spectrum": {"id": 1, "file_url": "/f", "filename": "a.csv", "format": "csv"}}"#;
    let spectrum = Spectrum::from_record(body).unwrap();
    assert!(spectrum.metadata.is_null());
    assert!(spectrum.status.is_none());
}

#[test]
fn body_without_envelope_is_invalid() {
    let err = Spectrum::from_record(r#"{"id": 1}"#).unwrap_err();
    assert_matches!(err, ProcessingError::InvalidRecord(_));
}

#[test]
fn unknown_format_survives_parsing() {
    let body = r#"{"spectrum": {"id": 2, "file_url": "/f", "filename": "a.spc", "format": "spc"}}"#;
    let spectrum = Spectrum::from_record(body).unwrap();
    assert_matches!(
        spectrum.parsed_format(),
        Err(ProcessingError::UnsupportedFormat(ref format)) if format == "spc"
    );
}

#[test]
fn null_format_survives_parsing() {
    let body = r#"{"spectrum": {"id": 3, "file_url": "/f", "filename": "a", "format": null}}"#;
    let spectrum = Spectrum::from_record(body).unwrap();
    assert!(spectrum.format.is_none());
    assert_matches!(
        spectrum.parsed_format(),
        Err(ProcessingError::UnsupportedFormat(_))
    );

    let body = r#"{"spectrum": {"id": 4, "file_url": "/f", "filename": "a"}}"#;
    let spectrum = Spectrum::from_record(body).unwrap();
    assert!(spectrum.format.is_none());
}

#[test]
fn statuses_use_service_spelling() {
    assert_eq!(ProcessingStatus::Ongoing.as_str(), "ongoing");
    assert_eq!(ProcessingStatus::Successful.to_string(), "successful");
    assert_eq!(
        serde_json::to_value(ProcessingStatus::Error).unwrap(),
        json!("error")
    );
    assert!(ProcessingStatus::Error.is_terminal());
    assert!(!ProcessingStatus::Ongoing.is_terminal());
}
