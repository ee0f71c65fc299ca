//! Timeseries payload parsing tests.

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use settlement_service::services::{JsonTimeseriesParser, TimeseriesParser};

#[test]
fn parses_a_timeseries_message() {
    let payload = r#"[
        {
            "meteringPointId": "571313100000011111",
            "transactionId": "tx-42",
            "resolution": "PT1H",
            "registrationTimestamp": "2025-01-02T08:00:00Z",
            "points": [
                {
                    "position": 1,
                    "timestamp": "2025-01-01T00:00:00Z",
                    "quantityKwh": "0.312",
                    "qualityCode": "E01"
                },
                {
                    "position": 2,
                    "timestamp": "2025-01-01T01:00:00Z",
                    "quantityKwh": "0.298",
                    "qualityCode": "56"
                }
            ]
        }
    ]"#;

    let series = JsonTimeseriesParser.parse(payload).unwrap();
    assert_eq!(series.len(), 1);

    let s = &series[0];
    assert_eq!(s.metering_point_id, "571313100000011111");
    assert_eq!(s.transaction_id, "tx-42");
    assert_eq!(s.resolution, "PT1H");
    assert_eq!(
        s.registration_timestamp,
        Some(Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap())
    );
    assert_eq!(s.points.len(), 2);
    assert_eq!(s.points[0].position, 1);
    assert_eq!(s.points[0].quantity_kwh, dec!(0.312));
    assert_eq!(s.points[1].quality_code, "56");
}

#[test]
fn missing_registration_timestamp_is_allowed() {
    let payload = r#"[
        {
            "meteringPointId": "571313100000011111",
            "transactionId": "tx-1",
            "resolution": "PT15M",
            "registrationTimestamp": null,
            "points": []
        }
    ]"#;

    let series = JsonTimeseriesParser.parse(payload).unwrap();
    assert_eq!(series[0].registration_timestamp, None);
    assert_eq!(series[0].resolution, "PT15M");
}

#[test]
fn malformed_payload_is_a_bad_request() {
    let err = JsonTimeseriesParser.parse("{not json").unwrap_err();
    assert!(err.to_string().contains("Invalid timeseries payload"));
}

#[test]
fn empty_array_parses_to_no_series() {
    assert!(JsonTimeseriesParser.parse("[]").unwrap().is_empty());
}
