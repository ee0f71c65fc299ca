//! Metering store and message intake integration tests.
//!
//! Run with a PostgreSQL database behind `DATABASE_URL`.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{test_db, unique_gsrn};
use rust_decimal_macros::dec;
use settlement_service::models::{MeteringRow, QueueName};
use settlement_service::services::{
    IntakeOutcome, JsonTimeseriesParser, MessageIntake, TimeseriesMessageHandler,
};
use uuid::Uuid;

fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, hour, 0, 0).unwrap()
}

#[tokio::test]
#[ignore] // Requires database
async fn resent_identical_readings_record_no_change() {
    let db = test_db().await;
    let gsrn = unique_gsrn();

    let reg = Some(Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap());
    let rows = vec![
        MeteringRow::hourly(ts(0), dec!(0.3), "E01", "msg-1", reg),
        MeteringRow::hourly(ts(1), dec!(0.4), "E01", "msg-1", reg),
    ];

    let changed = db.store_readings_with_history(&gsrn, &rows).await.unwrap();
    assert_eq!(changed, 0, "first delivery has nothing to change");

    let changed = db.store_readings_with_history(&gsrn, &rows).await.unwrap();
    assert_eq!(changed, 0, "identical re-delivery is not a change");
}

#[tokio::test]
#[ignore] // Requires database
async fn newer_registration_overwrites_and_is_audited() {
    let db = test_db().await;
    let gsrn = unique_gsrn();

    let first_reg = Some(Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap());
    db.store_readings_with_history(
        &gsrn,
        &[MeteringRow::hourly(ts(0), dec!(0.3), "E01", "msg-1", first_reg)],
    )
    .await
    .unwrap();

    let newer_reg = Some(Utc.with_ymd_and_hms(2025, 1, 3, 8, 0, 0).unwrap());
    let changed = db
        .store_readings_with_history(
            &gsrn,
            &[MeteringRow::hourly(ts(0), dec!(0.35), "56", "msg-2", newer_reg)],
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let stored = db
        .get_consumption(&gsrn, ts(0), ts(0) + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].quantity_kwh, dec!(0.35));
    assert_eq!(stored[0].source_message_id, "msg-2");

    let history = db
        .get_metering_changes(&gsrn, ts(0), ts(0) + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].previous_kwh, dec!(0.3));
    assert_eq!(history[0].new_kwh, dec!(0.35));
}

#[tokio::test]
#[ignore] // Requires database
async fn stale_registration_loses_the_upsert() {
    let db = test_db().await;
    let gsrn = unique_gsrn();

    let newer_reg = Some(Utc.with_ymd_and_hms(2025, 1, 3, 8, 0, 0).unwrap());
    db.store_readings_with_history(
        &gsrn,
        &[MeteringRow::hourly(ts(0), dec!(0.3), "E01", "msg-2", newer_reg)],
    )
    .await
    .unwrap();

    let stale_reg = Some(Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap());
    let changed = db
        .store_readings_with_history(
            &gsrn,
            &[MeteringRow::hourly(ts(0), dec!(0.9), "E01", "msg-1", stale_reg)],
        )
        .await
        .unwrap();
    assert_eq!(changed, 0, "stale registration must not count as a change");

    let stored = db
        .get_consumption(&gsrn, ts(0), ts(0) + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stored[0].quantity_kwh, dec!(0.3), "stale value must not overwrite");
}

fn intake(db: settlement_service::services::Database) -> MessageIntake {
    let handler = TimeseriesMessageHandler::new(
        Arc::new(JsonTimeseriesParser),
        db.clone(),
        None,
        None,
    );
    MessageIntake::new(db, vec![Arc::new(handler)])
}

fn series_payload(gsrn: &str) -> String {
    format!(
        r#"[{{
            "meteringPointId": "{gsrn}",
            "transactionId": "tx-1",
            "resolution": "PT1H",
            "registrationTimestamp": "2025-01-02T08:00:00Z",
            "points": [
                {{"position": 1, "timestamp": "2025-01-01T00:00:00Z", "quantityKwh": "0.3", "qualityCode": "E01"}},
                {{"position": 2, "timestamp": "2025-01-01T01:00:00Z", "quantityKwh": "-0.1", "qualityCode": "E01"}}
            ]
        }}]"#
    )
}

#[tokio::test]
#[ignore] // Requires database
async fn intake_stores_readings_and_skips_negative_quantities() {
    let db = test_db().await;
    let gsrn = unique_gsrn();
    let message_id = format!("msg-{}", Uuid::new_v4());

    let outcome = intake(db.clone())
        .process(&message_id, QueueName::Timeseries, &series_payload(&gsrn))
        .await
        .unwrap();
    assert_eq!(outcome, IntakeOutcome::Processed);

    let stored = db
        .get_consumption(&gsrn, ts(0), ts(0) + Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1, "negative quantity must be skipped");
    assert_eq!(stored[0].quantity_kwh, dec!(0.3));
}

#[tokio::test]
#[ignore] // Requires database
async fn redelivered_message_is_a_duplicate() {
    let db = test_db().await;
    let gsrn = unique_gsrn();
    let message_id = format!("msg-{}", Uuid::new_v4());
    let intake = intake(db);

    let first = intake
        .process(&message_id, QueueName::Timeseries, &series_payload(&gsrn))
        .await
        .unwrap();
    assert_eq!(first, IntakeOutcome::Processed);

    let second = intake
        .process(&message_id, QueueName::Timeseries, &series_payload(&gsrn))
        .await
        .unwrap();
    assert_eq!(second, IntakeOutcome::Duplicate);
}

#[tokio::test]
#[ignore] // Requires database
async fn malformed_payload_is_dead_lettered_and_not_retried() {
    let db = test_db().await;
    let message_id = format!("msg-{}", Uuid::new_v4());
    let intake = intake(db.clone());

    let outcome = intake
        .process(&message_id, QueueName::Timeseries, "{not json")
        .await
        .unwrap();
    assert_eq!(outcome, IntakeOutcome::DeadLettered);

    // The claim stays, so a redelivery is a no-op rather than a retry.
    let redelivery = intake
        .process(&message_id, QueueName::Timeseries, "{not json")
        .await
        .unwrap();
    assert_eq!(redelivery, IntakeOutcome::Duplicate);
}

#[tokio::test]
#[ignore] // Requires database
async fn unhandled_queue_is_dead_lettered() {
    let db = test_db().await;
    let message_id = format!("msg-{}", Uuid::new_v4());

    let outcome = intake(db)
        .process(&message_id, QueueName::CustomerData, "[]")
        .await
        .unwrap();
    assert_eq!(outcome, IntakeOutcome::DeadLettered);
}
