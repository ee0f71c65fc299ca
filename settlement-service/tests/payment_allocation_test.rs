//! Payment matching and allocation integration tests.
//!
//! Run with a PostgreSQL database behind `DATABASE_URL`.

mod common;

use chrono::NaiveDate;
use common::{one_line_invoice, seed_completed_run, test_db};
use rust_decimal_macros::dec;
use settlement_service::models::{
    BankFileImportRequest, BankFilePayment, CreatePaymentRequest,
};
use settlement_service::services::{PaymentAllocator, PaymentMatchingService};

fn payment_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 2, 10).unwrap()
}

#[tokio::test]
#[ignore] // Requires database
async fn exact_payment_settles_the_invoice() {
    let db = test_db().await;
    let seeded = seed_completed_run(&db, "monthly").await;
    let invoice = db.create_invoice(&one_line_invoice(&seeded, dec!(634.51))).await.unwrap();
    assert_eq!(invoice.amount_incl_vat, dec!(793.14));
    assert_eq!(invoice.status, "sent");

    let service = PaymentMatchingService::new(db.clone(), PaymentAllocator::new(db.pool().clone()));
    let payment = service
        .record_and_match(&CreatePaymentRequest {
            customer_id: seeded.customer_id,
            amount: dec!(793.14),
            payment_date: payment_date(),
            payment_reference: Some(invoice.invoice_number.to_string()),
            method: "bank_transfer".to_string(),
            external_id: None,
        })
        .await
        .unwrap();

    assert_eq!(payment.amount_allocated, dec!(793.14));
    assert_eq!(payment.amount_unallocated, dec!(0));
    assert_eq!(payment.status, "allocated");

    let invoice = db.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "paid");
    assert_eq!(invoice.amount_outstanding, dec!(0));
    assert!(invoice.paid_at.is_some());
}

#[tokio::test]
#[ignore] // Requires database
async fn partial_payment_leaves_both_sides_partial() {
    let db = test_db().await;
    let seeded = seed_completed_run(&db, "monthly").await;
    let invoice = db.create_invoice(&one_line_invoice(&seeded, dec!(634.51))).await.unwrap();

    let service = PaymentMatchingService::new(db.clone(), PaymentAllocator::new(db.pool().clone()));
    let payment = service
        .record_and_match(&CreatePaymentRequest {
            customer_id: seeded.customer_id,
            amount: dec!(500),
            payment_date: payment_date(),
            payment_reference: None,
            method: "bank_transfer".to_string(),
            external_id: None,
        })
        .await
        .unwrap();

    assert_eq!(payment.amount_allocated, dec!(500));
    assert_eq!(payment.status, "allocated");

    let invoice = db.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "partially_paid");
    assert_eq!(invoice.amount_paid, dec!(500));
    assert_eq!(invoice.amount_outstanding, dec!(293.14));
    assert!(invoice.paid_at.is_none());
}

#[tokio::test]
#[ignore] // Requires database
async fn overpayment_stays_unallocated_on_the_payment() {
    let db = test_db().await;
    let seeded = seed_completed_run(&db, "monthly").await;
    let invoice = db.create_invoice(&one_line_invoice(&seeded, dec!(100))).await.unwrap();
    assert_eq!(invoice.amount_incl_vat, dec!(125.00));

    let service = PaymentMatchingService::new(db.clone(), PaymentAllocator::new(db.pool().clone()));
    let payment = service
        .record_and_match(&CreatePaymentRequest {
            customer_id: seeded.customer_id,
            amount: dec!(200),
            payment_date: payment_date(),
            payment_reference: None,
            method: "bank_transfer".to_string(),
            external_id: None,
        })
        .await
        .unwrap();

    assert_eq!(payment.amount_allocated, dec!(125.00));
    assert_eq!(payment.amount_unallocated, dec!(75.00));
    assert_eq!(payment.status, "partially_allocated");
}

#[tokio::test]
#[ignore] // Requires database
async fn manual_over_allocation_is_rejected() {
    let db = test_db().await;
    let seeded = seed_completed_run(&db, "monthly").await;
    let invoice = db.create_invoice(&one_line_invoice(&seeded, dec!(100))).await.unwrap();

    let payment = db
        .create_payment(&CreatePaymentRequest {
            customer_id: seeded.customer_id,
            amount: dec!(50),
            payment_date: payment_date(),
            payment_reference: None,
            method: "bank_transfer".to_string(),
            external_id: None,
        })
        .await
        .unwrap();

    let service = PaymentMatchingService::new(db.clone(), PaymentAllocator::new(db.pool().clone()));
    let err = service
        .manual_allocate(payment.id, invoice.id, dec!(80), "ops")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds unallocated balance"));
}

#[tokio::test]
#[ignore] // Requires database
async fn auto_match_pays_oldest_due_invoice_first() {
    let db = test_db().await;
    let seeded = seed_completed_run(&db, "monthly").await;

    let mut older = one_line_invoice(&seeded, dec!(100));
    older.due_date = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
    let older = db.create_invoice(&older).await.unwrap();

    // Second run so the second invoice gets its own settlement run.
    let seeded_two = seed_completed_run(&db, "monthly").await;
    let mut newer = one_line_invoice(&seeded_two, dec!(100));
    newer.customer_id = seeded.customer_id;
    newer.due_date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    let newer = db.create_invoice(&newer).await.unwrap();

    let service = PaymentMatchingService::new(db.clone(), PaymentAllocator::new(db.pool().clone()));
    service
        .record_and_match(&CreatePaymentRequest {
            customer_id: seeded.customer_id,
            amount: dec!(150),
            payment_date: payment_date(),
            payment_reference: None,
            method: "bank_transfer".to_string(),
            external_id: None,
        })
        .await
        .unwrap();

    let older = db.get_invoice(older.id).await.unwrap().unwrap();
    let newer = db.get_invoice(newer.id).await.unwrap().unwrap();
    assert_eq!(older.status, "paid");
    assert_eq!(newer.status, "partially_paid");
    assert_eq!(newer.amount_paid, dec!(25.00));
}

#[tokio::test]
#[ignore] // Requires database
async fn repeated_auto_match_reports_only_the_newly_allocated_amount() {
    let db = test_db().await;
    let seeded = seed_completed_run(&db, "monthly").await;
    db.create_invoice(&one_line_invoice(&seeded, dec!(100))).await.unwrap();

    let allocator = PaymentAllocator::new(db.pool().clone());
    let payment = db
        .create_payment(&CreatePaymentRequest {
            customer_id: seeded.customer_id,
            amount: dec!(200),
            payment_date: payment_date(),
            payment_reference: None,
            method: "bank_transfer".to_string(),
            external_id: None,
        })
        .await
        .unwrap();

    // First pass covers the 125.00 invoice, leaving 75.00 unallocated.
    assert_eq!(allocator.auto_match(payment.id).await.unwrap(), dec!(125.00));

    let seeded_two = seed_completed_run(&db, "monthly").await;
    let mut second = one_line_invoice(&seeded_two, dec!(100));
    second.customer_id = seeded.customer_id;
    db.create_invoice(&second).await.unwrap();

    // Second pass allocates only the remaining balance, not the cumulative
    // total of both passes.
    assert_eq!(allocator.auto_match(payment.id).await.unwrap(), dec!(75.00));

    let payment = db.get_payment(payment.id).await.unwrap().unwrap();
    assert_eq!(payment.amount_allocated, dec!(200));
    assert_eq!(payment.status, "allocated");
}

#[tokio::test]
#[ignore] // Requires database
async fn bank_file_import_matches_by_invoice_number() {
    let db = test_db().await;
    let seeded = seed_completed_run(&db, "monthly").await;
    let invoice = db.create_invoice(&one_line_invoice(&seeded, dec!(100))).await.unwrap();

    let service = PaymentMatchingService::new(db.clone(), PaymentAllocator::new(db.pool().clone()));
    let result = service
        .import_bank_file(&BankFileImportRequest {
            payments: vec![
                BankFilePayment {
                    amount: dec!(125.00),
                    payment_date: payment_date(),
                    payment_reference: invoice.invoice_number.to_string(),
                    external_id: Some("BANK-TXN-0042".to_string()),
                },
                BankFilePayment {
                    amount: dec!(50),
                    payment_date: payment_date(),
                    payment_reference: "not-an-invoice".to_string(),
                    external_id: None,
                },
            ],
        })
        .await
        .unwrap();

    assert_eq!(result.total, 2);
    assert_eq!(result.matched, 1);
    assert_eq!(result.unmatched, 1);
    assert!(result.errors[0].contains("No customer found for reference not-an-invoice"));

    let invoice = db.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(invoice.status, "paid");

    // The recorded payment carries the bank transaction identity.
    let payments = db.list_payments(Some(seeded.customer_id), 1, 10).await.unwrap();
    assert_eq!(payments.total, 1);
    assert_eq!(payments.items[0].method, "bank_transfer");
    assert_eq!(payments.items[0].external_id.as_deref(), Some("BANK-TXN-0042"));
}
