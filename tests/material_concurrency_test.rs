mod common;

use common::TestApp;
use masterskaya_core::errors::ServiceError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn concurrent_reservations_never_oversell() {
    let app = TestApp::new().await;
    let material = app
        .seed_material(Uuid::new_v4(), "Merino yarn", dec!(10), dec!(0))
        .await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let ledger = app.services.materials.clone();
        let material_id = material.id;
        handles.push(tokio::spawn(async move {
            ledger.reserve(material_id, Decimal::ONE, None).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => successes += 1,
            Err(ServiceError::InsufficientMaterial { .. })
            | Err(ServiceError::ConcurrentModification(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 10);
    let view = app.services.materials.stock_view(material.id).await.unwrap();
    assert_eq!(view.current_quantity, Decimal::ZERO);
    assert_eq!(view.reserved_quantity, dec!(10));
}

#[tokio::test]
async fn concurrent_releases_credit_once() {
    let app = TestApp::new().await;
    let material = app
        .seed_material(Uuid::new_v4(), "Oak veneer", dec!(40), dec!(0))
        .await;
    let reservation = app
        .services
        .materials
        .reserve(material.id, dec!(15), None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = app.services.materials.clone();
        let reservation_id = reservation.id;
        handles.push(tokio::spawn(async move { ledger.release(reservation_id).await }));
    }

    let mut released = 0;
    for handle in handles {
        if handle.await.expect("task panicked").is_ok() {
            released += 1;
        }
    }

    assert_eq!(released, 1);
    assert_eq!(app.reload_material(material.id).await.current_quantity, dec!(40));
}
