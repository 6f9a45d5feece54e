mod common;

use common::TestApp;
use masterskaya_core::{
    entities::{material_reservation::ReservationStatus, order::OrderStatus},
    services::reservations::ReorderUrgency,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn reorder_list_is_sorted_by_urgency_then_fill() {
    let app = TestApp::new().await;
    let maker = Uuid::new_v4();

    for (name, current) in [
        ("Lead", dec!(20)),
        ("Iron", dec!(12)),
        ("Tin", dec!(10)),
        ("Copper", dec!(5)),
        ("Brass", dec!(4)),
        ("Zinc", dec!(0)),
    ] {
        app.seed_material(maker, name, current, dec!(10)).await;
    }
    app.seed_material(maker, "Gold leaf", dec!(0), dec!(0)).await;
    let silver = app.seed_material(maker, "Silver", dec!(0), dec!(5)).await;
    app.services.materials.deactivate(silver.id).await.unwrap();
    app.seed_material(Uuid::new_v4(), "Someone else's zinc", dec!(0), dec!(10))
        .await;

    let list = app
        .services
        .reservations
        .generate_reorder_list(maker)
        .await
        .unwrap();

    let summary: Vec<(&str, ReorderUrgency)> =
        list.iter().map(|i| (i.name.as_str(), i.urgency)).collect();
    assert_eq!(
        summary,
        vec![
            ("Zinc", ReorderUrgency::Critical),
            ("Brass", ReorderUrgency::High),
            ("Copper", ReorderUrgency::High),
            ("Tin", ReorderUrgency::Medium),
            ("Iron", ReorderUrgency::Low),
        ]
    );

    assert_eq!(list[0].suggested_quantity, dec!(20));
    assert_eq!(list[1].suggested_quantity, dec!(16));
    assert_eq!(list[1].estimated_cost, dec!(32));
    assert_eq!(list[1].supplier.as_deref(), Some("Local mill"));
}

#[tokio::test]
async fn reservations_move_materials_onto_the_reorder_list() {
    let app = TestApp::new().await;
    let maker = Uuid::new_v4();
    let felt = app.seed_material(maker, "Felt", dec!(20), dec!(10)).await;

    let reorder = &app.services.reservations;
    assert!(reorder.generate_reorder_list(maker).await.unwrap().is_empty());

    app.services
        .materials
        .reserve(felt.id, dec!(15), None)
        .await
        .unwrap();
    let list = reorder.generate_reorder_list(maker).await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].urgency, ReorderUrgency::High);
}

#[tokio::test]
async fn material_report_summarises_stock_and_holds() {
    let app = TestApp::new().await;
    let maker = Uuid::new_v4();
    let cord = app.seed_material(maker, "Cord", dec!(10), dec!(2)).await;
    let bead = app.seed_material(maker, "Bead", dec!(3), dec!(5)).await;
    let old = app.seed_material(maker, "Old dye", dec!(1), dec!(4)).await;
    app.services.materials.deactivate(old.id).await.unwrap();
    app.seed_material(Uuid::new_v4(), "Other maker cord", dec!(99), dec!(0))
        .await;

    app.services
        .materials
        .reserve(cord.id, dec!(4), None)
        .await
        .unwrap();

    let report = app
        .services
        .reservations
        .material_report(Some(maker))
        .await
        .unwrap();
    assert_eq!(report.total_materials, 3);
    assert_eq!(report.active_materials, 2);
    // inactive materials are not counted as low
    assert_eq!(report.low_stock_count, 1);
    assert_eq!(report.open_reservations, 1);
    // (6 + 3 + 1) units at 2 apiece
    assert_eq!(report.total_stock_value, dec!(20));

    let names: Vec<&str> = report.materials.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["Bead", "Cord", "Old dye"]);
    let cord_row = &report.materials[1];
    assert_eq!(cord_row.material_id, cord.id);
    assert_eq!(cord_row.current_quantity, dec!(6));
    assert_eq!(cord_row.reserved_quantity, dec!(4));
    assert!(report.materials[0].is_low_stock);
    assert_eq!(report.materials[0].material_id, bead.id);

    let everyone = app
        .services
        .reservations
        .material_report(None)
        .await
        .unwrap();
    assert_eq!(everyone.total_materials, 4);
}

#[tokio::test]
async fn line_release_and_consume_are_idempotent() {
    let app = TestApp::new().await;
    let maker = Uuid::new_v4();
    let product = app.seed_product(maker, "Rag doll", 5).await;
    let cloth = app.seed_material(maker, "Cloth", dec!(10), dec!(0)).await;
    let stuffing = app.seed_material(maker, "Stuffing", dec!(10), dec!(0)).await;
    app.seed_recipe(product.id, cloth.id, dec!(1), dec!(0), true).await;
    app.seed_recipe(product.id, stuffing.id, dec!(0.5), dec!(0), false)
        .await;

    let details = app.place_order(Uuid::new_v4(), &[(product.id, 2)]).await;
    let line_id = details.lines[0].id;
    app.advance(
        details.order.id,
        &[OrderStatus::Paid, OrderStatus::Processing, OrderStatus::InWork],
    )
    .await;

    let tracker = &app.services.reservations;
    assert_eq!(
        tracker
            .list_by_status(ReservationStatus::Reserved)
            .await
            .unwrap()
            .len(),
        2
    );

    assert_eq!(tracker.release_all_for_order_line(line_id).await.unwrap(), 2);
    assert_eq!(tracker.release_all_for_order_line(line_id).await.unwrap(), 0);
    assert_eq!(app.reload_material(cloth.id).await.current_quantity, dec!(10));
    assert_eq!(app.reload_material(stuffing.id).await.current_quantity, dec!(10));

    app.services
        .recipes
        .reserve_for_order_line(line_id)
        .await
        .unwrap();
    assert_eq!(
        tracker.consume_all_for_order_line(line_id, true).await.unwrap(),
        1
    );
    assert_eq!(
        tracker.consume_all_for_order_line(line_id, false).await.unwrap(),
        1
    );
    assert_eq!(
        tracker.consume_all_for_order_line(line_id, false).await.unwrap(),
        0
    );
    assert_eq!(app.reload_material(cloth.id).await.current_quantity, dec!(8));
    assert_eq!(app.reload_material(stuffing.id).await.current_quantity, dec!(9));

    let history = tracker.list_by_order_item(line_id).await.unwrap();
    assert_eq!(history.len(), 4);
    let consumed: Decimal = history
        .iter()
        .filter(|r| r.status == ReservationStatus::Consumed)
        .map(|r| r.quantity)
        .sum();
    assert_eq!(consumed, dec!(3));
}
