mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{checkout, TestApp};
use masterskaya_core::{
    auth::{Actor, ActorRole},
    entities::{material_reservation::ReservationStatus, order::OrderStatus},
    errors::ServiceError,
    events::Event,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn checkout_creates_a_pending_order() {
    let mut app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let bowl = app.seed_product(Uuid::new_v4(), "Bowl", 5).await;
    let cup = app.seed_product(Uuid::new_v4(), "Cup", 5).await;

    let details = app
        .place_order(customer, &[(bowl.id, 2), (cup.id, 1)])
        .await;
    let order = &details.order;

    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.customer_id, customer);
    // three units at 25 plus 5 delivery
    assert_eq!(order.total_amount, dec!(80));
    assert_eq!(details.lines.len(), 2);
    assert!(details.lines.iter().all(|l| l.stock_debited));
    assert_eq!(app.reload_product(bowl.id).await.stock_quantity, 3);
    assert_eq!(app.reload_product(cup.id).await.stock_quantity, 4);

    let prefix = Utc::now().format("%Y%m-").to_string();
    assert_eq!(order.order_number, format!("{prefix}0001"));
    let second = app.place_order(customer, &[(cup.id, 1)]).await;
    assert_eq!(second.order.order_number, format!("{prefix}0002"));

    let history = app.services.orders.history(order.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, OrderStatus::Pending);
    assert_eq!(history[0].actor_role, ActorRole::Customer);

    assert!(app
        .drain_events()
        .iter()
        .any(|e| matches!(e, Event::OrderCreated { order_id, .. } if *order_id == order.id)));

    let fetched = app.services.orders.get_order(order.id).await.unwrap();
    assert_eq!(fetched.order, details.order);
    assert_eq!(fetched.lines.len(), 2);
}

#[tokio::test]
async fn order_numbers_continue_past_four_digits() {
    let app = TestApp::new().await;
    let prefix = Utc::now().format("%Y%m-").to_string();
    app.seed_order_number(&format!("{prefix}9999")).await;
    app.seed_order_number(&format!("{prefix}10000")).await;
    let product = app.seed_product(Uuid::new_v4(), "Tray", 5).await;

    let first = app.place_order(Uuid::new_v4(), &[(product.id, 1)]).await;
    assert_eq!(first.order.order_number, format!("{prefix}10001"));
    let second = app.place_order(Uuid::new_v4(), &[(product.id, 1)]).await;
    assert_eq!(second.order.order_number, format!("{prefix}10002"));
}

#[tokio::test]
async fn short_stock_aborts_the_whole_checkout() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let plenty = app.seed_product(Uuid::new_v4(), "Soap", 10).await;
    let scarce = app.seed_product(Uuid::new_v4(), "Brush", 1).await;

    let result = app
        .services
        .orders
        .create_order(
            &Actor::customer(customer),
            checkout(customer, &[(plenty.id, 3), (scarce.id, 2)]),
        )
        .await;

    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(app.reload_product(plenty.id).await.stock_quantity, 10);
    assert_eq!(app.reload_product(scarce.id).await.stock_quantity, 1);
}

#[tokio::test]
async fn orders_are_placed_by_the_customer_or_staff() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), "Rug", 5).await;
    let orders = &app.services.orders;

    assert_matches!(
        orders
            .create_order(
                &Actor::customer(Uuid::new_v4()),
                checkout(customer, &[(product.id, 1)])
            )
            .await,
        Err(ServiceError::Forbidden(_))
    );

    let by_staff = orders
        .create_order(
            &Actor::staff(Uuid::new_v4()),
            checkout(customer, &[(product.id, 1)]),
        )
        .await
        .unwrap();
    assert_eq!(by_staff.order.customer_id, customer);
}

#[tokio::test]
async fn invalid_checkouts_are_rejected() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product(Uuid::new_v4(), "Lamp", 5).await;
    let orders = &app.services.orders;

    let empty = checkout(customer, &[]);
    assert_matches!(
        orders.create_order(&Actor::customer(customer), empty).await,
        Err(ServiceError::ValidationError(_))
    );

    let zero_units = checkout(customer, &[(product.id, 0)]);
    assert_matches!(
        orders.create_order(&Actor::customer(customer), zero_units).await,
        Err(ServiceError::ValidationError(_))
    );

    let mut bad_email = checkout(customer, &[(product.id, 1)]);
    bad_email.customer_email = "nobody".into();
    assert_matches!(
        orders.create_order(&Actor::customer(customer), bad_email).await,
        Err(ServiceError::ValidationError(_))
    );

    assert_eq!(app.reload_product(product.id).await.stock_quantity, 5);
}

#[tokio::test]
async fn line_quantity_changes_follow_stock_and_materials() {
    let app = TestApp::new().await;
    let maker = Uuid::new_v4();
    let product = app.seed_product(maker, "Wicker chair", 10).await;
    let willow = app.seed_material(maker, "Willow", dec!(30), dec!(0)).await;
    app.seed_recipe(product.id, willow.id, dec!(4), dec!(0), false).await;

    let details = app.place_order(Uuid::new_v4(), &[(product.id, 2)]).await;
    let line_id = details.lines[0].id;
    app.advance(
        details.order.id,
        &[OrderStatus::Paid, OrderStatus::Processing, OrderStatus::InWork],
    )
    .await;
    assert_eq!(app.reload_material(willow.id).await.current_quantity, dec!(22));

    let updated = app
        .services
        .orders
        .change_line_quantity(&Actor::maker(maker), line_id, 3)
        .await
        .unwrap();
    assert_eq!(updated.lines[0].quantity, 3);
    assert_eq!(updated.order.total_amount, dec!(80));
    assert_eq!(app.reload_product(product.id).await.stock_quantity, 7);
    assert_eq!(app.reload_material(willow.id).await.current_quantity, dec!(18));

    let reservations = app
        .services
        .reservations
        .list_by_order_item(line_id)
        .await
        .unwrap();
    let open: Vec<_> = reservations
        .iter()
        .filter(|r| r.status == ReservationStatus::Reserved)
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].quantity, dec!(12));

    // more than the material can cover keeps the old quantity
    assert_matches!(
        app.services
            .orders
            .change_line_quantity(&Actor::maker(maker), line_id, 9)
            .await,
        Err(ServiceError::InsufficientMaterial { .. })
    );
    assert_eq!(app.reload_material(willow.id).await.current_quantity, dec!(18));
    assert_eq!(app.reload_product(product.id).await.stock_quantity, 7);

    let shrunk = app
        .services
        .orders
        .change_line_quantity(&Actor::staff(Uuid::new_v4()), line_id, 1)
        .await
        .unwrap();
    assert_eq!(shrunk.lines[0].quantity, 1);
    assert_eq!(app.reload_product(product.id).await.stock_quantity, 9);
    assert_eq!(app.reload_material(willow.id).await.current_quantity, dec!(26));
}

#[tokio::test]
async fn line_changes_are_refused_late_or_by_outsiders() {
    let app = TestApp::new().await;
    let maker = Uuid::new_v4();
    let customer = Uuid::new_v4();
    let product = app.seed_product(maker, "Teapot", 10).await;
    let details = app.place_order(customer, &[(product.id, 1)]).await;
    let line_id = details.lines[0].id;
    let orders = &app.services.orders;

    assert_matches!(
        orders
            .change_line_quantity(&Actor::customer(customer), line_id, 2)
            .await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        orders
            .change_line_quantity(&Actor::maker(Uuid::new_v4()), line_id, 2)
            .await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        orders
            .change_line_quantity(&Actor::maker(maker), line_id, 0)
            .await,
        Err(ServiceError::ValidationError(_))
    );

    app.advance(
        details.order.id,
        &[
            OrderStatus::Paid,
            OrderStatus::Processing,
            OrderStatus::InWork,
            OrderStatus::PreparingForShipment,
        ],
    )
    .await;
    assert_matches!(
        orders
            .change_line_quantity(&Actor::maker(maker), line_id, 2)
            .await,
        Err(ServiceError::InvalidOperation(_))
    );

    app.advance(details.order.id, &[OrderStatus::Cancelled]).await;
    assert_matches!(
        orders
            .change_line_quantity(&Actor::staff(Uuid::new_v4()), line_id, 2)
            .await,
        Err(ServiceError::TerminalOrderState(_))
    );
    assert_eq!(app.reload_product(product.id).await.stock_quantity, 10);
}
