//! Order intake: turns a checkout snapshot into an order, and keeps stock,
//! materials and totals consistent when a line's quantity changes later.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, SqlErr,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    auth::{Actor, ActorRole},
    db,
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        order_status_history,
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{order_status, recipes, reservations},
};

/// One cart line as priced at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutLine {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    #[validate(custom = "validate_price")]
    pub unit_price: Decimal,
    /// Configurator selections for custom orders.
    #[serde(default)]
    pub custom_configuration: Option<serde_json::Value>,
    #[validate(custom = "validate_price")]
    #[serde(default)]
    pub custom_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Checkout {
    pub customer_id: Uuid,
    #[validate(length(min = 1, max = 100))]
    pub customer_name: String,
    #[validate(length(min = 1, max = 20))]
    pub customer_phone: String,
    #[validate(email)]
    pub customer_email: String,
    #[validate(length(min = 1, message = "Delivery address is required"))]
    pub delivery_address: String,
    pub delivery_method: Option<String>,
    pub payment_method: Option<String>,
    #[validate(custom = "validate_price")]
    #[serde(default)]
    pub delivery_cost: Decimal,
    #[validate(custom = "validate_price")]
    #[serde(default)]
    pub discount_amount: Decimal,
    #[validate(length(max = 50))]
    pub promo_code: Option<String>,
    #[validate(length(min = 1, message = "Order must have at least one line"))]
    pub lines: Vec<CheckoutLine>,
}

fn validate_price(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        let mut err = ValidationError::new("price");
        err.message = Some("Amounts must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// An order with its lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub lines: Vec<order_item::Model>,
}

impl OrderDetails {
    pub fn progress_percent(&self) -> u8 {
        self.order.progress_percent()
    }
}

/// Lines plus delivery minus discount, never below zero.
pub fn order_total(lines: &[order_item::Model], delivery_cost: Decimal, discount: Decimal) -> Decimal {
    let items: Decimal = lines.iter().map(order_item::Model::subtotal).sum();
    (items + delivery_cost - discount).max(Decimal::ZERO)
}

/// `YYYYMM-` prefix shared by every order number issued in that month.
fn order_number_prefix(at: DateTime<Utc>) -> String {
    at.format("%Y%m-").to_string()
}

/// One past the highest numeric sequence among `issued`. Sequences are compared
/// as numbers, so `-10000` follows `-9999`.
fn next_order_number<'a>(prefix: &str, issued: impl IntoIterator<Item = &'a str>) -> String {
    let next = issued
        .into_iter()
        .filter_map(|number| number.strip_prefix(prefix))
        .filter_map(|seq| seq.parse::<u32>().ok())
        .max()
        .map_or(1, |seq| seq + 1);
    format!("{}{:04}", prefix, next)
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    fn publish(&self, events: Vec<Event>) {
        if let Some(sender) = &self.event_sender {
            sender.publish_all(events);
        }
    }

    /// Creates a `pending` order from a checkout snapshot, taking product stock
    /// for every line.
    #[instrument(skip(self, checkout), fields(actor = %actor, customer_id = %checkout.customer_id, lines = checkout.lines.len()))]
    pub async fn create_order(
        &self,
        actor: &Actor,
        checkout: Checkout,
    ) -> Result<OrderDetails, ServiceError> {
        checkout.validate()?;
        for line in &checkout.lines {
            line.validate()?;
        }
        if actor.role != ActorRole::Staff && actor.id != checkout.customer_id {
            return Err(ServiceError::Forbidden(
                "Orders can only be placed for yourself".to_string(),
            ));
        }

        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let mut lines = Vec::with_capacity(checkout.lines.len());
        for line in &checkout.lines {
            let product = debit_product_stock(&txn, line.product_id, line.quantity).await?;
            lines.push(order_item::Model {
                id: Uuid::new_v4(),
                order_id,
                product_id: product.id,
                product_name: product.name,
                quantity: line.quantity,
                unit_price: line.unit_price,
                custom_configuration: line.custom_configuration.clone(),
                custom_price: line.custom_price,
                stock_debited: true,
                created_at: now,
            });
        }

        let order_number = allocate_order_number(&txn, now).await?;
        let total_amount = order_total(&lines, checkout.delivery_cost, checkout.discount_amount);

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_id: Set(checkout.customer_id),
            status: Set(OrderStatus::Pending),
            total_amount: Set(total_amount),
            delivery_cost: Set(checkout.delivery_cost),
            discount_amount: Set(checkout.discount_amount),
            promo_code: Set(checkout.promo_code),
            delivery_address: Set(checkout.delivery_address),
            customer_name: Set(checkout.customer_name),
            customer_phone: Set(checkout.customer_phone),
            customer_email: Set(checkout.customer_email),
            delivery_method: Set(checkout.delivery_method),
            payment_method: Set(checkout.payment_method),
            tracking_number: Set(None),
            paid_at: Set(None),
            version: Set(1),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                // another checkout took the same order number first
                warn!(order_id = %order_id, "Order number collision");
                counter!("masterskaya_orders.number_collisions", 1);
                return ServiceError::ConcurrentModification(order_id);
            }
            error!("Failed to insert order: {}", e);
            ServiceError::db_error(e)
        })?;

        for line in &lines {
            new_line(line)
                .insert(&txn)
                .await
                .map_err(|e| {
                    error!("Failed to insert order line: {}", e);
                    ServiceError::db_error(e)
                })?;
        }

        order_status::append_history_in(
            &txn,
            order.id,
            OrderStatus::Pending,
            actor,
            "Order created".to_string(),
            None,
        )
        .await?;

        db::commit(txn, "order.create", started).await?;

        counter!("masterskaya_orders.created", 1);
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            "Order created"
        );
        self.publish(vec![Event::OrderCreated {
            order_id: order.id,
            order_number: order.order_number.clone(),
            customer_id: order.customer_id,
            total_amount: order.total_amount,
        }]);

        Ok(OrderDetails { order, lines })
    }

    /// Changes how many units a line orders. Product stock follows the delta;
    /// an order already `in_work` has the line's materials re-reserved for the
    /// new quantity, all or nothing.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn change_line_quantity(
        &self,
        actor: &Actor,
        order_item_id: Uuid,
        quantity: i32,
    ) -> Result<OrderDetails, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::ValidationError(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let line = OrderItemEntity::find_by_id(order_item_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order line {} not found", order_item_id)))?;
        let order = order_status::lock_order(&txn, line.order_id).await?;

        if order.status.is_terminal() {
            return Err(ServiceError::TerminalOrderState(order.status.to_string()));
        }

        let product = ProductEntity::find_by_id(line.product_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", line.product_id)))?;
        let may_edit = match actor.role {
            ActorRole::Staff => true,
            ActorRole::Maker => product.maker_id == actor.id,
            ActorRole::Customer => false,
        };
        if !may_edit {
            return Err(ServiceError::Forbidden(format!(
                "{} may not change lines of order {}",
                actor.role, order.order_number
            )));
        }

        if !matches!(
            order.status,
            OrderStatus::Pending | OrderStatus::Paid | OrderStatus::Processing | OrderStatus::InWork
        ) {
            return Err(ServiceError::InvalidOperation(format!(
                "Lines of order {} cannot change once it is {}",
                order.order_number, order.status
            )));
        }

        let delta = quantity - line.quantity;
        if delta == 0 {
            let lines = order_status::order_lines(&txn, order.id).await?;
            return Ok(OrderDetails { order, lines });
        }

        if line.stock_debited {
            if delta > 0 {
                debit_product_stock(&txn, line.product_id, delta).await?;
            } else {
                ProductEntity::update_many()
                    .col_expr(
                        product::Column::StockQuantity,
                        Expr::col(product::Column::StockQuantity).add(-delta),
                    )
                    .filter(product::Column::Id.eq(line.product_id))
                    .exec(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
            }
        }

        let mut active: order_item::ActiveModel = line.clone().into();
        active.quantity = Set(quantity);
        let updated_line = active.update(&txn).await.map_err(ServiceError::db_error)?;

        if order.status == OrderStatus::InWork {
            reservations::release_all_for_line_in(&txn, line.id, &mut events).await?;
            recipes::reserve_for_line_in(&txn, &updated_line, &mut events).await?;
        }

        let lines = order_status::order_lines(&txn, order.id).await?;
        let total_amount = order_total(&lines, order.delivery_cost, order.discount_amount);
        let now = Utc::now();

        let result = OrderEntity::update_many()
            .col_expr(order::Column::TotalAmount, Expr::value(total_amount))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(order::Column::Version, Expr::value(order.version + 1))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Version.eq(order.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }

        db::commit(txn, "order.change_line_quantity", started).await?;

        info!(
            order_item_id = %order_item_id,
            old_quantity = line.quantity,
            new_quantity = quantity,
            total = %total_amount,
            "Order line quantity changed"
        );
        self.publish(events);

        let order = order::Model {
            total_amount,
            updated_at: Some(now),
            version: order.version + 1,
            ..order
        };
        Ok(OrderDetails { order, lines })
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        let order = order_status::find_order(db, order_id).await?;
        let lines = order_status::order_lines(db, order_id).await?;
        Ok(OrderDetails { order, lines })
    }

    /// Status history, oldest first.
    #[instrument(skip(self))]
    pub async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        let db = &*self.db;
        order_status::find_order(db, order_id).await?;
        order_status::order_history(db, order_id).await
    }
}

fn new_line(line: &order_item::Model) -> order_item::ActiveModel {
    order_item::ActiveModel {
        id: Set(line.id),
        order_id: Set(line.order_id),
        product_id: Set(line.product_id),
        product_name: Set(line.product_name.clone()),
        quantity: Set(line.quantity),
        unit_price: Set(line.unit_price),
        custom_configuration: Set(line.custom_configuration.clone()),
        custom_price: Set(line.custom_price),
        stock_debited: Set(line.stock_debited),
        created_at: Set(line.created_at),
    }
}

/// Takes `quantity` units of product stock, failing with `InsufficientStock`
/// if the shelf cannot cover it.
async fn debit_product_stock<C>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> Result<product::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let product = ProductEntity::find_by_id(product_id)
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

    if !product.is_active {
        return Err(ServiceError::InvalidOperation(format!(
            "Product '{}' is not available",
            product.name
        )));
    }
    if product.stock_quantity < quantity {
        return Err(ServiceError::InsufficientStock(format!(
            "'{}': requested {}, in stock {}",
            product.name, quantity, product.stock_quantity
        )));
    }

    let result = ProductEntity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).sub(quantity),
        )
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::StockQuantity.gte(quantity))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;
    if result.rows_affected == 0 {
        return Err(ServiceError::InsufficientStock(format!(
            "'{}' sold out while ordering",
            product.name
        )));
    }

    Ok(product::Model {
        stock_quantity: product.stock_quantity - quantity,
        ..product
    })
}

async fn allocate_order_number<C>(conn: &C, now: DateTime<Utc>) -> Result<String, ServiceError>
where
    C: ConnectionTrait,
{
    let prefix = order_number_prefix(now);
    let issued: Vec<String> = OrderEntity::find()
        .select_only()
        .column(order::Column::OrderNumber)
        .filter(order::Column::OrderNumber.starts_with(prefix.as_str()))
        .into_tuple()
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(next_order_number(&prefix, issued.iter().map(String::as_str)))
}
