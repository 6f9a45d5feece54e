use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait,
    DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{capabilities, Actor, OrderAccess},
    db,
    entities::{
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        order_status_history::{self, Entity as HistoryEntity},
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender, OrderStatusNotification},
    services::{recipes, reservations},
};

/// Longest comment kept in the history, in characters.
pub const MAX_COMMENT_CHARS: usize = 500;

const DEFAULT_TRACKING_PREFIX: &str = "TRK";

fn truncate_comment(comment: &str) -> String {
    comment.chars().take(MAX_COMMENT_CHARS).collect()
}

/// Drives orders through the status graph and runs the material side effects
/// of each step in the same transaction as the status change.
#[derive(Clone)]
pub struct OrderStateMachine {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
    tracking_prefix: String,
}

impl OrderStateMachine {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self {
            db,
            event_sender,
            tracking_prefix: DEFAULT_TRACKING_PREFIX.to_string(),
        }
    }

    pub fn with_tracking_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tracking_prefix = prefix.into();
        self
    }

    /// Moves the order to `new_status` on behalf of `actor`.
    ///
    /// Checks run in order: a closed order fails with `TerminalOrderState`, a
    /// target the actor may not request fails with `Forbidden`, and a target
    /// outside the transition table fails with `IllegalTransition`. A failing
    /// side effect (e.g. `InsufficientMaterial` when entering `in_work`)
    /// aborts the whole change. Returns the appended history entry.
    #[instrument(skip(self, comment, photo), fields(order_id = %order_id, new_status = %new_status, actor = %actor))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor: &Actor,
        comment: &str,
        photo: Option<String>,
    ) -> Result<order_status_history::Model, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let order = lock_order(&txn, order_id).await?;
        let old_status = order.status;

        if old_status.is_terminal() {
            return Err(ServiceError::TerminalOrderState(old_status.to_string()));
        }

        let lines = order_lines(&txn, order_id).await?;
        let access = order_access(&txn, &order, &lines).await?;
        if !capabilities(actor, &access).allows(new_status) {
            warn!(actor = %actor, from = %old_status, to = %new_status, "Status change refused");
            counter!("masterskaya_orders.status_refused", 1, "reason" => "forbidden");
            return Err(ServiceError::Forbidden(format!(
                "{} may not move order {} from '{}' to '{}'",
                actor.role, order.order_number, old_status, new_status
            )));
        }

        if !old_status.can_transition_to(new_status) {
            counter!("masterskaya_orders.status_refused", 1, "reason" => "illegal");
            return Err(ServiceError::IllegalTransition {
                from: old_status.to_string(),
                to: new_status.to_string(),
            });
        }

        let now = Utc::now();
        let mut paid_at = order.paid_at;
        let mut tracking_number = order.tracking_number.clone();

        match new_status {
            OrderStatus::Paid => {
                paid_at.get_or_insert(now);
            }
            OrderStatus::InWork => {
                for line in &lines {
                    recipes::reserve_for_line_in(&txn, line, &mut events).await?;
                }
            }
            OrderStatus::PreparingForShipment => {
                for line in &lines {
                    reservations::consume_all_for_line_in(&txn, line, true, &mut events).await?;
                }
            }
            OrderStatus::Shipped => {
                if tracking_number.as_deref().map_or(true, str::is_empty) {
                    tracking_number = Some(self.synthesize_tracking_number());
                }
            }
            OrderStatus::Cancelled => {
                for line in &lines {
                    reservations::release_all_for_line_in(&txn, line.id, &mut events).await?;
                    restore_product_stock(&txn, line).await?;
                }
            }
            OrderStatus::Pending | OrderStatus::Processing | OrderStatus::Delivered => {}
        }

        let result = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::PaidAt, Expr::value(paid_at))
            .col_expr(order::Column::TrackingNumber, Expr::value(tracking_number.clone()))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .col_expr(order::Column::Version, Expr::value(order.version + 1))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Version.eq(order.version))
            .exec(&txn)
            .await
            .map_err(|e| {
                error!("Failed to update order {} status: {}", order_id, e);
                ServiceError::db_error(e)
            })?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        let comment = truncate_comment(comment);
        let entry = append_history_in(&txn, order_id, new_status, actor, comment.clone(), photo).await?;

        db::commit(txn, "order.update_status", started).await?;

        histogram!(
            "masterskaya_orders.status_change.duration",
            started.elapsed(),
            "to" => new_status.to_string()
        );
        counter!(
            "masterskaya_orders.status_changes",
            1,
            "from" => old_status.to_string(),
            "to" => new_status.to_string()
        );
        info!(
            "Order {} status updated from '{}' to '{}'",
            order.order_number, old_status, new_status
        );

        events.push(Event::OrderStatusChanged(OrderStatusNotification {
            order_id,
            order_number: order.order_number,
            customer_id: order.customer_id,
            old_status,
            new_status,
            comment,
            tracking_number,
            changed_at: entry.created_at,
        }));
        if let Some(sender) = &self.event_sender {
            sender.publish_all(events);
        }

        Ok(entry)
    }

    /// Statuses the actor could move the order to right now.
    #[instrument(skip(self), fields(order_id = %order_id, actor = %actor))]
    pub async fn next_possible_statuses(
        &self,
        order_id: Uuid,
        actor: &Actor,
    ) -> Result<Vec<OrderStatus>, ServiceError> {
        let db = &*self.db;
        let order = find_order(db, order_id).await?;
        let lines = order_lines(db, order_id).await?;
        let access = order_access(db, &order, &lines).await?;
        let caps = capabilities(actor, &access);

        Ok(order
            .status
            .allowed_transitions()
            .iter()
            .copied()
            .filter(|status| caps.allows(*status))
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn progress_percent(&self, order_id: Uuid) -> Result<u8, ServiceError> {
        Ok(find_order(&*self.db, order_id).await?.progress_percent())
    }

    #[instrument(skip(self))]
    pub async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        find_order(&*self.db, order_id).await?;
        order_history(&*self.db, order_id).await
    }

    fn synthesize_tracking_number(&self) -> String {
        let token = Uuid::new_v4().simple().to_string().to_uppercase();
        format!("{}-{}", self.tracking_prefix, &token[..12])
    }
}

pub(crate) async fn find_order<C>(conn: &C, order_id: Uuid) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await
        .map_err(|e| {
            error!("Failed to fetch order {}: {}", order_id, e);
            ServiceError::db_error(e)
        })?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub(crate) async fn lock_order<C>(conn: &C, order_id: Uuid) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    OrderEntity::find_by_id(order_id)
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub(crate) async fn order_lines<C>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Collects the makers behind the order's lines.
pub(crate) async fn order_access<C>(
    conn: &C,
    order: &order::Model,
    lines: &[order_item::Model],
) -> Result<OrderAccess, ServiceError>
where
    C: ConnectionTrait,
{
    let product_ids: HashSet<Uuid> = lines.iter().map(|line| line.product_id).collect();
    let maker_ids = if product_ids.is_empty() {
        HashSet::new()
    } else {
        ProductEntity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|p| p.maker_id)
            .collect()
    };

    Ok(OrderAccess {
        status: order.status,
        customer_id: order.customer_id,
        maker_ids,
    })
}

pub(crate) async fn order_history<C>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_status_history::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    HistoryEntity::find()
        .filter(order_status_history::Column::OrderId.eq(order_id))
        .order_by_asc(order_status_history::Column::Sequence)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

/// Appends the next history entry. `(order_id, sequence)` is unique, so two
/// writers racing for the same slot cannot both commit.
pub(crate) async fn append_history_in<C>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
    actor: &Actor,
    comment: String,
    photo: Option<String>,
) -> Result<order_status_history::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let existing = HistoryEntity::find()
        .filter(order_status_history::Column::OrderId.eq(order_id))
        .count(conn)
        .await
        .map_err(ServiceError::db_error)?;
    let sequence = i32::try_from(existing + 1)
        .map_err(|_| ServiceError::InternalError(format!("History of order {} is full", order_id)))?;

    order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        sequence: Set(sequence),
        status: Set(status),
        actor_id: Set(actor.id),
        actor_role: Set(actor.role),
        comment: Set(comment),
        photo: Set(photo),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await
    .map_err(|e| {
        error!("Failed to append history for order {}: {}", order_id, e);
        ServiceError::db_error(e)
    })
}

/// Returns product stock taken at checkout. Clears the line's flag so the
/// same units are never returned twice.
pub(crate) async fn restore_product_stock<C>(
    conn: &C,
    line: &order_item::Model,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    if !line.stock_debited {
        return Ok(());
    }

    ProductEntity::update_many()
        .col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).add(line.quantity),
        )
        .filter(product::Column::Id.eq(line.product_id))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    OrderItemEntity::update_many()
        .col_expr(order_item::Column::StockDebited, Expr::value(false))
        .filter(order_item::Column::Id.eq(line.id))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    info!(
        order_item_id = %line.id,
        product_id = %line.product_id,
        quantity = line.quantity,
        "Product stock restored"
    );
    Ok(())
}
