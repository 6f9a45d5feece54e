//! Material Ledger
//!
//! Owns the stock quantity of every material and the reserve / consume /
//! release / cancel protocol against it. Stock is debited when a reservation
//! is taken; consuming a reservation only writes it off.
//!
//! Every public method runs in its own transaction. The `*_in` functions take
//! any [`ConnectionTrait`] so the recipe resolver and the order state machine
//! can run them inside a larger unit of work.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::db;
use crate::entities::material::{self, Entity as MaterialEntity, MaterialUnit};
use crate::entities::material_recipe::{self, Entity as RecipeEntity};
use crate::entities::material_reservation::{
    self, Entity as ReservationEntity, ReservationStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Input for registering a new material.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewMaterial {
    pub maker_id: Uuid,
    #[validate(length(min = 1, max = 100, message = "Material name must be 1-100 characters"))]
    pub name: String,
    pub unit: MaterialUnit,
    #[validate(custom = "validate_non_negative")]
    pub current_quantity: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub min_quantity: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub price_per_unit: Decimal,
    #[validate(length(max = 50))]
    pub color: Option<String>,
    #[validate(length(max = 100))]
    pub texture: Option<String>,
    #[validate(length(max = 200))]
    pub supplier: Option<String>,
}

fn validate_non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        let mut err = ValidationError::new("non_negative");
        err.message = Some("Value must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Read-only stock figures for the storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockView {
    pub material_id: Uuid,
    pub name: String,
    pub unit: MaterialUnit,
    /// Stock not yet set aside; what new reservations can draw on.
    pub current_quantity: Decimal,
    /// Sum of open reservations.
    pub reserved_quantity: Decimal,
    /// Physical stock on the shelf, including material set aside.
    pub on_hand_quantity: Decimal,
    pub available_quantity: Decimal,
    pub min_quantity: Decimal,
    pub is_low_stock: bool,
}

impl StockView {
    fn new(material: &material::Model, reserved_quantity: Decimal) -> Self {
        let on_hand_quantity = material.current_quantity + reserved_quantity;
        Self {
            material_id: material.id,
            name: material.name.clone(),
            unit: material.unit,
            current_quantity: material.current_quantity,
            reserved_quantity,
            on_hand_quantity,
            available_quantity: on_hand_quantity - reserved_quantity,
            min_quantity: material.min_quantity,
            is_low_stock: material.is_low_stock(),
        }
    }
}

/// Service for material stock and reservations.
#[derive(Clone)]
pub struct MaterialLedger {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl MaterialLedger {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    fn publish(&self, events: Vec<Event>) {
        if let Some(sender) = &self.event_sender {
            sender.publish_all(events);
        }
    }

    #[instrument(skip(self, input), fields(maker_id = %input.maker_id, name = %input.name))]
    pub async fn create_material(&self, input: NewMaterial) -> Result<material::Model, ServiceError> {
        input.validate()?;

        let model = material::ActiveModel {
            maker_id: Set(input.maker_id),
            name: Set(input.name.trim().to_string()),
            unit: Set(input.unit),
            current_quantity: Set(input.current_quantity),
            min_quantity: Set(input.min_quantity),
            price_per_unit: Set(input.price_per_unit),
            color: Set(input.color),
            texture: Set(input.texture),
            supplier: Set(input.supplier),
            is_active: Set(true),
            version: Set(1),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(|e| {
            error!("Failed to create material: {}", e);
            ServiceError::db_error(e)
        })?;

        info!(material_id = %model.id, "Material created");
        Ok(model)
    }

    #[instrument(skip(self))]
    pub async fn get_material(&self, material_id: Uuid) -> Result<material::Model, ServiceError> {
        find_material(&*self.db, material_id).await
    }

    /// True iff at least `quantity` is available to reserve.
    #[instrument(skip(self))]
    pub async fn check_availability(
        &self,
        material_id: Uuid,
        quantity: Decimal,
    ) -> Result<bool, ServiceError> {
        let material = find_material(&*self.db, material_id).await?;
        Ok(material.current_quantity >= quantity)
    }

    #[instrument(skip(self))]
    pub async fn available_quantity(&self, material_id: Uuid) -> Result<Decimal, ServiceError> {
        Ok(self.stock_view(material_id).await?.available_quantity)
    }

    #[instrument(skip(self))]
    pub async fn stock_view(&self, material_id: Uuid) -> Result<StockView, ServiceError> {
        let db = &*self.db;
        let material = find_material(db, material_id).await?;
        let reserved = open_reserved_total(db, material_id).await?;
        Ok(StockView::new(&material, reserved))
    }

    /// Sets `quantity` aside for an order line, or as a manual hold when
    /// `order_item_id` is `None`.
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        material_id: Uuid,
        quantity: Decimal,
        order_item_id: Option<Uuid>,
    ) -> Result<material_reservation::Model, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let reservation = reserve_in(&txn, material_id, quantity, order_item_id, &mut events).await?;

        db::commit(txn, "material.reserve", started).await?;
        self.publish(events);
        Ok(reservation)
    }

    #[instrument(skip(self))]
    pub async fn consume(
        &self,
        reservation_id: Uuid,
    ) -> Result<material_reservation::Model, ServiceError> {
        self.close(reservation_id, ReservationStatus::Consumed, "material.consume")
            .await
    }

    #[instrument(skip(self))]
    pub async fn release(
        &self,
        reservation_id: Uuid,
    ) -> Result<material_reservation::Model, ServiceError> {
        self.close(reservation_id, ReservationStatus::Released, "material.release")
            .await
    }

    /// Withdraws a hold without it having been used. Credits stock like `release`.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        reservation_id: Uuid,
    ) -> Result<material_reservation::Model, ServiceError> {
        self.close(reservation_id, ReservationStatus::Cancelled, "material.cancel")
            .await
    }

    async fn close(
        &self,
        reservation_id: Uuid,
        target: ReservationStatus,
        operation: &'static str,
    ) -> Result<material_reservation::Model, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let reservation = close_reservation_in(&txn, reservation_id, target, &mut events).await?;

        db::commit(txn, operation, started).await?;
        self.publish(events);
        Ok(reservation)
    }

    /// Manual credit (positive `delta`) or debit (negative) outside any reservation.
    #[instrument(skip(self))]
    pub async fn adjust_stock(
        &self,
        material_id: Uuid,
        delta: Decimal,
        reason: String,
    ) -> Result<material::Model, ServiceError> {
        if delta.is_zero() {
            return Err(ServiceError::ValidationError(
                "Stock adjustment must not be zero".to_string(),
            ));
        }

        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let material = lock_material(&txn, material_id).await?;
        let new_quantity = material.current_quantity + delta;
        if new_quantity < Decimal::ZERO {
            return Err(insufficient(&material, -delta));
        }

        let updated = write_quantity(&txn, &material, new_quantity).await?;
        events.push(Event::MaterialStockAdjusted {
            material_id,
            old_quantity: material.current_quantity,
            new_quantity,
            reason: reason.clone(),
        });
        if delta < Decimal::ZERO {
            push_low_stock(&updated, &mut events);
        }

        db::commit(txn, "material.adjust", started).await?;
        counter!("masterskaya_ledger.adjustments", 1);
        info!(
            material_id = %material_id,
            old_quantity = %material.current_quantity,
            new_quantity = %new_quantity,
            reason = %reason,
            "Material stock adjusted"
        );
        self.publish(events);
        Ok(updated)
    }

    /// Soft delete. Open reservations stay valid and can still be closed.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, material_id: Uuid) -> Result<material::Model, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;

        let material = lock_material(&txn, material_id).await?;
        if !material.is_active {
            return Ok(material);
        }

        let now = Utc::now();
        let result = MaterialEntity::update_many()
            .col_expr(material::Column::IsActive, Expr::value(false))
            .col_expr(material::Column::Version, Expr::value(material.version + 1))
            .col_expr(material::Column::UpdatedAt, Expr::value(now))
            .filter(material::Column::Id.eq(material_id))
            .filter(material::Column::Version.eq(material.version))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if result.rows_affected == 0 {
            warn!(material_id = %material_id, version = material.version, "Material version guard tripped");
            counter!("masterskaya_ledger.version_conflicts", 1);
            return Err(ServiceError::ConcurrentModification(material_id));
        }

        db::commit(txn, "material.deactivate", started).await?;
        info!(material_id = %material_id, "Material deactivated");
        Ok(material::Model {
            is_active: false,
            version: material.version + 1,
            updated_at: Some(now),
            ..material
        })
    }

    /// Hard delete, allowed only for materials nothing refers to.
    #[instrument(skip(self))]
    pub async fn delete_material(&self, material_id: Uuid) -> Result<(), ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;

        let material = lock_material(&txn, material_id).await?;

        let reservations = ReservationEntity::find()
            .filter(material_reservation::Column::MaterialId.eq(material_id))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if reservations > 0 {
            return Err(ServiceError::Conflict(format!(
                "Material '{}' has {} reservation(s); deactivate it instead",
                material.name, reservations
            )));
        }

        let recipes = RecipeEntity::find()
            .filter(material_recipe::Column::MaterialId.eq(material_id))
            .count(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if recipes > 0 {
            return Err(ServiceError::Conflict(format!(
                "Material '{}' is used by {} recipe(s)",
                material.name, recipes
            )));
        }

        MaterialEntity::delete_by_id(material_id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        db::commit(txn, "material.delete", started).await?;
        info!(material_id = %material_id, "Material deleted");
        Ok(())
    }
}

pub(crate) async fn find_material<C>(conn: &C, material_id: Uuid) -> Result<material::Model, ServiceError>
where
    C: ConnectionTrait,
{
    MaterialEntity::find_by_id(material_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Material {} not found", material_id)))
}

/// Reads the material row under an exclusive row lock for the rest of the transaction.
pub(crate) async fn lock_material<C>(conn: &C, material_id: Uuid) -> Result<material::Model, ServiceError>
where
    C: ConnectionTrait,
{
    MaterialEntity::find_by_id(material_id)
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Material {} not found", material_id)))
}

/// Sum of open reservations against a material.
pub(crate) async fn open_reserved_total<C>(conn: &C, material_id: Uuid) -> Result<Decimal, ServiceError>
where
    C: ConnectionTrait,
{
    let open = ReservationEntity::find()
        .filter(material_reservation::Column::MaterialId.eq(material_id))
        .filter(material_reservation::Column::Status.eq(ReservationStatus::Reserved))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(open.iter().map(|r| r.quantity).sum())
}

/// Writes a new quantity under the version guard. A concurrent writer that got
/// there first makes this fail with `ConcurrentModification`.
async fn write_quantity<C>(
    conn: &C,
    material: &material::Model,
    new_quantity: Decimal,
) -> Result<material::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let result = MaterialEntity::update_many()
        .col_expr(material::Column::CurrentQuantity, Expr::value(new_quantity))
        .col_expr(material::Column::Version, Expr::value(material.version + 1))
        .col_expr(material::Column::UpdatedAt, Expr::value(now))
        .filter(material::Column::Id.eq(material.id))
        .filter(material::Column::Version.eq(material.version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        warn!(material_id = %material.id, version = material.version, "Material version guard tripped");
        counter!("masterskaya_ledger.version_conflicts", 1);
        return Err(ServiceError::ConcurrentModification(material.id));
    }

    Ok(material::Model {
        current_quantity: new_quantity,
        version: material.version + 1,
        updated_at: Some(now),
        ..material.clone()
    })
}

fn insufficient(material: &material::Model, requested: Decimal) -> ServiceError {
    ServiceError::InsufficientMaterial {
        material_id: material.id,
        material_name: material.name.clone(),
        requested,
        available: material.current_quantity,
    }
}

fn push_low_stock(material: &material::Model, events: &mut Vec<Event>) {
    if material.min_quantity > Decimal::ZERO && material.is_low_stock() {
        events.push(Event::LowStock {
            material_id: material.id,
            maker_id: material.maker_id,
            material_name: material.name.clone(),
            current_quantity: material.current_quantity,
            min_quantity: material.min_quantity,
        });
    }
}

/// Debits the material and records an open reservation. Events describing the
/// change are appended to `events` for the caller to publish after commit.
pub(crate) async fn reserve_in<C>(
    conn: &C,
    material_id: Uuid,
    quantity: Decimal,
    order_item_id: Option<Uuid>,
    events: &mut Vec<Event>,
) -> Result<material_reservation::Model, ServiceError>
where
    C: ConnectionTrait,
{
    if quantity <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "Reservation quantity must be positive, got {}",
            quantity
        )));
    }

    let material = lock_material(conn, material_id).await?;
    if !material.is_active {
        return Err(ServiceError::InvalidOperation(format!(
            "Material '{}' is deactivated",
            material.name
        )));
    }
    if material.current_quantity < quantity {
        counter!("masterskaya_ledger.reservations_rejected", 1);
        return Err(insufficient(&material, quantity));
    }

    let updated = write_quantity(conn, &material, material.current_quantity - quantity).await?;

    let reservation = material_reservation::ActiveModel {
        id: Set(Uuid::new_v4()),
        material_id: Set(material_id),
        order_item_id: Set(order_item_id),
        quantity: Set(quantity),
        status: Set(ReservationStatus::Reserved),
        reserved_at: Set(Utc::now()),
        consumed_at: Set(None),
        released_at: Set(None),
        cancelled_at: Set(None),
    }
    .insert(conn)
    .await
    .map_err(|e| {
        error!("Failed to insert reservation: {}", e);
        ServiceError::db_error(e)
    })?;

    counter!("masterskaya_ledger.reservations", 1, "op" => "reserve");
    info!(
        reservation_id = %reservation.id,
        material_id = %material_id,
        quantity = %quantity,
        remaining = %updated.current_quantity,
        "Material reserved"
    );

    events.push(Event::MaterialReserved {
        material_id,
        reservation_id: reservation.id,
        order_item_id,
        quantity,
    });
    push_low_stock(&updated, events);

    Ok(reservation)
}

/// Moves an open reservation to `target`, crediting stock back unless it was consumed.
pub(crate) async fn close_reservation_in<C>(
    conn: &C,
    reservation_id: Uuid,
    target: ReservationStatus,
    events: &mut Vec<Event>,
) -> Result<material_reservation::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let reservation = ReservationEntity::find_by_id(reservation_id)
        .lock_exclusive()
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Reservation {} not found", reservation_id))
        })?;

    if !reservation.status.is_open() || target.is_open() {
        return Err(ServiceError::InvalidStateTransition(format!(
            "Reservation {} is {}, cannot mark it {}",
            reservation_id, reservation.status, target
        )));
    }

    let now = Utc::now();
    let timestamp_column = match target {
        ReservationStatus::Consumed => material_reservation::Column::ConsumedAt,
        ReservationStatus::Released => material_reservation::Column::ReleasedAt,
        _ => material_reservation::Column::CancelledAt,
    };

    let result = ReservationEntity::update_many()
        .col_expr(material_reservation::Column::Status, Expr::value(target))
        .col_expr(timestamp_column, Expr::value(now))
        .filter(material_reservation::Column::Id.eq(reservation_id))
        .filter(material_reservation::Column::Status.eq(ReservationStatus::Reserved))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        return Err(ServiceError::InvalidStateTransition(format!(
            "Reservation {} was closed concurrently",
            reservation_id
        )));
    }

    if target != ReservationStatus::Consumed {
        let material = lock_material(conn, reservation.material_id).await?;
        write_quantity(conn, &material, material.current_quantity + reservation.quantity).await?;
    }

    let closed = match target {
        ReservationStatus::Consumed => material_reservation::Model {
            status: target,
            consumed_at: Some(now),
            ..reservation
        },
        ReservationStatus::Released => material_reservation::Model {
            status: target,
            released_at: Some(now),
            ..reservation
        },
        _ => material_reservation::Model {
            status: target,
            cancelled_at: Some(now),
            ..reservation
        },
    };

    counter!("masterskaya_ledger.reservations", 1, "op" => target.to_string());
    info!(
        reservation_id = %reservation_id,
        material_id = %closed.material_id,
        quantity = %closed.quantity,
        status = %target,
        "Reservation closed"
    );

    events.push(match target {
        ReservationStatus::Consumed => Event::MaterialConsumed {
            material_id: closed.material_id,
            reservation_id,
            quantity: closed.quantity,
        },
        _ => Event::MaterialReleased {
            material_id: closed.material_id,
            reservation_id,
            quantity: closed.quantity,
        },
    });

    Ok(closed)
}
