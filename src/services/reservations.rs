//! Reservation Tracker
//!
//! Bookkeeping over material reservations: listing, closing every open
//! reservation of an order line at once, and reorder planning.

use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db;
use crate::entities::material::{self, Entity as MaterialEntity, MaterialUnit};
use crate::entities::material_recipe::{self, Entity as RecipeEntity};
use crate::entities::material_reservation::{
    self, Entity as ReservationEntity, ReservationStatus,
};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::materials;

/// How soon a material needs restocking. Variants are declared most urgent first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReorderUrgency {
    /// Out of stock
    Critical,
    /// At or below half the threshold
    High,
    /// At or below the threshold
    Medium,
    /// Within 25% above the threshold
    Low,
}

impl ReorderUrgency {
    pub fn classify(current: Decimal, min: Decimal) -> Option<Self> {
        if min <= Decimal::ZERO {
            return None;
        }
        if current <= Decimal::ZERO {
            Some(Self::Critical)
        } else if current <= min * Decimal::new(5, 1) {
            Some(Self::High)
        } else if current <= min {
            Some(Self::Medium)
        } else if current <= min * Decimal::new(125, 2) {
            Some(Self::Low)
        } else {
            None
        }
    }
}

/// Enough to get back to twice the threshold, never less than half the threshold.
/// Money amounts are kept to cents, rounded half away from zero.
pub fn estimated_cost(quantity: Decimal, price_per_unit: Decimal) -> Decimal {
    (quantity * price_per_unit).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn suggested_reorder_quantity(current: Decimal, min: Decimal) -> Decimal {
    let refill = min * Decimal::TWO - current;
    let floor = min * Decimal::new(5, 1);
    refill.max(floor)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderItem {
    pub material_id: Uuid,
    pub name: String,
    pub unit: MaterialUnit,
    pub current_quantity: Decimal,
    pub min_quantity: Decimal,
    pub urgency: ReorderUrgency,
    pub suggested_quantity: Decimal,
    pub estimated_cost: Decimal,
    pub supplier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialReportRow {
    pub material_id: Uuid,
    pub name: String,
    pub unit: MaterialUnit,
    pub is_active: bool,
    pub current_quantity: Decimal,
    pub reserved_quantity: Decimal,
    pub min_quantity: Decimal,
    pub is_low_stock: bool,
    pub stock_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialReport {
    pub total_materials: usize,
    pub active_materials: usize,
    pub low_stock_count: usize,
    pub total_stock_value: Decimal,
    pub open_reservations: usize,
    pub materials: Vec<MaterialReportRow>,
}

#[derive(Clone)]
pub struct ReservationTracker {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl ReservationTracker {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    fn publish(&self, events: Vec<Event>) {
        if let Some(sender) = &self.event_sender {
            sender.publish_all(events);
        }
    }

    #[instrument(skip(self))]
    pub async fn list_by_material(
        &self,
        material_id: Uuid,
    ) -> Result<Vec<material_reservation::Model>, ServiceError> {
        ReservationEntity::find()
            .filter(material_reservation::Column::MaterialId.eq(material_id))
            .order_by_asc(material_reservation::Column::ReservedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn list_by_order_item(
        &self,
        order_item_id: Uuid,
    ) -> Result<Vec<material_reservation::Model>, ServiceError> {
        reservations_for_line(&*self.db, order_item_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_by_status(
        &self,
        status: ReservationStatus,
    ) -> Result<Vec<material_reservation::Model>, ServiceError> {
        ReservationEntity::find()
            .filter(material_reservation::Column::Status.eq(status))
            .order_by_asc(material_reservation::Column::ReservedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Reservations of every line of an order.
    #[instrument(skip(self))]
    pub async fn list_by_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<material_reservation::Model>, ServiceError> {
        let db = &*self.db;
        let line_ids: Vec<Uuid> = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|line| line.id)
            .collect();

        if line_ids.is_empty() {
            return Ok(Vec::new());
        }

        ReservationEntity::find()
            .filter(material_reservation::Column::OrderItemId.is_in(line_ids))
            .order_by_asc(material_reservation::Column::ReservedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Releases every open reservation of the line. Closed ones are left
    /// alone, so calling this twice is harmless. Returns how many were released.
    #[instrument(skip(self))]
    pub async fn release_all_for_order_line(&self, order_item_id: Uuid) -> Result<usize, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let released = release_all_for_line_in(&txn, order_item_id, &mut events).await?;

        db::commit(txn, "reservations.release_line", started).await?;
        self.publish(events);
        Ok(released)
    }

    /// Writes off the line's open reservations. With `auto_consume_only` only
    /// materials whose recipe is flagged `auto_consume` are touched.
    #[instrument(skip(self))]
    pub async fn consume_all_for_order_line(
        &self,
        order_item_id: Uuid,
        auto_consume_only: bool,
    ) -> Result<usize, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let line = OrderItemEntity::find_by_id(order_item_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order line {} not found", order_item_id)))?;
        let consumed = consume_all_for_line_in(&txn, &line, auto_consume_only, &mut events).await?;

        db::commit(txn, "reservations.consume_line", started).await?;
        self.publish(events);
        Ok(consumed)
    }

    /// Active materials of the maker that need restocking, most urgent first.
    #[instrument(skip(self))]
    pub async fn generate_reorder_list(&self, maker_id: Uuid) -> Result<Vec<ReorderItem>, ServiceError> {
        let materials = MaterialEntity::find()
            .filter(material::Column::MakerId.eq(maker_id))
            .filter(material::Column::IsActive.eq(true))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut items: Vec<ReorderItem> = materials
            .into_iter()
            .filter_map(|m| {
                let urgency = ReorderUrgency::classify(m.current_quantity, m.min_quantity)?;
                let suggested_quantity = suggested_reorder_quantity(m.current_quantity, m.min_quantity);
                Some(ReorderItem {
                    material_id: m.id,
                    estimated_cost: estimated_cost(suggested_quantity, m.price_per_unit),
                    name: m.name,
                    unit: m.unit,
                    current_quantity: m.current_quantity,
                    min_quantity: m.min_quantity,
                    urgency,
                    suggested_quantity,
                    supplier: m.supplier,
                })
            })
            .collect();

        items.sort_by(|a, b| {
            a.urgency
                .cmp(&b.urgency)
                .then_with(|| {
                    (a.current_quantity / a.min_quantity).cmp(&(b.current_quantity / b.min_quantity))
                })
                .then_with(|| a.name.cmp(&b.name))
        });

        info!(maker_id = %maker_id, items = items.len(), "Reorder list generated");
        Ok(items)
    }

    /// Stock summary for one maker, or across all makers when `maker_id` is `None`.
    #[instrument(skip(self))]
    pub async fn material_report(&self, maker_id: Option<Uuid>) -> Result<MaterialReport, ServiceError> {
        let db = &*self.db;

        let mut query = MaterialEntity::find().order_by_asc(material::Column::Name);
        if let Some(maker_id) = maker_id {
            query = query.filter(material::Column::MakerId.eq(maker_id));
        }
        let materials = query.all(db).await.map_err(ServiceError::db_error)?;

        let material_ids: Vec<Uuid> = materials.iter().map(|m| m.id).collect();
        let open = if material_ids.is_empty() {
            Vec::new()
        } else {
            ReservationEntity::find()
                .filter(material_reservation::Column::Status.eq(ReservationStatus::Reserved))
                .filter(material_reservation::Column::MaterialId.is_in(material_ids))
                .all(db)
                .await
                .map_err(ServiceError::db_error)?
        };

        let mut reserved: HashMap<Uuid, Decimal> = HashMap::new();
        for r in &open {
            *reserved.entry(r.material_id).or_default() += r.quantity;
        }

        let rows: Vec<MaterialReportRow> = materials
            .iter()
            .map(|m| MaterialReportRow {
                material_id: m.id,
                name: m.name.clone(),
                unit: m.unit,
                is_active: m.is_active,
                current_quantity: m.current_quantity,
                reserved_quantity: reserved.get(&m.id).copied().unwrap_or_default(),
                min_quantity: m.min_quantity,
                is_low_stock: m.is_low_stock(),
                stock_value: m.stock_value(),
            })
            .collect();

        Ok(MaterialReport {
            total_materials: rows.len(),
            active_materials: rows.iter().filter(|r| r.is_active).count(),
            low_stock_count: rows.iter().filter(|r| r.is_active && r.is_low_stock).count(),
            total_stock_value: rows.iter().map(|r| r.stock_value).sum(),
            open_reservations: open.len(),
            materials: rows,
        })
    }
}

pub(crate) async fn reservations_for_line<C>(
    conn: &C,
    order_item_id: Uuid,
) -> Result<Vec<material_reservation::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    ReservationEntity::find()
        .filter(material_reservation::Column::OrderItemId.eq(order_item_id))
        .order_by_asc(material_reservation::Column::ReservedAt)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

async fn open_reservations_for_line<C>(
    conn: &C,
    order_item_id: Uuid,
) -> Result<Vec<material_reservation::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    ReservationEntity::find()
        .filter(material_reservation::Column::OrderItemId.eq(order_item_id))
        .filter(material_reservation::Column::Status.eq(ReservationStatus::Reserved))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)
}

pub(crate) async fn release_all_for_line_in<C>(
    conn: &C,
    order_item_id: Uuid,
    events: &mut Vec<Event>,
) -> Result<usize, ServiceError>
where
    C: ConnectionTrait,
{
    let open = open_reservations_for_line(conn, order_item_id).await?;
    for reservation in &open {
        materials::close_reservation_in(conn, reservation.id, ReservationStatus::Released, events)
            .await?;
    }
    if !open.is_empty() {
        info!(order_item_id = %order_item_id, released = open.len(), "Released order line reservations");
    }
    Ok(open.len())
}

pub(crate) async fn consume_all_for_line_in<C>(
    conn: &C,
    line: &order_item::Model,
    auto_consume_only: bool,
    events: &mut Vec<Event>,
) -> Result<usize, ServiceError>
where
    C: ConnectionTrait,
{
    let auto_materials: HashSet<Uuid> = if auto_consume_only {
        RecipeEntity::find()
            .filter(material_recipe::Column::ProductId.eq(line.product_id))
            .filter(material_recipe::Column::AutoConsume.eq(true))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|recipe| recipe.material_id)
            .collect()
    } else {
        HashSet::new()
    };

    let mut consumed = 0;
    for reservation in open_reservations_for_line(conn, line.id).await? {
        if auto_consume_only && !auto_materials.contains(&reservation.material_id) {
            continue;
        }
        materials::close_reservation_in(conn, reservation.id, ReservationStatus::Consumed, events)
            .await?;
        consumed += 1;
    }
    if consumed > 0 {
        info!(order_item_id = %line.id, consumed, "Consumed order line reservations");
    }
    Ok(consumed)
}
