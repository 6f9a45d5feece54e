use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Enum representing the possible statuses of an order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "in_work")]
    InWork,
    #[sea_orm(string_value = "preparing_for_shipment")]
    PreparingForShipment,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::InWork,
        OrderStatus::PreparingForShipment,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    /// The linear sequence an order follows when nothing goes wrong.
    pub const HAPPY_PATH: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Processing,
        OrderStatus::InWork,
        OrderStatus::PreparingForShipment,
        OrderStatus::Shipped,
        OrderStatus::Delivered,
    ];

    /// Statuses reachable in one step. Nothing outside this table is permitted.
    pub fn allowed_transitions(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            Pending => &[Paid, Cancelled],
            Paid => &[Processing, Cancelled],
            Processing => &[InWork, Cancelled],
            InWork => &[PreparingForShipment, Cancelled],
            PreparingForShipment => &[Shipped, Cancelled],
            Shipped => &[Delivered],
            Delivered | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Production has started; makers can no longer cancel from here on.
    pub fn is_irreversible(&self) -> bool {
        matches!(
            self,
            OrderStatus::InWork
                | OrderStatus::PreparingForShipment
                | OrderStatus::Shipped
                | OrderStatus::Delivered
        )
    }

    /// Completion percentage along the happy path. Cancelled orders count as closed.
    pub fn progress_percent(&self) -> u8 {
        if *self == OrderStatus::Cancelled {
            return 100;
        }
        let len = Self::HAPPY_PATH.len();
        let position = Self::HAPPY_PATH
            .iter()
            .position(|status| status == self)
            .map(|idx| idx + 1)
            .unwrap_or(0);
        (position * 100 / len) as u8
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[validate(length(
        min = 1,
        max = 20,
        message = "Order number must be between 1 and 20 characters"
    ))]
    pub order_number: String,

    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub total_amount: Decimal,
    pub delivery_cost: Decimal,
    pub discount_amount: Decimal,
    pub promo_code: Option<String>,

    #[validate(length(min = 1, message = "Delivery address is required"))]
    pub delivery_address: String,
    #[validate(length(min = 1, max = 100))]
    pub customer_name: String,
    #[validate(length(max = 20))]
    pub customer_phone: String,
    #[validate(email)]
    pub customer_email: String,

    pub delivery_method: Option<String>,
    pub payment_method: Option<String>,
    pub tracking_number: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

impl Model {
    pub fn progress_percent(&self) -> u8 {
        self.status.progress_percent()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::order_status_history::Entity")]
    StatusHistory,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::order_status_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusHistory.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            active_model.created_at = Set(now);
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
        }

        active_model.updated_at = Set(Some(now));

        Ok(active_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn terminal_statuses_have_no_exits() {
        for status in OrderStatus::iter() {
            assert_eq!(
                status.is_terminal(),
                status.allowed_transitions().is_empty(),
                "{status}"
            );
        }
    }

    #[test]
    fn shipped_orders_cannot_be_cancelled() {
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::PreparingForShipment.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn progress_follows_the_happy_path() {
        let percents: Vec<u8> = OrderStatus::HAPPY_PATH
            .iter()
            .map(OrderStatus::progress_percent)
            .collect();
        assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(OrderStatus::Pending.progress_percent(), 14);
        assert_eq!(OrderStatus::Cancelled.progress_percent(), 100);
    }

    #[test]
    fn status_display_matches_stored_value() {
        assert_eq!(
            OrderStatus::PreparingForShipment.to_string(),
            "preparing_for_shipment"
        );
        assert_eq!(OrderStatus::InWork.to_string(), "in_work");
    }
}
