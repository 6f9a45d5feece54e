use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit a material is stocked and consumed in.
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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum MaterialUnit {
    #[sea_orm(string_value = "m")]
    #[serde(rename = "m")]
    #[strum(serialize = "m")]
    Meters,
    #[sea_orm(string_value = "cm")]
    #[serde(rename = "cm")]
    #[strum(serialize = "cm")]
    Centimeters,
    #[sea_orm(string_value = "g")]
    #[serde(rename = "g")]
    #[strum(serialize = "g")]
    Grams,
    #[sea_orm(string_value = "kg")]
    #[serde(rename = "kg")]
    #[strum(serialize = "kg")]
    Kilograms,
    #[sea_orm(string_value = "pcs")]
    #[serde(rename = "pcs")]
    #[strum(serialize = "pcs")]
    Pieces,
    #[sea_orm(string_value = "roll")]
    #[serde(rename = "roll")]
    #[strum(serialize = "roll")]
    Rolls,
    #[sea_orm(string_value = "ml")]
    #[serde(rename = "ml")]
    #[strum(serialize = "ml")]
    Milliliters,
    #[sea_orm(string_value = "l")]
    #[serde(rename = "l")]
    #[strum(serialize = "l")]
    Liters,
}

/// A raw material owned by one maker.
///
/// `current_quantity` is already net of open reservations: stock is debited
/// when a reservation is taken, not when it is consumed.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "materials")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub maker_id: Uuid,
    pub name: String,
    pub unit: MaterialUnit,
    pub current_quantity: Decimal,
    pub min_quantity: Decimal,
    pub price_per_unit: Decimal,
    pub color: Option<String>,
    pub texture: Option<String>,
    pub supplier: Option<String>,
    pub is_active: bool,
    /// Bumped on every quantity write; guards against lost updates.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn is_low_stock(&self) -> bool {
        self.current_quantity <= self.min_quantity
    }

    pub fn stock_value(&self) -> Decimal {
        self.current_quantity * self.price_per_unit
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::material_reservation::Entity")]
    Reservations,
    #[sea_orm(has_many = "super::material_recipe::Entity")]
    Recipes,
}

impl Related<super::material_reservation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reservations.def()
    }
}

impl Related<super::material_recipe::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Recipes.def()
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
