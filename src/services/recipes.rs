//! Recipe Resolver: product to per-unit material consumption, and
//! all-or-nothing reservation of an order line's materials.

use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::db;
use crate::entities::material::{self, Entity as MaterialEntity, MaterialUnit};
use crate::entities::material_recipe::{self, Entity as RecipeEntity};
use crate::entities::material_reservation;
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::product::Entity as ProductEntity;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::materials;

/// Decimal places materials are measured to.
pub const MATERIAL_PRECISION: u32 = 3;

/// Material needed for `units` product units, rounded half away from zero.
pub fn required_quantity(recipe: &material_recipe::Model, units: u32, include_waste: bool) -> Decimal {
    let mut required = recipe.consumption_rate * Decimal::from(units);
    if include_waste {
        required *= Decimal::ONE + recipe.waste_factor;
    }
    required.round_dp_with_strategy(MATERIAL_PRECISION, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewRecipe {
    pub product_id: Uuid,
    pub material_id: Uuid,
    #[validate(custom = "validate_consumption_rate")]
    pub consumption_rate: Decimal,
    #[validate(custom = "validate_waste_factor")]
    pub waste_factor: Decimal,
    #[serde(default)]
    pub auto_consume: bool,
}

fn validate_consumption_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if *rate <= Decimal::ZERO {
        let mut err = ValidationError::new("consumption_rate");
        err.message = Some("consumption_rate must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_waste_factor(factor: &Decimal) -> Result<(), ValidationError> {
    if *factor < Decimal::ZERO || *factor >= Decimal::ONE {
        let mut err = ValidationError::new("waste_factor");
        err.message = Some("waste_factor must be in [0, 1)".into());
        return Err(err);
    }
    Ok(())
}

/// A material that cannot cover the requested number of product units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialShortfall {
    pub material_id: Uuid,
    pub material_name: String,
    pub unit: MaterialUnit,
    pub required: Decimal,
    pub available: Decimal,
    pub shortage: Decimal,
}

#[derive(Clone)]
pub struct RecipeResolver {
    db: Arc<DatabaseConnection>,
    event_sender: Option<EventSender>,
}

impl RecipeResolver {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    #[instrument(skip(self, input), fields(product_id = %input.product_id, material_id = %input.material_id))]
    pub async fn create_recipe(&self, input: NewRecipe) -> Result<material_recipe::Model, ServiceError> {
        input.validate()?;
        let db = &*self.db;

        ProductEntity::find_by_id(input.product_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", input.product_id)))?;
        materials::find_material(db, input.material_id).await?;

        let existing = RecipeEntity::find()
            .filter(material_recipe::Column::ProductId.eq(input.product_id))
            .filter(material_recipe::Column::MaterialId.eq(input.material_id))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Product {} already has a recipe for material {}",
                input.product_id, input.material_id
            )));
        }

        let recipe = material_recipe::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(input.product_id),
            material_id: Set(input.material_id),
            consumption_rate: Set(input.consumption_rate),
            waste_factor: Set(input.waste_factor),
            auto_consume: Set(input.auto_consume),
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(recipe_id = %recipe.id, "Recipe created");
        Ok(recipe)
    }

    /// Recipes of a product with their materials, ordered by material name.
    #[instrument(skip(self))]
    pub async fn recipes_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<(material_recipe::Model, material::Model)>, ServiceError> {
        recipes_with_materials(&*self.db, product_id).await
    }

    #[instrument(skip(self))]
    pub async fn required_quantity(
        &self,
        product_id: Uuid,
        material_id: Uuid,
        units: u32,
        include_waste: bool,
    ) -> Result<Decimal, ServiceError> {
        let recipe = RecipeEntity::find()
            .filter(material_recipe::Column::ProductId.eq(product_id))
            .filter(material_recipe::Column::MaterialId.eq(material_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No recipe for product {} and material {}",
                    product_id, material_id
                ))
            })?;
        Ok(required_quantity(&recipe, units, include_waste))
    }

    /// Reserves every material of the line's product, or nothing at all.
    #[instrument(skip(self))]
    pub async fn reserve_for_order_line(
        &self,
        order_item_id: Uuid,
    ) -> Result<Vec<material_reservation::Model>, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&*self.db).await?;
        let mut events = Vec::new();

        let line = OrderItemEntity::find_by_id(order_item_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order line {} not found", order_item_id)))?;
        let reservations = reserve_for_line_in(&txn, &line, &mut events).await?;

        db::commit(txn, "recipe.reserve_line", started).await?;
        if let Some(sender) = &self.event_sender {
            sender.publish_all(events);
        }
        Ok(reservations)
    }

    /// Materials that would block producing `units` of the product right now.
    #[instrument(skip(self))]
    pub async fn check_product_availability(
        &self,
        product_id: Uuid,
        units: u32,
    ) -> Result<Vec<MaterialShortfall>, ServiceError> {
        let recipes = recipes_with_materials(&*self.db, product_id).await?;

        Ok(recipes
            .into_iter()
            .filter_map(|(recipe, material)| {
                let required = required_quantity(&recipe, units, true);
                let available = if material.is_active {
                    material.current_quantity
                } else {
                    Decimal::ZERO
                };
                (available < required).then(|| MaterialShortfall {
                    material_id: material.id,
                    material_name: material.name,
                    unit: material.unit,
                    required,
                    available,
                    shortage: required - available,
                })
            })
            .collect())
    }

    /// Cost of the materials used by `units` product units, waste included.
    #[instrument(skip(self))]
    pub async fn material_cost(&self, product_id: Uuid, units: u32) -> Result<Decimal, ServiceError> {
        let recipes = recipes_with_materials(&*self.db, product_id).await?;
        let cost: Decimal = recipes
            .iter()
            .map(|(recipe, material)| material.price_per_unit * required_quantity(recipe, units, true))
            .sum();
        Ok(cost.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}

pub(crate) async fn recipes_with_materials<C>(
    conn: &C,
    product_id: Uuid,
) -> Result<Vec<(material_recipe::Model, material::Model)>, ServiceError>
where
    C: ConnectionTrait,
{
    let rows = RecipeEntity::find()
        .filter(material_recipe::Column::ProductId.eq(product_id))
        .find_also_related(MaterialEntity)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut recipes = Vec::with_capacity(rows.len());
    for (recipe, material) in rows {
        match material {
            Some(material) => recipes.push((recipe, material)),
            None => warn!(recipe_id = %recipe.id, "Recipe references a missing material"),
        }
    }
    recipes.sort_by(|a, b| a.1.name.cmp(&b.1.name).then(a.1.id.cmp(&b.1.id)));
    Ok(recipes)
}

/// Reserves every recipe material for one order line. The first failure is
/// returned as-is; the caller's transaction discards earlier reservations.
pub(crate) async fn reserve_for_line_in<C>(
    conn: &C,
    line: &order_item::Model,
    events: &mut Vec<Event>,
) -> Result<Vec<material_reservation::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    let units = u32::try_from(line.quantity).map_err(|_| {
        ServiceError::ValidationError(format!("Order line {} has quantity {}", line.id, line.quantity))
    })?;

    let recipes = recipes_with_materials(conn, line.product_id).await?;
    let mut reservations = Vec::with_capacity(recipes.len());

    for (recipe, material) in recipes {
        let required = required_quantity(&recipe, units, true);
        if required.is_zero() {
            debug!(recipe_id = %recipe.id, "Recipe requires nothing at this precision");
            continue;
        }
        let reservation =
            materials::reserve_in(conn, material.id, required, Some(line.id), events).await?;
        reservations.push(reservation);
    }

    info!(
        order_item_id = %line.id,
        reservations = reservations.len(),
        "Materials reserved for order line"
    );
    Ok(reservations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn recipe(rate: Decimal, waste: Decimal) -> material_recipe::Model {
        material_recipe::Model {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            material_id: Uuid::new_v4(),
            consumption_rate: rate,
            waste_factor: waste,
            auto_consume: false,
        }
    }

    #[test]
    fn waste_is_applied_on_top_of_consumption() {
        let r = recipe(dec!(0.5), dec!(0.1));
        assert_eq!(required_quantity(&r, 3, true), dec!(1.65));
        assert_eq!(required_quantity(&r, 3, false), dec!(1.5));
    }

    #[test]
    fn rounds_half_away_from_zero_to_material_precision() {
        let r = recipe(dec!(0.0125), dec!(0.0));
        assert_eq!(required_quantity(&r, 1, true), dec!(0.013));
        let r = recipe(dec!(0.3333), dec!(0.5));
        assert_eq!(required_quantity(&r, 1, true), dec!(0.5));
    }

    #[test]
    fn waste_factor_must_stay_below_one() {
        assert!(validate_waste_factor(&dec!(0)).is_ok());
        assert!(validate_waste_factor(&dec!(0.99)).is_ok());
        assert!(validate_waste_factor(&dec!(1)).is_err());
        assert!(validate_waste_factor(&dec!(-0.1)).is_err());
        assert!(validate_consumption_rate(&dec!(0)).is_err());
    }

    proptest! {
        #[test]
        fn waste_never_reduces_requirement(
            rate_milli in 1i64..100_000,
            waste_pct in 0i64..100,
            units in 1u32..500,
        ) {
            let r = recipe(Decimal::new(rate_milli, 3), Decimal::new(waste_pct, 2));
            let with = required_quantity(&r, units, true);
            let without = required_quantity(&r, units, false);
            prop_assert!(with >= without);
            prop_assert!(with.scale() <= MATERIAL_PRECISION);
            prop_assert!(without > Decimal::ZERO);
        }

        #[test]
        fn requirement_is_linear_without_waste(rate_milli in 1i64..100_000, units in 1u32..500) {
            let r = recipe(Decimal::new(rate_milli, 3), Decimal::ZERO);
            prop_assert_eq!(
                required_quantity(&r, units, false),
                required_quantity(&r, 1, false) * Decimal::from(units)
            );
        }
    }
}
