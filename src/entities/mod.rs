//! SeaORM entities for the order workflow and material ledger.

pub mod material;
pub mod material_recipe;
pub mod material_reservation;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod product;
