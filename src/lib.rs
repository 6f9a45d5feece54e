//! Masterskaya core library
//!
//! Order status workflow and material reservation engine for a handmade-goods
//! marketplace. Storefront, checkout UI and notification delivery live
//! elsewhere and call into the services exposed here.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::services::{
    MaterialLedger, OrderService, OrderStateMachine, RecipeResolver, ReservationTracker,
};

/// All core services wired to one connection pool and one event channel.
#[derive(Clone)]
pub struct AppServices {
    pub materials: MaterialLedger,
    pub recipes: RecipeResolver,
    pub reservations: ReservationTracker,
    pub order_status: OrderStateMachine,
    pub orders: OrderService,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Option<events::EventSender>,
        cfg: &config::AppConfig,
    ) -> Self {
        Self {
            materials: MaterialLedger::new(db.clone(), event_sender.clone()),
            recipes: RecipeResolver::new(db.clone(), event_sender.clone()),
            reservations: ReservationTracker::new(db.clone(), event_sender.clone()),
            order_status: OrderStateMachine::new(db.clone(), event_sender.clone())
                .with_tracking_prefix(cfg.tracking_number_prefix.clone()),
            orders: OrderService::new(db, event_sender),
        }
    }
}
