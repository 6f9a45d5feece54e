#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use masterskaya_core::{
    auth::Actor,
    config::AppConfig,
    db,
    entities::{
        material::{self, MaterialUnit},
        material_recipe,
        order::{self, OrderStatus},
        product,
    },
    events::{Event, EventSender},
    services::{
        materials::NewMaterial,
        orders::{Checkout, CheckoutLine, OrderDetails},
        recipes::NewRecipe,
    },
    AppServices,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Services over a fresh in-memory SQLite database.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub services: AppServices,
    events: mpsc::Receiver<Event>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        // one connection, otherwise every pooled connection sees its own empty database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.auto_migrate = true;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");

        let db = Arc::new(pool);
        let (event_sender, events) = EventSender::channel(1024);
        let services = AppServices::new(db.clone(), Some(event_sender), &cfg);

        Self {
            db,
            services,
            events,
        }
    }

    /// Everything published since the last call.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub async fn seed_product(&self, maker_id: Uuid, name: &str, stock: i32) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            maker_id: Set(maker_id),
            name: Set(name.to_string()),
            price: Set(Decimal::from(25)),
            stock_quantity: Set(stock),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_material(
        &self,
        maker_id: Uuid,
        name: &str,
        current: Decimal,
        min: Decimal,
    ) -> material::Model {
        self.services
            .materials
            .create_material(NewMaterial {
                maker_id,
                name: name.to_string(),
                unit: MaterialUnit::Meters,
                current_quantity: current,
                min_quantity: min,
                price_per_unit: Decimal::from(2),
                color: None,
                texture: None,
                supplier: Some("Local mill".to_string()),
            })
            .await
            .expect("seed material")
    }

    pub async fn seed_recipe(
        &self,
        product_id: Uuid,
        material_id: Uuid,
        consumption_rate: Decimal,
        waste_factor: Decimal,
        auto_consume: bool,
    ) -> material_recipe::Model {
        self.services
            .recipes
            .create_recipe(NewRecipe {
                product_id,
                material_id,
                consumption_rate,
                waste_factor,
                auto_consume,
            })
            .await
            .expect("seed recipe")
    }

    /// Inserts a bare order row holding `order_number`, bypassing checkout.
    pub async fn seed_order_number(&self, order_number: &str) -> order::Model {
        order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(order_number.to_string()),
            customer_id: Set(Uuid::new_v4()),
            status: Set(OrderStatus::Pending),
            total_amount: Set(Decimal::ZERO),
            delivery_cost: Set(Decimal::ZERO),
            discount_amount: Set(Decimal::ZERO),
            promo_code: Set(None),
            delivery_address: Set("Lenina 1, Kazan".to_string()),
            customer_name: Set("Seeded".to_string()),
            customer_phone: Set("+70000000000".to_string()),
            customer_email: Set("seeded@example.com".to_string()),
            delivery_method: Set(None),
            payment_method: Set(None),
            tracking_number: Set(None),
            paid_at: Set(None),
            version: Set(1),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .expect("seed order")
    }

    pub async fn place_order(&self, customer_id: Uuid, lines: &[(Uuid, i32)]) -> OrderDetails {
        self.services
            .orders
            .create_order(&Actor::customer(customer_id), checkout(customer_id, lines))
            .await
            .expect("place order")
    }

    /// Walks the order through `statuses` as staff.
    pub async fn advance(&self, order_id: Uuid, statuses: &[OrderStatus]) {
        let staff = Actor::staff(Uuid::new_v4());
        for status in statuses {
            self.services
                .order_status
                .update_status(order_id, *status, &staff, "", None)
                .await
                .unwrap_or_else(|e| panic!("transition to {status} failed: {e}"));
        }
    }

    pub async fn reload_material(&self, material_id: Uuid) -> material::Model {
        material::Entity::find_by_id(material_id)
            .one(&*self.db)
            .await
            .expect("load material")
            .expect("material exists")
    }

    pub async fn reload_product(&self, product_id: Uuid) -> product::Model {
        product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn reload_order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .expect("load order")
            .expect("order exists")
    }
}

pub fn checkout(customer_id: Uuid, lines: &[(Uuid, i32)]) -> Checkout {
    Checkout {
        customer_id,
        customer_name: "Sasha Petrova".to_string(),
        customer_phone: "+79990001122".to_string(),
        customer_email: "sasha@example.com".to_string(),
        delivery_address: "Lenina 1, Kazan".to_string(),
        delivery_method: Some("courier".to_string()),
        payment_method: Some("card".to_string()),
        delivery_cost: Decimal::from(5),
        discount_amount: Decimal::ZERO,
        promo_code: None,
        lines: lines
            .iter()
            .map(|(product_id, quantity)| CheckoutLine {
                product_id: *product_id,
                quantity: *quantity,
                unit_price: Decimal::from(25),
                custom_configuration: None,
                custom_price: None,
            })
            .collect(),
    }
}
