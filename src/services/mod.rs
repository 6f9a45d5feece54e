// Material engine
pub mod materials;
pub mod recipes;
pub mod reservations;

// Order workflow
pub mod order_status;
pub mod orders;

pub use materials::MaterialLedger;
pub use order_status::OrderStateMachine;
pub use orders::OrderService;
pub use recipes::RecipeResolver;
pub use reservations::ReservationTracker;
