/*!
 * # Order Access Control
 *
 * Who may move an order to which status. Every status permission question
 * goes through [`capabilities`]; the state machine consumes the resulting
 * [`CapabilitySet`] and never inspects roles itself.
 *
 * - Staff may set any status.
 * - A maker may set any status on orders containing at least one of their
 *   products, but cannot cancel once production has started.
 * - A customer may only cancel their own order, and only before work begins.
 *
 * Capabilities say nothing about whether a transition is legal; that is the
 * transition table's job.
 */

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::entities::order::OrderStatus;
pub use crate::entities::order_status_history::ActorRole;

/// The authenticated party making a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: Uuid, role: ActorRole) -> Self {
        Self { id, role }
    }

    pub fn staff(id: Uuid) -> Self {
        Self::new(id, ActorRole::Staff)
    }

    pub fn maker(id: Uuid) -> Self {
        Self::new(id, ActorRole::Maker)
    }

    pub fn customer(id: Uuid) -> Self {
        Self::new(id, ActorRole::Customer)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

/// The facts about an order that permissions depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAccess {
    pub status: OrderStatus,
    pub customer_id: Uuid,
    /// Makers of the products on the order's lines.
    pub maker_ids: HashSet<Uuid>,
}

impl OrderAccess {
    pub fn is_owned_by(&self, actor: &Actor) -> bool {
        self.customer_id == actor.id
    }

    pub fn involves_maker(&self, actor: &Actor) -> bool {
        self.maker_ids.contains(&actor.id)
    }
}

/// Target statuses an actor is allowed to request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        OrderStatus::ALL.iter().copied().collect()
    }

    fn bit(status: OrderStatus) -> u16 {
        1 << (status as u16)
    }

    pub fn with(mut self, status: OrderStatus) -> Self {
        self.0 |= Self::bit(status);
        self
    }

    pub fn without(mut self, status: OrderStatus) -> Self {
        self.0 &= !Self::bit(status);
        self
    }

    pub fn allows(&self, status: OrderStatus) -> bool {
        self.0 & Self::bit(status) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = OrderStatus> + '_ {
        OrderStatus::ALL
            .iter()
            .copied()
            .filter(move |status| self.allows(*status))
    }
}

impl FromIterator<OrderStatus> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = OrderStatus>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

/// The single permission rule for order status changes.
pub fn capabilities(actor: &Actor, access: &OrderAccess) -> CapabilitySet {
    match actor.role {
        ActorRole::Staff => CapabilitySet::all(),
        ActorRole::Maker if access.involves_maker(actor) => {
            if access.status.is_irreversible() {
                CapabilitySet::all().without(OrderStatus::Cancelled)
            } else {
                CapabilitySet::all()
            }
        }
        ActorRole::Customer
            if access.is_owned_by(actor)
                && matches!(access.status, OrderStatus::Pending | OrderStatus::Paid) =>
        {
            CapabilitySet::none().with(OrderStatus::Cancelled)
        }
        _ => CapabilitySet::none(),
    }
}
