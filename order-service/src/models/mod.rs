//! Domain models for order-service.

mod coupon;
mod order;
mod payment;
mod reservation;
mod tracking;
mod variant;

pub use coupon::{Coupon, DiscountType};
pub use order::{
    Address, NewOrderItem, Order, OrderEvent, OrderItem, OrderStatus, PaymentMethod,
    TransitionError, TransitionUpdate,
};
pub use payment::{Payment, PaymentStatus};
pub use reservation::{ReservationLine, ReservationState, ReservationToken};
pub use tracking::{NewTrackingStep, TrackingStep};
pub use variant::{ProductVariant, VariantKey};
