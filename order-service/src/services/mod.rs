pub mod broker;
pub mod coupon;
pub mod database;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod razorpay;
pub mod store;
pub mod sweeper;

pub use broker::{CheckoutCustomer, PaymentBroker, PaymentIntent};
pub use coupon::CouponQuote;
pub use database::Database;
pub use gateway::{GatewayError, GatewayOrder, GatewayRefund, PaymentGateway};
pub use memory::MemoryStore;
pub use orchestrator::{
    CreateOrder, LifecycleSettings, OrderDetails, OrderOrchestrator, OrderPlacement,
    PaymentCallback,
};
pub use razorpay::RazorpayClient;
pub use store::{Clock, CouponStore, OrderRepository, StockLedger, Store, SystemClock};
pub use sweeper::ExpirySweeper;
