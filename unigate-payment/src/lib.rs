pub mod discount;
pub mod gateway;
pub mod service;

pub use gateway::{AggregatorGateway, SettleError, SettleRequest, SettledToken, TokenGateway};
pub use service::{PaymentService, PaymentSettings};
