pub mod service;
pub mod types;

pub use service::{MarketService, ServiceError, ValidationError};
pub use types::MarketId;
