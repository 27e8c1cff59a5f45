//! Broker access and candle storage.

pub mod cache;
pub mod capital;
pub mod circuit_breaker;
pub mod epic;
pub mod mock;
pub mod provider;
pub mod store;

pub use cache::{CacheFormat, CacheMeta, CandleCache};
pub use capital::{CapitalClient, CapitalCredentials, CapitalSettings};
pub use circuit_breaker::CircuitBreaker;
pub use epic::EpicResolver;
pub use mock::{synthetic_candles, MockBroker};
pub use provider::{Broker, DataError, DealConfirmation, OpenPositionRequest, PageRequest};
pub use store::{CandleStore, PagingConfig};
