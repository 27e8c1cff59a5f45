//! Domain types: candles, timeframes, sides and model keys.

pub mod candle;
pub mod key;
pub mod side;
pub mod timeframe;

pub use candle::{normalize_candles, validate_candles, Candle, CandleError};
pub use key::{pair_key, safe_name, ModelKey};
pub use side::Side;
pub use timeframe::Timeframe;
