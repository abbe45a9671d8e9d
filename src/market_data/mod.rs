pub mod candle_buffer;
pub mod mtf;
pub mod orderbook;

// Re-export the core types for convenient access
// (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{Candle, CandleBuffer, CandleKey};
pub use mtf::{confluence_score, MtfScore, MtfWeights};
pub use orderbook::{BookLevel, OrderBookManager, OrderBookSnapshot};
