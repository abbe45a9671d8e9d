// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the feature
// pipeline and regime scorer consume. Every public function returns `Option`
// (or an empty series) so callers are forced to handle insufficient data.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod volume;
