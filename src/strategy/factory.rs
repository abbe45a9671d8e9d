// =============================================================================
// Strategy factory — fresh instances per symbol, always
// =============================================================================
//
// Per-symbol isolation is structural: the factory is the only way the engine
// obtains strategies, and it constructs brand-new boxed instances on every
// call. No module-level state, no sharing. Two symbols can therefore never
// alias strategy objects, which the orchestrator relies on.
// =============================================================================

use crate::config::ConfigManager;
use crate::strategy::{MeanReversion, Strategy, TrendPullback, VolBreakout};

pub struct StrategyFactory;

impl StrategyFactory {
    /// Build the configured strategy list for one symbol. Each call returns
    /// distinct object identities.
    pub fn build_for_symbol(cfg: &ConfigManager, _symbol: &str) -> Vec<Box<dyn Strategy>> {
        let time_stop = cfg.u64("sltp.time_stop_bars", 48) as u32;

        let trend = TrendPullback::new(
            cfg.f64("strategies.trend_pullback.adx_min", 22.0),
            cfg.f64("strategies.trend_pullback.pullback_atr", 1.0),
            time_stop,
        );

        let reversion = MeanReversion::new(
            cfg.u64("strategies.mean_reversion.limit_ttl_bars", 3) as u32,
            cfg.f64("strategies.mean_reversion.zscore_guard", 3.0),
            time_stop.min(24),
        );

        let breakout = VolBreakout::new(
            cfg.f64("strategies.vol_breakout.squeeze_width_pct", 2.0),
            cfg.f64("strategies.vol_breakout.expansion_pct", 25.0),
            cfg.u64("strategies.vol_breakout.lookback", 20) as usize,
        );

        vec![Box::new(trend), Box::new(reversion), Box::new(breakout)]
    }
}
