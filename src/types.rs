// =============================================================================
// Shared types used across the Vela trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side as the venue understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "Market"),
            Self::Limit => write!(f, "Limit"),
        }
    }
}

/// Time-in-force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    PostOnly,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
            Self::PostOnly => write!(f, "PostOnly"),
        }
    }
}

/// Order lifecycle status mirroring the venue's states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse the venue's order-status string. Unknown states map to `New`
    /// so that reconciliation keeps tracking them instead of dropping them.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "New" | "Created" | "Untriggered" => Self::New,
            "PartiallyFilled" => Self::PartiallyFilled,
            "Filled" => Self::Filled,
            "Cancelled" | "PartiallyFilledCanceled" => Self::Cancelled,
            "Rejected" => Self::Rejected,
            "Deactivated" | "Expired" => Self::Expired,
            _ => Self::New,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::PartiallyFilled => "PartiallyFilled",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
        };
        write!(f, "{s}")
    }
}

/// Direction a strategy proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    CloseLong,
    CloseShort,
}

impl Direction {
    /// True for directions that open or add to exposure.
    pub fn is_entry(self) -> bool {
        matches!(self, Self::Long | Self::Short)
    }

    /// Order side needed to express this direction on the venue.
    pub fn order_side(self) -> Side {
        match self {
            Self::Long | Self::CloseShort => Side::Buy,
            Self::Short | Self::CloseLong => Side::Sell,
        }
    }

    /// Single-letter tag used inside deterministic client order ids.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Long | Self::CloseShort => "L",
            Self::Short | Self::CloseLong => "S",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Long => "long",
            Self::Short => "short",
            Self::CloseLong => "close_long",
            Self::CloseShort => "close_short",
        };
        write!(f, "{s}")
    }
}

/// Net position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Flat => write!(f, "flat"),
        }
    }
}

/// Which venue environment the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingEnvironment {
    Testnet,
    Mainnet,
}

impl Default for TradingEnvironment {
    fn default() -> Self {
        Self::Testnet
    }
}

impl std::fmt::Display for TradingEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Testnet => write!(f, "testnet"),
            Self::Mainnet => write!(f, "mainnet"),
        }
    }
}

/// Whether orders reach the venue or are captured as intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Live,
    DryRun,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

/// Policy applied when a new entry signal arrives while a position is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionPolicy {
    Ignore,
    Add,
    Flip,
}

impl Default for PositionPolicy {
    fn default() -> Self {
        Self::Ignore
    }
}

impl PositionPolicy {
    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "add" => Self::Add,
            "flip" => Self::Flip,
            _ => Self::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_order_sides() {
        assert_eq!(Direction::Long.order_side(), Side::Buy);
        assert_eq!(Direction::Short.order_side(), Side::Sell);
        assert_eq!(Direction::CloseLong.order_side(), Side::Sell);
        assert_eq!(Direction::CloseShort.order_side(), Side::Buy);
    }

    #[test]
    fn direction_tags() {
        assert_eq!(Direction::Long.tag(), "L");
        assert_eq!(Direction::Short.tag(), "S");
    }

    #[test]
    fn order_status_wire_parse() {
        assert_eq!(OrderStatus::from_wire("Filled"), OrderStatus::Filled);
        assert_eq!(
            OrderStatus::from_wire("PartiallyFilledCanceled"),
            OrderStatus::Cancelled
        );
        assert!(OrderStatus::from_wire("New").is_open());
        assert!(!OrderStatus::from_wire("Rejected").is_open());
    }

    #[test]
    fn wire_display_strings() {
        assert_eq!(Side::Buy.to_string(), "Buy");
        assert_eq!(OrderType::Limit.to_string(), "Limit");
        assert_eq!(TimeInForce::PostOnly.to_string(), "PostOnly");
        assert_eq!(Direction::CloseShort.to_string(), "close_short");
    }

    #[test]
    fn position_policy_parsing() {
        assert_eq!(PositionPolicy::from_str_or_default("flip"), PositionPolicy::Flip);
        assert_eq!(PositionPolicy::from_str_or_default("bogus"), PositionPolicy::Ignore);
    }
}
