pub mod order_manager;
pub mod sltp;

pub use order_manager::{order_link_id, EntryOrder, OrderManager, OrderResult};
pub use sltp::{compute_levels, ExitReason, SlTpConfig, SlTpLevels, SlTpManager, SlTpTracker};
