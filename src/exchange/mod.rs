pub mod client;
pub mod stream;

pub use client::{
    BybitClient, CreateOrderRequest, CreatedOrder, VenueExecution, VenueOrder, VenuePosition,
    WalletSnapshot,
};
