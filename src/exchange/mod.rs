pub mod paper;
pub mod traits;

pub use paper::{FillMode, PaperExchange};
pub use traits::{ExchangeClient, MarketData, Ticker};
