pub mod budget;
pub mod ledger;

pub use budget::{BudgetLedger, Reservation, ReservationId};
pub use ledger::{LogPortfolio, MemoryPortfolio, PortfolioSink, PositionClosed, PositionOpened};
