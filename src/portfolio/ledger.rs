//! Portfolio notifications
//!
//! The ledger's on-disk format is someone else's problem; the engine
//! only promises to tell it when positions open and close, with the
//! realized numbers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

/// Position open notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpened {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub fees: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Position close notification with realized P&L
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosed {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub avg_exit_price: Decimal,
    pub fees: Decimal,
    pub realized_pnl: Decimal,
    pub exit_reason: String,
    pub closed_at: DateTime<Utc>,
}

impl PositionClosed {
    /// Realized P&L: (exit - entry) * qty - total fees
    pub fn compute_pnl(
        qty: Decimal,
        avg_entry: Decimal,
        avg_exit: Decimal,
        fees: Decimal,
    ) -> Decimal {
        (avg_exit - avg_entry) * qty - fees
    }
}

/// Portfolio collaborator interface
#[async_trait]
pub trait PortfolioSink: Send + Sync {
    async fn position_opened(&self, note: PositionOpened);
    async fn position_closed(&self, note: PositionClosed);
}

/// Default sink: structured logs only
#[derive(Debug, Default)]
pub struct LogPortfolio;

#[async_trait]
impl PortfolioSink for LogPortfolio {
    async fn position_opened(&self, note: PositionOpened) {
        info!(
            "position opened: {} {} @ {} (fees {})",
            note.symbol, note.qty, note.avg_price, note.fees
        );
    }

    async fn position_closed(&self, note: PositionClosed) {
        info!(
            "position closed: {} {} @ {} -> {} pnl {} ({})",
            note.symbol,
            note.qty,
            note.avg_entry_price,
            note.avg_exit_price,
            note.realized_pnl,
            note.exit_reason
        );
    }
}

/// In-memory sink recording every notification; used by tests and the
/// dry-run report.
#[derive(Debug, Default)]
pub struct MemoryPortfolio {
    opened: Mutex<Vec<PositionOpened>>,
    closed: Mutex<Vec<PositionClosed>>,
}

impl MemoryPortfolio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<PositionOpened> {
        self.opened.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<PositionClosed> {
        self.closed.lock().unwrap().clone()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.closed
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.realized_pnl)
            .sum()
    }
}

#[async_trait]
impl PortfolioSink for MemoryPortfolio {
    async fn position_opened(&self, note: PositionOpened) {
        self.opened.lock().unwrap().push(note);
    }

    async fn position_closed(&self, note: PositionClosed) {
        self.closed.lock().unwrap().push(note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pnl_subtracts_fees() {
        let pnl = PositionClosed::compute_pnl(dec!(2), dec!(100), dec!(103), dec!(0.4));
        // (103 - 100) * 2 - 0.4 = 5.6
        assert_eq!(pnl, dec!(5.6));
    }

    #[tokio::test]
    async fn memory_sink_records() {
        let sink = MemoryPortfolio::new();
        sink.position_opened(PositionOpened {
            symbol: "BTC-USD".into(),
            qty: dec!(1),
            avg_price: dec!(100),
            fees: dec!(0.1),
            opened_at: Utc::now(),
        })
        .await;
        sink.position_closed(PositionClosed {
            symbol: "BTC-USD".into(),
            qty: dec!(1),
            avg_entry_price: dec!(100),
            avg_exit_price: dec!(105),
            fees: dec!(0.2),
            realized_pnl: dec!(4.8),
            exit_reason: "signal".into(),
            closed_at: Utc::now(),
        })
        .await;

        assert_eq!(sink.opened().len(), 1);
        assert_eq!(sink.closed().len(), 1);
        assert_eq!(sink.realized_pnl(), dec!(4.8));
    }
}
