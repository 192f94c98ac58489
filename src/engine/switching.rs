//! Protective-order switching
//!
//! An open position is protected by exactly one resting order: take-profit
//! or stop-loss. Crossing a threshold cancels the active order and places
//! the other. The handover must never leave both or neither marker set,
//! and at most one switch may be in flight per symbol.
//!
//! The caller (the engine) holds the symbol's switch lock for the whole
//! call. The Switching marker is written synchronously before any
//! exchange I/O, so every reader between the cancel and the new placement
//! sees "switch in progress", never a stale final value.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ReplaceFailurePolicy;
use crate::domain::{
    OrderRequest, OrderStatus, ProtectionKind, ProtectionState, SymbolState,
};
use crate::error::{PylonError, Result};
use crate::execution::router::OrderRouter;

/// Outcome of one switch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Cancel and replace both landed; protection now reads the target
    Switched { order_id: String },
    /// The target kind is already the active protection
    AlreadyActive,
    /// Another switch holds the intermediate state
    InFlight,
    /// The active order could not be cancelled; nothing changed
    CancelFailed,
    /// The active order had already executed; the position is closing,
    /// not switching
    PriorFilled,
    /// Cancel landed but the replacement did not. `restored` reports
    /// whether the prior order type was re-placed per policy.
    ReplaceFailed { restored: bool },
}

pub struct ProtectionSwitcher {
    router: Arc<OrderRouter>,
    policy: ReplaceFailurePolicy,
}

impl ProtectionSwitcher {
    pub fn new(router: Arc<OrderRouter>, policy: ReplaceFailurePolicy) -> Self {
        Self { router, policy }
    }

    /// Place the first protective order for a freshly opened position.
    pub async fn place_initial(
        &self,
        state: &mut SymbolState,
        kind: ProtectionKind,
        trigger_price: Decimal,
    ) -> Result<String> {
        if state.protection.is_some() {
            return Err(PylonError::InvalidState(format!(
                "{}: protection already present",
                state.symbol()
            )));
        }
        let qty = state
            .position
            .as_ref()
            .map(|p| p.qty)
            .ok_or_else(|| PylonError::InvalidState("no open position".to_string()))?;

        let request = OrderRequest::sell_limit(state.symbol(), qty, trigger_price);
        let ack = self.router.submit(&request).await?;
        state.protection = Some(ProtectionState::Active {
            kind,
            order_id: ack.order_id.clone(),
            trigger_price,
        });
        info!(
            "{}: initial {} protection placed ({} @ {})",
            state.symbol(),
            kind,
            ack.order_id,
            trigger_price
        );
        Ok(ack.order_id)
    }

    /// Switch the active protection to `target`. The symbol's switch lock
    /// must be held by the caller for the duration of this call.
    pub async fn execute(
        &self,
        state: &mut SymbolState,
        target: ProtectionKind,
        trigger_price: Decimal,
    ) -> Result<SwitchOutcome> {
        let symbol = state.symbol().to_string();
        let qty = state
            .position
            .as_ref()
            .map(|p| p.qty)
            .ok_or_else(|| PylonError::InvalidState(format!("{}: no open position", symbol)))?;

        let (prior_kind, prior_order_id, prior_price) = match &state.protection {
            None => {
                return Err(PylonError::InvalidState(format!(
                    "{}: no protection to switch",
                    symbol
                )))
            }
            Some(ProtectionState::Switching { to, .. }) => {
                info!("{}: switch to {} already in flight", symbol, to);
                return Ok(SwitchOutcome::InFlight);
            }
            Some(ProtectionState::Active { kind, .. }) if *kind == target => {
                return Ok(SwitchOutcome::AlreadyActive);
            }
            Some(ProtectionState::Active {
                kind,
                order_id,
                trigger_price,
            }) => (*kind, order_id.clone(), *trigger_price),
        };

        // Commit point: every reader from here on sees the handover.
        state.protection = Some(ProtectionState::Switching {
            from: prior_kind,
            to: target,
        });

        let revert = ProtectionState::Active {
            kind: prior_kind,
            order_id: prior_order_id.clone(),
            trigger_price: prior_price,
        };

        // Step 4: cancel the active protective order
        match self.router.cancel(&prior_order_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Already terminal on the exchange; if it filled, the
                // position is closing and there is nothing to switch.
                match self.router.fetch(&prior_order_id).await {
                    Ok(snap) if snap.status == OrderStatus::Filled => {
                        state.protection = Some(revert);
                        info!(
                            "{}: protective order {} filled before switch",
                            symbol, prior_order_id
                        );
                        return Ok(SwitchOutcome::PriorFilled);
                    }
                    _ => {
                        // Cancelled externally; safe to place the target
                    }
                }
            }
            Err(e) => {
                warn!(
                    "{}: cancel of {} failed, switch aborted: {}",
                    symbol, prior_order_id, e
                );
                state.protection = Some(revert);
                return Ok(SwitchOutcome::CancelFailed);
            }
        }

        // Step 5: place the replacement
        let request = OrderRequest::sell_limit(&symbol, qty, trigger_price);
        match self.router.submit(&request).await {
            Ok(ack) => {
                state.protection = Some(ProtectionState::Active {
                    kind: target,
                    order_id: ack.order_id.clone(),
                    trigger_price,
                });
                info!(
                    "{}: protection switched {} -> {} ({} @ {})",
                    symbol, prior_kind, target, ack.order_id, trigger_price
                );
                Ok(SwitchOutcome::Switched {
                    order_id: ack.order_id,
                })
            }
            Err(e) => {
                error!(
                    "{}: replacement {} order failed after cancel: {}",
                    symbol, target, e
                );
                self.handle_replace_failure(state, &symbol, qty, prior_kind, prior_price, revert)
                    .await
            }
        }
    }

    /// The cancelled order is gone and the replacement did not land. The
    /// policy decides between re-placing the prior order type and
    /// accepting brief unprotection until the next cycle re-evaluates.
    async fn handle_replace_failure(
        &self,
        state: &mut SymbolState,
        symbol: &str,
        qty: Decimal,
        prior_kind: ProtectionKind,
        prior_price: Decimal,
        revert: ProtectionState,
    ) -> Result<SwitchOutcome> {
        if self.policy == ReplaceFailurePolicy::RestorePrior {
            let request = OrderRequest::sell_limit(symbol, qty, prior_price);
            match self.router.submit(&request).await {
                Ok(ack) => {
                    state.protection = Some(ProtectionState::Active {
                        kind: prior_kind,
                        order_id: ack.order_id.clone(),
                        trigger_price: prior_price,
                    });
                    warn!(
                        "{}: replacement failed, prior {} re-placed as {}",
                        symbol, prior_kind, ack.order_id
                    );
                    return Ok(SwitchOutcome::ReplaceFailed { restored: true });
                }
                Err(e) => {
                    error!("{}: restore of prior {} also failed: {}", symbol, prior_kind, e);
                }
            }
        }

        // Position is briefly unprotected; the marker reverts so the next
        // cycle re-evaluates against a final value.
        warn!(
            "{}: position briefly unprotected after failed switch",
            symbol
        );
        state.protection = Some(revert);
        Ok(SwitchOutcome::ReplaceFailed { restored: false })
    }
}
