//! Timeout detection
//!
//! Called once per cycle per symbol. Emits at most one event: the phases
//! that can time out are mutually exclusive.

use chrono::{DateTime, Duration, Utc};

use crate::config::EngineConfig;
use crate::domain::{Event, EventKind, Phase, SymbolState};

pub struct TimeoutManager {
    buy_timeout: Duration,
    sell_timeout: Duration,
    cooldown: Duration,
}

impl TimeoutManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            buy_timeout: Duration::seconds(config.buy_timeout_secs as i64),
            sell_timeout: Duration::seconds(config.sell_timeout_secs as i64),
            cooldown: Duration::seconds(config.cooldown_secs as i64),
        }
    }

    /// Check every timeout that applies to the state's current phase.
    pub fn check_all_timeouts(&self, state: &SymbolState, now: DateTime<Utc>) -> Vec<Event> {
        let mut events = Vec::new();

        match state.phase() {
            Phase::WaitFill => {
                if let Some(ctx) = &state.buy_order {
                    if now - ctx.placed_at > self.buy_timeout {
                        let mut event = Event::new(EventKind::BuyOrderTimeout, state.symbol());
                        if let Some(order_id) = &ctx.order_id {
                            event = event.with_order_id(order_id.clone());
                        }
                        events.push(event);
                    }
                }
            }
            Phase::WaitSellFill => {
                if let Some(ctx) = &state.sell_order {
                    if now - ctx.placed_at > self.sell_timeout {
                        let mut event = Event::new(EventKind::SellOrderTimeout, state.symbol());
                        if let Some(order_id) = &ctx.order_id {
                            event = event.with_order_id(order_id.clone());
                        }
                        events.push(event);
                    }
                }
            }
            Phase::Cooldown => {
                if let Some(started) = state.cooldown_started_at {
                    if now - started > self.cooldown {
                        events.push(Event::new(EventKind::CooldownExpired, state.symbol()));
                    }
                }
            }
            _ => {}
        }

        events
    }
}
