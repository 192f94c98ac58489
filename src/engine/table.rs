//! Transition table
//!
//! The full (phase, event) -> (next phase, action) map, built once at
//! startup and never mutated. Making the table explicit data is what
//! lets invalid-transition and idempotency behavior be tested directly
//! instead of inferred from handler control flow.

use std::collections::HashMap;

use crate::domain::{EventKind, Phase};
use crate::error::{PylonError, Result};

use super::actions::Action;

/// Whether a transition needs the per-symbol switch lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionClass {
    Standard,
    /// Changes which protective order is active; serialized per symbol
    Switch,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub to: Phase,
    pub action: Action,
    pub class: TransitionClass,
}

pub struct TransitionTable {
    entries: HashMap<(Phase, EventKind), Transition>,
}

impl TransitionTable {
    /// Build the full lifecycle table. A duplicate (phase, event) key is
    /// a programming error and fails the build.
    pub fn build() -> Result<Self> {
        use EventKind::*;
        use Phase::*;

        let mut table = Self {
            entries: HashMap::new(),
        };

        table.insert(Warmup, WarmupComplete, Idle, Action::FinishWarmup)?;

        table.insert(Idle, EntrySignal, EntryEval, Action::RecordSignal)?;
        table.insert(EntryEval, EntryApproved, PlaceBuy, Action::ArmEntry)?;
        table.insert(EntryEval, EntryRejected, Idle, Action::DiscardSignal)?;

        table.insert(PlaceBuy, BuyPlaced, WaitFill, Action::TrackBuyOrder)?;
        table.insert(PlaceBuy, BuyRejected, Idle, Action::AbortEntry)?;

        table.insert(WaitFill, OrderPartial, WaitFill, Action::AccumulateBuyFill)?;
        table.insert(WaitFill, OrderFilled, Position, Action::OpenPosition)?;
        table.insert(WaitFill, BuyOrderTimeout, Idle, Action::AbandonBuy)?;

        table.insert_switch(Position, SwitchToTakeProfit)?;
        table.insert_switch(Position, SwitchToStopLoss)?;
        table.insert(Position, ProtectionFilled, PostTrade, Action::CloseAtProtection)?;
        table.insert(Position, ExitSignal, ExitEval, Action::RecordExitSignal)?;

        table.insert(ExitEval, ExitApproved, PlaceSell, Action::ArmExit)?;
        table.insert(ExitEval, ExitRejected, Position, Action::StayInPosition)?;

        table.insert(PlaceSell, SellPlaced, WaitSellFill, Action::TrackSellOrder)?;
        table.insert(PlaceSell, SellRejected, Position, Action::AbortExit)?;

        table.insert(WaitSellFill, OrderPartial, WaitSellFill, Action::AccumulateSellFill)?;
        table.insert(WaitSellFill, OrderFilled, PostTrade, Action::CompleteExit)?;
        table.insert(WaitSellFill, SellOrderTimeout, Position, Action::AbortExit)?;

        table.insert(PostTrade, TradeSettled, Cooldown, Action::StartCooldown)?;
        table.insert(Cooldown, CooldownExpired, Idle, Action::FinishCooldown)?;

        table.insert(Error, ManualReset, Idle, Action::ResetFromError)?;

        Ok(table)
    }

    fn insert(&mut self, from: Phase, on: EventKind, to: Phase, action: Action) -> Result<()> {
        self.insert_entry(
            from,
            on,
            Transition {
                to,
                action,
                class: TransitionClass::Standard,
            },
        )
    }

    /// Switch-class entries keep the phase and run the protection
    /// switcher instead of a pure action.
    fn insert_switch(&mut self, from: Phase, on: EventKind) -> Result<()> {
        self.insert_entry(
            from,
            on,
            Transition {
                to: from,
                action: Action::SwitchProtection,
                class: TransitionClass::Switch,
            },
        )
    }

    fn insert_entry(&mut self, from: Phase, on: EventKind, transition: Transition) -> Result<()> {
        if self.entries.insert((from, on), transition).is_some() {
            return Err(PylonError::Internal(format!(
                "duplicate transition entry for ({}, {})",
                from, on
            )));
        }
        Ok(())
    }

    pub fn lookup(&self, phase: Phase, kind: EventKind) -> Option<&Transition> {
        self.entries.get(&(phase, kind))
    }

    /// Event kinds the phase accepts, for invalid-transition logging
    pub fn valid_events(&self, phase: Phase) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self
            .entries
            .keys()
            .filter(|(p, _)| *p == phase)
            .map(|(_, k)| *k)
            .collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_without_duplicates() {
        let table = TransitionTable::build().unwrap();
        assert_eq!(table.len(), 23);
    }

    #[test]
    fn duplicate_insert_is_an_error() {
        let mut table = TransitionTable::build().unwrap();
        let result = table.insert(
            Phase::Idle,
            EventKind::EntrySignal,
            Phase::EntryEval,
            Action::RecordSignal,
        );
        assert!(result.is_err());
    }

    #[test]
    fn every_phase_except_error_reaches_somewhere() {
        let table = TransitionTable::build().unwrap();
        for phase in Phase::all() {
            let events = table.valid_events(phase);
            assert!(
                !events.is_empty(),
                "phase {} has no outgoing transitions",
                phase
            );
        }
    }

    #[test]
    fn error_only_accepts_manual_reset() {
        let table = TransitionTable::build().unwrap();
        assert_eq!(
            table.valid_events(Phase::Error),
            vec![EventKind::ManualReset]
        );
    }

    #[test]
    fn switch_entries_keep_phase() {
        let table = TransitionTable::build().unwrap();
        for kind in [EventKind::SwitchToTakeProfit, EventKind::SwitchToStopLoss] {
            let t = table.lookup(Phase::Position, kind).unwrap();
            assert_eq!(t.to, Phase::Position);
            assert_eq!(t.class, TransitionClass::Switch);
        }
    }

    #[test]
    fn unknown_pairs_are_absent() {
        let table = TransitionTable::build().unwrap();
        assert!(table.lookup(Phase::Idle, EventKind::OrderFilled).is_none());
        assert!(table.lookup(Phase::Cooldown, EventKind::EntrySignal).is_none());
        assert!(table.lookup(Phase::Error, EventKind::EntrySignal).is_none());
    }
}
