use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Symbols to trade
    pub symbols: Vec<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Core engine timing and dedup settings
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seconds before an unfilled buy order is cancelled
    #[serde(default = "default_buy_timeout")]
    pub buy_timeout_secs: u64,
    /// Seconds before an unfilled sell attempt returns to POSITION
    #[serde(default = "default_sell_timeout")]
    pub sell_timeout_secs: u64,
    /// Seconds to hold off re-entry after a completed trade
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// TTL for idempotency fingerprints
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,
    /// Worker cycle interval
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_ms: u64,
}

fn default_buy_timeout() -> u64 {
    30
}
fn default_sell_timeout() -> u64 {
    45
}
fn default_cooldown() -> u64 {
    120
}
fn default_idempotency_ttl() -> u64 {
    300
}
fn default_cycle_interval() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buy_timeout_secs: default_buy_timeout(),
            sell_timeout_secs: default_sell_timeout(),
            cooldown_secs: default_cooldown(),
            idempotency_ttl_secs: default_idempotency_ttl(),
            cycle_interval_ms: default_cycle_interval(),
        }
    }
}

/// Entry sizing and data-freshness settings
#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// Quantity per entry order
    #[serde(default = "default_order_qty")]
    pub order_qty: Decimal,
    /// Ticker older than this is treated as unavailable
    #[serde(default = "default_max_ticker_age")]
    pub max_ticker_age_secs: u64,
}

fn default_order_qty() -> Decimal {
    dec!(1)
}
fn default_max_ticker_age() -> u64 {
    10
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            order_qty: default_order_qty(),
            max_ticker_age_secs: default_max_ticker_age(),
        }
    }
}

/// What to do when re-placement fails during a protection switch.
/// The cancelled order is gone either way; this decides whether we retry
/// the original order type or leave the position briefly unprotected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplaceFailurePolicy {
    /// Revert the protection marker and let the next cycle re-evaluate
    LeaveUnprotected,
    /// Re-place the cancelled order type at its previous trigger price
    RestorePrior,
}

impl Default for ReplaceFailurePolicy {
    fn default() -> Self {
        Self::LeaveUnprotected
    }
}

/// Protective order placement and switching thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    /// Stop-loss trigger as a fraction below entry (0.02 = 2%)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Take-profit trigger as a fraction above entry
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    /// Unrealized gain fraction at which protection arms to take-profit
    #[serde(default = "default_arm_threshold_pct")]
    pub arm_threshold_pct: Decimal,
    #[serde(default)]
    pub on_replace_failure: ReplaceFailurePolicy,
}

fn default_stop_loss_pct() -> Decimal {
    dec!(0.02)
}
fn default_take_profit_pct() -> Decimal {
    dec!(0.03)
}
fn default_arm_threshold_pct() -> Decimal {
    dec!(0.015)
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            arm_threshold_pct: default_arm_threshold_pct(),
            on_replace_failure: ReplaceFailurePolicy::default(),
        }
    }
}

/// Policy when the spread exceeds the liquidity threshold during an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiquidityPolicy {
    /// Abort the exit; the position stays protected
    Skip,
    /// Go straight to a market order
    ForceMarket,
    /// Report a requeue so the caller retries after a delay
    Requeue,
}

impl Default for LiquidityPolicy {
    fn default() -> Self {
        Self::Skip
    }
}

/// Exit escalation settings
#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// (ask - bid) / bid above which the liquidity guard engages
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: Decimal,
    #[serde(default)]
    pub spread_policy: LiquidityPolicy,
    /// Seconds the passive limit leg may rest before escalation
    #[serde(default = "default_passive_window")]
    pub passive_window_secs: u64,
    /// Poll interval while the passive leg is resting
    #[serde(default = "default_exit_poll_interval")]
    pub poll_interval_ms: u64,
    /// Escalating price concessions for the IOC legs (fractions of bid)
    #[serde(default = "default_ioc_premiums")]
    pub ioc_premiums: Vec<Decimal>,
    /// Allow the final market-order fallback
    #[serde(default = "default_true")]
    pub market_fallback: bool,
    /// TTL for pending-exit registry entries
    #[serde(default = "default_pending_exit_ttl")]
    pub pending_exit_ttl_secs: u64,
    /// Ticker older than this blocks the exit
    #[serde(default = "default_max_ticker_age")]
    pub max_ticker_age_secs: u64,
}

fn default_max_spread_pct() -> Decimal {
    dec!(0.01)
}
fn default_passive_window() -> u64 {
    10
}
fn default_exit_poll_interval() -> u64 {
    250
}
fn default_ioc_premiums() -> Vec<Decimal> {
    vec![dec!(0.001), dec!(0.003), dec!(0.01)]
}
fn default_true() -> bool {
    true
}
fn default_pending_exit_ttl() -> u64 {
    120
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            max_spread_pct: default_max_spread_pct(),
            spread_policy: LiquidityPolicy::default(),
            passive_window_secs: default_passive_window(),
            poll_interval_ms: default_exit_poll_interval(),
            ioc_premiums: default_ioc_premiums(),
            market_fallback: default_true(),
            pending_exit_ttl_secs: default_pending_exit_ttl(),
            max_ticker_age_secs: default_max_ticker_age(),
        }
    }
}

/// Order router retry settings
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    100
}
fn default_max_delay() -> u64 {
    5000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Budget reservation settings
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    /// Total capital the engine may deploy
    #[serde(default = "default_total_budget")]
    pub total: Decimal,
    /// Reservations not committed within this window are released
    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl_secs: u64,
}

fn default_total_budget() -> Decimal {
    dec!(1000)
}
fn default_reservation_ttl() -> u64 {
    120
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total: default_total_budget(),
            reservation_ttl_secs: default_reservation_ttl(),
        }
    }
}

/// Snapshot persistence settings
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: String,
}

fn default_snapshot_dir() -> String {
    "snapshots".to_string()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Optional log file directory; stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a file plus PYLON_* environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(
                Environment::with_prefix("PYLON")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for a quick dry run against the paper exchange
    pub fn dry_run_defaults(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            engine: EngineConfig::default(),
            entry: EntryConfig::default(),
            protection: ProtectionConfig::default(),
            exit: ExitConfig::default(),
            router: RouterConfig::default(),
            budget: BudgetConfig::default(),
            snapshot: SnapshotConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
