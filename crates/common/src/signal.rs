use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::position::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    LongPrimary,
    LongBidImprove,
    ShortPrimary,
    ShortAskImprove,
}

/// Emitted by the signal engine when an exit condition is met. Size
/// composition from `roi_mult`/`accel_mult` happens downstream in the
/// execution engine, not here.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    pub symbol: String,
    pub side: Side,
    pub reason: ExitReason,
    pub roi_mult: Decimal,
    pub accel_mult: Decimal,
    pub at: DateTime<Utc>,
}
