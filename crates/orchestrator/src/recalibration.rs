/// Summary of a recalibration pass, surfaced for logging/diagnostics —
/// never consulted for control flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecalibrationReport {
    pub rules_refreshed: usize,
    pub positions_refreshed: usize,
    pub open_orders_seen: usize,
    pub open_algo_orders_seen: usize,
    pub external_orders_handled: usize,
}
