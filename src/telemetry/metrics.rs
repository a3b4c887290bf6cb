/// Operational counters, recorded through the `metrics` facade.
///
/// Nothing is exported unless the host process installs a recorder.
pub mod counters {
    pub const FAILURES_TOTAL: &str = "banwarden.failures";
    pub const BANS_TOTAL: &str = "banwarden.bans";
    pub const BANS_SIMULATED_TOTAL: &str = "banwarden.bans_simulated";
    pub const UNBANS_TOTAL: &str = "banwarden.unbans";
    pub const UNBAN_ERRORS_TOTAL: &str = "banwarden.unban_errors";
    pub const MATCH_TIMEOUTS_TOTAL: &str = "banwarden.match_timeouts";

    pub fn failure_recorded() {
        metrics::counter!(FAILURES_TOTAL).increment(1);
    }

    pub fn ban_applied(simulated: bool) {
        if simulated {
            metrics::counter!(BANS_SIMULATED_TOTAL).increment(1);
        } else {
            metrics::counter!(BANS_TOTAL).increment(1);
        }
    }

    pub fn unban_applied() {
        metrics::counter!(UNBANS_TOTAL).increment(1);
    }

    pub fn unban_failed() {
        metrics::counter!(UNBAN_ERRORS_TOTAL).increment(1);
    }

    pub fn match_timed_out() {
        metrics::counter!(MATCH_TIMEOUTS_TOTAL).increment(1);
    }
}
