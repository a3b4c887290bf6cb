//! Ban eligibility and duration.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::NetworkKey;
use crate::config::BanSettings;

/// Private-use blocks skipped while `never_ban_reserved_subnets` is set.
pub const RESERVED_BLOCKS: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Never banned.
pub const LOOPBACK_BLOCK: (Ipv4Addr, u8) = (Ipv4Addr::new(127, 0, 0, 0), 8);

/// Why a network is not banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exemption {
    Reserved,
    Loopback,
    NeverBan(Ipv4Net),
    BelowThreshold { failures: usize, max: usize },
    AlreadyBanned,
}

impl fmt::Display for Exemption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserved => write!(
                f,
                "contained in a reserved block; set never_ban_reserved_subnets to false to ban anyway"
            ),
            Self::Loopback => write!(f, "loopback network"),
            Self::NeverBan(net) => write!(f, "overlaps never_ban_subnets entry {}", net),
            Self::BelowThreshold { failures, max } => write!(
                f,
                "{} recent failures do not exceed the {} allowed",
                failures, max
            ),
            Self::AlreadyBanned => write!(f, "already banned"),
        }
    }
}

/// Ban decisions derived from [`BanSettings`].
#[derive(Debug, Clone)]
pub struct BanPolicy {
    settings: BanSettings,
}

impl BanPolicy {
    pub fn new(settings: BanSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BanSettings {
        &self.settings
    }

    /// Static exemptions, checked in order: reserved, loopback, never-ban list.
    pub fn exemption(&self, network: &NetworkKey) -> Option<Exemption> {
        if self.settings.never_ban_reserved_subnets
            && RESERVED_BLOCKS
                .iter()
                .any(|(base, prefix)| network.is_within(*base, *prefix))
        {
            return Some(Exemption::Reserved);
        }

        let (loopback, prefix) = LOOPBACK_BLOCK;
        if network.is_within(loopback, prefix) {
            return Some(Exemption::Loopback);
        }

        self.settings
            .never_ban_subnets
            .iter()
            .find(|never_ban| network.overlaps(never_ban))
            .map(|never_ban| Exemption::NeverBan(*never_ban))
    }

    /// Threshold check on an already-pruned failure count.
    pub fn check_threshold(&self, failures: usize) -> Option<Exemption> {
        let max = self.settings.max_allowed_failures;
        (failures <= max).then_some(Exemption::BelowThreshold { failures, max })
    }

    /// Ban length for the given offense (1 for a first ban).
    pub fn ban_duration(&self, offense: u32) -> Duration {
        ban_duration(
            self.settings.ban_period,
            offense,
            self.settings.offense_coefficient(),
            self.settings.offense_max(),
        )
    }
}

/// `base + (min(offense, cap) - 1) * coefficient * base`, in whole milliseconds.
pub fn ban_duration(base: Duration, offense: u32, coefficient: f64, cap: u32) -> Duration {
    let steps = offense.max(1).min(cap.max(1)) - 1;
    let extra_ms = (f64::from(steps) * coefficient * base.as_millis() as f64).round();

    if !extra_ms.is_finite() || extra_ms <= 0.0 {
        return base;
    }

    base.saturating_add(Duration::from_millis(extra_ms as u64))
}
