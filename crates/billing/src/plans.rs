//! Plan catalog
//!
//! The single table of plans, prices, durations, and the capabilities each
//! plan unlocks. Everything that needs to know "what does plan X include"
//! reads it from here.

use fixitflow_shared::{Capability, PlanTier};
use serde::Serialize;
use time::Duration;

const PAID_CAPABILITIES: &[Capability] = &[
    Capability::ComplexGuides,
    Capability::AiChat,
    Capability::VideoChat,
    Capability::LinkedVideos,
    Capability::ImageAnalysis,
    Capability::ImageUpload,
    Capability::SupportTicket,
];

const PAID_PRIORITY_CAPABILITIES: &[Capability] = &[
    Capability::ComplexGuides,
    Capability::AiChat,
    Capability::VideoChat,
    Capability::LinkedVideos,
    Capability::ImageAnalysis,
    Capability::ImageUpload,
    Capability::SupportTicket,
    Capability::PrioritySupport,
];

/// Daily allowance for non-premium principals. Capabilities not listed here
/// are unavailable on the free plan; AI chat stays premium-only.
const FREE_DAILY_ALLOWANCES: &[(Capability, u32)] = &[
    (Capability::ImageUpload, 3),
    (Capability::SupportTicket, 1),
];

/// Trials grant the monthly plan's capability set
pub const TRIAL_PLAN: PlanTier = PlanTier::Monthly;

/// Length of the one-per-account trial
pub const TRIAL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlanDefinition {
    pub tier: PlanTier,
    pub name: &'static str,
    pub price_cents: i64,
    /// `None` for the free plan, which never lapses
    pub duration_days: Option<i64>,
    pub capabilities: &'static [Capability],
}

impl PlanDefinition {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_days.map(Duration::days)
    }
}

const PLANS: [PlanDefinition; 4] = [
    PlanDefinition {
        tier: PlanTier::Free,
        name: "Free",
        price_cents: 0,
        duration_days: None,
        capabilities: &[],
    },
    PlanDefinition {
        tier: PlanTier::Daily,
        name: "Day Pass",
        price_cents: 299,
        duration_days: Some(1),
        capabilities: PAID_CAPABILITIES,
    },
    PlanDefinition {
        tier: PlanTier::Monthly,
        name: "Monthly",
        price_cents: 999,
        duration_days: Some(30),
        capabilities: PAID_PRIORITY_CAPABILITIES,
    },
    PlanDefinition {
        tier: PlanTier::Annual,
        name: "Annual",
        price_cents: 9999,
        duration_days: Some(365),
        capabilities: PAID_PRIORITY_CAPABILITIES,
    },
];

/// Read-only view over the plan table
pub struct PlanCatalog;

impl PlanCatalog {
    pub fn all() -> &'static [PlanDefinition] {
        &PLANS
    }

    pub fn get(tier: PlanTier) -> &'static PlanDefinition {
        match tier {
            PlanTier::Free => &PLANS[0],
            PlanTier::Daily => &PLANS[1],
            PlanTier::Monthly => &PLANS[2],
            PlanTier::Annual => &PLANS[3],
        }
    }

    /// Look up a plan by wire name; unknown names yield `None`
    pub fn find(name: &str) -> Option<&'static PlanDefinition> {
        name.parse::<PlanTier>().ok().map(Self::get)
    }

    pub fn capabilities(tier: PlanTier) -> &'static [Capability] {
        Self::get(tier).capabilities
    }

    pub fn includes(tier: PlanTier, capability: Capability) -> bool {
        Self::capabilities(tier).contains(&capability)
    }

    pub fn duration(tier: PlanTier) -> Option<Duration> {
        Self::get(tier).duration()
    }

    /// Whether a capability name is gated by any plan or free allowance
    pub fn is_known(name: &str) -> bool {
        name.parse::<Capability>().is_ok_and(|cap| {
            PLANS.iter().any(|plan| plan.capabilities.contains(&cap))
                || Self::free_daily_allowance(cap).is_some()
        })
    }

    pub fn free_daily_allowance(capability: Capability) -> Option<u32> {
        FREE_DAILY_ALLOWANCES
            .iter()
            .find(|(cap, _)| *cap == capability)
            .map(|(_, limit)| *limit)
    }

    pub fn free_allowances() -> &'static [(Capability, u32)] {
        FREE_DAILY_ALLOWANCES
    }

    /// Paid plans that include a capability, cheapest first
    pub fn plans_with(capability: Capability) -> Vec<PlanTier> {
        PLANS
            .iter()
            .filter(|plan| plan.capabilities.contains(&capability))
            .map(|plan| plan.tier)
            .collect()
    }
}
