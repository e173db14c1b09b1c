//! Common types used across FixItFlow

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for UserId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| format!("Invalid user id: {}", s))
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Plan a subscription is on
///
/// `premium` is accepted when parsing for rows written before the paid plans
/// were split into daily/monthly/annual; it resolves to monthly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Daily,
    Monthly,
    Annual,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [Self::Free, Self::Daily, Self::Monthly, Self::Annual];

    /// Whether this plan is a paid ("premium") plan
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "daily" => Ok(Self::Daily),
            "monthly" | "premium" => Ok(Self::Monthly),
            "annual" | "yearly" => Ok(Self::Annual),
            _ => Err(format!("Invalid plan: {}", s)),
        }
    }
}

/// Lifecycle status of a subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Trial,
    Expired,
    Cancelled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trial => "trial",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trial" | "trialing" => Ok(Self::Trial),
            "expired" => Ok(Self::Expired),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// External payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    PayPal,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::PayPal => "paypal",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::PayPal),
            _ => Err(format!("Unknown payment provider: {}", s)),
        }
    }
}

/// A gated feature of the product
///
/// Wire names are camelCase (`aiChat`, `imageUpload`, ...). Parsing is exact:
/// anything that isn't a known name is rejected so callers can deny it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    ComplexGuides,
    AiChat,
    VideoChat,
    LinkedVideos,
    ImageAnalysis,
    ImageUpload,
    SupportTicket,
    PrioritySupport,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Self::ComplexGuides,
        Self::AiChat,
        Self::VideoChat,
        Self::LinkedVideos,
        Self::ImageAnalysis,
        Self::ImageUpload,
        Self::SupportTicket,
        Self::PrioritySupport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComplexGuides => "complexGuides",
            Self::AiChat => "aiChat",
            Self::VideoChat => "videoChat",
            Self::LinkedVideos => "linkedVideos",
            Self::ImageAnalysis => "imageAnalysis",
            Self::ImageUpload => "imageUpload",
            Self::SupportTicket => "supportTicket",
            Self::PrioritySupport => "prioritySupport",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown capability: {}", s))
    }
}
