use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::VigilError;

// --- Geo Types ---

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        haversine_km(self.lat, self.lng, other.lat, other.lng) * 1000.0
    }

    /// Running-average step: the midpoint of the current centroid and a new
    /// report location.
    pub fn averaged_with(&self, other: &GeoPoint) -> GeoPoint {
        GeoPoint {
            lat: (self.lat + other.lat) / 2.0,
            lng: (self.lng + other.lng) / 2.0,
        }
    }
}

/// Haversine great-circle distance between two lat/lng points in kilometers.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

// --- Enums ---

/// A voter's claim about a cluster: the incident is real, or it is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDirection {
    Confirm,
    Dispute,
}

impl VoteDirection {
    pub fn from_bool(is_real: bool) -> Self {
        if is_real {
            Self::Confirm
        } else {
            Self::Dispute
        }
    }

    pub fn as_bool(self) -> bool {
        matches!(self, Self::Confirm)
    }
}

impl fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirm => write!(f, "confirm"),
            Self::Dispute => write!(f, "dispute"),
        }
    }
}

/// Binary truth value assigned to a cluster when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Confirmed,
    Disputed,
}

impl Outcome {
    /// Whether a vote in `direction` backed this outcome.
    pub fn agrees_with(self, direction: VoteDirection) -> bool {
        matches!(
            (self, direction),
            (Self::Confirmed, VoteDirection::Confirm) | (Self::Disputed, VoteDirection::Dispute)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Disputed => "disputed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(Self::Confirmed),
            "disputed" => Ok(Self::Disputed),
            other => Err(VigilError::Parse(format!("unknown outcome: {other}"))),
        }
    }
}

/// What a voter's settlement turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementResult {
    Win,
    Loss,
}

impl fmt::Display for SettlementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Win => write!(f, "win"),
            Self::Loss => write!(f, "loss"),
        }
    }
}

// --- Evidence ---

/// Trust-weighted evidence accumulated on a cluster. Both sides are sums of
/// voter credibility, not raw vote counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Tallies {
    pub score_true: f64,
    pub score_false: f64,
}

impl Tallies {
    pub fn new(score_true: f64, score_false: f64) -> Self {
        Self {
            score_true,
            score_false,
        }
    }

    pub fn total(&self) -> f64 {
        self.score_true + self.score_false
    }
}

// --- Aggregates ---

/// One real-world incident formed by merging spatiotemporally close reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentCluster {
    pub id: Uuid,
    pub category: String,
    pub subcategory: String,
    pub centroid: GeoPoint,
    pub created_at: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub tallies: Tallies,
    /// `None` when the cluster never received any evidence.
    pub credibility: Option<f64>,
    pub vote_count: i64,
    pub comment_count: i64,
    pub view_count: i64,
    pub flag_count: i64,
    pub is_active: bool,
}

impl IncidentCluster {
    /// Open for voting at `at`: not yet resolved and not past its end time.
    pub fn accepts_votes_at(&self, at: DateTime<Utc>) -> bool {
        self.is_active && at < self.end_time
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.is_active && at >= self.end_time
    }
}

/// One voter's evidence attached to a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub voter_id: Uuid,
    /// `None` only on legacy creator rows, which count as a confirmation.
    pub vote: Option<VoteDirection>,
    pub location: GeoPoint,
    pub reported_at: DateTime<Utc>,
    pub settled_outcome: Option<Outcome>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl IncidentReport {
    pub fn effective_vote(&self) -> VoteDirection {
        self.vote.unwrap_or(VoteDirection::Confirm)
    }

    pub fn is_settled(&self) -> bool {
        self.settled_outcome.is_some()
    }
}

/// Per-subcategory matching and lifetime rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubcategoryRules {
    pub code: String,
    pub category: String,
    pub match_radius_m: f64,
    pub default_duration_hours: f64,
}

// --- Notifications ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewCluster,
    NewEvidence,
    VoteWon,
    VoteLost,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewCluster => "new_cluster",
            Self::NewEvidence => "new_evidence",
            Self::VoteWon => "vote_won",
            Self::VoteLost => "vote_lost",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fire-and-forget event handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub voter_id: Uuid,
    pub cluster_id: Uuid,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        voter_id: Uuid,
        cluster_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            voter_id,
            cluster_id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toronto_city_hall_to_union_station() {
        let city_hall = GeoPoint::new(43.6534, -79.3841);
        let union = GeoPoint::new(43.6453, -79.3806);
        let d = city_hall.distance_m(&union);
        assert!(d > 800.0 && d < 1000.0, "Expected ~940m, got {d}m");
    }

    #[test]
    fn distance_to_self_is_zero() {
        let p = GeoPoint::new(43.65, -79.38);
        assert!(p.distance_m(&p).abs() < 1e-9);
    }

    #[test]
    fn averaged_with_is_midpoint() {
        let a = GeoPoint::new(43.0, -79.0);
        let b = GeoPoint::new(44.0, -80.0);
        assert_eq!(a.averaged_with(&b), GeoPoint::new(43.5, -79.5));
    }

    #[test]
    fn invalid_coordinates_rejected() {
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::INFINITY).is_valid());
        assert!(GeoPoint::new(-90.0, 180.0).is_valid());
    }

    #[test]
    fn outcome_agreement() {
        assert!(Outcome::Confirmed.agrees_with(VoteDirection::Confirm));
        assert!(!Outcome::Confirmed.agrees_with(VoteDirection::Dispute));
        assert!(Outcome::Disputed.agrees_with(VoteDirection::Dispute));
        assert!(!Outcome::Disputed.agrees_with(VoteDirection::Confirm));
    }

    #[test]
    fn outcome_parses_its_own_display() {
        for outcome in [Outcome::Confirmed, Outcome::Disputed] {
            assert_eq!(outcome.to_string().parse::<Outcome>().unwrap(), outcome);
        }
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn legacy_report_without_vote_counts_as_confirm() {
        let report = IncidentReport {
            id: Uuid::new_v4(),
            cluster_id: Uuid::new_v4(),
            voter_id: Uuid::new_v4(),
            vote: None,
            location: GeoPoint::new(43.65, -79.38),
            reported_at: Utc::now(),
            settled_outcome: None,
            settled_at: None,
        };
        assert_eq!(report.effective_vote(), VoteDirection::Confirm);
    }
}
