//! Cluster matching: decide whether a fresh report extends an open cluster.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use vigil_common::{GeoPoint, IncidentCluster, SubcategoryRules};

use crate::error::Result;
use crate::traits::LedgerTx;

/// A fresh report looking for a home.
#[derive(Debug, Clone)]
pub struct MatchCandidate<'a> {
    pub subcategory: &'a str,
    pub location: GeoPoint,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClusterMatch {
    pub cluster: IncidentCluster,
    pub distance_m: f64,
}

pub struct ClusterMatcher {
    window: Duration,
}

impl ClusterMatcher {
    pub fn new(window_hours: f64) -> Self {
        Self {
            window: hours(window_hours),
        }
    }

    /// Look for an open cluster created in the window ending at the
    /// candidate's timestamp and inside the subcategory's match radius. Store errors propagate; an unreachable
    /// store is never reported as "no match".
    pub async fn find_match(
        &self,
        tx: &mut dyn LedgerTx,
        rules: &SubcategoryRules,
        candidate: &MatchCandidate<'_>,
    ) -> Result<Option<ClusterMatch>> {
        let since = candidate.at - self.window;
        let open = tx.open_clusters_since(candidate.subcategory, since).await?;
        let considered = open.len();

        let found = nearest_within(
            open.into_iter().filter(|c| {
                c.subcategory == candidate.subcategory
                    && c.is_active
                    && c.created_at >= since
                    && c.created_at <= candidate.at
            }),
            &candidate.location,
            rules.match_radius_m,
        );

        debug!(
            subcategory = candidate.subcategory,
            considered,
            matched = ?found.as_ref().map(|m| m.cluster.id),
            "Cluster match lookup"
        );

        Ok(found)
    }
}

/// The cluster whose centroid is strictly closer than `radius_m`, preferring
/// the nearest when several qualify.
pub fn nearest_within(
    clusters: impl IntoIterator<Item = IncidentCluster>,
    point: &GeoPoint,
    radius_m: f64,
) -> Option<ClusterMatch> {
    clusters
        .into_iter()
        .map(|cluster| {
            let distance_m = cluster.centroid.distance_m(point);
            ClusterMatch {
                cluster,
                distance_m,
            }
        })
        .filter(|m| m.distance_m < radius_m)
        .min_by(|a, b| a.distance_m.total_cmp(&b.distance_m))
}

/// Fractional hours to a chrono duration, to the millisecond.
pub(crate) fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cluster_at, MockLedgerStore};
    use crate::traits::LedgerStore;

    fn rules(radius_m: f64) -> SubcategoryRules {
        SubcategoryRules {
            code: "crime.theft".into(),
            category: "crime".into(),
            match_radius_m: radius_m,
            default_duration_hours: 24.0,
        }
    }

    #[test]
    fn picks_nearest_not_most_recent() {
        let now = Utc::now();
        let point = GeoPoint::new(43.6500, -79.3800);

        // Newer but farther (~111 m north).
        let far = cluster_at("crime.theft", GeoPoint::new(43.6510, -79.3800), now);
        // Older but closer (~11 m north).
        let near = cluster_at(
            "crime.theft",
            GeoPoint::new(43.6501, -79.3800),
            now - Duration::hours(3),
        );
        let near_id = near.id;

        let m = nearest_within(vec![far, near], &point, 500.0).unwrap();
        assert_eq!(m.cluster.id, near_id);
        assert!(m.distance_m < 20.0);
    }

    #[test]
    fn radius_is_exclusive() {
        let now = Utc::now();
        let point = GeoPoint::new(43.65, -79.38);
        let c = cluster_at("crime.theft", GeoPoint::new(43.651, -79.38), now);
        let d = c.centroid.distance_m(&point);

        assert!(nearest_within(vec![c.clone()], &point, d).is_none());
        assert!(nearest_within(vec![c], &point, d + 0.01).is_some());
    }

    #[test]
    fn fractional_hours() {
        assert_eq!(hours(1.5), Duration::minutes(90));
        assert_eq!(hours(24.0), Duration::hours(24));
    }

    #[tokio::test]
    async fn ignores_stale_closed_and_other_subcategories() {
        let now = Utc::now();
        let here = GeoPoint::new(43.65, -79.38);

        let stale = cluster_at("crime.theft", here, now - Duration::hours(25));
        let mut closed = cluster_at("crime.theft", here, now);
        closed.is_active = false;
        let other = cluster_at("traffic.collision", here, now);

        let store = MockLedgerStore::new();
        store.insert_clusters(vec![stale, closed, other]).await;

        let matcher = ClusterMatcher::new(24.0);
        let mut tx = store.begin().await.unwrap();
        let found = matcher
            .find_match(
                tx.as_mut(),
                &rules(1_000.0),
                &MatchCandidate {
                    subcategory: "crime.theft",
                    location: here,
                    at: now,
                },
            )
            .await
            .unwrap();

        assert!(found.is_none());
    }

    #[tokio::test]
    async fn ignores_clusters_newer_than_the_candidate() {
        let now = Utc::now();
        let here = GeoPoint::new(43.65, -79.38);

        let store = MockLedgerStore::new();
        store
            .insert_clusters(vec![cluster_at("crime.theft", here, now)])
            .await;

        let matcher = ClusterMatcher::new(24.0);
        let mut tx = store.begin().await.unwrap();
        let earlier = matcher
            .find_match(
                tx.as_mut(),
                &rules(1_000.0),
                &MatchCandidate {
                    subcategory: "crime.theft",
                    location: here,
                    at: now - Duration::hours(1),
                },
            )
            .await
            .unwrap();
        let same_instant = matcher
            .find_match(
                tx.as_mut(),
                &rules(1_000.0),
                &MatchCandidate {
                    subcategory: "crime.theft",
                    location: here,
                    at: now,
                },
            )
            .await
            .unwrap();

        assert!(earlier.is_none());
        assert!(same_instant.is_some());
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let store = MockLedgerStore::new();
        let mut tx = store.begin().await.unwrap();
        store.set_unavailable(true);

        let result = ClusterMatcher::new(24.0)
            .find_match(
                tx.as_mut(),
                &rules(100.0),
                &MatchCandidate {
                    subcategory: "crime.theft",
                    location: GeoPoint::new(43.65, -79.38),
                    at: Utc::now(),
                },
            )
            .await;

        assert!(result.is_err());
    }
}
