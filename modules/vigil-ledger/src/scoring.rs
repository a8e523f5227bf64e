//! Credibility scoring. Pure functions, no I/O.
//!
//! Every vote adds exactly [`MAX_CREDIBILITY`] units of evidence split
//! between the two tallies by the voter's weight, so a cluster with one or
//! two votes never snaps to an extreme and credibility converges as more
//! evidence arrives.

use vigil_common::{Outcome, SettlementConfig, SettlementResult, Tallies, VoteDirection};

/// Upper bound of both voter and cluster credibility.
pub const MAX_CREDIBILITY: f64 = 10.0;

/// Vote weight for a voter with the given personal credibility.
///
/// Settlement writes are unclamped, so stored voter credibility can drift
/// outside [0, 10]; the bound is applied here, where it is read as weight.
pub fn weight(voter_credibility: f64) -> f64 {
    if voter_credibility.is_nan() {
        return 0.0;
    }
    voter_credibility.clamp(0.0, MAX_CREDIBILITY)
}

/// Add one weighted vote to the tallies.
pub fn apply_vote(tallies: Tallies, vote: VoteDirection, weight: f64) -> Tallies {
    let complement = MAX_CREDIBILITY - weight;
    match vote {
        VoteDirection::Confirm => Tallies {
            score_true: tallies.score_true + weight,
            score_false: tallies.score_false + complement,
        },
        VoteDirection::Dispute => Tallies {
            score_true: tallies.score_true + complement,
            score_false: tallies.score_false + weight,
        },
    }
}

/// Initial tallies for a new cluster: the creator's report is a confirmation
/// weighted by their own credibility.
pub fn seed_tallies(creator_credibility: f64) -> Tallies {
    apply_vote(
        Tallies::default(),
        VoteDirection::Confirm,
        weight(creator_credibility),
    )
}

/// `10 * score_true / max(total, 1)`, clamped to [0, 10].
pub fn derive_credibility(tallies: &Tallies) -> f64 {
    let denominator = tallies.total().max(1.0);
    (MAX_CREDIBILITY * tallies.score_true / denominator).clamp(0.0, MAX_CREDIBILITY)
}

/// "Confirmed" when `credibility >= threshold` (inclusive), else "disputed".
pub fn classify_outcome(credibility: f64, threshold: f64) -> Outcome {
    if credibility >= threshold {
        Outcome::Confirmed
    } else {
        Outcome::Disputed
    }
}

/// Account adjustment owed to one voter once a cluster's outcome is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    pub result: SettlementResult,
    pub score_delta: f64,
    pub credibility_delta: f64,
}

pub fn settle(vote: VoteDirection, outcome: Outcome, policy: &SettlementConfig) -> Settlement {
    if outcome.agrees_with(vote) {
        Settlement {
            result: SettlementResult::Win,
            score_delta: policy.win_score,
            credibility_delta: policy.win_credibility,
        }
    } else {
        Settlement {
            result: SettlementResult::Loss,
            score_delta: policy.loss_score,
            credibility_delta: policy.loss_credibility,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn arb_vote() -> impl Strategy<Value = VoteDirection> {
        prop_oneof![Just(VoteDirection::Confirm), Just(VoteDirection::Dispute)]
    }

    #[test]
    fn creator_seed_matches_credibility() {
        let t = seed_tallies(8.0);
        assert_eq!(t, Tallies::new(8.0, 2.0));
        assert!((derive_credibility(&t) - 8.0).abs() < EPS);
    }

    #[test]
    fn dispute_vote_from_six_credibility_voter() {
        let t = apply_vote(Tallies::new(8.0, 2.0), VoteDirection::Dispute, weight(6.0));
        assert_eq!(t, Tallies::new(12.0, 8.0));
        assert!((derive_credibility(&t) - 6.0).abs() < EPS);
    }

    #[test]
    fn empty_tallies_have_zero_credibility() {
        assert_eq!(derive_credibility(&Tallies::default()), 0.0);
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(classify_outcome(5.0, 5.0), Outcome::Confirmed);
        assert_eq!(classify_outcome(4.999, 5.0), Outcome::Disputed);
        assert_eq!(classify_outcome(10.0, 5.0), Outcome::Confirmed);
    }

    #[test]
    fn weight_clamps_out_of_range_credibility() {
        assert_eq!(weight(12.3), 10.0);
        assert_eq!(weight(-1.4), 0.0);
        assert_eq!(weight(f64::NAN), 0.0);
        assert_eq!(weight(7.5), 7.5);
    }

    #[test]
    fn over_trusted_voter_counts_as_fully_trusted() {
        let t = apply_vote(Tallies::default(), VoteDirection::Confirm, weight(10.5));
        assert_eq!(t, Tallies::new(10.0, 0.0));
    }

    #[test]
    fn settlement_amounts() {
        let policy = SettlementConfig::default();

        let win = settle(VoteDirection::Confirm, Outcome::Confirmed, &policy);
        assert_eq!(win.result, SettlementResult::Win);
        assert_eq!(win.score_delta, 10.0);
        assert_eq!(win.credibility_delta, 0.5);

        let loss = settle(VoteDirection::Dispute, Outcome::Confirmed, &policy);
        assert_eq!(loss.result, SettlementResult::Loss);
        assert_eq!(loss.score_delta, -5.0);
        assert_eq!(loss.credibility_delta, -0.2);

        let disputed_win = settle(VoteDirection::Dispute, Outcome::Disputed, &policy);
        assert_eq!(disputed_win.result, SettlementResult::Win);
    }

    proptest! {
        #[test]
        fn every_vote_adds_exactly_ten_units(
            st in 0.0f64..1_000.0,
            sf in 0.0f64..1_000.0,
            w in 0.0f64..=10.0,
            vote in arb_vote(),
        ) {
            let before = Tallies::new(st, sf);
            let after = apply_vote(before, vote, w);
            prop_assert!((after.total() - before.total() - 10.0).abs() < 1e-6);
            prop_assert!(after.score_true >= before.score_true);
            prop_assert!(after.score_false >= before.score_false);
        }

        #[test]
        fn credibility_is_bounded(st in 0.0f64..1e6, sf in 0.0f64..1e6) {
            let c = derive_credibility(&Tallies::new(st, sf));
            prop_assert!((0.0..=10.0).contains(&c));
        }

        #[test]
        fn credibility_monotone_in_score_true(
            st in 0.0f64..1e4,
            bump in 0.0f64..1e4,
            sf in 0.0f64..1e4,
        ) {
            let lo = derive_credibility(&Tallies::new(st, sf));
            let hi = derive_credibility(&Tallies::new(st + bump, sf));
            prop_assert!(hi + 1e-9 >= lo);
        }

        #[test]
        fn confirm_never_lowers_credibility(
            st in 0.0f64..1e3,
            sf in 0.0f64..1e3,
            w in 5.0f64..=10.0,
        ) {
            // A confirm from a voter at or above neutral weight pulls toward 10.
            let before = Tallies::new(st, sf);
            let after = apply_vote(before, VoteDirection::Confirm, w);
            if before.total() >= 1.0 && derive_credibility(&before) <= 5.0 {
                prop_assert!(derive_credibility(&after) + 1e-9 >= derive_credibility(&before));
            }
        }
    }
}
