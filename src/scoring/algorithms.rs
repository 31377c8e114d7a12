//! Fittingness Algorithms
//!
//! Closed-form score components, the outlier-robust aggregation used by
//! both roles, and winner selection. The provider-side aggregation keeps
//! samples with signed z <= tau while the consumer-side aggregation keeps
//! |z| <= tau; the asymmetry is part of the protocol and must not be
//! "fixed" unilaterally.

use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;
use statrs::statistics::Statistics;

use crate::wire::{Ffs, ProviderInfo};

use super::AllFfs;

pub const ONE_DAY_MS: f64 = 86_400_000.0;

/// Guards z-score divisors when a sample column has zero variance
pub const EPS_TINY: f64 = 1e-9;

/// Uptime score from beacon history. Equals 0.5 when the peer was first
/// seen now, saturating toward 1/(1+e^-1/k) after one day of history.
pub fn uptime(t_initial_ms: i64, t_new_ms: i64, k: f64) -> f64 {
    let dividend = ((t_new_ms - t_initial_ms) as f64).min(ONE_DAY_MS);
    let exponent = -(dividend / (k * ONE_DAY_MS));
    1.0 / (1.0 + exponent.exp())
}

/// Load score from the advertised channel utilization rate in [0, 255]
pub fn load(channel_utilization_rate: u8, k: f64) -> f64 {
    let exponent = f64::from(channel_utilization_rate) / (k * 255.0);
    1.0 - 1.0 / (1.0 + exponent.exp())
}

/// Signal-strength score from the advertised RSSI in [0, 255]
pub fn signal_strength(rssi: u8, k: f64) -> f64 {
    let exponent = f64::from(rssi) / (k * 255.0);
    1.0 / (1.0 + exponent.exp())
}

/// Price fittingness of a peer's asking price against the consumer budget
pub fn price_fittingness(price_consumer: f64, price_provider: f64, epsilon: f64) -> f64 {
    ((1.0 - price_provider / price_consumer) + (epsilon - 1.0)) / epsilon
}

/// Speed fittingness of a peer's advertised speeds against the consumer
/// requirements. `delta` is declared by the protocol but both directions
/// use `mu`; peers rely on this when cross-checking scores.
pub fn speed_fittingness(
    uplink_consumer: f64,
    uplink_provider: f64,
    mu: f64,
    downlink_consumer: f64,
    downlink_provider: f64,
    _delta: f64,
) -> f64 {
    let up_ratio = (uplink_provider / uplink_consumer).powf(mu);
    let down_ratio = (downlink_provider / downlink_consumer).powf(mu);
    (up_ratio / (1.0 + up_ratio)) * (down_ratio / (1.0 + down_ratio))
}

/// Composite fittingness factor
pub fn fittingness_factor(
    pf: f64,
    sf: f64,
    uptime: f64,
    load: f64,
    strength: f64,
    feedback: f64,
) -> f64 {
    pf * sf * uptime * load * strength * feedback
}

/// Channel utilization advertised in beacons, saturating at 255
pub fn channel_utilization(active_flow_count: u32) -> u8 {
    active_flow_count.saturating_mul(25).min(255) as u8
}

/// Consumer rating of a completed flow, each direction capped at 1.0
pub fn consumer_rating(actual_uplink: f64, actual_downlink: f64, uplink_req: f64, downlink_req: f64) -> f64 {
    let uplink_rating = (actual_uplink / uplink_req).min(1.0);
    let downlink_rating = (actual_downlink / downlink_req).min(1.0);
    (uplink_rating + downlink_rating) / 2.0
}

fn robust_mean<F>(samples: &[f64], keep: F) -> f64
where
    F: Fn(f64) -> bool,
{
    if samples.is_empty() {
        return f64::NAN;
    }
    let mean = samples.iter().mean();
    let std_dev = samples.iter().population_std_dev();

    let survivors: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|x| keep((x - mean) / (std_dev + EPS_TINY)))
        .collect();
    if survivors.is_empty() {
        return f64::NAN;
    }
    survivors.iter().mean()
}

/// Provider-side robust mean: keeps samples with signed z <= tau
pub fn robust_mean_signed(samples: &[f64], tau: f64) -> f64 {
    robust_mean(samples, |z| z <= tau)
}

/// Consumer-side robust mean: keeps samples with |z| <= tau
pub fn robust_mean_abs(samples: &[f64], tau: f64) -> f64 {
    robust_mean(samples, |z| z.abs() <= tau)
}

/// Provider-side aggregation over a complete `allFFS`: for every target
/// except the scorer itself, the robust mean of all opinions about it.
pub fn ffs_new(all_ffs: &AllFfs, provider_list: &[ProviderInfo], self_id: &str, tau: f64) -> Ffs {
    let mut result = Ffs::new();
    for target in provider_list {
        if target.provider_id == self_id {
            continue;
        }
        let column: Vec<f64> = provider_list
            .iter()
            .filter_map(|scorer| all_ffs.get(&scorer.provider_id))
            .filter_map(|ffs| ffs.get(&target.provider_id))
            .copied()
            .collect();
        result.insert(target.provider_id.clone(), robust_mean_signed(&column, tau));
    }
    result
}

/// Consumer-side aggregation over all providers' FFSnew. Returns the final
/// score per target and the winner; NaN scores lose every comparison, ties
/// keep the earliest provider in list order.
pub fn ffs_final(all_ffs: &AllFfs, provider_list: &[ProviderInfo], tau: f64) -> (Ffs, Option<ProviderInfo>) {
    let mut result = Ffs::new();
    let mut winner: Option<ProviderInfo> = None;
    let mut highest = f64::NEG_INFINITY;

    for target in provider_list {
        let column: Vec<f64> = provider_list
            .iter()
            .filter(|scorer| scorer.provider_id != target.provider_id)
            .filter_map(|scorer| all_ffs.get(&scorer.provider_id))
            .filter_map(|ffs| ffs.get(&target.provider_id))
            .copied()
            .collect();
        let ff = robust_mean_abs(&column, tau);
        result.insert(target.provider_id.clone(), ff);

        if ff > highest {
            highest = ff;
            winner = Some(target.clone());
        }
    }

    (result, winner)
}

/// Draw from N(mean, std_dev) clamped to [lowest, highest]
pub fn clamped_normal<R: Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    std_dev: f64,
    lowest: f64,
    highest: f64,
) -> f64 {
    let value = match Normal::new(mean, std_dev) {
        Ok(normal) => normal.sample(rng),
        Err(_) => mean,
    };
    value.clamp(lowest, highest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> ProviderInfo {
        ProviderInfo {
            provider_id: id.to_string(),
            address: format!("127.0.0.1:{}", 9000),
            ..Default::default()
        }
    }

    #[test]
    fn test_uptime_first_beacon_is_half() {
        let now = 1_700_000_000_000;
        assert!((uptime(now, now, 0.5) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_uptime_saturates_after_one_day() {
        let t0 = 0;
        let one_day = ONE_DAY_MS as i64;
        let at_limit = uptime(t0, one_day, 0.5);
        let past_limit = uptime(t0, one_day * 3, 0.5);
        assert!((at_limit - past_limit).abs() < 1e-12);
        assert!(at_limit > 0.5);
    }

    #[test]
    fn test_price_fittingness_ranks_cheaper_higher() {
        // Budget 25, epsilon 2: asking 10 => 0.8, asking 20 => 0.6, asking 30 => 0.4
        assert!((price_fittingness(25.0, 10.0, 2.0) - 0.8).abs() < 1e-12);
        assert!((price_fittingness(25.0, 20.0, 2.0) - 0.6).abs() < 1e-12);
        assert!((price_fittingness(25.0, 30.0, 2.0) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_speed_fittingness_uses_mu_for_both_directions() {
        // With mu = 1 and provider speeds equal to requirements each factor is 1/2
        let sf = speed_fittingness(10.0, 10.0, 1.0, 20.0, 20.0, 7.0);
        assert!((sf - 0.25).abs() < 1e-12);
        // delta must not participate
        let sf_other_delta = speed_fittingness(10.0, 10.0, 1.0, 20.0, 20.0, 0.001);
        assert_eq!(sf, sf_other_delta);
    }

    #[test]
    fn test_channel_utilization_saturates() {
        assert_eq!(channel_utilization(0), 0);
        assert_eq!(channel_utilization(4), 100);
        assert_eq!(channel_utilization(11), 255);
        assert_eq!(channel_utilization(1000), 255);
    }

    #[test]
    fn test_consumer_rating_caps_each_direction() {
        let rating = consumer_rating(50.0, 200.0, 100.0, 100.0);
        assert!((rating - 0.75).abs() < 1e-12);
        assert!((consumer_rating(500.0, 500.0, 100.0, 100.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_robust_mean_excludes_high_outlier() {
        // Mean-pulling outlier lands above tau in both filters
        let samples = [1.0, 1.1, 0.9, 1.0, 100.0];
        let signed = robust_mean_signed(&samples, 1.5);
        let abs = robust_mean_abs(&samples, 1.5);
        assert!((signed - 1.0).abs() < 0.01);
        assert!((abs - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_filter_asymmetry_on_low_outlier() {
        // A deep negative outlier has z << -tau: the signed filter keeps it,
        // the absolute filter drops it.
        let samples = [1.0, 1.1, 0.9, 1.0, -100.0];
        let signed = robust_mean_signed(&samples, 1.5);
        let abs = robust_mean_abs(&samples, 1.5);
        assert!(signed < -15.0);
        assert!((abs - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_robust_mean_empty_is_nan() {
        assert!(robust_mean_signed(&[], 2.0).is_nan());
        assert!(robust_mean_abs(&[], 2.0).is_nan());
    }

    #[test]
    fn test_ffs_final_excludes_self_opinion_and_picks_argmax() {
        let providers = vec![provider("a"), provider("b"), provider("c")];
        let mut all_ffs = AllFfs::new();
        all_ffs.insert(
            "a".to_string(),
            Ffs::from([("b".to_string(), 0.6), ("c".to_string(), 0.2)]),
        );
        all_ffs.insert(
            "b".to_string(),
            Ffs::from([("a".to_string(), 0.9), ("c".to_string(), 0.3)]),
        );
        all_ffs.insert(
            "c".to_string(),
            Ffs::from([("a".to_string(), 0.8), ("b".to_string(), 0.5)]),
        );

        let (ffs, winner) = ffs_final(&all_ffs, &providers, 2.0);
        assert_eq!(winner.unwrap().provider_id, "a");
        assert!((ffs["a"] - 0.85).abs() < 1e-12);
        assert!((ffs["b"] - 0.55).abs() < 1e-12);
        assert!((ffs["c"] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_ffs_final_tie_break_keeps_list_order() {
        let providers = vec![provider("a"), provider("b")];
        let mut all_ffs = AllFfs::new();
        all_ffs.insert("a".to_string(), Ffs::from([("b".to_string(), 0.5)]));
        all_ffs.insert("b".to_string(), Ffs::from([("a".to_string(), 0.5)]));

        let (_, winner) = ffs_final(&all_ffs, &providers, 2.0);
        assert_eq!(winner.unwrap().provider_id, "a");
    }

    #[test]
    fn test_ffs_final_ignores_nan_columns() {
        let providers = vec![provider("a"), provider("b")];
        // Nobody scored "a", so its column is empty and yields NaN
        let mut all_ffs = AllFfs::new();
        all_ffs.insert("a".to_string(), Ffs::from([("b".to_string(), 0.4)]));

        let (ffs, winner) = ffs_final(&all_ffs, &providers, 2.0);
        assert!(ffs["a"].is_nan());
        assert_eq!(winner.unwrap().provider_id, "b");
    }

    #[test]
    fn test_ffs_new_excludes_self_as_target() {
        let providers = vec![provider("a"), provider("b"), provider("c")];
        let mut all_ffs = AllFfs::new();
        all_ffs.insert(
            "a".to_string(),
            Ffs::from([("b".to_string(), 0.5), ("c".to_string(), 0.5)]),
        );
        all_ffs.insert(
            "b".to_string(),
            Ffs::from([("a".to_string(), 0.7), ("c".to_string(), 0.5)]),
        );
        all_ffs.insert(
            "c".to_string(),
            Ffs::from([("a".to_string(), 0.7), ("b".to_string(), 0.5)]),
        );

        let result = ffs_new(&all_ffs, &providers, "a", 2.0);
        assert!(!result.contains_key("a"));
        assert!((result["b"] - 0.5).abs() < 1e-12);
        assert!((result["c"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_outlier_scorer_filtered_per_target() {
        // Scenario: d reports a wildly off opinion about a; its opinions on
        // b stay within tau and survive.
        let providers = vec![provider("a"), provider("b"), provider("c"), provider("d")];
        let mut all_ffs = AllFfs::new();
        all_ffs.insert(
            "a".to_string(),
            Ffs::from([("b".to_string(), 0.50), ("c".to_string(), 0.40), ("d".to_string(), 0.30)]),
        );
        all_ffs.insert(
            "b".to_string(),
            Ffs::from([("a".to_string(), 0.60), ("c".to_string(), 0.41), ("d".to_string(), 0.31)]),
        );
        all_ffs.insert(
            "c".to_string(),
            Ffs::from([("a".to_string(), 0.61), ("b".to_string(), 0.51), ("d".to_string(), 0.29)]),
        );
        all_ffs.insert(
            "d".to_string(),
            Ffs::from([("a".to_string(), 99.0), ("b".to_string(), 0.52), ("c".to_string(), 0.39)]),
        );

        let (ffs, _) = ffs_final(&all_ffs, &providers, 1.4);
        // d's 99.0 is excluded from a's column; survivors average 0.605
        assert!((ffs["a"] - 0.605).abs() < 1e-9);
        // d's 0.52 survives in b's column
        assert!((ffs["b"] - (0.50 + 0.51 + 0.52) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamped_normal_respects_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let v = clamped_normal(&mut rng, 10.0, 50.0, 0.0, 20.0);
            assert!((0.0..=20.0).contains(&v));
        }
        // Degenerate std dev falls back to the mean
        assert_eq!(clamped_normal(&mut rng, 5.0, 0.0, 0.0, 10.0), 5.0);
    }
}
