//! Fitness scoring shared by the strategy and skill layers.

use std::collections::HashMap;
use tracing::debug;

/// Raw performance metrics supplied by the orchestrator.
///
/// Recognised keys are the `METRIC_*` constants; anything else is ignored
/// and absent keys count as zero.
pub type Metrics = HashMap<String, f64>;

pub const METRIC_SUCCESS_RATE: &str = "successRate";
pub const METRIC_COST_USD: &str = "costUSD";
pub const METRIC_AVG_RESPONSE_MS: &str = "avgResponseMs";
pub const METRIC_PROFIT_LOSS: &str = "profitLoss";

/// Default smoothing factor for folding new observations into stored fitness.
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

fn metric(metrics: &Metrics, key: &str) -> f64 {
    metrics.get(key).copied().unwrap_or(0.0)
}

/// Calculate a fitness score from metrics (higher is better).
///
/// Weighted fitness function:
/// - 40% success rate
/// - 20% cost efficiency, `1 / (1 + costUSD)`
/// - 10% speed, `1 / (1 + avgResponseMs / 1000)`
/// - 30% profit, `max(0, profitLoss + 1)`
pub fn compute_fitness(metrics: &Metrics) -> f64 {
    let success_rate = metric(metrics, METRIC_SUCCESS_RATE);
    let cost_efficiency = 1.0 / (1.0 + metric(metrics, METRIC_COST_USD));
    let speed_score = 1.0 / (1.0 + metric(metrics, METRIC_AVG_RESPONSE_MS) / 1000.0);
    let profit_score = (metric(metrics, METRIC_PROFIT_LOSS) + 1.0).max(0.0);

    let fitness =
        0.4 * success_rate + 0.2 * cost_efficiency + 0.1 * speed_score + 0.3 * profit_score;

    debug!(
        success_rate,
        cost_efficiency, speed_score, profit_score, fitness, "computed fitness"
    );

    fitness
}

/// Fold `observation` into `current` with an exponential moving average.
/// The first observation replaces the current value outright.
pub fn fold_ema(current: f64, observation: f64, alpha: f64, first: bool) -> f64 {
    if first {
        observation
    } else {
        alpha * observation + (1.0 - alpha) * current
    }
}
