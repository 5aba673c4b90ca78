use maxx_common::UsageTotals;

use crate::router::wildcard_match;

/// Converts token counts into cost. Injected into the engine so accounting
/// never depends on a concrete table.
pub trait PriceCalculator: Send + Sync {
    /// Cost in micro-USD.
    fn cost_micro_usd(&self, model: &str, usage: &UsageTotals) -> i64;
}

#[derive(Debug, Clone)]
pub struct ModelPrice {
    pub pattern: String,
    /// Micro-USD per million input tokens.
    pub input_per_mtok: i64,
    pub output_per_mtok: i64,
    pub cache_read_per_mtok: i64,
}

/// First matching pattern wins; unknown models cost nothing so accounting
/// never fails a request.
pub struct StaticPriceTable {
    rows: Vec<ModelPrice>,
}

impl Default for StaticPriceTable {
    fn default() -> Self {
        fn usd(dollars: f64) -> i64 {
            (dollars * 1_000_000.0) as i64
        }
        Self {
            rows: vec![
                ModelPrice {
                    pattern: "*opus*".to_string(),
                    input_per_mtok: usd(15.0),
                    output_per_mtok: usd(75.0),
                    cache_read_per_mtok: usd(1.5),
                },
                ModelPrice {
                    pattern: "*haiku*".to_string(),
                    input_per_mtok: usd(1.0),
                    output_per_mtok: usd(5.0),
                    cache_read_per_mtok: usd(0.1),
                },
                ModelPrice {
                    pattern: "claude-*".to_string(),
                    input_per_mtok: usd(3.0),
                    output_per_mtok: usd(15.0),
                    cache_read_per_mtok: usd(0.3),
                },
                ModelPrice {
                    pattern: "gemini-2.5-pro*".to_string(),
                    input_per_mtok: usd(1.25),
                    output_per_mtok: usd(10.0),
                    cache_read_per_mtok: usd(0.31),
                },
                ModelPrice {
                    pattern: "gemini-2.5-flash*".to_string(),
                    input_per_mtok: usd(0.30),
                    output_per_mtok: usd(2.50),
                    cache_read_per_mtok: usd(0.075),
                },
                ModelPrice {
                    pattern: "gemini-3-*".to_string(),
                    input_per_mtok: usd(2.0),
                    output_per_mtok: usd(12.0),
                    cache_read_per_mtok: usd(0.5),
                },
            ],
        }
    }
}

impl StaticPriceTable {
    pub fn new(rows: Vec<ModelPrice>) -> Self {
        Self { rows }
    }
}

impl PriceCalculator for StaticPriceTable {
    fn cost_micro_usd(&self, model: &str, usage: &UsageTotals) -> i64 {
        let Some(price) = self
            .rows
            .iter()
            .find(|row| wildcard_match(&row.pattern, model))
        else {
            return 0;
        };
        per_mtok(usage.input_tokens, price.input_per_mtok)
            + per_mtok(usage.output_tokens, price.output_per_mtok)
            + per_mtok(usage.cache_read_input_tokens, price.cache_read_per_mtok)
    }
}

fn per_mtok(tokens: u64, price_micro: i64) -> i64 {
    ((tokens as i128 * price_micro as i128) / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_costs_scale_with_tokens() {
        let table = StaticPriceTable::default();
        let usage = UsageTotals {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
        };
        // $3 in + $15 out.
        assert_eq!(table.cost_micro_usd("claude-sonnet-4-5", &usage), 18_000_000);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let table = StaticPriceTable::default();
        let usage = UsageTotals {
            input_tokens: 1000,
            output_tokens: 1000,
            ..Default::default()
        };
        assert_eq!(table.cost_micro_usd("unknown-model", &usage), 0);
    }

    #[test]
    fn opus_pattern_wins_over_claude_prefix() {
        let table = StaticPriceTable::default();
        let usage = UsageTotals {
            input_tokens: 1_000_000,
            ..Default::default()
        };
        assert_eq!(table.cost_micro_usd("claude-opus-4-5", &usage), 15_000_000);
    }
}
