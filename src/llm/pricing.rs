//! Per-backend pricing and cost calculation.
//!
//! Rates are USD per 1K tokens, one pair per capability class:
//!
//! fast:      input=$0.0001,  output=$0.0004
//! reasoning: input=$0.00055, output=$0.00219
//! math:      input=$0.0011,  output=$0.0044
//! cfo:       input=$0.015,   output=$0.075

use crate::models::ModelAccess;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

pub fn rate_for(access: ModelAccess) -> ModelRate {
    match access {
        ModelAccess::Fast => ModelRate {
            input_per_1k: 0.0001,
            output_per_1k: 0.0004,
        },
        ModelAccess::Reasoning => ModelRate {
            input_per_1k: 0.00055,
            output_per_1k: 0.00219,
        },
        ModelAccess::Math => ModelRate {
            input_per_1k: 0.0011,
            output_per_1k: 0.0044,
        },
        ModelAccess::Cfo => ModelRate {
            input_per_1k: 0.015,
            output_per_1k: 0.075,
        },
    }
}

/// (tokens_in / 1000) * input rate + (tokens_out / 1000) * output rate
pub fn calculate_cost(access: ModelAccess, tokens_in: u32, tokens_out: u32) -> f64 {
    let rate = rate_for(access);
    (tokens_in as f64 / 1000.0) * rate.input_per_1k + (tokens_out as f64 / 1000.0) * rate.output_per_1k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_cost() {
        let cost = calculate_cost(ModelAccess::Fast, 1000, 1000);
        assert!((cost - 0.0005).abs() < 1e-12);
    }

    #[test]
    fn test_zero_tokens_cost_nothing() {
        for access in ModelAccess::ALL {
            assert_eq!(calculate_cost(access, 0, 0), 0.0);
        }
    }

    #[test]
    fn test_cost_follows_capability_order() {
        let costs: Vec<f64> = ModelAccess::ALL
            .iter()
            .map(|a| calculate_cost(*a, 2000, 500))
            .collect();
        assert!(costs.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
