//! Pricing table and token estimation for budget accounting.
//!
//! Estimates are deliberately coarse: the orchestrator only needs to decide
//! whether a pass would blow through a USD cap, not to produce an invoice.
//! Tokens are approximated at four characters per token over the bounded
//! diff; prices are USD per million tokens.

use crate::provider::ProviderKind;

/// Rough chars-per-token heuristic used for diff-based estimates.
pub const CHARS_PER_TOKEN: u64 = 4;

/// USD price per million tokens, split by direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Known model prices. Unknown paid models fall back to the most expensive
/// entry of their provider so budget checks stay conservative.
const PRICES: &[(&str, ModelPrice)] = &[
    (
        "claude-sonnet-4-5",
        ModelPrice {
            input_per_mtok: 3.00,
            output_per_mtok: 15.00,
        },
    ),
    (
        "claude-haiku-4-5",
        ModelPrice {
            input_per_mtok: 1.00,
            output_per_mtok: 5.00,
        },
    ),
    (
        "gpt-4o",
        ModelPrice {
            input_per_mtok: 2.50,
            output_per_mtok: 10.00,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPrice {
            input_per_mtok: 0.15,
            output_per_mtok: 0.60,
        },
    ),
];

const CONSERVATIVE_ANTHROPIC: ModelPrice = ModelPrice {
    input_per_mtok: 3.00,
    output_per_mtok: 15.00,
};
const CONSERVATIVE_OPENAI: ModelPrice = ModelPrice {
    input_per_mtok: 2.50,
    output_per_mtok: 10.00,
};

/// Estimate tokens from a character count.
pub fn estimate_tokens(chars: u64) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Look up the price for a provider/model pair. Local models are free.
pub fn price_for(kind: ProviderKind, model: &str) -> ModelPrice {
    if kind == ProviderKind::Ollama {
        return ModelPrice {
            input_per_mtok: 0.0,
            output_per_mtok: 0.0,
        };
    }
    let m = model.to_ascii_lowercase();
    for (name, price) in PRICES {
        if m.starts_with(name) {
            return *price;
        }
    }
    match kind {
        ProviderKind::Anthropic => CONSERVATIVE_ANTHROPIC,
        _ => CONSERVATIVE_OPENAI,
    }
}

/// Estimate the USD cost of a call given input tokens and an expected
/// output allowance.
pub fn estimate_cost_usd(
    kind: ProviderKind,
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
) -> f64 {
    let price = price_for(kind, model);
    (input_tokens as f64 / 1_000_000.0) * price.input_per_mtok
        + (output_tokens as f64 / 1_000_000.0) * price.output_per_mtok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
    }

    #[test]
    fn ollama_is_free() {
        let c = estimate_cost_usd(ProviderKind::Ollama, "qwen2.5-coder:7b", 1_000_000, 100_000);
        assert_eq!(c, 0.0);
    }

    #[test]
    fn unknown_paid_model_uses_conservative_price() {
        let p = price_for(ProviderKind::Anthropic, "claude-new-frontier");
        assert_eq!(p, CONSERVATIVE_ANTHROPIC);
    }

    #[test]
    fn known_model_prefix_matches() {
        let p = price_for(ProviderKind::OpenAi, "gpt-4o-mini-2024-07-18");
        assert_eq!(p.input_per_mtok, 0.15);
    }
}
