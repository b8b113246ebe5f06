//! Tiered price computation.
//!
//! All amounts are minor units (cents). Integer arithmetic keeps quotes
//! stable across platforms.

use crate::error::BrokerError;
use crate::types::{PricingBreakdown, RateConfig, RateSource, UrgencyLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Words above the top bucket use the top bucket's price.
pub const MAX_TABLE_WORDS: u32 = 20_000;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBucket {
    pub max_words: u32,
    pub price_minor: i64,
}

/// Root/default price card used when no ancestor owns a custom tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    pub buckets: Vec<PriceBucket>,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            buckets: vec![
                PriceBucket { max_words: 500, price_minor: 4_500 },
                PriceBucket { max_words: 1_000, price_minor: 5_500 },
                PriceBucket { max_words: 1_500, price_minor: 6_500 },
                PriceBucket { max_words: 2_000, price_minor: 7_500 },
                PriceBucket { max_words: 3_000, price_minor: 9_000 },
                PriceBucket { max_words: 4_000, price_minor: 10_500 },
                PriceBucket { max_words: 5_000, price_minor: 12_000 },
                PriceBucket { max_words: 7_500, price_minor: 15_000 },
                PriceBucket { max_words: 10_000, price_minor: 18_500 },
                PriceBucket { max_words: 15_000, price_minor: 24_000 },
                PriceBucket { max_words: 20_000, price_minor: 30_000 },
            ],
        }
    }
}

impl PriceTable {
    /// Bucket lookup. Zero for nonpositive counts, top bucket price above
    /// the table cap.
    pub fn price_for(&self, word_count: u32) -> i64 {
        if word_count == 0 {
            return 0;
        }
        for bucket in &self.buckets {
            if word_count <= bucket.max_words {
                return bucket.price_minor;
            }
        }
        self.buckets.last().map(|b| b.price_minor).unwrap_or(0)
    }
}

/// `ceil(word_count / 500)`.
pub fn word_units(word_count: u32) -> i64 {
    (i64::from(word_count) + 499) / 500
}

/// Deadline-distance surcharge table, keyed by `ceil((deadline - now)/1 day)`.
/// A deadline already in the past counts as rush.
pub fn urgency_for(deadline: DateTime<Utc>, now: DateTime<Utc>) -> (i64, UrgencyLevel) {
    let seconds = (deadline - now).num_seconds();
    let days = if seconds <= 0 {
        0
    } else {
        (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    };

    match days {
        d if d <= 1 => (3_000, UrgencyLevel::Rush),
        2 => (1_000, UrgencyLevel::Urgent),
        d if d <= 6 => (500, UrgencyLevel::Moderate),
        _ => (0, UrgencyLevel::Normal),
    }
}

/// Validate a rate config's ranges and percentage bounds.
pub fn validate_rate_config(config: &RateConfig) -> Result<(), BrokerError> {
    if config.min_words == 0 {
        return Err(BrokerError::rate_invalid("min_words must be positive"));
    }
    if config.min_words > config.max_words {
        return Err(BrokerError::rate_invalid(format!(
            "min_words {} exceeds max_words {}",
            config.min_words, config.max_words
        )));
    }
    if config.rate_per_500_minor <= 0 {
        return Err(BrokerError::rate_invalid("rate_per_500 must be positive"));
    }
    if config.issuer_fee_percent > 100 {
        return Err(BrokerError::rate_invalid(format!(
            "issuer_fee_percent {} exceeds 100",
            config.issuer_fee_percent
        )));
    }
    Ok(())
}

/// Compute a quote under the resolved tier.
///
/// `rate` is the nearest-ancestor custom tier when one governs the client;
/// `None` falls back to the default price table, which has no range limit
/// below the table cap.
pub fn quote(
    rate: Option<&RateConfig>,
    table: &PriceTable,
    word_count: u32,
    deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PricingBreakdown, BrokerError> {
    let (base_cost_minor, rate_source) = match rate {
        Some(config) => {
            if word_count < config.min_words || word_count > config.max_words {
                return Err(BrokerError::WordCountOutOfRange {
                    words: word_count,
                    min: config.min_words,
                    max: config.max_words,
                });
            }
            (
                word_units(word_count) * config.rate_per_500_minor,
                RateSource::Custom {
                    issuer_id: config.issuer_id,
                    rate_per_500_minor: config.rate_per_500_minor,
                    issuer_fee_percent: config.issuer_fee_percent,
                },
            )
        }
        None => (table.price_for(word_count), RateSource::DefaultTable),
    };

    let (urgency_surcharge_minor, urgency) = urgency_for(deadline, now);

    Ok(PricingBreakdown {
        base_cost_minor,
        urgency_surcharge_minor,
        total_minor: base_cost_minor + urgency_surcharge_minor,
        urgency,
        rate_source,
    })
}
