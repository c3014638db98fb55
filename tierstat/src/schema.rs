//! Span configuration for tierstat.
//!
//! A [`SpanSet`] defines the resolution hierarchy every metric record is
//! stored with. Span 0 is the finest resolution; each following span covers a
//! longer period with coarser buckets. Data ages out of a span into the next
//! one, so the set behaves like a chain of round-robin archives.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaError};

/// Seconds in a minute.
pub const MINUTE: u64 = 60;
/// Seconds in an hour.
pub const HOUR: u64 = 60 * MINUTE;
/// Seconds in a day.
pub const DAY: u64 = 24 * HOUR;
/// Seconds in a (non-leap) year.
pub const YEAR: u64 = 365 * DAY;

/// The default six-tier hierarchy.
///
/// | period | samples | interval |
/// |--------|---------|----------|
/// | 5 min  | 10      | 30 s     |
/// | 1 hr   | 12      | 5 min    |
/// | 1 day  | 12      | 2 hr     |
/// | 7 days | 14      | 12 hr    |
/// | 28 days| 14      | 2 days   |
/// | 1 yr   | 12      | ~1 month |
pub const DEFAULT_SPANS: [SpanConfig; 6] = [
    SpanConfig::const_new(5 * MINUTE, 10),
    SpanConfig::const_new(HOUR, 12),
    SpanConfig::const_new(DAY, 12),
    SpanConfig::const_new(7 * DAY, 14),
    SpanConfig::const_new(28 * DAY, 14),
    SpanConfig::const_new(YEAR, 12),
];

/// Configuration for a single resolution span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanConfig {
    /// Total seconds covered by the span.
    pub period: u64,

    /// Number of buckets the period is divided into.
    pub samples: u32,
}

impl SpanConfig {
    const fn const_new(period: u64, samples: u32) -> Self {
        Self { period, samples }
    }

    /// Creates a new span configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidSpan`] if the configuration is invalid.
    pub fn new(period: u64, samples: u32) -> Result<Self> {
        let config = Self { period, samples };
        config.validate(0)?;
        Ok(config)
    }

    /// Validates this span. `index` is only used for error reporting.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidSpan`] if validation fails.
    pub fn validate(&self, index: usize) -> Result<()> {
        let reason = if self.samples == 0 {
            Some("samples must be greater than zero".to_string())
        } else if self.period == 0 {
            Some("period must be greater than zero".to_string())
        } else if self.period < u64::from(self.samples) {
            Some(format!(
                "period ({}) must be >= samples ({})",
                self.period, self.samples
            ))
        } else if self.period % u64::from(self.samples) != 0 {
            Some(format!(
                "period ({}) must be a multiple of samples ({})",
                self.period, self.samples
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SchemaError::InvalidSpan { index, reason }.into()),
            None => Ok(()),
        }
    }

    /// Width of one bucket in seconds.
    pub fn interval(&self) -> u64 {
        self.period / u64::from(self.samples)
    }
}

/// Ordered, validated list of spans.
///
/// # Example
///
/// ```rust
/// use tierstat::schema::{SpanConfig, SpanSet};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let spans = SpanSet::new(vec![
///     SpanConfig::new(300, 10)?,   // 30s buckets for 5 minutes
///     SpanConfig::new(3600, 12)?,  // 5m buckets for an hour
/// ])?;
/// assert_eq!(spans.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<SpanConfig>", into = "Vec<SpanConfig>")]
pub struct SpanSet {
    spans: Vec<SpanConfig>,
}

impl SpanSet {
    /// Creates a span set from an ordered list of spans.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the list is empty, any span is invalid,
    /// or periods are not strictly ascending.
    pub fn new(spans: Vec<SpanConfig>) -> Result<Self> {
        let set = Self { spans };
        set.validate()?;
        Ok(set)
    }

    /// Validates the span set.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.spans.is_empty() {
            return Err(SchemaError::NoSpans.into());
        }

        for (index, span) in self.spans.iter().enumerate() {
            span.validate(index)?;
        }

        for window in self.spans.windows(2) {
            if window[0].period >= window[1].period {
                return Err(SchemaError::SpansNotOrdered.into());
            }
        }

        Ok(())
    }

    /// Returns the spans, finest first.
    pub fn spans(&self) -> &[SpanConfig] {
        &self.spans
    }

    /// Returns the number of spans.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Always `false`; a validated set has at least one span.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// The finest span.
    pub fn finest(&self) -> SpanConfig {
        self.spans[0]
    }

    /// The coarsest span.
    pub fn coarsest(&self) -> SpanConfig {
        self.spans[self.spans.len() - 1]
    }
}

impl Default for SpanSet {
    fn default() -> Self {
        Self {
            spans: DEFAULT_SPANS.to_vec(),
        }
    }
}

impl TryFrom<Vec<SpanConfig>> for SpanSet {
    type Error = crate::error::MetricsError;

    fn try_from(spans: Vec<SpanConfig>) -> Result<Self> {
        Self::new(spans)
    }
}

impl From<SpanSet> for Vec<SpanConfig> {
    fn from(set: SpanSet) -> Self {
        set.spans
    }
}
