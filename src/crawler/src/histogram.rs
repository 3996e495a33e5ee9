//! Exponentially bucketed histogram.
//!
//! Bucket 0 starts at `min_value`, bucket `i > 0` starts at
//! `min_value + base_bucket_size * (1 + growth_factor)^(i - 1)`. Values
//! outside the covered range are clamped into the first or last bucket.

use std::fmt::Write;

use common::config::HistogramOptions;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub low_bound: f64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub count: u64,
    pub sum: i64,
    pub sum_of_squares: f64,
    pub min: i64,
    pub max: i64,
    pub buckets: Vec<HistogramBucket>,
    #[serde(skip)]
    layout: Layout,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Layout {
    min_value: i64,
    base_bucket_size: f64,
    log_base_bucket_size: f64,
    one_over_log_one_plus_growth_factor: f64,
}

impl Histogram {
    pub fn new(options: &HistogramOptions) -> Self {
        let num_buckets = options.num_buckets.max(1);
        let base_bucket_size = if options.base_bucket_size > 0.0 {
            options.base_bucket_size
        } else {
            1.0
        };
        let growth_factor = if options.growth_factor > 0.0 {
            options.growth_factor
        } else {
            1.0
        };

        let mut buckets = Vec::with_capacity(num_buckets);
        let mut delta = base_bucket_size;
        buckets.push(HistogramBucket {
            low_bound: options.min_value as f64,
            count: 0,
        });
        for _ in 1..num_buckets {
            buckets.push(HistogramBucket {
                low_bound: options.min_value as f64 + delta,
                count: 0,
            });
            delta *= 1.0 + growth_factor;
        }

        Self {
            count: 0,
            sum: 0,
            sum_of_squares: 0.0,
            min: i64::MAX,
            max: i64::MIN,
            buckets,
            layout: Layout {
                min_value: options.min_value,
                base_bucket_size,
                log_base_bucket_size: base_bucket_size.ln(),
                one_over_log_one_plus_growth_factor: 1.0 / (1.0 + growth_factor).ln(),
            },
        }
    }

    pub fn add(&mut self, value: i64) {
        let index = self.bucket_index(value);
        self.buckets[index].count += 1;
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
        self.sum_of_squares += (value as f64) * (value as f64);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn bucket_index(&self, value: i64) -> usize {
        let last = self.buckets.len() - 1;
        let delta = (value as f64) - (self.layout.min_value as f64);
        if delta < self.layout.base_bucket_size {
            return 0;
        }

        let estimate = ((delta.ln() - self.layout.log_base_bucket_size)
            * self.layout.one_over_log_one_plus_growth_factor)
            .floor()
            + 1.0;
        let mut index = if estimate >= last as f64 {
            last
        } else {
            estimate.max(0.0) as usize
        };

        // Correct for rounding at bucket edges.
        let value = value as f64;
        if index > 0 && value < self.buckets[index].low_bound {
            index -= 1;
        } else if index < last && value >= self.buckets[index + 1].low_bound {
            index += 1;
        }
        index
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Text rendering with one row per bucket: bounds, count, percentage,
    /// cumulative percentage and a bar.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.count == 0 {
            let _ = writeln!(out, "Count: 0  Min: -  Max: -  Avg: -");
            let _ = writeln!(out, "{}", "-".repeat(60));
            return out;
        }

        let _ = writeln!(
            out,
            "Count: {}  Min: {}  Max: {}  Avg: {:.2}",
            self.count,
            self.min,
            self.max,
            self.mean()
        );
        let _ = writeln!(out, "{}", "-".repeat(60));

        let bound_width = self
            .buckets
            .iter()
            .map(|b| format!("{:.0}", b.low_bound).len())
            .max()
            .unwrap_or(3)
            .max(3);
        let count_width = self.count.to_string().len();
        let percent = 100.0 / self.count as f64;
        let mut accumulated = 0;

        for (i, bucket) in self.buckets.iter().enumerate() {
            accumulated += bucket.count;
            let upper = match self.buckets.get(i + 1) {
                Some(next) => format!("{:.0}", next.low_bound),
                None => "inf".to_string(),
            };
            let bar = (bucket.count as f64 * percent * 0.1 + 0.5) as usize;
            let _ = writeln!(
                out,
                "[{:>bw$.0}, {:>bw$})  {:>cw$}  {:5.1}%  {:5.1}%  {}",
                bucket.low_bound,
                upper,
                bucket.count,
                bucket.count as f64 * percent,
                accumulated as f64 * percent,
                "#".repeat(bar),
                bw = bound_width,
                cw = count_width,
            );
        }
        out
    }
}
