//! Time bucketing: maps a granularity onto the store's truncation functions.

use crate::sql::{Expr, Identifier};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Alias every bucketed expression is materialized under.
pub const TIME_BUCKET: &str = "time_bucket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn truncation_function(self) -> &'static str {
        match self {
            Granularity::Minute => "toStartOfMinute",
            Granularity::Hour => "toStartOfHour",
            Granularity::Day => "toStartOfDay",
            Granularity::Week => "toStartOfWeek",
            Granularity::Month => "toStartOfMonth",
            Granularity::Quarter => "toStartOfQuarter",
            Granularity::Year => "toStartOfYear",
        }
    }
}

impl FromStr for Granularity {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            "year" => Ok(Granularity::Year),
            _ => Err(()),
        }
    }
}

/// Wraps `source` in the truncation for `granularity`. Unknown granularities
/// leave the expression untouched.
pub fn bucket(source: Expr, granularity: &str) -> Expr {
    match granularity.parse::<Granularity>() {
        Ok(granularity) => Expr::TimeBucket {
            source: Box::new(source),
            granularity,
        },
        Err(()) => source,
    }
}

pub fn bucket_column(column: &Identifier, granularity: &str) -> Expr {
    bucket(Expr::column(column), granularity)
}
