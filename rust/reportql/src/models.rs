//! Request/response shapes shared by the data and report services.

use crate::sql::BindParam;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::{fmt, str::FromStr};

pub use crate::sql::{AggregationFunction, Logic, SortOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    ILike,
    Between,
    IsNull,
    IsNotNull,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
            FilterOperator::Like => "like",
            FilterOperator::ILike => "ilike",
            FilterOperator::Between => "between",
            FilterOperator::IsNull => "is_null",
            FilterOperator::IsNotNull => "is_not_null",
        };
        f.write_str(name)
    }
}

impl FromStr for FilterOperator {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let op = match raw.trim().to_ascii_lowercase().as_str() {
            "eq" | "=" => FilterOperator::Eq,
            "neq" | "ne" | "!=" => FilterOperator::Neq,
            "gt" | ">" => FilterOperator::Gt,
            "gte" | ">=" => FilterOperator::Gte,
            "lt" | "<" => FilterOperator::Lt,
            "lte" | "<=" => FilterOperator::Lte,
            "in" => FilterOperator::In,
            "not_in" => FilterOperator::NotIn,
            "like" => FilterOperator::Like,
            "ilike" => FilterOperator::ILike,
            "between" => FilterOperator::Between,
            "is_null" => FilterOperator::IsNull,
            "is_not_null" => FilterOperator::IsNotNull,
            _ => return Err(format!("unsupported filter operator '{raw}'")),
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<BindParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<BindParam>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
    #[serde(default)]
    pub logic: Logic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnAggregation {
    pub column: String,
    pub function: AggregationFunction,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ColumnAggregation {
    /// Explicit alias, or `{function}_{column}`.
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.function, self.column))
    }
}

/// Column metadata attached to row results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    #[default]
    Line,
    Bar,
    Pie,
    Area,
    Scatter,
    Heatmap,
    Timeline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub x: serde_json::Value,
    pub y: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub name: String,
    pub data: Vec<ChartPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn filter_set_accepts_upper_case_wire_values() {
        let set: FilterSet = serde_json::from_value(json!({
            "conditions": [
                {"field": "year", "operator": "EQ", "value": 2024},
                {"field": "territory", "operator": "not_in", "values": ["North"]}
            ],
            "logic": "OR"
        }))
        .unwrap();

        assert_eq!(set.logic, Logic::Or);
        assert_eq!(set.conditions[0].operator, FilterOperator::Eq);
        assert_eq!(set.conditions[0].value, Some(BindParam::Int(2024)));
        assert_eq!(set.conditions[1].operator, FilterOperator::NotIn);
    }

    #[test]
    fn unknown_operator_is_a_decode_error() {
        let err = serde_json::from_value::<FilterCondition>(json!({
            "field": "year",
            "operator": "regex",
            "value": "x"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unsupported filter operator"));
    }

    #[test]
    fn aggregation_alias_defaults_to_function_and_column() {
        let agg: ColumnAggregation =
            serde_json::from_value(json!({"column": "value", "function": "sum"})).unwrap();
        assert_eq!(agg.output_name(), "sum_value");

        let agg: ColumnAggregation = serde_json::from_value(
            json!({"column": "value", "function": "percentile_95", "alias": "p95"}),
        )
        .unwrap();
        assert_eq!(agg.output_name(), "p95");
    }
}
