use super::{ident::Identifier, value::BindParam, Params};
use crate::{
    error::{Result, ServiceError},
    time::Granularity,
};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    #[serde(alias = "AND", alias = "And")]
    And,
    #[serde(alias = "OR", alias = "Or")]
    Or,
}

impl Logic {
    fn keyword(self) -> &'static str {
        match self {
            Logic::And => " AND ",
            Logic::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    #[serde(alias = "ASC", alias = "Asc")]
    Asc,
    #[serde(alias = "DESC", alias = "Desc")]
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

/// Aggregate functions callers may request. `percentile_K` takes K in 1..=99.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum AggregationFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    DistinctCount,
    Median,
    Percentile(u8),
}

impl AggregationFunction {
    fn render_call(self, argument: &str) -> String {
        match self {
            AggregationFunction::Count => format!("count({argument})"),
            AggregationFunction::Sum => format!("sum({argument})"),
            AggregationFunction::Avg => format!("avg({argument})"),
            AggregationFunction::Min => format!("min({argument})"),
            AggregationFunction::Max => format!("max({argument})"),
            AggregationFunction::DistinctCount => format!("uniqExact({argument})"),
            AggregationFunction::Median => format!("median({argument})"),
            AggregationFunction::Percentile(k) => {
                format!("quantile({})({argument})", f64::from(k) / 100.0)
            }
        }
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationFunction::Count => f.write_str("count"),
            AggregationFunction::Sum => f.write_str("sum"),
            AggregationFunction::Avg => f.write_str("avg"),
            AggregationFunction::Min => f.write_str("min"),
            AggregationFunction::Max => f.write_str("max"),
            AggregationFunction::DistinctCount => f.write_str("distinct_count"),
            AggregationFunction::Median => f.write_str("median"),
            AggregationFunction::Percentile(k) => write!(f, "percentile_{k}"),
        }
    }
}

impl FromStr for AggregationFunction {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = raw.trim().to_ascii_lowercase();
        let function = match lowered.as_str() {
            "count" => AggregationFunction::Count,
            "sum" => AggregationFunction::Sum,
            "avg" | "mean" => AggregationFunction::Avg,
            "min" => AggregationFunction::Min,
            "max" => AggregationFunction::Max,
            "distinct_count" | "uniqexact" | "count_distinct" => {
                AggregationFunction::DistinctCount
            }
            "median" => AggregationFunction::Median,
            other => {
                let percentile = other
                    .strip_prefix("percentile_")
                    .and_then(|k| k.parse::<u8>().ok())
                    .filter(|k| (1..=99).contains(k));
                match percentile {
                    Some(k) => AggregationFunction::Percentile(k),
                    None => return Err(format!("unsupported aggregation function '{raw}'")),
                }
            }
        };
        Ok(function)
    }
}

/// A value expression. Only validated identifiers and engine-owned function
/// names reach the rendered text.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(Identifier),
    TimeBucket {
        source: Box<Expr>,
        granularity: Granularity,
    },
    /// First day of the month built from separate year and month columns.
    PeriodDate {
        year: Identifier,
        month: Identifier,
    },
    Aggregate {
        function: AggregationFunction,
        argument: Box<Expr>,
    },
    CountAll,
}

impl Expr {
    pub fn column(ident: &Identifier) -> Self {
        Expr::Column(ident.clone())
    }

    pub fn aggregate(function: AggregationFunction, argument: Expr) -> Self {
        Expr::Aggregate {
            function,
            argument: Box::new(argument),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Expr::Column(ident) => ident.render(),
            Expr::TimeBucket {
                source,
                granularity,
            } => format!("{}({})", granularity.truncation_function(), source.render()),
            Expr::PeriodDate { year, month } => {
                format!("makeDate({}, {}, 1)", year.render(), month.render())
            }
            Expr::Aggregate { function, argument } => function.render_call(&argument.render()),
            Expr::CountAll => "count()".to_string(),
        }
    }

    /// Source columns this expression reads.
    pub fn columns<'a>(&'a self, out: &mut Vec<&'a Identifier>) {
        match self {
            Expr::Column(ident) => out.push(ident),
            Expr::TimeBucket { source, .. } => source.columns(out),
            Expr::PeriodDate { year, month } => {
                out.push(year);
                out.push(month);
            }
            Expr::Aggregate { argument, .. } => argument.columns(out),
            Expr::CountAll => {}
        }
    }
}

/// A named bind value. Names are generated by the engine, never by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: BindParam,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<BindParam>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn placeholder(&self) -> String {
        format!(":{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        expr: Expr,
        op: CompareOp,
        param: Param,
    },
    InList {
        expr: Expr,
        negated: bool,
        param: Param,
    },
    Like {
        expr: Expr,
        param: Param,
    },
    ILike {
        expr: Expr,
        param: Param,
    },
    Between {
        expr: Expr,
        min: Param,
        max: Param,
    },
    IsNull {
        expr: Expr,
        negated: bool,
    },
    StartsWith {
        expr: Expr,
        param: Param,
    },
    Group {
        logic: Logic,
        clauses: Vec<Predicate>,
    },
}

impl Predicate {
    /// Joins clauses under `logic`; `None` when there is nothing to filter on.
    pub fn group(logic: Logic, clauses: Vec<Predicate>) -> Option<Predicate> {
        if clauses.is_empty() {
            None
        } else {
            Some(Predicate::Group { logic, clauses })
        }
    }

    /// Source columns referenced anywhere in the predicate.
    pub fn columns<'a>(&'a self, out: &mut Vec<&'a Identifier>) {
        match self {
            Predicate::Compare { expr, .. }
            | Predicate::InList { expr, .. }
            | Predicate::Like { expr, .. }
            | Predicate::ILike { expr, .. }
            | Predicate::Between { expr, .. }
            | Predicate::IsNull { expr, .. }
            | Predicate::StartsWith { expr, .. } => expr.columns(out),
            Predicate::Group { clauses, .. } => {
                for clause in clauses {
                    clause.columns(out);
                }
            }
        }
    }

    /// Number of top-level clauses.
    pub fn clause_count(&self) -> usize {
        match self {
            Predicate::Group { clauses, .. } => clauses.len(),
            _ => 1,
        }
    }

    pub fn render(&self, params: &mut Params) -> Result<String> {
        let text = match self {
            Predicate::Compare { expr, op, param } => {
                let slot = params.bind(param)?;
                format!("{} {} {slot}", expr.render(), op.symbol())
            }
            Predicate::InList {
                expr,
                negated,
                param,
            } => {
                let slot = params.bind(param)?;
                let keyword = if *negated { "NOT IN" } else { "IN" };
                format!("{} {keyword} {slot}", expr.render())
            }
            Predicate::Like { expr, param } => {
                let slot = params.bind(param)?;
                format!("{} LIKE {slot}", expr.render())
            }
            Predicate::ILike { expr, param } => {
                let slot = params.bind(param)?;
                format!("lower({}) LIKE lower({slot})", expr.render())
            }
            Predicate::Between { expr, min, max } => {
                let min = params.bind(min)?;
                let max = params.bind(max)?;
                format!("{} BETWEEN {min} AND {max}", expr.render())
            }
            Predicate::IsNull { expr, negated } => {
                let keyword = if *negated { "IS NOT NULL" } else { "IS NULL" };
                format!("{} {keyword}", expr.render())
            }
            Predicate::StartsWith { expr, param } => {
                let slot = params.bind(param)?;
                format!("startsWith({}, {slot})", expr.render())
            }
            Predicate::Group { logic, clauses } => {
                if clauses.is_empty() {
                    return Err(ServiceError::Internal(anyhow::anyhow!(
                        "empty predicate group"
                    )));
                }
                let rendered = clauses
                    .iter()
                    .map(|clause| clause.render(params).map(|text| format!("({text})")))
                    .collect::<Result<Vec<_>>>()?;
                rendered.join(logic.keyword())
            }
        };
        Ok(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub order: SortOrder,
}

impl OrderBy {
    pub fn render(&self) -> String {
        format!("{} {}", self.expr.render(), self.order.keyword())
    }
}
