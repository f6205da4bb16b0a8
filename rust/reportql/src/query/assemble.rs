//! Query assembler: row + count, aggregation, chart and export statements.

use crate::{
    error::{Result, ServiceError},
    models::{ColumnAggregation, SortSpec},
    pagination::page_offset,
    sql::{
        redact, AggregationFunction, Expr, Identifier, Predicate, Sanitizer, Select, SortOrder,
        Source, Statement,
    },
    time::TIME_BUCKET,
};

pub const TOTAL_ALIAS: &str = "total";

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: Identifier,
    pub order: SortOrder,
}

pub fn resolve_sort(sanitizer: &Sanitizer, sort: &[SortSpec]) -> Result<Vec<SortKey>> {
    sort.iter()
        .map(|spec| {
            Ok(SortKey {
                column: sanitizer.column(&spec.field)?,
                order: spec.order,
            })
        })
        .collect()
}

/// Source, projection, filter and ordering shared by row, count and export statements.
#[derive(Debug, Clone)]
pub struct QueryEnvelope {
    pub source: Source,
    /// Empty means every column.
    pub columns: Vec<Identifier>,
    pub filter: Option<Predicate>,
    pub sort: Vec<SortKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PagedStatements {
    pub rows: Statement,
    pub count: Statement,
}

impl QueryEnvelope {
    fn projected(&self) -> Select {
        let select = self
            .columns
            .iter()
            .fold(Select::from(self.source.clone()), |select, column| {
                select.column(Expr::column(column))
            })
            .filter(self.filter.clone());

        self.sort.iter().fold(select, |select, key| {
            select.order_by(Expr::column(&key.column), key.order)
        })
    }

    /// The page of rows plus a count over the same predicate.
    pub fn paged(&self, page: u64, page_size: u64) -> Result<PagedStatements> {
        let offset = page_offset(page, page_size)?;
        let rows = self.projected().limit(page_size).offset(offset).render()?;
        let count = Select::from(self.source.clone())
            .column_as(Expr::CountAll, Identifier::parse(TOTAL_ALIAS)?)
            .filter(self.filter.clone())
            .render()?;
        Ok(PagedStatements { rows, count })
    }

    /// All matching rows, optionally capped.
    pub fn export(&self, limit: Option<u64>) -> Result<Statement> {
        let select = self.projected();
        match limit {
            Some(limit) => select.limit(limit).render(),
            None => select.render(),
        }
    }
}

/// An alias may not name a column the query reads unless it projects exactly
/// that column: ClickHouse resolves such references to the alias instead.
fn reject_shadowing(outputs: &[(&str, &Expr)], read: &[&Identifier]) -> Result<()> {
    for (alias, expr) in outputs {
        if matches!(expr, Expr::Column(column) if column.name() == *alias) {
            continue;
        }
        if read.iter().any(|column| column.name() == *alias) {
            return Err(ServiceError::AliasCollision(redact(alias)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateColumn {
    pub expr: Expr,
    pub alias: Identifier,
}

/// Resolves requested aggregations to aliased expressions.
pub fn resolve_aggregations(
    sanitizer: &Sanitizer,
    aggregations: &[ColumnAggregation],
) -> Result<Vec<AggregateColumn>> {
    aggregations
        .iter()
        .map(|aggregation| {
            let column = sanitizer.column(&aggregation.column)?;
            let alias = Identifier::parse(&aggregation.output_name())?;
            Ok(AggregateColumn {
                expr: Expr::aggregate(aggregation.function, Expr::column(&column)),
                alias,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct AggregationPlan {
    pub source: Source,
    pub filter: Option<Predicate>,
    /// Bucketed time expression, materialized as the first key.
    pub time_bucket: Option<Expr>,
    pub group_by: Vec<Identifier>,
    pub aggregations: Vec<AggregateColumn>,
    pub sort: Vec<SortKey>,
    pub limit: u64,
}

impl AggregationPlan {
    /// Group keys in request order, then aggregation aliases in request order.
    pub fn output_columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(self.group_by.len() + self.aggregations.len() + 1);
        if self.time_bucket.is_some() {
            columns.push(TIME_BUCKET.to_string());
        }
        columns.extend(self.group_by.iter().map(|key| key.name().to_string()));
        columns.extend(
            self.aggregations
                .iter()
                .map(|agg| agg.alias.name().to_string()),
        );
        columns
    }

    pub fn validate(&self) -> Result<()> {
        let keys = self.output_columns();
        let group_len = keys.len() - self.aggregations.len();
        for (index, name) in keys.iter().enumerate().skip(group_len) {
            if keys[..index].contains(name) {
                return Err(ServiceError::AliasCollision(redact(name)));
            }
        }
        for key in &self.sort {
            if !keys.iter().any(|name| name == key.column.name()) {
                return Err(ServiceError::InvalidIdentifier(format!(
                    "sort field '{}' is not an output column",
                    redact(key.column.name())
                )));
            }
        }

        let mut outputs: Vec<(&str, &Expr)> = self
            .aggregations
            .iter()
            .map(|agg| (agg.alias.name(), &agg.expr))
            .collect();
        if let Some(bucket) = &self.time_bucket {
            outputs.push((TIME_BUCKET, bucket));
        }
        let mut read: Vec<&Identifier> = self.group_by.iter().collect();
        for (_, expr) in &outputs {
            expr.columns(&mut read);
        }
        if let Some(filter) = &self.filter {
            filter.columns(&mut read);
        }
        reject_shadowing(&outputs, &read)
    }

    pub fn statement(&self) -> Result<Statement> {
        self.validate()?;

        let mut select = Select::from(self.source.clone());
        let mut keys: Vec<Expr> = Vec::new();

        if let Some(bucket) = &self.time_bucket {
            let alias = Identifier::parse(TIME_BUCKET)?;
            select = select.column_as(bucket.clone(), alias.clone());
            keys.push(Expr::Column(alias));
        }
        for column in &self.group_by {
            select = select.column(Expr::column(column));
            keys.push(Expr::column(column));
        }
        for aggregation in &self.aggregations {
            select = select.column_as(aggregation.expr.clone(), aggregation.alias.clone());
        }

        select = select.filter(self.filter.clone());
        for key in &keys {
            select = select.group_by(key.clone());
        }

        if self.sort.is_empty() {
            if let Some(first) = keys.first() {
                select = select.order_by(first.clone(), SortOrder::Asc);
            }
        } else {
            for key in &self.sort {
                select = select.order_by(Expr::column(&key.column), key.order);
            }
        }

        select.limit(self.limit).render()
    }
}

pub const X_ALIAS: &str = "x";
pub const Y_ALIAS: &str = "y";
pub const SERIES_ALIAS: &str = "series";

/// One statement per y column, sharing x, filter and series discriminator.
#[derive(Debug, Clone)]
pub struct ChartPlan {
    pub source: Source,
    pub filter: Option<Predicate>,
    pub x: Expr,
    pub series_by: Option<Identifier>,
    pub limit: u64,
}

impl ChartPlan {
    /// Checks the fixed `x`/`series`/`y` aliases against every column read
    /// for the given y columns.
    pub fn validate(&self, y_columns: &[Identifier]) -> Result<()> {
        let series = self.series_by.clone().map(Expr::Column);
        let mut outputs: Vec<(&str, &Expr)> = vec![(X_ALIAS, &self.x)];
        if let Some(series) = &series {
            outputs.push((SERIES_ALIAS, series));
        }

        let mut read: Vec<&Identifier> = y_columns.iter().collect();
        for (_, expr) in &outputs {
            expr.columns(&mut read);
        }
        if let Some(filter) = &self.filter {
            filter.columns(&mut read);
        }
        reject_shadowing(&outputs, &read)?;

        // `y` is always an aggregate, so no column may carry its name.
        if read.iter().any(|column| column.name() == Y_ALIAS) {
            return Err(ServiceError::AliasCollision(Y_ALIAS.to_string()));
        }
        Ok(())
    }

    pub fn statement(&self, function: AggregationFunction, y: &Identifier) -> Result<Statement> {
        self.validate(std::slice::from_ref(y))?;
        let x_alias = Expr::Column(Identifier::parse(X_ALIAS)?);
        let series_alias = Identifier::parse(SERIES_ALIAS)?;

        let mut select = Select::from(self.source.clone())
            .column_as(self.x.clone(), Identifier::parse(X_ALIAS)?);
        if let Some(series) = &self.series_by {
            select = select.column_as(Expr::column(series), series_alias.clone());
        }
        select = select
            .column_as(
                Expr::aggregate(function, Expr::column(y)),
                Identifier::parse(Y_ALIAS)?,
            )
            .filter(self.filter.clone())
            .group_by(x_alias.clone());

        if self.series_by.is_some() {
            select = select
                .group_by(Expr::Column(series_alias.clone()))
                .order_by(x_alias, SortOrder::Asc)
                .order_by(Expr::Column(series_alias), SortOrder::Asc);
        } else {
            select = select.order_by(x_alias, SortOrder::Asc);
        }

        select.limit(self.limit).render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::FilterSet,
        query::filter::FilterTranslator,
        sql::{BindParam, Logic},
        time,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ident(name: &str) -> Identifier {
        Identifier::parse(name).unwrap()
    }

    fn table(name: &str) -> Source {
        Source::Table(ident(name))
    }

    fn example_filter() -> Option<Predicate> {
        let set: FilterSet = serde_json::from_value(json!({
            "conditions": [
                {"field": "year", "operator": "eq", "value": 2024},
                {"field": "territory", "operator": "in", "values": ["North", "South"]}
            ]
        }))
        .unwrap();
        FilterTranslator::new(&Sanitizer::CharacterClass)
            .translate(Some(&set))
            .unwrap()
    }

    fn aggregations(value: serde_json::Value) -> Vec<ColumnAggregation> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn row_and_count_share_the_predicate() {
        let envelope = QueryEnvelope {
            source: table("sales"),
            columns: vec![ident("territory"), ident("value")],
            filter: example_filter(),
            sort: vec![SortKey {
                column: ident("value"),
                order: SortOrder::Desc,
            }],
        };

        let paged = envelope.paged(3, 20).unwrap();
        assert_eq!(
            paged.rows.sql,
            "SELECT `territory`, `value` FROM `sales` WHERE (`year` = :f_0) AND (`territory` IN :f_1) \
             ORDER BY `value` DESC LIMIT :limit OFFSET :offset"
        );
        assert_eq!(
            paged.count.sql,
            "SELECT count() AS `total` FROM `sales` WHERE (`year` = :f_0) AND (`territory` IN :f_1)"
        );
        assert_eq!(paged.rows.where_clause(), paged.count.where_clause());
        assert_eq!(paged.rows.params.without(&["limit", "offset"]), paged.count.params);
        assert_eq!(paged.rows.params.get("offset"), Some(&BindParam::Int(40)));
    }

    #[test]
    fn unfiltered_queries_have_no_where() {
        let envelope = QueryEnvelope {
            source: table("sales"),
            columns: Vec::new(),
            filter: None,
            sort: Vec::new(),
        };
        let paged = envelope.paged(1, 50).unwrap();
        assert_eq!(paged.rows.sql, "SELECT * FROM `sales` LIMIT :limit OFFSET :offset");
        assert_eq!(paged.count.sql, "SELECT count() AS `total` FROM `sales`");
        assert!(paged.count.params.is_empty());
        assert!(envelope.paged(0, 50).is_err());
    }

    #[test]
    fn export_statement_is_unpaged() {
        let envelope = QueryEnvelope {
            source: table("sales"),
            columns: Vec::new(),
            filter: example_filter(),
            sort: Vec::new(),
        };
        let unlimited = envelope.export(None).unwrap();
        assert!(!unlimited.sql.contains("LIMIT"));
        let capped = envelope.export(Some(10)).unwrap();
        assert!(capped.sql.ends_with("LIMIT :limit"));
        assert!(capped.params.get("offset").is_none());
    }

    #[test]
    fn aggregation_defaults_to_first_group_key() {
        let plan = AggregationPlan {
            source: table("sales"),
            filter: None,
            time_bucket: None,
            group_by: vec![ident("territory")],
            aggregations: resolve_aggregations(
                &Sanitizer::CharacterClass,
                &aggregations(json!([{"column": "value", "function": "sum"}])),
            )
            .unwrap(),
            sort: Vec::new(),
            limit: 1000,
        };

        assert_eq!(plan.output_columns(), vec!["territory", "sum_value"]);
        assert_eq!(
            plan.statement().unwrap().sql,
            "SELECT `territory`, sum(`value`) AS `sum_value` FROM `sales` GROUP BY `territory` \
             ORDER BY `territory` ASC LIMIT :limit"
        );
    }

    #[test]
    fn aggregation_column_order_follows_request_order() {
        let requested = aggregations(json!([
            {"column": "value", "function": "max"},
            {"column": "value", "function": "count", "alias": "n"},
            {"column": "price", "function": "avg"}
        ]));
        for group_by in [vec!["b", "a"], vec!["a", "b"]] {
            let plan = AggregationPlan {
                source: table("t"),
                filter: None,
                time_bucket: None,
                group_by: group_by.iter().map(|name| ident(name)).collect(),
                aggregations: resolve_aggregations(&Sanitizer::CharacterClass, &requested)
                    .unwrap(),
                sort: Vec::new(),
                limit: 10,
            };
            let mut expected: Vec<String> = group_by.iter().map(|s| s.to_string()).collect();
            expected.extend(["max_value", "n", "avg_price"].map(String::from));
            assert_eq!(plan.output_columns(), expected);
        }
    }

    #[test]
    fn time_bucket_is_the_first_key() {
        let plan = AggregationPlan {
            source: table("events"),
            filter: None,
            time_bucket: Some(time::bucket_column(&ident("created_at"), "day")),
            group_by: vec![ident("kind")],
            aggregations: resolve_aggregations(
                &Sanitizer::CharacterClass,
                &aggregations(json!([{"column": "id", "function": "distinct_count"}])),
            )
            .unwrap(),
            sort: Vec::new(),
            limit: 100,
        };

        assert_eq!(
            plan.output_columns(),
            vec!["time_bucket", "kind", "distinct_count_id"]
        );
        assert_eq!(
            plan.statement().unwrap().sql,
            "SELECT toStartOfDay(`created_at`) AS `time_bucket`, `kind`, uniqExact(`id`) AS `distinct_count_id` \
             FROM `events` GROUP BY `time_bucket`, `kind` ORDER BY `time_bucket` ASC LIMIT :limit"
        );
    }

    #[test]
    fn duplicate_aliases_are_rejected() {
        let plan = AggregationPlan {
            source: table("t"),
            filter: None,
            time_bucket: None,
            group_by: Vec::new(),
            aggregations: resolve_aggregations(
                &Sanitizer::CharacterClass,
                &aggregations(json!([
                    {"column": "value", "function": "sum"},
                    {"column": "other", "function": "avg", "alias": "sum_value"}
                ])),
            )
            .unwrap(),
            sort: Vec::new(),
            limit: 10,
        };
        assert!(matches!(
            plan.statement().unwrap_err(),
            ServiceError::AliasCollision(_)
        ));
    }

    #[test]
    fn aliases_may_not_shadow_read_columns() {
        let shadowing = AggregationPlan {
            source: table("t"),
            filter: None,
            time_bucket: None,
            group_by: Vec::new(),
            aggregations: resolve_aggregations(
                &Sanitizer::CharacterClass,
                &aggregations(json!([
                    {"column": "price", "function": "sum", "alias": "value"},
                    {"column": "value", "function": "avg"}
                ])),
            )
            .unwrap(),
            sort: Vec::new(),
            limit: 10,
        };
        let err = shadowing.validate().unwrap_err();
        assert!(matches!(err, ServiceError::AliasCollision(ref alias) if alias == "value"));

        let filtered = AggregationPlan {
            aggregations: resolve_aggregations(
                &Sanitizer::CharacterClass,
                &aggregations(json!([{"column": "value", "function": "sum", "alias": "year"}])),
            )
            .unwrap(),
            filter: example_filter(),
            ..shadowing.clone()
        };
        assert!(matches!(
            filtered.validate().unwrap_err(),
            ServiceError::AliasCollision(_)
        ));

        let bucketed = AggregationPlan {
            time_bucket: Some(time::bucket_column(&ident("created_at"), "day")),
            group_by: vec![ident("time_bucket")],
            aggregations: Vec::new(),
            ..shadowing.clone()
        };
        assert!(matches!(
            bucketed.validate().unwrap_err(),
            ServiceError::AliasCollision(_)
        ));

        let distinct = AggregationPlan {
            aggregations: resolve_aggregations(
                &Sanitizer::CharacterClass,
                &aggregations(json!([{"column": "price", "function": "sum", "alias": "total"}])),
            )
            .unwrap(),
            filter: example_filter(),
            ..shadowing
        };
        assert!(distinct.validate().is_ok());
    }

    #[test]
    fn chart_aliases_may_not_shadow_read_columns() {
        let plan = ChartPlan {
            source: table("sales"),
            filter: None,
            x: Expr::column(&ident("month")),
            series_by: None,
            limit: 100,
        };
        assert!(matches!(
            plan.statement(AggregationFunction::Sum, &ident("x")).unwrap_err(),
            ServiceError::AliasCollision(_)
        ));
        assert!(matches!(
            plan.validate(&[ident("value"), ident("y")]).unwrap_err(),
            ServiceError::AliasCollision(_)
        ));

        let bucketed = ChartPlan {
            x: time::bucket_column(&ident("created_at"), "month"),
            series_by: Some(ident("series")),
            filter: Predicate::group(
                Logic::And,
                vec![Predicate::IsNull {
                    expr: Expr::column(&ident("x")),
                    negated: true,
                }],
            ),
            ..plan.clone()
        };
        assert!(matches!(
            bucketed.validate(&[ident("value")]).unwrap_err(),
            ServiceError::AliasCollision(ref alias) if alias == "x"
        ));

        let identity = ChartPlan {
            x: Expr::column(&ident("x")),
            series_by: Some(ident("series")),
            ..plan
        };
        assert!(identity.validate(&[ident("value")]).is_ok());
    }

    #[test]
    fn sort_outside_outputs_is_rejected() {
        let plan = AggregationPlan {
            source: table("t"),
            filter: None,
            time_bucket: None,
            group_by: vec![ident("territory")],
            aggregations: Vec::new(),
            sort: vec![SortKey {
                column: ident("value"),
                order: SortOrder::Asc,
            }],
            limit: 10,
        };
        assert!(matches!(
            plan.statement().unwrap_err(),
            ServiceError::InvalidIdentifier(_)
        ));
    }

    #[test]
    fn chart_with_series_groups_by_both_keys() {
        let plan = ChartPlan {
            source: table("sales"),
            filter: Predicate::group(Logic::And, Vec::new()),
            x: Expr::column(&ident("month")),
            series_by: Some(ident("territory")),
            limit: 100,
        };
        let statement = plan
            .statement(AggregationFunction::Sum, &ident("value"))
            .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT `month` AS `x`, `territory` AS `series`, sum(`value`) AS `y` FROM `sales` \
             GROUP BY `x`, `series` ORDER BY `x` ASC, `series` ASC LIMIT :limit"
        );
    }

    #[test]
    fn chart_without_series_orders_by_x() {
        let plan = ChartPlan {
            source: table("sales"),
            filter: example_filter(),
            x: time::bucket_column(&ident("created_at"), "month"),
            series_by: None,
            limit: 50,
        };
        let statement = plan
            .statement(AggregationFunction::Avg, &ident("value"))
            .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT toStartOfMonth(`created_at`) AS `x`, avg(`value`) AS `y` FROM `sales` \
             WHERE (`year` = :f_0) AND (`territory` IN :f_1) GROUP BY `x` ORDER BY `x` ASC LIMIT :limit"
        );
        assert_eq!(statement.params.len(), 3);
    }
}
