//! Reference dimension listings (territories, categories, finkods, ...).

use super::reports;
use crate::{
    error::{Result, ServiceError},
    sql::{
        redact, BindParam, CompareOp, Expr, Identifier, Logic, Param, Predicate, Select,
        SortOrder, Source, Statement,
    },
    store::QueryExecutor,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{str::FromStr, sync::Arc};

const MONTHS: [&str; 12] = [
    "Январь",
    "Февраль",
    "Март",
    "Апрель",
    "Май",
    "Июнь",
    "Июль",
    "Август",
    "Сентябрь",
    "Октябрь",
    "Ноябрь",
    "Декабрь",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionKind {
    Territories,
    Macroregions,
    Categories,
    Finkods,
    Drivers,
    Priznaks,
    Units,
    FinkodGroups,
    Years,
    Months,
}

impl FromStr for DimensionKind {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self> {
        let kind = match raw {
            "territories" => DimensionKind::Territories,
            "macroregions" => DimensionKind::Macroregions,
            "categories" => DimensionKind::Categories,
            "finkods" => DimensionKind::Finkods,
            "drivers" => DimensionKind::Drivers,
            "priznaks" => DimensionKind::Priznaks,
            "units" => DimensionKind::Units,
            "finkod_groups" => DimensionKind::FinkodGroups,
            "years" => DimensionKind::Years,
            "months" => DimensionKind::Months,
            other => {
                return Err(ServiceError::NotFound(format!(
                    "unknown dimension '{}'",
                    redact(other)
                )))
            }
        };
        Ok(kind)
    }
}

/// Query-string options. `parent` also answers to the per-dimension names
/// (`territory_code`, `parent_code`, `group_code`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DimensionQuery {
    #[serde(
        default,
        alias = "territory_code",
        alias = "parent_code",
        alias = "group_code"
    )]
    pub parent: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

struct DimensionTable {
    table: &'static str,
    columns: &'static [&'static str],
    parent: Option<&'static str>,
    order: &'static [&'static str],
}

impl DimensionKind {
    fn table(self) -> Option<DimensionTable> {
        let simple = |table| DimensionTable {
            table,
            columns: &["code", "name", "sort_order"],
            parent: None,
            order: &["sort_order", "name"],
        };

        let table = match self {
            DimensionKind::Territories => simple("dim_territory"),
            DimensionKind::Macroregions => DimensionTable {
                table: "dim_macroregion",
                columns: &["code", "name", "territory_code", "sort_order"],
                parent: Some("territory_code"),
                order: &["territory_code", "sort_order", "name"],
            },
            DimensionKind::Categories => DimensionTable {
                table: "dim_category",
                columns: &["code", "name", "parent_code", "level", "sort_order"],
                parent: Some("parent_code"),
                order: &["sort_order", "name"],
            },
            DimensionKind::Finkods => DimensionTable {
                table: "dim_finkod",
                columns: &["code", "name", "group_code", "sort_order"],
                parent: Some("group_code"),
                order: &["sort_order", "code"],
            },
            DimensionKind::Drivers => simple("dim_driver"),
            DimensionKind::Priznaks => simple("dim_priznak"),
            DimensionKind::Units => simple("dim_unit"),
            DimensionKind::FinkodGroups | DimensionKind::Years | DimensionKind::Months => {
                return None
            }
        };
        Some(table)
    }
}

impl DimensionTable {
    fn statement(&self, query: &DimensionQuery) -> Result<Statement> {
        let mut clauses = Vec::new();
        if !query.include_inactive {
            clauses.push(Predicate::Compare {
                expr: Expr::Column(Identifier::parse("is_active")?),
                op: CompareOp::Eq,
                param: Param::new("is_active", 1_i64),
            });
        }
        if let (Some(column), Some(parent)) = (self.parent, query.parent.as_deref()) {
            if !parent.is_empty() {
                clauses.push(Predicate::Compare {
                    expr: Expr::Column(Identifier::parse(column)?),
                    op: CompareOp::Eq,
                    param: Param::new(column, parent),
                });
            }
        }

        let mut select = Select::from(Source::Table(Identifier::parse(self.table)?))
            .filter(Predicate::group(Logic::And, clauses));
        for column in self.columns {
            select = select.column(Expr::Column(Identifier::parse(column)?));
        }
        for column in self.order {
            select = select.order_by(Expr::Column(Identifier::parse(column)?), SortOrder::Asc);
        }
        select.render()
    }
}

fn finkod_groups_statement() -> Result<Statement> {
    let group = Identifier::parse("group_code")?;
    Select::from(Source::Table(Identifier::parse("dim_finkod")?))
        .distinct()
        .column_as(Expr::column(&group), Identifier::parse("code")?)
        .column_as(Expr::column(&group), Identifier::parse("name")?)
        .filter(Some(Predicate::Compare {
            expr: Expr::column(&group),
            op: CompareOp::NotEq,
            param: Param::new("group_code", BindParam::Text(String::new())),
        }))
        .order_by(Expr::column(&group), SortOrder::Asc)
        .render()
}

fn months() -> Vec<Value> {
    MONTHS
        .iter()
        .zip(1_i64..)
        .map(|(name, code)| json!({ "code": code, "name": name }))
        .collect()
}

#[derive(Clone)]
pub struct DimensionService {
    executor: Arc<dyn QueryExecutor>,
}

impl DimensionService {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }

    pub async fn list(&self, kind: DimensionKind, query: &DimensionQuery) -> Result<Vec<Value>> {
        let statement = match kind {
            DimensionKind::Months => return Ok(months()),
            DimensionKind::Years => reports::years_statement(None)?,
            DimensionKind::FinkodGroups => finkod_groups_statement()?,
            other => match other.table() {
                Some(table) => table.statement(query)?,
                None => return Ok(Vec::new()),
            },
        };

        let result = self.executor.fetch_all(&statement).await?;
        let values = match kind {
            DimensionKind::Years => result
                .rows
                .into_iter()
                .filter_map(|mut row| row.remove("year"))
                .collect(),
            _ => result.rows.into_iter().map(Value::Object).collect(),
        };
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn active_rows_only_by_default() {
        let table = DimensionKind::Territories.table().unwrap();
        let statement = table.statement(&DimensionQuery::default()).unwrap();
        assert_eq!(
            statement.sql,
            "SELECT `code`, `name`, `sort_order` FROM `dim_territory` WHERE (`is_active` = :is_active) \
             ORDER BY `sort_order` ASC, `name` ASC"
        );

        let all = table
            .statement(&DimensionQuery {
                parent: None,
                include_inactive: true,
            })
            .unwrap();
        assert!(!all.sql.contains("WHERE"));
    }

    #[test]
    fn parent_filter_is_bound() {
        let query: DimensionQuery =
            serde_json::from_value(serde_json::json!({"territory_code": "North"})).unwrap();
        let statement = DimensionKind::Macroregions
            .table()
            .unwrap()
            .statement(&query)
            .unwrap();
        assert!(statement
            .sql
            .contains("(`is_active` = :is_active) AND (`territory_code` = :territory_code)"));
        assert_eq!(
            statement.params.get("territory_code"),
            Some(&BindParam::Text("North".into()))
        );
    }

    #[test]
    fn finkod_groups_skip_blank_codes() {
        let statement = finkod_groups_statement().unwrap();
        assert_eq!(
            statement.sql,
            "SELECT DISTINCT `group_code` AS `code`, `group_code` AS `name` FROM `dim_finkod` \
             WHERE `group_code` != :group_code ORDER BY `group_code` ASC"
        );
    }

    #[test]
    fn months_are_static() {
        let months = months();
        assert_eq!(months.len(), 12);
        assert_eq!(months[0], json!({"code": 1, "name": "Январь"}));
    }

    #[test]
    fn unknown_kinds_are_not_found() {
        assert!(matches!(
            "secrets".parse::<DimensionKind>(),
            Err(ServiceError::NotFound(_))
        ));
        assert_eq!(
            "finkod_groups".parse::<DimensionKind>().unwrap(),
            DimensionKind::FinkodGroups
        );
    }
}
