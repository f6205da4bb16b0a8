use super::{
    expr::{Expr, Logic, OrderBy, Param, Predicate, SortOrder},
    ident::Identifier,
    BoundSql, Params, Placeholders, Statement,
};
use crate::error::Result;

/// What a statement reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table(Identifier),
    /// A stored, server-owned query used as a derived table.
    Derived(String),
}

impl Source {
    fn render(&self, style: Placeholders) -> String {
        match (self, style) {
            (Source::Table(table), _) => table.render(),
            (Source::Derived(query), Placeholders::Named) => format!("({query}) AS source"),
            // A literal `?` in stored text must not be taken for a bind slot.
            (Source::Derived(query), Placeholders::Positional) => {
                format!("({}) AS source", query.replace('?', "??"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Projection {
    expr: Expr,
    alias: Option<Identifier>,
}

#[derive(Debug, Clone)]
pub struct Select {
    source: Source,
    distinct: bool,
    projection: Vec<Projection>,
    filter: Option<Predicate>,
    group_by: Vec<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Select {
    pub fn from(source: Source) -> Self {
        Self {
            source,
            distinct: false,
            projection: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn column(mut self, expr: Expr) -> Self {
        self.projection.push(Projection { expr, alias: None });
        self
    }

    pub fn column_as(mut self, expr: Expr, alias: Identifier) -> Self {
        self.projection.push(Projection {
            expr,
            alias: Some(alias),
        });
        self
    }

    /// ANDs `predicate` onto whatever filter is already present.
    pub fn filter(mut self, predicate: Option<Predicate>) -> Self {
        self.filter = match (self.filter.take(), predicate) {
            (None, next) => next,
            (current, None) => current,
            (Some(current), Some(next)) => Some(Predicate::Group {
                logic: Logic::And,
                clauses: vec![current, next],
            }),
        };
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, order: SortOrder) -> Self {
        self.order_by.push(OrderBy { expr, order });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Renders the named form for callers and the positional form for the store.
    pub fn render(&self) -> Result<Statement> {
        let (sql, params) = self.render_with(Placeholders::Named)?;
        let (bound_sql, bound_params) = self.render_with(Placeholders::Positional)?;
        Ok(Statement {
            sql,
            params,
            bound: BoundSql {
                sql: bound_sql,
                values: bound_params.into_positional(),
            },
        })
    }

    fn render_with(&self, style: Placeholders) -> Result<(String, Params)> {
        let mut params = Params::with_style(style);
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.projection.is_empty() {
            sql.push('*');
        } else {
            let columns: Vec<String> = self
                .projection
                .iter()
                .map(|projection| match &projection.alias {
                    Some(alias) => format!("{} AS {}", projection.expr.render(), alias.render()),
                    None => projection.expr.render(),
                })
                .collect();
            sql.push_str(&columns.join(", "));
        }

        sql.push_str(" FROM ");
        sql.push_str(&self.source.render(style));

        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.render(&mut params)?);
        }

        if !self.group_by.is_empty() {
            let keys: Vec<String> = self.group_by.iter().map(Expr::render).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&keys.join(", "));
        }

        if !self.order_by.is_empty() {
            let keys: Vec<String> = self.order_by.iter().map(OrderBy::render).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }

        if let Some(limit) = self.limit {
            let slot = params.bind(&Param::new("limit", clamp_i64(limit)))?;
            sql.push_str(" LIMIT ");
            sql.push_str(&slot);
        }

        if let Some(offset) = self.offset {
            let slot = params.bind(&Param::new("offset", clamp_i64(offset)))?;
            sql.push_str(" OFFSET ");
            sql.push_str(&slot);
        }

        Ok((sql, params))
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
