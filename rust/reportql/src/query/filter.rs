//! Filter translator: turns a [`FilterSet`] into a parameterized predicate.

use crate::{
    error::{Result, ServiceError},
    models::{FilterCondition, FilterOperator, FilterSet},
    sql::{redact, BindParam, CompareOp, Expr, Param, Params, Predicate, Sanitizer},
};

const PARAM_PREFIX: &str = "f";

pub struct FilterTranslator<'a> {
    sanitizer: &'a Sanitizer,
}

impl<'a> FilterTranslator<'a> {
    pub fn new(sanitizer: &'a Sanitizer) -> Self {
        Self { sanitizer }
    }

    /// `None` means no filtering. Every condition yields exactly one clause
    /// or the whole translation fails.
    pub fn translate(&self, filters: Option<&FilterSet>) -> Result<Option<Predicate>> {
        let Some(filters) = filters else {
            return Ok(None);
        };

        let clauses = filters
            .conditions
            .iter()
            .enumerate()
            .map(|(index, condition)| self.condition(index, condition))
            .collect::<Result<Vec<_>>>()?;

        Ok(Predicate::group(filters.logic, clauses))
    }

    fn condition(&self, index: usize, condition: &FilterCondition) -> Result<Predicate> {
        let column = self.sanitizer.column(&condition.field)?;
        let expr = Expr::column(&column);
        let name = format!("{PARAM_PREFIX}_{index}");

        let predicate = match condition.operator {
            FilterOperator::Eq
            | FilterOperator::Neq
            | FilterOperator::Gt
            | FilterOperator::Gte
            | FilterOperator::Lt
            | FilterOperator::Lte => {
                let value = scalar_value(condition)?;
                Predicate::Compare {
                    expr,
                    op: compare_op(condition.operator),
                    param: Param::new(name, value),
                }
            }
            FilterOperator::In | FilterOperator::NotIn => Predicate::InList {
                expr,
                negated: condition.operator == FilterOperator::NotIn,
                param: Param::new(name, BindParam::List(list_values(condition)?)),
            },
            FilterOperator::Like => Predicate::Like {
                expr,
                param: Param::new(name, pattern_value(condition)?),
            },
            FilterOperator::ILike => Predicate::ILike {
                expr,
                param: Param::new(name, pattern_value(condition)?),
            },
            FilterOperator::Between => {
                let (min, max) = range_values(condition)?;
                Predicate::Between {
                    expr,
                    min: Param::new(format!("{name}_min"), min),
                    max: Param::new(format!("{name}_max"), max),
                }
            }
            FilterOperator::IsNull => Predicate::IsNull {
                expr,
                negated: false,
            },
            FilterOperator::IsNotNull => Predicate::IsNull {
                expr,
                negated: true,
            },
        };

        Ok(predicate)
    }
}

/// Renders a filter set on its own, as it would appear after `WHERE`.
pub fn translate_filters(
    sanitizer: &Sanitizer,
    filters: Option<&FilterSet>,
) -> Result<(String, Params)> {
    let mut params = Params::default();
    let text = match FilterTranslator::new(sanitizer).translate(filters)? {
        Some(predicate) => predicate.render(&mut params)?,
        None => String::new(),
    };
    Ok((text, params))
}

fn compare_op(operator: FilterOperator) -> CompareOp {
    match operator {
        FilterOperator::Neq => CompareOp::NotEq,
        FilterOperator::Gt => CompareOp::Gt,
        FilterOperator::Gte => CompareOp::Gte,
        FilterOperator::Lt => CompareOp::Lt,
        FilterOperator::Lte => CompareOp::Lte,
        _ => CompareOp::Eq,
    }
}

fn invalid(condition: &FilterCondition, reason: &str) -> ServiceError {
    ServiceError::InvalidFilter(format!(
        "operator '{}' on field '{}' {reason}",
        condition.operator,
        redact(&condition.field)
    ))
}

fn scalar_value(condition: &FilterCondition) -> Result<BindParam> {
    match &condition.value {
        None | Some(BindParam::Null) => Err(invalid(condition, "requires a non-null value")),
        Some(BindParam::List(_)) => Err(invalid(condition, "requires a scalar value")),
        Some(value) => Ok(value.clone()),
    }
}

fn pattern_value(condition: &FilterCondition) -> Result<BindParam> {
    match &condition.value {
        Some(BindParam::Text(pattern)) => Ok(BindParam::Text(pattern.clone())),
        _ => Err(invalid(condition, "requires a string pattern")),
    }
}

/// `values` when present, otherwise the single `value` (a list value is accepted as-is).
fn list_values(condition: &FilterCondition) -> Result<Vec<BindParam>> {
    let items = match (&condition.values, &condition.value) {
        (Some(values), _) if !values.is_empty() => values.clone(),
        (_, Some(BindParam::List(values))) => values.clone(),
        (_, Some(value)) if !value.is_null() => vec![value.clone()],
        _ => return Err(invalid(condition, "requires at least one value")),
    };
    if items.is_empty() {
        return Err(invalid(condition, "requires at least one value"));
    }
    ensure_flat(condition, &items)?;
    Ok(items)
}

fn range_values(condition: &FilterCondition) -> Result<(BindParam, BindParam)> {
    let values = condition.values.as_deref().unwrap_or_default();
    if values.len() < 2 {
        return Err(invalid(condition, "requires at least two values"));
    }
    ensure_flat(condition, &values[..2])?;
    Ok((values[0].clone(), values[1].clone()))
}

fn ensure_flat(condition: &FilterCondition, items: &[BindParam]) -> Result<()> {
    if items
        .iter()
        .any(|item| matches!(item, BindParam::List(_) | BindParam::Null))
    {
        return Err(invalid(condition, "accepts only non-null scalar values"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Logic;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn filters(value: serde_json::Value) -> FilterSet {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn translates_conditions_in_order() {
        let set = filters(json!({
            "conditions": [
                {"field": "year", "operator": "EQ", "value": 2024},
                {"field": "territory", "operator": "IN", "values": ["North", "South"]}
            ],
            "logic": "AND"
        }));

        let (text, params) = translate_filters(&Sanitizer::CharacterClass, Some(&set)).unwrap();
        assert_eq!(text, "(`year` = :f_0) AND (`territory` IN :f_1)");
        assert_eq!(params.get("f_0"), Some(&BindParam::Int(2024)));
        assert_eq!(
            params.get("f_1"),
            Some(&BindParam::from(vec!["North", "South"]))
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn clause_and_parameter_counts_match_conditions() {
        let set = filters(json!({
            "conditions": [
                {"field": "a", "operator": "neq", "value": 1},
                {"field": "b", "operator": "between", "values": [1, 10]},
                {"field": "c", "operator": "is_null"},
                {"field": "d", "operator": "ilike", "value": "%x%"},
                {"field": "e", "operator": "not_in", "value": "z"},
                {"field": "f", "operator": "is_not_null"}
            ],
            "logic": "or"
        }));

        let predicate = FilterTranslator::new(&Sanitizer::CharacterClass)
            .translate(Some(&set))
            .unwrap()
            .unwrap();
        assert_eq!(predicate.clause_count(), 6);

        let mut params = Params::default();
        let text = predicate.render(&mut params).unwrap();
        assert_eq!(text.matches(") OR (").count(), 5);
        assert!(text.contains("`b` BETWEEN :f_1_min AND :f_1_max"));
        assert!(text.contains("lower(`d`) LIKE lower(:f_3)"));
        assert!(text.contains("`e` NOT IN :f_4"));
        // neq + between(2) + ilike + not_in
        assert_eq!(params.len(), 5);
        assert_eq!(params.get("f_4"), Some(&BindParam::from(vec!["z"])));
    }

    #[test]
    fn empty_condition_list_is_no_filter() {
        let set = FilterSet {
            conditions: Vec::new(),
            logic: Logic::And,
        };
        let translated = FilterTranslator::new(&Sanitizer::CharacterClass)
            .translate(Some(&set))
            .unwrap();
        assert!(translated.is_none());
        assert_eq!(
            translate_filters(&Sanitizer::CharacterClass, None).unwrap(),
            (String::new(), Params::default())
        );
    }

    #[test]
    fn between_needs_two_values() {
        let set = filters(json!({
            "conditions": [{"field": "value", "operator": "between", "values": [1]}]
        }));
        let err = translate_filters(&Sanitizer::CharacterClass, Some(&set)).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidFilter(_)));
        assert!(err.to_string().contains("at least two values"));
    }

    #[test]
    fn malformed_conditions_fail_instead_of_vanishing() {
        for condition in [
            json!({"field": "a", "operator": "eq"}),
            json!({"field": "a", "operator": "gt", "value": null}),
            json!({"field": "a", "operator": "in", "values": []}),
            json!({"field": "a", "operator": "in", "values": [[1, 2]]}),
            json!({"field": "a", "operator": "like", "value": 5}),
            json!({"field": "a", "operator": "eq", "value": [1, 2]}),
        ] {
            let set = filters(json!({ "conditions": [condition.clone()] }));
            let err = translate_filters(&Sanitizer::CharacterClass, Some(&set)).unwrap_err();
            assert!(
                matches!(err, ServiceError::InvalidFilter(_)),
                "{condition} -> {err}"
            );
        }
    }

    #[test]
    fn timestamp_shaped_text_keeps_string_semantics() {
        let set = filters(json!({
            "conditions": [
                {"field": "note", "operator": "like", "value": "2024-03-01T00:00:00Z"},
                {"field": "code", "operator": "eq", "value": "2024-03-01T00:00:00Z"},
                {"field": "created_at", "operator": "gte",
                 "value": {"t": "timestamp", "v": "2024-03-01T00:00:00Z"}}
            ]
        }));

        let (text, params) = translate_filters(&Sanitizer::CharacterClass, Some(&set)).unwrap();
        assert_eq!(
            text,
            "(`note` LIKE :f_0) AND (`code` = :f_1) AND (`created_at` >= :f_2)"
        );
        assert_eq!(
            params.get("f_0"),
            Some(&BindParam::Text("2024-03-01T00:00:00Z".into()))
        );
        assert_eq!(params.get("f_1").map(BindParam::kind), Some("text"));
        assert_eq!(params.get("f_2").map(BindParam::kind), Some("timestamp"));
    }

    #[test]
    fn unsafe_fields_fail_with_invalid_identifier() {
        let set = filters(json!({
            "conditions": [{"field": "year) OR (1=1", "operator": "eq", "value": 1}]
        }));
        let err = translate_filters(&Sanitizer::CharacterClass, Some(&set)).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidIdentifier(_)));
    }

    #[test]
    fn allow_list_applies_to_filter_fields() {
        let sanitizer = Sanitizer::AllowList(&["year"]);
        let set = filters(json!({
            "conditions": [{"field": "secret", "operator": "eq", "value": 1}]
        }));
        let err = translate_filters(&sanitizer, Some(&set)).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidIdentifier(_)));
    }
}
