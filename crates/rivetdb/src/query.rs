//! JSON predicate queries with property sorting.
//!
//! A query is a JSON `where` expression (implicit equality on property
//! paths, comparison operators, `$and`/`$or`/`$not`, `$in`, `$exists`), a
//! string-array sort specification (`-` prefix for descending, special
//! paths `_id` and `_sequence`), and named `$parameter` bindings. Value
//! comparisons use collatable order, so they agree with index ordering.

use std::cmp::Ordering;

use rivetdb_core::collatable::encode_json;
use rivetdb_core::error::{Result, RivetError};
use serde_json::Value;

use crate::document::Document;

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// The predicate; an empty object matches everything.
    pub where_expression: Value,
    /// Sort paths; `-` prefix descends. `_id` and `_sequence` are special.
    pub sort: Vec<String>,
    pub skip: usize,
    pub limit: Option<usize>,
    /// Values bound to `$name` placeholders in the predicate.
    pub parameters: Value,
}

impl QueryRequest {
    pub fn matching(where_expression: Value) -> QueryRequest {
        QueryRequest {
            where_expression,
            ..QueryRequest::default()
        }
    }
}

/// Total order over JSON values matching the collatable encoding.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    encode_json(a).cmp(&encode_json(b))
}

fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

// Substitutes `$name` string values from the parameter dictionary; `\$`
// escapes a literal dollar sign.
fn bind_parameters(expression: &Value, parameters: &Value) -> Result<Value> {
    Ok(match expression {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix('$') {
                parameters
                    .get(name)
                    .cloned()
                    .ok_or_else(|| {
                        RivetError::InvalidParameter(format!("unbound query parameter ${name}"))
                    })?
            } else if let Some(literal) = s.strip_prefix("\\$") {
                Value::String(format!("${literal}"))
            } else {
                expression.clone()
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| bind_parameters(v, parameters))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), bind_parameters(v, parameters)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn matches_condition(doc: &Value, condition: &Value) -> Result<bool> {
    let Some(map) = condition.as_object() else {
        return Err(RivetError::InvalidParameter(
            "where expression must be a JSON object".into(),
        ));
    };
    for (key, expected) in map {
        let ok = match key.as_str() {
            "$and" => expected
                .as_array()
                .ok_or_else(|| bad_operator("$and"))?
                .iter()
                .try_fold(true, |acc, c| Ok::<_, RivetError>(acc && matches_condition(doc, c)?))?,
            "$or" => expected
                .as_array()
                .ok_or_else(|| bad_operator("$or"))?
                .iter()
                .try_fold(false, |acc, c| Ok::<_, RivetError>(acc || matches_condition(doc, c)?))?,
            "$not" => !matches_condition(doc, expected)?,
            path => matches_path(get_path(doc, path), expected)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_path(actual: Option<&Value>, expected: &Value) -> Result<bool> {
    // An object whose keys all start with '$' is an operator set; anything
    // else is an equality match.
    let operators = expected
        .as_object()
        .filter(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')));
    let Some(operators) = operators else {
        return Ok(actual.is_some_and(|a| compare_values(a, expected) == Ordering::Equal));
    };

    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
            "$eq" => actual.is_some_and(|a| compare_values(a, operand) == Ordering::Equal),
            "$ne" => !actual.is_some_and(|a| compare_values(a, operand) == Ordering::Equal),
            "$gt" => actual.is_some_and(|a| compare_values(a, operand) == Ordering::Greater),
            "$gte" => actual.is_some_and(|a| compare_values(a, operand) != Ordering::Less),
            "$lt" => actual.is_some_and(|a| compare_values(a, operand) == Ordering::Less),
            "$lte" => actual.is_some_and(|a| compare_values(a, operand) != Ordering::Greater),
            "$in" => {
                let options = operand.as_array().ok_or_else(|| bad_operator("$in"))?;
                actual.is_some_and(|a| {
                    options.iter().any(|o| compare_values(a, o) == Ordering::Equal)
                })
            }
            other => return Err(bad_operator(other)),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn bad_operator(op: &str) -> RivetError {
    RivetError::InvalidParameter(format!("unsupported query operator {op}"))
}

fn sort_key(doc: &Document, path: &str) -> Value {
    match path {
        "_id" => Value::String(doc.id.clone()),
        "_sequence" => Value::from(doc.sequence),
        path => get_path(&doc.data, path).cloned().unwrap_or(Value::Null),
    }
}

/// Filters, sorts, and windows the candidate documents.
pub fn run_query(documents: Vec<Document>, request: &QueryRequest) -> Result<Vec<Document>> {
    let predicate = if request.where_expression.is_null() {
        Value::Object(Default::default())
    } else {
        bind_parameters(&request.where_expression, &request.parameters)?
    };

    let mut matched = Vec::new();
    for doc in documents {
        let body = doc.to_json();
        if matches_condition(&body, &predicate)? {
            matched.push(doc);
        }
    }

    if !request.sort.is_empty() {
        let spec: Vec<(bool, &str)> = request
            .sort
            .iter()
            .map(|s| match s.strip_prefix('-') {
                Some(path) => (true, path),
                None => (false, s.as_str()),
            })
            .collect();
        matched.sort_by(|a, b| {
            for (descending, path) in &spec {
                let ordering = compare_values(&sort_key(a, path), &sort_key(b, path));
                if ordering != Ordering::Equal {
                    return if *descending { ordering.reverse() } else { ordering };
                }
            }
            a.id.cmp(&b.id)
        });
    }

    let mut result: Vec<Document> = matched.into_iter().skip(request.skip).collect();
    if let Some(limit) = request.limit {
        result.truncate(limit);
    }
    Ok(result)
}
