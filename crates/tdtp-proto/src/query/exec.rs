//! In-memory TDTQL executor (C3): the interpret path.

use std::cmp::Ordering;

use crate::error::{Result, TdtpError};
use crate::schema::Schema;
use crate::value::{parse_value, TypedValue, ValueConstraints};

use super::ast::{BoolOp, CompareOp, Filter, FilterNode, PredicateMatch, Query, QueryContext};

/// Executes `query` against `rows` (already schema-typed) and returns the
/// filtered/ordered/paged result plus a [`QueryContext`] describing the run.
///
/// Field references are validated against `schema` up front — an unknown
/// field name is a typed error raised before any row is read, per the
/// design's "validates that every referenced field exists" requirement.
pub fn execute<'a>(
    query: &Query,
    schema: &Schema,
    rows: &'a [Vec<TypedValue>],
) -> Result<(Vec<&'a Vec<TypedValue>>, QueryContext)> {
    let normalized = normalize_query(query, schema)?;

    let total = rows.len();
    let mut predicate_counts: Vec<(Filter, usize)> = match &normalized.filters {
        Some(tree) => tree.leaves().into_iter().map(|f| (f.clone(), 0)).collect(),
        None => Vec::new(),
    };

    let mut filtered: Vec<&Vec<TypedValue>> = Vec::new();
    for row in rows {
        if let Some(tree) = &normalized.filters {
            tally_predicate_matches(tree, schema, row, &mut predicate_counts)?;
        }
        let keep = match &normalized.filters {
            Some(tree) => eval_node(tree, schema, row)?,
            None => true,
        };
        if keep {
            filtered.push(row);
        }
    }

    sort_rows(&mut filtered, schema, &normalized.order_by)?;
    let after_filter = filtered.len();

    let offset = normalized.offset.unwrap_or(0).max(0) as usize;
    let paged: Vec<&Vec<TypedValue>> = match normalized.limit {
        Some(limit) if limit >= 0 => filtered
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .collect(),
        _ => filtered.into_iter().skip(offset).collect(),
    };

    let returned = paged.len();
    let more_data_available = offset + returned < after_filter;
    let next_offset = if more_data_available {
        Some((offset + returned) as i64)
    } else {
        None
    };

    let context = QueryContext {
        query: normalized,
        total,
        after_filter,
        returned,
        more_data_available,
        next_offset,
        predicate_matches: predicate_counts
            .into_iter()
            .map(|(f, n)| PredicateMatch {
                field: f.field,
                operator: f.operator.to_wire().to_string(),
                matches: n,
            })
            .collect(),
    };

    Ok((paged, context))
}

/// Validates every referenced field exists and rewrites field names to the
/// schema's canonical casing.
fn normalize_query(query: &Query, schema: &Schema) -> Result<Query> {
    let filters = query
        .filters
        .as_ref()
        .map(|tree| normalize_node(tree, schema))
        .transpose()?;
    let order_by = query
        .order_by
        .iter()
        .map(|k| {
            schema.canonical_name(&k.field).map(|name| super::ast::OrderKey {
                field: name.to_string(),
                descending: k.descending,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Query {
        filters,
        order_by,
        limit: query.limit,
        offset: query.offset,
    })
}

fn normalize_node(node: &FilterNode, schema: &Schema) -> Result<FilterNode> {
    Ok(match node {
        FilterNode::Leaf(f) => {
            let name = schema.canonical_name(&f.field)?.to_string();
            FilterNode::Leaf(Filter {
                field: name,
                ..f.clone()
            })
        }
        FilterNode::Group { op, children } => FilterNode::Group {
            op: *op,
            children: children
                .iter()
                .map(|c| normalize_node(c, schema))
                .collect::<Result<Vec<_>>>()?,
        },
    })
}

fn tally_predicate_matches(
    node: &FilterNode,
    schema: &Schema,
    row: &[TypedValue],
    counts: &mut [(Filter, usize)],
) -> Result<()> {
    match node {
        FilterNode::Leaf(f) => {
            if eval_leaf(f, schema, row)? {
                if let Some(entry) = counts.iter_mut().find(|(cf, _)| cf == f) {
                    entry.1 += 1;
                }
            }
        }
        FilterNode::Group { children, .. } => {
            for c in children {
                tally_predicate_matches(c, schema, row, counts)?;
            }
        }
    }
    Ok(())
}

fn eval_node(node: &FilterNode, schema: &Schema, row: &[TypedValue]) -> Result<bool> {
    match node {
        FilterNode::Leaf(f) => eval_leaf(f, schema, row),
        FilterNode::Group { op, children } => {
            let mut results = children.iter().map(|c| eval_node(c, schema, row));
            match op {
                BoolOp::And => results.try_fold(true, |acc, r| r.map(|v| acc && v)),
                BoolOp::Or => results.try_fold(false, |acc, r| r.map(|v| acc || v)),
            }
        }
    }
}

fn eval_leaf(filter: &Filter, schema: &Schema, row: &[TypedValue]) -> Result<bool> {
    let idx = schema
        .field_index(&filter.field)
        .ok_or_else(|| TdtpError::validation(format!("unknown field '{}'", filter.field)))?;
    let field = &schema.fields[idx];
    let actual = &row[idx];

    if matches!(filter.operator, CompareOp::IsNull) {
        return Ok(actual.is_null());
    }
    if matches!(filter.operator, CompareOp::IsNotNull) {
        return Ok(!actual.is_null());
    }
    if actual.is_null() {
        return Ok(false);
    }

    let constraints = ValueConstraints {
        field_type: field.field_type,
        length: field.length,
        precision: field.precision,
        scale: field.scale,
    };

    match filter.operator {
        CompareOp::Eq | CompareOp::Ne | CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le => {
            let expected = filter
                .value
                .as_deref()
                .ok_or_else(|| TdtpError::validation("comparison filter missing value"))?;
            let expected = parse_value(expected, &constraints)?;
            let ord = compare_values(actual, &expected)?;
            Ok(match filter.operator {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                _ => unreachable!(),
            })
        }
        CompareOp::Like => {
            let pattern = filter
                .value
                .as_deref()
                .ok_or_else(|| TdtpError::validation("like filter missing value"))?;
            let text = crate::value::format_value(actual);
            Ok(like_match(&text, pattern))
        }
        CompareOp::In => {
            let list = filter
                .value
                .as_deref()
                .ok_or_else(|| TdtpError::validation("in filter missing value"))?;
            let actual_text = crate::value::format_value(actual);
            Ok(list.split(',').map(str::trim).any(|v| v == actual_text))
        }
        CompareOp::Between => {
            let lo = filter
                .value
                .as_deref()
                .ok_or_else(|| TdtpError::validation("between filter missing value"))?;
            let hi = filter
                .value2
                .as_deref()
                .ok_or_else(|| TdtpError::validation("between filter missing value2"))?;
            let lo = parse_value(lo, &constraints)?;
            let hi = parse_value(hi, &constraints)?;
            Ok(compare_values(actual, &lo)? != Ordering::Less
                && compare_values(actual, &hi)? != Ordering::Greater)
        }
        CompareOp::IsNull | CompareOp::IsNotNull => unreachable!(),
    }
}

fn like_match(text: &str, pattern: &str) -> bool {
    // `%` = any substring, `_` = any single char. A small recursive
    // matcher rather than a regex compile per row.
    fn go(t: &[char], p: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('%') => go(t, &p[1..]) || (!t.is_empty() && go(&t[1..], p)),
            Some('_') => !t.is_empty() && go(&t[1..], &p[1..]),
            Some(c) => t.first() == Some(c) && go(&t[1..], &p[1..]),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    go(&t, &p)
}

/// Orders two typed values of the same kind (integers and reals compare
/// across each other numerically). Mismatched kinds are a validation error.
pub fn compare_values(a: &TypedValue, b: &TypedValue) -> Result<Ordering> {
    use TypedValue::*;
    Ok(match (a, b) {
        (Integer(x), Integer(y)) => x.cmp(y),
        (Real(x), Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Integer(x), Real(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Real(x), Integer(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Decimal { raw: x, .. }, Decimal { raw: y, .. }) => {
            let xf: f64 = x.parse().unwrap_or(0.0);
            let yf: f64 = y.parse().unwrap_or(0.0);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Text(x), Text(y)) => x.cmp(y),
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (Date(x), Date(y)) => x.cmp(y),
        (DateTime(x), DateTime(y)) => x.cmp(y),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (Blob(x), Blob(y)) => x.cmp(y),
        _ => return Err(TdtpError::validation("cannot compare mismatched value types")),
    })
}

fn sort_rows<'a>(
    rows: &mut [&'a Vec<TypedValue>],
    schema: &Schema,
    order_by: &[super::ast::OrderKey],
) -> Result<()> {
    if order_by.is_empty() {
        return Ok(());
    }
    let indices: Vec<(usize, bool)> = order_by
        .iter()
        .map(|k| {
            schema
                .field_index(&k.field)
                .map(|idx| (idx, k.descending))
                .ok_or_else(|| TdtpError::validation(format!("unknown order field '{}'", k.field)))
        })
        .collect::<Result<Vec<_>>>()?;

    // Stable sort: rows already in source order for ties.
    let mut err = None;
    rows.sort_by(|a, b| {
        for &(idx, desc) in &indices {
            let ord = match compare_values(&a[idx], &b[idx]) {
                Ok(o) => o,
                Err(e) => {
                    err = Some(e);
                    Ordering::Equal
                }
            };
            let ord = if desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use crate::value::FieldType;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("name", FieldType::Text),
        ])
    }

    fn rows() -> Vec<Vec<TypedValue>> {
        vec![
            vec![TypedValue::Integer(1), TypedValue::Text("alice".into())],
            vec![TypedValue::Integer(2), TypedValue::Text("bob".into())],
            vec![TypedValue::Integer(3), TypedValue::Text("carol".into())],
        ]
    }

    #[test]
    fn and_group_narrows_results() {
        let schema = schema();
        let rows = rows();
        let query = Query::new().with_filters(FilterNode::and(vec![
            FilterNode::Leaf(Filter::new("id", CompareOp::Gt, Some("1".into()))),
            FilterNode::Leaf(Filter::new("id", CompareOp::Lt, Some("3".into()))),
        ]));
        let (result, ctx) = execute(&query, &schema, &rows).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(ctx.after_filter, 1);
    }

    #[test]
    fn paging_concatenation_reproduces_full_result() {
        let schema = schema();
        let rows = rows();
        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let query = Query::new().with_limit(1).with_offset(offset);
            let (page, ctx) = execute(&query, &schema, &rows).unwrap();
            if page.is_empty() {
                break;
            }
            seen.extend(page.iter().map(|r| r[0].clone()));
            offset = match ctx.next_offset {
                Some(n) => n,
                None => break,
            };
        }
        assert_eq!(seen.len(), rows.len());
    }

    #[test]
    fn unknown_field_is_a_typed_error() {
        let schema = schema();
        let rows = rows();
        let query = Query::new().with_filters(FilterNode::Leaf(Filter::new(
            "nope",
            CompareOp::Eq,
            Some("x".into()),
        )));
        assert!(execute(&query, &schema, &rows).is_err());
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("alice", "al%"));
        assert!(like_match("alice", "a_ice"));
        assert!(!like_match("alice", "bob"));
    }
}
