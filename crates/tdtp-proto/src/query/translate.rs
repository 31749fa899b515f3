//! TDTQL -> SQL translator (C4): the pushdown path.
//!
//! Shares the same filter/order/paging semantics as [`super::exec`]; when a
//! query can't be expressed in portable SQL this reports why instead of
//! guessing, so the caller can fall back to in-memory execution.

use crate::schema::Schema;

use super::ast::{BoolOp, CompareOp, Filter, FilterNode, Query};

/// Target dialect for paging/identifier-quoting differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
    Mssql,
}

impl Dialect {
    fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Sqlite | Dialect::Postgres => format!("\"{ident}\""),
            Dialect::MySql => format!("`{ident}`"),
            Dialect::Mssql => format!("[{ident}]"),
        }
    }

    /// MSSQL's `OFFSET ... FETCH` paging requires an `ORDER BY` clause.
    fn requires_order_by_for_paging(&self) -> bool {
        matches!(self, Dialect::Mssql)
    }
}

/// Why a query could not be translated to SQL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UntranslatableReason {
    #[error("operator '{0:?}' has no portable SQL form")]
    UnsupportedOperator(CompareOp),
    #[error("OR group mixes incompatible comparison types")]
    IncompatibleOrGroup,
    #[error("paging requires ORDER BY under this dialect and none was supplied or inferable")]
    PagingNeedsOrderBy,
}

/// Translates `query` against `table`/`schema` into a portable SQL
/// statement for `dialect`. Returns `Err(reason)` — not a hard error — when
/// the caller should fall back to in-memory execution instead.
pub fn translate(
    query: &Query,
    table: &str,
    schema: &Schema,
    dialect: Dialect,
) -> Result<String, UntranslatableReason> {
    let mut sql = format!("SELECT * FROM {}", quote_table(table, dialect));

    if let Some(tree) = &query.filters {
        let where_clause = translate_node(tree, dialect)?;
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause);
    }

    let mut order_by = query.order_by.clone();
    if order_by.is_empty() && dialect.requires_order_by_for_paging() && (query.limit.is_some() || query.offset.is_some()) {
        // Synthesize a default ORDER BY on the first column, the way the
        // design's MSSQL adapter does when paging is requested without one.
        if let Some(first) = schema.fields.first() {
            order_by.push(super::ast::OrderKey::asc(first.name.clone()));
        } else {
            return Err(UntranslatableReason::PagingNeedsOrderBy);
        }
    }

    if !order_by.is_empty() {
        let keys: Vec<String> = order_by
            .iter()
            .map(|k| {
                format!(
                    "{} {}",
                    dialect.quote(&k.field),
                    if k.descending { "DESC" } else { "ASC" }
                )
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    match dialect {
        Dialect::Mssql => {
            if query.limit.is_some() || query.offset.is_some() {
                if order_by.is_empty() {
                    return Err(UntranslatableReason::PagingNeedsOrderBy);
                }
                let offset = query.offset.unwrap_or(0);
                sql.push_str(&format!(" OFFSET {offset} ROWS"));
                if let Some(limit) = query.limit {
                    sql.push_str(&format!(" FETCH NEXT {limit} ROWS ONLY"));
                }
            }
        }
        _ => {
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = query.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
    }

    Ok(sql)
}

fn quote_table(table: &str, dialect: Dialect) -> String {
    dialect.quote(table)
}

fn translate_node(node: &FilterNode, dialect: Dialect) -> Result<String, UntranslatableReason> {
    match node {
        FilterNode::Leaf(f) => translate_leaf(f, dialect),
        FilterNode::Group { op, children } => {
            if *op == BoolOp::Or {
                check_or_group_compatible(children)?;
            }
            let parts: Vec<String> = children
                .iter()
                .map(|c| translate_node(c, dialect))
                .collect::<Result<_, _>>()?;
            let joiner = match op {
                BoolOp::And => " AND ",
                BoolOp::Or => " OR ",
            };
            Ok(format!("({})", parts.join(joiner)))
        }
    }
}

/// An OR group mixing operators whose value domains can't be compared
/// uniformly (e.g. a numeric range next to a LIKE) is rejected rather than
/// emitting SQL whose semantics would silently diverge from the executor.
fn check_or_group_compatible(children: &[FilterNode]) -> Result<(), UntranslatableReason> {
    let ops: Vec<CompareOp> = children
        .iter()
        .flat_map(|c| c.leaves())
        .map(|f| f.operator)
        .collect();
    let has_like = ops.iter().any(|o| *o == CompareOp::Like);
    let has_range = ops
        .iter()
        .any(|o| matches!(o, CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le | CompareOp::Between));
    if has_like && has_range {
        return Err(UntranslatableReason::IncompatibleOrGroup);
    }
    Ok(())
}

fn translate_leaf(filter: &Filter, dialect: Dialect) -> Result<String, UntranslatableReason> {
    let col = dialect.quote(&filter.field);
    Ok(match filter.operator {
        CompareOp::Eq => format!("{col} = {}", sql_literal(filter.value.as_deref().unwrap_or(""))),
        CompareOp::Ne => format!("{col} <> {}", sql_literal(filter.value.as_deref().unwrap_or(""))),
        CompareOp::Gt => format!("{col} > {}", sql_literal(filter.value.as_deref().unwrap_or(""))),
        CompareOp::Lt => format!("{col} < {}", sql_literal(filter.value.as_deref().unwrap_or(""))),
        CompareOp::Ge => format!("{col} >= {}", sql_literal(filter.value.as_deref().unwrap_or(""))),
        CompareOp::Le => format!("{col} <= {}", sql_literal(filter.value.as_deref().unwrap_or(""))),
        CompareOp::Like => format!("{col} LIKE {}", sql_literal(filter.value.as_deref().unwrap_or(""))),
        CompareOp::In => {
            let items: Vec<String> = filter
                .value
                .as_deref()
                .unwrap_or("")
                .split(',')
                .map(|v| sql_literal(v.trim()))
                .collect();
            format!("{col} IN ({})", items.join(", "))
        }
        CompareOp::Between => format!(
            "{col} BETWEEN {} AND {}",
            sql_literal(filter.value.as_deref().unwrap_or("")),
            sql_literal(filter.value2.as_deref().unwrap_or(""))
        ),
        CompareOp::IsNull => format!("{col} IS NULL"),
        CompareOp::IsNotNull => format!("{col} IS NOT NULL"),
    })
}

/// Single-quotes and escapes a literal for inline SQL text.
///
/// Adapters that execute this SQL through a parameterized driver API may
/// prefer to re-derive bind parameters from the AST directly; this string
/// form exists for adapters (and tests) that need one complete statement.
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use crate::value::FieldType;

    fn schema() -> Schema {
        Schema::new(vec![Field::new("id", FieldType::Integer)])
    }

    #[test]
    fn mssql_paging_without_order_by_synthesizes_one() {
        let query = Query::new().with_limit(10).with_offset(20);
        let sql = translate(&query, "orders", &schema(), Dialect::Mssql).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM [orders] ORDER BY [id] ASC OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn postgres_uses_limit_offset() {
        let query = Query::new().with_limit(5).with_offset(0);
        let sql = translate(&query, "orders", &schema(), Dialect::Postgres).unwrap();
        assert_eq!(sql, "SELECT * FROM \"orders\" LIMIT 5 OFFSET 0");
    }

    #[test]
    fn incompatible_or_group_is_rejected() {
        let query = Query::new().with_filters(FilterNode::or(vec![
            FilterNode::Leaf(Filter::new("id", CompareOp::Like, Some("a%".into()))),
            FilterNode::Leaf(Filter::new("id", CompareOp::Gt, Some("1".into()))),
        ]));
        assert!(translate(&query, "t", &schema(), Dialect::Postgres).is_err());
    }
}
