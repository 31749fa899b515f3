//! TDTQL AST (C3): a portable filter/order/paging query language.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    Like,
    In,
    Between,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn from_wire(token: &str) -> Option<Self> {
        Some(match token {
            "=" => CompareOp::Eq,
            "≠" | "!=" => CompareOp::Ne,
            ">" => CompareOp::Gt,
            "<" => CompareOp::Lt,
            "≥" | ">=" => CompareOp::Ge,
            "≤" | "<=" => CompareOp::Le,
            "like" => CompareOp::Like,
            "in" => CompareOp::In,
            "between" => CompareOp::Between,
            "is_null" => CompareOp::IsNull,
            "is_not_null" => CompareOp::IsNotNull,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "≠",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => "≥",
            CompareOp::Le => "≤",
            CompareOp::Like => "like",
            CompareOp::In => "in",
            CompareOp::Between => "between",
            CompareOp::IsNull => "is_null",
            CompareOp::IsNotNull => "is_not_null",
        }
    }

    pub fn needs_value2(self) -> bool {
        matches!(self, CompareOp::Between)
    }

    pub fn needs_value(self) -> bool {
        !matches!(self, CompareOp::IsNull | CompareOp::IsNotNull)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub operator: CompareOp,
    pub value: Option<String>,
    pub value2: Option<String>,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: CompareOp, value: Option<String>) -> Self {
        Filter {
            field: field.into(),
            operator,
            value,
            value2: None,
        }
    }

    pub fn between(field: impl Into<String>, lo: impl Into<String>, hi: impl Into<String>) -> Self {
        Filter {
            field: field.into(),
            operator: CompareOp::Between,
            value: Some(lo.into()),
            value2: Some(hi.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// A node of the filter tree: either a leaf predicate or a boolean group.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Leaf(Filter),
    Group { op: BoolOp, children: Vec<FilterNode> },
}

impl FilterNode {
    pub fn and(children: Vec<FilterNode>) -> Self {
        FilterNode::Group {
            op: BoolOp::And,
            children,
        }
    }

    pub fn or(children: Vec<FilterNode>) -> Self {
        FilterNode::Group {
            op: BoolOp::Or,
            children,
        }
    }

    /// Visits every leaf filter in the tree, depth-first.
    pub fn leaves(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Filter>) {
        match self {
            FilterNode::Leaf(f) => out.push(f),
            FilterNode::Group { children, .. } => {
                for c in children {
                    c.collect_leaves(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub field: String,
    pub descending: bool,
}

impl OrderKey {
    pub fn asc(field: impl Into<String>) -> Self {
        OrderKey {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        OrderKey {
            field: field.into(),
            descending: true,
        }
    }
}

/// A TDTQL query: filters + order + paging, `language="TDTQL" version="1.0"` on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Option<FilterNode>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn with_filters(mut self, filters: FilterNode) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_order_by(mut self, keys: Vec<OrderKey>) -> Self {
        self.order_by = keys;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Per-predicate match counters attached to a response's [`QueryContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateMatch {
    pub field: String,
    pub operator: String,
    pub matches: usize,
}

/// Attached only to response packets, first part only.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    pub query: Query,
    pub total: usize,
    pub after_filter: usize,
    pub returned: usize,
    pub more_data_available: bool,
    pub next_offset: Option<i64>,
    pub predicate_matches: Vec<PredicateMatch>,
}
