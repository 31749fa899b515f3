//! TDTQL: the filter/order/paging query sub-language (C3 + C4).

pub mod ast;
pub mod exec;
pub mod translate;

pub use ast::{BoolOp, CompareOp, Filter, FilterNode, OrderKey, PredicateMatch, Query, QueryContext};
pub use exec::{compare_values, execute};
pub use translate::{translate, Dialect, UntranslatableReason};
