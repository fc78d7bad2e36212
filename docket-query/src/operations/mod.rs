//! Fluent request builders.
//!
//! Every builder is created from a [`crate::Collection`] together with the
//! [`crate::OpContext`] it runs under, accumulates settings with
//! `mut self -> Self` setters, and is consumed by its terminal operation.

mod aggregate;
mod bulk;
mod distinct;
mod find_and_modify;
mod query;
mod watch;

pub use aggregate::Aggregate;
pub use bulk::Bulk;
pub use distinct::Distinct;
pub use find_and_modify::{
    DeleteKind, FindAndModify, FindDelete, FindReplace, FindUpdate, ReplaceKind, UpdateKind,
};
pub use query::Query;
pub use watch::Watch;
