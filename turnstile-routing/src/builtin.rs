//! Builtin request filters.
//!
//! The small set of chain filters route documents commonly combine
//! with admission filters: `setPath` rewrites the request path,
//! `setRequestHeader` sets a request header.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::filter::{Filter, FilterContext, FilterError, FilterRegistry, FilterSpec};
use crate::route::Arg;

pub const SET_PATH_FILTER_NAME: &str = "setPath";
pub const SET_REQUEST_HEADER_FILTER_NAME: &str = "setRequestHeader";

struct SetPathFilter {
    path: String,
}

#[async_trait]
impl Filter for SetPathFilter {
    async fn request(&self, ctx: &mut FilterContext) {
        ctx.set_path(self.path.clone());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SetPathSpec;

impl FilterSpec for SetPathSpec {
    fn name(&self) -> &'static str {
        SET_PATH_FILTER_NAME
    }

    fn create(&self, args: &[Arg]) -> Result<Arc<dyn Filter>, FilterError> {
        match args {
            [arg] => {
                let path = arg.as_str().ok_or_else(|| FilterError::InvalidArgs {
                    filter: SET_PATH_FILTER_NAME.to_string(),
                    reason: "path must be a string".to_string(),
                })?;
                Ok(Arc::new(SetPathFilter { path: path.to_string() }))
            }
            _ => Err(FilterError::InvalidArgs {
                filter: SET_PATH_FILTER_NAME.to_string(),
                reason: "expected exactly one argument".to_string(),
            }),
        }
    }
}

struct SetRequestHeaderFilter {
    key: String,
    value: String,
}

#[async_trait]
impl Filter for SetRequestHeaderFilter {
    async fn request(&self, ctx: &mut FilterContext) {
        ctx.set_request_header(self.key.clone(), self.value.clone());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct SetRequestHeaderSpec;

impl FilterSpec for SetRequestHeaderSpec {
    fn name(&self) -> &'static str {
        SET_REQUEST_HEADER_FILTER_NAME
    }

    fn create(&self, args: &[Arg]) -> Result<Arc<dyn Filter>, FilterError> {
        match args {
            [key, value] => {
                let key = key.as_str().ok_or_else(|| invalid_header_args())?;
                let value = value.as_str().ok_or_else(|| invalid_header_args())?;
                Ok(Arc::new(SetRequestHeaderFilter {
                    key: key.to_string(),
                    value: value.to_string(),
                }))
            }
            _ => Err(invalid_header_args()),
        }
    }
}

fn invalid_header_args() -> FilterError {
    FilterError::InvalidArgs {
        filter: SET_REQUEST_HEADER_FILTER_NAME.to_string(),
        reason: "expected a header name and a value, both strings".to_string(),
    }
}

/// A registry with the builtin filters pre-registered.
pub fn builtin_registry() -> FilterRegistry {
    let mut registry = FilterRegistry::new();
    registry.register(Arc::new(SetPathSpec));
    registry.register(Arc::new(SetRequestHeaderSpec));
    registry
}
