//! Route and filter definitions.
//!
//! A route set is a list of [`RouteDef`]s: an id, a predicate list, a
//! filter chain, and a backend. Definitions are plain data; the engine
//! in [`crate::engine`] turns them into live [`crate::engine::Route`]s
//! by instantiating the filter chain through a
//! [`crate::filter::FilterRegistry`].
//!
//! The `Display` impls render the conventional textual form,
//! `id: Path("/foo") -> setPath("/bar") -> <shunt>`, which tests use to
//! assert on rewritten filter chains.

use std::fmt;

/// A filter argument as declared in a route definition.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Arg {
    /// Integer value, if this argument is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value; integers coerce.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Arg::Float(v) => Some(*v),
            Arg::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// String value, if this argument is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{}", v),
            Arg::Float(v) => write!(f, "{}", v),
            Arg::Str(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

/// A filter reference in a route definition: name plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDef {
    pub name: String,
    pub args: Vec<Arg>,
}

impl FilterDef {
    pub fn new(name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self { name: name.into(), args }
    }
}

impl fmt::Display for FilterDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Route matching condition. An empty predicate list is the wildcard `*`.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Exact request path match.
    Path(String),
}

impl Predicate {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Predicate::Path(p) => p == path,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Path(p) => write!(f, "Path(\"{}\")", p),
        }
    }
}

/// Where a route sends the request after its filter chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// Terminate the request in the proxy with a 200 response.
    Shunt,
    /// Forward to an upstream address.
    Network(String),
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Shunt => write!(f, "<shunt>"),
            Backend::Network(addr) => write!(f, "\"{}\"", addr),
        }
    }
}

/// A single route definition within a route set.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDef {
    pub id: String,
    pub predicates: Vec<Predicate>,
    pub filters: Vec<FilterDef>,
    pub backend: Backend,
}

impl RouteDef {
    /// A wildcard, shunting route with the given id and no filters.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), predicates: Vec::new(), filters: Vec::new(), backend: Backend::Shunt }
    }

    /// Add an exact-path predicate.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.predicates.push(Predicate::Path(path.into()));
        self
    }

    /// Append a filter to the chain.
    pub fn with_filter(mut self, name: impl Into<String>, args: Vec<Arg>) -> Self {
        self.filters.push(FilterDef::new(name, args));
        self
    }

    /// Replace the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Whether this route applies to the given request path.
    pub fn matches(&self, path: &str) -> bool {
        self.predicates.iter().all(|p| p.matches(path))
    }

    /// The textual form without the id prefix:
    /// `* -> setPath("/foo") -> <shunt>`.
    pub fn expression(&self) -> String {
        let mut out = String::new();
        if self.predicates.is_empty() {
            out.push('*');
        } else {
            for (i, p) in self.predicates.iter().enumerate() {
                if i > 0 {
                    out.push_str(" && ");
                }
                out.push_str(&p.to_string());
            }
        }
        for filter in &self.filters {
            out.push_str(" -> ");
            out.push_str(&filter.to_string());
        }
        out.push_str(" -> ");
        out.push_str(&self.backend.to_string());
        out
    }
}

impl fmt::Display for RouteDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.expression())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_everything() {
        let def = RouteDef::new("r0");
        assert!(def.matches("/foo"));
        assert!(def.matches("/"));
    }

    #[test]
    fn test_path_predicate() {
        let def = RouteDef::new("r1").with_path("/one");
        assert!(def.matches("/one"));
        assert!(!def.matches("/two"));
    }

    #[test]
    fn test_expression_format() {
        let def = RouteDef::new("r2")
            .with_filter("setPath", vec!["/foo".into()])
            .with_filter("lifo", vec![2.into(), 2.into(), "10s".into()]);
        assert_eq!(def.expression(), "* -> setPath(\"/foo\") -> lifo(2, 2, \"10s\") -> <shunt>");
        assert_eq!(def.to_string(), "r2: * -> setPath(\"/foo\") -> lifo(2, 2, \"10s\") -> <shunt>");
    }

    #[test]
    fn test_expression_with_predicate_and_backend() {
        let def = RouteDef::new("r3")
            .with_path("/api")
            .with_backend(Backend::Network("http://upstream.test".to_string()));
        assert_eq!(def.expression(), "Path(\"/api\") -> \"http://upstream.test\"");
    }

    #[test]
    fn test_arg_accessors() {
        assert_eq!(Arg::Int(7).as_int(), Some(7));
        assert_eq!(Arg::Int(7).as_float(), Some(7.0));
        assert_eq!(Arg::Str("g".into()).as_str(), Some("g"));
        assert_eq!(Arg::Str("g".into()).as_int(), None);
    }
}
