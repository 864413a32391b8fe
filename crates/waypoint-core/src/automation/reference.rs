//! Lazily resolved references.
//!
//! Nodes name their successors, methods and predicates by string while the
//! graph is being declared. Each reference is resolved once when the
//! definition is built and the resolved value is kept in place.

use super::error::NodeProblem;

/// A reference that is either still a name or already bound to its target.
#[derive(Clone)]
pub enum Ref<T> {
    Pending(String),
    Resolved(T),
}

impl<T> Ref<T> {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Pending(name.into())
    }

    /// Resolve through `lookup` unless already resolved. Repeated calls are
    /// no-ops and never invoke `lookup` again.
    pub fn resolve<F>(&mut self, lookup: F) -> Result<&T, NodeProblem>
    where
        F: FnOnce(&str) -> Result<T, NodeProblem>,
    {
        if let Self::Pending(name) = self {
            let value = lookup(name)?;
            *self = Self::Resolved(value);
        }
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Pending(name) => Err(NodeProblem::Unresolved(name.clone())),
        }
    }

    /// The resolved value.
    pub fn get(&self) -> Result<&T, NodeProblem> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Pending(name) => Err(NodeProblem::Unresolved(name.clone())),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

impl<T> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(name) => write!(f, "Pending({name})"),
            Self::Resolved(_) => f.write_str("Resolved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_resolves_once_and_memoizes() {
        let calls = Cell::new(0);
        let mut r: Ref<usize> = Ref::named("target");

        let v = *r
            .resolve(|name| {
                calls.set(calls.get() + 1);
                assert_eq!(name, "target");
                Ok(7)
            })
            .unwrap();
        assert_eq!(v, 7);

        let v = *r
            .resolve(|_| {
                calls.set(calls.get() + 1);
                Ok(99)
            })
            .unwrap();
        assert_eq!(v, 7);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_failed_lookup_stays_pending() {
        let mut r: Ref<usize> = Ref::named("missing");
        let err = r
            .resolve(|name| Err(NodeProblem::UnknownNode(name.to_string())))
            .unwrap_err();
        assert_eq!(err, NodeProblem::UnknownNode("missing".into()));
        assert!(!r.is_resolved());
        assert!(matches!(r.get(), Err(NodeProblem::Unresolved(_))));
    }

    #[test]
    fn test_resolved_value_needs_no_lookup() {
        let mut r = Ref::Resolved(3usize);
        assert_eq!(*r.resolve(|_| panic!("must not look up")).unwrap(), 3);
    }
}
