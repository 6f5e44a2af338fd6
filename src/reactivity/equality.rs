// ============================================================================
// spark-recompose - Equality Policies
// Per-cell decision of whether a write is a distinct value
// ============================================================================
//
// A write whose value is equal to the current value under the cell's policy is
// elided: no version bump, no invalidation. Which notion of "equal" applies is
// never implicit - every cell carries an explicit Policy.
// ============================================================================

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::core::types::EqualsFn;

// =============================================================================
// EQUALITY FUNCTIONS
// =============================================================================

/// Structural equality using PartialEq.
///
/// # Example
/// ```
/// use spark_recompose::reactivity::equality::equals;
///
/// assert!(equals(&42, &42));
/// assert!(!equals(&42, &43));
/// ```
pub fn equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

/// NaN-safe equality for f64: NaN equals NaN.
///
/// # Example
/// ```
/// use spark_recompose::reactivity::equality::safe_equals_f64;
///
/// assert!(safe_equals_f64(&1.0, &1.0));
/// assert!(safe_equals_f64(&f64::NAN, &f64::NAN));
/// assert!(!safe_equals_f64(&f64::NAN, &1.0));
/// ```
pub fn safe_equals_f64(a: &f64, b: &f64) -> bool {
    if a.is_nan() {
        return b.is_nan();
    }
    a == b
}

/// NaN-safe equality for f32.
pub fn safe_equals_f32(a: &f32, b: &f32) -> bool {
    if a.is_nan() {
        return b.is_nan();
    }
    a == b
}

/// NaN-safe equality for optional f64 values.
pub fn safe_equals_option_f64(a: &Option<f64>, b: &Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => safe_equals_f64(a, b),
        _ => false,
    }
}

/// Shallow equality for slices - compares elements one level deep.
pub fn shallow_equals_slice<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

/// Compare values by a projected field.
///
/// # Example
/// ```
/// use spark_recompose::reactivity::equality::by_field;
///
/// struct User { id: u32, name: &'static str }
///
/// let same_user = by_field(|u: &User| u.id);
/// assert!(same_user(&User { id: 1, name: "a" }, &User { id: 1, name: "b" }));
/// ```
pub fn by_field<T, F, R>(field_fn: F) -> impl Fn(&T, &T) -> bool
where
    F: Fn(&T) -> R,
    R: PartialEq,
{
    move |a, b| field_fn(a) == field_fn(b)
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Types whose values have an identity distinct from their contents.
///
/// Identity equality treats two values as equal only if they are the same
/// allocation, even when their contents compare equal.
pub trait Identity {
    fn same_identity(&self, other: &Self) -> bool;
}

impl<T: ?Sized> Identity for Rc<T> {
    fn same_identity(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}

impl<T: ?Sized> Identity for Arc<T> {
    fn same_identity(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl<T: Identity> Identity for Option<T> {
    fn same_identity(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_identity(b),
            _ => false,
        }
    }
}

fn identity_equals<T: Identity>(a: &T, b: &T) -> bool {
    a.same_identity(b)
}

// =============================================================================
// POLICY
// =============================================================================

enum PolicyKind<T> {
    Structural(EqualsFn<T>),
    Identity(EqualsFn<T>),
    Never,
    Custom(Rc<dyn Fn(&T, &T) -> bool>),
}

/// The equality policy of a state cell.
///
/// # Example
/// ```
/// use spark_recompose::Policy;
///
/// let structural = Policy::<i32>::structural();
/// assert!(structural.equals(&1, &1));
///
/// let never = Policy::<i32>::never();
/// assert!(!never.equals(&1, &1));
/// ```
pub struct Policy<T> {
    kind: PolicyKind<T>,
}

impl<T> Policy<T> {
    /// Equal when `PartialEq` says so.
    pub fn structural() -> Self
    where
        T: PartialEq,
    {
        Self {
            kind: PolicyKind::Structural(equals::<T>),
        }
    }

    /// Equal only when both values are the same allocation.
    pub fn identity() -> Self
    where
        T: Identity,
    {
        Self {
            kind: PolicyKind::Identity(identity_equals::<T>),
        }
    }

    /// Never equal: every write bumps the version and invalidates readers.
    pub fn never() -> Self {
        Self {
            kind: PolicyKind::Never,
        }
    }

    /// Equal when the given function says so.
    pub fn custom(f: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self {
            kind: PolicyKind::Custom(Rc::new(f)),
        }
    }

    /// Decide whether `a` and `b` are the same value under this policy.
    pub fn equals(&self, a: &T, b: &T) -> bool {
        match &self.kind {
            PolicyKind::Structural(f) | PolicyKind::Identity(f) => f(a, b),
            PolicyKind::Never => false,
            PolicyKind::Custom(f) => f(a, b),
        }
    }

    /// Short name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self.kind {
            PolicyKind::Structural(_) => "structural",
            PolicyKind::Identity(_) => "identity",
            PolicyKind::Never => "never",
            PolicyKind::Custom(_) => "custom",
        }
    }
}

impl Policy<f64> {
    /// Structural equality where NaN equals NaN.
    pub fn nan_safe() -> Self {
        Self {
            kind: PolicyKind::Structural(safe_equals_f64),
        }
    }
}

impl Policy<f32> {
    /// Structural equality where NaN equals NaN.
    pub fn nan_safe() -> Self {
        Self {
            kind: PolicyKind::Structural(safe_equals_f32),
        }
    }
}

impl<T> Clone for Policy<T> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            PolicyKind::Structural(f) => PolicyKind::Structural(*f),
            PolicyKind::Identity(f) => PolicyKind::Identity(*f),
            PolicyKind::Never => PolicyKind::Never,
            PolicyKind::Custom(f) => PolicyKind::Custom(f.clone()),
        };
        Self { kind }
    }
}

impl<T: PartialEq> Default for Policy<T> {
    fn default() -> Self {
        Self::structural()
    }
}

impl<T> fmt::Debug for Policy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Policy").field(&self.name()).finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_equals_f64() {
        assert!(safe_equals_f64(&1.0, &1.0));
        assert!(!safe_equals_f64(&1.0, &2.0));
        assert!(safe_equals_f64(&-0.0, &0.0));
        assert!(safe_equals_f64(&f64::NAN, &f64::NAN));
        assert!(!safe_equals_f64(&1.0, &f64::NAN));
        assert!(safe_equals_f64(&f64::INFINITY, &f64::INFINITY));
    }

    #[test]
    fn test_safe_equals_f32_and_option() {
        assert!(safe_equals_f32(&f32::NAN, &f32::NAN));
        assert!(!safe_equals_f32(&f32::NAN, &1.0));
        assert!(safe_equals_option_f64(&Some(f64::NAN), &Some(f64::NAN)));
        assert!(!safe_equals_option_f64(&Some(1.0), &None));
    }

    #[test]
    fn test_shallow_equals_slice() {
        assert!(shallow_equals_slice(&[1, 2, 3], &[1, 2, 3]));
        assert!(!shallow_equals_slice(&[1, 2, 3], &[1, 2, 4]));
        assert!(!shallow_equals_slice(&[1, 2], &[1, 2, 3]));
    }

    #[test]
    fn structural_policy_uses_partial_eq() {
        let policy = Policy::<Vec<i32>>::structural();
        assert!(policy.equals(&vec![1, 2], &vec![1, 2]));
        assert!(!policy.equals(&vec![1, 2], &vec![2, 1]));
        assert_eq!(policy.name(), "structural");
    }

    #[test]
    fn identity_policy_ignores_contents() {
        let policy = Policy::<Rc<String>>::identity();
        let a = Rc::new("same".to_string());
        let b = Rc::new("same".to_string());

        assert!(policy.equals(&a, &a.clone()));
        assert!(!policy.equals(&a, &b));
        assert_eq!(policy.name(), "identity");
    }

    #[test]
    fn never_policy_never_elides() {
        let policy = Policy::<i32>::never();
        assert!(!policy.equals(&42, &42));
    }

    #[test]
    fn custom_policy_by_field() {
        #[derive(Clone)]
        struct User {
            id: u32,
            #[allow(dead_code)]
            name: String,
        }

        let policy = Policy::custom(by_field(|u: &User| u.id));
        let a = User {
            id: 1,
            name: "Alice".to_string(),
        };
        let b = User {
            id: 1,
            name: "Bob".to_string(),
        };
        assert!(policy.equals(&a, &b));
        assert!(policy.clone().equals(&a, &b));
    }

    #[test]
    fn nan_safe_policies() {
        assert!(Policy::<f64>::nan_safe().equals(&f64::NAN, &f64::NAN));
        assert!(!Policy::<f64>::structural().equals(&f64::NAN, &f64::NAN));
        assert!(Policy::<f32>::nan_safe().equals(&f32::NAN, &f32::NAN));
    }

    #[test]
    fn option_identity() {
        let a = Some(Rc::new(1));
        assert!(a.same_identity(&a.clone()));
        assert!(None::<Rc<i32>>.same_identity(&None));
        assert!(!a.same_identity(&None));
    }
}
