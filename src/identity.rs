//! Call identity: the (function, arguments) key of a cacheable computation.

use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types that can serve as call arguments.
///
/// It is automatically implemented for all types that implement
/// `Hash + Eq + Debug + Send + Sync + 'static`, and it is object-safe so that
/// arguments of any type can be stored in one registry.
pub trait CacheKey: DynHash + DynEq + Debug + Send + Sync {
    /// Get the key as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Get the type name for this key.
    fn type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

dyn_hash::hash_trait_object!(CacheKey);

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered compute function.
///
/// Two functions registered under the same name are still distinct: the id is
/// allocated once per registration and the name is only used for display.
#[derive(Clone, Copy)]
pub struct FunctionId {
    id: u64,
    name: &'static str,
}

impl FunctionId {
    /// Allocate a new function identity.
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed),
            name,
        }
    }

    /// The display name the function was registered with.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The numeric id of this function.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

impl PartialEq for FunctionId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FunctionId {}

impl Hash for FunctionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Canonical key of a computed value: function identity plus its arguments.
///
/// Equality and hashing are value-based, so two calls with equal arguments
/// resolve to the same registry entry. Cloning is cheap.
#[derive(Clone)]
pub struct CallIdentity {
    function: FunctionId,
    args: Arc<dyn CacheKey>,
}

impl CallIdentity {
    /// Create a new call identity.
    pub fn new<K: CacheKey + 'static>(function: FunctionId, args: K) -> Self {
        Self {
            function,
            args: Arc::new(args),
        }
    }

    /// The function this call belongs to.
    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Downcast the arguments to their original type.
    pub fn args<K: 'static>(&self) -> Option<&K> {
        self.args.as_any().downcast_ref()
    }

    /// Debug representation of the arguments only.
    pub fn args_debug(&self) -> String {
        format!("{:?}", self.args)
    }

    /// Debug representation of the whole call, e.g. `counter.get("a")`.
    pub fn debug_repr(&self) -> String {
        format!("{}({:?})", self.function.name, self.args)
    }
}

impl Debug for CallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.function.name, self.args)
    }
}

impl Hash for CallIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.function.hash(state);
        self.args.hash(state);
    }
}

impl PartialEq for CallIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function && self.args.dyn_eq(other.args.as_any())
    }
}

impl Eq for CallIdentity {}

/// An argument that never takes part in call identity.
///
/// Wrap arguments such as cancellation tokens in `Ignored` so that calls which
/// only differ by them collide on the same cached value.
///
/// ```
/// use computed_flow::{CallIdentity, FunctionId, Ignored};
///
/// let f = FunctionId::new("user.get");
/// let a = CallIdentity::new(f, (7u32, Ignored("token-a")));
/// let b = CallIdentity::new(f, (7u32, Ignored("token-b")));
/// assert_eq!(a, b);
/// ```
#[derive(Clone, Copy, Default)]
pub struct Ignored<T>(pub T);

impl<T> Hash for Ignored<T> {
    fn hash<H: Hasher>(&self, _state: &mut H) {}
}

impl<T> PartialEq for Ignored<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> Eq for Ignored<T> {}

impl<T> Debug for Ignored<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("_")
    }
}
