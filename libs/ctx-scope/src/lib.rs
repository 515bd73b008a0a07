//! Request-scoped context slots with inheritance and lazy defaults.
//!
//! A [`Scope`] is a typed bag of named values propagated along a logical
//! call chain. [`run`] establishes a new scope around an `async` block,
//! inheriting from whatever scope is already current; [`Slot::get`] reads
//! a value out of the current scope, materialising its default producer at
//! most once per scope if nothing closer in the ancestor chain has already
//! produced one.
//!
//! The scheduling model is single-threaded cooperative at the logical-task
//! level: the scope is bound to the `Future` passed to [`run`] via
//! [`tokio::task_local!`], not to a kernel thread, so it survives `.await`
//! points and is inherited correctly by `tokio::spawn`ed children only if
//! they are spawned *inside* the scoped future (spawning breaks task-local
//! inheritance, same as any other task-local).

use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type BoxedValue = Box<dyn Any + Send + Sync>;

/// Identifies a [`Slot`] independent of its value type, so slot values of
/// different types can share one erased map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotId(u64);

fn next_slot_id() -> SlotId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    SlotId(NEXT.fetch_add(1, Ordering::Relaxed))
}

struct ScopeData {
    parent: Option<Arc<ScopeData>>,
    values: Mutex<HashMap<SlotId, BoxedValue>>,
}

impl ScopeData {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            values: Mutex::new(HashMap::new()),
        })
    }

    fn child(self: &Arc<Self>, overrides: HashMap<SlotId, BoxedValue>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(self.clone()),
            values: Mutex::new(overrides),
        })
    }

    /// Look up an already-materialised value anywhere in the ancestor
    /// chain, without triggering materialisation. Used for inherited
    /// slots: a parent-provided value must not invoke the child's default.
    fn find_inherited<T: Clone + Send + Sync + 'static>(&self, id: SlotId) -> Option<T> {
        if let Some(v) = self.values.lock().get(&id) {
            return v.downcast_ref::<T>().cloned();
        }
        self.parent.as_ref().and_then(|p| p.find_inherited(id))
    }
}

tokio::task_local! {
    static CURRENT: Arc<ScopeData>;
}

/// A pending set of slot values to seed a new scope or merge into the
/// current one.
#[derive(Default)]
pub struct Overrides {
    values: HashMap<SlotId, BoxedValue>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Clone + Send + Sync + 'static>(mut self, slot: &Slot<T>, value: T) -> Self {
        self.values.insert(slot.id, Box::new(value));
        self
    }
}

/// A declared, typed context slot.
///
/// Slots are ordinarily declared once (e.g. behind a `once_cell::sync::Lazy`
/// or a `static` constructed in a wiring module) and shared by reference
/// throughout the call tree that needs them.
pub struct Slot<T> {
    id: SlotId,
    name: &'static str,
    inherited: bool,
    default: Option<Arc<dyn Fn() -> T + Send + Sync>>,
}

impl<T: Clone + Send + Sync + 'static> Slot<T> {
    /// A slot with no default: [`Slot::get`] returns `None` until
    /// something in scope sets it via [`Overrides::set`] or [`attach`].
    pub fn new(name: &'static str) -> Self {
        Self {
            id: next_slot_id(),
            name,
            inherited: true,
            default: None,
        }
    }

    /// A slot whose default producer is invoked lazily, at most once per
    /// scope, the first time [`Slot::get`] finds no value anywhere in the
    /// ancestor chain.
    pub fn with_default(name: &'static str, default: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            id: next_slot_id(),
            name,
            inherited: true,
            default: Some(Arc::new(default)),
        }
    }

    /// Mark this slot non-inherited: every nested scope re-materialises it
    /// fresh (via the default producer) unless explicitly overridden,
    /// instead of inheriting an ancestor's value.
    pub fn non_inherited(mut self) -> Self {
        self.inherited = false;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read this slot's value in the current scope, materialising the
    /// default at most once if nothing already has a value.
    pub fn get(&self) -> Option<T> {
        CURRENT
            .try_with(|scope| self.get_in(scope))
            .unwrap_or_else(|_| self.default.as_ref().map(|f| f()))
    }

    pub fn get_or(&self, fallback: T) -> T {
        self.get().unwrap_or(fallback)
    }

    fn get_in(&self, scope: &Arc<ScopeData>) -> Option<T> {
        if let Some(v) = scope.values.lock().get(&self.id) {
            return v.downcast_ref::<T>().cloned();
        }

        if self.inherited {
            if let Some(parent) = &scope.parent {
                if let Some(v) = parent.find_inherited::<T>(self.id) {
                    return Some(v);
                }
            }
        }

        let produced = self.default.as_ref().map(|f| f())?;
        scope
            .values
            .lock()
            .insert(self.id, Box::new(produced.clone()));
        Some(produced)
    }
}

impl<T: Clone + serde::Serialize + Send + Sync + 'static> ErasedSlot for Slot<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read_json(&self) -> Option<Value> {
        self.get().and_then(|v| serde_json::to_value(v).ok())
    }
}

/// Object-safe view of a [`Slot`] used to build a name-keyed [`snapshot`]
/// across heterogeneously typed slots.
pub trait ErasedSlot {
    fn name(&self) -> &'static str;
    fn read_json(&self) -> Option<Value>;
}

/// Enter a new scope around `fut`, inheriting from whatever scope is
/// current (or starting a fresh root scope if none is), applying
/// `overrides` directly into the new scope's own values.
pub async fn run<T>(overrides: Overrides, fut: impl Future<Output = T>) -> T {
    let parent = CURRENT.try_with(|s| s.clone()).ok();
    let scope = match parent {
        Some(p) => p.child(overrides.values),
        None => {
            let root = ScopeData::root();
            root.child(overrides.values)
        }
    };
    CURRENT.scope(scope, fut).await
}

/// Mutate the current scope's own values. Visible only within this scope
/// and the scopes nested inside it, never to the parent or to sibling
/// scopes.
pub fn attach(overrides: Overrides) {
    CURRENT
        .try_with(|scope| {
            scope.values.lock().extend(overrides.values);
        })
        .ok();
}

/// Returns true if a scope (root or nested) is currently established.
pub fn in_scope() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

/// Build a flat, name-keyed snapshot of the given slots' current values.
/// Slots with no value (no default and nothing set) are omitted.
pub fn snapshot(fields: &[&dyn ErasedSlot]) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for field in fields {
        if let Some(value) = field.read_json() {
            map.insert(field.name().to_string(), value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_materialises_once_per_scope() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let slot = Slot::<i32>::with_default("counter", || {
            CALLS.fetch_add(1, Ordering::SeqCst);
            42
        });

        run(Overrides::new(), async {
            assert_eq!(slot.get(), Some(42));
            assert_eq!(slot.get(), Some(42));
            assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn inherited_slot_is_visible_to_nested_scope() {
        let slot = Slot::<&'static str>::new("tenant");

        run(Overrides::new().set(&slot, "acme"), async {
            run(Overrides::new(), async {
                assert_eq!(slot.get(), Some("acme"));
            })
            .await;
        })
        .await;
    }

    #[tokio::test]
    async fn non_inherited_slot_does_not_leak_into_child() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CALLS: AtomicU32 = AtomicU32::new(0);
        let slot = Slot::<u32>::with_default("request_id", || {
            CALLS.fetch_add(1, Ordering::SeqCst)
        })
        .non_inherited();

        run(Overrides::new(), async {
            let outer = slot.get();
            run(Overrides::new(), async {
                let inner = slot.get();
                assert_ne!(outer, inner, "non-inherited slot must re-materialise");
            })
            .await;
        })
        .await;

        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn parent_value_blocks_child_default() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static CHILD_DEFAULT_RAN: AtomicBool = AtomicBool::new(false);
        let slot = Slot::<i32>::with_default("x", || {
            CHILD_DEFAULT_RAN.store(true, Ordering::SeqCst);
            0
        });

        run(Overrides::new().set(&slot, 7), async {
            run(Overrides::new(), async {
                assert_eq!(slot.get(), Some(7));
            })
            .await;
        })
        .await;

        assert!(!CHILD_DEFAULT_RAN.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn attach_is_visible_only_within_scope_and_children() {
        let slot = Slot::<i32>::new("attached");

        run(Overrides::new(), async {
            attach(Overrides::new().set(&slot, 99));
            assert_eq!(slot.get(), Some(99));
            run(Overrides::new(), async {
                assert_eq!(slot.get(), Some(99));
            })
            .await;
        })
        .await;

        assert_eq!(slot.get(), None);
    }

    #[tokio::test]
    async fn snapshot_collects_named_values() {
        let tenant = Slot::<String>::new("tenant_id");
        let user = Slot::<String>::new("user_id");

        run(
            Overrides::new()
                .set(&tenant, "acme".to_string())
                .set(&user, "u-1".to_string()),
            async {
                let snap = snapshot(&[&tenant, &user]);
                assert_eq!(snap.get("tenant_id").unwrap(), "acme");
                assert_eq!(snap.get("user_id").unwrap(), "u-1");
            },
        )
        .await;
    }
}
