use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use truss_utils::safe_panic;

use crate::{CodecError, Deserializer, Serializer, Wire};

type StoreFn<B> = Box<dyn for<'x> Fn(&'x B, &mut Serializer<'x>) + Send + Sync>;
type LoadFn = for<'x> fn(&mut Deserializer<'x>);
type FinishFn<B> = Box<dyn Fn(Box<dyn Any>) -> Option<Box<B>> + Send + Sync>;

pub(crate) struct TypeEntry<B: ?Sized> {
    protocol: u8,
    kind: u8,
    store: StoreFn<B>,
    load: LoadFn,
    finish: FinishFn<B>,
}

impl<B: ?Sized> TypeEntry<B> {
    #[inline]
    pub(crate) fn wire_pair(&self) -> (u8, u8) {
        (self.protocol, self.kind)
    }

    #[inline]
    pub(crate) fn store<'x>(&self, v: &'x B, s: &mut Serializer<'x>) {
        (self.store)(v, s);
    }

    #[inline]
    pub(crate) fn load(&self, d: &mut Deserializer<'_>) {
        (self.load)(d);
    }
}

/// Registry of polymorphic types keyed both by runtime type (for storing)
/// and by the `(protocol, kind)` wire pair (for loading). Built once at
/// service start, then only read.
///
/// `B` is the base the wire drives, usually a trait object. The `as_any`
/// accessor recovers the concrete runtime type from a base reference:
///
/// ```ignore
/// let mut map: TypeMap<dyn Shape> = TypeMap::new(|v| v);
/// map.register::<Circle>(0, 10, |b| b)?;
/// ```
pub struct TypeMap<B: ?Sized + 'static> {
    as_any: fn(&B) -> &dyn Any,
    entries: Vec<TypeEntry<B>>,
    by_runtime: HashMap<TypeId, usize>,
    by_wire: HashMap<(u8, u8), usize>,
}

impl<B: ?Sized + 'static> std::fmt::Debug for TypeMap<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeMap").field("entries", &self.entries.len()).finish()
    }
}

impl<B: ?Sized + 'static> TypeMap<B> {
    pub fn new(as_any: fn(&B) -> &dyn Any) -> Self {
        Self {
            as_any,
            entries: Vec::new(),
            by_runtime: HashMap::new(),
            by_wire: HashMap::new(),
        }
    }

    /// Registers `T` under a wire pair. `into_base` lifts a loaded concrete
    /// box into the base; for trait objects it is the unsize coercion
    /// `|b| b`.
    pub fn register<T: Wire>(
        &mut self,
        protocol: u8,
        kind: u8,
        into_base: fn(Box<T>) -> Box<B>,
    ) -> Result<&mut Self, CodecError> {
        if self.by_wire.contains_key(&(protocol, kind))
            || self.by_runtime.contains_key(&TypeId::of::<T>())
        {
            return Err(CodecError::DuplicateType { protocol, kind });
        }
        let as_any = self.as_any;
        let idx = self.entries.len();
        let store: StoreFn<B> = Box::new(move |v, s| match as_any(v).downcast_ref::<T>() {
            Some(concrete) => concrete.store(s),
            None => safe_panic!("type map store reached with a foreign value"),
        });
        self.entries.push(TypeEntry {
            protocol,
            kind,
            store,
            load: load_shim::<T>,
            finish: Box::new(move |any| any.downcast::<T>().ok().map(into_base)),
        });
        self.by_runtime.insert(TypeId::of::<T>(), idx);
        self.by_wire.insert((protocol, kind), idx);
        Ok(self)
    }

    pub(crate) fn entry_for_value(&self, v: &B) -> Option<&TypeEntry<B>> {
        let id = (self.as_any)(v).type_id();
        self.by_runtime.get(&id).map(|&idx| &self.entries[idx])
    }

    pub(crate) fn entry_for_wire(&self, protocol: u8, kind: u8) -> Option<(usize, &TypeEntry<B>)> {
        self.by_wire.get(&(protocol, kind)).map(|&idx| (idx, &self.entries[idx]))
    }

    pub(crate) fn finish(&self, idx: usize, concrete: Box<dyn Any>) -> Option<Box<B>> {
        (self.entries[idx].finish)(concrete)
    }

    /// Wire pair registered for `T`, if any.
    pub fn pair_of<T: 'static>(&self) -> Option<(u8, u8)> {
        self.by_runtime.get(&TypeId::of::<T>()).map(|&idx| self.entries[idx].wire_pair())
    }
}

fn load_shim<T: Wire>(d: &mut Deserializer<'_>) {
    T::load(d);
}
