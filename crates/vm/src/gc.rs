//! Garbage-collected heap for the Brio VM.
//!
//! All heap objects live in a single growable arena owned by `Heap`;
//! references between objects are typed `GcPtr<T>` handles wrapping a slot
//! index. Collection is mark-and-sweep with an explicit gray worklist:
//! mark everything reachable from the roots the VM hands in, then sweep
//! unmarked slots back onto a free list. The heap is non-moving, so a
//! handle stays valid for as long as its object is reachable.
//!
//! Collection is triggered by live-byte accounting: every allocation is
//! charged through the single `alloc` primitive, and the VM polls
//! [`Heap::should_collect`] at its per-instruction safepoint.

use std::fmt;
use std::marker::PhantomData;

use smallvec::SmallVec;
use tracing::debug;

use crate::chunk::Chunk;
use crate::value::{format_number, Value};
use crate::vm::NativeFn;

/// Raw index into the heap. Used for type-erased operations (rooting,
/// the gray worklist, the sweep walk).
pub type RawGcPtr = u32;

/// A typed handle to a GC-managed object.
///
/// This is a lightweight `u32` index; the type parameter gives compile-time
/// safety without making the handle any bigger. `GcPtr` is `Copy` and
/// `Send`, so values can move between independent VM instances' threads
/// (each handle is only meaningful to the heap that produced it).
pub struct GcPtr<T> {
    index: RawGcPtr,
    _marker: PhantomData<fn() -> T>,
}

// Manually implement Copy and Clone to avoid T: Copy bounds
impl<T> Copy for GcPtr<T> {}

impl<T> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> GcPtr<T> {
    pub(crate) fn from_raw(index: RawGcPtr) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub fn as_raw(&self) -> RawGcPtr {
        self.index
    }

    /// Check if two handles refer to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcPtr({})", self.index)
    }
}

impl<T> PartialEq for GcPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for GcPtr<T> {}

impl<T> std::hash::Hash for GcPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

/// Upvalue handle array of a closure. Most closures capture few variables.
pub type UpvalueList = SmallVec<[GcPtr<GcUpvalue>; 4]>;

/// An immutable, interned string with its content hash cached.
#[derive(Clone, Debug, PartialEq)]
pub struct GcString {
    pub data: String,
    pub hash: u64,
}

/// A compiled function: bytecode plus call metadata.
///
/// Functions are built once by the compiler and immutable afterwards;
/// any number of closures may share one.
#[derive(Debug)]
pub struct GcFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` marks the implicit top-level script.
    pub name: Option<GcPtr<GcString>>,
}

/// A host function exposed to scripts.
#[derive(Clone)]
pub struct GcNative {
    pub name: String,
    pub function: NativeFn,
}

impl fmt::Debug for GcNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcNative").field("name", &self.name).finish()
    }
}

/// A function together with its captured environment.
#[derive(Clone, Debug)]
pub struct GcClosure {
    pub function: GcPtr<GcFunction>,
    pub upvalues: UpvalueList,
}

/// A captured variable cell.
///
/// While the variable's stack slot is live the cell is `Open` and holds the
/// slot index; when the slot is about to die the VM copies the value into
/// the cell, flipping it to `Closed`.
#[derive(Clone, Debug)]
pub enum GcUpvalue {
    Open(usize),
    Closed(Value),
}

impl GcUpvalue {
    /// The referenced stack slot, while open.
    pub fn stack_slot(&self) -> Option<usize> {
        match self {
            GcUpvalue::Open(slot) => Some(*slot),
            GcUpvalue::Closed(_) => None,
        }
    }
}

/// An immutable pair of values.
#[derive(Clone, Debug)]
pub struct GcTuple {
    pub first: Value,
    pub second: Value,
}

/// Object kind tag, mostly for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Tuple,
}

/// The payload of one heap slot.
pub enum HeapData {
    String(GcString),
    Function(GcFunction),
    Native(GcNative),
    Closure(GcClosure),
    Upvalue(GcUpvalue),
    Tuple(GcTuple),
}

impl HeapData {
    pub fn object_type(&self) -> ObjectType {
        match self {
            HeapData::String(_) => ObjectType::String,
            HeapData::Function(_) => ObjectType::Function,
            HeapData::Native(_) => ObjectType::Native,
            HeapData::Closure(_) => ObjectType::Closure,
            HeapData::Upvalue(_) => ObjectType::Upvalue,
            HeapData::Tuple(_) => ObjectType::Tuple,
        }
    }

    /// All heap references owned by this object, for tracing.
    ///
    /// Open upvalues deliberately report nothing: their referent lives in a
    /// stack slot, and the value stack is enumerated as a root set by the VM.
    pub fn gc_pointers(&self) -> Vec<RawGcPtr> {
        match self {
            HeapData::String(_) | HeapData::Native(_) => vec![],
            HeapData::Function(function) => {
                let mut ptrs: Vec<RawGcPtr> = function
                    .chunk
                    .constants
                    .iter()
                    .filter_map(|v| v.as_gc_ptr())
                    .collect();
                if let Some(name) = function.name {
                    ptrs.push(name.as_raw());
                }
                ptrs
            }
            HeapData::Closure(closure) => {
                let mut ptrs = vec![closure.function.as_raw()];
                ptrs.extend(closure.upvalues.iter().map(|uv| uv.as_raw()));
                ptrs
            }
            HeapData::Upvalue(GcUpvalue::Open(_)) => vec![],
            HeapData::Upvalue(GcUpvalue::Closed(value)) => {
                value.as_gc_ptr().into_iter().collect()
            }
            HeapData::Tuple(tuple) => {
                let mut ptrs = Vec::with_capacity(2);
                if let Some(ptr) = tuple.first.as_gc_ptr() {
                    ptrs.push(ptr);
                }
                if let Some(ptr) = tuple.second.as_gc_ptr() {
                    ptrs.push(ptr);
                }
                ptrs
            }
        }
    }

    /// Estimate the size of this object in bytes, for the GC trigger.
    pub fn estimate_size(&self) -> usize {
        match self {
            HeapData::String(s) => std::mem::size_of::<GcString>() + s.data.len(),
            HeapData::Function(f) => {
                std::mem::size_of::<GcFunction>()
                    + f.chunk.code.len()
                    + f.chunk.lines.len() * std::mem::size_of::<u32>()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            HeapData::Native(n) => std::mem::size_of::<GcNative>() + n.name.len(),
            HeapData::Closure(c) => {
                std::mem::size_of::<GcClosure>()
                    + c.upvalues.len() * std::mem::size_of::<GcPtr<GcUpvalue>>()
            }
            HeapData::Upvalue(_) => std::mem::size_of::<GcUpvalue>(),
            HeapData::Tuple(_) => std::mem::size_of::<GcTuple>(),
        }
    }
}

/// One heap slot: payload plus GC bookkeeping.
pub struct GcObject {
    pub data: HeapData,
    pub marked: bool,
    pub size: usize,
}

/// Statistics about GC activity.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    /// Number of collections performed
    pub collections: u64,
    /// Total objects allocated
    pub total_allocated: u64,
    /// Total objects freed
    pub total_freed: u64,
    /// Total bytes allocated
    pub total_bytes_allocated: u64,
    /// Total bytes freed
    pub total_bytes_freed: u64,
    /// Peak number of live objects
    pub peak_objects: usize,
}

/// Configuration for the garbage collector.
#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Live bytes before the first collection triggers.
    pub initial_threshold: usize,
    /// Post-collection threshold multiplier over surviving bytes.
    pub growth_factor: f64,
    /// Collect at every safepoint. Test tooling.
    pub stress: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_threshold: 1024 * 1024, // 1MB
            growth_factor: 2.0,
            stress: false,
        }
    }
}

/// A garbage-collected heap.
///
/// Each VM owns exactly one; nothing here is shared between instances.
pub struct Heap {
    /// Storage for all objects. `None` slots are free.
    objects: Vec<Option<GcObject>>,
    /// Indices of free slots available for reuse.
    free_list: Vec<RawGcPtr>,
    /// Bytes held by live objects.
    bytes_allocated: usize,
    /// Live-byte threshold for the next collection.
    next_gc: usize,
    config: GcConfig,
    stats: GcStats,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        Self {
            objects: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            config,
            stats: GcStats::default(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    /// Total slot capacity, live or free.
    pub fn capacity(&self) -> usize {
        self.objects.len()
    }

    // ============================================================
    // Allocation
    // ============================================================

    /// Allocate a new object. The single funnel for all GC allocation, so
    /// byte accounting stays centralized.
    fn alloc(&mut self, data: HeapData) -> RawGcPtr {
        let size = data.estimate_size();
        let obj = GcObject {
            data,
            marked: false,
            size,
        };

        self.stats.total_allocated += 1;
        self.stats.total_bytes_allocated += size as u64;
        self.bytes_allocated += size;

        let index = if let Some(free_index) = self.free_list.pop() {
            self.objects[free_index as usize] = Some(obj);
            free_index
        } else {
            let index = self.objects.len() as RawGcPtr;
            self.objects.push(Some(obj));
            index
        };

        let live = self.live_objects();
        if live > self.stats.peak_objects {
            self.stats.peak_objects = live;
        }

        index
    }

    /// Allocate a string. Interning is the VM's job (`Vm::intern_string`);
    /// this is the raw storage path.
    pub fn alloc_string(&mut self, data: String) -> GcPtr<GcString> {
        let hash = seahash::hash(data.as_bytes());
        GcPtr::from_raw(self.alloc(HeapData::String(GcString { data, hash })))
    }

    pub fn alloc_function(
        &mut self,
        arity: usize,
        upvalue_count: usize,
        chunk: Chunk,
        name: Option<GcPtr<GcString>>,
    ) -> GcPtr<GcFunction> {
        GcPtr::from_raw(self.alloc(HeapData::Function(GcFunction {
            arity,
            upvalue_count,
            chunk,
            name,
        })))
    }

    pub fn alloc_native(&mut self, name: String, function: NativeFn) -> GcPtr<GcNative> {
        GcPtr::from_raw(self.alloc(HeapData::Native(GcNative { name, function })))
    }

    pub fn alloc_closure(
        &mut self,
        function: GcPtr<GcFunction>,
        upvalues: UpvalueList,
    ) -> GcPtr<GcClosure> {
        GcPtr::from_raw(self.alloc(HeapData::Closure(GcClosure { function, upvalues })))
    }

    /// Allocate an open upvalue referencing a live stack slot.
    pub fn alloc_upvalue(&mut self, slot: usize) -> GcPtr<GcUpvalue> {
        GcPtr::from_raw(self.alloc(HeapData::Upvalue(GcUpvalue::Open(slot))))
    }

    pub fn alloc_tuple(&mut self, first: Value, second: Value) -> GcPtr<GcTuple> {
        GcPtr::from_raw(self.alloc(HeapData::Tuple(GcTuple { first, second })))
    }

    // ============================================================
    // Access
    // ============================================================

    pub fn get(&self, ptr: RawGcPtr) -> Option<&GcObject> {
        self.objects.get(ptr as usize).and_then(|o| o.as_ref())
    }

    pub fn get_string(&self, ptr: GcPtr<GcString>) -> Option<&GcString> {
        match self.get(ptr.as_raw()) {
            Some(GcObject {
                data: HeapData::String(s),
                ..
            }) => Some(s),
            _ => None,
        }
    }

    pub fn get_function(&self, ptr: GcPtr<GcFunction>) -> Option<&GcFunction> {
        match self.get(ptr.as_raw()) {
            Some(GcObject {
                data: HeapData::Function(f),
                ..
            }) => Some(f),
            _ => None,
        }
    }

    pub fn get_native(&self, ptr: GcPtr<GcNative>) -> Option<&GcNative> {
        match self.get(ptr.as_raw()) {
            Some(GcObject {
                data: HeapData::Native(n),
                ..
            }) => Some(n),
            _ => None,
        }
    }

    pub fn get_closure(&self, ptr: GcPtr<GcClosure>) -> Option<&GcClosure> {
        match self.get(ptr.as_raw()) {
            Some(GcObject {
                data: HeapData::Closure(c),
                ..
            }) => Some(c),
            _ => None,
        }
    }

    pub fn get_upvalue(&self, ptr: GcPtr<GcUpvalue>) -> Option<&GcUpvalue> {
        match self.get(ptr.as_raw()) {
            Some(GcObject {
                data: HeapData::Upvalue(u),
                ..
            }) => Some(u),
            _ => None,
        }
    }

    pub fn get_tuple(&self, ptr: GcPtr<GcTuple>) -> Option<&GcTuple> {
        match self.get(ptr.as_raw()) {
            Some(GcObject {
                data: HeapData::Tuple(t),
                ..
            }) => Some(t),
            _ => None,
        }
    }

    // Infallible accessors for handles the VM keeps reachable. The GC never
    // frees a reachable object, so a miss here is a VM bug: panic rather
    // than surface a bogus script error.

    pub fn string(&self, ptr: GcPtr<GcString>) -> &GcString {
        self.get_string(ptr)
            .unwrap_or_else(|| panic!("dangling string handle {:?}", ptr))
    }

    pub fn function(&self, ptr: GcPtr<GcFunction>) -> &GcFunction {
        self.get_function(ptr)
            .unwrap_or_else(|| panic!("dangling function handle {:?}", ptr))
    }

    pub fn native(&self, ptr: GcPtr<GcNative>) -> &GcNative {
        self.get_native(ptr)
            .unwrap_or_else(|| panic!("dangling native handle {:?}", ptr))
    }

    pub fn closure(&self, ptr: GcPtr<GcClosure>) -> &GcClosure {
        self.get_closure(ptr)
            .unwrap_or_else(|| panic!("dangling closure handle {:?}", ptr))
    }

    pub fn upvalue(&self, ptr: GcPtr<GcUpvalue>) -> &GcUpvalue {
        self.get_upvalue(ptr)
            .unwrap_or_else(|| panic!("dangling upvalue handle {:?}", ptr))
    }

    pub fn upvalue_mut(&mut self, ptr: GcPtr<GcUpvalue>) -> &mut GcUpvalue {
        match self.objects.get_mut(ptr.as_raw() as usize) {
            Some(Some(GcObject {
                data: HeapData::Upvalue(u),
                ..
            })) => u,
            _ => panic!("dangling upvalue handle {:?}", ptr),
        }
    }

    pub fn tuple(&self, ptr: GcPtr<GcTuple>) -> &GcTuple {
        self.get_tuple(ptr)
            .unwrap_or_else(|| panic!("dangling tuple handle {:?}", ptr))
    }

    pub fn is_marked(&self, ptr: RawGcPtr) -> bool {
        self.get(ptr).map(|o| o.marked).unwrap_or(false)
    }

    // ============================================================
    // Collection
    // ============================================================

    /// Whether live bytes have crossed the collection threshold.
    pub fn should_collect(&self) -> bool {
        self.config.stress || self.bytes_allocated > self.next_gc
    }

    /// Mark phase: flood-fill reachability from `roots`.
    ///
    /// Marking is worklist-driven rather than recursive, so arbitrarily
    /// deep object graphs cannot exhaust the native call stack. An object
    /// is gray from the moment it is marked and pushed until its owned
    /// references have been scanned; already-marked objects are skipped,
    /// which also terminates cycles.
    pub fn mark(&mut self, roots: &[RawGcPtr]) {
        debug!(roots = roots.len(), live = self.live_objects(), "gc mark phase");

        let mut gray: Vec<RawGcPtr> = Vec::with_capacity(roots.len());
        for &root in roots {
            self.mark_object(root, &mut gray);
        }

        while let Some(ptr) = gray.pop() {
            // Blacken: scan the object's owned references.
            let children = match self.get(ptr) {
                Some(obj) => obj.data.gc_pointers(),
                None => continue,
            };
            for child in children {
                self.mark_object(child, &mut gray);
            }
        }
    }

    fn mark_object(&mut self, ptr: RawGcPtr, gray: &mut Vec<RawGcPtr>) {
        if let Some(Some(obj)) = self.objects.get_mut(ptr as usize) {
            if !obj.marked {
                obj.marked = true;
                gray.push(ptr);
            }
        }
    }

    /// Sweep phase: free every unmarked object and clear surviving marks.
    ///
    /// Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0u64;
        let mut bytes_freed = 0usize;

        for index in 0..self.objects.len() {
            let dead = match &mut self.objects[index] {
                Some(obj) if obj.marked => {
                    obj.marked = false;
                    false
                }
                Some(obj) => {
                    bytes_freed += obj.size;
                    true
                }
                None => false,
            };
            if dead {
                self.objects[index] = None;
                self.free_list.push(index as RawGcPtr);
                freed += 1;
            }
        }

        self.bytes_allocated -= bytes_freed;
        self.stats.collections += 1;
        self.stats.total_freed += freed;
        self.stats.total_bytes_freed += bytes_freed as u64;
        self.next_gc = ((self.bytes_allocated as f64 * self.config.growth_factor) as usize)
            .max(self.config.initial_threshold);

        debug!(
            freed,
            bytes_freed,
            live = self.live_objects(),
            next_gc = self.next_gc,
            "gc sweep complete"
        );

        freed as usize
    }

    /// Run a full mark-and-sweep cycle over the given roots.
    ///
    /// The VM's own cycle (`Vm::collect_garbage`) additionally purges the
    /// weak string-intern table between the two phases; this entry point is
    /// for heap-only use.
    pub fn collect(&mut self, roots: &[RawGcPtr]) -> usize {
        self.mark(roots);
        self.sweep()
    }

    // ============================================================
    // Display
    // ============================================================

    /// Render a value the way `print` shows it.
    pub fn display_value(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(ptr) => match self.get_string(*ptr) {
                Some(s) => s.data.clone(),
                None => "<invalid string>".to_string(),
            },
            Value::Function(ptr) => match self.get_function(*ptr) {
                Some(f) => self.display_function(f),
                None => "<invalid function>".to_string(),
            },
            Value::Native(_) => "<native fn>".to_string(),
            Value::Closure(ptr) => match self
                .get_closure(*ptr)
                .and_then(|c| self.get_function(c.function))
            {
                Some(f) => self.display_function(f),
                None => "<invalid closure>".to_string(),
            },
            Value::Tuple(ptr) => match self.get_tuple(*ptr) {
                Some(t) => format!(
                    "({}, {})",
                    self.display_value(&t.first),
                    self.display_value(&t.second)
                ),
                None => "<invalid tuple>".to_string(),
            },
        }
    }

    fn display_function(&self, function: &GcFunction) -> String {
        match function.name.and_then(|name| self.get_string(name)) {
            Some(name) => format!("<fn {}>", name.data),
            None => "<script>".to_string(),
        }
    }

    /// Name of a function for diagnostics: `script` for the top level.
    pub fn function_name(&self, function: &GcFunction) -> Option<String> {
        function
            .name
            .and_then(|name| self.get_string(name))
            .map(|s| s.data.clone())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &self.live_objects())
            .field("capacity", &self.capacity())
            .field("free_list_size", &self.free_list.len())
            .field("bytes_allocated", &self.bytes_allocated)
            .field("next_gc", &self.next_gc)
            .finish()
    }
}
