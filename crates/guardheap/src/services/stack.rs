//! Stack-capture service interface.
//!
//! Blocks carry allocation-time and free-time stack references as opaque
//! ids. Symbolization and storage belong to the host; the manager only
//! saves, releases, and validates ids.

use backtrace::Backtrace;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Opaque reference to a captured stack. 0 is the reserved "no stack" id.
pub type StackId = u32;

/// The stack-capture capability consumed by the block heap manager.
pub trait StackCapture: Send + Sync {
    /// Capture the current call stack. Returns 0 if capture is unavailable.
    fn save_stack_trace(&self) -> StackId;

    /// Release a previously saved stack. Ignores 0 and unknown ids, since
    /// ids recovered from corrupted block metadata may be garbage.
    fn release_stack_trace(&self, id: StackId);

    /// Whether `id` refers to a currently held capture.
    fn stack_id_is_valid(&self, id: StackId) -> bool;
}

struct RegistryInner {
    stacks: HashMap<StackId, Backtrace>,
    next_id: StackId,
}

/// Reference implementation: unresolved `backtrace` captures held in a map.
/// Resolution (symbolization) is deferred to [`BacktraceRegistry::resolve`]
/// so the allocation path stays cheap.
pub struct BacktraceRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for BacktraceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktraceRegistry {
    pub fn new() -> Self {
        BacktraceRegistry {
            inner: Mutex::new(RegistryInner {
                stacks: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Number of captures currently held. Test/diagnostic aid.
    pub fn live_captures(&self) -> usize {
        self.inner.lock().stacks.len()
    }

    /// Symbolize and return a copy of the capture behind `id`.
    pub fn resolve(&self, id: StackId) -> Option<Backtrace> {
        let mut inner = self.inner.lock();
        let trace = inner.stacks.get_mut(&id)?;
        trace.resolve();
        Some(trace.clone())
    }
}

impl StackCapture for BacktraceRegistry {
    fn save_stack_trace(&self) -> StackId {
        let trace = Backtrace::new_unresolved();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1).max(1);
        inner.stacks.insert(id, trace);
        id
    }

    fn release_stack_trace(&self, id: StackId) {
        if id == 0 {
            return;
        }
        self.inner.lock().stacks.remove(&id);
    }

    fn stack_id_is_valid(&self, id: StackId) -> bool {
        id != 0 && self.inner.lock().stacks.contains_key(&id)
    }
}

/// No-op capture service for overhead-sensitive embeddings.
pub struct NullStackCapture;

impl StackCapture for NullStackCapture {
    fn save_stack_trace(&self) -> StackId {
        0
    }

    fn release_stack_trace(&self, _id: StackId) {}

    fn stack_id_is_valid(&self, _id: StackId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_release_roundtrip() {
        let registry = BacktraceRegistry::new();
        let id = registry.save_stack_trace();
        assert_ne!(id, 0);
        assert!(registry.stack_id_is_valid(id));
        registry.release_stack_trace(id);
        assert!(!registry.stack_id_is_valid(id));
        assert_eq!(registry.live_captures(), 0);
    }

    #[test]
    fn release_tolerates_garbage_ids() {
        let registry = BacktraceRegistry::new();
        registry.release_stack_trace(0);
        registry.release_stack_trace(0xDEAD_BEEF);
    }

    #[test]
    fn null_capture_never_validates() {
        let null = NullStackCapture;
        assert_eq!(null.save_stack_trace(), 0);
        assert!(!null.stack_id_is_valid(0));
    }
}
