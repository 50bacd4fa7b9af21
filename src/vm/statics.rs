use crate::{
    error::{InvokeError, InvokeResult},
    types::{Initializer, TypeDescription},
    utils::{
        sync::{get_current_thread_id, Arc, AtomicU64, AtomicU8, Condvar, Mutex, Ordering},
        ByteOffset, DebugStr,
    },
    value::{FieldLayoutManager, FieldStorage, Heap},
};
use dashmap::DashMap;
use std::{
    fmt::{self, Debug, Formatter},
    time::Duration,
};
use tracing::{debug, trace};

/// Initialization states for class initializers.
/// This is an atomic state machine for thread-safe class initialization.
pub const INIT_STATE_UNINITIALIZED: u8 = 0;
pub const INIT_STATE_INITIALIZING: u8 = 1;
pub const INIT_STATE_INITIALIZED: u8 = 2;
pub const INIT_STATE_FAILED: u8 = 3;

pub struct StaticStorage {
    /// States: 0=uninitialized, 1=initializing (in progress), 2=initialized, 3=failed
    init_state: AtomicU8,
    /// The ID of the thread currently initializing this class.
    /// Only valid if init_state is INITIALIZING.
    initializing_thread: AtomicU64,
    layout: Arc<FieldLayoutManager>,
    /// Storage for static fields. Access must use atomic operations.
    storage: FieldStorage,
    init_cond: Condvar,
    init_mutex: Mutex<()>,
    failure: Mutex<Option<String>>,
}

impl StaticStorage {
    pub fn layout(&self) -> &Arc<FieldLayoutManager> {
        &self.layout
    }

    pub fn storage(&self) -> &FieldStorage {
        &self.storage
    }

    pub fn state(&self) -> u8 {
        self.init_state.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == INIT_STATE_INITIALIZED
    }

    fn finish(&self, state: u8) {
        self.init_state.store(state, Ordering::Release);
        // Notify any threads waiting for initialization
        let _lock = self.init_mutex.lock();
        self.init_cond.notify_all();
    }
}

impl Debug for StaticStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.state() {
            INIT_STATE_INITIALIZED => Debug::fmt(&self.storage, f),
            INIT_STATE_INITIALIZING => write!(f, "initializing"),
            INIT_STATE_FAILED => write!(f, "failed"),
            _ => write!(f, "uninitialized"),
        }
    }
}

pub enum StaticInitResult {
    /// This thread must execute the class initializer.
    Execute(Initializer),
    /// The class is already fully initialized.
    Initialized,
    /// This is a recursive request on the initializing thread; proceed as if initialized.
    Recursive,
    /// Initialization failed previously.
    Failed(String),
    /// Another thread is currently initializing this class.
    Waiting,
}

impl Debug for StaticInitResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StaticInitResult::Execute(_) => write!(f, "Execute"),
            StaticInitResult::Initialized => write!(f, "Initialized"),
            StaticInitResult::Recursive => write!(f, "Recursive"),
            StaticInitResult::Failed(m) => write!(f, "Failed({})", m),
            StaticInitResult::Waiting => write!(f, "Waiting"),
        }
    }
}

/// Per-class static field storage and initialization state.
#[derive(Default)]
pub struct StaticStorageManager {
    types: DashMap<TypeDescription, Arc<StaticStorage>>,
}

impl Debug for StaticStorageManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.types
                    .iter()
                    .map(|e| (DebugStr(e.key().to_string()), e.value().clone())),
            )
            .finish()
    }
}

impl StaticStorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The storage for `class`, created with zeroed statics on first request.
    pub fn get(&self, class: &TypeDescription, heap: &Heap) -> InvokeResult<Arc<StaticStorage>> {
        if let Some(existing) = self.types.get(class) {
            return Ok(existing.clone());
        }
        let layout = heap.layouts().static_fields(class)?;
        let storage = FieldStorage::new(layout.total_size);
        heap.initialize_defaults(&storage, ByteOffset::ZERO, &layout, &mut vec![])?;
        let created = Arc::new(StaticStorage {
            init_state: AtomicU8::new(INIT_STATE_UNINITIALIZED),
            initializing_thread: AtomicU64::new(0),
            layout,
            storage,
            init_cond: Condvar::new(),
            init_mutex: Mutex::new(()),
            failure: Mutex::new(None),
        });
        // a racing creator may have won; everyone uses the stored entry
        Ok(self
            .types
            .entry(class.clone())
            .or_insert(created)
            .clone())
    }

    pub fn get_init_state(&self, class: &TypeDescription) -> u8 {
        self.types
            .get(class)
            .map(|s| s.state())
            .unwrap_or(INIT_STATE_UNINITIALIZED)
    }

    pub fn is_initialized(&self, class: &TypeDescription) -> bool {
        self.get_init_state(class) == INIT_STATE_INITIALIZED
    }

    /// Determine what the calling thread must do to see `class` initialized. Exactly
    /// one thread is ever told to execute a given class's initializer.
    pub fn init(&self, class: &TypeDescription, heap: &Heap) -> InvokeResult<StaticInitResult> {
        let storage = self.get(class, heap)?;
        let thread_id = get_current_thread_id();

        match storage.state() {
            INIT_STATE_INITIALIZED => return Ok(StaticInitResult::Initialized),
            INIT_STATE_FAILED => return Ok(StaticInitResult::Failed(failure_message(&storage))),
            INIT_STATE_INITIALIZING
                if storage.initializing_thread.load(Ordering::Acquire) == thread_id =>
            {
                return Ok(StaticInitResult::Recursive)
            }
            _ => {}
        }

        let Some(initializer) = class.initializer().cloned() else {
            storage
                .init_state
                .compare_exchange(
                    INIT_STATE_UNINITIALIZED,
                    INIT_STATE_INITIALIZED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .ok();
            return Ok(StaticInitResult::Initialized);
        };

        match storage.init_state.compare_exchange(
            INIT_STATE_UNINITIALIZED,
            INIT_STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                storage
                    .initializing_thread
                    .store(thread_id, Ordering::Release);
                debug!(class = %class, thread = thread_id, "executing class initializer");
                Ok(StaticInitResult::Execute(initializer))
            }
            Err(INIT_STATE_INITIALIZED) => Ok(StaticInitResult::Initialized),
            Err(INIT_STATE_INITIALIZING) => Ok(StaticInitResult::Waiting),
            Err(INIT_STATE_FAILED) => Ok(StaticInitResult::Failed(failure_message(&storage))),
            Err(state) => Err(InvokeError::internal(format!(
                "invalid initialization state {} for {}",
                state, class
            ))),
        }
    }

    /// Mark a class as fully initialized after its initializer completes.
    pub fn mark_initialized(&self, class: &TypeDescription) {
        if let Some(storage) = self.types.get(class) {
            storage.finish(INIT_STATE_INITIALIZED);
            debug!(class = %class, "class initialized");
        }
    }

    /// Mark a class as permanently erroneous after its initializer fails.
    pub fn mark_failed(&self, class: &TypeDescription, message: String) {
        if let Some(storage) = self.types.get(class) {
            *storage.failure.lock() = Some(message);
            storage.finish(INIT_STATE_FAILED);
            debug!(class = %class, "class initialization failed");
        }
    }

    /// Wait while another thread initializes `class`, re-checking every `slice`.
    pub fn wait_for_init(&self, class: &TypeDescription, slice: Duration) {
        let Some(storage) = self.types.get(class).map(|s| s.clone()) else {
            return;
        };
        loop {
            if storage.state() != INIT_STATE_INITIALIZING {
                break;
            }
            let mut lock = storage.init_mutex.lock();
            if storage.state() != INIT_STATE_INITIALIZING {
                break;
            }
            trace!(class = %class, "waiting for class initialization");
            let _ = storage.init_cond.wait_for(&mut lock, slice);
        }
    }
}

fn failure_message(storage: &StaticStorage) -> String {
    storage
        .failure
        .lock()
        .clone()
        .unwrap_or_else(|| "initializer failed".to_string())
}
