//! Construction parameters for both tables.

/// Parameters of [`AtomicHashArray::create`](crate::AtomicHashArray::create).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrayConfig {
    /// Fraction of cells that may hold entries before inserts are refused.
    pub max_load_factor: f32,
    /// Flush threshold of the per-thread entry counters.
    pub entry_count_thread_cache_size: u32,
    /// Explicit cell count; `0` derives it from `max_size / max_load_factor`.
    pub capacity: usize,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            max_load_factor: 0.8,
            entry_count_thread_cache_size: 1000,
            capacity: 0,
        }
    }
}

impl ArrayConfig {
    /// Sets `max_load_factor`.
    pub fn with_max_load_factor(mut self, max_load_factor: f32) -> Self {
        self.max_load_factor = max_load_factor;
        self
    }

    /// Sets `entry_count_thread_cache_size`.
    pub fn with_entry_count_thread_cache_size(mut self, size: u32) -> Self {
        self.entry_count_thread_cache_size = size;
        self
    }

    /// Sets an explicit `capacity`.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Parameters of [`ConcurrentHashMap::with_config`](crate::ConcurrentHashMap::with_config).
///
/// Sizes are totals across all segments and are rounded up to powers of two.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapConfig {
    /// Initial bucket count.
    pub initial_size: usize,
    /// Upper bound on entries, `0` for unbounded.
    pub max_size: usize,
    /// Entries per bucket that trigger a segment rehash.
    pub load_factor: f32,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            initial_size: 8,
            max_size: 0,
            load_factor: 1.05,
        }
    }
}

impl MapConfig {
    /// Sets `initial_size`.
    pub fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    /// Sets `max_size`.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets `load_factor`.
    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }
}
