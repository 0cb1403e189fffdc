//! Label registry.
//!
//! A [`Context`] owns one [`Arena`] holding a "global" histogram for every
//! declared label, plus any rate counters. Per-thread histograms are created
//! lazily: the first `*_for_current_thread` call from a thread copies the
//! current state of the global histogram into a fresh single-record arena and
//! registers it under `(label, thread)`. Later calls from that thread find it
//! through a thread-local cache and take no lock.
//!
//! ```
//! use histprof::{Context, Declaration};
//!
//! let mut context: Context = Context::new();
//! context
//!     .initialize(&[Declaration::new("lat", 1000, 10)])
//!     .unwrap();
//!
//! context.begin("lat");
//! // ... work ...
//! context.end("lat");
//!
//! assert_eq!(context.histogram("lat").unwrap().num_samples(), 1);
//! ```

use crate::arena::Arena;
use crate::config::ProfilerConfig;
use crate::error::{ProfilerError, Result};
use crate::histogram::{Histogram, HistogramConfig};
use crate::layout::{HistogramHeader, RateCounterHeader};
use crate::rate::{self, RateCounter};
use crate::report::{OutputFormat, write_report};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Distinguishes contexts (and initializations of one context) in the
/// thread-local cache.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (generation, label index) -> this thread's slot.
    static THREAD_SLOTS: RefCell<HashMap<(u64, usize), Cached>> = RefCell::new(HashMap::new());
}

/// Thread-local view of one `(generation, label index)` key.
enum Cached {
    Slot(Weak<Slot>),
    /// Creating the entry failed. Later calls are no-ops until the next
    /// initialization.
    Failed,
}

/// Timestamp value meaning `begin` was never called.
const NOT_STARTED: u64 = u64::MAX;

/// A histogram to create during [`Context::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration<L = String> {
    pub label: L,
    pub samples_per_bucket: u64,
    pub num_buckets: usize,
    pub shift: u64,
}

impl<L> Declaration<L> {
    pub fn new(label: impl Into<L>, samples_per_bucket: u64, num_buckets: usize) -> Self {
        Self {
            label: label.into(),
            samples_per_bucket,
            num_buckets,
            shift: 0,
        }
    }

    pub fn with_shift(mut self, shift: u64) -> Self {
        self.shift = shift;
        self
    }

    fn config(&self) -> HistogramConfig {
        HistogramConfig::new(self.samples_per_bucket, self.num_buckets).with_shift(self.shift)
    }
}

/// A rate counter to create during [`Context::initialize_with_rates`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDeclaration<L = String> {
    pub label: L,
    pub nanos_per_bucket: u64,
    pub num_buckets: usize,
}

impl<L> RateDeclaration<L> {
    pub fn new(label: impl Into<L>, nanos_per_bucket: u64, num_buckets: usize) -> Self {
        Self {
            label: label.into(),
            nanos_per_bucket,
            num_buckets,
        }
    }
}

impl<L: Display> RateDeclaration<L> {
    fn validate(&self) -> Result<()> {
        rate::validate(&self.label.to_string(), self.nanos_per_bucket, self.num_buckets)
    }
}

/// A histogram and the pending `begin` timestamp for its key.
struct Slot {
    histogram: Histogram,
    started: AtomicU64,
}

impl Slot {
    fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            started: AtomicU64::new(NOT_STARTED),
        }
    }

    #[inline]
    fn start(&self, now: u64) {
        self.started.store(now, Ordering::Relaxed);
    }

    #[inline]
    fn stop(&self, now: u64) {
        let started = self.started.load(Ordering::Relaxed);
        if started != NOT_STARTED {
            self.histogram.input(now.saturating_sub(started));
        }
    }
}

/// One registered histogram: a label and, for per-thread entries, the thread
/// that owns it.
pub struct Entry<L> {
    label: L,
    thread: Option<ThreadId>,
    slot: Arc<Slot>,
}

impl<L: Display> Entry<L> {
    pub fn label(&self) -> &L {
        &self.label
    }

    /// The owning thread, `None` for the global entry.
    pub fn thread(&self) -> Option<ThreadId> {
        self.thread
    }

    pub fn histogram(&self) -> &Histogram {
        &self.slot.histogram
    }

    /// Name used in reports and record descriptions.
    pub fn name(&self) -> String {
        display_name(&self.label, self.thread)
    }
}

impl<L: Display> std::fmt::Debug for Entry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name())
            .field("histogram", &self.slot.histogram)
            .finish()
    }
}

fn display_name<L: Display>(label: &L, thread: Option<ThreadId>) -> String {
    match thread {
        Some(id) => format!("{label} [{id:?}]"),
        None => label.to_string(),
    }
}

/// Per-thread entries, mutated only under the context's mutex.
struct ThreadTable<L> {
    by_key: HashMap<(ThreadId, usize), Arc<Entry<L>>>,
    /// Per label index, in creation order.
    groups: Vec<Vec<Arc<Entry<L>>>>,
    /// Keys whose entry could not be created.
    failed: HashSet<(ThreadId, usize)>,
    /// Files backing per-thread arenas, removed on the next initialization.
    files: Vec<PathBuf>,
    next_file: usize,
}

impl<L> ThreadTable<L> {
    fn new(labels: usize) -> Self {
        Self {
            by_key: HashMap::new(),
            groups: (0..labels).map(|_| Vec::new()).collect(),
            failed: HashSet::new(),
            files: Vec::new(),
            next_file: 0,
        }
    }
}

/// Registry of labelled histograms and rate counters.
///
/// Sampling methods never fail and never block, except for the first
/// per-thread call for a label on each thread.
pub struct Context<L = String> {
    path: Option<PathBuf>,
    generation: u64,
    epoch: Instant,
    arena: Option<Arc<Arena>>,
    index: HashMap<L, usize>,
    globals: Vec<Arc<Entry<L>>>,
    rates: HashMap<L, RateCounter>,
    threads: Mutex<ThreadTable<L>>,
}

impl<L> Context<L>
where
    L: Eq + Hash + Clone + Display,
{
    /// A context whose records live in anonymous memory.
    pub fn new() -> Self {
        Self {
            path: None,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            epoch: Instant::now(),
            arena: None,
            index: HashMap::new(),
            globals: Vec::new(),
            rates: HashMap::new(),
            threads: Mutex::new(ThreadTable::new(0)),
        }
    }

    /// A context whose records are written to the file at `path`, with
    /// per-thread records in `<path>.thread-<n>`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let mut context = Self::new();
        context.path = Some(path.into());
        context
    }

    /// Replace all state with one histogram per declaration.
    pub fn initialize(&mut self, declarations: &[Declaration<L>]) -> Result<()> {
        self.initialize_with_rates(declarations, &[])
    }

    /// Replace all state with the declared histograms and rate counters.
    ///
    /// Declarations are validated and sized before anything is discarded,
    /// so a rejected batch leaves the previous state in place. Files left
    /// by the previous initialization are removed.
    pub fn initialize_with_rates(
        &mut self,
        declarations: &[Declaration<L>],
        rates: &[RateDeclaration<L>],
    ) -> Result<()> {
        let mut index = HashMap::with_capacity(declarations.len());
        for (i, declaration) in declarations.iter().enumerate() {
            declaration.config().validate(&declaration.label.to_string())?;
            if index.insert(declaration.label.clone(), i).is_some() {
                return Err(ProfilerError::DuplicateLabel(declaration.label.to_string()));
            }
        }
        let mut rate_labels = HashSet::with_capacity(rates.len());
        for rate in rates {
            rate.validate()?;
            if !rate_labels.insert(&rate.label) {
                return Err(ProfilerError::DuplicateLabel(rate.label.to_string()));
            }
        }

        let mut size = 0usize;
        let reservations = declarations
            .iter()
            .map(|d| (d.label.to_string(), histogram_reservation(d.num_buckets)))
            .chain(rates.iter().map(|r| {
                let bytes = Arena::reservation::<RateCounterHeader, AtomicU64>(r.num_buckets);
                (r.label.to_string(), bytes)
            }));
        for (label, bytes) in reservations {
            size = bytes
                .and_then(|bytes| size.checked_add(bytes))
                .ok_or(ProfilerError::InvalidDeclaration {
                    label,
                    reason: "bucket count too large to map",
                })?;
        }

        self.reset();

        if size > 0 {
            let arena = Arena::create(self.path.as_deref(), size)?;

            for declaration in declarations {
                let histogram = Histogram::allocate(
                    &arena,
                    declaration.config(),
                    &declaration.label.to_string(),
                )?;
                self.globals.push(Arc::new(Entry {
                    label: declaration.label.clone(),
                    thread: None,
                    slot: Arc::new(Slot::new(histogram)),
                }));
            }
            for rate in rates {
                let counter = RateCounter::allocate(
                    &arena,
                    rate.nanos_per_bucket,
                    rate.num_buckets,
                    &rate.label.to_string(),
                )?;
                self.rates.insert(rate.label.clone(), counter);
            }

            self.arena = Some(arena);
        }

        self.index = index;
        self.threads = Mutex::new(ThreadTable::new(declarations.len()));

        tracing::info!(
            histograms = declarations.len(),
            rates = rates.len(),
            bytes = size,
            path = ?self.path,
            "profiler initialized"
        );
        Ok(())
    }

    /// Drop every record, remove per-thread files and start a new
    /// generation.
    fn reset(&mut self) {
        self.index.clear();
        self.globals.clear();
        self.rates.clear();

        // an empty batch maps nothing, so the old main file would survive
        let mapped = self.arena.take().is_some();
        if let Some(path) = &self.path
            && mapped
        {
            remove_stale(path);
        }

        let old = std::mem::replace(self.threads.get_mut(), ThreadTable::new(0));
        let ThreadTable { files, .. } = old;
        for file in &files {
            remove_stale(file);
        }
        if !files.is_empty() {
            tracing::debug!(files = files.len(), "removed per-thread files");
        }

        self.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    #[inline]
    fn global<Q>(&self, label: &Q) -> Option<&Arc<Entry<L>>>
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(label).map(|&i| &self.globals[i])
    }

    /// The calling thread's slot for label index `index`, created on first
    /// use. `None` if creation failed.
    fn thread_slot(&self, index: usize) -> Option<Arc<Slot>> {
        let key = (self.generation, index);
        let cached = THREAD_SLOTS
            .try_with(|slots| match slots.borrow().get(&key) {
                Some(Cached::Slot(slot)) => slot.upgrade().map(Some),
                Some(Cached::Failed) => Some(None),
                None => None,
            })
            .ok()
            .flatten();
        if let Some(slot) = cached {
            return slot;
        }

        let slot = self.register_current_thread(index);
        let generation = self.generation;
        let _ = THREAD_SLOTS.try_with(|slots| {
            let mut slots = slots.borrow_mut();
            slots.retain(|&(g, _), cached| match cached {
                Cached::Slot(slot) => slot.strong_count() > 0,
                Cached::Failed => g == generation,
            });
            let cached = match &slot {
                Some(slot) => Cached::Slot(Arc::downgrade(slot)),
                None => Cached::Failed,
            };
            slots.insert(key, cached);
        });
        slot
    }

    /// Find or create the calling thread's entry for label index `index`.
    fn register_current_thread(&self, index: usize) -> Option<Arc<Slot>> {
        let thread = thread::current().id();
        let mut table = self.threads.lock();

        if let Some(entry) = table.by_key.get(&(thread, index)) {
            return Some(Arc::clone(&entry.slot));
        }
        if table.failed.contains(&(thread, index)) {
            return None;
        }

        let global = &self.globals[index];
        let name = display_name(&global.label, Some(thread));
        let histogram = match self.copy_for_thread(&mut table, global.histogram(), &name) {
            Ok(histogram) => histogram,
            Err(e) => {
                tracing::error!(name = %name, error = %e, "failed to create per-thread histogram");
                table.failed.insert((thread, index));
                return None;
            }
        };

        let entry = Arc::new(Entry {
            label: global.label.clone(),
            thread: Some(thread),
            slot: Arc::new(Slot::new(histogram)),
        });
        table.by_key.insert((thread, index), Arc::clone(&entry));
        table.groups[index].push(Arc::clone(&entry));

        tracing::debug!(name = %name, "registered per-thread histogram");
        Some(Arc::clone(&entry.slot))
    }

    fn copy_for_thread(
        &self,
        table: &mut ThreadTable<L>,
        global: &Histogram,
        name: &str,
    ) -> Result<Histogram> {
        let size = histogram_reservation(global.num_buckets()).ok_or(ProfilerError::OutOfSpace {
            requested: usize::MAX,
            available: 0,
        })?;
        let path = self.path.as_deref().map(|path| {
            let path = thread_path(path, table.next_file);
            table.next_file += 1;
            path
        });
        let arena = Arena::create(path.as_deref(), size)?;
        if let Some(path) = path {
            table.files.push(path);
        }
        Histogram::allocate_copy(&arena, global, name)
    }

    /// Store the current time against the global entry for `label`.
    pub fn begin<Q>(&self, label: &Q)
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(entry) = self.global(label) {
            entry.slot.start(self.now());
        }
    }

    /// Record the time elapsed since the last [`Context::begin`] for `label`,
    /// which may have been called from another thread.
    pub fn end<Q>(&self, label: &Q)
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.now();
        if let Some(entry) = self.global(label) {
            entry.slot.stop(now);
        }
    }

    /// Like [`Context::begin`], keyed on `(label, calling thread)`.
    pub fn begin_for_current_thread<Q>(&self, label: &Q)
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(&index) = self.index.get(label)
            && let Some(slot) = self.thread_slot(index)
        {
            slot.start(self.now());
        }
    }

    /// Like [`Context::end`], keyed on `(label, calling thread)`.
    pub fn end_for_current_thread<Q>(&self, label: &Q)
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.now();
        if let Some(&index) = self.index.get(label)
            && let Some(slot) = self.thread_slot(index)
        {
            slot.stop(now);
        }
    }

    /// Record `sample` directly into the global histogram for `label`.
    pub fn input<Q>(&self, label: &Q, sample: u64)
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(entry) = self.global(label) {
            entry.histogram().input(sample);
        }
    }

    /// Record `sample` into the calling thread's histogram for `label`.
    pub fn input_for_current_thread<Q>(&self, label: &Q, sample: u64)
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(&index) = self.index.get(label)
            && let Some(slot) = self.thread_slot(index)
        {
            slot.histogram.input(sample);
        }
    }

    /// Begin timing `label` now and end when the guard is dropped.
    pub fn span<Q>(&self, label: &Q) -> Span<'_>
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.global(label).map(|entry| Arc::clone(&entry.slot));
        Span::start(slot, &self.epoch)
    }

    /// Per-thread variant of [`Context::span`].
    pub fn span_for_current_thread<Q>(&self, label: &Q) -> Span<'_>
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self
            .index
            .get(label)
            .and_then(|&index| self.thread_slot(index));
        Span::start(slot, &self.epoch)
    }

    /// Run `f`, recording its duration under `label`.
    pub fn profiled<Q, R>(&self, label: &Q, f: impl FnOnce() -> R) -> R
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _span = self.span(label);
        f()
    }

    /// Per-thread variant of [`Context::profiled`].
    pub fn profiled_for_current_thread<Q, R>(&self, label: &Q, f: impl FnOnce() -> R) -> R
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _span = self.span_for_current_thread(label);
        f()
    }

    /// Add `count` events to the rate counter for `label`.
    pub fn count<Q>(&self, label: &Q, count: u64)
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(counter) = self.rates.get(label) {
            counter.sample(count);
        }
    }

    pub fn rate_counter<Q>(&self, label: &Q) -> Option<&RateCounter>
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rates.get(label)
    }

    /// The global histogram for `label`.
    pub fn histogram<Q>(&self, label: &Q) -> Option<&Histogram>
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.global(label).map(|entry| entry.histogram())
    }

    /// The global entry for `label` followed by its per-thread entries in
    /// creation order. Empty if `label` is not declared.
    pub fn entries<Q>(&self, label: &Q) -> Vec<Arc<Entry<L>>>
    where
        L: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(&index) = self.index.get(label) else {
            return Vec::new();
        };
        let table = self.threads.lock();
        std::iter::once(Arc::clone(&self.globals[index]))
            .chain(table.groups[index].iter().cloned())
            .collect()
    }

    /// Declared histogram labels in declaration order.
    pub fn labels(&self) -> impl Iterator<Item = &L> {
        self.globals.iter().map(|entry| &entry.label)
    }

    /// Every entry, grouped by label in declaration order.
    fn all_entries(&self) -> Vec<Arc<Entry<L>>> {
        let table = self.threads.lock();
        self.globals
            .iter()
            .zip(&table.groups)
            .flat_map(|(global, threads)| std::iter::once(global).chain(threads))
            .cloned()
            .collect()
    }

    /// Write every histogram to `out` in `format`.
    pub fn export<W: Write>(&self, out: &mut W, format: OutputFormat) -> io::Result<()> {
        let entries = self.all_entries();
        let histograms: Vec<(String, &Histogram)> = entries
            .iter()
            .map(|entry| (entry.name(), entry.histogram()))
            .collect();
        write_report(out, format, &histograms)
    }

    /// Schedule a flush of every file-backed arena.
    pub fn sync(&self) {
        if let Some(arena) = &self.arena {
            arena.sync();
        }
        let table = self.threads.lock();
        for entry in table.groups.iter().flatten() {
            entry.histogram().arena().sync();
        }
    }

    /// The file holding the global records, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The arena holding the global records. `None` before a non-empty
    /// initialization.
    pub fn arena(&self) -> Option<&Arc<Arena>> {
        self.arena.as_ref()
    }
}

impl Context<String> {
    /// Build and initialize a context from a loaded configuration.
    pub fn from_config(config: &ProfilerConfig) -> Result<Self> {
        config.validate()?;
        let mut context = match &config.path {
            Some(path) => Self::with_path(path),
            None => Self::new(),
        };
        context.initialize_with_rates(&config.declarations(), &config.rate_declarations())?;
        Ok(context)
    }
}

impl<L> Default for Context<L>
where
    L: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<L> std::fmt::Debug for Context<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("path", &self.path)
            .field("histograms", &self.globals.len())
            .field("rates", &self.rates.len())
            .field("arena", &self.arena)
            .finish()
    }
}

fn histogram_reservation(num_buckets: usize) -> Option<usize> {
    Arena::reservation::<HistogramHeader, AtomicU64>(num_buckets)
}

/// Remove a file written by a previous initialization.
fn remove_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = ?path, error = %e, "failed to remove stale profile file"),
    }
}

/// `<path>.thread-<sequence>`
fn thread_path(path: &Path, sequence: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".thread-{sequence}"));
    PathBuf::from(name)
}

/// Guard returned by [`Context::span`]. Records the elapsed time when
/// dropped.
#[must_use = "the span ends when dropped"]
pub struct Span<'a> {
    slot: Option<Arc<Slot>>,
    epoch: &'a Instant,
}

impl<'a> Span<'a> {
    fn start(slot: Option<Arc<Slot>>, epoch: &'a Instant) -> Self {
        if let Some(slot) = &slot {
            slot.start(epoch.elapsed().as_nanos() as u64);
        }
        Self { slot, epoch }
    }
}

impl Drop for Span<'_> {
    fn drop(&mut self) {
        if let Some(slot) = &self.slot {
            slot.stop(self.epoch.elapsed().as_nanos() as u64);
        }
    }
}
