use crate::task::{ITask, TaskContext};
use derive_more::Debug;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Error raised by a [`MemoryAllocator`]; propagated to the caller that
/// requested the buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("allocation failed: {0}")]
pub struct AllocError(pub String);

/// Error kind for memory-edge operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MemoryError {
    /// The task has no memory edge with the given name.
    #[error("no memory edge named '{0}' on this task")]
    UnknownEdge(String),
    /// The named memory edge holds buffers of a different type.
    #[error("memory edge '{0}' holds a different buffer type")]
    TypeMismatch(String),
    /// The memory manager serving the edge has already shut down.
    #[error("memory manager for edge '{0}' has terminated")]
    Terminated(String),
    /// No memory manager is registered at the buffer's address.
    #[error("no memory manager registered at address '{0}'")]
    UnknownAddress(String),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Memory-manager policy variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MMType {
    /// Buffers are allocated once at pool fill and recycled as-is.
    Static,
    /// Buffers are allocated per borrow ([`TaskContext::get_dynamic_memory`])
    /// and freed by the manager on each recycle.
    Dynamic,
    /// The manager neither allocates nor frees; buffers are placeholders the
    /// borrowing tasks fill themselves.
    UserManaged,
}

impl MMType {
    fn as_str(self) -> &'static str {
        match self {
            MMType::Static => "static",
            MMType::Dynamic => "dynamic",
            MMType::UserManaged => "user-managed",
        }
    }
}

/// Allocation strategy behind a memory edge.
///
/// `pipeline_id` identifies the execution-pipeline replica the buffer
/// belongs to, letting device-bound allocators place each pipeline's pool on
/// its own device.
pub trait MemoryAllocator: Send + Sync + 'static {
    /// The buffer object allocated and recycled by this allocator.
    type Item: Send + 'static;

    fn allocate(&self, size: usize, pipeline_id: usize) -> Result<Self::Item, AllocError>;

    fn free(&self, _item: &mut Self::Item, _pipeline_id: usize) {}

    /// Element count used when filling a static pool.
    fn default_size(&self) -> usize;
}

/// Decides when a released buffer may be recycled back into its pool.
///
/// The memory manager advances the rule once per arriving release and
/// recycles the buffer when [`MemoryReleaseRule::can_release`] holds.
pub trait MemoryReleaseRule: Send + 'static {
    fn memory_used(&mut self);
    fn can_release(&self) -> bool;
}

/// Release rule that recycles after a fixed number of releases.
#[derive(Debug, Clone)]
pub struct ReleaseCountRule {
    remaining: usize,
}

impl ReleaseCountRule {
    pub fn new(count: usize) -> Self {
        Self { remaining: count }
    }
}

impl MemoryReleaseRule for ReleaseCountRule {
    fn memory_used(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    fn can_release(&self) -> bool {
        self.remaining == 0
    }
}

/// A pooled buffer together with its recycling metadata.
///
/// Identity is preserved across the borrow/release cycle: the same buffer
/// object cycles from the pool through a borrower and the release edge back
/// into the pool, and nothing is
/// returned to the heap before pool teardown (except `Dynamic` frees, which
/// are the variant's contract).
#[derive(Debug)]
pub struct Memory<B: Send + 'static> {
    #[debug(skip)]
    buf: B,
    #[debug(skip)]
    allocator: Arc<dyn MemoryAllocator<Item = B>>,
    #[debug(skip)]
    release_rule: Option<Box<dyn MemoryReleaseRule>>,
    pipeline_id: usize,
    manager_name: String,
    /// Communicator address of the owning memory manager; routes releases
    /// back to the right pipeline's release edge.
    address: String,
}

impl<B: Send + 'static> Memory<B> {
    pub(crate) fn new(
        buf: B,
        allocator: Arc<dyn MemoryAllocator<Item = B>>,
        pipeline_id: usize,
        manager_name: String,
        address: String,
    ) -> Self {
        Self {
            buf,
            allocator,
            release_rule: None,
            pipeline_id,
            manager_name,
            address,
        }
    }

    pub fn get(&self) -> &B {
        &self.buf
    }

    pub fn get_mut(&mut self) -> &mut B {
        &mut self.buf
    }

    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    /// Name of the memory edge this buffer was issued from.
    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Advances the release rule by one use.
    pub fn memory_used(&mut self) {
        if let Some(rule) = &mut self.release_rule {
            rule.memory_used();
        }
    }

    /// Whether the release rule allows recycling. Buffers without a rule are
    /// always recyclable.
    pub fn can_release(&self) -> bool {
        self.release_rule.as_ref().map_or(true, |rule| rule.can_release())
    }

    pub(crate) fn set_release_rule(&mut self, rule: Box<dyn MemoryReleaseRule>) {
        self.release_rule = Some(rule);
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<(), MemoryError> {
        let fresh = self.allocator.allocate(size, self.pipeline_id)?;
        self.allocator.free(&mut self.buf, self.pipeline_id);
        self.buf = fresh;
        Ok(())
    }

    pub(crate) fn free_buffer(&mut self) {
        self.allocator.free(&mut self.buf, self.pipeline_id);
    }
}

/// Fixed-capacity bag of pooled buffers.
///
/// `issued() + available() == capacity` at every quiescent moment.
#[derive(Debug)]
pub(crate) struct MemoryPool<B: Send + 'static> {
    available: VecDeque<Memory<B>>,
    capacity: usize,
}

impl<B: Send + 'static> MemoryPool<B> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            available: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn add(&mut self, memory: Memory<B>) {
        self.available.push_back(memory);
        assert!(
            self.available.len() <= self.capacity,
            "MemoryPool::add: pool overflow"
        );
    }

    pub(crate) fn take(&mut self) -> Option<Memory<B>> {
        self.available.pop_front()
    }

    pub(crate) fn available(&self) -> usize {
        self.available.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Long-running task serving a bounded pool of typed buffers.
///
/// The input connector is the release edge (borrowing tasks produce into
/// it), the output connector is the acquisition edge. At startup the manager
/// fills its pool and publishes every buffer; each arriving release is
/// recycled according to the buffer's release rule and re-published with
/// identity preserved. Acquisition blocks while the pool is empty; this is
/// the graph's sole back-pressure mechanism.
pub struct MemoryManager<B: Send + 'static> {
    name: String,
    pool_size: usize,
    allocator: Arc<dyn MemoryAllocator<Item = B>>,
    mm_type: MMType,
    pool: MemoryPool<B>,
    /// Released buffers whose rule does not yet allow recycling; parked here
    /// until teardown so no buffer is dropped early.
    held: Vec<Memory<B>>,
    /// Communicator address of this manager's release edge; stamped by the
    /// memory edge at application time.
    edge_address: String,
}

impl<B: Send + 'static> MemoryManager<B> {
    pub fn new<A>(name: impl Into<String>, pool_size: usize, allocator: A, mm_type: MMType) -> Self
    where
        A: MemoryAllocator<Item = B>,
    {
        Self {
            name: name.into(),
            pool_size,
            allocator: Arc::new(allocator),
            mm_type,
            pool: MemoryPool::new(pool_size),
            held: Vec::new(),
            edge_address: String::new(),
        }
    }

    pub(crate) fn edge_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_edge_address(&mut self, address: String) {
        self.edge_address = address;
    }

    fn fill_pool(&mut self, pipeline_id: usize) {
        let size = match self.mm_type {
            MMType::Static => self.allocator.default_size(),
            MMType::Dynamic | MMType::UserManaged => 0,
        };
        for _ in 0..self.pool_size {
            let buf = self
                .allocator
                .allocate(size, pipeline_id)
                .unwrap_or_else(|err| {
                    panic!("memory manager '{}' failed to fill its pool: {err}", self.name)
                });
            self.pool.add(Memory::new(
                buf,
                Arc::clone(&self.allocator),
                pipeline_id,
                self.name.clone(),
                self.edge_address.clone(),
            ));
        }
        log::debug!(
            "memory manager '{}' filled pool of {} (pipeline {})",
            self.name,
            self.pool_size,
            pipeline_id
        );
    }
}

impl<B: Send + 'static> ITask for MemoryManager<B> {
    type Input = Memory<B>;
    type Output = Memory<B>;

    fn initialize(&mut self, ctx: &mut TaskContext<'_, Memory<B>>) {
        self.pool = MemoryPool::new(self.pool_size);
        self.fill_pool(ctx.pipeline_id());
    }

    fn execute_task(&mut self, data: Option<Memory<B>>, ctx: &mut TaskContext<'_, Memory<B>>) {
        if let Some(mut memory) = data {
            if memory.pipeline_id() != ctx.pipeline_id() {
                log::error!(
                    "memory manager '{}' (pipeline {}) received a release from pipeline {}",
                    self.name,
                    ctx.pipeline_id(),
                    memory.pipeline_id()
                );
                self.held.push(memory);
            } else {
                memory.memory_used();
                if memory.can_release() {
                    if self.mm_type == MMType::Dynamic {
                        memory.free_buffer();
                    }
                    self.pool.add(memory);
                } else {
                    self.held.push(memory);
                }
            }
        }
        while let Some(memory) = self.pool.take() {
            ctx.add_result(memory);
        }
    }

    fn shutdown(&mut self, _ctx: &mut TaskContext<'_, Memory<B>>) {
        let recovered = self.pool.available() + self.held.len();
        if recovered != self.pool.capacity() {
            log::warn!(
                "memory manager '{}' shutting down with {} of {} buffers still issued",
                self.name,
                self.pool.capacity() - recovered,
                self.pool.capacity()
            );
        }
        if self.mm_type != MMType::UserManaged {
            while let Some(mut memory) = self.pool.take() {
                memory.free_buffer();
            }
            for memory in &mut self.held {
                memory.free_buffer();
            }
        }
        self.held.clear();
    }

    fn copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            pool_size: self.pool_size,
            allocator: Arc::clone(&self.allocator),
            mm_type: self.mm_type,
            pool: MemoryPool::new(self.pool_size),
            held: Vec::new(),
            edge_address: String::new(),
        }
    }

    fn name(&self) -> String {
        format!("mm({}): {}", self.mm_type.as_str(), self.name)
    }

    fn is_start_task(&self) -> bool {
        true
    }

    fn dot_fill_color(&self) -> String {
        "sienna".to_string()
    }
}
