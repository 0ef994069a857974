//! GPU binding layer, available with the `cuda` feature.
//!
//! [`CudaTask`] wraps an [`ICudaTask`] as an ordinary [`ITask`]: at
//! initialization it binds the replica to GPU `cuda_ids[pipeline_id]`,
//! creates a dedicated stream, and probes peer access to every other GPU in
//! the set. [`CudaEnv::auto_copy`] then moves buffers between replicas'
//! GPUs only when peer access is unavailable.

use crate::{
    graph::{GraphError, TaskGraphConf, TaskHandle},
    memory::{AllocError, Memory, MemoryAllocator, MMType},
    task::{ITask, TaskContext},
    types::HashMap,
    utils::short_type_name,
};
use cudarc::driver::{
    result, CudaContext, CudaSlice, CudaStream, DeviceRepr, DriverError, ValidAsZeroBits,
};
use std::sync::{Arc, RwLock};

/// The GPU binding handed to an [`ICudaTask`]: selected device, dedicated
/// stream, and the peer-access map of the pipeline's GPU set.
pub struct CudaEnv {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    cuda_id: usize,
    cuda_ids: Vec<usize>,
    /// GPU ids in `cuda_ids` this device cannot read directly.
    non_peer_dev_ids: Vec<usize>,
}

impl CudaEnv {
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    /// The stream created for this task replica.
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// Ordinal of the GPU this replica is bound to.
    pub fn cuda_id(&self) -> usize {
        self.cuda_id
    }

    pub fn non_peer_dev_ids(&self) -> &[usize] {
        &self.non_peer_dev_ids
    }

    /// Whether buffers owned by `pipeline_id`'s GPU must be copied before
    /// this replica can read them.
    pub fn requires_copy(&self, pipeline_id: usize) -> bool {
        let gpu = self.cuda_ids[pipeline_id % self.cuda_ids.len()];
        self.non_peer_dev_ids.contains(&gpu)
    }

    /// Copies `len` elements of `src` into `dst` when the source pipeline's
    /// GPU is not peer-accessible, returning `true` iff a copy was issued.
    /// When this returns `false` the caller may read the source buffer
    /// directly.
    pub fn auto_copy<T>(
        &self,
        dst: &mut CudaSlice<T>,
        src: &Memory<CudaSlice<T>>,
        len: usize,
    ) -> Result<bool, DriverError>
    where
        T: DeviceRepr + Clone,
    {
        if !self.requires_copy(src.pipeline_id()) {
            return Ok(false);
        }
        // Without peer access the transfer stages through host memory.
        let staged = self.stream.memcpy_dtov(src.get())?;
        self.stream.memcpy_htod(&staged[..len], dst)?;
        Ok(true)
    }

    pub fn synchronize(&self) -> Result<(), DriverError> {
        self.stream.synchronize()
    }
}

/// User contract for a GPU-bound task. Wrapped by [`CudaTask`] to become an
/// [`ITask`].
pub trait ICudaTask: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Called once after the replica is bound to its GPU and stream.
    fn initialize_cuda(&mut self, _cuda: &CudaEnv, _ctx: &mut TaskContext<'_, Self::Output>) {}

    fn execute_cuda(
        &mut self,
        data: Option<Self::Input>,
        cuda: &CudaEnv,
        ctx: &mut TaskContext<'_, Self::Output>,
    );

    /// Called before the stream is torn down.
    fn shutdown_cuda(&mut self, _cuda: &CudaEnv) {}

    fn copy(&self) -> Self
    where
        Self: Sized;

    fn name(&self) -> String
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    fn num_threads(&self) -> usize {
        1
    }

    fn is_start_task(&self) -> bool {
        false
    }
}

/// Adapter pinning an [`ICudaTask`] to one GPU per pipeline replica.
pub struct CudaTask<K: ICudaTask> {
    inner: K,
    cuda_ids: Vec<usize>,
    auto_enable_peer_access: bool,
    env: Option<CudaEnv>,
}

impl<K: ICudaTask> CudaTask<K> {
    /// Binds replica `i` to GPU `cuda_ids[i % cuda_ids.len()]`, with peer
    /// access enabled where the hardware allows it.
    pub fn new(inner: K, cuda_ids: Vec<usize>) -> Self {
        assert!(
            !cuda_ids.is_empty(),
            "CudaTask::new: at least one CUDA id is required"
        );
        Self {
            inner,
            cuda_ids,
            auto_enable_peer_access: true,
            env: None,
        }
    }

    /// Disables automatic peer access: every other GPU is treated as
    /// non-peer and [`CudaEnv::auto_copy`] always copies.
    pub fn without_peer_access(mut self) -> Self {
        self.auto_enable_peer_access = false;
        self
    }
}

fn can_access_peer(device: usize, peer: usize) -> bool {
    let device = match result::device::get(device as i32) {
        Ok(handle) => handle,
        Err(_) => return false,
    };
    let peer = match result::device::get(peer as i32) {
        Ok(handle) => handle,
        Err(_) => return false,
    };
    result::device::can_access_peer(device, peer)
        .map(|flag| flag != 0)
        .unwrap_or(false)
}

impl<K: ICudaTask> ITask for CudaTask<K> {
    type Input = K::Input;
    type Output = K::Output;

    fn initialize(&mut self, ctx: &mut TaskContext<'_, K::Output>) {
        let cuda_id = self.cuda_ids[ctx.pipeline_id() % self.cuda_ids.len()];
        let context = CudaContext::new(cuda_id).unwrap_or_else(|err| {
            panic!("CUDA id {cuda_id} is not usable (pipeline {}): {err}", ctx.pipeline_id())
        });
        let stream = context
            .new_stream()
            .unwrap_or_else(|err| panic!("failed to create stream on CUDA {cuda_id}: {err}"));
        let mut non_peer_dev_ids = Vec::new();
        for &peer in &self.cuda_ids {
            if peer == cuda_id {
                continue;
            }
            let accessible = self.auto_enable_peer_access && can_access_peer(cuda_id, peer);
            if !accessible && !non_peer_dev_ids.contains(&peer) {
                non_peer_dev_ids.push(peer);
            }
        }
        log::debug!(
            "bound '{}' to CUDA {cuda_id} (pipeline {}, non-peer: {:?})",
            self.inner.name(),
            ctx.pipeline_id(),
            non_peer_dev_ids
        );
        let env = CudaEnv {
            context,
            stream,
            cuda_id,
            cuda_ids: self.cuda_ids.clone(),
            non_peer_dev_ids,
        };
        self.inner.initialize_cuda(&env, ctx);
        self.env = Some(env);
    }

    fn execute_task(&mut self, data: Option<K::Input>, ctx: &mut TaskContext<'_, K::Output>) {
        let env = self.env.as_ref().expect("CudaTask::execute_task: [1]");
        self.inner.execute_cuda(data, env, ctx);
    }

    fn shutdown(&mut self, _ctx: &mut TaskContext<'_, K::Output>) {
        if let Some(env) = &self.env {
            self.inner.shutdown_cuda(env);
            if let Err(err) = env.synchronize() {
                log::warn!("stream sync failed during shutdown of '{}': {err}", self.inner.name());
            }
        }
        self.env = None;
    }

    fn copy(&self) -> Self {
        Self {
            inner: self.inner.copy(),
            cuda_ids: self.cuda_ids.clone(),
            auto_enable_peer_access: self.auto_enable_peer_access,
            env: None,
        }
    }

    fn name(&self) -> String {
        self.inner.name()
    }

    fn num_threads(&self) -> usize {
        self.inner.num_threads()
    }

    fn is_start_task(&self) -> bool {
        self.inner.is_start_task()
    }

    fn dot_fill_color(&self) -> String {
        "green3".to_string()
    }
}

/// Device-memory allocator for CUDA memory edges.
///
/// Each pipeline replica's pool lives on `cuda_ids[pipeline_id]`; contexts
/// are created lazily per pipeline.
pub struct CudaMemoryAllocator<T> {
    cuda_ids: Vec<usize>,
    default_size: usize,
    contexts: RwLock<HashMap<usize, Arc<CudaContext>>>,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> CudaMemoryAllocator<T> {
    pub fn new(cuda_ids: Vec<usize>, default_size: usize) -> Self {
        assert!(
            !cuda_ids.is_empty(),
            "CudaMemoryAllocator::new: at least one CUDA id is required"
        );
        Self {
            cuda_ids,
            default_size,
            contexts: RwLock::new(HashMap::default()),
            _marker: core::marker::PhantomData,
        }
    }

    fn context(&self, pipeline_id: usize) -> Result<Arc<CudaContext>, AllocError> {
        let cuda_id = self.cuda_ids[pipeline_id % self.cuda_ids.len()];
        if let Some(context) = self
            .contexts
            .read()
            .expect("CudaMemoryAllocator::context: [1]")
            .get(&cuda_id)
        {
            return Ok(Arc::clone(context));
        }
        let context = CudaContext::new(cuda_id)
            .map_err(|err| AllocError(format!("CUDA id {cuda_id} is not usable: {err}")))?;
        self.contexts
            .write()
            .expect("CudaMemoryAllocator::context: [2]")
            .insert(cuda_id, Arc::clone(&context));
        Ok(context)
    }
}

impl<T> MemoryAllocator for CudaMemoryAllocator<T>
where
    T: DeviceRepr + ValidAsZeroBits + Send + Sync + 'static,
{
    type Item = CudaSlice<T>;

    fn allocate(&self, size: usize, pipeline_id: usize) -> Result<CudaSlice<T>, AllocError> {
        let context = self.context(pipeline_id)?;
        // Zero-element placeholders still need a live allocation handle.
        context
            .default_stream()
            .alloc_zeros::<T>(size.max(1))
            .map_err(|err| AllocError(format!("device allocation of {size} elements failed: {err}")))
    }

    fn default_size(&self) -> usize {
        self.default_size
    }
}

impl<In: Send + 'static, Out: Send + 'static> TaskGraphConf<In, Out> {
    /// CUDA variant of
    /// [`add_memory_manager_edge`](TaskGraphConf::add_memory_manager_edge):
    /// the pool's buffers are device allocations on the consumer replica's
    /// GPU.
    pub fn add_cuda_memory_manager_edge<T, I, O>(
        &mut self,
        name: &str,
        consumer: &TaskHandle<I, O>,
        cuda_ids: Vec<usize>,
        buffer_len: usize,
        pool_size: usize,
        mm_type: MMType,
    ) -> Result<(), GraphError>
    where
        T: DeviceRepr + ValidAsZeroBits + Send + Sync + 'static,
        I: Send + 'static,
        O: Send + 'static,
    {
        self.add_memory_manager_edge(
            name,
            consumer,
            CudaMemoryAllocator::<T>::new(cuda_ids, buffer_len),
            pool_size,
            mm_type,
        )
    }
}
