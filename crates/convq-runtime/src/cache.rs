use crate::{
    config::{cache::CacheLogLevel, Logger},
    memory::{Buffer, Memory, MemoryDesc},
    reorder::{Reorder, ReorderAttr},
    RuntimeError,
};
use alloc::{format, string::String, sync::Arc, vec::Vec};
use convq_common::stream_id::StreamId;
use convq_quant::DerivedScales;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;

/// Identity of a bound operator instance: the names of the tensors feeding it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorKey {
    input: String,
    filter: String,
    bias: Option<String>,
}

impl OperatorKey {
    /// Create the key of an operator reading `input` and `filter`, and `bias` when present.
    pub fn new(input: impl Into<String>, filter: impl Into<String>, bias: Option<&str>) -> Self {
        Self {
            input: input.into(),
            filter: filter.into(),
            bias: bias.map(Into::into),
        }
    }
}

impl core::fmt::Display for OperatorKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.bias {
            Some(bias) => write!(f, "{}|{}|{}", self.input, self.filter, bias),
            None => write!(f, "{}|{}", self.input, self.filter),
        }
    }
}

/// Operand whose memory goes through a cached reorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// The input activation.
    Source,
    /// The filter.
    Weights,
    /// The bias.
    Bias,
}

/// What is stored under a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    /// The memory wrapping the caller's buffer.
    UserMemory(Slot),
    /// The memory in the layout expected by the primitive.
    TargetMemory(Slot),
    /// The reorder from the user memory to the target memory.
    Reorder(Slot),
    /// Mask and scales used to reorder the bias.
    BiasScales,
    /// Requantization factors derived at inference time.
    DerivedScales,
}

/// Fully qualified cache key.
#[derive(new, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The operator instance.
    pub operator: OperatorKey,
    /// The stream driving the operator.
    pub stream: StreamId,
    /// The artifact stored under the key.
    pub kind: ArtifactKind,
}

impl core::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}/{:?}", self.operator, self.stream.value, self.kind)
    }
}

/// A mask and the scales it selects.
#[derive(new, Clone, Debug, PartialEq)]
pub struct ScaleTuple {
    /// Dimensions carrying distinct scales.
    pub mask: i32,
    /// The scales.
    pub values: Vec<f32>,
}

/// A cached artifact.
#[derive(Clone, Debug)]
pub enum CacheEntry {
    /// A memory object.
    Memory(Arc<Memory>),
    /// A reorder primitive.
    Reorder(Arc<Reorder>),
    /// A scale tuple.
    Scales(Arc<ScaleTuple>),
    /// Derived requantization factors.
    Derived(Arc<DerivedScales>),
}

/// Types that can be stored in the [ScaleCache].
pub trait Artifact: Sized {
    /// Wrap the artifact into an entry.
    fn into_entry(value: Arc<Self>) -> CacheEntry;
    /// Extract the artifact from an entry of the matching variant.
    fn from_entry(entry: &CacheEntry) -> Option<Arc<Self>>;
}

macro_rules! impl_artifact {
    ($ty:ty, $variant:ident) => {
        impl Artifact for $ty {
            fn into_entry(value: Arc<Self>) -> CacheEntry {
                CacheEntry::$variant(value)
            }

            fn from_entry(entry: &CacheEntry) -> Option<Arc<Self>> {
                match entry {
                    CacheEntry::$variant(value) => Some(value.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_artifact!(Memory, Memory);
impl_artifact!(Reorder, Reorder);
impl_artifact!(ScaleTuple, Scales);
impl_artifact!(DerivedScales, Derived);

/// Snapshot of the cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that had to compute their artifact.
    pub misses: u64,
    /// Reorder executions, first computations included.
    pub reorders: u64,
}

/// Everything needed to fetch an operand memory in the layout a primitive expects.
#[derive(new, Debug)]
pub struct ReorderRequest<'a> {
    /// The operator instance.
    pub operator: &'a OperatorKey,
    /// The stream driving the operator.
    pub stream: StreamId,
    /// Which operand is requested.
    pub slot: Slot,
    /// Descriptor of the caller's buffer.
    pub user_desc: MemoryDesc,
    /// Descriptor expected by the primitive.
    pub target_desc: &'a MemoryDesc,
    /// The caller's buffer for this call.
    pub data: Arc<Buffer>,
    /// Whether the operand stays the same across calls, like weights and biases.
    pub persistent: bool,
    /// Scales applied by the reorder.
    pub attr: ReorderAttr,
}

/// Memoizes derived scales and reorder artifacts across the calls of an operator.
///
/// Entries are never evicted, they live as long as the cache, which is owned by an
/// [ExecutionContext](crate::ExecutionContext).
///
/// Lookups take a short lock on the map, artifacts are computed and reorders executed without
/// holding it. Keys include the stream, so two threads never race on the same entry.
pub struct ScaleCache {
    entries: spin::Mutex<HashMap<CacheKey, CacheEntry>>,
    logger: spin::Mutex<Logger>,
    hits: AtomicU64,
    misses: AtomicU64,
    reorders: AtomicU64,
}

impl core::fmt::Debug for ScaleCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScaleCache")
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ScaleCache {
    /// Create an empty cache reporting to the given logger.
    pub fn new(logger: Logger) -> Self {
        Self {
            entries: spin::Mutex::new(HashMap::new()),
            logger: spin::Mutex::new(logger),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            reorders: AtomicU64::new(0),
        }
    }

    /// Number of stored artifacts.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reorders: self.reorders.load(Ordering::Relaxed),
        }
    }

    /// Fetch an artifact.
    pub fn get<T: Artifact>(&self, key: &CacheKey) -> Result<Option<Arc<T>>, RuntimeError> {
        match self.entries.lock().get(key) {
            Some(entry) => T::from_entry(entry).map(Some).ok_or_else(|| {
                RuntimeError::cache_inconsistent(format!(
                    "key {key} holds another kind of artifact"
                ))
            }),
            None => Ok(None),
        }
    }

    /// Store an artifact, replacing any previous one.
    pub fn insert<T: Artifact>(&self, key: CacheKey, value: Arc<T>) {
        self.entries.lock().insert(key, T::into_entry(value));
    }

    /// Return the artifact stored under `key`, computing and storing it on first access.
    pub fn get_or_compute<T, E, F>(&self, key: CacheKey, compute: F) -> Result<Arc<T>, E>
    where
        T: Artifact,
        E: From<RuntimeError>,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get::<T>(&key)? {
            self.hit(&key);
            return Ok(value);
        }

        self.miss(&key);
        // Computing must not hold the lock, it may use the cache itself.
        let value = Arc::new(compute()?);
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key)
            .or_insert_with(|| T::into_entry(value.clone()));

        Ok(T::from_entry(entry).unwrap_or(value))
    }

    /// Return the memory of an operand in the layout expected by a primitive.
    ///
    /// On first access the caller's buffer is wrapped, reordered into a new target memory when
    /// the descriptors differ, and the user memory, target memory and reorder are stored.
    ///
    /// On later accesses the user memory is rebound to the new buffer. Non-persistent operands
    /// then re-run the stored reorder, persistent ones keep the target computed the first time.
    pub fn get_or_reorder(&self, request: ReorderRequest<'_>) -> Result<Arc<Memory>, RuntimeError> {
        let key = |kind| CacheKey::new(request.operator.clone(), request.stream, kind);
        let target_key = key(ArtifactKind::TargetMemory(request.slot));
        let user_key = key(ArtifactKind::UserMemory(request.slot));
        let reorder_key = key(ArtifactKind::Reorder(request.slot));

        let Some(target) = self.get::<Memory>(&target_key)? else {
            self.miss(&target_key);

            let user = Arc::new(Memory::new(request.user_desc.clone(), request.data)?);
            let target = if &request.user_desc != request.target_desc {
                let target = Arc::new(Memory::allocate(request.target_desc.clone()));
                let reorder = Arc::new(Reorder::new(
                    &request.user_desc,
                    request.target_desc,
                    request.attr,
                )?);
                self.execute(&reorder_key, &reorder, &user, &target)?;
                self.insert(reorder_key, reorder);
                target
            } else {
                user.clone()
            };

            self.insert(user_key, user);
            self.insert(target_key, target.clone());
            return Ok(target);
        };

        self.hit(&target_key);

        let user = self.get::<Memory>(&user_key)?.ok_or_else(|| {
            RuntimeError::cache_inconsistent(format!("{target_key} is cached without {user_key}"))
        })?;
        user.set_data_handle(request.data)?;

        if !request.persistent {
            if let Some(reorder) = self.get::<Reorder>(&reorder_key)? {
                self.execute(&reorder_key, &reorder, &user, &target)?;
            }
        }

        Ok(target)
    }

    /// Return the memory of an operand in the layout expected by a primitive, without storing
    /// anything.
    ///
    /// Meant for operands whose shape may change from one call to the next, like the source
    /// activation. The reorder, when needed, still counts in [CacheStats::reorders].
    pub fn reorder_uncached(
        &self,
        request: ReorderRequest<'_>,
    ) -> Result<Arc<Memory>, RuntimeError> {
        let user = Arc::new(Memory::new(request.user_desc.clone(), request.data)?);
        if &request.user_desc == request.target_desc {
            return Ok(user);
        }

        let key = CacheKey::new(
            request.operator.clone(),
            request.stream,
            ArtifactKind::Reorder(request.slot),
        );
        let target = Arc::new(Memory::allocate(request.target_desc.clone()));
        let reorder = Reorder::new(&request.user_desc, request.target_desc, request.attr)?;
        self.execute(&key, &reorder, &user, &target)?;

        Ok(target)
    }

    fn execute(
        &self,
        key: &CacheKey,
        reorder: &Reorder,
        from: &Memory,
        to: &Memory,
    ) -> Result<(), RuntimeError> {
        self.reorders.fetch_add(1, Ordering::Relaxed);
        log::trace!("Executing reorder {key}");

        let mut logger = self.logger.lock();
        if logger.cache_activated() {
            logger.log_cache(&format!(
                "[convq] reorder {key} {:?} -> {:?}",
                reorder.src_desc(),
                reorder.dst_desc()
            ));
        }
        core::mem::drop(logger);

        reorder.execute(from, to)
    }

    fn hit(&self, key: &CacheKey) {
        self.hits.fetch_add(1, Ordering::Relaxed);

        let mut logger = self.logger.lock();
        if logger.log_level_cache() == CacheLogLevel::Full {
            logger.log_cache(&format!("[convq] cache hit {key}"));
        }
    }

    fn miss(&self, key: &CacheKey) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!("Cache miss {key}");

        let mut logger = self.logger.lock();
        if logger.cache_activated() {
            logger.log_cache(&format!("[convq] cache miss {key}"));
        }
    }
}

impl Drop for ScaleCache {
    fn drop(&mut self) {
        let stats = self.stats();
        log::debug!(
            "Releasing {} cached artifacts ({} hits, {} misses, {} reorders)",
            self.entries.get_mut().len(),
            stats.hits,
            stats.misses,
            stats.reorders
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::memory::{DataType, Format};
    use alloc::vec;

    fn cache() -> ScaleCache {
        ScaleCache::new(Logger::from_config(Arc::new(GlobalConfig::default())))
    }

    fn key(kind: ArtifactKind) -> CacheKey {
        CacheKey::new(OperatorKey::new("x", "w", None), StreamId::SHARED, kind)
    }

    #[test]
    fn computes_once() {
        let cache = cache();
        let mut calls = 0;

        for _ in 0..3 {
            let scales = cache
                .get_or_compute::<_, RuntimeError, _>(key(ArtifactKind::BiasScales), || {
                    calls += 1;
                    Ok(ScaleTuple::new(1, vec![0.5, 0.25]))
                })
                .unwrap();
            assert_eq!(scales.values, vec![0.5, 0.25]);
        }

        assert_eq!(calls, 1);
        assert_eq!(cache.stats().hits, 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn compute_errors_are_not_cached() {
        let cache = cache();

        let failed = cache.get_or_compute::<ScaleTuple, RuntimeError, _>(
            key(ArtifactKind::BiasScales),
            || Err(RuntimeError::invalid_descriptor("boom".into())),
        );

        assert!(failed.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn wrong_kind_is_reported() {
        let cache = cache();
        cache.insert(
            key(ArtifactKind::BiasScales),
            Arc::new(ScaleTuple::new(0, vec![1.0])),
        );

        assert!(cache
            .get::<Memory>(&key(ArtifactKind::BiasScales))
            .is_err());
    }

    #[test]
    fn bias_presence_changes_identity() {
        let with_bias = OperatorKey::new("x", "w", Some("b"));
        let without_bias = OperatorKey::new("x", "w", None);

        assert_ne!(with_bias, without_bias);
        assert_eq!(with_bias, OperatorKey::new("x", "w", Some("b")));
    }

    #[test]
    fn identical_layout_skips_reorder() {
        let cache = cache();
        let operator = OperatorKey::new("x", "w", None);
        let desc = MemoryDesc::new(vec![2], DataType::F32, Format::X).unwrap();
        let data = Arc::new(Buffer::F32(vec![1.0, 2.0]));

        let memory = cache
            .get_or_reorder(ReorderRequest::new(
                &operator,
                StreamId::SHARED,
                Slot::Bias,
                desc.clone(),
                &desc,
                data.clone(),
                true,
                ReorderAttr::default(),
            ))
            .unwrap();

        assert!(Arc::ptr_eq(&memory.data(), &data));
        assert_eq!(cache.stats().reorders, 0);
    }

    #[test]
    fn uncached_reorder_follows_the_shape() {
        let cache = cache();
        let operator = OperatorKey::new("x", "w", None);

        for len in [2, 3] {
            let user = MemoryDesc::new(vec![len], DataType::F32, Format::X).unwrap();
            let target = MemoryDesc::new(vec![len], DataType::S8, Format::X).unwrap();

            let memory = cache
                .reorder_uncached(ReorderRequest::new(
                    &operator,
                    StreamId::SHARED,
                    Slot::Source,
                    user,
                    &target,
                    Arc::new(Buffer::F32(vec![1.0; len as usize])),
                    false,
                    ReorderAttr::default(),
                ))
                .unwrap();

            assert_eq!(memory.desc(), &target);
            assert_eq!(memory.data().to_f32(), vec![1.0; len as usize]);
        }

        assert!(cache.is_empty());
        assert_eq!(cache.stats().reorders, 2);
    }
}
