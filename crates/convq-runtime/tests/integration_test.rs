use std::sync::Arc;

use convq_common::stream_id::StreamId;
use convq_runtime::cache::{ArtifactKind, CacheKey, OperatorKey, ReorderRequest, ScaleTuple, Slot};
use convq_runtime::config::GlobalConfig;
use convq_runtime::memory::{Buffer, DataType, Format, MemoryDesc};
use convq_runtime::reorder::ReorderAttr;
use convq_runtime::{ExecutionContext, RuntimeError};
use pretty_assertions::assert_eq;

fn context() -> ExecutionContext {
    ExecutionContext::with_config(Arc::new(GlobalConfig::default()))
}

fn weights_descs() -> (MemoryDesc, MemoryDesc) {
    let user = MemoryDesc::new(vec![2, 1, 1, 1], DataType::F32, Format::Iohw).unwrap();
    let target = MemoryDesc::new(vec![2, 1, 1, 1], DataType::S8, Format::Oihw).unwrap();
    (user, target)
}

fn request<'a>(
    operator: &'a OperatorKey,
    stream: StreamId,
    target: &'a MemoryDesc,
    user: &MemoryDesc,
    data: Vec<f32>,
    persistent: bool,
) -> ReorderRequest<'a> {
    ReorderRequest::new(
        operator,
        stream,
        Slot::Weights,
        user.clone(),
        target,
        Arc::new(Buffer::F32(data)),
        persistent,
        ReorderAttr::new(1, vec![10.0, 100.0]),
    )
}

#[test_log::test]
fn persistent_operand_is_reordered_once() {
    let context = context();
    let operator = OperatorKey::new("x", "w", Some("b"));
    let (user, target) = weights_descs();
    let stream = context.stream();

    let first = context
        .cache()
        .get_or_reorder(request(&operator, stream, &target, &user, vec![0.5, 0.25], true))
        .unwrap();
    let second = context
        .cache()
        .get_or_reorder(request(&operator, stream, &target, &user, vec![9.0, 9.0], true))
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*second.data(), Buffer::S8(vec![5, 25]));
    assert_eq!(context.stats().reorders, 1);
    assert_eq!(context.stats().hits, 1);
}

#[test_log::test]
fn persistent_operand_rebinds_user_memory() {
    let context = context();
    let operator = OperatorKey::new("x", "w", None);
    let (user, target) = weights_descs();
    let stream = context.stream();
    let cache = context.cache();

    cache
        .get_or_reorder(request(&operator, stream, &target, &user, vec![0.5, 0.25], true))
        .unwrap();
    cache
        .get_or_reorder(request(&operator, stream, &target, &user, vec![1.0, 1.0], true))
        .unwrap();

    let user_memory = cache
        .get::<convq_runtime::memory::Memory>(&CacheKey::new(
            operator.clone(),
            stream,
            ArtifactKind::UserMemory(Slot::Weights),
        ))
        .unwrap()
        .unwrap();

    assert_eq!(*user_memory.data(), Buffer::F32(vec![1.0, 1.0]));
    assert_eq!(context.stats().reorders, 1);
}

#[test_log::test]
fn transient_operand_is_reordered_every_call() {
    let context = context();
    let operator = OperatorKey::new("x", "w", None);
    let (user, target) = weights_descs();
    let stream = context.stream();

    context
        .cache()
        .get_or_reorder(request(&operator, stream, &target, &user, vec![0.5, 0.25], false))
        .unwrap();
    let second = context
        .cache()
        .get_or_reorder(request(&operator, stream, &target, &user, vec![1.0, -1.0], false))
        .unwrap();

    assert_eq!(*second.data(), Buffer::S8(vec![10, -100]));
    assert_eq!(context.stats().reorders, 2);
}

#[test_log::test]
fn streams_get_distinct_entries() {
    let context = Arc::new(context());
    let operator = OperatorKey::new("x", "w", None);
    let (user, target) = weights_descs();

    let here = context
        .cache()
        .get_or_reorder(request(
            &operator,
            context.stream(),
            &target,
            &user,
            vec![0.5, 0.25],
            true,
        ))
        .unwrap();

    let there = {
        let context = context.clone();
        let (operator, user, target) = (operator.clone(), user.clone(), target.clone());
        std::thread::spawn(move || {
            context
                .cache()
                .get_or_reorder(request(
                    &operator,
                    context.stream(),
                    &target,
                    &user,
                    vec![1.0, 1.0],
                    true,
                ))
                .unwrap()
        })
        .join()
        .unwrap()
    };

    assert!(!Arc::ptr_eq(&here, &there));
    assert_eq!(*here.data(), Buffer::S8(vec![5, 25]));
    assert_eq!(*there.data(), Buffer::S8(vec![10, 100]));
    assert_eq!(context.stats().misses, 2);
}

#[test_log::test]
fn shared_stream_when_not_split_per_thread() {
    let mut config = GlobalConfig::default();
    config.cache.per_stream = false;
    let context = ExecutionContext::with_config(Arc::new(config));

    let here = context.stream();
    let there = std::thread::spawn(StreamId::current).join().unwrap();

    assert_eq!(here, StreamId::SHARED);
    assert_ne!(here, there);
}

#[test_log::test]
fn same_operator_same_entry() {
    let context = context();
    let key = |bias: Option<&str>| {
        CacheKey::new(
            OperatorKey::new("x", "w", bias),
            context.stream(),
            ArtifactKind::BiasScales,
        )
    };
    let compute = || Ok::<_, RuntimeError>(ScaleTuple::new(0, vec![1.0]));

    let first = context.cache().get_or_compute(key(Some("b")), compute).unwrap();
    let again = context.cache().get_or_compute(key(Some("b")), compute).unwrap();
    let other = context.cache().get_or_compute(key(None), compute).unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
}

#[test_log::test]
fn dropping_the_context_releases_artifacts() {
    let context = context();
    let operator = OperatorKey::new("x", "w", None);
    let (user, target) = weights_descs();

    let memory = context
        .cache()
        .get_or_reorder(request(
            &operator,
            context.stream(),
            &target,
            &user,
            vec![0.5, 0.25],
            true,
        ))
        .unwrap();
    assert_eq!(Arc::strong_count(&memory), 2);

    drop(context);

    assert_eq!(Arc::strong_count(&memory), 1);
}
