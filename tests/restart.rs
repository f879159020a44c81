//! Lifecycle, restart idempotence, and failure recovery.

mod common;

use std::sync::Arc;

use alloy::primitives::Address;
use chain_events::{
    AutoEventsEmitter, Channel, EmitterError, EmitterEvent, LifecycleState,
    producer::PushBlockProducer, storage::MemoryStorage,
};

use crate::common::{
    MockChain, assert_drained, build_emitter, collect, expect_event, wait_until,
};

#[tokio::test]
async fn restart_resumes_without_duplicates_or_gaps() -> anyhow::Result<()> {
    let contract = Address::repeat_byte(0xDA);
    let chain = MockChain::new(120);
    let first_log = chain.add_log(contract, 110, "t1", 0, "Transfer");
    let storage = Arc::new(MemoryStorage::new());

    // first run: catch up from 100, deliver, stop
    {
        let emitter = build_emitter(&chain, &storage, contract, |b| b.starting_block(100u64));
        let (_sub, mut events) = collect(&emitter, Channel::NewEvent);

        let auto = AutoEventsEmitter::new(emitter, Arc::new(PushBlockProducer::new()));
        auto.start().await;

        match expect_event(&mut events).await {
            EmitterEvent::NewEvent(emitted) => assert_eq!(emitted, first_log),
            other => panic!("unexpected event: {other:?}"),
        }

        auto.stop();
        wait_until(|| async { auto.state() == LifecycleState::Stopped }).await;
    }

    // the chain advances while nobody is watching
    chain.advance_to(125);
    let second_log = chain.add_log(contract, 122, "t2", 0, "Transfer");

    // second run over the same storage: no duplicate of the first log, no
    // missed second log
    let emitter = build_emitter(&chain, &storage, contract, |b| b.starting_block(100u64));
    let (_sub, mut events) = collect(&emitter, Channel::NewEvent);

    let producer = Arc::new(PushBlockProducer::new());
    let auto = AutoEventsEmitter::new(emitter, producer.clone());
    auto.start().await;
    producer.push(chain.head_ref());

    match expect_event(&mut events).await {
        EmitterEvent::NewEvent(emitted) => assert_eq!(emitted, second_log),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_drained(&mut events).await;
    assert_eq!(auto.emitter().tracker().last_fetched().await?, Some(chain.block_ref(125)));

    Ok(())
}

#[tokio::test]
async fn auto_start_follows_new_event_subscriptions() -> anyhow::Result<()> {
    let contract = Address::repeat_byte(0xDB);
    let chain = MockChain::new(50);
    let log = chain.add_log(contract, 10, "t1", 0, "Transfer");
    let storage = Arc::new(MemoryStorage::new());
    let emitter = build_emitter(&chain, &storage, contract, |b| b.auto_start(true));

    let auto = AutoEventsEmitter::new(emitter, Arc::new(PushBlockProducer::new()));
    assert_eq!(auto.state(), LifecycleState::Created);

    // the first newEvent subscription starts the emitter
    let (sub, mut events) = collect(auto.emitter(), Channel::NewEvent);
    match expect_event(&mut events).await {
        EmitterEvent::NewEvent(emitted) => assert_eq!(emitted, log),
        other => panic!("unexpected event: {other:?}"),
    }
    wait_until(|| async { auto.state() == LifecycleState::Running }).await;

    // dropping the last subscription stops it
    drop(sub);
    wait_until(|| async { auto.state() == LifecycleState::Stopped }).await;

    Ok(())
}

#[tokio::test]
async fn failed_initialization_returns_to_created() -> anyhow::Result<()> {
    let contract = Address::repeat_byte(0xDC);
    let chain = MockChain::new(50);
    let storage = Arc::new(MemoryStorage::new());
    let emitter = build_emitter(&chain, &storage, contract, |b| b);

    let (_sub, mut errors) = collect(&emitter, Channel::Error);

    let auto = AutoEventsEmitter::new(emitter, Arc::new(PushBlockProducer::new()));

    chain.set_failing(true);
    auto.start().await;

    assert_eq!(auto.state(), LifecycleState::Created);
    assert!(auto.failure_count() >= 1);
    assert!(matches!(
        expect_event(&mut errors).await,
        EmitterEvent::Error(EmitterError::Timeout)
    ));

    // the chain recovers; starting again succeeds
    chain.set_failing(false);
    auto.start().await;
    assert_eq!(auto.state(), LifecycleState::Running);

    Ok(())
}

#[tokio::test]
async fn rpc_failure_aborts_cycle_and_next_head_retries() -> anyhow::Result<()> {
    let contract = Address::repeat_byte(0xDD);
    let chain = MockChain::new(100);
    let storage = Arc::new(MemoryStorage::new());
    let emitter = build_emitter(&chain, &storage, contract, |b| b.starting_block(100u64));

    let (_events_sub, mut events) = collect(&emitter, Channel::NewEvent);
    let (_errors_sub, mut errors) = collect(&emitter, Channel::Error);

    let producer = Arc::new(PushBlockProducer::new());
    let auto = AutoEventsEmitter::new(emitter, producer.clone());
    auto.start().await;
    let failures_before = auto.failure_count();

    // the head advances but the RPC is down: the cycle aborts, cursors
    // stay put
    chain.advance_to(105);
    let log = chain.add_log(contract, 103, "t1", 0, "Transfer");
    chain.set_failing(true);
    producer.push(chain.head_ref());

    assert!(matches!(expect_event(&mut errors).await, EmitterEvent::Error(_)));
    wait_until(|| async { auto.failure_count() > failures_before }).await;
    assert_eq!(auto.emitter().tracker().last_fetched().await?, Some(chain.block_ref(100)));
    assert_drained(&mut events).await;

    // the RPC recovers; the next head re-fetches the missed range
    chain.set_failing(false);
    chain.advance_to(106);
    producer.push(chain.head_ref());

    match expect_event(&mut events).await {
        EmitterEvent::NewEvent(emitted) => assert_eq!(emitted, log),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(auto.emitter().tracker().last_fetched().await?, Some(chain.block_ref(106)));

    Ok(())
}
