//! Confirmation buffering and depth-gated promotion.

mod common;

use std::sync::Arc;

use alloy::primitives::Address;
use chain_events::{
    AutoEventsEmitter, Channel, EmitterEvent, LifecycleState,
    producer::PushBlockProducer,
    storage::{EventRepository, MemoryStorage},
};

use crate::common::{
    MockChain, assert_drained, build_emitter, collect, expect_event, wait_until,
};

#[tokio::test]
async fn events_below_depth_are_buffered_then_promoted() -> anyhow::Result<()> {
    let contract = Address::repeat_byte(0xBA);
    let chain = MockChain::new(397);
    let storage = Arc::new(MemoryStorage::new());
    let emitter = build_emitter(&chain, &storage, contract, |b| {
        b.starting_block(395u64).confirmations(6)
    });

    let (_events_sub, mut events) = collect(&emitter, Channel::NewEvent);
    let (_confirmations_sub, mut confirmations) = collect(&emitter, Channel::NewConfirmation);
    let (_init_sub, mut init) = collect(&emitter, Channel::InitFinished);

    let producer = Arc::new(PushBlockProducer::new());
    let auto = AutoEventsEmitter::new(emitter, producer.clone());
    auto.start().await;
    assert!(matches!(expect_event(&mut init).await, EmitterEvent::InitFinished));

    // a log lands at depth 2: buffered, announced, but not delivered
    chain.advance_to(400);
    let log = chain.add_log(contract, 398, "L", 0, "Transfer");
    producer.push(chain.head_ref());

    match expect_event(&mut confirmations).await {
        EmitterEvent::NewConfirmation(progress) => {
            assert_eq!(progress.confirmations, 2);
            assert_eq!(progress.target_confirmation, 6);
            assert_eq!(progress.event, log);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_drained(&mut events).await;
    assert_eq!(storage.find_all(contract).await?.len(), 1);

    // the head reaches the target depth: final confirmation, then delivery
    chain.advance_to(404);
    producer.push(chain.head_ref());

    match expect_event(&mut confirmations).await {
        EmitterEvent::NewConfirmation(progress) => assert_eq!(progress.confirmations, 6),
        other => panic!("unexpected event: {other:?}"),
    }
    match expect_event(&mut events).await {
        EmitterEvent::NewEvent(emitted) => assert_eq!(emitted, log),
        other => panic!("unexpected event: {other:?}"),
    }

    wait_until(|| async { storage.find_all(contract).await.unwrap().is_empty() }).await;
    assert_eq!(
        auto.emitter().tracker().last_processed().await?,
        Some(chain.block_ref(398))
    );

    Ok(())
}

#[tokio::test]
async fn every_buffered_event_resolves_within_target_depth() -> anyhow::Result<()> {
    let contract = Address::repeat_byte(0xBB);
    let target = 3u64;
    let chain = MockChain::new(100);
    let storage = Arc::new(MemoryStorage::new());
    let emitter = build_emitter(&chain, &storage, contract, |b| {
        b.starting_block(100u64).confirmations(target)
    });

    let (_events_sub, mut events) = collect(&emitter, Channel::NewEvent);

    let producer = Arc::new(PushBlockProducer::new());
    let auto = AutoEventsEmitter::new(emitter, producer.clone());
    auto.start().await;
    wait_until(|| async { auto.state() == LifecycleState::Running }).await;

    chain.advance_to(101);
    let log = chain.add_log(contract, 101, "tx", 0, "Transfer");
    producer.push(chain.head_ref());

    // advance the head one block at a time; the event must be delivered
    // within target + 1 head advances of its insertion
    for head in 102..=101 + target + 1 {
        chain.advance_to(head);
        producer.push(chain.head_ref());
    }

    match expect_event(&mut events).await {
        EmitterEvent::NewEvent(emitted) => assert_eq!(emitted, log),
        other => panic!("unexpected event: {other:?}"),
    }
    wait_until(|| async { storage.find_all(contract).await.unwrap().is_empty() }).await;

    Ok(())
}

#[tokio::test]
async fn delivery_order_is_by_block_then_log_index() -> anyhow::Result<()> {
    let contract = Address::repeat_byte(0xBC);
    let chain = MockChain::new(10);
    let storage = Arc::new(MemoryStorage::new());
    let emitter = build_emitter(&chain, &storage, contract, |b| {
        b.starting_block(0u64).confirmations(2)
    });

    let (_events_sub, mut events) = collect(&emitter, Channel::NewEvent);

    let producer = Arc::new(PushBlockProducer::new());
    let auto = AutoEventsEmitter::new(emitter, producer.clone());
    auto.start().await;
    wait_until(|| async { auto.state() == LifecycleState::Running }).await;

    // direct-path events (deep enough) and buffered events (near the head)
    chain.advance_to(20);
    chain.add_log(contract, 12, "a", 1, "Transfer");
    chain.add_log(contract, 12, "b", 0, "Transfer");
    chain.add_log(contract, 15, "c", 0, "Transfer");
    chain.add_log(contract, 19, "d", 0, "Transfer");
    chain.add_log(contract, 20, "e", 2, "Transfer");
    producer.push(chain.head_ref());

    chain.advance_to(22);
    producer.push(chain.head_ref());

    let mut delivered = Vec::new();
    while delivered.len() < 5 {
        if let EmitterEvent::NewEvent(record) = expect_event(&mut events).await {
            delivered.push((record.block_number, record.log_index));
        }
    }

    let mut sorted = delivered.clone();
    sorted.sort_unstable();
    assert_eq!(delivered, sorted, "events arrived out of order: {delivered:?}");

    Ok(())
}
