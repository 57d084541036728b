//! Topic semantics across independent handles: latest-wins delivery and
//! the bounded pending count.

mod common;

use common::unique_name;
use ocm_core::{DesiredGroupData, NamedSemaphore, OcmResult, SharedMemoryTopic, TopicMessage};

#[derive(Debug, PartialEq)]
struct Reading(f64);

impl TopicMessage for Reading {
    fn encode(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> OcmResult<Self> {
        Ok(Reading(f64::from_le_bytes(bytes.try_into().map_err(
            |_| ocm_core::OcmError::Serialization("expected 8 bytes".into()),
        )?)))
    }
}

#[test]
fn subscriber_sees_only_the_newest_payload() {
    // S6: three publishes with no subscriber in between; the subscriber
    // gets p3 and the pending count drains to zero.
    let topic = unique_name("s6_topic");
    let buffer = unique_name("s6_buffer");
    let mut publisher = SharedMemoryTopic::new();
    let mut subscriber = SharedMemoryTopic::new();

    for value in [1.0, 2.0, 3.0] {
        publisher.publish(&topic, &buffer, &Reading(value)).unwrap();
    }

    let mut seen = None;
    assert!(subscriber
        .subscribe_no_wait(&topic, &buffer, |msg: Reading| seen = Some(msg))
        .unwrap());
    assert_eq!(seen, Some(Reading(3.0)));

    assert!(!subscriber
        .subscribe_no_wait(&topic, &buffer, |_: Reading| panic!("queue must be drained"))
        .unwrap());
}

#[test]
fn pending_count_never_exceeds_one() {
    // The publisher's post-if-zero keeps the ready count at <= 1 no
    // matter how many publishes go unobserved.
    let topic = unique_name("bound_topic");
    let buffer = unique_name("bound_buffer");
    let mut publisher = SharedMemoryTopic::new();

    for value in 0..20 {
        publisher
            .publish(&topic, &buffer, &Reading(f64::from(value)))
            .unwrap();
    }

    let sem = NamedSemaphore::open(&topic, 0).unwrap();
    assert_eq!(sem.value().unwrap(), 1);
    drop(sem);
}

#[test]
fn desired_group_crosses_handles_intact() {
    // The orchestrator's command message, via the same path an external
    // controller uses.
    let topic = unique_name("cmd_topic");
    let mut controller = SharedMemoryTopic::new();
    let mut orchestrator = SharedMemoryTopic::new();

    controller
        .publish(&topic, &topic, &DesiredGroupData::new("pdstand"))
        .unwrap();

    let mut seen = None;
    assert!(orchestrator
        .subscribe_no_wait(&topic, &topic, |msg: DesiredGroupData| seen = Some(msg))
        .unwrap());
    assert_eq!(seen, Some(DesiredGroupData::new("pdstand")));
}

#[test]
fn blocking_subscribe_delivers_across_threads() {
    let topic = unique_name("block_topic");
    let buffer = unique_name("block_buffer");

    let consumer = {
        let topic = topic.clone();
        let buffer = buffer.clone();
        std::thread::spawn(move || {
            let mut subscriber = SharedMemoryTopic::new();
            let mut seen = None;
            subscriber
                .subscribe(&topic, &buffer, |msg: Reading| seen = Some(msg))
                .unwrap();
            seen
        })
    };

    std::thread::sleep(std::time::Duration::from_millis(20));
    let mut publisher = SharedMemoryTopic::new();
    publisher.publish(&topic, &buffer, &Reading(0.5)).unwrap();

    assert_eq!(consumer.join().unwrap(), Some(Reading(0.5)));
}

#[test]
fn subscribe_timeout_gives_up_quietly() {
    let topic = unique_name("timeout_topic");
    let buffer = unique_name("timeout_buffer");
    let mut node = SharedMemoryTopic::new();

    let start = std::time::Instant::now();
    let delivered = node
        .subscribe_timeout(&topic, &buffer, 40, |_: Reading| panic!("nothing was published"))
        .unwrap();
    assert!(!delivered);
    assert!(start.elapsed().as_millis() >= 30);
}
