// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! The request/response rendezvous queue (spec §4.2): extends `base_queue`
//! with an offer-and-wait operation backed by a paired ephemeral response
//! node, consumer-side reply delivery, and the bookkeeping a host needs to
//! drain in-flight exchanges before shutting its session down.

mod config;
mod error;
mod latch;
mod pending;

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use coord_client::{suffix_of, CoordinationClient, CreateMode, REQUEST_PREFIX, RESPONSE_PREFIX};
use tracing::debug;

pub use config::RrqConfig;
pub use error::{Error, Result};

use base_queue::{BaseQueue, CancelToken, QueueHandle};
use latch::{AwaitOutcome, EventLatch};
use pending::PendingResponses;

/// The outcome of `offerAndWait`: either a real reply or, on timeout, an
/// empty one (spec §7 "Timeout on offerAndWait" is explicit that this is
/// not an error).
#[derive(Clone, Debug)]
pub struct RendezvousEvent {
    /// The response node's full path.
    pub id: String,
    /// The reply bytes, or empty if none arrived before the deadline.
    pub bytes: Vec<u8>,
    /// The watch event that woke the wait, if any.
    pub watched_event: coord_client::WatchedEvent,
}

/// A [`BaseQueue`] extended with the offer-and-wait rendezvous protocol.
pub struct RrqQueue<C: CoordinationClient> {
    queue: BaseQueue<C>,
    config: RrqConfig,
    pending: std::sync::Arc<PendingResponses>,
}

impl<C> RrqQueue<C>
where
    C: CoordinationClient + 'static,
    C::Watch: 'static,
{
    pub fn new(queue: BaseQueue<C>, config: RrqConfig) -> Self {
        Self {
            queue,
            config,
            pending: PendingResponses::new(),
        }
    }

    /// The plain FIFO queue this rendezvous protocol is layered over.
    pub fn queue(&self) -> &BaseQueue<C> {
        &self.queue
    }

    /// Publish `payload` and wait up to `timeout` (`None` for indefinitely)
    /// for a consumer's reply (spec §4.2 "Offer-and-wait"). `cancel` lets
    /// another thread abort the wait early (spec §5 "Cancellation /
    /// timeouts"); pass `&CancelToken::new()` if nothing will ever cancel
    /// this call.
    ///
    /// The response node is created, and its watch installed, strictly
    /// before the request node: a fast consumer could otherwise observe
    /// and answer the request before the submitter is listening.
    #[tracing::instrument(level = "debug", skip(self, payload, cancel), err)]
    pub fn offer_and_wait(
        &self,
        payload: &[u8],
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<RendezvousEvent> {
        let directory = self.queue.directory();
        let client = self.queue.client();

        let response_prefix = format!("{}/{}", directory, RESPONSE_PREFIX);
        let response_path = client.create(&response_prefix, &[], CreateMode::EphemeralSequential)?;
        let short_response = response_path
            .rsplit('/')
            .next()
            .expect("create() always returns a non-empty path");
        let suffix = suffix_of(short_response)
            .expect("just created with the response prefix")
            .to_string();

        let (initial_data, watch) = client.get_data(&response_path, true)?;

        let request_path = format!("{}/{}{}", directory, REQUEST_PREFIX, suffix);
        client.create(&request_path, payload, CreateMode::Persistent)?;

        let _guard = PendingResponses::enter(&self.pending);

        let (bytes, watched_event) = if !initial_data.is_empty() {
            (initial_data, coord_client::WatchedEvent::none())
        } else {
            let latch = EventLatch::new();
            if let Some(w) = watch {
                EventLatch::spawn_driver(&latch, w);
            }
            let deadline = timeout.map(|t| Instant::now() + t);
            let event = match latch.await_event(deadline, cancel, base_queue::DEFAULT_BOUNDED_WAIT_SLICE) {
                AwaitOutcome::Fired(event) => event,
                AwaitOutcome::TimedOut => coord_client::WatchedEvent::none(),
                // The request node is left in place for a later consumer,
                // same as a timeout; only the submitter's own wait aborts.
                AwaitOutcome::Cancelled => return Err(Error::Cancelled),
            };
            let data = match client.get_data(&response_path, false) {
                Ok((data, _)) => data,
                Err(coord_client::Error::NoNode(_)) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            (data, event)
        };

        // The record is built before the delete below: the delete can race
        // a trailing watch firing with a NodeDeleted event that would
        // otherwise overwrite it (spec §4.2 step 6).
        let outcome = RendezvousEvent {
            id: response_path.clone(),
            bytes,
            watched_event,
        };

        match client.delete(&response_path) {
            Ok(()) | Err(coord_client::Error::NoNode(_)) => {},
            Err(e) => return Err(e.into()),
        }

        Ok(outcome)
    }

    /// Deliver `reply` onto the response node paired with `request_id`
    /// (a path of the form `D/qn-<S>`), then remove the request node
    /// (spec §4.2 "Consumer-side removal"). Both steps tolerate the node
    /// already being gone.
    #[tracing::instrument(level = "debug", skip(self, reply), err)]
    pub fn remove_with_response(&self, request_id: &str, reply: &[u8]) -> Result<()> {
        let directory = self.queue.directory();
        let short_request = request_id
            .rsplit('/')
            .next()
            .ok_or_else(|| Error::NotARequestId(request_id.to_string()))?;
        let suffix = suffix_of(short_request).ok_or_else(|| Error::NotARequestId(request_id.to_string()))?;
        let response_path = format!("{}/{}{}", directory, RESPONSE_PREFIX, suffix);

        let client = self.queue.client();
        match client.set_data(&response_path, reply) {
            Ok(()) | Err(coord_client::Error::NoNode(_)) => {},
            Err(e) => return Err(e.into()),
        }
        match client.delete(request_id) {
            Ok(()) | Err(coord_client::Error::NoNode(_)) => {},
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Block until every in-flight `offerAndWait` call has decremented the
    /// pending-responses counter (spec §4.2 "Drain-on-shutdown").
    pub fn await_pending_responses(&self) {
        self.pending.await_drained(self.config.drain_poll_interval);
    }

    /// True iff some live request node's payload decodes as a JSON object
    /// with `key == id`. Always hits the coordination service directly,
    /// bypassing the local cache (spec §4.2 "Async-id scan").
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn contains_request_with_id(&self, key: &str, id: &str) -> Result<bool> {
        let directory = self.queue.directory();
        let client = self.queue.client();
        let (names, _) = client.get_children(directory, false)?;
        for name in names {
            if !name.starts_with(REQUEST_PREFIX) {
                continue;
            }
            let path = format!("{}/{}", directory, name);
            let data = match client.get_data(&path, false) {
                Ok((data, _)) => data,
                Err(coord_client::Error::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let envelope = match serde_json::from_slice::<HashMap<String, String>>(&data) {
                Ok(envelope) => envelope,
                Err(_) => continue,
            };
            if envelope.get(key).map(String::as_str) == Some(id) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The full path of the lexically-largest live request node, probing
    /// downward past names that have since vanished (spec §4.2 "Tail
    /// probe").
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn tail_id(&self) -> Result<Option<String>> {
        let directory = self.queue.directory();
        let client = self.queue.client();
        let snapshot = self.queue.snapshot();
        for name in snapshot.known.iter().rev() {
            let path = format!("{}/{}", directory, name);
            match client.get_data(&path, false) {
                Ok(_) => return Ok(Some(path)),
                Err(coord_client::Error::NoNode(_)) => {
                    debug!(%path, "tailId skipped a vanished node");
                    continue;
                },
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use assert_matches::assert_matches;
    use base_queue::{QueueConfig, QueueHandle, Wait};
    use coord_client::mem::MemClient;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Surface `debug!` output on stderr for the round-trip and timeout
    /// tests; harmless to call more than once.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn new_rrq(directory: &str) -> RrqQueue<MemClient> {
        let client = MemClient::new();
        client
            .create(directory, &[], coord_client::CreateMode::Persistent)
            .ok();
        let config = QueueConfig::new(directory);
        let metrics = Arc::new(queue_metrics::QueueMetrics::new().unwrap());
        let queue = BaseQueue::new(client, config, metrics).unwrap();
        RrqQueue::new(queue, RrqConfig::new())
    }

    #[test]
    fn round_trip_reply_reaches_the_submitter() {
        init_tracing();
        let rrq = Arc::new(new_rrq("/rrq"));

        let consumer = Arc::clone(&rrq);
        let consumer_thread = thread::spawn(move || {
            // Poll until the request node shows up; a real deployment would
            // block in peekElements but the in-memory fixture's watch fires
            // fast enough that a short retry loop is simpler to reason about
            // here.
            for _ in 0..200 {
                let found = consumer
                    .queue()
                    .peek_elements(1, Wait::Immediate, &base_queue::CancelToken::new(), |name| name.starts_with("qn-"))
                    .unwrap();
                if let Some((name, _payload)) = found.into_iter().next() {
                    let id = format!("{}/{}", consumer.queue().directory(), name);
                    consumer.remove_with_response(&id, b"pong").unwrap();
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            panic!("consumer never observed the request");
        });

        let event = rrq
            .offer_and_wait(b"ping", Some(Duration::from_secs(5)), &base_queue::CancelToken::new())
            .unwrap();
        consumer_thread.join().unwrap();
        assert_eq!(event.bytes, b"pong".to_vec());
    }

    #[test]
    fn timeout_with_no_consumer_leaves_the_request_for_later() {
        let rrq = new_rrq("/rrq");
        let event = rrq
            .offer_and_wait(b"x", Some(Duration::from_millis(100)), &base_queue::CancelToken::new())
            .unwrap();
        assert!(event.bytes.is_empty());

        // The request node must still be there for a later consumer.
        let found = rrq
            .queue()
            .peek_elements(10, Wait::Immediate, &base_queue::CancelToken::new(), |name| name.starts_with("qn-"))
            .unwrap();
        assert_eq!(found.len(), 1);
        let (name, payload) = &found[0];
        assert_eq!(payload, b"x");

        let id = format!("{}/{}", rrq.queue().directory(), name);
        rrq.remove_with_response(&id, b"late").unwrap();
    }

    #[test]
    fn contains_request_with_id_scans_live_payloads() {
        let rrq = new_rrq("/rrq");
        rrq.queue()
            .offer(br#"{"rid":"42"}"#)
            .unwrap();

        assert!(rrq.contains_request_with_id("rid", "42").unwrap());
        assert!(!rrq.contains_request_with_id("rid", "7").unwrap());
    }

    #[test]
    fn tail_id_is_the_largest_live_request() {
        let rrq = new_rrq("/rrq");
        rrq.queue().offer(b"one").unwrap();
        let two = rrq.queue().offer(b"two").unwrap();

        let tail = rrq.tail_id().unwrap().unwrap();
        assert_eq!(tail, two);
    }

    #[test]
    fn await_pending_responses_returns_once_drained() {
        let rrq = Arc::new(new_rrq("/rrq"));
        let consumer = Arc::clone(&rrq);
        let consumer_thread = thread::spawn(move || {
            for _ in 0..200 {
                let found = consumer
                    .queue()
                    .peek_elements(1, Wait::Immediate, &base_queue::CancelToken::new(), |name| name.starts_with("qn-"))
                    .unwrap();
                if let Some((name, _)) = found.into_iter().next() {
                    let id = format!("{}/{}", consumer.queue().directory(), name);
                    consumer.remove_with_response(&id, b"ack").unwrap();
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });

        rrq.offer_and_wait(b"hello", Some(Duration::from_secs(5)), &base_queue::CancelToken::new())
            .unwrap();
        consumer_thread.join().unwrap();
        rrq.await_pending_responses();
    }

    #[test]
    fn offer_and_wait_aborts_promptly_once_cancelled() {
        let rrq = new_rrq("/rrq");
        let cancel = base_queue::CancelToken::new();
        cancel.cancel();

        assert_matches!(
            rrq.offer_and_wait(b"x", Some(Duration::from_secs(5)), &cancel),
            Err(Error::Cancelled)
        );

        // The request survives cancellation, same as a timeout.
        let found = rrq
            .queue()
            .peek_elements(10, Wait::Immediate, &base_queue::CancelToken::new(), |name| {
                name.starts_with("qn-")
            })
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn remove_with_response_tolerates_an_already_gone_request() {
        let rrq = new_rrq("/rrq");
        let path = rrq.queue().offer(b"solo").unwrap();
        rrq.queue().remove_many(&[path.rsplit('/').next().unwrap().to_string()]).unwrap();
        assert_matches!(rrq.remove_with_response(&path, b"too-late"), Ok(()));
    }

    #[test]
    fn contains_request_with_id_ignores_malformed_payloads() {
        let rrq = new_rrq("/rrq");
        rrq.queue().offer(b"not json").unwrap();
        assert!(!rrq.contains_request_with_id("rid", "anything").unwrap());
    }
}
