//! Per-connection relay state machine.
//!
//! ```text
//! AwaitingRequest -> Dispatching -> AwaitingUpstreamResponse -> RespondingToClient
//!        ^               |                                            |
//!        +---- hit ------+--------------------------------------------+
//!        |
//!        +-- empty read / error --> Closed
//! ```
//!
//! A cache hit writes the stored bytes and goes straight back to
//! `AwaitingRequest` without touching the upstream or refreshing the entry.
//! A miss forwards the original request bytes unmodified and treats whatever
//! the framer assembles from the upstream as the complete response.

use crate::cache::ResponseCache;
use crate::config::CacheWritePolicy;
use crate::error::ProxyError;
use crate::framer::receive_message;
use crate::request::RequestView;
use bytes::Bytes;
use std::io::{Read, Write};
use tracing::{debug, trace};

/// Cache gating shared by every session.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Paths starting with this participate in the cache. Empty matches all.
    pub prefix: String,
    pub write: CacheWritePolicy,
}

impl CachePolicy {
    pub fn new(prefix: impl Into<String>, write: CacheWritePolicy) -> Self {
        Self {
            prefix: prefix.into(),
            write,
        }
    }

    pub fn is_cacheable(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    fn should_store(&self, path: &str) -> bool {
        match self.write {
            CacheWritePolicy::Prefix => self.is_cacheable(path),
            CacheWritePolicy::Always => true,
        }
    }
}

/// Counters for one client session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests: u64,
    pub cache_hits: u64,
    pub forwarded: u64,
}

/// Relay state, carrying whatever the next step needs.
#[derive(Debug)]
pub enum RelayState {
    AwaitingRequest,
    Dispatching { raw: Bytes, path: String },
    AwaitingUpstreamResponse { path: String },
    RespondingToClient { path: String, response: Bytes },
    Closed,
}

/// Drives one client connection against the shared upstream and cache.
pub struct Relay<'a, C, U> {
    client: &'a mut C,
    upstream: &'a mut U,
    cache: &'a mut ResponseCache,
    policy: &'a CachePolicy,
    summary: SessionSummary,
}

impl<'a, C, U> Relay<'a, C, U>
where
    C: Read + Write,
    U: Read + Write,
{
    pub fn new(
        client: &'a mut C,
        upstream: &'a mut U,
        cache: &'a mut ResponseCache,
        policy: &'a CachePolicy,
    ) -> Self {
        Self {
            client,
            upstream,
            cache,
            policy,
            summary: SessionSummary::default(),
        }
    }

    /// Serve requests until the client closes.
    ///
    /// Errors end the session; the caller closes the client connection.
    pub fn run(mut self) -> Result<SessionSummary, ProxyError> {
        let mut state = RelayState::AwaitingRequest;
        loop {
            state = self.step(state)?;
            if let RelayState::Closed = state {
                return Ok(self.summary);
            }
        }
    }

    /// Advance the state machine by one transition.
    pub fn step(&mut self, state: RelayState) -> Result<RelayState, ProxyError> {
        match state {
            RelayState::AwaitingRequest => self.await_request(),
            RelayState::Dispatching { raw, path } => self.dispatch(raw, path),
            RelayState::AwaitingUpstreamResponse { path } => self.await_upstream(path),
            RelayState::RespondingToClient { path, response } => self.respond(path, response),
            RelayState::Closed => Ok(RelayState::Closed),
        }
    }

    fn await_request(&mut self) -> Result<RelayState, ProxyError> {
        let raw = receive_message(&mut *self.client).map_err(ProxyError::client)?;
        if raw.is_empty() {
            trace!("Client closed connection");
            return Ok(RelayState::Closed);
        }

        let request = RequestView::parse(&raw)?;
        self.summary.requests += 1;
        debug!(
            method = %request.method,
            target = %request.target,
            host = request.header("host").unwrap_or("-"),
            bytes = raw.len(),
            "Request received"
        );

        Ok(RelayState::Dispatching {
            raw: raw.freeze(),
            path: request.path,
        })
    }

    fn dispatch(&mut self, raw: Bytes, path: String) -> Result<RelayState, ProxyError> {
        if self.policy.is_cacheable(&path) {
            if let Some(cached) = self.cache.get(&path) {
                debug!(path = %path, bytes = cached.len(), "Serving from cache");
                self.write_client(&cached)?;
                self.summary.cache_hits += 1;
                return Ok(RelayState::AwaitingRequest);
            }
        }

        self.upstream
            .write_all(&raw)
            .and_then(|_| self.upstream.flush())
            .map_err(ProxyError::upstream)?;
        self.summary.forwarded += 1;
        trace!(path = %path, bytes = raw.len(), "Forwarded to upstream");

        Ok(RelayState::AwaitingUpstreamResponse { path })
    }

    fn await_upstream(&mut self, path: String) -> Result<RelayState, ProxyError> {
        let response = receive_message(&mut *self.upstream).map_err(ProxyError::upstream)?;
        if response.is_empty() {
            return Err(ProxyError::UpstreamClosed);
        }
        trace!(path = %path, bytes = response.len(), "Upstream responded");

        Ok(RelayState::RespondingToClient {
            path,
            response: response.freeze(),
        })
    }

    fn respond(&mut self, path: String, response: Bytes) -> Result<RelayState, ProxyError> {
        self.write_client(&response)?;

        if self.policy.should_store(&path) {
            let replaced = self.cache.put(&path, response);
            debug!(path = %path, replaced, "Response cached");
        }

        Ok(RelayState::AwaitingRequest)
    }

    fn write_client(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        self.client
            .write_all(bytes)
            .and_then(|_| self.client.flush())
            .map_err(ProxyError::client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Peer;
    use crate::framer::CHUNK_SIZE;
    use std::collections::VecDeque;
    use std::io;

    const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length:2\r\n\r\nOK";

    /// Client double: each queued message is delivered by separate reads,
    /// then reads return 0 (closed). Everything written is captured.
    #[derive(Default)]
    struct MockClient {
        incoming: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        fail_writes: bool,
    }

    impl MockClient {
        fn sending(messages: &[&[u8]]) -> Self {
            Self {
                incoming: messages.iter().map(|m| m.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl Read for MockClient {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(mut next) = self.incoming.pop_front() else {
                return Ok(0);
            };
            let n = next.len().min(buf.len());
            buf[..n].copy_from_slice(&next[..n]);
            if n < next.len() {
                self.incoming.push_front(next.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for MockClient {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Upstream double: answers each forwarded request with the next
    /// scripted response (repeating the last one) and records requests.
    #[derive(Default)]
    struct StubUpstream {
        responses: VecDeque<Vec<u8>>,
        last: Vec<u8>,
        pending: VecDeque<u8>,
        requests: Vec<Vec<u8>>,
        forbid: bool,
    }

    impl StubUpstream {
        fn answering(responses: &[&[u8]]) -> Self {
            Self {
                responses: responses.iter().map(|r| r.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl Read for StubUpstream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.pending.len().min(buf.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for StubUpstream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            assert!(!self.forbid, "upstream contacted after warm-up");
            self.requests.push(buf.to_vec());
            if let Some(next) = self.responses.pop_front() {
                self.last = next;
            }
            self.pending.extend(self.last.iter().copied());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_session(
        client: &mut MockClient,
        upstream: &mut StubUpstream,
        cache: &mut ResponseCache,
        policy: &CachePolicy,
    ) -> Result<SessionSummary, ProxyError> {
        Relay::new(client, upstream, cache, policy).run()
    }

    #[test]
    fn test_cache_hit_skips_upstream() {
        let req: &[u8] = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let policy = CachePolicy::new("/a", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[OK_RESPONSE]);

        // Warm-up
        let mut client = MockClient::sending(&[req]);
        run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(client.written, OK_RESPONSE);
        assert_eq!(upstream.requests, vec![req.to_vec()]);
        assert_eq!(cache.get("/a").as_deref(), Some(OK_RESPONSE));

        // Any further upstream use fails the test.
        upstream.forbid = true;
        let mut client = MockClient::sending(&[req, req, req]);
        let summary = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(client.written, OK_RESPONSE.repeat(3));
        assert_eq!(
            summary,
            SessionSummary {
                requests: 3,
                cache_hits: 3,
                forwarded: 0
            }
        );
    }

    #[test]
    fn test_hit_does_not_refresh_entry() {
        let req: &[u8] = b"GET /a HTTP/1.1\r\n\r\n";
        let policy = CachePolicy::new("/a", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[b"first", b"second"]);

        let mut client = MockClient::sending(&[req, req]);
        run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(client.written, b"firstfirst");
        assert_eq!(upstream.requests.len(), 1);
        assert_eq!(cache.get("/a").as_deref(), Some(&b"first"[..]));
    }

    #[test]
    fn test_paths_outside_prefix_always_forwarded() {
        let req: &[u8] = b"GET /b HTTP/1.1\r\n\r\n";
        let policy = CachePolicy::new("/a", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[OK_RESPONSE]);

        let mut client = MockClient::sending(&[req, req, req]);
        let summary = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(summary.forwarded, 3);
        assert_eq!(summary.cache_hits, 0);
        assert_eq!(upstream.requests.len(), 3);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits + cache.stats().misses, 0);
    }

    #[test]
    fn test_always_policy_stores_but_never_serves_unprefixed() {
        let req: &[u8] = b"GET /b HTTP/1.1\r\n\r\n";
        let policy = CachePolicy::new("/a", CacheWritePolicy::Always);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[b"one", b"two"]);

        let mut client = MockClient::sending(&[req, req]);
        run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(client.written, b"onetwo");
        assert_eq!(upstream.requests.len(), 2);
        assert!(cache.contains("/b"));
        assert_eq!(cache.get("/b").as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn test_last_write_wins() {
        let req: &[u8] = b"GET /b HTTP/1.1\r\n\r\n";
        let policy = CachePolicy::new("/a", CacheWritePolicy::Always);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[b"v1", b"v2"]);

        let mut client = MockClient::sending(&[req, req]);
        run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().stores, 2);
        assert_eq!(cache.get("/b").as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn test_empty_prefix_caches_everything() {
        let policy = CachePolicy::new("", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[OK_RESPONSE]);

        let mut client = MockClient::sending(&[
            b"GET /x HTTP/1.1\r\n\r\n",
            b"GET /y HTTP/1.1\r\n\r\n",
            b"GET /x HTTP/1.1\r\n\r\n",
        ]);
        let summary = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(summary.forwarded, 2);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_request_bytes_forwarded_unmodified() {
        let req: &[u8] =
            b"GET http://origin/a?q=1 HTTP/1.1\r\nHost: origin\r\nX-Odd:  spaced \r\n\r\n";
        assert!(req.len() > CHUNK_SIZE);
        let policy = CachePolicy::new("/a", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[OK_RESPONSE]);

        let mut client = MockClient::sending(&[req]);
        run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(upstream.requests, vec![req.to_vec()]);
        assert!(cache.contains("/a"));
    }

    #[test]
    fn test_unusual_targets_are_relayed() {
        let policy = CachePolicy::new("", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[OK_RESPONSE]);

        let mut client = MockClient::sending(&[
            b"CONNECT example.com:443 HTTP/1.1\r\n\r\n",
            b"GET /%FF HTTP/1.1\r\n\r\n",
        ]);
        let summary = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.forwarded, 2);
        assert_eq!(client.written, OK_RESPONSE.repeat(2));
        assert!(cache.contains(""));
        assert!(cache.contains("/%FF"));
    }

    #[test]
    fn test_immediate_close() {
        let policy = CachePolicy::new("/a", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::default();
        upstream.forbid = true;

        let mut client = MockClient::default();
        let summary = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap();
        assert_eq!(summary, SessionSummary::default());
        assert!(client.written.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_malformed_request_ends_session() {
        let policy = CachePolicy::new("", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::default();
        upstream.forbid = true;

        let mut client = MockClient::sending(&[b"\x16\x03\x01 hello\r\n\r\n"]);
        let err = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
        assert!(!err.breaks_upstream());
    }

    #[test]
    fn test_upstream_close_is_error() {
        let policy = CachePolicy::new("", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[b""]);

        let mut client = MockClient::sending(&[b"GET /a HTTP/1.1\r\n\r\n"]);
        let err = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamClosed));
        assert!(err.breaks_upstream());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_client_write_failure() {
        let policy = CachePolicy::new("", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[OK_RESPONSE]);

        let mut client = MockClient::sending(&[b"GET /a HTTP/1.1\r\n\r\n"]);
        client.fail_writes = true;
        let err = run_session(&mut client, &mut upstream, &mut cache, &policy).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Io {
                peer: Peer::Client,
                ..
            }
        ));
        // Response is stored only after it reached the client.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_step_transitions() {
        let policy = CachePolicy::new("/a", CacheWritePolicy::Prefix);
        let mut cache = ResponseCache::new();
        let mut upstream = StubUpstream::answering(&[OK_RESPONSE]);
        let mut client = MockClient::sending(&[b"GET /a HTTP/1.1\r\n\r\n"]);
        let mut relay = Relay::new(&mut client, &mut upstream, &mut cache, &policy);

        let state = relay.step(RelayState::AwaitingRequest).unwrap();
        assert!(matches!(state, RelayState::Dispatching { ref path, .. } if path == "/a"));
        let state = relay.step(state).unwrap();
        assert!(matches!(state, RelayState::AwaitingUpstreamResponse { .. }));
        let state = relay.step(state).unwrap();
        assert!(matches!(
            state,
            RelayState::RespondingToClient { ref response, .. } if response == OK_RESPONSE
        ));
        let state = relay.step(state).unwrap();
        assert!(matches!(state, RelayState::AwaitingRequest));
        let state = relay.step(state).unwrap();
        assert!(matches!(state, RelayState::Closed));
    }
}
