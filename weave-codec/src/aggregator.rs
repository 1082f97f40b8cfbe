//! Joins a `{Start, Content*, LastContent}` stream from an upstream
//! framer into one envelope carrying the concatenated content.
//!
//! The per-protocol specifics (what counts as "too large", whether to
//! answer with a "100-continue"-style interim response, how to build the
//! final envelope) are a capability interface, rather than an inheritance
//! hook a protocol subclasses.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use weave_core::error::PipelineError;
use weave_core::pipeline::context::{Context, PipelineMessage};
use weave_core::pipeline::handler::InboundHandler;
use weave_core::{AggregationError, DecoderResult};

/// One piece of the stream an upstream framer hands the aggregator.
///
/// `Content`/`LastContent` carry a [`DecoderResult`] alongside the bytes so
/// an upstream framer that gave up mid-frame (a truncated chunk trailer, a
/// malformed continuation) can say so without a separate pipeline
/// exception; [`Part::content`]/[`Part::last_content`] build the ordinary
/// `Success` case.
pub enum Part<S, C> {
    Start(S),
    Content(C, DecoderResult),
    LastContent(C, DecoderResult),
}

impl<S, C> Part<S, C> {
    pub fn content(payload: C) -> Self {
        Part::Content(payload, DecoderResult::Success)
    }

    pub fn last_content(payload: C) -> Self {
        Part::LastContent(payload, DecoderResult::Success)
    }
}

/// The policy's oversize decision: close the connection, or surface a
/// too-long-frame error to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizePolicy {
    CloseConnection,
    SurfaceError,
}

/// What a protocol (HTTP, STOMP, ...) needs to decide on the aggregator's
/// behalf. `Start` carries whatever metadata the protocol's start message
/// needs (headers, a declared content length); `Content` is always raw
/// bytes; `Aggregate` is the protocol's full-message type.
pub trait AggregationPolicy: Send {
    type Start: Send + Sync + 'static;
    type Aggregate: Send + Sync + 'static;

    /// `None` means the start message did not declare a length up front.
    fn declared_length(&self, start: &Self::Start) -> Option<usize>;

    fn begin(&mut self, start: Self::Start) -> Self::Aggregate;

    fn append(&mut self, aggregate: &mut Self::Aggregate, content: Bytes);

    fn finish(&mut self, aggregate: Self::Aggregate) -> Self::Aggregate {
        aggregate
    }

    /// If `start` already carries a decoding failure from the upstream
    /// framer, this returns the cause, and the aggregator emits a minimal
    /// aggregate with the current content and finishes immediately.
    /// Default: never failed.
    fn decode_failure(&self, _start: &Self::Start) -> Option<&'static str> {
        None
    }

    /// An interim response to write back to the peer before more content
    /// arrives (e.g. HTTP's "100-continue"). `None` (the default) means no
    /// interim response is sent for this protocol.
    fn continue_response(&self, _start: &Self::Start) -> Option<Bytes> {
        None
    }

    /// Whether the connection should be closed immediately after writing
    /// the continue response, instead of waiting for a body.
    fn close_after_continue_response(&self, _start: &Self::Start) -> bool {
        false
    }

    /// Whether content arriving after a continue response should be
    /// dropped rather than appended to the aggregate.
    fn ignore_content_after_continue_response(&self, _start: &Self::Start) -> bool {
        false
    }

    /// The oversize path policy: close the connection outright, or let
    /// the caller just surface a too-long-frame error upstream. Default
    /// matches Netty's `HttpObjectAggregator`: surface the error, don't
    /// unilaterally close.
    fn oversize_policy(&self) -> OversizePolicy {
        OversizePolicy::SurfaceError
    }
}

/// Outcome of feeding one [`Part`] to the aggregator.
pub enum AggregatorOutcome<A> {
    /// Nothing to emit yet (still accumulating). Carries an interim
    /// response to write back to the peer, if the policy wants one, and
    /// whether to close the connection right after writing it.
    Pending { continue_response: Option<(Bytes, bool)> },
    /// The aggregate completed; the full envelope follows.
    Complete(A),
}

struct InFlight<A> {
    aggregate: A,
    total: usize,
    /// Set when a continue-response policy asked for further content to
    /// be dropped instead of appended (the peer was told "go ahead" but
    /// the protocol doesn't actually want the body).
    ignoring_content: bool,
}

pub struct MessageAggregator<P: AggregationPolicy> {
    policy: P,
    max_content_length: usize,
    in_flight: Option<InFlight<P::Aggregate>>,
}

impl<P: AggregationPolicy> MessageAggregator<P> {
    pub fn new(policy: P, max_content_length: usize) -> Self {
        Self { policy, max_content_length, in_flight: None }
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    /// Drop any in-flight aggregation, e.g. on `channel_inactive`/`on_remove`.
    pub fn discard_in_flight(&mut self) {
        self.in_flight = None;
    }

    fn oversize_error(&self) -> AggregationError {
        let should_close = matches!(self.policy.oversize_policy(), OversizePolicy::CloseConnection);
        tracing::debug!(max = self.max_content_length, should_close, "aggregate exceeded max content length");
        AggregationError::TooLarge { max: self.max_content_length, should_close }
    }

    pub fn on_part(&mut self, part: Part<P::Start, Bytes>) -> Result<AggregatorOutcome<P::Aggregate>, AggregationError> {
        match part {
            Part::Start(start) => {
                if self.in_flight.is_some() {
                    self.in_flight = None;
                    return Err(AggregationError::AlreadyInProgress);
                }

                if self.policy.decode_failure(&start).is_some() {
                    let aggregate = self.policy.begin(start);
                    return Ok(AggregatorOutcome::Complete(self.policy.finish(aggregate)));
                }

                if let Some(declared) = self.policy.declared_length(&start) {
                    if declared > self.max_content_length {
                        return Err(self.oversize_error());
                    }
                }

                let continue_response = self.policy.continue_response(&start).map(|resp| {
                    let close_after = self.policy.close_after_continue_response(&start);
                    (resp, close_after)
                });
                let ignoring_content = continue_response.is_some()
                    && self.policy.ignore_content_after_continue_response(&start);

                let aggregate = self.policy.begin(start);
                self.in_flight = Some(InFlight { aggregate, total: 0, ignoring_content });
                Ok(AggregatorOutcome::Pending { continue_response })
            }

            Part::Content(content, result) => {
                if self.in_flight.is_none() {
                    return Err(AggregationError::NoAggregationInProgress);
                }
                if let DecoderResult::Failure(cause) = &result {
                    let in_flight = self.in_flight.take().unwrap();
                    tracing::warn!(
                        error = %cause,
                        kind = ?cause.kind(),
                        "content part carried a decoding failure, finishing aggregate early"
                    );
                    return Ok(AggregatorOutcome::Complete(self.policy.finish(in_flight.aggregate)));
                }

                let in_flight = self.in_flight.as_mut().unwrap();
                if in_flight.ignoring_content {
                    return Ok(AggregatorOutcome::Pending { continue_response: None });
                }
                let projected = in_flight.total + content.len();
                if projected > self.max_content_length {
                    self.in_flight = None;
                    return Err(self.oversize_error());
                }
                in_flight.total = projected;
                self.policy.append(&mut in_flight.aggregate, content);
                Ok(AggregatorOutcome::Pending { continue_response: None })
            }

            Part::LastContent(content, result) => {
                let Some(mut in_flight) = self.in_flight.take() else {
                    return Err(AggregationError::NoAggregationInProgress);
                };
                if let DecoderResult::Failure(cause) = &result {
                    tracing::warn!(
                        error = %cause,
                        kind = ?cause.kind(),
                        "last-content part carried a decoding failure, finishing aggregate early"
                    );
                    return Ok(AggregatorOutcome::Complete(self.policy.finish(in_flight.aggregate)));
                }
                if !in_flight.ignoring_content {
                    let projected = in_flight.total + content.len();
                    if projected > self.max_content_length {
                        return Err(self.oversize_error());
                    }
                    self.policy.append(&mut in_flight.aggregate, content);
                }
                Ok(AggregatorOutcome::Complete(self.policy.finish(in_flight.aggregate)))
            }
        }
    }
}

/// A concrete [`AggregationPolicy`] that just concatenates content bytes
/// behind whatever opaque metadata the start message carried — enough for
/// protocols whose "aggregate" is literally `(metadata, body)`.
pub struct ConcatBodyPolicy<M> {
    _marker: std::marker::PhantomData<M>,
}

impl<M> Default for ConcatBodyPolicy<M> {
    fn default() -> Self {
        Self { _marker: std::marker::PhantomData }
    }
}

pub struct StartWithDeclaredLength<M> {
    pub metadata: M,
    pub declared_length: Option<usize>,
}

pub struct Aggregate<M> {
    pub metadata: M,
    pub body: BytesMut,
}

impl<M: Send + Sync + 'static> AggregationPolicy for ConcatBodyPolicy<M> {
    type Start = StartWithDeclaredLength<M>;
    type Aggregate = Aggregate<M>;

    fn declared_length(&self, start: &Self::Start) -> Option<usize> {
        start.declared_length
    }

    fn begin(&mut self, start: Self::Start) -> Self::Aggregate {
        Aggregate { metadata: start.metadata, body: BytesMut::new() }
    }

    fn append(&mut self, aggregate: &mut Self::Aggregate, content: Bytes) {
        aggregate.body.extend_from_slice(&content);
    }
}

/// Wires a [`MessageAggregator`] into the pipeline as an [`InboundHandler`].
/// Expects upstream framers to deliver `PipelineMessage::message(Part<...>)`
/// — anything else is passed through untouched, matching
/// [`weave_core::framing_handler::FramingHandler`]'s "not for me" passthrough.
pub struct AggregatorHandler<P: AggregationPolicy> {
    inner: Mutex<MessageAggregator<P>>,
}

impl<P: AggregationPolicy> AggregatorHandler<P> {
    pub fn new(policy: P, max_content_length: usize) -> Self {
        Self { inner: Mutex::new(MessageAggregator::new(policy, max_content_length)) }
    }
}

impl<P> InboundHandler for AggregatorHandler<P>
where
    P: AggregationPolicy + 'static,
{
    fn on_read(&self, ctx: &dyn Context, msg: PipelineMessage) {
        let Some(part_arc) = msg.downcast::<Part<P::Start, Bytes>>() else {
            ctx.fire_inbound(msg);
            return;
        };
        let part = match Arc::try_unwrap(part_arc) {
            Ok(part) => part,
            Err(_) => {
                ctx.fire_exception(PipelineError::Other(
                    "aggregator part message arrived with more than one reference".into(),
                ));
                return;
            }
        };

        let result = self.inner.lock().unwrap().on_part(part);
        match result {
            Ok(AggregatorOutcome::Pending { continue_response: Some((response, close_after)) }) => {
                let _ = ctx.write_and_flush(PipelineMessage::Bytes(response));
                if close_after {
                    let _ = ctx.close_async();
                }
            }
            Ok(AggregatorOutcome::Pending { continue_response: None }) => {}
            Ok(AggregatorOutcome::Complete(aggregate)) => {
                ctx.fire_inbound(PipelineMessage::message(aggregate));
            }
            Err(e) => match &e {
                AggregationError::TooLarge { should_close, .. } if *should_close => {
                    tracing::warn!("closing connection after oversize aggregate");
                    let _ = ctx.close_async();
                }
                _ => {
                    tracing::warn!(error = %e, "aggregator firing exception");
                    ctx.fire_exception(PipelineError::Aggregation(e));
                }
            },
        }
    }

    fn on_channel_inactive(&self, ctx: &dyn Context) {
        self.inner.lock().unwrap().discard_in_flight();
        ctx.fire_inbound_complete();
    }

    fn on_remove(&self, _ctx: &dyn Context) {
        self.inner.lock().unwrap().discard_in_flight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(declared: Option<usize>) -> StartWithDeclaredLength<&'static str> {
        StartWithDeclaredLength { metadata: "req-1", declared_length: declared }
    }

    #[test]
    fn aggregator_completeness_emits_exactly_one_envelope() {
        let mut agg = MessageAggregator::new(ConcatBodyPolicy::default(), 1024);
        assert!(matches!(
            agg.on_part(Part::Start(start(None))).unwrap(),
            AggregatorOutcome::Pending { continue_response: None }
        ));
        assert!(matches!(
            agg.on_part(Part::content(Bytes::from_static(b"hel"))).unwrap(),
            AggregatorOutcome::Pending { continue_response: None }
        ));
        match agg.on_part(Part::last_content(Bytes::from_static(b"lo"))).unwrap() {
            AggregatorOutcome::Complete(envelope) => {
                assert_eq!(&envelope.body[..], b"hello");
                assert_eq!(envelope.metadata, "req-1");
            }
            AggregatorOutcome::Pending { .. } => panic!("expected a completed envelope"),
        }
    }

    #[test]
    fn start_while_in_progress_is_an_error_and_drops_partial_state() {
        let mut agg = MessageAggregator::new(ConcatBodyPolicy::default(), 1024);
        agg.on_part(Part::Start(start(None))).unwrap();
        let err = agg.on_part(Part::Start(start(None))).unwrap_err();
        assert!(matches!(err, AggregationError::AlreadyInProgress));
        // The stale aggregate must be gone, not just shadowed.
        let err2 = agg.on_part(Part::content(Bytes::from_static(b"x"))).unwrap_err();
        assert!(matches!(err2, AggregationError::AlreadyInProgress) || matches!(err2, AggregationError::NoAggregationInProgress));
    }

    #[test]
    fn oversize_content_never_completes_and_drops_in_flight_state() {
        let mut agg = MessageAggregator::new(ConcatBodyPolicy::default(), 4);
        agg.on_part(Part::Start(start(None))).unwrap();
        let err = agg.on_part(Part::content(Bytes::from_static(b"too long"))).unwrap_err();
        assert!(matches!(err, AggregationError::TooLarge { max: 4, should_close: false }));
        let err2 = agg.on_part(Part::last_content(Bytes::from_static(b"x"))).unwrap_err();
        assert!(matches!(err2, AggregationError::NoAggregationInProgress));
    }

    #[test]
    fn declared_length_over_budget_rejects_before_any_content_arrives() {
        let mut agg = MessageAggregator::new(ConcatBodyPolicy::default(), 4);
        let err = agg.on_part(Part::Start(start(Some(100)))).unwrap_err();
        assert!(matches!(err, AggregationError::TooLarge { max: 4, should_close: false }));
    }

    /// A policy whose `continue_response` answers "100-continue" and
    /// decides independently whether to close after and whether to
    /// ignore the body that follows.
    struct HundredContinuePolicy {
        close_after: bool,
        ignore_content: bool,
    }

    impl AggregationPolicy for HundredContinuePolicy {
        type Start = StartWithDeclaredLength<()>;
        type Aggregate = Aggregate<()>;

        fn declared_length(&self, start: &Self::Start) -> Option<usize> {
            start.declared_length
        }

        fn begin(&mut self, _start: Self::Start) -> Self::Aggregate {
            Aggregate { metadata: (), body: BytesMut::new() }
        }

        fn append(&mut self, aggregate: &mut Self::Aggregate, content: Bytes) {
            aggregate.body.extend_from_slice(&content);
        }

        fn continue_response(&self, _start: &Self::Start) -> Option<Bytes> {
            Some(Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"))
        }

        fn close_after_continue_response(&self, _start: &Self::Start) -> bool {
            self.close_after
        }

        fn ignore_content_after_continue_response(&self, _start: &Self::Start) -> bool {
            self.ignore_content
        }
    }

    #[test]
    fn continue_response_is_emitted_and_content_still_aggregates_by_default() {
        let policy = HundredContinuePolicy { close_after: false, ignore_content: false };
        let mut agg = MessageAggregator::new(policy, 1024);
        let outcome = agg.on_part(Part::Start(start(None))).unwrap();
        match outcome {
            AggregatorOutcome::Pending { continue_response: Some((resp, close_after)) } => {
                assert_eq!(&resp[..], b"HTTP/1.1 100 Continue\r\n\r\n");
                assert!(!close_after);
            }
            _ => panic!("expected a continue response"),
        }
        match agg.on_part(Part::last_content(Bytes::from_static(b"body"))).unwrap() {
            AggregatorOutcome::Complete(envelope) => assert_eq!(&envelope.body[..], b"body"),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn ignore_content_after_continue_drops_the_body_but_still_completes() {
        let policy = HundredContinuePolicy { close_after: false, ignore_content: true };
        let mut agg = MessageAggregator::new(policy, 1024);
        agg.on_part(Part::Start(start(None))).unwrap();
        agg.on_part(Part::content(Bytes::from_static(b"ignored"))).unwrap();
        match agg.on_part(Part::last_content(Bytes::from_static(b"also ignored"))).unwrap() {
            AggregatorOutcome::Complete(envelope) => assert!(envelope.body.is_empty()),
            _ => panic!("expected completion"),
        }
    }

    /// A policy that reports the start message as already carrying a
    /// decoding failure: this must emit a minimal aggregate and finish
    /// immediately, without waiting for content.
    struct AlwaysFailedPolicy;

    impl AggregationPolicy for AlwaysFailedPolicy {
        type Start = ();
        type Aggregate = Option<&'static str>;

        fn declared_length(&self, _start: &Self::Start) -> Option<usize> {
            None
        }

        fn begin(&mut self, _start: Self::Start) -> Self::Aggregate {
            None
        }

        fn append(&mut self, _aggregate: &mut Self::Aggregate, _content: Bytes) {}

        fn decode_failure(&self, _start: &Self::Start) -> Option<&'static str> {
            Some("upstream framer reported a decoding failure")
        }
    }

    #[test]
    fn decode_failure_on_start_emits_minimal_aggregate_immediately() {
        let mut agg = MessageAggregator::new(AlwaysFailedPolicy, 1024);
        match agg.on_part(Part::Start(())).unwrap() {
            AggregatorOutcome::Complete(_) => {}
            AggregatorOutcome::Pending { .. } => panic!("a failed start must finish immediately"),
        }
        // No aggregation left in flight; a fresh Start can begin right away.
        assert!(matches!(
            agg.on_part(Part::Start(())).unwrap(),
            AggregatorOutcome::Complete(_)
        ));
    }

    #[test]
    fn decode_failure_on_content_finishes_the_aggregate_early() {
        let mut agg = MessageAggregator::new(ConcatBodyPolicy::default(), 1024);
        agg.on_part(Part::Start(start(None))).unwrap();
        agg.on_part(Part::content(Bytes::from_static(b"hel"))).unwrap();

        let failure = DecoderResult::Failure(Arc::new(weave_core::CodecError::corrupted(
            "truncated chunk trailer",
        )));
        match agg.on_part(Part::Content(Bytes::from_static(b"lo"), failure)).unwrap() {
            AggregatorOutcome::Complete(envelope) => {
                // Only the content appended before the failed chunk is kept.
                assert_eq!(&envelope.body[..], b"hel");
            }
            AggregatorOutcome::Pending { .. } => panic!("a failed content part must finish immediately"),
        }

        // No aggregation left in flight; a fresh Start can begin right away.
        assert!(matches!(
            agg.on_part(Part::Start(start(None))).unwrap(),
            AggregatorOutcome::Pending { continue_response: None }
        ));
    }

    #[test]
    fn decode_failure_on_last_content_finishes_the_aggregate_early() {
        let mut agg = MessageAggregator::new(ConcatBodyPolicy::default(), 1024);
        agg.on_part(Part::Start(start(None))).unwrap();
        agg.on_part(Part::content(Bytes::from_static(b"hel"))).unwrap();

        let failure = DecoderResult::Failure(Arc::new(weave_core::CodecError::corrupted(
            "truncated final chunk",
        )));
        match agg.on_part(Part::LastContent(Bytes::from_static(b"lo"), failure)).unwrap() {
            AggregatorOutcome::Complete(envelope) => assert_eq!(&envelope.body[..], b"hel"),
            AggregatorOutcome::Pending { .. } => panic!("a failed last-content part must finish immediately"),
        }
    }
}
