use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{Session, SessionPhase, SessionState, StreamTarget};
use crate::config::{AttemptReset, RelayConfig};
use crate::error::{Disposition, RelayError, Result};
use crate::media::{EncodedFrame, FrameClock, RawFrame, Transcoder};
use crate::transport::{ErrorReport, RelayChannel};
use crate::upstream::{FrameSource, Upstream};

/// Outcome of one session, returned once it is closed.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    /// Every phase entered, in order. Reconnect attempts each appear as a
    /// separate `Reconnecting` entry.
    pub phases: Vec<SessionPhase>,
    pub frames_sent: u64,
    pub frames_skipped: u64,
    /// Wire kind of the terminal error reported downstream, if any.
    pub error: Option<&'static str>,
}

impl SessionReport {
    pub fn reconnects(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| **p == SessionPhase::Reconnecting)
            .count()
    }
}

enum Ending {
    /// The consumer went away; nothing to report.
    Disconnected,
    /// Report this error once, then close.
    Failed(RelayError),
}

/// Per-run bookkeeping: the supervisor's private copy of the session state.
struct Run<'a> {
    session: &'a Session,
    state: SessionState,
    phases: Vec<SessionPhase>,
    frames_sent: u64,
    frames_skipped: u64,
}

impl<'a> Run<'a> {
    fn new(session: &'a Session) -> Self {
        let state = SessionState::new();
        session.publish(&state);
        Self {
            session,
            phases: vec![state.phase],
            state,
            frames_sent: 0,
            frames_skipped: 0,
        }
    }

    fn enter(&mut self, phase: SessionPhase) {
        tracing::debug!(
            session_id = %self.session.id,
            old_phase = ?self.state.phase,
            new_phase = ?phase,
            reconnect_count = self.state.reconnect_count,
            "phase transition"
        );
        self.state.phase = phase;
        self.phases.push(phase);
        self.session.publish(&self.state);
    }

    fn into_report(self, error: Option<&'static str>) -> SessionReport {
        SessionReport {
            session_id: self.session.id.clone(),
            state: self.state,
            phases: self.phases,
            frames_sent: self.frames_sent,
            frames_skipped: self.frames_skipped,
            error,
        }
    }
}

/// Drives one downstream session end to end.
///
/// A supervisor is shared by every session of a server; it holds only
/// read-only configuration and stateless collaborators. All per-session
/// state lives on the stack of [`run`](Self::run).
pub struct Supervisor {
    config: Arc<RelayConfig>,
    upstream: Arc<dyn Upstream>,
    transcoder: Arc<dyn Transcoder>,
}

impl Supervisor {
    pub fn new(
        config: Arc<RelayConfig>,
        upstream: Arc<dyn Upstream>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            config,
            upstream,
            transcoder,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Relay `session.url` to `channel` until the consumer leaves or the
    /// session fails.
    ///
    /// Every fatal path sends exactly one error report before the channel
    /// is closed. A consumer disconnect closes the session without a
    /// report, interrupting any read, backoff or pacing wait in progress.
    pub async fn run(&self, session: &Session, channel: &mut dyn RelayChannel) -> SessionReport {
        let cancel = channel.disconnected();
        let mut run = Run::new(session);

        let ending = self.drive(&mut run, channel, &cancel).await;

        let error = match ending {
            Ending::Disconnected => {
                tracing::info!(session_id = %session.id, frames = run.frames_sent, "consumer disconnected");
                None
            }
            Ending::Failed(err) => {
                tracing::error!(
                    session_id = %session.id,
                    url = %session.url,
                    attempts = run.state.reconnect_count,
                    kind = err.kind_name(),
                    error = %err,
                    "session failed"
                );
                run.enter(SessionPhase::Failed);
                let report = ErrorReport::new(&err, Some(&session.url), run.state.reconnect_count);
                channel.send_error(&report).await;
                Some(report.kind)
            }
        };

        run.enter(SessionPhase::Closed);
        channel.close().await;
        run.into_report(error)
    }

    async fn drive(
        &self,
        run: &mut Run<'_>,
        channel: &mut dyn RelayChannel,
        cancel: &CancellationToken,
    ) -> Ending {
        let target = match StreamTarget::parse(&run.session.url, self.config.upstream.headers.clone())
        {
            Ok(target) => target,
            Err(e) => return Ending::Failed(e),
        };

        let policy = &self.config.reconnect;
        let tls_disabled = self.config.upstream.accept_invalid_certs;
        let mut clock = FrameClock::new();

        loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Disconnected,
                opened = self.upstream.open(&target) => opened,
            };

            let failure = match opened {
                Ok(mut source) => {
                    run.enter(SessionPhase::Streaming);
                    let failure = self
                        .stream(run, source.as_mut(), &mut clock, channel, cancel)
                        .await;
                    source.close();
                    failure
                }
                Err(e) => e,
            };

            match failure.disposition(tls_disabled) {
                Disposition::Disconnect => return Ending::Disconnected,
                Disposition::Transient => {}
                Disposition::Fatal | Disposition::SkipFrame => return Ending::Failed(failure),
            }

            run.state.reconnect_count += 1;
            if run.state.reconnect_count >= policy.max_attempts {
                return Ending::Failed(failure);
            }
            tracing::warn!(
                session_id = %run.session.id,
                attempt = run.state.reconnect_count,
                max_attempts = policy.max_attempts,
                backoff_ms = policy.backoff.as_millis() as u64,
                error = %failure,
                "camera connection lost, reconnecting"
            );
            run.enter(SessionPhase::Reconnecting);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Disconnected,
                _ = tokio::time::sleep(policy.backoff) => {}
            }
        }
    }

    /// Pump frames until something ends the connection; returns what did.
    async fn stream(
        &self,
        run: &mut Run<'_>,
        source: &mut dyn FrameSource,
        clock: &mut FrameClock,
        channel: &mut dyn RelayChannel,
        cancel: &CancellationToken,
    ) -> RelayError {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayError::PeerDisconnected,
                next = source.next_frame() => next,
            };

            let raw = match next {
                Ok(Some(raw)) => raw,
                Ok(None) => return RelayError::StreamClosed("camera ended the stream".into()),
                Err(e) => return e,
            };

            let frame = match self.transcode(raw, clock).await {
                Ok(frame) => frame,
                Err(RelayError::Decode(reason)) => {
                    run.frames_skipped += 1;
                    tracing::warn!(session_id = %run.session.id, %reason, "skipping undecodable frame");
                    continue;
                }
                Err(e) => return e,
            };

            let sequence = frame.sequence_number;
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayError::PeerDisconnected,
                sent = channel.send_frame(frame) => sent,
            };
            if let Err(e) = sent {
                return e;
            }
            run.frames_sent += 1;
            tracing::trace!(session_id = %run.session.id, sequence, "frame sent");

            if self.config.reconnect.reset == AttemptReset::OnFrameDelivered
                && run.state.reconnect_count > 0
            {
                tracing::debug!(session_id = %run.session.id, "frame delivered, reconnect budget restored");
                run.state.reconnect_count = 0;
                run.session.publish(&run.state);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayError::PeerDisconnected,
                _ = tokio::time::sleep(self.config.pacing) => {}
            }
        }
    }

    /// Run the transcoder on the blocking pool.
    ///
    /// The clock is copied in and written back only on success, so a
    /// skipped frame never consumes a sequence number.
    async fn transcode(&self, raw: RawFrame, clock: &mut FrameClock) -> Result<EncodedFrame> {
        let transcoder = Arc::clone(&self.transcoder);
        let mut working = *clock;
        let (frame, working) = tokio::task::spawn_blocking(move || {
            let frame = transcoder.transcode(&raw, &mut working);
            (frame, working)
        })
        .await
        .map_err(|e| RelayError::Decode(format!("transcode task failed: {e}")))?;

        let frame = frame?;
        *clock = working;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconnectPolicy, UpstreamConfig};
    use crate::transport::ErrorReport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Upstream double: each `open` pops the next scripted connection.
    struct Scripted {
        opens: Mutex<VecDeque<Result<Vec<Step>>>>,
        open_count: Mutex<u32>,
        closed: Arc<Mutex<u32>>,
    }

    enum Step {
        Frame(&'static [u8]),
        Fail(RelayError),
        Hang,
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
        closed: Arc<Mutex<u32>>,
    }

    impl Scripted {
        fn new(opens: Vec<Result<Vec<Step>>>) -> Arc<Self> {
            Arc::new(Self {
                opens: Mutex::new(opens.into()),
                open_count: Mutex::new(0),
                closed: Arc::new(Mutex::new(0)),
            })
        }

        fn opens(&self) -> u32 {
            *self.open_count.lock()
        }

        fn closes(&self) -> u32 {
            *self.closed.lock()
        }
    }

    #[async_trait]
    impl Upstream for Scripted {
        async fn open(&self, _target: &StreamTarget) -> Result<Box<dyn FrameSource>> {
            *self.open_count.lock() += 1;
            let next = self
                .opens
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(RelayError::ConnectRefused("script exhausted".into())));
            let steps = next?;
            Ok(Box::new(ScriptedSource {
                steps: steps.into(),
                closed: self.closed.clone(),
            }))
        }
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
            match self.steps.pop_front() {
                Some(Step::Frame(bytes)) => Ok(Some(RawFrame::new(bytes))),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Hang) => std::future::pending().await,
                None => Ok(None),
            }
        }

        fn close(&mut self) {
            *self.closed.lock() += 1;
        }
    }

    /// Accepts anything starting with `ok`, rejects the rest.
    struct PrefixTranscoder;

    impl Transcoder for PrefixTranscoder {
        fn reencode(&self, payload: &[u8]) -> Result<Bytes> {
            if payload.starts_with(b"ok") {
                Ok(Bytes::copy_from_slice(payload))
            } else {
                Err(RelayError::Decode("not ok".into()))
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        frames: Vec<EncodedFrame>,
        errors: Vec<ErrorReport>,
        /// Disconnect after this many frames.
        hang_up_after: Option<usize>,
        /// Sends never complete, like a peer that stopped reading.
        stall_sends: bool,
        closed: bool,
        token: CancellationToken,
    }

    #[async_trait]
    impl RelayChannel for Recorder {
        async fn send_frame(&mut self, frame: EncodedFrame) -> Result<()> {
            if self.token.is_cancelled() {
                return Err(RelayError::PeerDisconnected);
            }
            if self.stall_sends {
                std::future::pending::<()>().await;
            }
            self.frames.push(frame);
            if self.hang_up_after == Some(self.frames.len()) {
                self.token.cancel();
            }
            Ok(())
        }

        async fn send_error(&mut self, report: &ErrorReport) {
            self.errors.push(report.clone());
        }

        fn disconnected(&self) -> CancellationToken {
            self.token.clone()
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn config(reset: AttemptReset) -> Arc<RelayConfig> {
        Arc::new(RelayConfig {
            pacing: Duration::from_millis(1),
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(5),
                reset,
            },
            upstream: UpstreamConfig::default(),
            ..RelayConfig::default()
        })
    }

    fn session(url: &str) -> Session {
        Session::new("127.0.0.1:40000".parse().unwrap(), url)
    }

    fn supervisor(upstream: Arc<Scripted>, reset: AttemptReset) -> Supervisor {
        Supervisor::new(config(reset), upstream, Arc::new(PrefixTranscoder))
    }

    fn refused() -> Result<Vec<Step>> {
        Err(RelayError::ConnectRefused("refused".into()))
    }

    #[tokio::test]
    async fn exhausted_reconnects_fail_once() {
        // A fourth scripted success must never be reached.
        let upstream = Scripted::new(vec![
            refused(),
            refused(),
            refused(),
            Ok(vec![Step::Frame(b"ok-late")]),
        ]);
        let sup = supervisor(upstream.clone(), AttemptReset::OnFrameDelivered);
        let mut channel = Recorder::default();

        let report = sup.run(&session("http://cam/video"), &mut channel).await;

        assert_eq!(report.reconnects(), 2);
        assert_eq!(upstream.opens(), 3);
        assert_eq!(
            report.phases,
            vec![
                SessionPhase::Connecting,
                SessionPhase::Reconnecting,
                SessionPhase::Reconnecting,
                SessionPhase::Failed,
                SessionPhase::Closed,
            ]
        );
        assert_eq!(channel.errors.len(), 1);
        assert_eq!(channel.errors[0].kind, "connect_refused");
        assert_eq!(channel.errors[0].reconnect_attempts, 3);
        assert_eq!(channel.errors[0].camera_url.as_deref(), Some("http://cam/video"));
        assert!(channel.frames.is_empty());
        assert!(channel.closed);
        assert_eq!(report.state.phase, SessionPhase::Closed);
    }

    #[tokio::test]
    async fn invalid_target_fails_without_connecting() {
        let upstream = Scripted::new(vec![]);
        let sup = supervisor(upstream.clone(), AttemptReset::OnFrameDelivered);
        let mut channel = Recorder::default();

        let report = sup.run(&session("camera.local/stream"), &mut channel).await;

        assert_eq!(upstream.opens(), 0);
        assert_eq!(report.error, Some("invalid_target"));
        assert_eq!(channel.errors.len(), 1);
        assert_eq!(report.reconnects(), 0);
    }

    #[tokio::test]
    async fn corrupt_frames_are_skipped_without_sequence_gaps() {
        let upstream = Scripted::new(vec![Ok(vec![
            Step::Frame(b"ok-1"),
            Step::Frame(b"garbage"),
            Step::Frame(b"ok-2"),
            Step::Frame(b"garbage"),
            Step::Frame(b"ok-3"),
            Step::Fail(RelayError::MalformedStream {
                buffered: 10,
                limit: 5,
            }),
        ])]);
        let sup = supervisor(upstream.clone(), AttemptReset::OnFrameDelivered);
        let mut channel = Recorder::default();

        let report = sup.run(&session("http://cam/video"), &mut channel).await;

        let seqs: Vec<u64> = channel.frames.iter().map(|f| f.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(report.frames_skipped, 2);
        assert_eq!(report.error, Some("malformed_stream"));
        assert_eq!(channel.errors.len(), 1);
        assert_eq!(upstream.closes(), 1);
    }

    #[tokio::test]
    async fn disconnect_mid_stream_stops_reading() {
        let upstream = Scripted::new(vec![Ok(vec![
            Step::Frame(b"ok-1"),
            Step::Frame(b"ok-2"),
            Step::Frame(b"ok-3"),
            Step::Frame(b"ok-4"),
        ])]);
        let sup = supervisor(upstream.clone(), AttemptReset::OnFrameDelivered);
        let mut channel = Recorder {
            hang_up_after: Some(2),
            ..Recorder::default()
        };

        let report = sup.run(&session("http://cam/video"), &mut channel).await;

        assert_eq!(channel.frames.len(), 2);
        assert!(channel.errors.is_empty());
        assert_eq!(report.error, None);
        assert_eq!(upstream.closes(), 1);
        assert_eq!(report.phases.last(), Some(&SessionPhase::Closed));
        assert!(!report.phases.contains(&SessionPhase::Failed));
    }

    #[tokio::test]
    async fn disconnect_interrupts_a_stalled_read() {
        let upstream = Scripted::new(vec![Ok(vec![Step::Frame(b"ok-1"), Step::Hang])]);
        let sup = supervisor(upstream.clone(), AttemptReset::OnFrameDelivered);
        let mut channel = Recorder::default();
        let token = channel.token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            sup.run(&session("http://cam/video"), &mut channel),
        )
        .await
        .expect("session should close promptly");

        assert_eq!(report.frames_sent, 1);
        assert!(channel.errors.is_empty());
        assert_eq!(upstream.closes(), 1);
    }

    #[tokio::test]
    async fn frame_delivery_restores_reconnect_budget() {
        let drop_after_one = || -> Result<Vec<Step>> {
            Ok(vec![
                Step::Frame(b"ok"),
                Step::Fail(RelayError::StreamClosed("reset".into())),
            ])
        };
        // Five drops in a row, each after one good frame: only survivable
        // when the budget is restored by delivery.
        let script = (0..5).map(|_| drop_after_one()).chain([Ok(vec![
            Step::Fail(RelayError::UpstreamStatus(401)),
        ])]);
        let upstream = Scripted::new(script.collect());
        let sup = supervisor(upstream.clone(), AttemptReset::OnFrameDelivered);
        let mut channel = Recorder::default();

        let report = sup.run(&session("http://cam/video"), &mut channel).await;

        assert_eq!(report.frames_sent, 5);
        assert_eq!(upstream.opens(), 6);
        assert_eq!(report.error, Some("upstream_status"));
        // Sequence numbers keep counting across reconnects.
        let seqs: Vec<u64> = channel.frames.iter().map(|f| f.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn per_session_budget_is_not_restored() {
        let drop_after_one = || -> Result<Vec<Step>> {
            Ok(vec![
                Step::Frame(b"ok"),
                Step::Fail(RelayError::ReadTimeout(Duration::from_secs(1))),
            ])
        };
        let upstream = Scripted::new((0..6).map(|_| drop_after_one()).collect());
        let sup = supervisor(upstream.clone(), AttemptReset::PerSession);
        let mut channel = Recorder::default();

        let report = sup.run(&session("http://cam/video"), &mut channel).await;

        assert_eq!(upstream.opens(), 3);
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.error, Some("read_timeout"));
        assert_eq!(channel.errors[0].reconnect_attempts, 3);
    }

    #[tokio::test]
    async fn disconnect_during_backoff_skips_reconnect() {
        let upstream = Scripted::new(vec![refused(), refused()]);
        let config = Arc::new(RelayConfig {
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                backoff: Duration::from_secs(30),
                reset: AttemptReset::OnFrameDelivered,
            },
            ..RelayConfig::default()
        });
        let sup = Supervisor::new(config, upstream.clone(), Arc::new(PrefixTranscoder));
        let mut channel = Recorder::default();
        let token = channel.token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            sup.run(&session("http://cam/video"), &mut channel),
        )
        .await
        .expect("backoff should be interrupted");

        assert_eq!(upstream.opens(), 1);
        assert!(channel.errors.is_empty());
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn disconnect_interrupts_a_blocked_send() {
        let upstream = Scripted::new(vec![Ok(vec![Step::Frame(b"ok-1"), Step::Frame(b"ok-2")])]);
        let sup = supervisor(upstream.clone(), AttemptReset::OnFrameDelivered);
        let mut channel = Recorder {
            stall_sends: true,
            ..Recorder::default()
        };
        let token = channel.token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            sup.run(&session("http://cam/video"), &mut channel),
        )
        .await
        .expect("a stuck send must not outlive the consumer");

        assert_eq!(report.frames_sent, 0);
        assert_eq!(report.error, None);
        assert!(channel.errors.is_empty());
        assert_eq!(upstream.closes(), 1);
        assert_eq!(upstream.opens(), 1);
    }

    #[tokio::test]
    async fn upstream_released_within_one_pacing_interval() {
        let pacing = Duration::from_millis(400);
        let upstream = Scripted::new(vec![Ok(vec![
            Step::Frame(b"ok-1"),
            Step::Frame(b"ok-2"),
            Step::Frame(b"ok-3"),
        ])]);
        let config = Arc::new(RelayConfig {
            pacing,
            ..RelayConfig::default()
        });
        let sup = Supervisor::new(config, upstream.clone(), Arc::new(PrefixTranscoder));
        let mut channel = Recorder::default();
        let token = channel.token.clone();

        // Lands in the pacing wait after the first frame.
        let hung_up_at = Arc::new(Mutex::new(None));
        let hang_up = hung_up_at.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            *hang_up.lock() = Some(std::time::Instant::now());
            token.cancel();
        });

        let report = sup.run(&session("http://cam/video"), &mut channel).await;
        let released = std::time::Instant::now();

        let hung_up_at = (*hung_up_at.lock()).expect("consumer hung up");
        assert!(released.duration_since(hung_up_at) < pacing);
        assert_eq!(upstream.closes(), 1);
        assert_eq!(report.frames_sent, 1);
        assert_eq!(channel.frames.len(), 1);
        assert!(channel.errors.is_empty());
    }
}
