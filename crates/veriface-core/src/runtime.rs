//! Async liveness runtime.
//!
//! One owner task per attempt holds the [`Session`] and is the only code that
//! mutates it. It multiplexes, in a single `select!` loop:
//!
//! - a ~15 Hz sample ticker that grabs a frame and hands it to the landmark
//!   oracle on the blocking pool (at most one call in flight, missed ticks are
//!   skipped rather than queued),
//! - a slower head-movement ticker,
//! - transcripts forwarded by the challenge listener task over an `mpsc`,
//! - start/stop commands for the listener,
//! - the attempt deadline and the cancellation token.
//!
//! Fusion is evaluated after every state change, on committed state only.
//! Whatever ends the loop, the listener is stopped and the camera released
//! before the session is handed back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::blink::BlinkConfig;
use crate::error::AuthError;
use crate::face_match::FaceMatcher;
use crate::fusion::{FusionDecision, LivenessSignals};
use crate::head_movement::HeadMovementConfig;
use crate::oracle::{Camera, CameraGuard, Frame, LandmarkOracle, OracleError, SpeechOracle};
use crate::session::{FailureCause, LivenessPipeline, Phase, Session};
use crate::types::LandmarkFrame;

/// Sampler period, roughly 15 frames per second.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(67);
pub const DEFAULT_HEAD_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

const TRANSCRIPT_BUFFER: usize = 8;
const COMMAND_BUFFER: usize = 4;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub blink: BlinkConfig,
    pub head: HeadMovementConfig,
    pub matcher: FaceMatcher,
    pub antispoof_threshold: Option<f32>,
    pub tick_interval: Duration,
    pub head_interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            blink: BlinkConfig::default(),
            head: HeadMovementConfig::default(),
            matcher: FaceMatcher::default(),
            antispoof_threshold: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            head_interval: DEFAULT_HEAD_INTERVAL,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// Snapshot published after every change, for UI rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessProgress {
    pub frames: u64,
    pub face_present: bool,
    pub face_distance: Option<f32>,
    pub blink_count: u32,
    pub listening: bool,
    pub signals: LivenessSignals,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LivenessOutcome {
    /// Fusion fired and the session is AUTHENTICATED. `snapshot` is the last
    /// frame that contained the matched face.
    Satisfied { snapshot: Vec<u8> },
    /// Cancelled from outside; the session has been closed.
    Cancelled,
    /// Deadline passed without fusion.
    TimedOut,
    Failed(AuthError),
}

enum Command {
    StartListening(oneshot::Sender<Result<(), AuthError>>),
    StopListening(oneshot::Sender<()>),
}

/// Handle to a running liveness attempt.
///
/// Dropping the handle cancels the attempt.
pub struct LivenessHandle {
    commands: mpsc::Sender<Command>,
    progress: watch::Receiver<LivenessProgress>,
    cancel: CancellationToken,
    guard: DropGuard,
    join: JoinHandle<(Session, LivenessOutcome)>,
}

impl LivenessHandle {
    /// Start the speech listener. Rejected while it is already running.
    pub async fn start_listening(&self) -> Result<(), AuthError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::StartListening(reply_tx))
            .await
            .map_err(|_| AuthError::InvalidTransition {
                action: "start_listening",
                phase: "liveness attempt finished".into(),
            })?;
        reply_rx.await.map_err(|_| AuthError::InvalidTransition {
            action: "start_listening",
            phase: "liveness attempt finished".into(),
        })?
    }

    /// Stop the speech listener. No-op if it is not running.
    pub async fn stop_listening(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::StopListening(reply_tx))
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub fn progress(&self) -> watch::Receiver<LivenessProgress> {
        self.progress.clone()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the attempt to end and take the session back.
    pub async fn finish(self) -> Result<(Session, LivenessOutcome), AuthError> {
        let LivenessHandle { guard, join, .. } = self;
        let result = join.await;
        guard.disarm();
        result.map_err(|e| AuthError::Fatal(format!("liveness task failed: {e}")))
    }
}

/// Start the liveness owner task for a session that has just entered
/// LIVENESS. The listener is started together with the attempt.
pub fn spawn_liveness(
    session: Session,
    camera: Box<dyn Camera>,
    oracle: Arc<dyn LandmarkOracle>,
    speech: Box<dyn SpeechOracle>,
    config: LivenessConfig,
    parent: &CancellationToken,
) -> LivenessHandle {
    let cancel = parent.child_token();
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let (progress_tx, progress_rx) = watch::channel(LivenessProgress::default());

    let owner = LivenessOwner {
        session,
        pipeline: LivenessPipeline::new(&config),
        oracle,
        config,
        cancel: cancel.clone(),
        progress: progress_tx,
    };
    let join = tokio::spawn(owner.run(camera, speech, commands_rx));

    LivenessHandle {
        commands: commands_tx,
        progress: progress_rx,
        guard: cancel.clone().drop_guard(),
        cancel,
        join,
    }
}

/// Owns the speech oracle and the task that forwards its transcripts.
///
/// The oracle moves into the task while listening and comes back on stop, so
/// the listener can be restarted within the same attempt.
struct ChallengeListener {
    speech: Option<Box<dyn SpeechOracle>>,
    task: Option<(CancellationToken, JoinHandle<Box<dyn SpeechOracle>>)>,
}

impl ChallengeListener {
    fn new(speech: Box<dyn SpeechOracle>) -> Self {
        Self {
            speech: Some(speech),
            task: None,
        }
    }

    fn is_listening(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    async fn start(
        &mut self,
        forward: mpsc::Sender<String>,
        parent: &CancellationToken,
    ) -> Result<(), AuthError> {
        if self.is_listening() {
            return Err(AuthError::Validation("challenge listener already running".into()));
        }
        // A recogniser that ended on its own still holds the oracle.
        self.stop().await;
        let Some(mut speech) = self.speech.take() else {
            return Err(AuthError::TransientInfra("speech recogniser unavailable".into()));
        };

        let token = parent.child_token();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    transcript = speech.next_transcript() => match transcript {
                        Some(text) => {
                            if forward.send(text).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("speech recogniser ended");
                            break;
                        }
                    },
                }
            }
            speech
        });

        self.task = Some((token, handle));
        tracing::debug!("challenge listener started");
        Ok(())
    }

    async fn stop(&mut self) {
        let Some((token, handle)) = self.task.take() else {
            return;
        };
        token.cancel();
        match handle.await {
            Ok(speech) => self.speech = Some(speech),
            Err(e) => tracing::warn!(error = %e, "challenge listener task failed"),
        }
        tracing::debug!("challenge listener stopped");
    }
}

type Detection = (Frame, Result<Option<LandmarkFrame>, OracleError>);

struct LivenessOwner {
    session: Session,
    pipeline: LivenessPipeline,
    oracle: Arc<dyn LandmarkOracle>,
    config: LivenessConfig,
    cancel: CancellationToken,
    progress: watch::Sender<LivenessProgress>,
}

/// Resolve the in-flight oracle call, or never if there is none.
async fn join_pending(
    pending: &mut Option<JoinHandle<Detection>>,
) -> Result<Detection, tokio::task::JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

impl LivenessOwner {
    async fn run(
        mut self,
        camera: Box<dyn Camera>,
        speech: Box<dyn SpeechOracle>,
        mut commands: mpsc::Receiver<Command>,
    ) -> (Session, LivenessOutcome) {
        if self.session.phase() != Phase::Liveness {
            let phase = self.session.phase().to_string();
            return (
                self.session,
                LivenessOutcome::Failed(AuthError::InvalidTransition {
                    action: "spawn_liveness",
                    phase,
                }),
            );
        }

        let mut camera = match CameraGuard::acquire(camera) {
            Ok(camera) => camera,
            Err(e) => {
                tracing::warn!(error = %e, "camera unavailable");
                self.session.fail(FailureCause::CameraUnavailable);
                return (self.session, LivenessOutcome::Failed(e.into()));
            }
        };

        let (transcript_tx, mut transcripts) = mpsc::channel::<String>(TRANSCRIPT_BUFFER);
        let mut listener = ChallengeListener::new(speech);
        if let Err(e) = listener.start(transcript_tx.clone(), &self.cancel).await {
            tracing::warn!(error = %e, "challenge listener did not start");
        }

        let mut sample = tokio::time::interval(self.config.tick_interval);
        sample.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut head_tick = tokio::time::interval(self.config.head_interval);
        head_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(self.config.attempt_timeout);
        tokio::pin!(deadline);

        let mut pending: Option<JoinHandle<Detection>> = None;
        let mut last_face_image: Option<Vec<u8>> = None;
        let mut progress = LivenessProgress {
            listening: listener.is_listening(),
            ..LivenessProgress::default()
        };

        self.publish(&progress);
        tracing::info!(session = %self.session.id(), "liveness attempt started");

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break LivenessOutcome::Cancelled;
                }

                _ = &mut deadline => {
                    tracing::warn!(session = %self.session.id(), "liveness attempt timed out");
                    self.session.fail(FailureCause::LivenessTimeout);
                    break LivenessOutcome::TimedOut;
                }

                Some(command) = commands.recv() => match command {
                    Command::StartListening(reply) => {
                        let started = if self.session.challenge_verified() {
                            Err(AuthError::Validation("challenge already verified".into()))
                        } else {
                            listener.start(transcript_tx.clone(), &self.cancel).await
                        };
                        progress.listening = listener.is_listening();
                        self.publish(&progress);
                        let _ = reply.send(started);
                    }
                    Command::StopListening(reply) => {
                        listener.stop().await;
                        progress.listening = false;
                        self.publish(&progress);
                        let _ = reply.send(());
                    }
                },

                Some(transcript) = transcripts.recv() => {
                    let verified = match self.session.hear(&transcript) {
                        Ok(verified) => verified,
                        Err(e) => break LivenessOutcome::Failed(e),
                    };
                    if verified {
                        // Released as soon as it has served its purpose.
                        listener.stop().await;
                        progress.listening = false;
                    }
                    if let Some(done) = self.fuse(&mut progress, &mut last_face_image) {
                        break done;
                    }
                }

                joined = join_pending(&mut pending) => {
                    pending = None;
                    let (frame, detection) = match joined {
                        Ok(detection) => detection,
                        Err(e) => {
                            tracing::error!(error = %e, "landmark oracle task failed");
                            self.session.fail(FailureCause::Internal);
                            break LivenessOutcome::Failed(AuthError::Fatal(e.to_string()));
                        }
                    };
                    let landmarks = match detection {
                        Ok(landmarks) => landmarks,
                        Err(OracleError::InvalidFrame(reason)) => {
                            tracing::debug!(%reason, "frame skipped");
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "landmark oracle failed");
                            self.session.fail(FailureCause::OracleUnavailable);
                            break LivenessOutcome::Failed(e.into());
                        }
                    };

                    let observed = match self.session.observe_frame(&self.pipeline, landmarks.as_ref()) {
                        Ok(observed) => observed,
                        Err(e) => break LivenessOutcome::Failed(e),
                    };
                    progress.frames += 1;
                    progress.face_present = observed.face_present;
                    progress.face_distance = observed.face.and_then(|m| m.distance);
                    if let Some(blink) = observed.blink {
                        progress.blink_count = blink.blink_count;
                    }
                    if observed.face.is_some_and(|m| m.matched) {
                        last_face_image = Some(frame.image);
                    }
                    if let Some(done) = self.fuse(&mut progress, &mut last_face_image) {
                        break done;
                    }
                }

                _ = head_tick.tick() => {
                    self.session.evaluate_head_movement(&self.pipeline);
                    progress.signals = self.session.signals();
                    progress.listening = listener.is_listening();
                    self.publish(&progress);
                }

                _ = sample.tick(), if pending.is_none() => {
                    match camera.capture() {
                        Ok(Some(frame)) => {
                            let oracle = Arc::clone(&self.oracle);
                            pending = Some(tokio::task::spawn_blocking(move || {
                                let detection = oracle.detect(&frame);
                                (frame, detection)
                            }));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "camera capture failed");
                            self.session.fail(FailureCause::CameraUnavailable);
                            break LivenessOutcome::Failed(e.into());
                        }
                    }
                }
            }
        };

        // Teardown runs on every exit path.
        listener.stop().await;
        camera.release();
        progress.listening = false;

        let outcome = match outcome {
            LivenessOutcome::Satisfied { snapshot } => match self.session.authenticate() {
                Ok(()) => LivenessOutcome::Satisfied { snapshot },
                Err(e) => {
                    self.session.fail(FailureCause::Internal);
                    LivenessOutcome::Failed(e)
                }
            },
            LivenessOutcome::Cancelled => {
                tracing::info!(session = %self.session.id(), "liveness attempt cancelled");
                self.session.close();
                LivenessOutcome::Cancelled
            }
            other => other,
        };

        progress.signals = self.session.signals();
        self.publish(&progress);
        (self.session, outcome)
    }

    /// Evaluate fusion on committed state and publish progress. Returns the
    /// outcome when fusion fires.
    fn fuse(
        &mut self,
        progress: &mut LivenessProgress,
        last_face_image: &mut Option<Vec<u8>>,
    ) -> Option<LivenessOutcome> {
        let decision = self.session.evaluate_fusion();
        progress.signals = self.session.signals();
        self.publish(progress);
        match decision {
            FusionDecision::Satisfied => Some(LivenessOutcome::Satisfied {
                snapshot: last_face_image.take().unwrap_or_default(),
            }),
            FusionDecision::Pending | FusionDecision::AlreadyFired => None,
        }
    }

    fn publish(&self, progress: &LivenessProgress) {
        self.progress.send_replace(progress.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::CameraError;
    use crate::session::tests::{descriptor, landmark_frame, liveness_session};
    use crate::session::Resume;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedCamera {
        released: Arc<AtomicUsize>,
        deny: bool,
    }

    impl Camera for ScriptedCamera {
        fn open(&mut self) -> Result<(), CameraError> {
            if self.deny {
                Err(CameraError::PermissionDenied)
            } else {
                Ok(())
            }
        }

        fn capture(&mut self) -> Result<Option<Frame>, CameraError> {
            Ok(Some(Frame::new(vec![0xAB; 4])))
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Replays a list of EAR values, then keeps returning `tail`.
    struct ScriptedOracle {
        script: Mutex<VecDeque<Result<Option<f32>, OracleError>>>,
        tail: Result<Option<f32>, OracleError>,
    }

    impl ScriptedOracle {
        fn new(
            script: impl IntoIterator<Item = Result<Option<f32>, OracleError>>,
            tail: Result<Option<f32>, OracleError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                tail,
            })
        }

        fn three_blinks() -> Arc<Self> {
            let blink = [0.30, 0.10, 0.10, 0.30, 0.30];
            Self::new(
                blink.iter().chain(&blink).chain(&blink).map(|e| Ok(Some(*e))),
                Ok(Some(0.30)),
            )
        }
    }

    impl LandmarkOracle for ScriptedOracle {
        fn detect(&self, _frame: &Frame) -> Result<Option<LandmarkFrame>, OracleError> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.tail.clone());
            next.map(|ear| ear.map(|ear| landmark_frame(ear, descriptor())))
        }
    }

    fn fast_config() -> LivenessConfig {
        LivenessConfig {
            tick_interval: Duration::from_millis(2),
            head_interval: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
            ..LivenessConfig::default()
        }
    }

    #[tokio::test]
    async fn test_blinks_and_spoken_code_authenticate() {
        let camera = ScriptedCamera::default();
        let released = camera.released.clone();
        let (speech_tx, speech_rx) = mpsc::channel(4);
        let root = CancellationToken::new();

        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(camera),
            ScriptedOracle::three_blinks(),
            Box::new(speech_rx),
            fast_config(),
            &root,
        );
        speech_tx.send("four eight two nine".into()).await.unwrap();

        let (session, outcome) = handle.finish().await.unwrap();
        assert_eq!(outcome, LivenessOutcome::Satisfied { snapshot: vec![0xAB; 4] });
        assert_eq!(session.phase(), Phase::Authenticated);
        assert_eq!(session.blink_state().blink_count(), 3);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_code_times_out() {
        let camera = ScriptedCamera::default();
        let released = camera.released.clone();
        let (speech_tx, speech_rx) = mpsc::channel(4);
        let config = LivenessConfig {
            attempt_timeout: Duration::from_millis(200),
            ..fast_config()
        };

        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(camera),
            ScriptedOracle::three_blinks(),
            Box::new(speech_rx),
            config,
            &CancellationToken::new(),
        );
        speech_tx.send("one two three four".into()).await.unwrap();

        let (session, outcome) = handle.finish().await.unwrap();
        assert_eq!(outcome, LivenessOutcome::TimedOut);
        assert_eq!(
            session.phase(),
            Phase::Failed {
                cause: FailureCause::LivenessTimeout,
                resume: Some(Resume::OtpPending)
            }
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_session_and_releases_camera() {
        let camera = ScriptedCamera::default();
        let released = camera.released.clone();
        let (_speech_tx, speech_rx) = mpsc::channel::<String>(4);
        let root = CancellationToken::new();

        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(camera),
            ScriptedOracle::new([], Ok(None)),
            Box::new(speech_rx),
            fast_config(),
            &root,
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        root.cancel();

        let (session, outcome) = handle.finish().await.unwrap();
        assert_eq!(outcome, LivenessOutcome::Cancelled);
        assert_eq!(session.phase(), Phase::Closed);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oracle_unavailable_fails_attempt() {
        let (_speech_tx, speech_rx) = mpsc::channel::<String>(4);
        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(ScriptedCamera::default()),
            ScriptedOracle::new(
                [Ok(Some(0.3))],
                Err(OracleError::Unavailable("model not loaded".into())),
            ),
            Box::new(speech_rx),
            fast_config(),
            &CancellationToken::new(),
        );

        let (session, outcome) = handle.finish().await.unwrap();
        assert!(matches!(outcome, LivenessOutcome::Failed(AuthError::TransientInfra(_))));
        assert!(matches!(
            session.phase(),
            Phase::Failed {
                cause: FailureCause::OracleUnavailable,
                resume: None
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_frames_are_skipped() {
        let (speech_tx, speech_rx) = mpsc::channel(4);
        let mut script: Vec<Result<Option<f32>, OracleError>> =
            vec![Err(OracleError::InvalidFrame("truncated jpeg".into())); 3];
        let blink = [0.30, 0.10, 0.10, 0.30, 0.30];
        script.extend(blink.iter().chain(&blink).chain(&blink).map(|e| Ok(Some(*e))));

        let handle = spawn_liveness(
            liveness_session("1234"),
            Box::new(ScriptedCamera::default()),
            ScriptedOracle::new(script, Ok(Some(0.30))),
            Box::new(speech_rx),
            fast_config(),
            &CancellationToken::new(),
        );
        speech_tx.send("1 2 3 4".into()).await.unwrap();

        let (_, outcome) = handle.finish().await.unwrap();
        assert!(matches!(outcome, LivenessOutcome::Satisfied { .. }));
    }

    #[tokio::test]
    async fn test_camera_denied_fails_without_release() {
        let camera = ScriptedCamera {
            deny: true,
            ..Default::default()
        };
        let released = camera.released.clone();
        let (_speech_tx, speech_rx) = mpsc::channel::<String>(4);

        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(camera),
            ScriptedOracle::new([], Ok(None)),
            Box::new(speech_rx),
            fast_config(),
            &CancellationToken::new(),
        );
        let (session, outcome) = handle.finish().await.unwrap();
        assert!(matches!(outcome, LivenessOutcome::Failed(AuthError::TransientInfra(_))));
        assert!(matches!(
            session.phase(),
            Phase::Failed {
                cause: FailureCause::CameraUnavailable,
                ..
            }
        ));
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_start_is_guarded() {
        let (_speech_tx, speech_rx) = mpsc::channel::<String>(4);
        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(ScriptedCamera::default()),
            ScriptedOracle::new([], Ok(None)),
            Box::new(speech_rx),
            fast_config(),
            &CancellationToken::new(),
        );

        // Already listening from attempt start.
        assert!(matches!(
            handle.start_listening().await,
            Err(AuthError::Validation(_))
        ));
        handle.stop_listening().await;
        assert!(!handle.progress().borrow().listening);
        assert!(handle.start_listening().await.is_ok());
        assert!(handle.progress().borrow().listening);

        handle.cancel();
        let (_, outcome) = handle.finish().await.unwrap();
        assert_eq!(outcome, LivenessOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_listener_restarts_after_recogniser_ends() {
        let (speech_tx, speech_rx) = mpsc::channel::<String>(4);
        drop(speech_tx);
        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(ScriptedCamera::default()),
            ScriptedOracle::new([], Ok(None)),
            Box::new(speech_rx),
            fast_config(),
            &CancellationToken::new(),
        );

        let mut progress = handle.progress();
        tokio::time::timeout(Duration::from_secs(2), progress.wait_for(|p| !p.listening))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.start_listening().await.is_ok());

        handle.cancel();
        let (_, outcome) = handle.finish().await.unwrap();
        assert_eq!(outcome, LivenessOutcome::Cancelled);
    }

    /// Yields one transcript, then waits forever. Counts every poll.
    struct OneTranscript {
        transcript: Option<String>,
        polls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SpeechOracle for OneTranscript {
        async fn next_transcript(&mut self) -> Option<String> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            match self.transcript.take() {
                Some(text) => Some(text),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_listener_released_once_code_is_heard() {
        let polls = Arc::new(AtomicUsize::new(0));
        let speech = OneTranscript {
            transcript: Some("four eight two nine".into()),
            polls: polls.clone(),
        };
        // Eyes stay open for a while so the code is heard long before the
        // blinks complete.
        let blink = [0.30, 0.10, 0.10, 0.30, 0.30];
        let script: Vec<Result<Option<f32>, OracleError>> = std::iter::repeat(0.30)
            .take(150)
            .chain(blink.iter().chain(&blink).chain(&blink).copied())
            .map(|e| Ok(Some(e)))
            .collect();

        let handle = spawn_liveness(
            liveness_session("4829"),
            Box::new(ScriptedCamera::default()),
            ScriptedOracle::new(script, Ok(Some(0.30))),
            Box::new(speech),
            fast_config(),
            &CancellationToken::new(),
        );

        let mut progress = handle.progress();
        tokio::time::timeout(
            Duration::from_secs(2),
            progress.wait_for(|p| p.signals.challenge_verified),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!progress.borrow().listening);
        assert!(!handle.is_finished());

        let polled = polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(polls.load(Ordering::SeqCst), polled);
        assert!(!handle.is_finished());
        assert!(!progress.borrow().listening);

        let (session, outcome) = handle.finish().await.unwrap();
        assert!(matches!(outcome, LivenessOutcome::Satisfied { .. }));
        assert_eq!(session.phase(), Phase::Authenticated);
    }

    #[tokio::test]
    async fn test_spawn_outside_liveness_is_rejected() {
        let (_speech_tx, speech_rx) = mpsc::channel::<String>(4);
        let handle = spawn_liveness(
            Session::new(),
            Box::new(ScriptedCamera::default()),
            ScriptedOracle::new([], Ok(None)),
            Box::new(speech_rx),
            fast_config(),
            &CancellationToken::new(),
        );
        let (session, outcome) = handle.finish().await.unwrap();
        assert!(matches!(
            outcome,
            LivenessOutcome::Failed(AuthError::InvalidTransition { .. })
        ));
        assert_eq!(session.phase(), Phase::Credentials);
    }
}
