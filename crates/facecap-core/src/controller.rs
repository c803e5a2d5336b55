//! Window controller: capture session and external stages behind one activity state.
//!
//! The controller is UI-agnostic. A front-end calls [`Controller::tick`] on its
//! own schedule to drive the live display, forwards button presses to
//! [`Controller::start`], [`Controller::capture`] and [`Controller::run_stage`],
//! and renders widgets from [`Controller::controls`]. Everything runs on the
//! caller's thread except the external process itself.

use crate::config::Config;
use crate::session::{CaptureSession, SessionError};
use crate::stage::{self, Notifier, StageError, StageEvent, StageExit, StageSpec};
use facecap_hw::{Camera, CameraError, Frame, FrameError, FrameSource};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to save frame: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("busy: {0}")]
    Busy(String),
    #[error("no capture session in progress")]
    NotCapturing,
}

/// Opens the camera for a new session.
pub trait CameraProvider {
    type Source: FrameSource;
    fn open(&self) -> Result<Self::Source, CameraError>;
}

/// Opens a V4L2 device by path.
pub struct V4lCameraProvider {
    pub device: String,
}

impl CameraProvider for V4lCameraProvider {
    type Source = Camera;

    fn open(&self) -> Result<Camera, CameraError> {
        Camera::open(&self.device)
    }
}

/// What the controller is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Capturing,
    RunningStage(String),
}

/// Widget enablement derived from the current activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub directory_input: bool,
    pub start: bool,
    pub capture: bool,
    pub stages: bool,
    pub close: bool,
    pub loading: bool,
    pub show_video: bool,
}

/// Result of one display-loop poll.
pub enum Tick {
    /// No camera open.
    Idle,
    /// A frame to render.
    Frame(Frame),
    /// Read failed; keep polling.
    Skipped,
    /// Camera went away; the session ended and controls are back to idle.
    Stopped,
}

/// A saved capture.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub path: PathBuf,
    pub index: u32,
    /// Quota reached; the camera has been released.
    pub complete: bool,
}

/// A stage that has finished and been applied.
#[derive(Debug, Clone)]
pub struct StageCompletion {
    pub name: String,
    pub exit: StageExit,
    pub close_after: bool,
}

enum State<S> {
    Idle,
    Capturing { session: CaptureSession, camera: S },
    RunningStage { name: String },
}

pub struct Controller<P: CameraProvider> {
    provider: P,
    save_root: PathBuf,
    quota: u32,
    file_prefix: String,
    stages: Vec<StageSpec>,
    state: State<P::Source>,
    events_tx: mpsc::UnboundedSender<StageEvent>,
    events_rx: mpsc::UnboundedReceiver<StageEvent>,
    notifier: Option<Notifier>,
}

impl<P: CameraProvider> Controller<P> {
    pub fn new(config: &Config, provider: P) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            provider,
            save_root: config.save_root.clone(),
            quota: config.quota,
            file_prefix: config.file_prefix.clone(),
            stages: config.stages.clone(),
            state: State::Idle,
            events_tx,
            events_rx,
            notifier: None,
        }
    }

    /// Called from the stage worker after each event, e.g. to request a repaint.
    pub fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn activity(&self) -> Activity {
        match &self.state {
            State::Idle => Activity::Idle,
            State::Capturing { .. } => Activity::Capturing,
            State::RunningStage { name } => Activity::RunningStage(name.clone()),
        }
    }

    /// True while an external stage runs.
    pub fn is_busy(&self) -> bool {
        matches!(self.state, State::RunningStage { .. })
    }

    pub fn session_dir(&self) -> Option<&Path> {
        match &self.state {
            State::Capturing { session, .. } => Some(session.dir()),
            _ => None,
        }
    }

    /// Frames saved in the current session.
    pub fn saved_count(&self) -> Option<u32> {
        match &self.state {
            State::Capturing { session, .. } => Some(session.saved()),
            _ => None,
        }
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn controls(&self) -> Controls {
        match self.state {
            State::Idle => Controls {
                directory_input: true,
                start: true,
                capture: false,
                stages: true,
                close: true,
                loading: false,
                show_video: false,
            },
            State::Capturing { .. } => Controls {
                directory_input: false,
                start: false,
                capture: true,
                stages: false,
                close: true,
                loading: false,
                show_video: true,
            },
            State::RunningStage { .. } => Controls {
                directory_input: false,
                start: false,
                capture: false,
                stages: false,
                close: false,
                loading: true,
                show_video: false,
            },
        }
    }

    /// Begin a capture session in `<save_root>/<directory_name>` and open the camera.
    ///
    /// An empty name fails before anything touches the filesystem. If the camera
    /// cannot be opened the controller stays idle.
    pub fn start(&mut self, directory_name: &str) -> Result<(), ControllerError> {
        match &self.state {
            State::Idle => {}
            State::Capturing { .. } => {
                return Err(ControllerError::Busy("capture already in progress".into()))
            }
            State::RunningStage { name } => {
                return Err(ControllerError::Busy(format!("stage {name} is running")))
            }
        }

        let session =
            CaptureSession::begin(&self.save_root, directory_name, self.quota, &self.file_prefix)?;
        let camera = self.provider.open()?;

        self.state = State::Capturing { session, camera };
        Ok(())
    }

    /// One display-loop poll: read a frame for rendering.
    pub fn tick(&mut self) -> Tick {
        let State::Capturing { camera, .. } = &mut self.state else {
            return Tick::Idle;
        };

        if !camera.is_open() {
            self.end_session("camera closed");
            return Tick::Stopped;
        }

        match camera.read_frame() {
            Ok(frame) => Tick::Frame(frame),
            Err(e) if !camera.is_open() || matches!(e, CameraError::Disconnected) => {
                tracing::warn!(error = %e, "display loop stopping");
                self.end_session("camera closed");
                Tick::Stopped
            }
            Err(e) => {
                tracing::debug!(error = %e, "frame read failed, skipping");
                Tick::Skipped
            }
        }
    }

    /// Read one frame and save it as the next numbered image.
    ///
    /// A failed read or write leaves the counter where it was. Reaching the
    /// quota releases the camera and returns the controller to idle.
    pub fn capture(&mut self) -> Result<CaptureOutcome, ControllerError> {
        let State::Capturing { session, camera } = &mut self.state else {
            return Err(ControllerError::NotCapturing);
        };

        let frame = match camera.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                if !camera.is_open() {
                    self.end_session("camera closed");
                }
                return Err(e.into());
            }
        };

        let path = session.next_path();
        let index = session.next_index();
        if frame.is_dark() {
            tracing::warn!(index, "captured frame is mostly dark");
        }
        frame.save_jpeg(&path)?;
        session.advance();

        tracing::info!(path = %path.display(), index, quota = session.quota(), "saved capture");

        let complete = session.is_complete();
        if complete {
            self.end_session("quota reached");
        }

        Ok(CaptureOutcome {
            path,
            index,
            complete,
        })
    }

    /// Launch the named stage on a worker thread.
    ///
    /// Refused while a stage is already running or a capture is in progress.
    pub fn run_stage(&mut self, name: &str) -> Result<(), ControllerError> {
        match &self.state {
            State::Idle => {}
            State::Capturing { .. } => {
                return Err(ControllerError::Busy("capture in progress".into()))
            }
            State::RunningStage { name: running } => {
                return Err(ControllerError::Busy(format!("stage {running} is running")))
            }
        }

        let spec = stage::find_stage(&self.stages, name)
            .ok_or_else(|| StageError::Unknown(name.to_string()))?;

        stage::spawn_stage(spec, self.events_tx.clone(), self.notifier.clone())?;

        self.state = State::RunningStage {
            name: spec.name.clone(),
        };
        Ok(())
    }

    /// Apply any queued stage events without blocking.
    pub fn poll_stage_events(&mut self) -> Option<StageCompletion> {
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(done) = self.apply_event(event) {
                return Some(done);
            }
        }
        None
    }

    /// Block until the running stage finishes. Returns `None` when no stage is running.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait_for_stage(&mut self) -> Option<StageCompletion> {
        while self.is_busy() {
            let event = self.events_rx.blocking_recv()?;
            if let Some(done) = self.apply_event(event) {
                return Some(done);
            }
        }
        None
    }

    /// Release the camera ahead of exit.
    pub fn shutdown(&mut self) {
        match &self.state {
            State::Capturing { .. } => self.end_session("shutdown"),
            State::RunningStage { name } => {
                tracing::warn!(stage = %name, "shutting down with stage still running");
            }
            State::Idle => {}
        }
    }

    fn apply_event(&mut self, event: StageEvent) -> Option<StageCompletion> {
        match event {
            StageEvent::Started { name, pid } => {
                tracing::debug!(stage = %name, pid, "stage process started");
                None
            }
            StageEvent::Finished { name, exit } => {
                let finished_running = matches!(
                    &self.state,
                    State::RunningStage { name: running } if *running == name
                );
                if finished_running {
                    self.state = State::Idle;
                }
                let close_after =
                    stage::find_stage(&self.stages, &name).is_some_and(|s| s.close_after);
                Some(StageCompletion {
                    name,
                    exit,
                    close_after,
                })
            }
        }
    }

    fn end_session(&mut self, reason: &str) {
        if let State::Capturing {
            session,
            mut camera,
        } = std::mem::replace(&mut self.state, State::Idle)
        {
            camera.release();
            tracing::info!(
                dir = %session.dir().display(),
                saved = session.saved(),
                reason,
                "capture session ended"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Copy)]
    enum Read {
        Ok,
        Fail,
        Disconnect,
    }

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        released: AtomicUsize,
        reads_after_release: AtomicUsize,
    }

    struct FakeCamera {
        plan: VecDeque<Read>,
        open: bool,
        counters: Arc<Counters>,
        sequence: u32,
    }

    impl FrameSource for FakeCamera {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            if !self.open {
                self.counters.reads_after_release.fetch_add(1, Ordering::SeqCst);
                return Err(CameraError::Closed);
            }
            match self.plan.pop_front().unwrap_or(Read::Ok) {
                Read::Ok => {
                    self.sequence += 1;
                    Ok(Frame::from_rgb(vec![128; 8 * 6 * 3], 8, 6, self.sequence).unwrap())
                }
                Read::Fail => Err(CameraError::CaptureFailed("timeout".into())),
                Read::Disconnect => {
                    self.release();
                    Err(CameraError::Disconnected)
                }
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn release(&mut self) {
            if self.open {
                self.open = false;
                self.counters.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct FakeProvider {
        plan: Vec<Read>,
        fail_open: bool,
        counters: Arc<Counters>,
    }

    impl CameraProvider for FakeProvider {
        type Source = FakeCamera;

        fn open(&self) -> Result<FakeCamera, CameraError> {
            if self.fail_open {
                return Err(CameraError::DeviceNotFound("/dev/video9".into()));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeCamera {
                plan: self.plan.iter().copied().collect(),
                open: true,
                counters: self.counters.clone(),
                sequence: 0,
            })
        }
    }

    fn config(root: &Path) -> Config {
        Config {
            save_root: root.to_path_buf(),
            stages: vec![
                StageSpec {
                    name: "encode".into(),
                    label: "Encode".into(),
                    command: vec!["sh".into(), "-c".into(), "sleep 0.3".into()],
                    close_after: false,
                },
                StageSpec {
                    name: "recognize".into(),
                    label: "Recognize".into(),
                    command: vec!["sh".into(), "-c".into(), "exit 4".into()],
                    close_after: true,
                },
                StageSpec {
                    name: "missing".into(),
                    label: "Missing".into(),
                    command: vec!["/nonexistent/facecap-stage".into()],
                    close_after: false,
                },
            ],
            ..Config::default()
        }
    }

    fn controller(root: &Path, plan: Vec<Read>) -> (Controller<FakeProvider>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let provider = FakeProvider {
            plan,
            fail_open: false,
            counters: counters.clone(),
        };
        (Controller::new(&config(root), provider), counters)
    }

    fn jpgs(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_initial_controls() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctl, _) = controller(tmp.path(), vec![]);
        let controls = ctl.controls();
        assert!(controls.directory_input && controls.start && controls.stages && controls.close);
        assert!(!controls.capture && !controls.loading && !controls.show_video);
        assert_eq!(ctl.activity(), Activity::Idle);
    }

    #[test]
    fn test_full_session_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, counters) = controller(tmp.path(), vec![]);

        ctl.start("people/alice").unwrap();
        let controls = ctl.controls();
        assert!(!controls.directory_input && controls.capture && controls.show_video);

        for n in 1..=10 {
            let outcome = ctl.capture().unwrap();
            assert_eq!(outcome.index, n);
            assert_eq!(outcome.complete, n == 10);
        }

        let dir = tmp.path().join("people/alice");
        let mut expected: Vec<String> =
            (1..=10).map(|n| format!("captured_image_{n}.jpg")).collect();
        expected.sort();
        assert_eq!(jpgs(&dir), expected);

        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.activity(), Activity::Idle);
        let controls = ctl.controls();
        assert!(controls.directory_input && controls.start);
        assert!(!controls.capture && !controls.show_video);
    }

    #[test]
    fn test_camera_not_read_after_quota() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, counters) = controller(tmp.path(), vec![]);

        ctl.start("bob").unwrap();
        for _ in 0..10 {
            ctl.capture().unwrap();
        }

        assert!(matches!(ctl.capture(), Err(ControllerError::NotCapturing)));
        assert!(matches!(ctl.tick(), Tick::Idle));
        assert_eq!(counters.reads_after_release.load(Ordering::SeqCst), 0);
        assert_eq!(jpgs(&tmp.path().join("bob")).len(), 10);
    }

    #[test]
    fn test_empty_name_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("faces");
        let counters = Arc::new(Counters::default());
        let provider = FakeProvider {
            plan: vec![],
            fail_open: false,
            counters: counters.clone(),
        };
        let mut ctl = Controller::new(&config(&root), provider);

        for name in ["", "   "] {
            let err = ctl.start(name).unwrap_err();
            assert!(matches!(err, ControllerError::Session(SessionError::EmptyName)));
        }

        assert!(!root.exists());
        assert!(!ctl.controls().capture);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_camera_open_failure_stays_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = FakeProvider {
            plan: vec![],
            fail_open: true,
            counters: Arc::default(),
        };
        let mut ctl = Controller::new(&config(tmp.path()), provider);

        assert!(matches!(ctl.start("carol"), Err(ControllerError::Camera(_))));
        assert_eq!(ctl.activity(), Activity::Idle);
        assert!(!ctl.controls().capture);
    }

    #[test]
    fn test_failed_read_does_not_advance_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![Read::Fail]);

        ctl.start("dave").unwrap();
        assert!(matches!(ctl.capture(), Err(ControllerError::Camera(_))));
        assert_eq!(ctl.saved_count(), Some(0));

        let outcome = ctl.capture().unwrap();
        assert_eq!(outcome.index, 1);
        assert!(outcome.path.ends_with("dave/captured_image_1.jpg"));
    }

    #[test]
    fn test_failed_write_does_not_advance_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);

        ctl.start("zed").unwrap();
        let dir = tmp.path().join("zed");
        std::fs::remove_dir_all(&dir).unwrap();

        assert!(matches!(ctl.capture(), Err(ControllerError::Frame(_))));
        assert_eq!(ctl.saved_count(), Some(0));
        assert_eq!(ctl.activity(), Activity::Capturing);

        std::fs::create_dir_all(&dir).unwrap();
        let outcome = ctl.capture().unwrap();
        assert_eq!(outcome.index, 1);
        assert!(dir.join("captured_image_1.jpg").is_file());
    }

    #[test]
    fn test_tick_skips_failed_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![Read::Fail, Read::Ok]);

        assert!(matches!(ctl.tick(), Tick::Idle));
        ctl.start("erin").unwrap();
        assert!(matches!(ctl.tick(), Tick::Skipped));
        match ctl.tick() {
            Tick::Frame(frame) => assert_eq!((frame.width, frame.height), (8, 6)),
            _ => panic!("expected a frame"),
        }
        assert_eq!(ctl.activity(), Activity::Capturing);
    }

    #[test]
    fn test_tick_stops_on_disconnect() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, counters) = controller(tmp.path(), vec![Read::Ok, Read::Disconnect]);

        ctl.start("frank").unwrap();
        assert!(matches!(ctl.tick(), Tick::Frame(_)));
        assert!(matches!(ctl.tick(), Tick::Stopped));

        assert_eq!(ctl.activity(), Activity::Idle);
        assert!(ctl.controls().directory_input);
        assert!(!ctl.controls().capture);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_session_restarts_numbering() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);

        ctl.start("gina").unwrap();
        for _ in 0..10 {
            ctl.capture().unwrap();
        }
        ctl.start("hank").unwrap();
        assert_eq!(ctl.capture().unwrap().index, 1);
        assert_eq!(ctl.session_dir(), Some(tmp.path().join("hank").as_path()));
    }

    #[test]
    fn test_shutdown_releases_camera() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, counters) = controller(tmp.path(), vec![]);

        ctl.start("ivy").unwrap();
        ctl.capture().unwrap();
        ctl.shutdown();

        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.activity(), Activity::Idle);
    }

    #[test]
    fn test_stage_refused_while_capturing() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);

        ctl.start("jack").unwrap();
        assert!(matches!(ctl.run_stage("encode"), Err(ControllerError::Busy(_))));
        assert_eq!(ctl.activity(), Activity::Capturing);
    }

    #[test]
    fn test_unknown_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);

        assert!(matches!(
            ctl.run_stage("train"),
            Err(ControllerError::Stage(StageError::Unknown(_)))
        ));
        assert_eq!(ctl.activity(), Activity::Idle);
    }

    #[cfg(unix)]
    #[test]
    fn test_busy_stage_blocks_other_triggers() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, counters) = controller(tmp.path(), vec![]);

        ctl.run_stage("encode").unwrap();
        assert!(ctl.is_busy());
        let controls = ctl.controls();
        assert!(controls.loading);
        assert!(!controls.stages && !controls.start);
        assert!(!controls.close && !controls.directory_input);

        assert!(matches!(ctl.run_stage("encode"), Err(ControllerError::Busy(_))));
        assert!(matches!(ctl.run_stage("recognize"), Err(ControllerError::Busy(_))));
        assert!(matches!(ctl.start("kate"), Err(ControllerError::Busy(_))));
        assert!(!tmp.path().join("kate").exists());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 0);

        let done = ctl.wait_for_stage().unwrap();
        assert_eq!(done.name, "encode");
        assert_eq!(done.exit, StageExit::Success);
        assert!(!done.close_after);
        assert_eq!(ctl.controls(), controller(tmp.path(), vec![]).0.controls());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_stage_still_restores_controls() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);

        ctl.run_stage("recognize").unwrap();
        let done = ctl.wait_for_stage().unwrap();
        assert_eq!(done.exit, StageExit::Failed(Some(4)));
        assert!(done.close_after);
        assert_eq!(ctl.activity(), Activity::Idle);
        assert!(ctl.controls().stages);
    }

    #[test]
    fn test_missing_program_restores_controls() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);

        ctl.run_stage("missing").unwrap();
        let done = ctl.wait_for_stage().unwrap();
        assert!(matches!(done.exit, StageExit::SpawnFailed(_)));
        assert!(!ctl.is_busy());
    }

    #[cfg(unix)]
    #[test]
    fn test_poll_stage_events_is_non_blocking() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);

        ctl.run_stage("encode").unwrap();
        assert!(ctl.poll_stage_events().is_none());
        assert!(ctl.is_busy());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        let done = loop {
            if let Some(done) = ctl.poll_stage_events() {
                break done;
            }
            assert!(std::time::Instant::now() < deadline, "stage never finished");
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert_eq!(done.name, "encode");
        assert!(!ctl.is_busy());
    }

    #[test]
    fn test_wait_without_stage_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _) = controller(tmp.path(), vec![]);
        assert!(ctl.wait_for_stage().is_none());
    }
}
