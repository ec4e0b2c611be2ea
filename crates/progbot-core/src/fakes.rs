//! In-memory fakes for the hardware seams (testing and dry runs).
//!
//! Every fake is `Clone` with shared state: hand one clone to the
//! orchestrator as an `Arc<dyn ...>` and keep another for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::controllers::{
    ControllerError, ControllerResult, HeadControl, MotionControl, PhaseSink, Position,
    Programmer, TargetControl,
};
use crate::device::{DeviceError, LineDevice};
use crate::events::{ProgBotEvent, ProgBotObserver};
use crate::provisioning::{ProvisionResult, ProvisionScript, ProvisioningEngine, VariableContext};
use crate::vision::{Frame, QrCamera, Symbology, VisionResult};

pub use crate::device::fakes::{FakeConnector, FakeLineDevice};

// ---------------------------------------------------------------------------
// RecordingMotion
// ---------------------------------------------------------------------------

/// A call made on [`RecordingMotion`].
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCall {
    Connect,
    Init { homing: bool },
    MotorsOff,
    RapidXyAbs(f64, f64),
    RapidXyRel(f64, f64),
    RapidZAbs(f64),
    MoveZAbs(f64, f64),
    Probe,
    GetPosition,
    Disconnect,
}

struct MotionState {
    calls: Vec<MotionCall>,
    position: Position,
    probe_results: VecDeque<Option<f64>>,
    default_probe: f64,
    fail_xy: bool,
}

/// Motion stage that records calls and tracks position.
#[derive(Clone)]
pub struct RecordingMotion {
    state: Arc<Mutex<MotionState>>,
}

impl Default for RecordingMotion {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingMotion {
    /// Probes report 10 mm.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MotionState {
                calls: Vec::new(),
                position: Position {
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                },
                probe_results: VecDeque::new(),
                default_probe: 10.0,
                fail_xy: false,
            })),
        }
    }

    pub fn with_probe_distance(self, distance: f64) -> Self {
        self.state.lock().unwrap().default_probe = distance;
        self
    }

    /// Make the next probe fail.
    pub fn push_probe_failure(&self) {
        self.state.lock().unwrap().probe_results.push_back(None);
    }

    /// Queue a distance for the next probe.
    pub fn push_probe_distance(&self, distance: f64) {
        self.state
            .lock()
            .unwrap()
            .probe_results
            .push_back(Some(distance));
    }

    /// Make every XY move fail from now on.
    pub fn fail_xy_moves(&self, fail: bool) {
        self.state.lock().unwrap().fail_xy = fail;
    }

    pub fn calls(&self) -> Vec<MotionCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn position(&self) -> Position {
        self.state.lock().unwrap().position
    }

    fn record(&self, call: MotionCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn xy(&self, call: MotionCall) -> ControllerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.clone());
        if state.fail_xy {
            return Err(DeviceError::Closed {
                port: "fake-motion".into(),
            }
            .into());
        }
        match call {
            MotionCall::RapidXyAbs(x, y) => {
                state.position.x = x;
                state.position.y = y;
            }
            MotionCall::RapidXyRel(dx, dy) => {
                state.position.x += dx;
                state.position.y += dy;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl MotionControl for RecordingMotion {
    async fn connect(&self) -> ControllerResult<()> {
        self.record(MotionCall::Connect);
        Ok(())
    }

    async fn init(&self, homing: bool) -> ControllerResult<()> {
        self.record(MotionCall::Init { homing });
        Ok(())
    }

    async fn motors_off(&self) -> ControllerResult<()> {
        self.record(MotionCall::MotorsOff);
        Ok(())
    }

    async fn rapid_xy_abs(&self, x: f64, y: f64) -> ControllerResult<()> {
        self.xy(MotionCall::RapidXyAbs(x, y))
    }

    async fn rapid_xy_rel(&self, dx: f64, dy: f64) -> ControllerResult<()> {
        self.xy(MotionCall::RapidXyRel(dx, dy))
    }

    async fn rapid_z_abs(&self, z: f64) -> ControllerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MotionCall::RapidZAbs(z));
        state.position.z = z;
        Ok(())
    }

    async fn move_z_abs(&self, z: f64, feed_rate: f64) -> ControllerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MotionCall::MoveZAbs(z, feed_rate));
        state.position.z = z;
        Ok(())
    }

    async fn do_probe(&self) -> ControllerResult<f64> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MotionCall::Probe);
        let default = state.default_probe;
        match state.probe_results.pop_front() {
            Some(Some(distance)) => Ok(distance),
            Some(None) => Err(ControllerError::ProbeTimeout { timeout_ms: 15_000 }),
            None => Ok(default),
        }
    }

    async fn get_position(&self) -> ControllerResult<Position> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MotionCall::GetPosition);
        Ok(state.position)
    }

    async fn disconnect(&self) {
        self.record(MotionCall::Disconnect);
    }
}

// ---------------------------------------------------------------------------
// ScriptedHead
// ---------------------------------------------------------------------------

/// A call made on [`ScriptedHead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadCall {
    Connect,
    CheckContact,
    SetPower(bool),
    SetLogic(bool),
    SetAll(bool),
    Disconnect,
}

struct HeadState {
    calls: Vec<HeadCall>,
    contacts: VecDeque<bool>,
    /// Once the script runs out: alternate no-contact/contact per check.
    alternate: Option<bool>,
}

/// Programmer head answering contact checks from a script.
#[derive(Clone)]
pub struct ScriptedHead {
    state: Arc<Mutex<HeadState>>,
}

impl ScriptedHead {
    /// Contact checks pop `contacts` in order, then report `false`.
    pub fn new(contacts: impl IntoIterator<Item = bool>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HeadState {
                calls: Vec::new(),
                contacts: contacts.into_iter().collect(),
                alternate: None,
            })),
        }
    }

    /// A head that lands cleanly on every board: no contact at safe height,
    /// contact after the descent.
    pub fn landing() -> Self {
        let head = Self::new([]);
        head.state.lock().unwrap().alternate = Some(false);
        head
    }

    /// Queue answers ahead of the landing pattern.
    pub fn push_contacts(&self, contacts: impl IntoIterator<Item = bool>) {
        self.state.lock().unwrap().contacts.extend(contacts);
    }

    pub fn calls(&self) -> Vec<HeadCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: HeadCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl HeadControl for ScriptedHead {
    async fn connect(&self) -> ControllerResult<()> {
        self.record(HeadCall::Connect);
        Ok(())
    }

    async fn check_contact(&self) -> ControllerResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(HeadCall::CheckContact);
        if let Some(contact) = state.contacts.pop_front() {
            return Ok(contact);
        }
        match state.alternate {
            Some(next) => {
                state.alternate = Some(!next);
                Ok(next)
            }
            None => Ok(false),
        }
    }

    async fn set_power(&self, enable: bool) -> ControllerResult<()> {
        self.record(HeadCall::SetPower(enable));
        Ok(())
    }

    async fn set_logic(&self, enable: bool) -> ControllerResult<()> {
        self.record(HeadCall::SetLogic(enable));
        Ok(())
    }

    async fn set_all(&self, enable: bool) -> ControllerResult<()> {
        self.record(HeadCall::SetAll(enable));
        Ok(())
    }

    async fn disconnect(&self) {
        self.record(HeadCall::Disconnect);
    }
}

// ---------------------------------------------------------------------------
// RecordingTarget
// ---------------------------------------------------------------------------

/// A call made on [`RecordingTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCall {
    Connect,
    Test,
    Monitor,
    Provision(String),
    Disconnect,
}

struct TargetState {
    calls: Vec<TargetCall>,
    test_result: bool,
}

/// Target console. Provisioning runs the real engine over a
/// [`FakeLineDevice`]; the test verb answers a fixed result.
#[derive(Clone)]
pub struct RecordingTarget {
    state: Arc<Mutex<TargetState>>,
    device: FakeLineDevice,
}

impl RecordingTarget {
    pub fn new(device: FakeLineDevice) -> Self {
        Self {
            state: Arc::new(Mutex::new(TargetState {
                calls: Vec::new(),
                test_result: true,
            })),
            device,
        }
    }

    /// A target whose console never answers.
    pub fn silent() -> Self {
        Self::new(FakeLineDevice::new("fake-target"))
    }

    pub fn set_test_result(&self, passed: bool) {
        self.state.lock().unwrap().test_result = passed;
    }

    pub fn calls(&self) -> Vec<TargetCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn device(&self) -> &FakeLineDevice {
        &self.device
    }

    fn record(&self, call: TargetCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl TargetControl for RecordingTarget {
    async fn connect(&self) -> ControllerResult<()> {
        self.record(TargetCall::Connect);
        Ok(())
    }

    async fn test(&self) -> ControllerResult<bool> {
        self.record(TargetCall::Test);
        Ok(self.state.lock().unwrap().test_result)
    }

    async fn monitor(&self) -> ControllerResult<()> {
        self.record(TargetCall::Monitor);
        std::future::pending().await
    }

    async fn provision(
        &self,
        script: &ProvisionScript,
        context: &mut VariableContext,
    ) -> ControllerResult<ProvisionResult> {
        self.record(TargetCall::Provision(script.name.clone()));
        let mut device = self.device.clone();
        let engine = ProvisioningEngine::new();
        Ok(engine
            .execute(script, &mut device as &mut dyn LineDevice, context)
            .await)
    }

    async fn disconnect(&self) {
        self.record(TargetCall::Disconnect);
    }
}

// ---------------------------------------------------------------------------
// FakeProgrammer
// ---------------------------------------------------------------------------

/// Outcome a [`FakeProgrammer`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOutcome {
    Succeed,
    /// The tool ran and reported failure.
    Fail,
    /// The tool could not be driven at all.
    Error(String),
}

struct ProgrammerState {
    identify: FakeOutcome,
    program: FakeOutcome,
    duration: Duration,
    identify_calls: usize,
    program_calls: usize,
}

/// Programmer with scripted outcomes and an optional run time.
#[derive(Clone)]
pub struct FakeProgrammer {
    state: Arc<Mutex<ProgrammerState>>,
}

impl Default for FakeProgrammer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProgrammer {
    /// Succeeds immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProgrammerState {
                identify: FakeOutcome::Succeed,
                program: FakeOutcome::Succeed,
                duration: Duration::ZERO,
                identify_calls: 0,
                program_calls: 0,
            })),
        }
    }

    pub fn set_program(&self, outcome: FakeOutcome) {
        self.state.lock().unwrap().program = outcome;
    }

    pub fn set_identify(&self, outcome: FakeOutcome) {
        self.state.lock().unwrap().identify = outcome;
    }

    /// Time each call takes.
    pub fn set_duration(&self, duration: Duration) {
        self.state.lock().unwrap().duration = duration;
    }

    pub fn identify_calls(&self) -> usize {
        self.state.lock().unwrap().identify_calls
    }

    pub fn program_calls(&self) -> usize {
        self.state.lock().unwrap().program_calls
    }

    async fn run(&self, phases: &dyn PhaseSink, program: bool) -> ControllerResult<bool> {
        let (outcome, duration) = {
            let mut state = self.state.lock().unwrap();
            if program {
                state.program_calls += 1;
                (state.program.clone(), state.duration)
            } else {
                state.identify_calls += 1;
                (state.identify.clone(), state.duration)
            }
        };
        phases.phase(if program { "Flash main image" } else { "Identify" });
        tokio::time::sleep(duration).await;
        match outcome {
            FakeOutcome::Succeed => Ok(true),
            FakeOutcome::Fail => Ok(false),
            FakeOutcome::Error(reason) => Err(ControllerError::Programmer {
                command: if program { "program" } else { "identify" }.into(),
                reason,
            }),
        }
    }
}

#[async_trait]
impl Programmer for FakeProgrammer {
    async fn identify(&self, phases: &dyn PhaseSink) -> ControllerResult<bool> {
        self.run(phases, false).await
    }

    async fn program(&self, phases: &dyn PhaseSink) -> ControllerResult<bool> {
        self.run(phases, true).await
    }
}

// ---------------------------------------------------------------------------
// FakeCamera
// ---------------------------------------------------------------------------

struct CameraState {
    script: VecDeque<Option<String>>,
    captures: usize,
    drains: usize,
    preview_stops: usize,
}

/// Camera whose captures pop a script. `Some(text)` yields a frame that
/// decodes as standard QR to `text`; `None`, or an exhausted script, yields
/// a frame with no code in it.
#[derive(Clone)]
pub struct FakeCamera {
    state: Arc<Mutex<CameraState>>,
}

impl FakeCamera {
    pub fn new(script: Vec<Option<&str>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CameraState {
                script: script.into_iter().map(|s| s.map(str::to_string)).collect(),
                captures: 0,
                drains: 0,
                preview_stops: 0,
            })),
        }
    }

    pub fn captures(&self) -> usize {
        self.state.lock().unwrap().captures
    }

    pub fn drains(&self) -> usize {
        self.state.lock().unwrap().drains
    }

    pub fn preview_stops(&self) -> usize {
        self.state.lock().unwrap().preview_stops
    }
}

#[async_trait]
impl QrCamera for FakeCamera {
    async fn capture_frame(&self) -> VisionResult<Option<Frame>> {
        let mut state = self.state.lock().unwrap();
        state.captures += 1;
        let bytes = state
            .script
            .pop_front()
            .flatten()
            .map(String::into_bytes)
            .unwrap_or_default();
        Ok(Some(Frame { bytes }))
    }

    async fn detect(&self, frame: &Frame, symbology: Symbology) -> VisionResult<Option<String>> {
        if symbology != Symbology::Standard || frame.bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&frame.bytes).into_owned()))
    }

    async fn drain_buffer(&self) {
        self.state.lock().unwrap().drains += 1;
    }

    async fn stop_preview(&self) {
        self.state.lock().unwrap().preview_stops += 1;
    }
}

// ---------------------------------------------------------------------------
// RecordingObserver
// ---------------------------------------------------------------------------

/// Keeps every event it sees.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ProgBotEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgBotEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn phases(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgBotEvent::PhaseChanged { phase } => Some(phase),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<crate::events::ErrorInfo> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgBotEvent::ErrorOccurred(info) => Some(info),
                _ => None,
            })
            .collect()
    }
}

impl ProgBotObserver for RecordingObserver {
    fn notify(&self, event: &ProgBotEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
