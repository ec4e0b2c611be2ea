//! ProgBot core library
//!
//! Orchestration, device control, and provisioning for a pick/probe/program
//! fixture. Front ends build a [`Config`], wire controllers into a
//! [`Hardware`] set, and drive a [`ProgBot`].

pub mod board;
pub mod config;
pub mod controllers;
pub mod device;
pub mod events;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod process;
pub mod provisioning;
pub mod stats;
pub mod summary;
pub mod telemetry;
pub mod vision;

pub use board::{
    BoardInfo, BoardStatus, Outcome, ProbeStatus, ProgramStatus, ProvisionStatus, TestStatus,
    VisionStatus,
};
pub use config::{Config, ConfigError, OperationMode, PanelFile, Settings};
pub use controllers::{
    ControllerError, HeadControl, HeadController, MotionControl, MotionController,
    NrfutilProgrammer, PhaseSink, Programmer, TargetControl, TargetController,
};
pub use device::serial::SerialConnector;
pub use device::{DeviceConnector, DeviceError, LineDevice};
pub use events::{ChannelObserver, ErrorInfo, EventBus, ProgBotEvent, ProgBotObserver, TracingObserver};
pub use orchestrator::{CancelSignal, Hardware, ProgBot, ProgBotError, ProgBotResult};
pub use provisioning::{
    OnFail, ProvisionResult, ProvisionScript, ProvisionStep, ProvisioningEngine, StepResult,
    VariableContext,
};
pub use stats::CycleStats;
pub use summary::{CycleResultHandler, CycleSummary, ExportFormat, FileExportHandler};
pub use vision::{CommandCamera, QrCamera, ScanSettings, VisionController};
