pub mod client;
pub mod scheduler;
pub mod service;

pub use client::{CalibrationRequest, CalibrationResponse, CalibrationTransport, HttpTransport, RecalibrationError};
pub use scheduler::{CancelToken, ScheduledTask};
pub use service::{
    CalibrationRecord, CalibrationSample, CalibrationStatistics, NetworkStatus, RecalibrationService, SampleProvider,
    SampleSlot,
};
