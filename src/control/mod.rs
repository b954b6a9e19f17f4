mod service;

pub use service::{ControlService, DeviceStates};
