pub mod calibrate;
pub mod classify;

pub use calibrate::{CalibrationTargets, Calibrator, CalibratorSettings, IkRig, CALIBRATION_PASSES};
pub use classify::{classify, Role, RoleAssignment, TrackerSet};
