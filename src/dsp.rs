//! Small DSP helpers used by the mixer: click tone rendering and VU peaks.
pub mod osc;
pub mod peak_meter;
