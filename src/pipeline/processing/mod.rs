// Pure processing stages: field mapping and quality gating

pub mod normalize;
pub mod quality_gate;
