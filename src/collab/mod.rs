//! 协作方：规划器与诊断器（编排器只通过 trait 使用）

pub mod healer;
pub mod parse;
pub mod planner;

pub use healer::{DiagnosisRequest, Healer, LlmHealer};
pub use parse::{extract_json, parse_json};
pub use planner::{AttemptContext, CallPlanner, LlmPlanner, StepPlanner};
