//! Process metrics.
//!
//! Only recording happens here; exporting is left to the host process.

use std::sync::Once;

use metrics::{Unit, counter, describe_counter};

static REGISTER_METRICS: Once = Once::new();

pub const TOOL_CALLS_TOTAL: &str = "piped_tool_calls_total";
pub const TOOL: &str = "tool";
pub const VERSION: &str = "version";
pub const VERB: &str = "verb";
pub const SUCCESS: &str = "success";

pub const STAGE_EXECUTIONS_TOTAL: &str = "piped_stage_executions_total";
pub const STAGE: &str = "stage";
pub const STATUS: &str = "status";

/// Register metric descriptions. Safe to call more than once.
pub fn register_metrics() {
  REGISTER_METRICS.call_once(|| {
    describe_counter!(
      TOOL_CALLS_TOTAL,
      Unit::Count,
      "Number of external tool invocations by tool, version, verb and outcome"
    );
    describe_counter!(
      STAGE_EXECUTIONS_TOTAL,
      Unit::Count,
      "Number of deployment stages run by stage name and final status"
    );
  });
}

/// Count one invocation of an external tool.
pub fn record_tool_call(tool: &str, version: &str, verb: &str, success: bool) {
  register_metrics();
  counter!(
    TOOL_CALLS_TOTAL,
    TOOL => tool.to_string(),
    VERSION => version.to_string(),
    VERB => verb.to_string(),
    SUCCESS => success.to_string()
  )
  .increment(1);
}

/// Count one finished deployment stage.
pub fn record_stage_execution(stage: &str, status: &str) {
  register_metrics();
  counter!(STAGE_EXECUTIONS_TOTAL, STAGE => stage.to_string(), STATUS => status.to_string()).increment(1);
}
