mod diff;
mod lambda;
mod manifests;
mod run;
mod tool;

pub use diff::{DiffFlags, cmd_diff};
pub use lambda::cmd_lambda_validate;
pub use manifests::cmd_manifests;
pub use run::cmd_run;
pub use tool::cmd_tool_ensure;
