mod common;
mod diff_tests;
mod lambda_tests;
mod manifests_tests;
mod tool_tests;
