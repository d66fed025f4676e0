//! Tool command integration tests.

use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn ensure_returns_preinstalled_binary() {
  let env = TestEnv::new();
  let tools = env.tools_path();
  std::fs::write(tools.join("helm-3.8.2"), "#!/bin/sh\n").unwrap();

  env
    .piped_cmd()
    .args(["tool", "ensure", "helm", "3.8.2", "--tools-dir"])
    .arg(&tools)
    .assert()
    .success()
    .stdout(predicate::str::contains(tools.join("helm-3.8.2").display().to_string()))
    .stdout(predicate::str::contains("Installed").not());
}

#[test]
fn ensure_default_version_uses_bare_name() {
  let env = TestEnv::new();
  let tools = env.tools_path();
  std::fs::write(tools.join("kubectl"), "#!/bin/sh\n").unwrap();

  env
    .piped_cmd()
    .args(["tool", "ensure", "kubectl", "--tools-dir"])
    .arg(&tools)
    .assert()
    .success()
    .stdout(predicate::str::contains(tools.join("kubectl").display().to_string()));
}
