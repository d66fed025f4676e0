//! Diff command integration tests.

use predicates::prelude::*;

use super::common::{TestEnv, config_map, deployment};

#[test]
fn diff_reports_changed_replicas() {
  let env = TestEnv::new();
  let old = env.write_file("old.yaml", &deployment("web", 2, "web:v1"));
  let new = env.write_file("new.yaml", &deployment("web", 3, "web:v1"));

  env
    .piped_cmd()
    .arg("diff")
    .arg(&old)
    .arg(&new)
    .assert()
    .success()
    .stdout(predicate::str::contains("0 added, 0 deleted, 1 changed"))
    .stdout(predicate::str::contains("replicas"));
}

#[test]
fn diff_reports_added_and_deleted_resources() {
  let env = TestEnv::new();
  let old = env.write_file("old.yaml", &config_map("legacy", "a"));
  let new = env.write_file("new.yaml", &config_map("fresh", "a"));

  env
    .piped_cmd()
    .arg("diff")
    .arg(&old)
    .arg(&new)
    .assert()
    .success()
    .stdout(predicate::str::contains("1 added, 1 deleted, 0 changed"));
}

#[test]
fn diff_json_output_lists_change_paths() {
  let env = TestEnv::new();
  let old = env.write_file("old.yaml", &deployment("web", 2, "web:v1"));
  let new = env.write_file("new.yaml", &deployment("web", 2, "web:v2"));

  let output = env
    .piped_cmd()
    .args(["diff", "--output", "json"])
    .arg(&old)
    .arg(&new)
    .output()
    .unwrap();
  assert!(output.status.success());

  let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(json["added"], serde_json::json!([]));
  assert_eq!(json["deleted"], serde_json::json!([]));
  let changed = json["changed"].as_array().unwrap();
  assert_eq!(changed.len(), 1);
  assert_eq!(changed[0]["key"], "apps/v1:Deployment:default:web");
  assert_eq!(changed[0]["diffs"][0]["new"], "web:v2");
}

#[test]
fn diff_compares_directories() {
  let env = TestEnv::new();
  env.write_file("old/deployment.yaml", &deployment("web", 2, "web:v1"));
  env.write_file("old/config.yaml", &config_map("settings", "a"));
  env.write_file("new/deployment.yaml", &deployment("web", 2, "web:v1"));
  env.write_file("new/config.yaml", &config_map("settings", "b"));

  env
    .piped_cmd()
    .arg("diff")
    .arg(env.path("old"))
    .arg(env.path("new"))
    .assert()
    .success()
    .stdout(predicate::str::contains("0 added, 0 deleted, 1 changed"));
}

#[test]
fn diff_masks_config_map_data() {
  let env = TestEnv::new();
  let old = env.write_file("old.yaml", &config_map("settings", "plain-old-value"));
  let new = env.write_file("new.yaml", &config_map("settings", "plain-new-value"));

  env
    .piped_cmd()
    .args(["diff", "--mask-config-map"])
    .arg(&old)
    .arg(&new)
    .assert()
    .success()
    .stdout(predicate::str::contains("1 changed"))
    .stdout(predicate::str::contains("plain-new-value").not());
}

#[test]
fn diff_rejects_malformed_yaml() {
  let env = TestEnv::new();
  let old = env.write_file("old.yaml", "kind: [unterminated");
  let new = env.write_file("new.yaml", &config_map("settings", "a"));

  env
    .piped_cmd()
    .arg("diff")
    .arg(&old)
    .arg(&new)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to parse manifests"));
}
