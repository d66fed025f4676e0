//! Install script templates for the built-in tools.
//!
//! Each template contains `{work_dir}`, `{version}`, `{bin_dir}` and
//! `{as_default}` placeholders, substituted by [`render`].

/// Template for installing kubectl.
pub const KUBECTL_INSTALL_SCRIPT: &str = r#"cd {work_dir}
curl -LO https://dl.k8s.io/release/v{version}/bin/$(uname | tr '[:upper:]' '[:lower:]')/amd64/kubectl
mv kubectl {bin_dir}/kubectl-{version}
chmod +x {bin_dir}/kubectl-{version}
if [ "{as_default}" = "true" ]; then
  cp -f {bin_dir}/kubectl-{version} {bin_dir}/kubectl
fi
"#;

/// Template for installing kustomize.
pub const KUSTOMIZE_INSTALL_SCRIPT: &str = r#"cd {work_dir}
curl -L https://github.com/kubernetes-sigs/kustomize/releases/download/kustomize%2Fv{version}/kustomize_v{version}_$(uname | tr '[:upper:]' '[:lower:]')_amd64.tar.gz | tar xvz
mv kustomize {bin_dir}/kustomize-{version}
chmod +x {bin_dir}/kustomize-{version}
if [ "{as_default}" = "true" ]; then
  cp -f {bin_dir}/kustomize-{version} {bin_dir}/kustomize
fi
"#;

/// Template for installing helm.
pub const HELM_INSTALL_SCRIPT: &str = r#"cd {work_dir}
curl -L https://get.helm.sh/helm-v{version}-$(uname | tr '[:upper:]' '[:lower:]')-amd64.tar.gz | tar xvz
mv $(uname | tr '[:upper:]' '[:lower:]')-amd64/helm {bin_dir}/helm-{version}
chmod +x {bin_dir}/helm-{version}
if [ "{as_default}" = "true" ]; then
  cp -f {bin_dir}/helm-{version} {bin_dir}/helm
fi
"#;

/// Substitute the install placeholders in `template`.
pub fn render(template: &str, work_dir: &str, version: &str, bin_dir: &str, as_default: bool) -> String {
  template
    .replace("{work_dir}", work_dir)
    .replace("{version}", version)
    .replace("{bin_dir}", bin_dir)
    .replace("{as_default}", if as_default { "true" } else { "false" })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn render_substitutes_every_placeholder() {
    let script = render(KUBECTL_INSTALL_SCRIPT, "/tmp/work", "1.29.0", "/opt/bin", true);

    assert!(script.starts_with("cd /tmp/work\n"));
    assert!(script.contains("v1.29.0/bin"));
    assert!(script.contains("/opt/bin/kubectl-1.29.0"));
    assert!(script.contains(r#"[ "true" = "true" ]"#));
    assert!(!script.contains('{'));
  }

  #[test]
  fn render_non_default_skips_alias() {
    let script = render(HELM_INSTALL_SCRIPT, "/w", "3.8.2", "/b", false);
    assert!(script.contains(r#"[ "false" = "true" ]"#));
  }
}
