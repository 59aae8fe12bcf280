//! End-to-end tests: load → check → update with injected checkers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use extcheck_lib::checker::set_new_version;
use extcheck_lib::{
  CheckContext, CheckResult, Checker, CheckerError, CheckerOptions, CheckerRegistry, DigestKind, ExternalFile,
  ExternalSource, ExternalState, LoadError, ManifestChecker, MultiDigest, State,
};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Reports the file named by `to-url` as the latest release.
///
/// Checker data keys: `to-url`, `version`, `delay-ms`, `fail`.
#[derive(Default)]
struct Upgrade {
  events: Mutex<Vec<String>>,
}

impl Upgrade {
  fn events(&self) -> Vec<String> {
    self.events.lock().unwrap().clone()
  }

  fn position(&self, event: &str) -> usize {
    let events = self.events();
    events
      .iter()
      .position(|e| e == event)
      .unwrap_or_else(|| panic!("{} not in {:?}", event, events))
  }
}

#[async_trait]
impl Checker for Upgrade {
  fn name(&self) -> &'static str {
    "upgrade"
  }

  fn data_type(&self) -> Option<&'static str> {
    Some("upgrade")
  }

  async fn check(&self, ctx: &CheckContext<'_>, source: &ExternalSource, result: &mut CheckResult) -> Result<(), CheckerError> {
    let data = source.checker_data();
    self.events.lock().unwrap().push(format!("start {}", source.id()));
    if let Some(delay) = data.get("delay-ms").and_then(Value::as_u64) {
      tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    self.events.lock().unwrap().push(format!("end {}", source.id()));

    if data.get("fail").and_then(Value::as_bool).unwrap_or(false) {
      return Err(CheckerError::query("upstream listing unavailable"));
    }
    let url = data
      .get("to-url")
      .and_then(Value::as_str)
      .ok_or_else(|| CheckerError::metadata("missing to-url"))?;
    let version = data.get("version").and_then(Value::as_str).map(String::from);
    let digest = MultiDigest::new().with(DigestKind::Sha256, &format!("{:0>64}", url.len()));
    let candidate = ExternalFile::new(url, digest).with_version(version);
    set_new_version(ctx, source, result, ExternalState::File(candidate)).await
  }
}

fn registry(checker: &Arc<Upgrade>) -> CheckerRegistry {
  let mut registry = CheckerRegistry::with_defaults();
  registry.register(checker.clone());
  registry
}

fn write_json(dir: &Path, name: &str, value: &Value) -> PathBuf {
  let path = dir.join(name);
  fs::write(&path, serde_json::to_string_pretty(value).unwrap() + "\n").unwrap();
  path
}

fn upgrade_source(name: &str, data: Value) -> Value {
  let mut checker_data = json!({"type": "upgrade", "to-url": format!("https://example.com/{}-9.9.9.tar.gz", name)});
  if let (Some(target), Some(extra)) = (checker_data.as_object_mut(), data.as_object()) {
    target.extend(extra.clone());
  }
  json!({
    "type": "archive",
    "url": format!("https://example.com/{}-1.0.tar.gz", name),
    "sha256": "0000000000000000000000000000000000000000000000000000000000000000",
    "x-checker-data": checker_data
  })
}

async fn check(manifest: &mut ManifestChecker, checker: &Arc<Upgrade>) -> Vec<Arc<ExternalSource>> {
  manifest.check(&registry(checker), None).await
}

mod scenario {
  use super::*;

  #[tokio::test]
  async fn candidate_is_written_back() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
      dir.path(),
      "org.example.App.json",
      &json!({
        "id": "org.example.App",
        "modules": [{"name": "foo", "sources": [upgrade_source("foo", json!({"version": "9.9.9"}))]}]
      }),
    );
    let checker = Arc::new(Upgrade::default());
    let mut manifest = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();

    check(&mut manifest, &checker).await;

    let outdated = manifest.outdated_external_data();
    assert_eq!(outdated.len(), 1);
    let new_version = outdated[0].new_version().unwrap();
    assert_eq!(new_version.url(), "https://example.com/foo-9.9.9.tar.gz");

    let messages = manifest.update_manifests();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("foo"));
    assert!(messages[0].contains("9.9.9"));

    let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
      written["modules"][0]["sources"][0]["url"],
      "https://example.com/foo-9.9.9.tar.gz"
    );
    assert!(manifest.errors().is_empty());
  }

  #[tokio::test]
  async fn second_run_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
      dir.path(),
      "m.json",
      &json!({"name": "foo", "sources": [upgrade_source("foo", json!({"version": "9.9.9"}))]}),
    );
    let checker = Arc::new(Upgrade::default());

    let mut first = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();
    check(&mut first, &checker).await;
    assert_eq!(first.update_manifests().len(), 1);
    let after_first = fs::read_to_string(&path).unwrap();

    for _ in 0..2 {
      let mut again = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();
      let checked = check(&mut again, &checker).await;
      assert_eq!(checked[0].state(), State::Valid);
      assert!(again.update_manifests().is_empty());
      assert_eq!(fs::read_to_string(&path).unwrap(), after_first);
    }
  }

  #[tokio::test]
  async fn referenced_module_file_is_rewritten() {
    let dir = TempDir::new().unwrap();
    let module = write_json(
      dir.path(),
      "foo.json",
      &json!({"name": "foo", "sources": [upgrade_source("foo", json!({"version": "9.9.9"}))]}),
    );
    let root = write_json(
      dir.path(),
      "org.example.App.json",
      &json!({"app-id": "org.example.App", "modules": ["foo.json"]}),
    );
    let root_before = fs::read_to_string(&root).unwrap();
    let checker = Arc::new(Upgrade::default());
    let mut manifest = ManifestChecker::new(&root, CheckerOptions::default()).unwrap();

    check(&mut manifest, &checker).await;
    manifest.update_manifests();

    let written: Value = serde_json::from_str(&fs::read_to_string(&module).unwrap()).unwrap();
    assert_eq!(written["sources"][0]["url"], "https://example.com/foo-9.9.9.tar.gz");
    assert_eq!(fs::read_to_string(&root).unwrap(), root_before);
  }
}

mod ordering {
  use super::*;

  #[tokio::test]
  async fn slow_parent_runs_before_child() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
      dir.path(),
      "m.json",
      &json!({"name": "m", "sources": [
        upgrade_source("a", json!({"delay-ms": 150})),
        upgrade_source("b", json!({"parent-id": "m-archive-0"}))
      ]}),
    );
    let checker = Arc::new(Upgrade::default());
    let mut manifest = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();

    check(&mut manifest, &checker).await;

    assert!(checker.position("end m-archive-0") < checker.position("start m-archive-1"));
  }

  #[tokio::test]
  async fn unresolved_parent_fails_before_checking() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
      dir.path(),
      "m.json",
      &json!({"name": "m", "sources": [upgrade_source("a", json!({"parent-id": "m-archive-7"}))]}),
    );

    let result = ManifestChecker::new(&path, CheckerOptions::default());

    assert!(matches!(result, Err(LoadError::UnresolvedParent { .. })));
  }

  #[tokio::test]
  async fn parent_cycle_is_a_load_error() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
      dir.path(),
      "m.json",
      &json!({"name": "m", "sources": [
        upgrade_source("a", json!({"parent-id": "m-archive-1"})),
        upgrade_source("b", json!({"parent-id": "m-archive-0"}))
      ]}),
    );

    let err = ManifestChecker::new(&path, CheckerOptions::default()).unwrap_err();

    assert!(matches!(err, LoadError::ParentCycle { .. }));
    assert!(err.to_string().contains("m-archive-0"));
  }
}

mod aliasing {
  use super::*;

  const ALIASED: &str = "\
app-id: org.example.App
modules:
  - name: foo
    sources:
      - &shared
        type: archive
        url: https://example.com/shared-1.0.tar.gz
        sha256: '0000000000000000000000000000000000000000000000000000000000000000'
        x-checker-data:
          type: upgrade
          to-url: https://example.com/shared-2.0.tar.gz
          version: '2.0'
  - name: bar
    sources:
      - *shared
";

  #[tokio::test]
  async fn aliased_source_is_checked_once_and_rewritten_everywhere() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("org.example.App.yaml");
    fs::write(&path, ALIASED).unwrap();
    let checker = Arc::new(Upgrade::default());
    let mut manifest = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();

    assert_eq!(manifest.external_data(None).len(), 1);
    assert!(Arc::ptr_eq(
      &manifest.modules()[0].sources()[0],
      &manifest.modules()[1].sources()[0]
    ));

    check(&mut manifest, &checker).await;
    assert_eq!(checker.events().iter().filter(|e| e.starts_with("start")).count(), 1);

    assert_eq!(manifest.update_manifests(), ["foo: Update shared-1.0.tar.gz to 2.0"]);
    let written: Value = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    for module in 0..2 {
      assert_eq!(
        written["modules"][module]["sources"][0]["url"],
        "https://example.com/shared-2.0.tar.gz"
      );
    }
  }
}

mod policy {
  use super::*;

  #[tokio::test]
  async fn important_update_required_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    let mut main = upgrade_source("main", json!({"is-main-source": true}));
    main["x-checker-data"]["to-url"] = json!("https://example.com/main-1.0.tar.gz");
    main["sha256"] = json!(format!("{:0>64}", "https://example.com/main-1.0.tar.gz".len()));
    let path = write_json(
      dir.path(),
      "m.json",
      &json!({"name": "foo", "sources": [main, upgrade_source("dep", json!({"version": "2"}))]}),
    );
    let before = fs::read_to_string(&path).unwrap();
    let options = CheckerOptions {
      require_important_update: true,
      ..CheckerOptions::default()
    };
    let checker = Arc::new(Upgrade::default());
    let mut manifest = ManifestChecker::new(&path, options).unwrap();

    check(&mut manifest, &checker).await;

    assert_eq!(manifest.outdated_external_data().len(), 1);
    assert!(manifest.update_manifests().is_empty());
    assert_eq!(fs::read_to_string(&path).unwrap(), before);
  }

  #[tokio::test]
  async fn failed_check_leaves_source_unknown() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
      dir.path(),
      "m.json",
      &json!({"name": "foo", "sources": [
        upgrade_source("a", json!({"fail": true})),
        upgrade_source("b", json!({"version": "2"}))
      ]}),
    );
    let checker = Arc::new(Upgrade::default());
    let mut manifest = ManifestChecker::new(&path, CheckerOptions::default()).unwrap();

    let checked = check(&mut manifest, &checker).await;

    assert_eq!(checked[0].state(), State::Unknown);
    assert!(checked[0].new_version().is_none());
    assert!(checked[1].is_outdated());
    assert_eq!(manifest.errors().len(), 1);
    assert_eq!(manifest.errors()[0].source_id(), Some("foo-archive-0"));
  }
}
