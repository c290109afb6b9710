//! Dry-run scenarios: wiring is validated end-to-end with no pods,
//! processes or files created.

use crate::common::run_dry;
use shardtest::report::ResultStatus;

#[tokio::test]
async fn dry_run_job_completes_successfully() {
    let yaml = r#"
spec:
  preSteps:
    - name: build
      template:
        spec:
          containers:
            - name: build
              command: [make, build]
              workingDir: /work
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B, C, D]
      scheduler:
        maxContainersPerPod: 2
        maxConcurrentNumPerPod: 1
    template:
      spec:
        containers:
          - name: test
            command: [make, test]
            workingDir: /work
"#;
    let report = run_dry(yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    assert_eq!(report.total_num, 4);
    assert_eq!(report.success_num, 4);
}

#[tokio::test]
async fn dry_run_does_not_touch_export_destination() {
    let export_dir = tempfile::tempdir().unwrap();
    let export_path = export_dir.path().join("never-created");
    let yaml = format!(
        r#"
spec:
  mainStep:
    template:
      spec:
        artifacts:
          - name: out
            container:
              name: test
              path: /work/artifact
        containers:
          - name: test
            command: [touch, artifact]
            workingDir: /work
  exportArtifacts:
    - name: out
      path: {path}
"#,
        path = export_path.display()
    );

    // Nothing was staged (dry-run copies are no-ops), so the export stage
    // itself creates the empty destination but no artifact files.
    let report = run_dry(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    let entries = std::fs::read_dir(&export_path)
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(entries, 0);
}

#[tokio::test]
async fn dry_run_emits_fixed_output() {
    let yaml = r#"
spec:
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [run-everything]
            workingDir: /work
"#;
    let report = run_dry(yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    assert_eq!(report.details.len(), 1);
    assert_eq!(report.details[0].name, "test");
}
