//! Whole-job scenarios on the local backend.

use crate::common::{init_git_repo, run_local};
use shardtest::report::ResultStatus;

#[tokio::test]
async fn sharding_arithmetic_thirty_one_keys() {
    // 31 keys with maxContainersPerPod=16 and maxConcurrentNumPerPod=1:
    // two pods (16 and 15 subtasks), every key runs exactly once.
    let keys: Vec<String> = (0..31).map(|i| format!("Key{:02}", i)).collect();
    let yaml = format!(
        r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [{keys}]
      scheduler:
        maxContainersPerPod: 16
        maxConcurrentNumPerPod: 1
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, "echo $TEST"]
            workingDir: /work
"#,
        keys = keys.join(", ")
    );

    let report = run_local(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    assert_eq!(report.total_num, 31);
    assert_eq!(report.success_num, 31);
    assert_eq!(report.failure_num, 0);

    let mut seen: Vec<&str> = report.details.iter().map(|d| d.name.as_str()).collect();
    seen.sort();
    let mut expected: Vec<&str> = keys.iter().map(String::as_str).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn repo_volume_mounts_clone_into_workdir() {
    let upstream = tempfile::tempdir().unwrap();
    init_git_repo(upstream.path());

    let yaml = format!(
        r#"
spec:
  repos:
    - name: repo
      value:
        url: {url}
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [cat, hello.txt]
            workingDir: /work
            volumeMounts:
              - name: repo-volume
                mountPath: /work
        volumes:
          - name: repo-volume
            repo:
              name: repo
"#,
        url = upstream.path().display()
    );

    let report = run_local(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
}

#[tokio::test]
async fn token_volume_mounts_file_named_by_key() {
    let token_dir = tempfile::tempdir().unwrap();
    let token_path = token_dir.path().join("ci-token");
    std::fs::write(&token_path, "tok-abc123\n").unwrap();

    let yaml = format!(
        r#"
spec:
  tokens:
    - name: ci-token
      value:
        file:
          path: {path}
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: [cat, secrets/ci-token]
            workingDir: /work
            volumeMounts:
              - name: token-volume
                mountPath: /work/secrets
        volumes:
          - name: token-volume
            token:
              name: ci-token
"#,
        path = token_path.display()
    );

    let report = run_local(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
}

#[tokio::test]
async fn failed_subtask_keeps_siblings_running() {
    let yaml = r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B, C, D, E]
      scheduler:
        maxContainersPerPod: 2
        maxConcurrentNumPerPod: 1
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c, 'test "$TEST" != C']
            workingDir: /work
"#;
    let report = run_local(yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Failure);
    assert_eq!(report.total_num, 5);
    assert_eq!(report.success_num, 4);
    assert_eq!(report.failure_num, 1);
}

#[tokio::test]
async fn full_pipeline_pre_main_post_export() {
    let export_dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
spec:
  preSteps:
    - name: build
      template:
        spec:
          containers:
            - name: build
              command: [sh, -c, "echo binary > /work/app.bin"]
              workingDir: /work
          artifacts:
            - name: app
              container:
                name: build
                path: /work/app.bin
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [one, two]
      scheduler:
        maxConcurrentNumPerPod: 2
    template:
      spec:
        artifacts:
          - name: results
            container:
              name: test
              path: /work/result.txt
        containers:
          - name: test
            command: [sh, -c, "cat /work/app.bin > /work/result.txt && echo $TEST >> /work/result.txt"]
            workingDir: /work
            volumeMounts:
              - name: app-volume
                mountPath: /work/app.bin
        volumes:
          - name: app-volume
            artifact:
              name: app
  postSteps:
    - name: verify
      template:
        spec:
          containers:
            - name: verify
              command: [sh, -c, "grep -q totalNum /work/report.json"]
              workingDir: /work
              volumeMounts:
                - name: report-volume
                  mountPath: /work/report.json
          volumes:
            - name: report-volume
              report:
                format: json
  exportArtifacts:
    - name: results
      path: {export}
"#,
        export = export_dir.path().display()
    );

    let report = run_local(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    assert_eq!(report.total_num, 2);

    // Exported results: one subdirectory per producing subtask, one
    // staged file each.
    let mut exported = 0;
    for entry in std::fs::read_dir(export_dir.path()).unwrap() {
        let entry = entry.unwrap();
        assert!(entry.file_type().unwrap().is_dir());
        exported += std::fs::read_dir(entry.path()).unwrap().count();
    }
    assert_eq!(exported, 2);
}

#[tokio::test]
async fn multi_pod_sharding_exports_one_artifact_per_key() {
    // maxContainersPerPod=1 forces one pod per key; every pod's clone
    // container restarts numbering at zero, so staging must be keyed by
    // the strategy key or the exports collide.
    let export_dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [alpha, beta, gamma]
      scheduler:
        maxContainersPerPod: 1
    template:
      spec:
        artifacts:
          - name: results
            container:
              name: test
              path: /work/result.txt
        containers:
          - name: test
            command: [sh, -c, "echo $TEST > /work/result.txt"]
            workingDir: /work
  exportArtifacts:
    - name: results
      path: {export}
"#,
        export = export_dir.path().display()
    );

    let report = run_local(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    assert_eq!(report.total_num, 3);

    // One staged slot per key, each holding that key's own output.
    let mut keys = Vec::new();
    for entry in std::fs::read_dir(export_dir.path()).unwrap() {
        let entry = entry.unwrap();
        assert!(entry.file_type().unwrap().is_dir());
        let key = entry.file_name().to_string_lossy().into_owned();
        let content = std::fs::read_to_string(entry.path().join("result.txt")).unwrap();
        assert_eq!(content.trim(), key);
        keys.push(key);
    }
    keys.sort();
    assert_eq!(keys, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn retest_reruns_failed_key_without_touching_other_artifacts() {
    // One pod, three keys, each exporting an artifact; beta fails its
    // first attempt. The retest pass re-partitions from index zero, so
    // key-based staging must keep alpha's and gamma's staged files
    // intact while beta's slot is refreshed.
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("beta-failed-once");
    let export_dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [alpha, beta, gamma]
      scheduler:
        maxConcurrentNumPerPod: 1
      retest: true
    template:
      spec:
        artifacts:
          - name: results
            container:
              name: test
              path: /work/result.txt
        containers:
          - name: test
            command: [sh, -c]
            args:
              - 'if [ "$TEST" = beta ] && [ ! -f {marker} ]; then touch {marker}; exit 1; fi; echo $TEST > /work/result.txt'
            workingDir: /work
  exportArtifacts:
    - name: results
      path: {export}
"#,
        marker = marker.display(),
        export = export_dir.path().display()
    );

    let report = run_local(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    assert!(marker.exists());

    let mut keys = Vec::new();
    for entry in std::fs::read_dir(export_dir.path()).unwrap() {
        let entry = entry.unwrap();
        let key = entry.file_name().to_string_lossy().into_owned();
        let content = std::fs::read_to_string(entry.path().join("result.txt")).unwrap();
        assert_eq!(content.trim(), key);
        keys.push(key);
    }
    keys.sort();
    assert_eq!(keys, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn retest_turns_flaky_job_green() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("first-pass-done");
    let yaml = format!(
        r#"
spec:
  mainStep:
    strategy:
      key:
        env: TEST
        source:
          static: [A, B]
      scheduler:
        maxConcurrentNumPerPod: 2
      retest: true
    template:
      spec:
        containers:
          - name: test
            command: [sh, -c]
            args:
              - 'if [ "$TEST" = A ] && [ ! -f {marker} ]; then touch {marker}; exit 1; fi'
            workingDir: /work
"#,
        marker = marker.display()
    );

    let report = run_local(&yaml).await.unwrap();
    assert_eq!(report.status, ResultStatus::Success);
    assert_eq!(report.success_num, 2);
    assert!(marker.exists());
}

#[test]
fn dangling_reference_fails_before_running() {
    let yaml = r#"
spec:
  mainStep:
    template:
      spec:
        containers:
          - name: test
            command: ["true"]
            volumeMounts:
              - name: repo-volume
                mountPath: /work
        volumes:
          - name: repo-volume
            repo:
              name: not-declared
"#;
    let err = shardtest::config::SpecLoader::parse(yaml, &Default::default()).unwrap_err();
    assert!(err.to_string().contains("undefined repository"));
}
