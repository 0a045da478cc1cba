//! Worker side of the protocol: registration, job payload, results and the
//! gating of dependents.

mod common;

use common::{TestEngine, FOREIGN_PRIVATE_KEY, REGION};
use hatchery_core::auth::{SpawnTokenClaims, SpawnTokenSigner, WorkerIdentity};
use hatchery_core::models::{
    NewRunResult, RunInfoLevel, RunJob, RunResultDetail, RunResultStatus, VariableSet,
    VariableSetItem, VariableSetItemType, WorkerStatus,
};
use hatchery_core::store::Store;
use hatchery_core::{EngineError, RunJobStatus, WorkflowRunStatus};

const PIPELINE: &str = r#"
name: app-ci
env:
  DEPLOY_ENV: staging
jobs:
  build:
    region: build
    runs-on:
      model: docker
    steps:
      - uses: actions/compile
  package:
    region: build
    needs: [build]
    vars: [registry]
    env:
      DEPLOY_ENV: production
    steps:
      - run: docker push
"#;

#[tokio::test]
async fn single_job_runs_to_success() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t
        .crafted(
            r#"
name: deliver
jobs:
  job1:
    region: build
    runs-on:
      model: docker
    steps:
      - run: make
"#,
        )
        .await;
    let job1 = t.run_job(&run, "job1").await;
    assert_eq!(job1.status, RunJobStatus::Waiting);

    let taken = t.engine.take_job(&hatchery, REGION, job1.id).await.unwrap();
    assert_eq!(taken.status, RunJobStatus::Scheduling);

    let token = t.spawn_token("H1", "W1", &job1);
    let worker = t
        .engine
        .register_worker(&token, REGION, common::registration())
        .await
        .unwrap();
    let identity = WorkerIdentity::from(&worker);

    let payload = t.engine.take_job_payload(&identity, job1.id).await.unwrap();
    assert_eq!(payload.run_job.status, RunJobStatus::Building);
    assert_eq!(payload.run_job.worker_name.as_deref(), Some("W1"));
    assert_eq!(
        payload.worker_model.map(|m| m.model_type),
        Some("docker".to_string())
    );

    let ended = t
        .engine
        .post_job_result(&identity, job1.id, RunJobStatus::Success, None)
        .await
        .unwrap();
    assert_eq!(ended.status, RunJobStatus::Success);

    let stored = t.store.load_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowRunStatus::Success);
    let worker = t.store.load_worker(worker.id).await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Success);
}

#[tokio::test]
async fn outputs_and_variables_reach_dependent_jobs() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    t.store
        .insert_variable_set(&VariableSet::new(
            "PROJ",
            "registry",
            vec![
                VariableSetItem {
                    name: "url".to_string(),
                    item_type: VariableSetItemType::String,
                    value: "registry.example.com".to_string(),
                },
                VariableSetItem {
                    name: "credentials".to_string(),
                    item_type: VariableSetItemType::Secret,
                    value: "encrypted".to_string(),
                },
            ],
        ))
        .await
        .unwrap();
    t.secrets
        .insert("PROJ", "registry", "credentials", r#"{"user":"ci","password":"hunter2"}"#);

    let run = t.crafted(PIPELINE).await;
    let build = t.run_job(&run, "build").await;
    let package = t.run_job(&run, "package").await;
    assert_eq!(package.status, RunJobStatus::Blocked);

    let builder = t.spawn_worker(&hatchery, &build, "W1").await;
    let payload = t.engine.take_job_payload(&builder, build.id).await.unwrap();
    assert!(payload
        .actions
        .contains_key("PROJ/github/ovh/app/compile@refs/heads/main"));
    assert_eq!(payload.contexts.env["DEPLOY_ENV"], "staging");

    t.engine
        .post_run_result(&builder, build.id, NewRunResult::variable("IMAGE_TAG", "1.4.2"))
        .await
        .unwrap();
    t.engine
        .post_job_result(&builder, build.id, RunJobStatus::Success, None)
        .await
        .unwrap();

    let package = t.run_job(&run, "package").await;
    assert_eq!(package.status, RunJobStatus::Waiting);

    let packager = t.spawn_worker(&hatchery, &package, "W2").await;
    let payload = t.engine.take_job_payload(&packager, package.id).await.unwrap();
    let contexts = &payload.contexts;
    assert_eq!(contexts.cds.job, "package");
    assert_eq!(contexts.git.repository, "ovh/app");
    assert_eq!(contexts.env["DEPLOY_ENV"], "production");
    assert_eq!(contexts.needs["build"].result, RunJobStatus::Success);
    assert_eq!(contexts.needs["build"].outputs["IMAGE_TAG"], "1.4.2");
    assert_eq!(contexts.jobs["build"].outputs["IMAGE_TAG"], "1.4.2");
    assert_eq!(contexts.vars["registry"]["url"], "registry.example.com");
    assert_eq!(contexts.vars["registry"]["credentials"]["password"], "hunter2");
    assert!(payload.sensitive_data.contains("hunter2"));
    assert!(!payload.sensitive_data.contains("registry.example.com"));
}

#[tokio::test]
async fn failed_dependency_skips_dependents() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t.crafted(&PIPELINE.replace("    vars: [registry]\n", "")).await;
    let build = t.run_job(&run, "build").await;

    let worker = t.spawn_worker(&hatchery, &build, "W1").await;
    t.engine.take_job_payload(&worker, build.id).await.unwrap();
    t.engine
        .post_job_result(
            &worker,
            build.id,
            RunJobStatus::Fail,
            Some("compilation failed".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(t.run_job(&run, "package").await.status, RunJobStatus::Skipped);
    let stored = t.store.load_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowRunStatus::Fail);

    let infos = t.store.load_run_job_infos(build.id).await.unwrap();
    assert!(infos
        .iter()
        .any(|i| i.level == RunInfoLevel::Error && i.message == "compilation failed"));
}

const FAN_IN: &str = r#"
name: fan-in
jobs:
  a:
    region: build
    runs-on:
      model: docker
    steps:
      - run: make a
  b:
    region: build
    runs-on:
      model: docker
    steps:
      - run: make b
  c:
    region: build
    needs: [a, b]
    runs-on:
      model: docker
    steps:
      - run: make c
"#;

fn listed(jobs: &[RunJob], job_id: &str) -> bool {
    jobs.iter().any(|job| job.job_id == job_id)
}

#[tokio::test]
async fn job_with_two_needs_waits_for_both() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t.crafted(FAN_IN).await;
    let a = t.run_job(&run, "a").await;
    let b = t.run_job(&run, "b").await;
    assert_eq!(t.run_job(&run, "c").await.status, RunJobStatus::Blocked);

    let worker_a = t.spawn_worker(&hatchery, &a, "W1").await;
    let worker_b = t.spawn_worker(&hatchery, &b, "W2").await;
    t.engine.take_job_payload(&worker_a, a.id).await.unwrap();
    t.engine.take_job_payload(&worker_b, b.id).await.unwrap();

    t.engine
        .post_job_result(&worker_a, a.id, RunJobStatus::Success, None)
        .await
        .unwrap();
    assert_eq!(t.run_job(&run, "c").await.status, RunJobStatus::Blocked);
    let queued = t.engine.list_queued(&hatchery, REGION).await.unwrap();
    assert!(!listed(&queued, "c"));

    t.engine
        .post_job_result(&worker_b, b.id, RunJobStatus::Success, None)
        .await
        .unwrap();
    assert_eq!(t.run_job(&run, "c").await.status, RunJobStatus::Waiting);
    let queued = t.engine.list_queued(&hatchery, REGION).await.unwrap();
    assert!(listed(&queued, "c"));
}

#[tokio::test]
async fn failed_need_skips_job_while_other_need_runs() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t.crafted(FAN_IN).await;
    let a = t.run_job(&run, "a").await;
    let b = t.run_job(&run, "b").await;

    let worker_a = t.spawn_worker(&hatchery, &a, "W1").await;
    let worker_b = t.spawn_worker(&hatchery, &b, "W2").await;
    t.engine.take_job_payload(&worker_a, a.id).await.unwrap();
    t.engine.take_job_payload(&worker_b, b.id).await.unwrap();

    t.engine
        .post_job_result(&worker_a, a.id, RunJobStatus::Fail, None)
        .await
        .unwrap();
    assert_eq!(t.run_job(&run, "b").await.status, RunJobStatus::Building);
    assert_eq!(t.run_job(&run, "c").await.status, RunJobStatus::Skipped);
    let queued = t.engine.list_queued(&hatchery, REGION).await.unwrap();
    assert!(!listed(&queued, "c"));

    t.engine
        .post_job_result(&worker_b, b.id, RunJobStatus::Success, None)
        .await
        .unwrap();
    assert_eq!(t.run_job(&run, "c").await.status, RunJobStatus::Skipped);
    let queued = t.engine.list_queued(&hatchery, REGION).await.unwrap();
    assert!(!listed(&queued, "c"));
    let stored = t.store.load_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowRunStatus::Fail);
}

#[tokio::test]
async fn continue_on_error_lets_dependents_run() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let workflow = PIPELINE
        .replace("    vars: [registry]\n", "")
        .replace("      model: docker\n", "      model: docker\n    continue-on-error: true\n");
    let run = t.crafted(&workflow).await;
    let build = t.run_job(&run, "build").await;

    let worker = t.spawn_worker(&hatchery, &build, "W1").await;
    t.engine.take_job_payload(&worker, build.id).await.unwrap();
    t.engine
        .post_job_result(&worker, build.id, RunJobStatus::Fail, None)
        .await
        .unwrap();

    let package = t.run_job(&run, "package").await;
    assert_eq!(package.status, RunJobStatus::Waiting);
    let packager = t.spawn_worker(&hatchery, &package, "W2").await;
    let payload = t.engine.take_job_payload(&packager, package.id).await.unwrap();
    assert_eq!(payload.contexts.needs["build"].result, RunJobStatus::Success);
    assert_eq!(payload.contexts.jobs["build"].result, RunJobStatus::Fail);
}

#[tokio::test]
async fn stopped_job_is_observed_by_its_worker() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t.crafted(&PIPELINE.replace("    vars: [registry]\n", "")).await;
    let build = t.run_job(&run, "build").await;

    let worker = t.spawn_worker(&hatchery, &build, "W1").await;
    t.engine.take_job_payload(&worker, build.id).await.unwrap();
    t.engine.refresh_worker(&worker).await.unwrap();

    let cancelled = t.engine.stop_run(run.id, "cancelled by alice").await.unwrap();
    assert_eq!(cancelled.status, WorkflowRunStatus::Cancelled);
    assert_eq!(t.run_job(&run, "package").await.status, RunJobStatus::Stopped);

    assert_eq!(
        t.engine.refresh_worker(&worker).await,
        Err(EngineError::JobStopped(build.id))
    );
    assert_eq!(
        t.engine
            .post_run_result(&worker, build.id, NewRunResult::variable("LATE", "1"))
            .await
            .map(|_| ()),
        Err(EngineError::JobStopped(build.id))
    );
    assert_eq!(
        t.engine
            .post_job_result(&worker, build.id, RunJobStatus::Success, None)
            .await
            .map(|_| ()),
        Err(EngineError::JobStopped(build.id))
    );
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t.crafted(&PIPELINE.replace("    vars: [registry]\n", "")).await;
    let build = t.run_job(&run, "build").await;

    let first = t.spawn_worker(&hatchery, &build, "W1").await;

    let again = t
        .engine
        .register_worker(&t.spawn_token("H1", "W1", &build), REGION, common::registration())
        .await
        .unwrap();
    assert_eq!(again.id, first.worker_id);

    let other = t
        .engine
        .register_worker(&t.spawn_token("H1", "W2", &build), REGION, common::registration())
        .await;
    assert!(matches!(other, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn registration_requires_a_valid_spawn_token() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    t.add_hatchery("H2", "docker").await;
    let run = t.crafted(&PIPELINE.replace("    vars: [registry]\n", "")).await;
    let build = t.run_job(&run, "build").await;
    t.engine.take_job(&hatchery, REGION, build.id).await.unwrap();

    let claims = SpawnTokenClaims::new(
        "H1",
        "W1",
        build.id,
        &build.model_name,
        chrono::Duration::minutes(10),
    );
    let forged = SpawnTokenSigner::from_pem(FOREIGN_PRIVATE_KEY)
        .unwrap()
        .sign(&claims)
        .unwrap();
    assert!(matches!(
        t.engine.register_worker(&forged, REGION, common::registration()).await,
        Err(EngineError::Unauthorized(_))
    ));

    let expired = SpawnTokenClaims::new(
        "H1",
        "W1",
        build.id,
        &build.model_name,
        chrono::Duration::minutes(-10),
    );
    let expired = SpawnTokenSigner::from_pem(common::HATCHERY_PRIVATE_KEY)
        .unwrap()
        .sign(&expired)
        .unwrap();
    assert!(matches!(
        t.engine.register_worker(&expired, REGION, common::registration()).await,
        Err(EngineError::Unauthorized(_))
    ));

    // H2 shares the key but does not hold the job
    let wrong_holder = t.spawn_token("H2", "W1", &build);
    assert!(matches!(
        t.engine.register_worker(&wrong_holder, REGION, common::registration()).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn ended_job_and_completed_results_are_immutable() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t.crafted(&PIPELINE.replace("    vars: [registry]\n", "")).await;
    let build = t.run_job(&run, "build").await;

    let worker = t.spawn_worker(&hatchery, &build, "W1").await;
    t.engine.take_job_payload(&worker, build.id).await.unwrap();

    let first = t
        .engine
        .post_run_result(&worker, build.id, NewRunResult::variable("VERSION", "1.0.0"))
        .await
        .unwrap();
    assert_eq!(first.status, RunResultStatus::Completed);
    let repeated = t
        .engine
        .post_run_result(&worker, build.id, NewRunResult::variable("VERSION", "1.0.0"))
        .await
        .unwrap();
    assert_eq!(repeated.id, first.id);
    assert!(matches!(
        t.engine
            .post_run_result(&worker, build.id, NewRunResult::variable("VERSION", "2.0.0"))
            .await,
        Err(EngineError::Conflict(_))
    ));

    t.engine
        .post_job_result(&worker, build.id, RunJobStatus::Success, None)
        .await
        .unwrap();
    assert!(matches!(
        t.engine
            .post_job_result(&worker, build.id, RunJobStatus::Fail, None)
            .await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(t.run_job(&run, "build").await.status, RunJobStatus::Success);

    let results = t.store.load_run_results(run.id, 1).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].detail,
        RunResultDetail::Variable {
            name: "VERSION".to_string(),
            value: "1.0.0".to_string(),
        }
    );
}

#[tokio::test]
async fn unregistered_worker_is_locked_out() {
    let t = TestEngine::new().await;
    let hatchery = t.add_hatchery("H1", "docker").await;
    let run = t.crafted(&PIPELINE.replace("    vars: [registry]\n", "")).await;
    let build = t.run_job(&run, "build").await;

    let worker = t.spawn_worker(&hatchery, &build, "W1").await;
    t.engine
        .post_job_info(&worker, build.id, RunInfoLevel::Info, "pulling image")
        .await
        .unwrap();
    t.engine.unregister_worker(&worker).await.unwrap();

    assert!(matches!(
        t.engine.take_job_payload(&worker, build.id).await,
        Err(EngineError::Unauthorized(_))
    ));
    assert_eq!(t.run_job(&run, "build").await.status, RunJobStatus::Scheduling);
    let infos = t.store.load_run_job_infos(build.id).await.unwrap();
    assert!(infos.iter().any(|i| i.message == "pulling image"));
}
