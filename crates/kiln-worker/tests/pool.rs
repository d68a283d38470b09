//! Pool behavior against real worker processes.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use kiln_project::{CompilerLaunch, Pipeline};
use kiln_worker::{
    pool::{CompileJob, CompilerPool, PoolEvent},
    protocol::DEFAULT_PROTOCOL_VERSION,
};

fn target_dir() -> PathBuf {
    env::current_exe().ok().map_or_else(
        || panic!("cannot find test directory"),
        |mut path| {
            path.pop();
            if path.ends_with("deps") {
                path.pop();
            }
            path
        },
    )
}

fn compiler_path(bin_name: &str) -> PathBuf {
    target_dir().join(format!("{}{}", bin_name, env::consts::EXE_SUFFIX))
}

fn launch(path: PathBuf) -> CompilerLaunch {
    CompilerLaunch {
        path,
        arguments: vec![],
        working_directory: None,
        extra_environment: BTreeMap::new(),
        hide_environment: vec![],
        max_restart_count: 0,
        suppress_stdio: false,
    }
}

fn job(source: &Path, target: &Path, resource_type: &str) -> CompileJob {
    CompileJob {
        source_path: source.to_owned(),
        target_path: target.to_owned(),
        resource_type: resource_type.to_owned(),
        platform: "generic".to_owned(),
    }
}

async fn wait_ready(pool: &mut CompilerPool) {
    loop {
        match pool.next_event().await {
            Some(PoolEvent::Ready) => return,
            Some(PoolEvent::Error { message }) => panic!("pool error during startup: {message}"),
            Some(_) => {}
            None => panic!("pool closed before ready"),
        }
    }
}

#[tokio::test]
async fn empty_pipeline_is_ready_and_skips_everything() {
    let work_dir = tempfile::tempdir().unwrap();
    let mut pool = CompilerPool::new();
    pool.startup(work_dir.path(), &Pipeline::default());
    wait_ready(&mut pool).await;

    let source = work_dir.path().join("foo.unknown");
    fs::write(&source, b"data").unwrap();
    pool.submit(job(&source, &work_dir.path().join("out"), "unknown"));

    match pool.next_event().await.unwrap() {
        PoolEvent::Skipped { reason, .. } => {
            assert!(
                reason.starts_with("No data compiler for resource type unknown"),
                "unexpected reason: {reason}"
            );
        }
        other => panic!("expected a skip, got {other:?}"),
    }
}

#[tokio::test]
async fn identical_launches_share_one_worker() {
    let work_dir = tempfile::tempdir().unwrap();
    let copy = compiler_path(kiln_compiler_test_copy::BIN_NAME);

    let mut pipeline = Pipeline::default();
    for route in ["png", "jpg", "gif"] {
        pipeline.routes.insert(route.to_owned(), launch(copy.clone()));
    }

    let mut pool = CompilerPool::new();
    pool.startup(work_dir.path(), &pipeline);
    wait_ready(&mut pool).await;

    assert_eq!(pool.worker_count(), 1);
    let png = pool.find_compiler("png", "generic").unwrap();
    assert_eq!(pool.find_compiler("jpg", "generic"), Some(png));
    assert_eq!(pool.find_compiler("gif", "generic"), Some(png));
    assert_eq!(pool.find_compiler("tga", "generic"), None);

    pool.shutdown();
    loop {
        match pool.next_event().await.unwrap() {
            PoolEvent::Terminated => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn jobs_complete_in_submission_order() {
    let work_dir = tempfile::tempdir().unwrap();
    let copy = compiler_path(kiln_compiler_test_copy::BIN_NAME);

    let mut pipeline = Pipeline::default();
    pipeline.routes.insert("txt".to_owned(), launch(copy));

    let mut pool = CompilerPool::new();
    pool.startup(work_dir.path(), &pipeline);
    wait_ready(&mut pool).await;

    let sources: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let source = work_dir.path().join(format!("{name}.txt"));
            fs::write(&source, format!("payload {name}\n")).unwrap();
            source
        })
        .collect();

    for (i, source) in sources.iter().enumerate() {
        pool.submit(job(source, &work_dir.path().join(format!("out{i}")), "txt"));
    }

    let mut completed = vec![];
    let mut started = vec![];
    while completed.len() < sources.len() {
        match pool.next_event().await.unwrap() {
            PoolEvent::Started { job } => started.push(job.source_path),
            PoolEvent::Complete { job, result } => {
                assert!(result.success, "errors: {:?}", result.errors);
                assert_eq!(result.source_path, job.source_path);
                assert_eq!(result.outputs.len(), 1);
                assert!(result.outputs[0].exists());
                completed.push(job.source_path);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(started, sources);
    assert_eq!(completed, sources);

    // each start strictly precedes the matching completion and the next
    // start, which is the single-dispatch-slot rule.
    let id = pool.find_compiler("txt", "generic").unwrap();
    assert_eq!(pool.worker_version(id), Some(2));
    assert_ne!(Some(DEFAULT_PROTOCOL_VERSION), pool.worker_version(id));

    pool.shutdown();
    loop {
        match pool.next_event().await.unwrap() {
            PoolEvent::Terminated => break,
            _ => {}
        }
    }
}

#[tokio::test]
async fn crashed_worker_restarts_and_finishes_the_job() {
    let work_dir = tempfile::tempdir().unwrap();
    let flaky = compiler_path(kiln_compiler_test_flaky::BIN_NAME);

    let mut spec = launch(flaky);
    spec.max_restart_count = 2;
    spec.suppress_stdio = true;
    spec.extra_environment.insert(
        kiln_compiler_test_flaky::MARKER_ENV.to_owned(),
        work_dir
            .path()
            .join("flaky.marker")
            .to_string_lossy()
            .into_owned(),
    );
    let mut pipeline = Pipeline::default();
    pipeline.routes.insert("txt".to_owned(), spec);

    let mut pool = CompilerPool::new();
    pool.startup(work_dir.path(), &pipeline);
    wait_ready(&mut pool).await;

    let source = work_dir.path().join("a.txt");
    fs::write(&source, "payload\n").unwrap();
    pool.submit(job(&source, &work_dir.path().join("out"), "txt"));

    loop {
        match pool.next_event().await.unwrap() {
            PoolEvent::Complete { result, .. } => {
                assert!(result.success, "errors: {:?}", result.errors);
                break;
            }
            PoolEvent::Exited { .. } => panic!("worker gave up before finishing the job"),
            _ => {}
        }
    }
}

#[cfg(unix)]
#[tokio::test]
async fn terminal_exit_reports_lost_jobs() {
    let work_dir = tempfile::tempdir().unwrap();

    let mut spec = launch(PathBuf::from("/bin/false"));
    spec.max_restart_count = 1;
    spec.suppress_stdio = true;
    let mut pipeline = Pipeline::default();
    pipeline.routes.insert("txt".to_owned(), spec);

    let mut pool = CompilerPool::new();
    pool.startup(work_dir.path(), &pipeline);
    wait_ready(&mut pool).await;

    let source = work_dir.path().join("a.txt");
    fs::write(&source, "payload\n").unwrap();
    pool.submit(job(&source, &work_dir.path().join("out0"), "txt"));
    pool.submit(job(&source, &work_dir.path().join("out1"), "txt"));

    loop {
        match pool.next_event().await.unwrap() {
            PoolEvent::Exited { lost } => {
                assert_eq!(lost.len(), 2);
                break;
            }
            PoolEvent::Complete { .. } => panic!("a dead worker completed a job"),
            _ => {}
        }
    }
}
