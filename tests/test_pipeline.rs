// Streaming pipeline: bounded prefetch, user-side transform, uploads back
// to the remote, local cleanup, and state-file lifecycle.

mod support;

use blackbird::pipeline::{DatasetPipeline, PipelineOptions, PIPELINE_STATE_FILE};
use blackbird::sync::SyncFilters;
use blackbird::test_support::MockRemote;
use std::sync::Arc;
use support::{open_canonical, tracing_init};
use walkdir::WalkDir;

#[tokio::test]
async fn test_pipeline_processes_every_instrumental() {
    tracing_init();
    let src_dir = tempfile::tempdir().unwrap();
    let src = open_canonical(src_dir.path());
    let remote = Arc::new(MockRemote::mirror(&src).unwrap());

    let work_dir = tempfile::tempdir().unwrap();
    let filters = SyncFilters {
        components: Some(vec!["instrumental".to_string()]),
        ..Default::default()
    };
    let mut opts = PipelineOptions::new(work_dir.path());
    opts.queue_size = 2;
    opts.prefetch_workers = 2;
    opts.upload_workers = 1;

    let mut pipeline = DatasetPipeline::start(remote.clone(), &filters, opts)
        .await
        .unwrap();

    // Consume one item at a time, writing a companion result for each
    let mut consumed = Vec::new();
    loop {
        let mut items = pipeline.take(1).await;
        let Some(item) = items.pop() else { break };
        assert!(item.local_path.is_file());
        assert_eq!(item.component, "instrumental");

        let result_path = item
            .local_path
            .with_file_name(format!("{}.out.json", item.base_name));
        std::fs::write(&result_path, br#"{"processed":true}"#).unwrap();
        let remote_name = format!("{}.out.json", item.base_name);
        consumed.push(item.remote_path.clone());
        pipeline.submit_result(item, result_path, &remote_name).unwrap();
    }
    assert_eq!(consumed.len(), 12);

    let outcome = pipeline.shutdown().await.unwrap();
    assert!(outcome.drained);
    assert_eq!(outcome.uploaded, 12);
    assert_eq!(outcome.processed, 12);

    // One result uploaded next to each instrumental on the remote
    for source in &consumed {
        let (dir, file) = source.rsplit_once('/').unwrap();
        let base = file.strip_suffix("_instrumental.mp3").unwrap();
        let result = format!("{}/{}.out.json", dir, base);
        assert_eq!(
            remote.file(&result).as_deref(),
            Some(br#"{"processed":true}"#.as_ref()),
            "missing remote result {}",
            result
        );
    }

    // Every local source and result was deleted after upload
    let leftovers: Vec<_> = WalkDir::new(work_dir.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();
    assert!(leftovers.is_empty(), "files left behind: {:?}", leftovers);

    // Clean shutdown removed the pipeline state file
    assert!(!work_dir.path().join(PIPELINE_STATE_FILE).exists());
}

#[tokio::test]
async fn test_pipeline_skip_deletes_without_upload() {
    tracing_init();
    let src_dir = tempfile::tempdir().unwrap();
    let src = open_canonical(src_dir.path());
    let remote = Arc::new(MockRemote::mirror(&src).unwrap());
    let uploads_before = remote.file_paths().len();

    let work_dir = tempfile::tempdir().unwrap();
    let filters = SyncFilters {
        components: Some(vec!["caption".to_string()]),
        artists: Some(vec!["Artist_A".to_string()]),
        ..Default::default()
    };
    let mut pipeline =
        DatasetPipeline::start(remote.clone(), &filters, PipelineOptions::new(work_dir.path()))
            .await
            .unwrap();

    let mut skipped = 0;
    loop {
        let mut items = pipeline.take(1).await;
        let Some(item) = items.pop() else { break };
        let local = item.local_path.clone();
        pipeline.skip(item).await.unwrap();
        assert!(!local.exists());
        skipped += 1;
    }
    // Artist_A has four caption files (Five carries none)
    assert_eq!(skipped, 4);

    let outcome = pipeline.shutdown().await.unwrap();
    assert_eq!(outcome.uploaded, 0);
    assert_eq!(remote.file_paths().len(), uploads_before);
    assert!(!work_dir.path().join(PIPELINE_STATE_FILE).exists());
}

#[tokio::test]
async fn test_pipeline_restart_skips_processed_items() {
    tracing_init();
    let src_dir = tempfile::tempdir().unwrap();
    let src = open_canonical(src_dir.path());
    let remote = Arc::new(MockRemote::mirror(&src).unwrap());

    let work_dir = tempfile::tempdir().unwrap();
    let filters = SyncFilters {
        components: Some(vec!["mir".to_string()]),
        ..Default::default()
    };

    // First run: process half the items, then stop without finishing
    let mut pipeline = DatasetPipeline::start(
        remote.clone(),
        &filters,
        PipelineOptions::new(work_dir.path()),
    )
    .await
    .unwrap();
    for _ in 0..6 {
        let mut items = pipeline.take(1).await;
        let item = items.pop().expect("twelve mir files exist");
        pipeline.skip(item).await.unwrap();
    }
    let outcome = pipeline.shutdown().await.unwrap();
    assert_eq!(outcome.processed, 6);
    // Work remains, so the state file survives
    assert!(work_dir.path().join(PIPELINE_STATE_FILE).exists());

    // Second run picks up only what the first left behind
    let mut pipeline = DatasetPipeline::start(
        remote.clone(),
        &filters,
        PipelineOptions::new(work_dir.path()),
    )
    .await
    .unwrap();
    let mut second_run = 0;
    loop {
        let mut items = pipeline.take(1).await;
        let Some(item) = items.pop() else { break };
        pipeline.skip(item).await.unwrap();
        second_run += 1;
    }
    assert_eq!(second_run, 6);
    let outcome = pipeline.shutdown().await.unwrap();
    assert_eq!(outcome.processed, 12);
    assert!(!work_dir.path().join(PIPELINE_STATE_FILE).exists());
}
