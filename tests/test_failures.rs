//! Failure handling: which errors end a run and which only drop a region.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use leukoscan::InferenceServices;
use leukoscan::config::StorageConfig;

#[tokio::test]
async fn test_zero_width_region_is_skipped() -> anyhow::Result<()> {
    let regions = vec![
        region(50, 50, 50, 150, 0.95),
        region(100, 100, 200, 200, 0.95),
    ];
    let (pipeline, _temp_dir) = create_test_pipeline(regions).await;

    let result = pipeline.run(&make_test_image_bytes(), "smear.png", PatientRef(1)).await?;

    assert_eq!(result.regions.len(), 1);
    assert_eq!(result.regions[0].index, 1);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].index, 0);
    assert_eq!(result.failures[0].kind, ErrorKind::EmptyRegion);

    // The first persisted record carries the overview even though region 0 was dropped.
    let records = pipeline.store().records_for_run(result.run_id).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].overview_image.as_deref(), Some(result.overview_ref.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_invalid_image_writes_nothing() -> anyhow::Result<()> {
    let (pipeline, temp_dir) = create_test_pipeline(vec![region(10, 10, 110, 110, 0.95)]).await;

    let (result, trace) = pipeline
        .run_traced(b"GIF89a but not really", "broken.gif", PatientRef(5))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidImage(_)));
    assert!(!err.is_retryable());
    assert!(trace.is_valid());
    assert_eq!(trace.current(), PipelineState::Failed(ErrorKind::InvalidImage));

    let storage = StorageConfig::new(temp_dir.path());
    assert_eq!(count_files(&storage.roi_dir()), 0);
    assert_eq!(count_files(&storage.annotated_dir()), 0);
    assert!(pipeline.store().records_for_patient(PatientRef(5)).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_region_storage_failure_is_isolated() -> anyhow::Result<()> {
    let regions = vec![
        region(10, 10, 110, 110, 0.95),
        region(200, 200, 300, 300, 0.96),
        region(400, 100, 480, 180, 0.97),
    ];
    let (inner, _temp_dir) = create_test_store().await;
    let store = FailingStore::new(inner);
    store.fail_names_containing("_1.jpg");
    let pipeline = Pipeline::new(&fake_services(regions), test_renderer(), store);

    let result = pipeline.run(&make_test_image_bytes(), "smear.png", PatientRef(6)).await?;

    let indices: Vec<usize> = result.regions.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 2]);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].index, 0);
    assert_eq!(result.failures[0].kind, ErrorKind::StorageFailure);
    assert!(result.failures[0].message.contains("disk full"));

    let records = pipeline.store().inner.records_for_run(result.run_id).await?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, result.regions[0].record_id);
    assert!(records[0].overview_image.is_some());
    assert!(records[1].overview_image.is_none());
    Ok(())
}

#[tokio::test]
async fn test_overview_storage_failure_fails_run() -> anyhow::Result<()> {
    let (inner, _temp_dir) = create_test_store().await;
    let store = FailingStore::new(inner);
    store.fail_names_containing("_annotated");
    let pipeline = Pipeline::new(
        &fake_services(vec![region(10, 10, 110, 110, 0.95)]),
        test_renderer(),
        store,
    );

    let (result, trace) = pipeline
        .run_traced(&make_test_image_bytes(), "smear.png", PatientRef(8))
        .await;

    assert!(matches!(result, Err(PipelineError::StorageFailure(_))));
    assert!(trace.is_valid());
    assert_eq!(trace.current(), PipelineState::Failed(ErrorKind::StorageFailure));

    // Region records written before the overview stay, without an overview reference.
    let records = pipeline.store().inner.records_for_patient(PatientRef(8)).await?;
    assert_eq!(records.len(), 1);
    assert!(records[0].overview_image.is_none());
    Ok(())
}

#[tokio::test]
async fn test_out_of_bounds_box_is_persisted_but_not_drawn() -> anyhow::Result<()> {
    let regions = vec![
        region(600, 400, 700, 500, 0.95),
        region(10, 10, 110, 110, 0.95),
    ];
    let (pipeline, _temp_dir) = create_test_pipeline(regions).await;

    let result = pipeline.run(&make_test_image_bytes(), "smear.png", PatientRef(2)).await?;

    assert_eq!(result.regions.len(), 2);
    // Crop is clipped to the 40x80 part inside the image.
    let crop = pipeline.store().load_image(&result.regions[0].image_ref)?;
    assert_eq!((crop.width(), crop.height()), (40, 80));

    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].index, 0);
    assert_eq!(result.failures[0].kind, ErrorKind::RenderSkipped);
    Ok(())
}

#[tokio::test]
async fn test_slow_detection_times_out() -> anyhow::Result<()> {
    let (store, temp_dir) = create_test_store().await;
    let services = InferenceServices::new(
        Arc::new(FakeDetector::slow(
            vec![region(10, 10, 110, 110, 0.95)],
            Duration::from_millis(500),
        )),
        Arc::new(FakeClassifier::new()),
    );
    let pipeline = Pipeline::new(&services, test_renderer(), store)
        .with_deadline(Duration::from_millis(20));

    let (result, trace) = pipeline
        .run_traced(&make_test_image_bytes(), "smear.png", PatientRef(11))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, PipelineError::Timeout(_)));
    assert!(err.is_retryable());
    assert!(trace.is_valid());
    assert_eq!(trace.current(), PipelineState::Failed(ErrorKind::Timeout));

    assert_eq!(count_files(&StorageConfig::new(temp_dir.path()).roi_dir()), 0);
    assert!(pipeline.store().records_for_patient(PatientRef(11)).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_classifier_aborts_before_writes() -> anyhow::Result<()> {
    let (store, temp_dir) = create_test_store().await;
    let services = InferenceServices::new(
        Arc::new(FakeDetector::new(vec![
            region(10, 10, 110, 110, 0.95),
            region(200, 200, 300, 300, 0.96),
        ])),
        Arc::new(FakeClassifier { unavailable: true }),
    );
    let pipeline = Pipeline::new(&services, test_renderer(), store);

    let (result, trace) = pipeline
        .run_traced(&make_test_image_bytes(), "smear.png", PatientRef(12))
        .await;

    assert!(matches!(result, Err(PipelineError::ModelUnavailable(_))));
    assert!(trace.is_valid());
    assert_eq!(trace.current(), PipelineState::Failed(ErrorKind::ModelUnavailable));

    let storage = StorageConfig::new(temp_dir.path());
    assert_eq!(count_files(&storage.roi_dir()), 0);
    assert_eq!(count_files(&storage.annotated_dir()), 0);
    assert!(pipeline.store().records_for_patient(PatientRef(12)).await?.is_empty());
    Ok(())
}
