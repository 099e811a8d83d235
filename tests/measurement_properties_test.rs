//! End-to-end measurement behavior against stub collaborators.

mod common;

use std::sync::Arc;

use common::{ConstantScreen, FlakyFit, RecordingStore};
use screen_profile::fit::FitError;
use screen_profile::measurement::ScreenBeamProfileMeasurement;
use screen_profile::storage::{ContainerStore, HierarchicalStore};
use screen_profile::{Image, MeasurementState, ProfileError};

#[tokio::test]
async fn test_non_positive_shot_count_never_touches_device() {
    let screen = Arc::new(ConstantScreen::constant());
    let store = RecordingStore::default();
    let mut measurement = ScreenBeamProfileMeasurement::builder(screen.clone())
        .store(Box::new(store.clone()))
        .save_to("unused.bpc")
        .build()
        .unwrap();

    for n_shots in [0, -1, -100] {
        let failure = measurement.measure(n_shots).await.unwrap_err();
        assert!(matches!(failure.error, ProfileError::InvalidShotCount(n) if n == n_shots));
        assert!(failure.partial.is_none());
    }
    assert_eq!(screen.pulls(), 0);
    assert_eq!(store.saves(), 0);
    assert_eq!(measurement.state(), MeasurementState::Idle);
}

#[tokio::test]
async fn test_fit_failure_on_second_image_skips_persistence() {
    let screen = Arc::new(ConstantScreen::tagged());
    let store = RecordingStore::default();
    let mut measurement = ScreenBeamProfileMeasurement::builder(screen.clone())
        .beam_fit(Box::new(FlakyFit::failing_on(1)))
        .store(Box::new(store.clone()))
        .save_to("unused.bpc")
        .build()
        .unwrap();

    let failure = measurement.measure(3).await.unwrap_err();
    match &failure.error {
        ProfileError::FitFailed { fit, shot, source } => {
            assert_eq!(fit, "FlakyFit");
            assert_eq!(*shot, 1);
            assert!(matches!(source, FitError::NotConverged(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.saves(), 0);
    assert_eq!(screen.pulls(), 3);

    let partial = failure.partial.unwrap();
    assert_eq!(partial.raw_images().unwrap().len(), 3);
    assert!(partial.get("fit_results").unwrap().is_null());
}

#[tokio::test]
async fn test_persistence_failure_returns_full_tree() {
    let screen = Arc::new(ConstantScreen::constant());
    let store = RecordingStore::failing();
    let mut measurement = ScreenBeamProfileMeasurement::builder(screen)
        .beam_fit(Box::new(FlakyFit::always_ok()))
        .store(Box::new(store.clone()))
        .save_to("unused.bpc")
        .build()
        .unwrap();

    let failure = measurement.measure(2).await.unwrap_err();
    assert!(matches!(failure.error, ProfileError::StorageWrite { .. }));
    assert_eq!(store.saves(), 1);

    let tree = failure.partial.unwrap();
    assert_eq!(tree.raw_images().unwrap().len(), 2);
    assert_eq!(tree.fit_results().unwrap().len(), 2);
    assert!(measurement.last_saved().is_none());
}

#[tokio::test]
async fn test_pull_order_defines_keys() {
    let screen = Arc::new(ConstantScreen::tagged());
    let mut measurement = ScreenBeamProfileMeasurement::builder(screen)
        .beam_fit(Box::new(FlakyFit::always_ok()))
        .build()
        .unwrap();

    let tree = measurement.measure(4).await.unwrap();
    let raw = tree.raw_images().unwrap();
    let fits = tree.fit_results().unwrap();

    let expected = vec!["image_0", "image_1", "image_2", "image_3"];
    assert_eq!(raw.keys().collect::<Vec<_>>(), expected);
    assert_eq!(fits.keys().collect::<Vec<_>>(), expected);

    for (shot, key) in expected.iter().enumerate() {
        let image = Image::try_from(raw.value(key).unwrap()).unwrap();
        assert_eq!(image, ConstantScreen::frame(shot as u16));
    }
}

#[tokio::test]
async fn test_unfitted_measurement_persists_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("test.out");
    let screen = Arc::new(ConstantScreen::constant());
    let mut measurement = ScreenBeamProfileMeasurement::builder(screen.clone())
        .fit_profile(false)
        .save_to(&destination)
        .build()
        .unwrap();

    let tree = measurement.measure(3).await.unwrap();
    assert_eq!(screen.pulls(), 3);
    assert!(tree.get("fit_results").unwrap().is_null());
    assert_eq!(measurement.last_saved(), Some(destination.as_path()));

    let reloaded = ContainerStore::new().load(&destination).unwrap();
    assert_eq!(reloaded, tree);
    assert_eq!(reloaded.keys().collect::<Vec<_>>(), vec!["raw_images", "fit_results"]);

    let raw = reloaded.raw_images().unwrap();
    assert_eq!(raw.len(), 3);
    for (_, node) in raw.iter() {
        let image = Image::try_from(node.as_value().unwrap()).unwrap();
        assert_eq!(image, ConstantScreen::frame(0));
    }
    assert!(reloaded.get("fit_results").unwrap().is_null());
}

#[tokio::test]
async fn test_repeated_measure_starts_fresh() {
    let screen = Arc::new(ConstantScreen::tagged());
    let mut measurement = ScreenBeamProfileMeasurement::builder(screen.clone())
        .fit_profile(false)
        .build()
        .unwrap();

    let first = measurement.measure(2).await.unwrap();
    let second = measurement.measure(1).await.unwrap();

    assert_eq!(first.raw_images().unwrap().len(), 2);
    assert_eq!(second.raw_images().unwrap().len(), 1);
    let image = Image::try_from(second.raw_images().unwrap().value("image_0").unwrap()).unwrap();
    assert_eq!(image, ConstantScreen::frame(2));
    assert_eq!(screen.pulls(), 3);
}
