use lime3d::core_modules::utils::video_io::video_io;
use lime3d::{
    ExplainConfig, ExplainPipeline, LimeError, OutputVector, ParallelExplainPipeline, RenderMode,
    VideoVolume,
};
use ndarray::{Array3, Array4};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type ScoreResult = Result<OutputVector, String>;

/// 4 frames of 8x8 greyscale made of four constant quadrants.
fn quadrant_video(levels: [[u8; 2]; 2]) -> VideoVolume {
    let data = Array4::from_shape_fn((4, 8, 8, 1), |(_, y, x, _)| levels[y / 4][x / 4]);
    VideoVolume::new(data).unwrap()
}

/// Share of non-black samples and its complement.
fn lit_fraction(video: &VideoVolume) -> ScoreResult {
    let lit = video.data().iter().filter(|&&v| v > 0).count() as f64;
    let share = lit / video.data().len() as f64;
    Ok(vec![share, 1.0 - share])
}

/// Brightness of the left half against the right half.
fn left_right_brightness(video: &VideoVolume) -> ScoreResult {
    let (mut left, mut right) = (1.0, 1.0);
    for ((_, _, x, _), &value) in video.data().indexed_iter() {
        if x < video.width() / 2 {
            left += value as f64;
        } else {
            right += value as f64;
        }
    }
    Ok(vec![left / (left + right), right / (left + right)])
}

fn seeded(num_samples: usize, target_region_count: usize, seed: u64) -> ExplainConfig {
    ExplainConfig {
        num_samples,
        target_region_count,
        seed: Some(seed),
        workers: 2,
        ..Default::default()
    }
}

#[test]
fn small_video_yields_aligned_dataset() {
    let video = quadrant_video([[30, 90], [150, 220]]);
    let pipeline = ExplainPipeline::new(seeded(5, 4, 42)).unwrap();
    let explanation = pipeline.explain_instance(&lit_fraction, &video).unwrap();

    assert_eq!(explanation.region_count, 4);
    let dataset = &explanation.dataset;
    assert_eq!(dataset.activations.len(), 5);
    assert_eq!(dataset.outputs.len(), 5);
    assert_eq!(dataset.weights.len(), 5);
    for (activation, weight) in dataset.activations.iter().zip(&dataset.weights) {
        assert_eq!(activation.len(), explanation.region_count);
        assert!(*weight > 0.0 && *weight <= 1.0, "weight {weight}");
    }
    assert_eq!(explanation.importance.len(), explanation.region_count);
    assert!(explanation.importance.iter().all(|v| v.is_finite()));
}

#[test]
fn narrow_kernel_keeps_every_weight_positive() {
    let video = quadrant_video([[30, 90], [150, 220]]);
    let config = ExplainConfig {
        kernel_width: 0.01,
        ..seeded(20, 4, 42)
    };
    let explanation = ExplainPipeline::new(config)
        .unwrap()
        .explain_instance(&lit_fraction, &video)
        .unwrap();
    assert!(
        explanation
            .dataset
            .weights
            .iter()
            .all(|&w| w > 0.0 && w <= 1.0)
    );
}

#[test]
fn importance_spans_unit_interval() {
    let video = quadrant_video([[30, 90], [150, 220]]);
    let pipeline = ExplainPipeline::new(seeded(60, 4, 5)).unwrap();
    let explanation = pipeline
        .explain_instance(&left_right_brightness, &video)
        .unwrap();

    assert!(!explanation.degenerate);
    let min = explanation.importance.iter().copied().fold(f64::INFINITY, f64::min);
    let max = explanation.importance.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    assert!(min.abs() < 1e-12);
    assert!((max - 1.0).abs() < 1e-12);
}

#[test]
fn constant_scorer_falls_back_to_uniform_zero() {
    let video = quadrant_video([[30, 90], [150, 220]]);
    let constant = |_: &VideoVolume| -> ScoreResult { Ok(vec![0.25, 0.75]) };
    let pipeline = ExplainPipeline::new(seeded(8, 4, 3)).unwrap();
    let explanation = pipeline.explain_instance(&constant, &video).unwrap();

    assert!(explanation.degenerate);
    assert_eq!(explanation.target_class, 1);
    assert_eq!(explanation.importance, vec![0.0; explanation.region_count]);
    assert!(explanation.coefficients.iter().all(|v| v.is_finite()));
}

#[test]
fn regions_that_keep_the_prediction_rank_highest() {
    // The top-left quadrant is already black, so blacking it out changes nothing.
    let video = quadrant_video([[0, 90], [150, 220]]);
    let original = video.clone();
    let exact_match =
        move |v: &VideoVolume| -> ScoreResult { Ok(vec![if *v == original { 1.0 } else { 0.0 }]) };

    let pipeline = ExplainPipeline::new(seeded(400, 4, 2024)).unwrap();
    let explanation = pipeline.explain_instance(&exact_match, &video).unwrap();
    assert_eq!(explanation.region_count, 4);
    assert!(!explanation.degenerate);

    let labels = explanation.labeling.labels();
    let silent = labels[[0, 0, 0]];
    for anchor in [[0, 0, 4], [0, 4, 0], [0, 4, 4]] {
        let region = labels[anchor];
        assert_ne!(region, silent);
        assert!(
            explanation.importance[silent] < explanation.importance[region],
            "importance {:?}",
            explanation.importance
        );
    }
}

#[test]
fn zero_importance_render_is_seventy_percent_of_original() {
    let video = quadrant_video([[30, 90], [150, 220]]);
    let constant = |_: &VideoVolume| -> ScoreResult { Ok(vec![1.0]) };
    let pipeline = ExplainPipeline::new(seeded(4, 4, 9)).unwrap();
    let explanation = pipeline.explain_instance(&constant, &video).unwrap();
    assert!(explanation.importance.iter().all(|&v| v == 0.0));

    let frames = pipeline
        .render(&video, &explanation, RenderMode::Continuous)
        .unwrap();
    assert_eq!(frames.len(), video.frame_count());
    for (index, frame) in frames.iter().enumerate() {
        let original = video.frame_to_rgb(index);
        for (out, src) in frame.pixels().zip(original.pixels()) {
            for c in 0..3 {
                assert_eq!(out.0[c], (0.7 * src.0[c] as f64).round() as u8);
            }
        }
    }
}

#[test]
fn invalid_config_never_reaches_the_scorer() {
    let calls = AtomicUsize::new(0);
    let counting = |_: &VideoVolume| -> ScoreResult {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![1.0])
    };
    let config = ExplainConfig {
        kernel_width: 0.0,
        ..Default::default()
    };
    assert!(matches!(
        ExplainPipeline::new(config),
        Err(LimeError::Validation(_))
    ));

    let ragged = [
        Array3::<u8>::zeros((8, 8, 1)),
        Array3::<u8>::zeros((8, 9, 1)),
    ];
    assert!(matches!(
        VideoVolume::from_frames(&ragged),
        Err(LimeError::Validation(_))
    ));

    // A valid run calls the scorer num_samples + 1 times.
    let pipeline = ExplainPipeline::new(seeded(6, 4, 1)).unwrap();
    pipeline
        .explain_instance(&counting, &quadrant_video([[30, 90], [150, 220]]))
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 7);
}

#[test]
fn scorer_failures_carry_their_sample() {
    let video = quadrant_video([[30, 90], [150, 220]]);
    let original = video.clone();
    let picky = move |v: &VideoVolume| -> ScoreResult {
        if *v == original {
            Ok(vec![0.5, 0.5])
        } else {
            Err("out of memory".to_string())
        }
    };
    let pipeline = ExplainPipeline::new(seeded(10, 4, 77)).unwrap();
    match pipeline.explain_instance(&picky, &video) {
        Err(LimeError::Scoring { sample, reason }) => {
            assert!(sample.is_some());
            assert!(reason.contains("out of memory"));
        }
        other => panic!("expected a scoring error, got {other:?}"),
    }

    let broken = |_: &VideoVolume| -> ScoreResult { Err("not loaded".to_string()) };
    let err = pipeline.explain_instance(&broken, &video).unwrap_err();
    assert!(matches!(err, LimeError::Scoring { sample: None, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_matches_sequential() {
    let video = quadrant_video([[30, 90], [150, 220]]);
    let config = seeded(24, 4, 31);

    let sequential = ExplainPipeline::new(config.clone())
        .unwrap()
        .explain_instance(&left_right_brightness, &video)
        .unwrap();
    let parallel = ParallelExplainPipeline::new(config)
        .unwrap()
        .explain_instance(Arc::new(left_right_brightness), Arc::new(video))
        .await
        .unwrap();

    assert_eq!(parallel.labeling, sequential.labeling);
    assert_eq!(parallel.baseline, sequential.baseline);
    assert_eq!(parallel.dataset.outputs, sequential.dataset.outputs);
    assert_eq!(parallel.dataset.weights, sequential.dataset.weights);
    assert_eq!(parallel.importance, sequential.importance);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_scorer_times_out() {
    // Every sample is at least 1, so only perturbed videos contain zeros.
    let video = quadrant_video([[31, 90], [150, 220]]);
    let slow = |v: &VideoVolume| -> ScoreResult {
        if v.data().iter().any(|&value| value == 0) {
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(vec![1.0])
    };
    let config = ExplainConfig {
        score_timeout: Some(Duration::from_millis(20)),
        ..seeded(6, 4, 12)
    };
    let err = ParallelExplainPipeline::new(config)
        .unwrap()
        .explain_instance(Arc::new(slow), Arc::new(video))
        .await
        .unwrap_err();
    match err {
        LimeError::Scoring { sample, reason } => {
            assert!(sample.is_some());
            assert!(reason.contains("timed out"));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[test]
fn explain_file_writes_overlay() {
    let dir = std::env::temp_dir().join(format!("lime3d_e2e_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    let video = quadrant_video([[30, 90], [150, 220]]);
    let frames: Vec<_> = (0..video.frame_count()).map(|i| video.frame_to_rgb(i)).collect();
    let input = dir.join("input");
    video_io::write_frames(&input, &frames).unwrap();

    let output = dir.join("overlay.gif");
    let pipeline = ExplainPipeline::new(seeded(6, 4, 8)).unwrap();
    let explanation = pipeline
        .explain_file(&lit_fraction, &input, &output, pipeline.config().highlight_mode())
        .unwrap();
    assert_eq!(explanation.importance.len(), explanation.region_count);

    let rendered = video_io::load_video(&output).unwrap();
    assert_eq!(rendered.volume_shape(), video.volume_shape());

    let json = serde_json::to_value(&explanation).unwrap();
    assert!(json.get("importance").is_some());
    assert!(json.get("labeling").is_none());
    let _ = std::fs::remove_dir_all(&dir);
}
