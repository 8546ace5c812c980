use glam::{DVec2, DVec3};
use kornia_sfm::bundle::IterationState;
use kornia_sfm::residual::mean_reprojection_error;
use kornia_sfm::synthetic::{SyntheticConfig, SyntheticScene};
use kornia_sfm::{
    triangulate_points, BundleAdjuster, BundleAdjustmentError, BundleProblem, CameraPose,
    Observation, ProblemError, ResidualError, SolverConfig, SolverStatus, TerminationReason,
    TriangulationParams,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn triangulated_problem(
    config: &SyntheticConfig,
) -> Result<BundleProblem, Box<dyn std::error::Error>> {
    let scene = SyntheticScene::generate(config);
    let triangulation = triangulate_points(
        &scene.cameras,
        &scene.camera_model,
        &scene.observations,
        &TriangulationParams::default(),
    )?;
    let (problem, _) = BundleProblem::from_triangulation(
        scene.cameras.clone(),
        &scene.observations,
        scene.camera_model,
        &triangulation,
    )?;
    Ok(problem)
}

/// An exact triangulation of noise-free data is already at the optimum
#[test]
fn test_exact_start_is_converged() -> TestResult {
    let problem = triangulated_problem(&SyntheticConfig {
        num_cameras: 5,
        num_points: 50,
        noise_std: 0.0,
        seed: 42,
    })?;

    let result = BundleAdjuster::new(SolverConfig::default())?.run(&problem)?;

    assert_eq!(result.status, SolverStatus::Converged);
    assert_eq!(result.termination, TerminationReason::CostConverged);
    assert_eq!(result.iterations, 0);
    assert!(result.final_residual_norm < 1e-6);
    Ok(())
}

/// A perturbed noise-free state is pulled back to zero reprojection error within the
/// default iteration budget
#[test]
fn test_perturbed_convergence() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: 5,
        num_points: 50,
        noise_std: 0.0,
        seed: 17,
    });
    let problem = scene.perturbed_problem(0.02, 0.05, 3)?;

    let adjuster = BundleAdjuster::new(SolverConfig::default().with_max_iterations(15))?;
    let result = adjuster.run(&problem)?;

    assert!(result.initial_residual_norm > 1.0);
    assert!(result.converged());
    assert!(result.iterations >= 1);
    assert!(result.iterations <= 15);
    assert!(
        result.final_residual_norm < 1e-4,
        "final residual norm {}",
        result.final_residual_norm
    );
    // the gauge camera is untouched
    assert_eq!(result.cameras[0], scene.cameras[0]);
    Ok(())
}

/// Refinement reduces the reprojection error of noisy data
#[test]
fn test_noisy_refinement() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig::default());
    let problem = scene.perturbed_problem(0.01, 0.02, 5)?;

    let result = BundleAdjuster::new(SolverConfig::default())?.run(&problem)?;
    let refined = result.to_problem(&problem)?;

    let before = mean_reprojection_error(problem.cameras(), problem.points(), &problem)?;
    let after = mean_reprojection_error(refined.cameras(), refined.points(), &refined)?;
    assert!(after < before);
    assert!(result.final_residual_norm < result.initial_residual_norm);
    // the refined state fits the 1 px noise, not better than the noise level allows
    assert!(after > 0.3 && after < 1.5, "mean reprojection error {after}");
    Ok(())
}

/// Every accepted step decreases the cost
#[test]
fn test_monotonic_cost() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: 6,
        num_points: 40,
        noise_std: 1.0,
        seed: 8,
    });
    let problem = scene.perturbed_problem(0.03, 0.1, 2)?;

    let mut states: Vec<IterationState> = Vec::new();
    let result = BundleAdjuster::new(SolverConfig::default().with_max_iterations(30))?
        .run_with_callback(&problem, |state| {
            states.push(*state);
            true
        })?;

    let accepted: Vec<&IterationState> = states.iter().filter(|s| s.accepted).collect();
    assert!(!accepted.is_empty());
    for state in &accepted {
        assert!(state.candidate_cost < state.cost);
    }
    for pair in accepted.windows(2) {
        assert!(pair[1].cost < pair[0].cost);
        assert_eq!(pair[1].cost, pair[0].candidate_cost);
    }
    for state in states.iter().filter(|s| !s.accepted) {
        assert!(!(state.candidate_cost < state.cost));
    }
    let last = accepted[accepted.len() - 1];
    assert!(result.final_residual_norm <= last.candidate_cost.sqrt());
    Ok(())
}

/// Accepted steps never raise the damping and rejected steps always raise it
#[test]
fn test_damping_monotonicity() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: 5,
        num_points: 30,
        noise_std: 2.0,
        seed: 21,
    });
    let problem = scene.perturbed_problem(0.1, 0.3, 6)?;

    // a tiny initial damping makes the first Gauss-Newton steps overshoot
    let config = SolverConfig::default()
        .with_initial_damping(1e-6)
        .with_damping_bounds(1e-9, 1e10)
        .with_max_iterations(30);

    let mut states: Vec<IterationState> = Vec::new();
    BundleAdjuster::new(config)?.run_with_callback(&problem, |state| {
        states.push(*state);
        true
    })?;

    for state in &states {
        if state.accepted {
            assert!(state.next_damping <= state.damping);
        } else {
            assert!(state.next_damping > state.damping);
        }
    }
    for pair in states.windows(2) {
        assert_eq!(pair[1].damping, pair[0].next_damping);
    }
    Ok(())
}

/// Running again from a converged estimate changes almost nothing
#[test]
fn test_idempotence_near_optimum() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig::default());
    let problem = scene.perturbed_problem(0.01, 0.02, 12)?;
    let adjuster = BundleAdjuster::new(SolverConfig::default().with_max_iterations(50))?;

    let first = adjuster.run(&problem)?;
    assert!(first.converged());

    let refined = first.to_problem(&problem)?;
    let second = adjuster.run(&refined)?;
    assert!(second.converged());
    assert!(second.final_residual_norm <= first.final_residual_norm * (1.0 + 1e-9));
    assert!(
        (first.final_residual_norm - second.final_residual_norm).abs()
            < 1e-4 * first.final_residual_norm
    );
    for (a, b) in first.points.iter().zip(&second.points) {
        assert!((*a - *b).length() < 1e-3);
    }
    Ok(())
}

/// Identical inputs give identical outputs
#[test]
fn test_deterministic_runs() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig::default());
    let problem = scene.perturbed_problem(0.01, 0.02, 4)?;
    let adjuster = BundleAdjuster::new(SolverConfig::default())?;

    let a = adjuster.run(&problem)?;
    let b = adjuster.run(&problem)?;
    assert_eq!(a.cameras, b.cameras);
    assert_eq!(a.points, b.points);
    assert_eq!(a.iterations, b.iterations);
    Ok(())
}

/// A point seen by a single camera cannot be refined
#[test]
fn test_rank_deficiency() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: 3,
        num_points: 10,
        noise_std: 0.0,
        seed: 1,
    });
    let mut points = scene.points.clone();
    points.push(DVec3::new(0.0, 0.0, 0.5));
    let mut observations = scene.observations.clone();
    let extra = scene.camera_model.project(&scene.cameras[1].transform_point(&points[10]));
    observations.push(Observation::new(1, 10, extra.unwrap_or(DVec2::ZERO)));

    let problem = BundleProblem::new(
        scene.cameras.clone(),
        points,
        observations,
        scene.camera_model,
    )?;
    let result = BundleAdjuster::new(SolverConfig::default())?.run(&problem);
    assert!(matches!(
        result,
        Err(BundleAdjustmentError::RankDeficiency(_))
    ));
    Ok(())
}

/// An initial point behind its camera is reported, not silently dropped
#[test]
fn test_point_behind_camera() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: 3,
        num_points: 10,
        noise_std: 0.0,
        seed: 1,
    });
    let mut points = scene.points.clone();
    // far behind every camera of the arc
    points[4] = DVec3::new(0.0, -100.0, 0.0);
    let problem = BundleProblem::new(
        scene.cameras.clone(),
        points,
        scene.observations.clone(),
        scene.camera_model,
    )?;

    let result = BundleAdjuster::new(SolverConfig::default())?.run(&problem);
    assert!(matches!(
        result,
        Err(BundleAdjustmentError::Residual(
            ResidualError::PointBehindCamera { .. }
        ))
    ));
    Ok(())
}

/// A non-finite point is rejected when the problem is assembled
#[test]
fn test_non_finite_point_is_rejected() {
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: 3,
        num_points: 10,
        noise_std: 0.0,
        seed: 1,
    });
    let mut points = scene.points.clone();
    points[2] = DVec3::new(f64::NAN, 0.0, 0.0);

    let result = BundleProblem::new(
        scene.cameras.clone(),
        points,
        scene.observations.clone(),
        scene.camera_model,
    );
    assert!(matches!(
        result,
        Err(ProblemError::NonFiniteState {
            kind: "point",
            index: 2
        })
    ));
}

/// Invalid settings are rejected before any work is done
#[test]
fn test_invalid_configuration() {
    for config in [
        SolverConfig::default().with_max_iterations(0),
        SolverConfig::default().with_initial_damping(-1.0),
        SolverConfig::default().with_damping_factor(1.0),
        SolverConfig::default().with_convergence_threshold(-1e-6),
    ] {
        assert!(matches!(
            BundleAdjuster::new(config),
            Err(BundleAdjustmentError::InvalidConfiguration(_))
        ));
    }

    // fixed cameras are checked against the problem
    let scene = SyntheticScene::generate(&SyntheticConfig::default());
    let problem = scene.problem().unwrap();
    let adjuster =
        BundleAdjuster::new(SolverConfig::default().with_fixed_cameras(vec![0, 10])).unwrap();
    assert!(matches!(
        adjuster.run(&problem),
        Err(BundleAdjustmentError::InvalidConfiguration(_))
    ));
}

/// Fixing every camera refines the points only
#[test]
fn test_all_cameras_fixed() -> TestResult {
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: 4,
        num_points: 20,
        noise_std: 0.5,
        seed: 13,
    });
    let problem = scene.perturbed_problem(0.0, 0.05, 1)?;
    let config = SolverConfig::default().with_fixed_cameras(vec![0, 1, 2, 3]);
    let result = BundleAdjuster::new(config)?.run(&problem)?;

    let cameras: Vec<CameraPose> = problem.cameras().to_vec();
    assert_eq!(result.cameras, cameras);
    assert!(result.final_residual_norm < result.initial_residual_norm);
    Ok(())
}
