use argh::FromArgs;
use std::path::PathBuf;

use kornia_sfm::residual::mean_reprojection_error;
use kornia_sfm::synthetic::{SyntheticConfig, SyntheticScene};
use kornia_sfm::{
    triangulate_points, BundleAdjuster, BundleProblem, SolverConfig, TriangulationParams,
};

#[derive(FromArgs)]
/// Triangulate a synthetic scene and refine it with bundle adjustment
struct Args {
    /// number of cameras
    #[argh(option, default = "5")]
    num_cameras: usize,

    /// number of points
    #[argh(option, default = "50")]
    num_points: usize,

    /// standard deviation of the pixel noise
    #[argh(option, default = "1.0")]
    noise_std: f64,

    /// seed of the random generator
    #[argh(option, default = "42")]
    seed: u64,

    /// path to a JSON file with the solver configuration
    #[argh(option)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let solver_config = match &args.config {
        Some(path) => serde_json::from_str::<SolverConfig>(&std::fs::read_to_string(path)?)?,
        None => SolverConfig::default(),
    };

    // generate the scene
    let scene = SyntheticScene::generate(&SyntheticConfig {
        num_cameras: args.num_cameras,
        num_points: args.num_points,
        noise_std: args.noise_std,
        seed: args.seed,
    });
    log::info!(
        "generated {} cameras, {} points, {} observations",
        scene.cameras.len(),
        scene.points.len(),
        scene.observations.len()
    );

    // triangulate the points from the known cameras
    let triangulation = triangulate_points(
        &scene.cameras,
        &scene.camera_model,
        &scene.observations,
        &TriangulationParams::default(),
    )?;
    let quality = &triangulation.quality;

    println!("Triangulation");
    println!(
        "  triangulated points:        {}/{}",
        triangulation.num_triangulated(),
        triangulation.points.len()
    );
    println!(
        "  mean reprojection error:    {:.4} px",
        quality.mean_reprojection_error
    );
    println!(
        "  max reprojection error:     {:.4} px",
        quality.max_reprojection_error
    );
    println!("  min conditioning:           {:.3e}", quality.min_conditioning);
    println!("  points above threshold:     {}", quality.num_exceeding());
    println!("  ill-conditioned points:     {}", quality.num_ill_conditioned());
    for failure in &triangulation.failures {
        println!("  skipped: {failure}");
    }

    // refine cameras and points
    let (problem, original_indices) = BundleProblem::from_triangulation(
        scene.cameras.clone(),
        &scene.observations,
        scene.camera_model,
        &triangulation,
    )?;
    let before = mean_reprojection_error(problem.cameras(), problem.points(), &problem)?;

    let result = BundleAdjuster::new(solver_config)?.run(&problem)?;
    let refined = result.to_problem(&problem)?;
    let after = mean_reprojection_error(refined.cameras(), refined.points(), &refined)?;

    let position_error = refined
        .points()
        .iter()
        .zip(&original_indices)
        .map(|(p, &i)| (*p - scene.points[i]).length())
        .sum::<f64>()
        / original_indices.len().max(1) as f64;

    println!("Bundle adjustment");
    println!("  status:                     {:?}", result.status);
    println!("  termination:                {:?}", result.termination);
    println!("  iterations:                 {}", result.iterations);
    println!("  final damping:              {:.1e}", result.final_damping);
    println!(
        "  residual norm:              {:.4} -> {:.4}",
        result.initial_residual_norm, result.final_residual_norm
    );
    println!(
        "  mean reprojection error:    {:.4} -> {:.4} px ({:.1}% improvement)",
        before,
        after,
        if before > 0.0 {
            100.0 * (before - after) / before
        } else {
            0.0
        }
    );
    println!("  mean 3D error to truth:     {:.4}", position_error);

    Ok(())
}
