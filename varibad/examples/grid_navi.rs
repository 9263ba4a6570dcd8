use anyhow::{bail, Result};
use clap::Parser;
use csv::WriterBuilder;
use log::info;
use serde::Serialize;
use std::{fs, path::Path};
use varibad::{
    agent::Device, GridNaviBuilder, GridNaviConfig, MetaLearner, MetaLearnerConfig,
    TensorboardRecorder,
};

const MODEL_DIR: &str = "./varibad/examples/model/grid_navi";

/// Train/eval VariBAD in the GridNavi environment
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Train the meta-learner
    #[arg(short, long, default_value_t = false)]
    train: bool,

    /// Evaluate a trained meta-learner
    #[arg(short, long, default_value_t = false)]
    eval: bool,

    /// YAML file of the configuration; command line arguments override it
    #[arg(long)]
    config: Option<String>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// The number of workers
    #[arg(long)]
    num_processes: Option<usize>,

    /// The number of environment frames
    #[arg(long)]
    num_frames: Option<usize>,

    /// The number of inner episodes per task
    #[arg(long)]
    episodes_per_task: Option<usize>,

    /// Dimension of the latent task embedding
    #[arg(long)]
    latent_dim: Option<usize>,

    /// Learning rate of the policy
    #[arg(long)]
    lr_policy: Option<f64>,

    /// Learning rate of the encoder and the decoders
    #[arg(long)]
    lr_vae: Option<f64>,

    /// Feed states to the policy
    #[arg(long)]
    pass_state: Option<bool>,

    /// Feed ground-truth beliefs to the policy
    #[arg(long)]
    pass_belief: Option<bool>,

    /// Feed ground-truth tasks to the policy
    #[arg(long)]
    pass_task: Option<bool>,

    /// Feed latent embeddings to the policy
    #[arg(long)]
    pass_latent: Option<bool>,

    /// The number of cells along each axis of the grid
    #[arg(long, default_value_t = 5)]
    num_cells: usize,

    /// Use CUDA device with the given index
    #[arg(long)]
    cuda: Option<usize>,

    /// Directory of checkpoints and logs
    #[arg(long, default_value = MODEL_DIR)]
    model_dir: String,
}

#[derive(Debug, Serialize)]
struct EvalRecord {
    worker: usize,
    episode: usize,
    ret: f32,
}

fn create_config(args: &Args) -> Result<MetaLearnerConfig> {
    let mut config = match &args.config {
        Some(path) => MetaLearnerConfig::load(path)?,
        None => MetaLearnerConfig::default(),
    };
    if let Some(v) = args.seed {
        config = config.seed(v);
    }
    if let Some(v) = args.num_processes {
        config = config.num_processes(v).num_eval_processes(v);
    }
    if let Some(v) = args.num_frames {
        config = config.num_frames(v);
    }
    if let Some(v) = args.episodes_per_task {
        config = config.episodes_per_task(v);
    }
    if let Some(v) = args.latent_dim {
        config = config.latent_dim(v);
    }
    if let Some(v) = args.lr_policy {
        config = config.lr_policy(v);
    }
    if let Some(v) = args.lr_vae {
        config = config.lr_vae(v);
    }
    let p = &config.policy;
    let pass = (
        args.pass_state.unwrap_or(p.pass_state),
        args.pass_belief.unwrap_or(p.pass_belief),
        args.pass_task.unwrap_or(p.pass_task),
        args.pass_latent.unwrap_or(p.pass_latent),
    );
    config = config.pass(pass.0, pass.1, pass.2, pass.3);
    if let Some(n) = args.cuda {
        config = config.device(Device::Cuda(n));
    }
    config = config.model_dir(args.model_dir.as_str());

    config.check()?;
    Ok(config)
}

fn env_builder(args: &Args) -> GridNaviBuilder {
    GridNaviBuilder::new(GridNaviConfig::default().num_cells(args.num_cells))
}

fn train(args: &Args, config: MetaLearnerConfig) -> Result<()> {
    fs::create_dir_all(&args.model_dir)?;
    config.save(Path::new(&args.model_dir).join("config.yaml"))?;
    let mut recorder = TensorboardRecorder::new(&args.model_dir);
    let mut learner = MetaLearner::build(config, env_builder(args))?;
    learner.train(&mut recorder)?;
    recorder.flush();
    Ok(())
}

fn eval(args: &Args, config: MetaLearnerConfig) -> Result<()> {
    let mut learner = MetaLearner::build(config, env_builder(args))?;
    learner.load(&args.model_dir)?;
    let result = learner.evaluate()?;
    info!("Meta-Episode Return {:.2}", result.meta_episode_return());
    for (k, r) in result.mean_per_episode().iter().enumerate() {
        info!("Episode {}: average return {:.2}", k + 1, r);
    }

    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .from_path(Path::new(&args.model_dir).join("eval.csv"))?;
    for (worker, returns) in result.returns.iter().enumerate() {
        for (episode, &ret) in returns.iter().enumerate() {
            wtr.serialize(EvalRecord {
                worker,
                episode: episode + 1,
                ret,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.train == args.eval {
        bail!("Specify exactly one of --train and --eval");
    }
    let config = create_config(&args)?;

    if args.train {
        train(&args, config)?;
    } else {
        eval(&args, config)?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_grid_navi_train_and_eval() -> Result<()> {
        let tmp_dir = TempDir::new("grid_navi")?;
        let model_dir = tmp_dir.path().to_string_lossy().to_string();
        let args = Args::parse_from(&[
            "grid_navi",
            "--train",
            "--num-processes",
            "2",
            "--num-frames",
            "240",
            "--model-dir",
            model_dir.as_str(),
        ]);
        let mut config = create_config(&args)?.policy_num_steps(60).pretrain(0, 0);
        config.ppo = config.ppo.clone().epochs(1, 2);
        config.save_interval = 1;
        train(&args, config.clone())?;
        assert!(Path::new(&model_dir).join("models/policy.safetensors").exists());

        eval(&args, config)?;
        assert!(Path::new(&model_dir).join("eval.csv").exists());
        Ok(())
    }

    #[test]
    fn test_invalid_arguments() {
        let args = Args::parse_from(&["grid_navi", "--train", "--num-processes", "0"]);
        assert!(create_config(&args).is_err());

        let args = Args::parse_from(&[
            "grid_navi",
            "--pass-state",
            "false",
            "--pass-latent",
            "false",
        ]);
        assert!(create_config(&args).is_err());
    }
}
