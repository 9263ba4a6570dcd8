use anyhow::Result;
use tempdir::TempDir;
use varibad_candle_agent::{
    encoder::EncoderConfig,
    metalearner::{MetaLearner, MetaLearnerConfig},
    ppo::PpoConfig,
};
use varibad_core::{
    envs::{GridNaviBuilder, GridNaviConfig},
    record::BufferedRecorder,
};

fn config(num_processes: usize, num_updates: usize) -> MetaLearnerConfig {
    let steps = 20;
    let mut config = MetaLearnerConfig::default()
        .num_processes(num_processes)
        .num_eval_processes(2)
        .policy_num_steps(steps)
        .episodes_per_task(2)
        .num_frames(num_processes * steps * num_updates)
        .pretrain(0, 0)
        .intervals(1, 2, 10, 100)
        .latent_dim(4)
        .strict_recompute_check(true)
        .ppo(PpoConfig::default().epochs(2, 2));
    config.vae.encoder = EncoderConfig::default().hidden_size(16).latent_dim(4);
    config.vae.vae_batch_num_trajs = 5;
    config
}

fn builder() -> GridNaviBuilder {
    GridNaviBuilder::new(GridNaviConfig::default().num_cells(4).num_steps(10))
}

#[test_log::test]
fn test_train_with_worker_threads() -> Result<()> {
    let mut learner = MetaLearner::build(config(3, 4), builder())?;
    let mut recorder = BufferedRecorder::new();
    learner.train(&mut recorder)?;

    assert_eq!(learner.frames(), 3 * 20 * 4);
    assert_eq!(recorder.scalars("policy_losses/action_loss").len(), 4);
    // Trajectories are completed after the first window
    assert!(!recorder.scalars("vae_losses/sum").is_empty());
    for v in recorder.scalars("vae_losses/sum") {
        assert!(v.is_finite());
    }

    // Evaluated at updates 0 and 2, and before training
    assert_eq!(recorder.scalars("Meta-Episode Return").len(), 3);
    assert_eq!(recorder.scalars("return_avg_per_iter/episode_2").len(), 3);
    Ok(())
}

#[test_log::test]
fn test_train_rl_loss_through_encoder() -> Result<()> {
    let mut config = config(2, 3);
    config.ppo = config.ppo.clone().rlloss_through_encoder(true);
    config = config.tbptt_stepsize(Some(5));
    let mut learner = MetaLearner::build(config, builder())?;
    let mut recorder = BufferedRecorder::new();
    learner.train(&mut recorder)?;

    for v in recorder.scalars("policy_losses/sum") {
        assert!(v.is_finite());
    }
    Ok(())
}

#[test_log::test]
fn test_train_oracle_inputs() -> Result<()> {
    let config = config(2, 2)
        .pass(true, true, true, false)
        .normalise_rewards(false)
        .use_proper_time_limits(true);
    let mut learner = MetaLearner::build(config, builder())?;
    let mut recorder = BufferedRecorder::new();
    learner.train(&mut recorder)?;
    assert_eq!(recorder.scalars("policy_losses/value_loss").len(), 2);
    Ok(())
}

#[test_log::test]
fn test_pretrain_and_precollect() -> Result<()> {
    // The first window only collects, the second pretrains the VAE, the third updates
    let config = config(2, 3).pretrain(3, 2 * 20 * 2);
    let mut learner = MetaLearner::build(config, builder())?;
    let mut recorder = BufferedRecorder::new();
    learner.train(&mut recorder)?;
    assert_eq!(recorder.scalars("policy_losses/value_loss").len(), 1);
    Ok(())
}

#[test_log::test]
fn test_save_and_load() -> Result<()> {
    let dir = TempDir::new("varibad_save")?;
    let config = config(2, 2)
        .intervals(1, 100, 100, 1)
        .save_intermediate_models(true)
        .model_dir(dir.path().to_string_lossy());
    let mut learner = MetaLearner::build(config.clone(), builder())?;
    learner.train(&mut BufferedRecorder::new())?;

    let models = dir.path().join("models");
    for name in [
        "policy.safetensors",
        "policy0.safetensors",
        "policy1.safetensors",
        "encoder.safetensors",
        "reward_decoder1.safetensors",
        "env_rew_rms.json",
        "env_rew_rms0.json",
    ]
    .iter()
    {
        assert!(models.join(name).exists(), "{} is missing", name);
    }

    let mut restored = MetaLearner::build(config, builder())?;
    restored.load(dir.path())?;
    let result = restored.evaluate()?;
    assert_eq!(result.returns.len(), 2);
    assert_eq!(result.returns[0].len(), 2);
    Ok(())
}
