//! Parallel workers for [`VecEnv`].
//!
//! Workers are OS threads in the training process, not separate processes. Each
//! thread builds its own environment with [`EnvBuilder`] and talks to the training
//! loop only through `crossbeam_channel` commands and replies, so environments share
//! no state. A panicking environment ends only its own thread, and the training loop
//! then gets [`VaribadError::WorkerDisconnected`].
use super::{
    base::{target_indices, tasks_for},
    make_worker_env,
    messages::{Command, Response},
    EnvSpec, VecEnv, VecStep,
};
use crate::{error::VaribadError, Act, BamdpConfig, EnvBuilder, MetaEnv};
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use std::thread::JoinHandle;

struct Worker {
    sender: Sender<Command>,
    receiver: Receiver<Result<Response>>,
    handle: Option<JoinHandle<()>>,
}

/// Runs each environment in its own thread.
///
/// Commands are sent to all workers before any reply is awaited, so environments
/// step concurrently. Replies are collected in worker order, which fixes the order
/// of results regardless of which worker finishes first.
pub struct SubprocVecEnv {
    workers: Vec<Worker>,
    spec: EnvSpec,
    waiting: Vec<usize>,
}

impl SubprocVecEnv {
    /// Spawns `n` worker threads, each building its environment with `builder`.
    pub fn build<B: EnvBuilder>(
        builder: B,
        n: usize,
        seed: u64,
        config: &BamdpConfig,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(n);
        for rank in 0..n {
            let (cmd_sender, cmd_receiver) = bounded::<Command>(1);
            let (resp_sender, resp_receiver) = bounded::<Result<Response>>(1);
            let builder = builder.clone();
            let config = config.clone();
            let handle = std::thread::spawn(move || {
                match make_worker_env(&builder, seed, rank, &config) {
                    Ok(env) => {
                        if resp_sender.send(Ok(Response::Spec(EnvSpec::of(&env)))).is_ok() {
                            run_worker(env, cmd_receiver, resp_sender);
                        }
                    }
                    Err(e) => {
                        let _ = resp_sender.send(Err(e));
                    }
                }
            });
            debug!("Starts worker thread {}", rank);
            workers.push(Worker {
                sender: cmd_sender,
                receiver: resp_receiver,
                handle: Some(handle),
            });
        }

        let mut specs = Vec::with_capacity(n);
        for (i, w) in workers.iter().enumerate() {
            match w.receiver.recv() {
                Ok(Ok(Response::Spec(spec))) => specs.push(spec),
                Ok(Err(e)) => return Err(e),
                _ => return Err(VaribadError::WorkerDisconnected(i).into()),
            }
        }
        let spec = specs
            .into_iter()
            .next()
            .ok_or_else(|| VaribadError::ConfigError("no environment to vectorize".into()))?;

        Ok(Self {
            workers,
            spec,
            waiting: vec![],
        })
    }

    fn send(&self, i: usize, cmd: Command) -> Result<()> {
        self.workers[i]
            .sender
            .send(cmd)
            .map_err(|_| VaribadError::WorkerDisconnected(i).into())
    }

    fn recv(&self, i: usize) -> Result<Response> {
        match self.workers[i].receiver.recv() {
            Ok(resp) => resp,
            Err(_) => Err(VaribadError::WorkerDisconnected(i).into()),
        }
    }

    fn recv_obs(&self, i: usize) -> Result<Vec<f32>> {
        match self.recv(i)? {
            Response::Obs(obs) => Ok(obs),
            _ => Err(VaribadError::WorkerDisconnected(i).into()),
        }
    }
}

fn run_worker<E: MetaEnv>(
    mut env: super::WorkerEnv<E>,
    receiver: Receiver<Command>,
    sender: Sender<Result<Response>>,
) {
    for cmd in receiver.iter() {
        let resp = match cmd {
            Command::Reset(task) => env.reset(task.as_deref()).map(Response::Obs),
            Command::ResetMdp => env.reset_mdp().map(Response::Obs),
            Command::Step(act) => env.step(&act).map(Response::Step),
            Command::GetTask => Ok(Response::Task(env.get_task())),
            Command::GetBelief => Ok(Response::Belief(env.get_belief())),
            Command::Close => break,
        };
        if sender.send(resp).is_err() {
            break;
        }
    }
}

impl VecEnv for SubprocVecEnv {
    fn spec(&self) -> &EnvSpec {
        &self.spec
    }

    fn num_envs(&self) -> usize {
        self.workers.len()
    }

    fn reset_async(&mut self, index: Option<usize>, tasks: Option<Vec<Vec<f32>>>) -> Result<()> {
        let targets = target_indices(index, self.workers.len())?;
        let tasks = tasks_for(&targets, tasks)?;
        for (&i, task) in targets.iter().zip(tasks.into_iter()) {
            self.send(i, Command::Reset(task))?;
        }
        self.waiting = targets;
        Ok(())
    }

    fn reset_wait(&mut self) -> Result<Vec<Vec<f32>>> {
        let waiting = std::mem::take(&mut self.waiting);
        // Drains every reply before reporting an error
        let obs: Vec<_> = waiting.into_iter().map(|i| self.recv_obs(i)).collect();
        obs.into_iter().collect()
    }

    fn step_async(&mut self, acts: Vec<Act>) -> Result<()> {
        if acts.len() != self.workers.len() {
            return Err(VaribadError::ConfigError(format!(
                "{} actions given for {} environments",
                acts.len(),
                self.workers.len()
            ))
            .into());
        }
        for (i, act) in acts.into_iter().enumerate() {
            self.send(i, Command::Step(act))?;
        }
        self.waiting = (0..self.workers.len()).collect();
        Ok(())
    }

    fn step_wait(&mut self) -> Result<VecStep> {
        let waiting = std::mem::take(&mut self.waiting);
        let steps: Vec<Result<_>> = waiting
            .into_iter()
            .map(|i| match self.recv(i)? {
                Response::Step(step) => Ok(step),
                _ => Err(VaribadError::WorkerDisconnected(i).into()),
            })
            .collect();
        let steps = steps.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(VecStep::from_steps(steps))
    }

    fn reset_mdp(&mut self, index: Option<usize>) -> Result<Vec<Vec<f32>>> {
        let targets = target_indices(index, self.workers.len())?;
        for &i in targets.iter() {
            self.send(i, Command::ResetMdp)?;
        }
        targets.into_iter().map(|i| self.recv_obs(i)).collect()
    }

    fn get_task(&self) -> Result<Vec<Vec<f32>>> {
        for i in 0..self.workers.len() {
            self.send(i, Command::GetTask)?;
        }
        (0..self.workers.len())
            .map(|i| match self.recv(i)? {
                Response::Task(task) => Ok(task),
                _ => Err(VaribadError::WorkerDisconnected(i).into()),
            })
            .collect()
    }

    fn get_belief(&self) -> Result<Option<Vec<Vec<f32>>>> {
        for i in 0..self.workers.len() {
            self.send(i, Command::GetBelief)?;
        }
        let beliefs = (0..self.workers.len())
            .map(|i| match self.recv(i)? {
                Response::Belief(belief) => Ok(belief),
                _ => Err(VaribadError::WorkerDisconnected(i).into()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(beliefs.into_iter().collect())
    }
}

impl Drop for SubprocVecEnv {
    fn drop(&mut self) {
        for w in self.workers.iter() {
            let _ = w.sender.send(Command::Close);
        }
        for (i, w) in self.workers.iter_mut().enumerate() {
            if let Some(handle) = w.handle.take() {
                if handle.join().is_err() {
                    warn!("Worker thread {} panicked", i);
                }
            }
            debug!("Stops worker thread {}", i);
        }
    }
}
