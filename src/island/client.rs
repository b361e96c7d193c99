use super::protocol::{IslandCommand, IslandReply};
use super::worker::IslandWorker;
use super::IslandError;
use crate::evolution::EmigrantBatch;
use crate::individual::{BestIndividual, Individual};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

fn unexpected(expected: &'static str, got: IslandReply) -> IslandError {
    IslandError::UnexpectedReply {
        expected,
        got: got.name().to_string(),
    }
}

/// Coordinator-side handle on one island. Implementors only provide `send`;
/// the typed helpers unwrap the matching reply.
pub trait IslandClient: Send + Sync {
    fn send(
        &self,
        command: IslandCommand,
    ) -> impl Future<Output = Result<IslandReply, IslandError>> + Send;

    fn configure_store(&self, path: PathBuf) -> impl Future<Output = Result<(), IslandError>> + Send {
        let reply = self.send(IslandCommand::ConfigureStore { path });
        async move {
            match reply.await? {
                IslandReply::Configured => Ok(()),
                other => Err(unexpected("Configured", other)),
            }
        }
    }

    fn start(&self) -> impl Future<Output = Result<BestIndividual, IslandError>> + Send {
        let reply = self.send(IslandCommand::StartGenerator);
        async move {
            match reply.await? {
                IslandReply::Generation(best) => Ok(best),
                other => Err(unexpected("Generation", other)),
            }
        }
    }

    fn advance(&self) -> impl Future<Output = Result<BestIndividual, IslandError>> + Send {
        let reply = self.send(IslandCommand::AdvanceGeneration);
        async move {
            match reply.await? {
                IslandReply::Generation(best) => Ok(best),
                other => Err(unexpected("Generation", other)),
            }
        }
    }

    fn fetch_best(&self) -> impl Future<Output = Result<Option<BestIndividual>, IslandError>> + Send {
        let reply = self.send(IslandCommand::FetchBest);
        async move {
            match reply.await? {
                IslandReply::Best(best) => Ok(best),
                other => Err(unexpected("Best", other)),
            }
        }
    }

    fn check_terminated(&self) -> impl Future<Output = Result<bool, IslandError>> + Send {
        let reply = self.send(IslandCommand::CheckTerminated);
        async move {
            match reply.await? {
                IslandReply::Terminated(ended) => Ok(ended),
                other => Err(unexpected("Terminated", other)),
            }
        }
    }

    fn select_emigrants(
        &self,
        probability: f64,
    ) -> impl Future<Output = Result<EmigrantBatch, IslandError>> + Send {
        let reply = self.send(IslandCommand::SelectEmigrants { probability });
        async move {
            match reply.await? {
                IslandReply::Emigrants(batch) => Ok(batch),
                other => Err(unexpected("Emigrants", other)),
            }
        }
    }

    fn insert_immigrants(
        &self,
        batch: Vec<Individual>,
    ) -> impl Future<Output = Result<usize, IslandError>> + Send {
        let reply = self.send(IslandCommand::InsertImmigrants { batch });
        async move {
            match reply.await? {
                IslandReply::Inserted { population_size } => Ok(population_size),
                other => Err(unexpected("Inserted", other)),
            }
        }
    }

    fn confirm_emigrants(&self, ticket: Uuid) -> impl Future<Output = Result<usize, IslandError>> + Send {
        let reply = self.send(IslandCommand::ConfirmEmigrants { ticket });
        async move {
            match reply.await? {
                IslandReply::Confirmed { removed } => Ok(removed),
                other => Err(unexpected("Confirmed", other)),
            }
        }
    }

    fn release_emigrants(&self, ticket: Uuid) -> impl Future<Output = Result<usize, IslandError>> + Send {
        let reply = self.send(IslandCommand::ReleaseEmigrants { ticket });
        async move {
            match reply.await? {
                IslandReply::Released { restored } => Ok(restored),
                other => Err(unexpected("Released", other)),
            }
        }
    }

    fn population_size(&self) -> impl Future<Output = Result<usize, IslandError>> + Send {
        let reply = self.send(IslandCommand::PopulationSize);
        async move {
            match reply.await? {
                IslandReply::PopulationSize(size) => Ok(size),
                other => Err(unexpected("PopulationSize", other)),
            }
        }
    }
}

type Job = (IslandCommand, oneshot::Sender<Result<IslandReply, IslandError>>);

/// An island running in this process: a tokio task owns the worker and runs
/// one command at a time on the blocking pool.
#[derive(Clone)]
pub struct LocalIsland {
    sender: mpsc::Sender<Job>,
}

impl LocalIsland {
    /// Must be called from within a tokio runtime.
    pub fn spawn(worker: IslandWorker) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Job>(16);
        let worker = Arc::new(Mutex::new(worker));
        tokio::spawn(async move {
            while let Some((command, reply_to)) = receiver.recv().await {
                let worker = Arc::clone(&worker);
                let result = tokio::task::spawn_blocking(move || {
                    let mut worker = worker
                        .lock()
                        .map_err(|_| IslandError::Transport("island worker poisoned".into()))?;
                    worker.handle(command)
                })
                .await
                .unwrap_or_else(|e| Err(IslandError::Transport(e.to_string())));
                // the caller may have given up waiting
                let _ = reply_to.send(result);
            }
        });
        LocalIsland { sender }
    }
}

impl IslandClient for LocalIsland {
    fn send(
        &self,
        command: IslandCommand,
    ) -> impl Future<Output = Result<IslandReply, IslandError>> + Send {
        let sender = self.sender.clone();
        async move {
            let (reply_to, reply) = oneshot::channel();
            sender
                .send((command, reply_to))
                .await
                .map_err(|_| IslandError::Transport("island task has stopped".into()))?;
            reply
                .await
                .map_err(|_| IslandError::Transport("island dropped the reply".into()))?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvolverConfig;
    use crate::island::worker::IslandBlueprint;
    use crate::problems::ProblemKind;

    #[tokio::test]
    async fn test_local_island_answers_typed_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let config = EvolverConfig {
            population_size: 8,
            max_depth: 4,
            seed: Some(2),
            max_concurrency: 1,
            ..EvolverConfig::default()
        };
        let blueprint = IslandBlueprint::from_problem(config, ProblemKind::SymbolicRegression).unwrap();
        let island = LocalIsland::spawn(IslandWorker::new(blueprint));

        assert!(matches!(
            island.start().await,
            Err(IslandError::NotConfigured)
        ));
        island.configure_store(dir.path().join("a.json")).await.unwrap();
        assert_eq!(island.start().await.unwrap().generation, 0);
        assert_eq!(island.fetch_best().await.unwrap().unwrap().generation, 0);
        assert!(!island.check_terminated().await.unwrap());
        assert_eq!(island.population_size().await.unwrap(), 8);
    }
}
