//! Async front for the blocking session operations.
//!
//! Every call that may reach the cluster runs on the blocking pool so the
//! caller's runtime thread never waits on a round-trip. Completion of a
//! lifecycle poll is reported through [`Session::subscribe`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::StreamExt as _;
use futures_util::stream::FuturesUnordered;

use crate::apply::ApplyReport;
use crate::error::HamcError;
use crate::intent::Submitted;
use crate::lifecycle::{CommandOutcome, DomainCommand};
use crate::session::Session;

type ApplyFuture = Pin<Box<dyn Future<Output = (String, Result<ApplyReport, HamcError>)> + Send>>;

#[derive(Clone)]
pub struct WorkerPool {
    session: Arc<Session>,
}

impl WorkerPool {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    async fn run<T, F>(&self, f: F) -> Result<T, HamcError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, HamcError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        tokio::task::spawn_blocking(move || f(&session))
            .await
            .map_err(|e| HamcError::Worker {
                message: e.to_string(),
            })?
    }

    pub async fn refresh(&self) -> Result<(), HamcError> {
        self.run(Session::refresh).await
    }

    pub async fn apply(&self, key: &str, dry_run: bool) -> Result<ApplyReport, HamcError> {
        let key = key.to_string();
        self.run(move |s| s.apply(&key, dry_run)).await
    }

    /// Apply every resource concurrently. Results come back sorted by key.
    pub async fn apply_all(&self, dry_run: bool) -> Vec<(String, Result<ApplyReport, HamcError>)> {
        let mut workers: FuturesUnordered<ApplyFuture> = FuturesUnordered::new();
        for key in self.session.registry().keys() {
            let pool = self.clone();
            workers.push(Box::pin(async move {
                let result = pool.apply(&key, dry_run).await;
                (key, result)
            }));
        }

        let mut results = Vec::new();
        while let Some(result) = workers.next().await {
            results.push(result);
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Submit a domain command and return once it is accepted. If it
    /// started tracking, the poll loop keeps running on the blocking pool.
    pub async fn domain_command(
        &self,
        domain: &str,
        host: &str,
        command: DomainCommand,
    ) -> Result<Submitted, HamcError> {
        let (domain, host) = (domain.to_string(), host.to_string());
        let outcome = self
            .run(move |s| s.issue_domain_command(&domain, &host, command, false))
            .await?;
        match outcome {
            CommandOutcome::PollRequired {
                submitted,
                tracker,
                action,
            } => {
                let session = Arc::clone(&self.session);
                tokio::task::spawn_blocking(move || {
                    tracker.poll_until_settled(action, session.source.as_ref(), &session.lifecycle)
                });
                Ok(submitted)
            }
            CommandOutcome::Untracked(submitted) | CommandOutcome::Joined(submitted) => {
                Ok(submitted)
            }
        }
    }
}
