//! Per-domain tracking of in-flight lifecycle actions.
//!
//! Each (domain, action) pair owns one set of hosts the action is pending
//! on. The first host added starts the single poll loop for that pair;
//! later hosts just join the set. The loop drops hosts whose live state
//! confirms the action and gives up after a bounded number of ticks.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::domain_state::DomainState;
use crate::error::HamcError;
use crate::intent::{Intent, Submitted};
use crate::locked::Locked;
use crate::session::Session;
use crate::snapshot::ClusterStateSource;

/// Poll ticks before a pending action is given up on.
pub const ACTION_TIMEOUT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackedAction {
    Starting,
    ShuttingDown,
    Suspending,
    Resuming,
}

impl TrackedAction {
    pub const ALL: [TrackedAction; 4] = [
        TrackedAction::Starting,
        TrackedAction::ShuttingDown,
        TrackedAction::Suspending,
        TrackedAction::Resuming,
    ];

    /// Whether `state` is where this action ends up.
    pub fn is_settled(self, state: DomainState) -> bool {
        match self {
            TrackedAction::Starting | TrackedAction::Resuming => state == DomainState::Running,
            TrackedAction::ShuttingDown => state == DomainState::ShutOff,
            TrackedAction::Suspending => state == DomainState::Paused,
        }
    }

    fn index(self) -> usize {
        match self {
            TrackedAction::Starting => 0,
            TrackedAction::ShuttingDown => 1,
            TrackedAction::Suspending => 2,
            TrackedAction::Resuming => 3,
        }
    }
}

impl fmt::Display for TrackedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackedAction::Starting => "starting",
            TrackedAction::ShuttingDown => "shutting down",
            TrackedAction::Suspending => "suspending",
            TrackedAction::Resuming => "resuming",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainCommand {
    Start,
    Shutdown,
    Destroy,
    Suspend,
    Resume,
    Undefine,
}

impl DomainCommand {
    pub fn intent(self, domain: &str) -> Intent {
        let domain = domain.to_string();
        match self {
            DomainCommand::Start => Intent::StartDomain { domain },
            DomainCommand::Shutdown => Intent::ShutdownDomain { domain },
            DomainCommand::Destroy => Intent::DestroyDomain { domain },
            DomainCommand::Suspend => Intent::SuspendDomain { domain },
            DomainCommand::Resume => Intent::ResumeDomain { domain },
            DomainCommand::Undefine => Intent::UndefineDomain { domain },
        }
    }

    /// The set this command is tracked in; `undefine` is fire-and-forget.
    pub fn tracked(self) -> Option<TrackedAction> {
        match self {
            DomainCommand::Start => Some(TrackedAction::Starting),
            DomainCommand::Shutdown | DomainCommand::Destroy => Some(TrackedAction::ShuttingDown),
            DomainCommand::Suspend => Some(TrackedAction::Suspending),
            DomainCommand::Resume => Some(TrackedAction::Resuming),
            DomainCommand::Undefine => None,
        }
    }
}

impl std::str::FromStr for DomainCommand {
    type Err = HamcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "start" => DomainCommand::Start,
            "shutdown" => DomainCommand::Shutdown,
            "destroy" => DomainCommand::Destroy,
            "suspend" => DomainCommand::Suspend,
            "resume" => DomainCommand::Resume,
            "undefine" => DomainCommand::Undefine,
            other => {
                return Err(HamcError::Validation {
                    message: format!("unknown domain command '{other}'"),
                });
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub tick: Duration,
    pub action_timeout_ticks: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            action_timeout_ticks: ACTION_TIMEOUT,
        }
    }
}

const PROGRESS: [char; 4] = ['|', '/', '-', '\\'];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionSet {
    pub hosts: BTreeSet<String>,
    progress: usize,
    ticks: u32,
}

impl TransitionSet {
    pub fn is_pending(&self) -> bool {
        !self.hosts.is_empty()
    }

    pub fn progress_token(&self) -> char {
        PROGRESS[self.progress % PROGRESS.len()]
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Converged {
        domain: String,
        action: TrackedAction,
    },
    TimedOut {
        domain: String,
        action: TrackedAction,
        hosts: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing was pending when the loop started.
    Idle,
    Converged,
    TimedOut(Vec<String>),
}

/// Transition sets of one domain.
#[derive(Debug)]
pub struct DomainTracker {
    domain: String,
    sets: [Locked<TransitionSet>; 4],
    events: broadcast::Sender<LifecycleEvent>,
}

impl DomainTracker {
    pub fn new(domain: &str, events: broadcast::Sender<LifecycleEvent>) -> Self {
        Self {
            domain: domain.to_string(),
            sets: Default::default(),
            events,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn set(&self, action: TrackedAction) -> &Locked<TransitionSet> {
        &self.sets[action.index()]
    }

    /// Add `host` to the action's set. Returns `true` when the set was
    /// empty, meaning the caller must start the poll loop.
    pub fn track(&self, action: TrackedAction, host: &str) -> bool {
        self.set(action).update(|set| {
            let start = set.hosts.is_empty();
            if start {
                set.ticks = 0;
            }
            set.hosts.insert(host.to_string());
            start
        })
    }

    pub fn pending(&self, action: TrackedAction) -> BTreeSet<String> {
        self.set(action).read(|set| set.hosts.clone())
    }

    pub fn is_pending(&self, action: TrackedAction, host: &str) -> bool {
        self.set(action).read(|set| set.hosts.contains(host))
    }

    pub fn progress_token(&self, action: TrackedAction) -> char {
        self.set(action).read(TransitionSet::progress_token)
    }

    /// One poll: fetch live state for every tracked host, then drop the
    /// confirmed ones. Hosts that cannot be reached stay tracked. Returns
    /// whether anything is still pending.
    pub fn tick(&self, action: TrackedAction, source: &dyn ClusterStateSource) -> bool {
        let hosts = self.pending(action);
        let mut confirmed = Vec::new();
        for host in &hosts {
            match source.domain_state(&self.domain, host) {
                Ok(state) if action.is_settled(state) => confirmed.push(host.clone()),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        domain = %self.domain,
                        host,
                        error = %e,
                        "state unknown, still tracking"
                    )
                }
            }
        }
        self.set(action).update(|set| {
            for host in &confirmed {
                set.hosts.remove(host);
            }
            set.progress = (set.progress + 1) % PROGRESS.len();
            set.ticks += 1;
            set.is_pending()
        })
    }

    /// Poll until the set empties or the tick bound is hit. On timeout the
    /// set is cleared and a single `TimedOut` event is sent.
    pub fn poll_until_settled(
        &self,
        action: TrackedAction,
        source: &dyn ClusterStateSource,
        config: &LifecycleConfig,
    ) -> PollOutcome {
        if !self.set(action).read(TransitionSet::is_pending) {
            return PollOutcome::Idle;
        }
        loop {
            std::thread::sleep(config.tick);
            if !self.tick(action, source) {
                tracing::info!(domain = %self.domain, %action, "converged");
                let _ = self.events.send(LifecycleEvent::Converged {
                    domain: self.domain.clone(),
                    action,
                });
                return PollOutcome::Converged;
            }
            let expired = self.set(action).update(|set| {
                if set.ticks >= config.action_timeout_ticks {
                    set.ticks = 0;
                    Some(std::mem::take(&mut set.hosts).into_iter().collect::<Vec<_>>())
                } else {
                    None
                }
            });
            if let Some(hosts) = expired {
                tracing::warn!(
                    domain = %self.domain,
                    %action,
                    hosts = ?hosts,
                    ticks = config.action_timeout_ticks,
                    "timed out waiting for live state, giving up"
                );
                let _ = self.events.send(LifecycleEvent::TimedOut {
                    domain: self.domain.clone(),
                    action,
                    hosts: hosts.clone(),
                });
                return PollOutcome::TimedOut(hosts);
            }
        }
    }
}

/// What issuing a domain command left to do.
#[derive(Debug)]
pub enum CommandOutcome {
    /// Not tracked, or a dry run.
    Untracked(Submitted),
    /// The host joined a set that already has a poll loop.
    Joined(Submitted),
    /// The set was idle; the caller runs the poll loop.
    PollRequired {
        submitted: Submitted,
        tracker: Arc<DomainTracker>,
        action: TrackedAction,
    },
}

impl CommandOutcome {
    pub fn submitted(&self) -> &Submitted {
        match self {
            CommandOutcome::Untracked(s) | CommandOutcome::Joined(s) => s,
            CommandOutcome::PollRequired { submitted, .. } => submitted,
        }
    }
}

impl Session {
    pub fn tracker(&self, domain: &str) -> Arc<DomainTracker> {
        self.trackers.update(|trackers| {
            Arc::clone(
                trackers
                    .entry(domain.to_string())
                    .or_insert_with(|| Arc::new(DomainTracker::new(domain, self.events.clone()))),
            )
        })
    }

    /// Submit a lifecycle command to the host the domain lives on and
    /// register it with the domain's tracker.
    ///
    /// Conflicting actions on one domain are not rejected; each lands in
    /// its own set.
    pub fn issue_domain_command(
        &self,
        domain: &str,
        host: &str,
        command: DomainCommand,
        dry_run: bool,
    ) -> Result<CommandOutcome, HamcError> {
        if !self.hosts.iter().any(|h| h == host) {
            return Err(HamcError::UnknownHost { name: host.to_string() });
        }
        let submitted = self.submit_to(host, command.intent(domain), dry_run)?;
        let action = match command.tracked() {
            Some(action) if !dry_run => action,
            _ => return Ok(CommandOutcome::Untracked(submitted)),
        };
        let tracker = self.tracker(domain);
        if tracker.track(action, host) {
            Ok(CommandOutcome::PollRequired {
                submitted,
                tracker,
                action,
            })
        } else {
            tracing::debug!(domain, host, %action, "joined pending action");
            Ok(CommandOutcome::Joined(submitted))
        }
    }

    /// Issue a command and, if this call started tracking, poll on the
    /// current thread until the action settles or times out.
    pub fn run_domain_command(
        &self,
        domain: &str,
        host: &str,
        command: DomainCommand,
    ) -> Result<PollOutcome, HamcError> {
        match self.issue_domain_command(domain, host, command, false)? {
            CommandOutcome::PollRequired { tracker, action, .. } => {
                Ok(tracker.poll_until_settled(action, self.source.as_ref(), &self.lifecycle))
            }
            CommandOutcome::Untracked(_) | CommandOutcome::Joined(_) => Ok(PollOutcome::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::StaticStateSource;

    fn fast() -> LifecycleConfig {
        LifecycleConfig {
            tick: Duration::from_millis(1),
            action_timeout_ticks: ACTION_TIMEOUT,
        }
    }

    #[test]
    fn first_host_starts_the_loop_later_hosts_join() {
        let (tx, _rx) = broadcast::channel(8);
        let tracker = DomainTracker::new("vm1", tx);
        assert!(tracker.track(TrackedAction::Starting, "h1"));
        assert!(!tracker.track(TrackedAction::Starting, "h2"));
        assert!(tracker.track(TrackedAction::Suspending, "h1"));
        assert_eq!(tracker.pending(TrackedAction::Starting).len(), 2);
    }

    #[test]
    fn converges_when_live_state_confirms() {
        let (tx, mut rx) = broadcast::channel(8);
        let tracker = DomainTracker::new("vm1", tx);
        let source = StaticStateSource::default();
        source.set_domain_state("vm1", "h1", DomainState::Running);
        tracker.track(TrackedAction::Starting, "h1");

        let outcome = tracker.poll_until_settled(TrackedAction::Starting, &source, &fast());
        assert_eq!(outcome, PollOutcome::Converged);
        assert!(!tracker.is_pending(TrackedAction::Starting, "h1"));
        assert!(matches!(rx.try_recv().unwrap(), LifecycleEvent::Converged { .. }));
    }

    #[test]
    fn timeout_clears_and_signals_once() {
        let (tx, mut rx) = broadcast::channel(8);
        let tracker = DomainTracker::new("vm1", tx);
        let source = StaticStateSource::default();
        source.set_domain_state("vm1", "h1", DomainState::ShutOff);
        tracker.track(TrackedAction::Starting, "h1");

        let outcome = tracker.poll_until_settled(TrackedAction::Starting, &source, &fast());
        assert_eq!(outcome, PollOutcome::TimedOut(vec!["h1".to_string()]));
        assert!(tracker.pending(TrackedAction::Starting).is_empty());
        assert!(matches!(rx.try_recv().unwrap(), LifecycleEvent::TimedOut { .. }));

        // a later poll has nothing to report
        let again = tracker.poll_until_settled(TrackedAction::Starting, &source, &fast());
        assert_eq!(again, PollOutcome::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unreachable_host_stays_tracked_until_timeout() {
        let (tx, _rx) = broadcast::channel(8);
        let tracker = DomainTracker::new("vm1", tx);
        let source = StaticStateSource::default();
        source.set_unreachable("h2", true);
        tracker.track(TrackedAction::ShuttingDown, "h2");
        assert!(tracker.tick(TrackedAction::ShuttingDown, &source));
        assert!(tracker.is_pending(TrackedAction::ShuttingDown, "h2"));
    }

    #[test]
    fn progress_token_rotates() {
        let (tx, _rx) = broadcast::channel(8);
        let tracker = DomainTracker::new("vm1", tx);
        let source = StaticStateSource::default();
        tracker.track(TrackedAction::Suspending, "h1");
        let first = tracker.progress_token(TrackedAction::Suspending);
        tracker.tick(TrackedAction::Suspending, &source);
        assert_ne!(tracker.progress_token(TrackedAction::Suspending), first);
    }

    #[test]
    fn destroy_is_tracked_as_shutdown_undefine_is_not() {
        assert_eq!(DomainCommand::Destroy.tracked(), Some(TrackedAction::ShuttingDown));
        assert_eq!(DomainCommand::Undefine.tracked(), None);
        assert_eq!(
            DomainCommand::Suspend.intent("vm1"),
            Intent::SuspendDomain { domain: "vm1".into() }
        );
    }
}
