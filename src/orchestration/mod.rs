//! Orchestration layer: admission, supervision, recovery, messaging and
//! deadlock detection, tied together by the [`Scheduler`].

pub mod admission;
pub mod deadlock;
pub mod inbox;
pub mod process;
pub mod recovery;
pub mod resources;
pub mod router;
pub mod scheduler;
pub mod supervisor;

pub use admission::{AdmissionController, TickReport};
pub use deadlock::{analyze, CycleReport, DeadlockDetector, DeadlockReport, Remediation, Severity};
pub use inbox::{DrainReport, Inbox, InboxEntry};
pub use process::{LaunchSpec, LocalLauncher, WorkerLauncher, WorkerProcess};
pub use recovery::{backoff_delay, FailureClass, FailureClassifier, RecoveryDecision, RetryTracker};
pub use resources::{GateLevel, GateReading, HostSample, ProcProbe, ResourceGate, ResourceProbe, StaticProbe};
pub use router::{MessageRouter, SweepOutcome};
pub use scheduler::{Scheduler, SchedulerEvent, StepReport};
pub use supervisor::{complete_worker, kill_worker, PendingRestart, SpawnRequest, SupervisorEvent, WorkerHealth, WorkerSupervisor};
