//! Orchestration core for fleets of autonomous code-writing agents.
//!
//! A user objective arrives decomposed into a dependency graph of tasks
//! ([`plan`]). Tasks run concurrently within execution groups; groups run
//! in strict order. Each task runs in its own git worktree and lands its
//! work on a dedicated branch; after each group the [`consolidate`]
//! engine cherry-picks those branches onto a consolidation branch, and at
//! the end review requests are opened (stacked or single).
//!
//! The moving parts:
//!
//! - [`queue`] -- the authoritative task-lifecycle state machine.
//! - [`scheduler`] -- group gating and advancement over the [`session`]
//!   run-state.
//! - [`coordinator`] -- per-instance workload tracking, scaling
//!   recommendations, periodic rebalancing.
//! - [`verify`] -- reconciles a worker's filesystem side effects (commits
//!   or a sentinel report) against the completion contract.
//! - [`consolidate`] -- per-group branch integration and review-request
//!   emission.
//! - [`events`] -- the in-process bus tying them together.
//! - [`orchestrator`] -- the session runner driving all of the above.
//!
//! The external agent process, the review-request host tooling, and the
//! front end are collaborators behind seams ([`agent::AgentRunner`],
//! [`consolidate::ReviewRequester`], [`config::CoreConfig`]).

pub mod agent;
pub mod config;
pub mod consolidate;
pub mod coordinator;
pub mod events;
pub mod orchestrator;
pub mod plan;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod slug;
pub mod verify;
