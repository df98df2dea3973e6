//! # MOP
//!
//! Follow-up pipeline for gravitational microlensing events.
//!
//! * [`harvest`] pulls event catalogs and light curves from survey archives
//!   into a [`store::Store`];
//! * [`coordinator::JobQueueCoordinator`] claims stale events one at a time,
//!   safely shared by several workers, and fits them with
//!   [`fit::ModelFitter`] (point-source point-lens with annual parallax);
//! * [`strategy::StrategySelector`] turns the fitted models into priorities
//!   ([`priority`]), checks [`visibility`] from the telescope network and
//!   submits deduplicated observation requests through a
//!   [`scheduler::SchedulerApi`].
//!
//! The `mop` binary exposes these passes as subcommands.
pub mod config;
pub mod constants;
pub mod conversion;
pub mod coordinator;
pub mod env_state;
pub mod ephemeris;
pub mod fit;
pub mod harvest;
pub mod liveness;
pub mod mop_errors;
pub mod photometry;
pub mod priority;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod target;
pub mod time;
pub mod visibility;
