//! # autorun
//!
//! Concurrency and orchestration substrate for an unattended automation
//! runner: an in-process event bus, a manager for background work, and a
//! schedule execution engine that launches recorded automations through an
//! external playback service.
//!
//! There are no global singletons. A composition root builds one of each
//! component, wires them together and tears them down explicitly:
//!
//! ```no_run
//! # async fn demo() -> autorun::error::Result<()> {
//! use std::sync::Arc;
//! use autorun::bus::EventBus;
//! use autorun::config::Config;
//! use autorun::engine::Scheduler;
//! use autorun::playback::DryRunPlayback;
//! use autorun::storage::InMemoryScheduleRepository;
//! use autorun::worker::TaskManager;
//!
//! let config = Config::default();
//! let bus = EventBus::new(config.event_bus.clone())?;
//! let tasks = TaskManager::with_event_bus(config.tasks.clone(), bus.clone());
//! let scheduler = Scheduler::new(
//!     config.scheduler.clone(),
//!     Arc::new(InMemoryScheduleRepository::new()),
//!     Arc::new(DryRunPlayback::default()),
//!     tasks.clone(),
//! )
//! .with_event_bus(bus.clone());
//!
//! scheduler.start()?;
//! // ...
//! scheduler.stop().await;
//! tasks.shutdown(std::time::Duration::from_secs(5));
//! bus.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod playback;
pub mod storage;
pub mod telemetry;
pub mod worker;
