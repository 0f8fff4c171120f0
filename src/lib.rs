//! EDR Core
//!
//! Event ingestion and asset-state core for an EDR cloud backend. Two
//! subsystems share this crate:
//!
//! - the **event pipeline**: broker consume → batch → enrich → normalize →
//!   fan out to the stream and search sinks, with dead-letter routing and
//!   at-least-once offset discipline;
//! - the **asset state**: upsert-on-heartbeat inventory over PostgreSQL
//!   with per-field change auditing, hierarchical groups, and TTL-based
//!   liveness in the KV store reconciled back into the durable rows.
//!
//! Both subsystems are multi-tenant; every durable row carries a
//! `tenant_id` and every query filters by it.
//!
//! ```text
//! agents ──▶ broker ──▶ consume ──▶ collect ──▶ enrich ─▶ normalize ──▶ sinks
//!    │                     │                                  │          └─▶ DLQ
//!    │                     └── commit after enqueue           └── DLQ on unknown kind
//!    └─ heartbeat ──▶ asset service ──▶ { postgres, change log, kv tracker }
//!                                             ▲
//!                         reconciler ─────────┘  (kv absence ⇒ offline)
//! ```

pub mod assets;
pub mod bus;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod router;
pub mod schema;
pub mod state;
pub mod tracker;

pub use config::CoreConfig;
pub use error::{CoreError, Result};
