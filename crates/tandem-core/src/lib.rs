//! # Tandem Core
//!
//! Client-side warm-standby session coordinator.
//!
//! A warm-standby group keeps sessions open to several equivalent providers at once and
//! presents them to the application as a single logical channel. One member serves each
//! scope while the others hold mirrors of the same streams, so losing a provider costs
//! a status message and a resubmission instead of a full reconnect.
//!
//! This crate provides:
//!
//! - **[`group`]**: the coordinator itself: member lifecycle, role assignment, routing,
//!   response aggregation and the application event queue.
//!
//! - **[`transport`]**: the `Connector`/`Link` boundary the coordinator writes to, and the
//!   event sender links use to report inbound traffic.
//!
//! - **[`types`]**: message envelopes, identifiers and application events.
//!
//! - **[`config`]**: TOML and environment configuration with validation.
//!
//! - **[`errors`]**: transport and submit error taxonomies.
//!
//! - **[`logging`]**: `tracing` subscriber setup.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WarmStandbyGroup                       │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────┐  │
//! │  │  RequestRouter  │  │  RoleAssignor   │  │ EventFunnel │  │
//! │  └────────┬────────┘  └────────┬────────┘  └──────▲──────┘  │
//! │           │                    │                  │         │
//! │  ┌────────▼────────┐  ┌────────▼────────┐  ┌──────┴──────┐  │
//! │  │ Member (x N)    │  │ ScopeOwnership  │  │ Response-   │  │
//! │  │  handshake      │  │  per session or │  │ Aggregator  │  │
//! │  │  reconnect      │  │  per service    │  │             │  │
//! │  └────────┬────────┘  └─────────────────┘  └──────▲──────┘  │
//! └───────────┼───────────────────────────────────────┼─────────┘
//!             ▼                                       │
//!      Connector / Link  ──────── LinkEventSender ────┘
//! ```
//!
//! ## Failover
//!
//! ```text
//! owner leaves READY
//!       │
//!       ▼
//! ┌────────────────┐
//! │ RoleAssignor   │ ─── no eligible member ──► streams wait, OPEN/SUSPECT
//! └──────┬─────────┘
//!        │ next member in configured order
//!        ▼
//! ┌────────────────┐
//! │ private stream │ ─── yes ──► CLOSED_RECOVER
//! └──────┬─────────┘
//!        │ no
//!        ▼
//! ┌──────────────────┐
//! │ refresh complete │ ─── no ──► CLOSED_RECOVER
//! └──────┬───────────┘
//!        │ yes
//!        ▼
//!   OPEN/SUSPECT, resubmit to new owner, deliver its refresh
//! ```

pub mod config;
pub mod errors;
pub mod group;
pub mod logging;
pub mod transport;
pub mod types;
