//! Core library for Locker.
//!
//! Accounts and sessions, vaults, teams and their permission model,
//! emergency access, billing, relay aliases, activity events, scheduled
//! maintenance and tenant routing. Every record passes through the
//! encryption [`barrier`] before it reaches a `locker-storage` backend;
//! this crate knows nothing about HTTP.

pub mod auth;
pub mod barrier;
pub mod billing;
pub mod crypto;
pub mod emergency;
pub mod error;
pub mod event;
pub mod jobs;
pub mod locker;
pub mod permission;
pub mod relay;
pub mod team;
pub mod tenant;
pub mod user;
pub mod vault;

pub use locker::{Locker, LockerSettings};
pub use tenant::TenantRouter;
