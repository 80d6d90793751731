//! Critiq Types - Shared domain types
//!
//! This crate contains domain types used across the Critiq billing services:
//! - User identity
//! - Plans, billing intervals and plan tiers
//! - Subscriptions, their status and typed metadata
//! - Payment gateway handles and payment methods

pub mod billing;
pub mod error;
pub mod plan;
pub mod subscription;
pub mod user;

pub use billing::*;
pub use error::*;
pub use plan::*;
pub use subscription::*;
pub use user::*;
