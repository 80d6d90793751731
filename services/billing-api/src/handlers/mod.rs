//! REST API handlers

pub mod health;
pub mod shared;
pub mod subscription;
pub mod webhook;

pub use health::*;
pub use subscription::*;
pub use webhook::*;
