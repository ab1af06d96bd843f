//! Integration scenarios.

pub mod bootstrap;
pub mod dispatch;
pub mod shutdown;
