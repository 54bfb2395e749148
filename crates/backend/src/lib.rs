mod domain;
pub use domain::{config, event, identity};

pub mod collab;
pub mod pipeline;
pub mod queue;
pub mod selection;
pub mod watch;
