mod service;

pub use service::{RunningService, Service};
