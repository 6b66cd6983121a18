pub mod concurrency;
pub mod domain;
pub mod external;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod queue_key;
pub mod slots;
