//! Built-in migration-aware data services.

mod counter;
mod map;
mod store;

pub use counter::CounterService;
pub use map::MapService;
