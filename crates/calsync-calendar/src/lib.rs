mod error;
mod executor;
mod planner;
mod processor;
mod remote;
mod wire;

pub use error::CalendarError;
pub use executor::execute_all;
pub use planner::{plan, PlanResult};
pub use processor::apply_results;
pub use remote::fetch_plugin_owned_events;
pub use wire::{decode as decode_batch_response, encode as encode_batch_request};
