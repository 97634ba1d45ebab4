pub mod time;

pub use time::{epoch_ms_to_datetime, get_epoch_time_in_ms};
