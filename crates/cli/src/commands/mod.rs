pub mod config_cmd;
pub mod doctor;
pub mod onboard;
pub mod serve;
pub mod status;
pub mod store_cmd;
