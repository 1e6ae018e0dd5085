pub mod close_code;
pub mod gateway;
pub mod intents;
