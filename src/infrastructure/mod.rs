pub mod bluetooth;
pub mod event_bus;
pub mod logging;
