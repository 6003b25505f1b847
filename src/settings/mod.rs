pub mod color;
pub mod delay;
pub mod device_settings;
pub mod filters;
