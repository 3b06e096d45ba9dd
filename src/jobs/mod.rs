pub mod cleanup;
pub mod reminders;
pub mod traffic_scan;
