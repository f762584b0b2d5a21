pub mod assignments;
pub mod attendance;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod gradebook;
pub mod materials;
pub mod students;
