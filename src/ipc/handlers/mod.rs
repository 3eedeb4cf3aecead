pub mod attendance;
pub mod classes;
pub mod core;
pub mod fees;
pub mod grades;
pub mod library;
pub mod reports;
pub mod roster;
pub mod session;
pub mod subjects;
pub mod timetable;
