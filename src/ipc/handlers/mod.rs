pub mod attainments;
pub mod attendance;
pub mod copo;
pub mod core;
pub mod course_outcomes;
pub mod feedback;
pub mod internal_marks;
pub mod marks;
pub mod students;
pub mod subjects;
pub mod users;
