pub mod analyze;
pub mod enums;
pub mod transcribe;
