pub mod round;
pub mod worker;
