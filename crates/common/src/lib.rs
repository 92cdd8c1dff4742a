// dentika-common: shared types and wire formats for the Dentika realtime workspace

pub mod protocol;
pub mod types;
