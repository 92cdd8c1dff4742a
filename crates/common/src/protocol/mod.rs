// Wire formats spoken with the realtime bus.

pub mod envelope;
pub mod nats;
pub mod subjects;
