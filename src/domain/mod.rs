//! Data shapes shared by the gateway, registry, queue and consumer.

pub mod message;
pub mod registration;
pub mod status;

pub use message::QueueMessage;
pub use registration::{
    hash_hardware_id, NewRegistration, RegistrationPayload, RegistrationRecord, TransitionNote,
};
pub use status::DeviceStatus;
