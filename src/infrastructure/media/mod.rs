//! Local capture devices

pub mod device;

pub use device::VirtualAudioDevice;
