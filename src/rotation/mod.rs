// Credstore — Rotation Module
//
// Batch migration of at-rest data from inactive keys to the active key.

mod rotator;

pub use rotator::{KeyRotator, RotationSummary};
