// Core modules shared by every gateway component.
pub mod error;
