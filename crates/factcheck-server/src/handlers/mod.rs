pub mod audit_events;
pub mod claims;
pub mod details;
pub mod health;
pub mod observations;
